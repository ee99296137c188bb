//! MCP client: handshake, discovery and invocation on top of [`Transport`].

use std::sync::Arc;
use std::time::Duration;

use agent_core::Tool;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::error::{McpError, Result};
use super::protocol::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    ListToolsResult, ToolInfo, PROTOCOL_VERSION,
};
use super::tool::McpTool;
use super::transport::{SpawnSpec, Transport};

/// Upper bound on `tools/list` pages, against servers that loop their cursor
const MAX_LIST_PAGES: usize = 64;

/// How to launch the tool provider.
///
/// The connection string is appended as the last argument exactly as given.
#[derive(Clone, Debug, Default)]
pub struct ProviderCommand {
    pub program: String,
    pub args: Vec<String>,
    pub connection_string: Option<String>,
}

impl ProviderCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    /// Check everything needed to launch is present
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(McpError::Config("provider program is not set".into()));
        }
        match self.connection_string.as_deref() {
            Some(conn) if !conn.trim().is_empty() => Ok(()),
            _ => Err(McpError::Config("database connection string is not set".into())),
        }
    }

    /// Full argument list passed to the process
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.args.clone();
        argv.extend(self.connection_string.iter().cloned());
        argv
    }
}

/// Client-side settings for a connection
#[derive(Clone, Debug)]
pub struct McpClientConfig {
    /// Name announced in `clientInfo`
    pub client_name: String,

    /// Version announced in `clientInfo`
    pub client_version: String,

    /// Timeout for each individual request
    pub request_timeout: Duration,

    /// Tool calls allowed in flight at once; extra callers queue
    pub max_in_flight: usize,
}

impl Default for McpClientConfig {
    fn default() -> Self {
        Self {
            client_name: "postgres-client".into(),
            client_version: "1.0.0".into(),
            request_timeout: Duration::from_secs(60),
            max_in_flight: 1,
        }
    }
}

/// A live, initialized connection to one MCP server
pub struct McpClient {
    transport: Transport,
    server_info: Implementation,
    instructions: Option<String>,
    config: McpClientConfig,
    call_permits: Semaphore,
}

impl McpClient {
    /// Launch the provider process and complete the handshake.
    ///
    /// Configuration is checked before anything is spawned.
    pub async fn spawn(command: &ProviderCommand, config: McpClientConfig) -> Result<Self> {
        command.validate()?;

        let argv = command.argv();
        let transport = Transport::spawn(&SpawnSpec { program: &command.program, args: &argv })?;

        Self::handshake(transport, config).await
    }

    /// Handshake over an existing byte stream pair
    pub async fn connect<R, W>(reader: R, writer: W, config: McpClientConfig) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::handshake(Transport::from_io(reader, writer), config).await
    }

    async fn handshake(transport: Transport, config: McpClientConfig) -> Result<Self> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: serde_json::json!({}),
            client_info: Implementation {
                name: config.client_name.clone(),
                version: config.client_version.clone(),
            },
        };

        let outcome = async {
            let result = transport
                .request("initialize", Some(serde_json::to_value(&params)?), config.request_timeout)
                .await?;
            let init: InitializeResult = serde_json::from_value(result)
                .map_err(|e| McpError::Protocol(format!("invalid initialize result: {}", e)))?;
            transport.notify("notifications/initialized").await?;
            Ok::<_, McpError>(init)
        }
        .await;

        let init = match outcome {
            Ok(init) => init,
            Err(e) => {
                transport.close().await;
                return Err(McpError::Handshake(e.to_string()));
            }
        };

        info!(
            server = %init.server_info,
            protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
            "Connected to MCP server"
        );

        Ok(Self {
            transport,
            server_info: init.server_info,
            instructions: init.instructions,
            call_permits: Semaphore::new(config.max_in_flight.max(1)),
            config,
        })
    }

    /// Identity reported by the server during the handshake
    pub fn server_info(&self) -> &Implementation {
        &self.server_info
    }

    /// Usage instructions the server sent during the handshake, if any
    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    /// All tools the server advertises, following pagination
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({"cursor": c}));
            let result = self
                .transport
                .request("tools/list", params, self.config.request_timeout)
                .await
                .map_err(|e| McpError::Discovery(e.to_string()))?;

            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| McpError::Discovery(format!("invalid tools/list result: {}", e)))?;

            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        warn!("tools/list pagination did not terminate after {} pages", MAX_LIST_PAGES);
        Ok(tools)
    }

    /// Discover tools and bind each one to this connection.
    ///
    /// With `only`, tools whose names are not listed are skipped.
    pub async fn discover(self: &Arc<Self>, only: Option<&[String]>) -> Result<Vec<Arc<dyn Tool>>> {
        let advertised = self.list_tools().await?;
        debug!(count = advertised.len(), "Tool provider advertised tools");

        let tools: Vec<Arc<dyn Tool>> = advertised
            .into_iter()
            .filter(|t| only.is_none_or(|names| names.iter().any(|n| n == &t.name)))
            .map(|info| Arc::new(McpTool::new(Arc::clone(self), info)) as Arc<dyn Tool>)
            .collect();

        if tools.is_empty() {
            return Err(McpError::Discovery("tool provider offered no usable tools".into()));
        }

        Ok(tools)
    }

    /// Invoke a tool by name.
    ///
    /// A result with `is_error` set is still `Ok`: the tool ran and reported
    /// a failure. `Err` means the call never completed.
    pub async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<CallToolResult> {
        if self.is_closed() {
            return Err(McpError::Closed);
        }

        let _permit = self.call_permits.acquire().await.map_err(|_| McpError::Closed)?;

        let params = serde_json::to_value(CallToolParams { name: name.to_string(), arguments })?;
        let result = self
            .transport
            .request("tools/call", Some(params), self.config.request_timeout)
            .await?;

        serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("invalid tools/call result: {}", e)))
    }

    /// Whether the connection has been closed or the server went away
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Terminate the provider process; idempotent
    pub async fn close(&self) {
        if !self.is_closed() {
            info!(server = %self.server_info, "Closing MCP connection");
        }
        self.call_permits.close();
        self.transport.close().await;
    }
}
