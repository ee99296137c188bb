//! In-process stand-ins for the model and the MCP provider

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_core::provider::{ModelInfo, ProviderInfo};
use agent_core::{
    AgentConfig, AgentError, Completion, GenerationOptions, LlmProvider, Message, Role, ToolCall, ToolSchema,
};
use agent_runtime::{McpClient, McpClientConfig};
use async_trait::async_trait;
use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use crate::error::InitError;
use crate::prompt::SystemPrompt;
use crate::session::{assemble, LiveSession, SessionFactory};

pub(crate) const SCRIPTED_MODEL: &str = "scripted-model";

pub(crate) const LIST_TABLES_SQL: &str =
    "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public';";

/// Model that decides from the last turn alone, so concurrent runs never
/// interfere with each other. Questions mentioning an "expired key" fail
/// the way a rejected API key does.
pub(crate) struct ScriptedModel {
    silent: bool,
}

impl ScriptedModel {
    pub(crate) fn new() -> Self {
        Self { silent: false }
    }

    /// Always answers with empty content
    pub(crate) fn silent() -> Self {
        Self { silent: true }
    }
}

#[async_trait]
impl LlmProvider for ScriptedModel {
    fn info(&self) -> ProviderInfo {
        ProviderInfo { name: "scripted".into(), endpoint: "memory".into(), supports_tools: true }
    }

    async fn health_check(&self) -> agent_core::Result<bool> {
        Ok(true)
    }

    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolSchema],
        _options: &GenerationOptions,
    ) -> agent_core::Result<Completion> {
        if self.silent {
            return Ok(Completion::text("", "scripted"));
        }

        let Some(last) = messages.last() else {
            return Ok(Completion::text("", "scripted"));
        };

        if last.role == Role::User && last.content.contains("expired key") {
            return Err(AgentError::Auth("401 invalid api key".into()));
        }

        let completion = match last.role {
            Role::Tool => {
                let body = last.content.split_once('\n').map_or("", |(_, rest)| rest);
                if last.content.starts_with("[Tool 'query' failed]") {
                    Completion::text(format!("The query failed: {}", body), "scripted")
                } else {
                    Completion::text(format!("The database has these tables: {}", body), "scripted")
                }
            }
            _ if last.content.to_lowercase().contains("tables") => Completion::text("", "scripted")
                .with_tool_calls(vec![ToolCall::new("query").with_arg("sql", LIST_TABLES_SQL).with_id("call_tables")]),
            _ if last.content.contains("broken") => Completion::text("", "scripted")
                .with_tool_calls(vec![ToolCall::new("query").with_arg("sql", "SHOW TABLES").with_id("call_broken")]),
            _ => Completion::text(format!("You asked: {}", last.content), "scripted"),
        };
        Ok(completion)
    }

    async fn list_models(&self) -> agent_core::Result<Vec<ModelInfo>> {
        Ok(vec![ModelInfo { id: SCRIPTED_MODEL.into(), owned_by: None }])
    }
}

/// MCP server over a duplex stream exposing `query` and `explain`
pub(crate) fn spawn_fixture_server(stream: DuplexStream) {
    tokio::spawn(async move {
        let (read, mut write) = split(stream);
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let msg: serde_json::Value = serde_json::from_str(&line).unwrap();
            let Some(id) = msg.get("id").cloned() else { continue };
            let result = match msg["method"].as_str().unwrap_or_default() {
                "initialize" => serde_json::json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fixture-postgres", "version": "0.1.0"}
                }),
                "tools/list" => serde_json::json!({"tools": [
                    {
                        "name": "query",
                        "description": "Run a read-only SQL query",
                        "inputSchema": {"type": "object", "properties": {"sql": {"type": "string"}}, "required": ["sql"]}
                    },
                    {"name": "explain", "inputSchema": {"type": "object"}}
                ]}),
                "tools/call" => {
                    let sql = msg["params"]["arguments"]["sql"].as_str().unwrap_or_default();
                    if sql.starts_with("SELECT") {
                        serde_json::json!({"content": [{"type": "text", "text": "customers, orders"}], "isError": false})
                    } else {
                        serde_json::json!({
                            "content": [{"type": "text", "text": format!("syntax error at or near \"{}\"", sql)}],
                            "isError": true
                        })
                    }
                }
                _ => serde_json::json!({}),
            };
            let mut out = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string();
            out.push('\n');
            if write.write_all(out.as_bytes()).await.is_err() {
                break;
            }
        }
    });
}

/// Session factory backed by the fixture server and [`ScriptedModel`]
pub(crate) struct FixtureFactory {
    opens: AtomicUsize,
    fail_first: usize,
    open_delay: Option<Duration>,
    model: Arc<ScriptedModel>,
    clients: Mutex<Vec<Arc<McpClient>>>,
}

impl FixtureFactory {
    pub(crate) fn new() -> Self {
        Self {
            opens: AtomicUsize::new(0),
            fail_first: 0,
            open_delay: None,
            model: Arc::new(ScriptedModel::new()),
            clients: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// The first `n` opens fail with a connection error
    pub(crate) fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub(crate) fn with_model(mut self, model: ScriptedModel) -> Self {
        self.model = Arc::new(model);
        self
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Client of the `index`-th successful open
    pub(crate) fn client(&self, index: usize) -> Option<Arc<McpClient>> {
        self.clients.lock().unwrap().get(index).cloned()
    }

    pub(crate) fn last_client(&self) -> Option<Arc<McpClient>> {
        self.clients.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl SessionFactory for FixtureFactory {
    async fn open(&self) -> Result<LiveSession, InitError> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }

        if attempt <= self.fail_first {
            return Err(InitError::Connection("fixture provider refused to start".into()));
        }

        let (client_io, server_io) = duplex(64 * 1024);
        spawn_fixture_server(server_io);
        let (read, write) = split(client_io);
        let client = Arc::new(McpClient::connect(read, write, McpClientConfig::default()).await?);
        self.clients.lock().unwrap().push(Arc::clone(&client));

        let config = AgentConfig {
            system_prompt: SystemPrompt::default().render(),
            ..Default::default()
        };
        let filter = ["query".to_string()];
        assemble(client, self.model.clone(), config, Some(&filter[..])).await
    }
}
