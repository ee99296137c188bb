//! Adapter exposing an MCP server tool through the [`Tool`] trait.

use std::sync::Arc;

use agent_core::{AgentError, Result, Tool, ToolCall, ToolResult, ToolSchema};
use async_trait::async_trait;
use tracing::debug;

use super::client::McpClient;
use super::protocol::ToolInfo;

/// One remote tool bound to the connection that advertised it
pub struct McpTool {
    client: Arc<McpClient>,
    info: ToolInfo,
}

impl McpTool {
    pub fn new(client: Arc<McpClient>, info: ToolInfo) -> Self {
        Self { client, info }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(&self.info.name, self.info.description.clone().unwrap_or_default())
            .with_input_schema(self.info.input_schema.clone())
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        debug!(tool = %self.info.name, "Invoking MCP tool");

        let result = self
            .client
            .call_tool(&self.info.name, call.arguments_object())
            .await
            .map_err(|e| AgentError::ToolExecution(format!("{}: {}", self.info.name, e)))?;

        let output = result.text();
        let mut tool_result = if result.is_error {
            ToolResult::failure(&self.info.name, output)
        } else {
            ToolResult::success(&self.info.name, output)
        };

        if let Some(data) = result.structured_content {
            tool_result = tool_result.with_data(data);
        }

        Ok(tool_result)
    }
}
