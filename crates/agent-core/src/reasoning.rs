//! Reasoning Loop
//!
//! Implements the ReAct (Reason + Act) pattern for agent behavior.
//! The agent asks the model for the next step, runs any requested tools,
//! feeds their output back, and stops once the model answers without
//! asking for a tool.
//!
//! The loop is stateless between runs: every call to [`Agent::run`] works on
//! its own [`Conversation`], so one `Agent` can serve concurrent queries.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::message::{Conversation, Message, Role};
use crate::provider::{GenerationOptions, LlmProvider};
use crate::tool::{ToolCall, ToolRegistry, ToolResult, ToolSchema};

/// How the model asks for tools
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStyle {
    /// Function calling through the provider's `tools` API
    #[default]
    Native,
    /// ```` ```tool ```` JSON blocks in plain text, for models without function calling
    Fenced,
}

impl std::str::FromStr for ToolCallStyle {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "fenced" => Ok(Self::Fenced),
            other => Err(format!("unknown tool call style '{}', expected 'native' or 'fenced'", other)),
        }
    }
}

/// Agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// System prompt used when the conversation does not bring its own
    pub system_prompt: String,

    /// Maximum model round-trips before giving up
    pub max_iterations: usize,

    /// Wall-clock budget for a whole run
    pub max_duration: Option<Duration>,

    /// Budget for a single model call
    pub model_timeout: Duration,

    /// Budget for a single tool call
    pub tool_timeout: Duration,

    /// Generation options
    pub generation: GenerationOptions,

    /// How tool calls are exchanged with the model
    pub tool_call_style: ToolCallStyle,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_iterations: 10,
            max_duration: None,
            model_timeout: Duration::from_secs(120),
            tool_timeout: Duration::from_secs(60),
            generation: GenerationOptions::default(),
            tool_call_style: ToolCallStyle::Native,
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a helpful AI assistant.

Use the available tools when they help answer the question.
After receiving tool results, synthesize them into a helpful response.
If you can answer directly without tools, do so.
Be concise and accurate."#;

/// Outcome of one reasoning run
#[derive(Clone, Debug, Serialize)]
pub struct QueryResult {
    /// Content of the final assistant message
    pub answer: String,

    /// Full trace: the input conversation plus every turn the loop added
    pub messages: Vec<Message>,

    /// Number of model calls made
    pub iterations: usize,
}

/// The main Agent struct
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    config: AgentConfig,
}

impl Agent {
    /// Create a new agent
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            config,
        }
    }

    /// Tool descriptions appended to the system prompt in fenced mode
    fn tool_prompt_section(&self) -> Option<String> {
        (self.config.tool_call_style == ToolCallStyle::Fenced && !self.tools.is_empty())
            .then(|| self.tools.generate_prompt_section())
    }

    /// Make sure the conversation opens with a system turn that carries
    /// whatever the configured tool style needs
    fn prepare(&self, conversation: &mut Conversation) {
        let messages = conversation.messages_mut();

        if messages.first().map(|m| m.role) != Some(Role::System) {
            messages.insert(0, Message::system(self.config.system_prompt.clone()));
        }

        if let (Some(section), Some(system)) = (self.tool_prompt_section(), messages.first_mut()) {
            system.content.push_str("\n\n");
            system.content.push_str(&section);
        }
    }

    /// Drive the conversation to a final answer.
    ///
    /// Model failures abort the run; tool failures are handed back to the
    /// model as tool turns so it can correct itself or explain.
    pub async fn run(&self, conversation: Conversation) -> Result<QueryResult> {
        match self.config.max_duration {
            Some(budget) => tokio::time::timeout(budget, self.drive(conversation))
                .await
                .map_err(|_| AgentError::Timeout(format!("query exceeded {:?}", budget)))?,
            None => self.drive(conversation).await,
        }
    }

    async fn drive(&self, mut conversation: Conversation) -> Result<QueryResult> {
        self.prepare(&mut conversation);

        let schemas: Vec<ToolSchema> = match self.config.tool_call_style {
            ToolCallStyle::Native => self.tools.schemas(),
            ToolCallStyle::Fenced => Vec::new(),
        };

        let mut iterations = 0;

        loop {
            iterations += 1;

            if iterations > self.config.max_iterations {
                tracing::warn!(max = self.config.max_iterations, "Reasoning loop exhausted its iteration budget");
                return Err(AgentError::MaxIterations(self.config.max_iterations));
            }

            let completion = tokio::time::timeout(
                self.config.model_timeout,
                self.provider.complete(conversation.messages(), &schemas, &self.config.generation),
            )
            .await
            .map_err(|_| AgentError::Timeout(format!("model call exceeded {:?}", self.config.model_timeout)))??;

            let calls = match self.config.tool_call_style {
                ToolCallStyle::Native => completion.tool_calls,
                ToolCallStyle::Fenced => self.parse_tool_call(&completion.content).into_iter().collect(),
            };

            if calls.is_empty() {
                // No tool call - this is the final response
                conversation.push(Message::assistant(&completion.content).with_model(&completion.model));
                tracing::debug!(iterations, "Reasoning loop finished");

                return Ok(QueryResult {
                    answer: completion.content,
                    messages: conversation.into_messages(),
                    iterations,
                });
            }

            let calls: Vec<ToolCall> = calls
                .into_iter()
                .map(|mut call| {
                    if call.id.is_none() {
                        call.id = Some(uuid::Uuid::new_v4().to_string());
                    }
                    call
                })
                .collect();

            match self.config.tool_call_style {
                ToolCallStyle::Native => conversation.push(
                    Message::assistant_with_calls(&completion.content, calls.clone())
                        .with_model(&completion.model),
                ),
                ToolCallStyle::Fenced => conversation.push(
                    Message::assistant(&completion.content).with_model(&completion.model),
                ),
            }

            let results = join_all(calls.iter().map(|call| self.execute_tool(call))).await;

            for result in results {
                let tool_message = self.format_tool_result(&result);
                let call_id = match self.config.tool_call_style {
                    ToolCallStyle::Native => result.id.clone(),
                    ToolCallStyle::Fenced => None,
                };
                conversation.push(Message::tool(tool_message, call_id).with_name(&result.name));
            }
        }
    }

    /// Parse a tool call from LLM response
    fn parse_tool_call(&self, content: &str) -> Option<ToolCall> {
        // Look for ```tool ... ``` blocks
        let tool_start = "```tool";
        let tool_end = "```";

        if let Some(start_idx) = content.find(tool_start) {
            let after_marker = &content[start_idx + tool_start.len()..];
            if let Some(end_idx) = after_marker.find(tool_end) {
                let json_str = after_marker[..end_idx].trim();

                if let Ok(call) = serde_json::from_str::<ToolCall>(json_str) {
                    return Some(call);
                }
            }
        }

        // Fallback: try to find raw JSON with "tool" key
        self.parse_inline_tool_call(content)
    }

    /// Try to parse inline JSON tool call
    fn parse_inline_tool_call(&self, content: &str) -> Option<ToolCall> {
        if !content.contains(r#""tool""#) {
            return None;
        }

        let start = content.find('{')?;
        let end = content.rfind('}')?;

        if end <= start {
            return None;
        }

        serde_json::from_str::<ToolCall>(&content[start..=end]).ok()
    }

    /// Execute a tool call; every failure becomes a failed `ToolResult`
    async fn execute_tool(&self, call: &ToolCall) -> ToolResult {
        tracing::debug!(tool = %call.name, id = ?call.id, "Executing tool");

        let outcome = tokio::time::timeout(self.config.tool_timeout, self.tools.execute(call)).await;

        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(tool = %call.name, error = %e, "Tool call failed");
                ToolResult::failure(&call.name, format!("Error: {}", e))
            }
            Err(_) => {
                tracing::warn!(tool = %call.name, "Tool call timed out");
                ToolResult::failure(
                    &call.name,
                    format!("Error: tool call exceeded {:?}", self.config.tool_timeout),
                )
            }
        };

        result.id = call.id.clone();
        result
    }

    /// Format tool result for conversation
    fn format_tool_result(&self, result: &ToolResult) -> String {
        if result.success {
            format!("[Tool '{}' returned]\n{}", result.name, result.output)
        } else {
            format!("[Tool '{}' failed]\n{}", result.name, result.output)
        }
    }

    /// Get the tool registry
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Get configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

/// Builder for Agent configuration
pub struct AgentBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    tools: Arc<ToolRegistry>,
    config: AgentConfig,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            tools: Arc::new(ToolRegistry::new()),
            config: AgentConfig::default(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.generation.model = model.into();
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.config.generation.temperature = temp;
        self
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    pub fn max_duration(mut self, budget: Duration) -> Self {
        self.config.max_duration = Some(budget);
        self
    }

    pub fn model_timeout(mut self, timeout: Duration) -> Self {
        self.config.model_timeout = timeout;
        self
    }

    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.config.tool_timeout = timeout;
        self
    }

    pub fn tool_call_style(mut self, style: ToolCallStyle) -> Self {
        self.config.tool_call_style = style;
        self
    }

    pub fn build(self) -> Result<Agent> {
        let provider = self.provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;

        if self.config.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }

        Ok(Agent::new(provider, self.tools, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::provider::{Completion, ModelInfo, ProviderInfo};
    use crate::tool::Tool;

    /// Replays canned completions and records what the model was shown
    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<Completion>>>,
        seen: Mutex<Vec<Vec<Message>>>,
        delay: Option<Duration>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<Completion>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                seen: Mutex::new(Vec::new()),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo { name: "scripted".into(), endpoint: "memory".into(), supports_tools: true }
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        async fn complete(
            &self,
            messages: &[Message],
            _tools: &[ToolSchema],
            _options: &GenerationOptions,
        ) -> Result<Completion> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.seen.lock().unwrap().push(messages.to_vec());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Completion::text("out of script", "scripted")))
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>> {
            Ok(Vec::new())
        }
    }

    struct SqlTool;

    #[async_trait]
    impl Tool for SqlTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema::new("query", "Run a read-only SQL query").with_input_schema(serde_json::json!({
                "type": "object",
                "properties": {"sql": {"type": "string"}},
                "required": ["sql"]
            }))
        }

        async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
            let sql = call.arguments.get("sql").and_then(|v| v.as_str()).unwrap_or_default();
            if sql.starts_with("SELECT") {
                Ok(ToolResult::success("query", r#"[{"table_name":"users"}]"#))
            } else {
                Err(AgentError::ToolExecution(format!("syntax error at or near \"{}\"", sql)))
            }
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut tools = ToolRegistry::new();
        tools.register(SqlTool);
        Arc::new(tools)
    }

    fn agent(provider: Arc<ScriptedProvider>) -> Agent {
        AgentBuilder::new().provider(provider).tools(registry()).build().unwrap()
    }

    fn question(text: &str) -> Conversation {
        let mut conv = Conversation::with_system_prompt("Use PostgreSQL.");
        conv.push(Message::user(text));
        conv
    }

    #[tokio::test]
    async fn test_direct_answer() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(Completion::text("Hello!", "m"))]));
        let result = agent(provider).run(question("hi")).await.unwrap();

        assert_eq!(result.answer, "Hello!");
        assert_eq!(result.iterations, 1);
        assert_eq!(result.messages.len(), 3);
    }

    #[tokio::test]
    async fn test_native_tool_round_trip() {
        let call = ToolCall::new("query").with_arg("sql", "SELECT table_name FROM information_schema.tables").with_id("call_1");
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(Completion::text("", "m").with_tool_calls(vec![call])),
            Ok(Completion::text("The database has one table: users.", "m")),
        ]));
        let result = agent(provider.clone()).run(question("List the tables")).await.unwrap();

        assert_eq!(result.answer, "The database has one table: users.");
        assert_eq!(result.iterations, 2);

        let roles: Vec<Role> = result.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(result.messages[2].tool_calls.len(), 1);
        assert_eq!(result.messages[3].tool_call_id(), Some("call_1"));
        assert!(result.messages[3].content.contains("users"));

        // second model call saw the tool output
        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[1].len(), 4);
    }

    #[tokio::test]
    async fn test_tool_error_is_fed_back_to_model() {
        let call = ToolCall::new("query").with_arg("sql", "SHOW TABLES");
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(Completion::text("", "m").with_tool_calls(vec![call])),
            Ok(Completion::text("The query failed with a syntax error.", "m")),
        ]));
        let result = agent(provider).run(question("List the tables")).await.unwrap();

        let tool_turn = &result.messages[3];
        assert_eq!(tool_turn.role, Role::Tool);
        assert!(tool_turn.content.starts_with("[Tool 'query' failed]"));
        assert!(tool_turn.tool_call_id().is_some());
        assert_eq!(result.answer, "The query failed with a syntax error.");
    }

    #[tokio::test]
    async fn test_unknown_tool_does_not_abort() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(Completion::text("", "m").with_tool_calls(vec![ToolCall::new("drop_everything")])),
            Ok(Completion::text("I cannot do that.", "m")),
        ]));
        let result = agent(provider).run(question("drop it")).await.unwrap();
        assert!(result.messages[3].content.contains("Tool not found"));
    }

    #[tokio::test]
    async fn test_model_error_aborts() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(AgentError::Auth("invalid key".into()))]));
        let err = agent(provider).run(question("hi")).await.unwrap_err();
        assert!(matches!(err, AgentError::Auth(_)));
    }

    #[tokio::test]
    async fn test_iteration_budget() {
        let looping = || Ok(Completion::text("", "m").with_tool_calls(vec![ToolCall::new("query").with_arg("sql", "SELECT 1")]));
        let provider = Arc::new(ScriptedProvider::new((0..5).map(|_| looping()).collect()));
        let agent = AgentBuilder::new().provider(provider).tools(registry()).max_iterations(3).build().unwrap();

        let err = agent.run(question("loop forever")).await.unwrap_err();
        assert!(matches!(err, AgentError::MaxIterations(3)));
    }

    #[tokio::test]
    async fn test_model_timeout() {
        let mut scripted = ScriptedProvider::new(vec![Ok(Completion::text("late", "m"))]);
        scripted.delay = Some(Duration::from_secs(5));
        let agent = AgentBuilder::new()
            .provider(Arc::new(scripted))
            .tools(registry())
            .model_timeout(Duration::from_millis(20))
            .build()
            .unwrap();

        let err = agent.run(question("hi")).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_fenced_style() {
        let content = r#"Let me check that for you.
```tool
{"tool": "query", "arguments": {"sql": "SELECT table_name FROM information_schema.tables"}}
```"#;
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(Completion::text(content, "m")),
            Ok(Completion::text("Tables: users", "m")),
        ]));
        let agent = AgentBuilder::new()
            .provider(provider.clone())
            .tools(registry())
            .tool_call_style(ToolCallStyle::Fenced)
            .build()
            .unwrap();

        let result = agent.run(question("List the tables")).await.unwrap();
        assert_eq!(result.answer, "Tables: users");
        assert!(result.messages[0].content.contains("## Available Tools"));
        assert!(result.messages[3].tool_call_id().is_none());

        let seen = provider.seen.lock().unwrap();
        assert!(seen[0][0].content.contains("### query"));
    }

    #[tokio::test]
    async fn test_missing_system_prompt_is_inserted() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(Completion::text("ok", "m"))]));
        let mut conv = Conversation::new();
        conv.push(Message::user("hi"));

        let result = agent(provider).run(conv).await.unwrap();
        assert_eq!(result.messages[0].role, Role::System);
    }

    #[test]
    fn test_builder_requires_provider() {
        assert!(matches!(AgentBuilder::new().build(), Err(AgentError::Config(_))));
    }
}
