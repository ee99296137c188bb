//! # agent-runtime
//!
//! Runtime providers and integrations for the sql-assistant system.
//!
//! ## Providers
//!
//! - **OpenAI-compatible** (default): chat completions with native function calling
//!   against any endpoint that speaks the OpenAI API
//! - **MCP** (default): tools served by a Model Context Protocol server running as
//!   a child process and spoken to over stdio
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::{mcp::{McpClient, McpClientConfig, ProviderCommand}, OpenAiProvider};
//!
//! let client = Arc::new(McpClient::spawn(command, McpClientConfig::default()).await?);
//! let tools = client.discover(Some(&["query".into()])).await?;
//! let agent = AgentBuilder::new()
//!     .provider(Arc::new(OpenAiProvider::from_config(config)?))
//!     .tools(Arc::new(tools.into_iter().collect()))
//!     .build()?;
//! ```

#[cfg(feature = "openai")]
pub mod openai;

#[cfg(feature = "mcp")]
pub mod mcp;

#[cfg(feature = "openai")]
pub use openai::{OpenAiConfig, OpenAiProvider};

#[cfg(feature = "mcp")]
pub use mcp::{McpClient, McpClientConfig, McpError, McpTool, ProviderCommand};

// Re-export core types for convenience
pub use agent_core::{
    Agent, AgentBuilder, AgentError, Conversation, LlmProvider, Message, Result, Role, Tool,
    ToolRegistry,
};
