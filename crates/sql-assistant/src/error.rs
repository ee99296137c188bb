//! Error Types for the SQL assistant

use agent_core::AgentError;
use agent_runtime::McpError;
use thiserror::Error;

/// Problems with the process environment
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Why a session could not be brought up.
///
/// Cloneable so every caller waiting on the same attempt receives it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to connect to tool provider: {0}")]
    Connection(String),

    #[error("Tool discovery failed: {0}")]
    Discovery(String),

    #[error("Failed to build agent: {0}")]
    Agent(String),
}

impl InitError {
    /// Whether another `ensure()` might succeed without operator action
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, InitError::Configuration(_))
    }

    pub fn user_message(&self) -> String {
        match self {
            InitError::Configuration(msg) => format!("The assistant is not configured correctly: {}", msg),
            InitError::Connection(_) => "Could not reach the database tool server. Please try again.".into(),
            InitError::Discovery(_) => "The database tool server did not offer a usable query tool.".into(),
            InitError::Agent(msg) => format!("The assistant could not be started: {}", msg),
        }
    }
}

impl From<ConfigError> for InitError {
    fn from(err: ConfigError) -> Self {
        InitError::Configuration(err.to_string())
    }
}

impl From<McpError> for InitError {
    fn from(err: McpError) -> Self {
        match err {
            McpError::Config(msg) => InitError::Configuration(msg),
            McpError::Discovery(msg) => InitError::Discovery(msg),
            other => InitError::Connection(other.to_string()),
        }
    }
}

/// Why a question could not be answered
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Query is required")]
    EmptyQuestion,

    #[error(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("The model produced an empty answer")]
    EmptyAnswer,
}

impl QueryError {
    pub fn user_message(&self) -> String {
        match self {
            QueryError::EmptyQuestion => "Query is required".into(),
            QueryError::Init(e) => e.user_message(),
            QueryError::Agent(e) => e.user_message(),
            QueryError::EmptyAnswer => "The assistant did not produce an answer. Please rephrase the question.".into(),
        }
    }
}
