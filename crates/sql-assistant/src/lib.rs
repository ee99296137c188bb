//! # sql-assistant
//!
//! Answers natural-language questions about a PostgreSQL database by letting
//! an LLM agent run SQL through an MCP tool server.
//!
//! ## Flow
//!
//! ```text
//!   question ──▶ QueryService ──▶ SessionManager::ensure()
//!                    │                   │ (first use only)
//!                    │                   ▼
//!                    │            spawn provider ─▶ discover tools ─▶ build agent
//!                    ▼
//!              Agent::run  ⇄  model  ⇄  query(sql)  ⇄  provider child
//!                    │
//!                    ▼
//!              final answer + message trace
//! ```
//!
//! The provider process is started once and reused for every question until
//! [`SessionManager::shutdown`] is called.

pub mod config;
pub mod error;
pub mod prompt;
pub mod query;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{redact_connection_string, AppConfig};
pub use error::{ConfigError, InitError, QueryError};
pub use prompt::SystemPrompt;
pub use query::{QueryOutcome, QueryService};
pub use session::{
    LiveSession, McpSessionFactory, SessionFactory, SessionManager, SessionStatus, ToolConnection,
};
