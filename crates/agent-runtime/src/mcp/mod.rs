//! Model Context Protocol client.
//!
//! A tool provider runs as a child process; we talk JSON-RPC 2.0 to it over
//! its stdin/stdout, one JSON message per line.
//!
//! ```text
//! ┌──────────────┐  initialize / tools/list / tools/call   ┌──────────────────┐
//! │  McpClient   │ ──────────── stdin ───────────────────▶ │  provider child  │
//! │  (Transport) │ ◀─────────── stdout ─────────────────── │  (e.g. postgres) │
//! └──────────────┘                                         └──────────────────┘
//! ```
//!
//! The protocol flow is:
//! 1. Client sends `initialize` naming itself
//! 2. Server responds with its identity and capabilities
//! 3. Client sends `notifications/initialized`
//! 4. Client calls `tools/list` once, then `tools/call` per invocation

pub mod client;
pub mod error;
pub mod protocol;
pub mod tool;
pub mod transport;

pub use client::{McpClient, McpClientConfig, ProviderCommand};
pub use error::{McpError, Result};
pub use tool::McpTool;
