//! # agent-core
//!
//! Core agent logic with provider-agnostic LLM abstraction and a uniform tool system.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Agent                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │  Reasoning  │  │    Tools    │  │   LlmProvider       │  │
//! │  │    Loop     │──│   Registry  │──│   (Strategy)        │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` trait lets the agent talk to any OpenAI-compatible
//! endpoint (or a scripted provider in tests) without changing agent logic.
//! Tools are discovered at runtime and seen only through `dyn Tool`, so the
//! loop treats every tool the same regardless of where it came from.

pub mod provider;
pub mod tool;
pub mod reasoning;
pub mod message;
pub mod error;

pub use error::{AgentError, Result};
pub use message::{Conversation, Message, Role};
pub use provider::{Completion, GenerationOptions, LlmProvider};
pub use reasoning::{Agent, AgentBuilder, AgentConfig, QueryResult, ToolCallStyle};
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult, ToolSchema};
