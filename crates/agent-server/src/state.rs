//! Application State

use std::sync::Arc;

use sql_assistant::{QueryService, SessionManager};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Owner of the provider connection; used for health and shutdown
    pub sessions: Arc<SessionManager>,

    /// Answers questions through the shared session
    pub queries: Arc<QueryService>,
}

impl AppState {
    pub fn new(sessions: Arc<SessionManager>, queries: Arc<QueryService>) -> Self {
        Self { sessions, queries }
    }
}
