//! HTTP Handlers

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use agent_core::Message;
use sql_assistant::{QueryError, SessionStatus};

use crate::state::AppState;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub version: &'static str,
    pub session: SessionStatus,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub query: String,
    /// Full message trace of the reasoning run
    pub response: Vec<Message>,
    pub answer: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

// ============================================================================
// Routes
// ============================================================================

/// `/api/*` routes bound to the given state
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/query", post(query_handler))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        message: "Server is running",
        version: env!("CARGO_PKG_VERSION"),
        session: state.sessions.status(),
    })
}

/// Answer a natural-language question about the database
pub async fn query_handler(
    State(state): State<AppState>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let question = payload.query.unwrap_or_default();

    match state.queries.answer(&question).await {
        Ok(outcome) => Ok(Json(QueryResponse {
            query: outcome.question,
            response: outcome.messages,
            answer: outcome.answer,
        })),
        Err(QueryError::EmptyQuestion) => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Query is required".into(),
                message: None,
            }),
        )),
        Err(e) => {
            tracing::error!(error = %e, "Query failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Failed to process query".into(),
                    message: Some(e.user_message()),
                }),
            ))
        }
    }
}
