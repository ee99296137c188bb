//! Query façade: one question in, one answer out

use std::sync::Arc;

use agent_core::{Conversation, Message};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::QueryError;
use crate::prompt::SystemPrompt;
use crate::session::SessionManager;

/// Answer to a question together with the turns that produced it
#[derive(Clone, Debug, Serialize)]
pub struct QueryOutcome {
    pub question: String,
    pub answer: String,
    pub messages: Vec<Message>,
    pub iterations: usize,
}

/// Turns natural-language questions into answers via the shared session
pub struct QueryService {
    sessions: Arc<SessionManager>,
    instruction: String,
}

impl QueryService {
    pub fn new(sessions: Arc<SessionManager>, prompt: &SystemPrompt) -> Self {
        Self {
            sessions,
            instruction: prompt.render(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Answer one question.
    ///
    /// The question is passed to the model verbatim after the dialect
    /// instruction. Never returns an empty answer as success.
    pub async fn answer(&self, question: &str) -> Result<QueryOutcome, QueryError> {
        if question.trim().is_empty() {
            return Err(QueryError::EmptyQuestion);
        }

        let session = self.sessions.ensure().await?;

        let mut conversation = Conversation::with_system_prompt(self.instruction.clone());
        conversation.push(Message::user(question));

        info!(session = %session.id(), "Processing query");
        let result = session.agent().run(conversation).await?;
        debug!(iterations = result.iterations, turns = result.messages.len(), "Query finished");

        let answer = result
            .messages
            .last()
            .map(|m| m.content.clone())
            .filter(|content| !content.trim().is_empty())
            .ok_or(QueryError::EmptyAnswer)?;

        Ok(QueryOutcome {
            question: question.to_string(),
            answer,
            messages: result.messages,
            iterations: result.iterations,
        })
    }
}
