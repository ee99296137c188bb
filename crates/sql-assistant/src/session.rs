//! Session lifecycle
//!
//! A session is one provider connection, the tools it advertised, and an
//! agent bound to both. [`SessionManager`] creates it on first use, hands the
//! same instance to every caller, and tears it down on shutdown.
//!
//! ```text
//!        ensure()                 open ok
//!   Idle ─────────▶ Initializing ─────────▶ Ready
//!    ▲                   │                    │
//!    └──── open failed ──┘                    │ connection dropped:
//!    │                                        │ next ensure() reopens
//!    │          shutdown()                    │
//!    └──── ShuttingDown ◀─────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use agent_core::{Agent, AgentBuilder, AgentConfig, LlmProvider, ToolRegistry};
use agent_runtime::{McpClient, OpenAiProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::InitError;
use crate::prompt::SystemPrompt;

/// The connection a session's tools are bound to
#[async_trait]
pub trait ToolConnection: Send + Sync {
    /// Provider name and version for logs and health output
    fn identity(&self) -> String;

    fn is_closed(&self) -> bool;

    /// Release the connection; idempotent
    async fn close(&self);
}

#[async_trait]
impl ToolConnection for McpClient {
    fn identity(&self) -> String {
        self.server_info().to_string()
    }

    fn is_closed(&self) -> bool {
        McpClient::is_closed(self)
    }

    async fn close(&self) {
        McpClient::close(self).await;
    }
}

/// A ready-to-use agent plus the connection backing its tools
pub struct LiveSession {
    id: Uuid,
    opened_at: DateTime<Utc>,
    agent: Agent,
    connection: Arc<dyn ToolConnection>,
}

impl LiveSession {
    pub fn new(agent: Agent, connection: Arc<dyn ToolConnection>) -> Self {
        Self {
            id: Uuid::new_v4(),
            opened_at: Utc::now(),
            agent,
            connection,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn provider(&self) -> String {
        self.connection.identity()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.agent.tools().names().into_iter().map(String::from).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}

/// Builds sessions for a [`SessionManager`]
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<LiveSession, InitError>;
}

/// Production factory: spawns the MCP provider and talks to an
/// OpenAI-compatible model
pub struct McpSessionFactory {
    config: AppConfig,
    prompt: SystemPrompt,
    provider: Option<Arc<dyn LlmProvider>>,
}

impl McpSessionFactory {
    pub fn new(config: AppConfig) -> Self {
        let prompt = config.system_prompt();
        Self { config, prompt, provider: None }
    }

    /// Use this model instead of building one from configuration
    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// The model sessions are bound to
    pub fn model(&self) -> Result<Arc<dyn LlmProvider>, InitError> {
        if let Some(provider) = &self.provider {
            return Ok(Arc::clone(provider));
        }
        let provider = OpenAiProvider::from_config(self.config.openai_config())
            .map_err(|e| InitError::Configuration(e.to_string()))?;
        Ok(Arc::new(provider))
    }

    /// Check that the model endpoint answers and serves the configured model.
    ///
    /// Returns whether the endpoint is reachable; a missing model is only
    /// logged since some gateways do not list everything they serve.
    pub async fn check_model(&self) -> Result<bool, InitError> {
        let model = self.model()?;
        let endpoint = model.info().endpoint;

        if !model.health_check().await.unwrap_or(false) {
            warn!(%endpoint, "⚠ LLM endpoint not reachable");
            return Ok(false);
        }

        info!(%endpoint, "✓ Connected to LLM endpoint");
        match model.list_models().await {
            Ok(models) if models.iter().any(|m| m.id == self.config.llm_model) => {
                info!(model = %self.config.llm_model, "  Model available");
            }
            Ok(models) => {
                warn!(model = %self.config.llm_model, listed = models.len(), "  Configured model not listed by endpoint");
            }
            Err(e) => warn!(error = %e, "  Could not list models"),
        }
        Ok(true)
    }
}

#[async_trait]
impl SessionFactory for McpSessionFactory {
    async fn open(&self) -> Result<LiveSession, InitError> {
        self.config.validate()?;
        let model = self.model()?;

        info!(
            database = %self.config.redacted_database_url(),
            program = %self.config.provider_program,
            "Starting tool provider"
        );

        let client = McpClient::spawn(&self.config.provider_command(), self.config.mcp_client_config()).await?;

        assemble(
            Arc::new(client),
            model,
            self.config.agent_config(&self.prompt),
            Some(self.config.tool_filter.as_slice()),
        )
        .await
    }
}

/// Discover tools on an open connection and bind an agent to them.
///
/// The connection is closed again if anything after the handshake fails.
pub async fn assemble(
    client: Arc<McpClient>,
    model: Arc<dyn LlmProvider>,
    config: AgentConfig,
    tool_filter: Option<&[String]>,
) -> Result<LiveSession, InitError> {
    let tools = match client.discover(tool_filter).await {
        Ok(tools) => tools,
        Err(e) => {
            client.close().await;
            return Err(e.into());
        }
    };

    if let Some(instructions) = client.instructions() {
        debug!(instructions, "Provider instructions");
    }

    let registry: ToolRegistry = tools.into_iter().collect();
    info!(tools = ?registry.names(), "Loaded tools from provider");

    let agent = AgentBuilder::new()
        .provider(model)
        .tools(Arc::new(registry))
        .config(config)
        .build();

    match agent {
        Ok(agent) => Ok(LiveSession::new(agent, client)),
        Err(e) => {
            client.close().await;
            Err(InitError::Agent(e.to_string()))
        }
    }
}

type InitAttempt = Shared<BoxFuture<'static, Result<Arc<LiveSession>, InitError>>>;
type Drain = Shared<BoxFuture<'static, ()>>;

enum State {
    Idle,
    Initializing { generation: u64, attempt: InitAttempt },
    Ready(Arc<LiveSession>),
    /// The previous session is being closed; nothing new opens until it is
    ShuttingDown { generation: u64, drain: Drain },
}

enum Step {
    Join(u64, InitAttempt),
    Wait(u64, Drain),
}

/// Lifecycle snapshot for health output
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Initializing,
    ShuttingDown,
    Ready {
        provider: String,
        tools: Vec<String>,
        since: DateTime<Utc>,
    },
}

/// Owns the single live session of the process.
///
/// Concurrent [`ensure`](Self::ensure) calls share one initialization
/// attempt; the factory runs at most once per attempt.
pub struct SessionManager {
    factory: Arc<dyn SessionFactory>,
    state: Mutex<State>,
    generation: AtomicU64,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            state: Mutex::new(State::Idle),
            generation: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Return the live session, creating it if needed.
    ///
    /// Callers arriving while an attempt is running wait for that attempt and
    /// get its outcome. A failed attempt leaves the manager idle so the next
    /// call starts over. A session whose connection has dropped is closed and
    /// replaced, and a call arriving during shutdown waits for it to finish.
    pub async fn ensure(&self) -> Result<Arc<LiveSession>, InitError> {
        loop {
            let step = {
                let mut state = self.lock();
                let running = match &*state {
                    State::Ready(session) if !session.is_closed() => return Ok(Arc::clone(session)),
                    State::Initializing { generation, attempt } => Some(Step::Join(*generation, attempt.clone())),
                    State::ShuttingDown { generation, drain } => Some(Step::Wait(*generation, drain.clone())),
                    State::Ready(_) | State::Idle => None,
                };

                match running {
                    Some(step) => step,
                    None => {
                        let stale = match std::mem::replace(&mut *state, State::Idle) {
                            State::Ready(session) => {
                                warn!(session = %session.id(), "Tool connection dropped, reinitializing");
                                Some(session)
                            }
                            _ => None,
                        };
                        let generation = self.next_generation();
                        let attempt = self.start_attempt(generation, stale);
                        *state = State::Initializing { generation, attempt: attempt.clone() };
                        Step::Join(generation, attempt)
                    }
                }
            };

            match step {
                Step::Wait(generation, drain) => {
                    drain.await;
                    self.finish_drain(generation);
                }
                Step::Join(generation, attempt) => return self.settle(generation, attempt.await),
            }
        }
    }

    /// Record the outcome of attempt `generation` unless shutdown took over
    fn settle(
        &self,
        generation: u64,
        outcome: Result<Arc<LiveSession>, InitError>,
    ) -> Result<Arc<LiveSession>, InitError> {
        let mut state = self.lock();
        match &*state {
            State::Initializing { generation: current, .. } if *current == generation => {
                *state = match &outcome {
                    Ok(session) => State::Ready(Arc::clone(session)),
                    Err(_) => State::Idle,
                };
                outcome
            }
            State::Ready(current) if outcome.as_ref().is_ok_and(|s| Arc::ptr_eq(s, current)) => outcome,
            _ => match outcome {
                Ok(_) => Err(InitError::Connection("session was shut down during initialization".into())),
                Err(e) => Err(e),
            },
        }
    }

    fn start_attempt(&self, generation: u64, stale: Option<Arc<LiveSession>>) -> InitAttempt {
        let factory = Arc::clone(&self.factory);
        async move {
            if let Some(stale) = stale {
                stale.close().await;
            }

            info!(generation, "Initializing session");
            match factory.open().await {
                Ok(session) => {
                    info!(
                        session = %session.id(),
                        provider = %session.provider(),
                        tools = ?session.tool_names(),
                        "Session ready"
                    );
                    Ok(Arc::new(session))
                }
                Err(e) => {
                    error!(generation, error = %e, "Session initialization failed");
                    Err(e)
                }
            }
        }
        .boxed()
        .shared()
    }

    fn finish_drain(&self, generation: u64) {
        let mut state = self.lock();
        if matches!(&*state, State::ShuttingDown { generation: current, .. } if *current == generation) {
            *state = State::Idle;
        }
    }

    /// Close the live session, if any, and return to idle.
    ///
    /// An attempt in progress is awaited and its session closed. Safe to call
    /// repeatedly; a later `ensure()` starts a fresh session once this returns.
    pub async fn shutdown(&self) {
        let (generation, drain) = {
            let mut state = self.lock();
            let (generation, drain) = match std::mem::replace(&mut *state, State::Idle) {
                State::Idle => {
                    debug!("Shutdown requested with no live session");
                    return;
                }
                State::ShuttingDown { generation, drain } => (generation, drain),
                State::Ready(session) => (self.next_generation(), closing(futures::future::ready(Ok(session)).boxed())),
                State::Initializing { attempt, .. } => {
                    info!("Waiting for in-flight initialization before shutdown");
                    (self.next_generation(), closing(attempt.boxed()))
                }
            };
            *state = State::ShuttingDown { generation, drain: drain.clone() };
            (generation, drain)
        };

        drain.await;
        self.finish_drain(generation);
    }

    pub fn status(&self) -> SessionStatus {
        match &*self.lock() {
            State::Idle => SessionStatus::Idle,
            State::Initializing { .. } => SessionStatus::Initializing,
            State::ShuttingDown { .. } => SessionStatus::ShuttingDown,
            State::Ready(session) => SessionStatus::Ready {
                provider: session.provider(),
                tools: session.tool_names(),
                since: session.opened_at(),
            },
        }
    }
}

/// Close whatever session `pending` yields
fn closing(pending: BoxFuture<'static, Result<Arc<LiveSession>, InitError>>) -> Drain {
    async move {
        if let Ok(session) = pending.await {
            close_session(&session).await;
        }
    }
    .boxed()
    .shared()
}

async fn close_session(session: &LiveSession) {
    session.close().await;
    if !session.is_closed() {
        warn!(session = %session.id(), "Tool connection still reports open after close");
    }
    info!(session = %session.id(), "Session shut down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixtureFactory, ScriptedModel, SCRIPTED_MODEL};
    use agent_core::Tool;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_ensure_opens_once() {
        let factory = Arc::new(FixtureFactory::new().with_open_delay(Duration::from_millis(50)));
        let manager = SessionManager::new(factory.clone());

        let results = futures::future::join_all((0..8).map(|_| manager.ensure())).await;
        let sessions: Vec<_> = results.into_iter().map(Result::unwrap).collect();

        assert_eq!(factory.opens(), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    }

    #[tokio::test]
    async fn concurrent_callers_share_a_failure_then_retry() {
        let factory = Arc::new(
            FixtureFactory::new()
                .with_open_delay(Duration::from_millis(20))
                .failing_first(1),
        );
        let manager = SessionManager::new(factory.clone());

        let results = futures::future::join_all((0..3).map(|_| manager.ensure())).await;
        assert!(results.iter().all(|r| matches!(r, Err(InitError::Connection(_)))));
        assert_eq!(factory.opens(), 1);
        assert_eq!(manager.status(), SessionStatus::Idle);

        assert!(manager.ensure().await.is_ok());
        assert_eq!(factory.opens(), 2);
    }

    #[tokio::test]
    async fn shutdown_closes_and_next_ensure_reopens() {
        let factory = Arc::new(FixtureFactory::new());
        let manager = SessionManager::new(factory.clone());

        let first = manager.ensure().await.unwrap();
        assert!(!first.is_closed());

        manager.shutdown().await;
        assert!(first.is_closed());
        assert_eq!(manager.status(), SessionStatus::Idle);

        let second = manager.ensure().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
        assert_eq!(factory.opens(), 2);
    }

    #[tokio::test]
    async fn dropped_connection_is_replaced_on_next_ensure() {
        let factory = Arc::new(FixtureFactory::new());
        let manager = SessionManager::new(factory.clone());

        let first = manager.ensure().await.unwrap();
        // provider process went away
        factory.last_client().unwrap().close().await;
        assert!(first.is_closed());

        let second = manager.ensure().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
        assert_eq!(factory.opens(), 2);
        assert!(matches!(manager.status(), SessionStatus::Ready { .. }));

        let third = manager.ensure().await.unwrap();
        assert!(Arc::ptr_eq(&second, &third));
        assert_eq!(factory.opens(), 2);
    }

    #[tokio::test]
    async fn ensure_during_shutdown_waits_for_previous_session_to_close() {
        let factory = Arc::new(FixtureFactory::new().with_open_delay(Duration::from_millis(100)));
        let manager = Arc::new(SessionManager::new(factory.clone()));

        let first = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.ensure().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stopping = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.status(), SessionStatus::ShuttingDown);

        let second = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.ensure().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(factory.opens(), 1);

        stopping.await.unwrap();
        assert!(first.await.unwrap().is_err());
        assert!(factory.client(0).unwrap().is_closed());

        let second = second.await.unwrap().unwrap();
        assert!(!second.is_closed());
        assert_eq!(factory.opens(), 2);
        assert!(matches!(manager.status(), SessionStatus::Ready { .. }));
    }

    #[tokio::test]
    async fn shutdown_is_safe_without_session_and_repeated() {
        let manager = SessionManager::new(Arc::new(FixtureFactory::new()));
        manager.shutdown().await;
        manager.shutdown().await;
        assert_eq!(manager.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn shutdown_during_initialization_closes_result() {
        let factory = Arc::new(FixtureFactory::new().with_open_delay(Duration::from_millis(100)));
        let manager = Arc::new(SessionManager::new(factory.clone()));

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.ensure().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.status(), SessionStatus::Initializing);

        manager.shutdown().await;

        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, Err(InitError::Connection(_))));
        assert!(factory.last_client().unwrap().is_closed());
        assert_eq!(manager.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn status_reports_loaded_tools() {
        let manager = SessionManager::new(Arc::new(FixtureFactory::new()));
        assert_eq!(manager.status(), SessionStatus::Idle);

        manager.ensure().await.unwrap();
        match manager.status() {
            SessionStatus::Ready { provider, tools, .. } => {
                assert_eq!(provider, "fixture-postgres v0.1.0");
                assert_eq!(tools, vec!["query"]);
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn tool_call_after_shutdown_fails_explicitly() {
        let manager = SessionManager::new(Arc::new(FixtureFactory::new()));
        let session = manager.ensure().await.unwrap();
        let tool = session.agent().tools().get("query").unwrap();

        manager.shutdown().await;

        let call = agent_core::ToolCall::new("query").with_arg("sql", "SELECT 1");
        let err = tool.execute(&call).await.unwrap_err();
        assert!(matches!(err, agent_core::AgentError::ToolExecution(_)));
    }

    #[tokio::test]
    async fn check_model_finds_configured_model() {
        let config = AppConfig {
            llm_model: SCRIPTED_MODEL.into(),
            ..Default::default()
        };
        let factory = McpSessionFactory::new(config).with_provider(Arc::new(ScriptedModel::new()));
        assert!(factory.check_model().await.unwrap());
    }

    #[tokio::test]
    async fn check_model_reports_unreachable_endpoint() {
        let config = AppConfig {
            llm_api_key: Some("sk-test".into()),
            llm_base_url: "http://127.0.0.1:9/v1".into(),
            ..Default::default()
        };
        assert!(!McpSessionFactory::new(config).check_model().await.unwrap());
    }

    #[tokio::test]
    async fn missing_connection_string_fails_before_spawn() {
        let config = AppConfig {
            llm_api_key: Some("sk-test".into()),
            provider_program: "definitely-not-an-mcp-server-binary".into(),
            ..Default::default()
        };
        let manager = SessionManager::new(Arc::new(McpSessionFactory::new(config)));

        let err = manager.ensure().await.err().unwrap();
        assert!(matches!(err, InitError::Configuration(ref msg) if msg.contains("POSTGRESQL_ADDON_URI")));
        assert_eq!(manager.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn missing_provider_binary_is_connection_error() {
        let config = AppConfig {
            database_url: Some("postgresql://u:p@localhost/app".into()),
            llm_api_key: Some("sk-test".into()),
            provider_program: "definitely-not-an-mcp-server-binary".into(),
            ..Default::default()
        };
        let manager = SessionManager::new(Arc::new(McpSessionFactory::new(config)));

        let err = manager.ensure().await.err().unwrap();
        assert!(matches!(err, InitError::Connection(_)));
        assert!(err.is_retryable());
    }
}
