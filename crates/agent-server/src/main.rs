//! sql-assistant HTTP Server
//!
//! Axum-based server answering natural-language questions about a
//! PostgreSQL database, plus a one-shot `ask` mode for the terminal.

mod handlers;
mod state;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sql_assistant::{AppConfig, McpSessionFactory, QueryService, SessionManager};

use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "sql-assistant")]
#[command(version, about = "Ask questions about a PostgreSQL database in plain language")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve,

    /// Answer a single question, print the answer and exit
    Ask {
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize tracing; stdout stays clean for `ask` output
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = AppConfig::from_env()?;
    config.validate()?;

    tracing::info!("Database: {}", config.redacted_database_url());
    tracing::info!("Model:    {} @ {}", config.llm_model, config.llm_base_url);

    // One model client shared by every session
    let factory = McpSessionFactory::new(config.clone());
    let model = factory.model()?;
    let factory = Arc::new(factory.with_provider(model));

    let prompt = config.system_prompt();
    let sessions = Arc::new(SessionManager::new(factory.clone()));
    let queries = Arc::new(QueryService::new(Arc::clone(&sessions), &prompt));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config, &factory, AppState::new(sessions, queries)).await,
        Command::Ask { question } => ask(&sessions, &queries, &question.join(" ")).await,
    }
}

async fn ask(sessions: &SessionManager, queries: &QueryService, question: &str) -> anyhow::Result<()> {
    let outcome = queries.answer(question).await;
    sessions.shutdown().await;

    let outcome = outcome?;
    println!("{}", outcome.answer);
    Ok(())
}

async fn serve(config: &AppConfig, factory: &McpSessionFactory, state: AppState) -> anyhow::Result<()> {
    let sessions = Arc::clone(&state.sessions);

    // Verify the model endpoint
    if !factory.check_model().await? {
        tracing::warn!("  Queries will fail until {} is reachable", config.llm_base_url);
    }

    // Connect eagerly; a failure here only delays setup until the first query
    {
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            match sessions.ensure().await {
                Ok(session) => {
                    tracing::info!("✓ Connected to {}", session.provider());
                    for name in session.tool_names() {
                        tracing::info!("  Tool: {}", name);
                    }
                }
                Err(e) => {
                    tracing::warn!("⚠ Tool provider not ready: {}", e);
                    tracing::warn!("  Initialization will be retried on the first query");
                }
            }
        });
    }

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build router: API first, static front-end for everything else
    let app = handlers::api_router(state)
        .fallback_service(ServeDir::new("public"))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 sql-assistant running on http://{}", config.bind_addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /api/health - Health check");
    tracing::info!("  POST /api/query  - Ask a question");
    tracing::info!("  GET  /           - Web interface");
    tracing::info!("");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sessions.shutdown().await;
    tracing::info!("Server stopped");

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, closing session");
}
