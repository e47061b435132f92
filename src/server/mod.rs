//! haven-server: HTTP + WebSocket front end of the orchestrator.
//!
//! Wires the identity directory, capabilities, optional journal and the
//! orchestrator together, resumes journaled sessions, then serves the REST
//! API and the realtime channel until Ctrl-C.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::broadcast::Broadcaster;
use crate::capability::{Capabilities, Capability, SimulatedCapability, WebhookCapability};
use crate::directory::{DirectoryError, IdentityDirectory, StaticDirectory};
use crate::journal::{JournalError, SessionJournal};
use crate::orchestrator::Orchestrator;
use crate::store::SessionStore;

use config::{Cli, Config, NOTIFIER_TIMEOUT_SECS, SIMULATED_LATENCY_MS};
use state::{AppState, SharedState};

#[derive(Debug)]
pub enum ServerError {
    Config(String),
    Directory(DirectoryError),
    Journal(JournalError),
    Io(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Config(e) => write!(f, "configuration error: {e}"),
            ServerError::Directory(e) => write!(f, "identity directory: {e}"),
            ServerError::Journal(e) => write!(f, "session journal: {e}"),
            ServerError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<DirectoryError> for ServerError {
    fn from(e: DirectoryError) -> Self {
        ServerError::Directory(e)
    }
}

impl From<JournalError> for ServerError {
    fn from(e: JournalError) -> Self {
        ServerError::Journal(e)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

fn build_capabilities(config: &Config) -> Capabilities {
    let capability: Arc<dyn Capability> = match &config.notifier_url {
        Some(url) => Arc::new(WebhookCapability::new(
            url.clone(),
            Duration::from_secs(NOTIFIER_TIMEOUT_SECS),
        )),
        None => Arc::new(SimulatedCapability::new(
            config.failure_rate,
            Duration::from_millis(SIMULATED_LATENCY_MS),
        )),
    };
    Capabilities::uniform(capability)
}

/// Build the orchestrator and shared state from a parsed config.
pub fn build_state(config: &Config) -> Result<SharedState, ServerError> {
    let directory: Arc<dyn IdentityDirectory> = match &config.directory {
        Some(path) => Arc::new(StaticDirectory::load(path)?),
        None => Arc::new(StaticDirectory::new()),
    };

    let mut store = SessionStore::new(Broadcaster::new(), config.orchestrator.ping_history);
    if let Some(path) = &config.db {
        store = store.with_journal(SessionJournal::open(path)?);
    }

    let mut orchestrator = Orchestrator::new(
        Arc::new(store),
        directory,
        build_capabilities(config),
        config.orchestrator.clone(),
    );
    if let Some(pin) = &config.anonymous_pin {
        orchestrator = orchestrator.with_anonymous_pin(pin);
    }

    Ok(Arc::new(AppState::new(Arc::new(orchestrator))))
}

/// Entry point: parse CLI, build state, resume, serve.
pub async fn run() -> Result<(), ServerError> {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli).map_err(ServerError::Config)?;

    crate::logging::init();

    crate::tlog!("haven-server starting");
    match &config.directory {
        Some(path) => crate::tlog!("  directory: {}", path.display()),
        None => crate::tlog!("  directory: none (all triggers are anonymous)"),
    }
    match &config.db {
        Some(path) => crate::tlog!("  journal: {}", path.display()),
        None => crate::tlog!("  journal: none (sessions are memory-only)"),
    }
    match &config.notifier_url {
        Some(url) => crate::tlog!("  capabilities: webhook {}", url),
        None => crate::tlog!(
            "  capabilities: simulated (failure rate {})",
            config.failure_rate
        ),
    }
    crate::tlog!(
        "  retries: {} (backoff {:?}), ping interval {}s, history {}",
        config.orchestrator.max_retries,
        config.orchestrator.retry_backoff,
        config.orchestrator.location_interval.as_secs(),
        config.orchestrator.ping_history
    );

    let state = build_state(&config)?;

    let resumed = state.orchestrator.resume().await?;
    if resumed > 0 {
        crate::tlog!("  resumed {} unresolved session(s)", resumed);
    }

    let app = router::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    crate::tlog!("haven-server listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            crate::tlog!("haven-server shutting down");
        })
        .await?;
    Ok(())
}
