//! Shared application state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::broadcast::Broadcaster;
use crate::directory::IdentityDirectory;
use crate::orchestrator::Orchestrator;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub ws_connection_count: Arc<AtomicUsize>,
    pub max_ws_connections: usize,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            ws_connection_count: Arc::new(AtomicUsize::new(0)),
            max_ws_connections: super::config::MAX_WS_CONNECTIONS,
        }
    }

    pub fn with_max_ws_connections(mut self, max: usize) -> Self {
        self.max_ws_connections = max;
        self
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        self.orchestrator.store().broadcaster()
    }

    pub fn directory(&self) -> &Arc<dyn IdentityDirectory> {
        self.orchestrator.directory()
    }

    pub fn ws_connections(&self) -> usize {
        self.ws_connection_count.load(Ordering::Relaxed)
    }
}

pub type SharedState = Arc<AppState>;
