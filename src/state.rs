//! Shared gateway state and configuration.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::runner::Runner;
use crate::terminal::TerminalRegistry;

/// Static configuration assembled in `main` and shared by every handler.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Directory holding one subdirectory per project.
    pub projects_dir: PathBuf,
    /// Shell spawned for interactive terminal sessions.
    pub shell: String,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub runner: Runner,
    pub terminals: TerminalRegistry,
}

impl AppState {
    pub fn new(config: GatewayConfig, runner: Runner) -> Self {
        Self {
            config: Arc::new(config),
            runner,
            terminals: TerminalRegistry::new(),
        }
    }

    /// Terminate every live terminal session and refuse new ones. Returns
    /// once all children have been signalled; does not wait for them to
    /// exit.
    pub async fn shutdown(&self) {
        let drained = self.terminals.drain().await;
        info!(sessions = drained.len(), "terminal sessions signalled for shutdown");
    }
}
