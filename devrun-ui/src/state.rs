//! Shared application state for the UI server.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use devrun::core::types::RunStatus;
use devrun::io::store::JsonStore;
use tokio::sync::broadcast;

/// Events broadcast to SSE clients when the store file changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    RunCreated {
        run_id: String,
    },
    /// The run's status changed or new events were appended.
    RunUpdated {
        run_id: String,
        status: RunStatus,
        latest_sequence: u64,
    },
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// File-backed store written by the orchestrator.
    pub state_path: PathBuf,
    /// Broadcast sender for store change events.
    pub event_tx: Arc<broadcast::Sender<ChangeEvent>>,
}

impl AppState {
    pub fn new(state_path: PathBuf) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            state_path,
            event_tx: Arc::new(event_tx),
        }
    }

    /// Fresh read of the store file. Never written back.
    pub fn open_store(&self) -> anyhow::Result<JsonStore> {
        JsonStore::open(&self.state_path)
    }

    /// Directory watched for store rewrites (atomic renames land here).
    pub fn watch_dir(&self) -> &Path {
        self.state_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }
}
