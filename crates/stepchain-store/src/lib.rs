pub mod memory;
pub mod sqlite;

#[cfg(test)]
mod conformance;

pub use memory::MemoryRunStore;
pub use sqlite::SqliteRunStore;

use std::sync::Arc;

use stepchain_core::config::{AppConfig, DuplicatePolicy};
use stepchain_core::error::Result;
use stepchain_core::traits::RunStore;
use tracing::info;

/// Behaviour shared by every run store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Steps created with each run.
    pub total_steps: u32,
    pub on_duplicate: DuplicatePolicy,
}

impl StoreOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            total_steps: config.runs.total_steps,
            on_duplicate: config.store.on_duplicate,
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            total_steps: 4,
            on_duplicate: DuplicatePolicy::ReturnExisting,
        }
    }
}

/// Open the store selected by `[store] path`.
pub fn open_store(config: &AppConfig) -> Result<Arc<dyn RunStore>> {
    let options = StoreOptions::from_config(config);
    match config.store_path() {
        Some(path) => Ok(Arc::new(SqliteRunStore::open(&path, options)?)),
        None => {
            info!("Using in-memory run store; runs are lost on exit");
            Ok(Arc::new(MemoryRunStore::new(options)))
        }
    }
}
