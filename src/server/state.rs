use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::bus::LocalBus;
use crate::store::{MemoryStore, StateStore};
use crate::watch::{RegistryConfig, WatchRegistry};

/// Shared state for the control plane API
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub bus: Arc<LocalBus>,
    pub registry: Arc<WatchRegistry>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Assemble the relay around an existing store and bus
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<LocalBus>, config: RegistryConfig) -> Self {
        let registry = Arc::new(WatchRegistry::with_config(
            store.clone(),
            bus.clone(),
            config,
        ));

        Self {
            store,
            bus,
            registry,
            started_at: Utc::now(),
        }
    }

    /// Relay backed by a fresh in-memory store
    pub fn in_memory(config: RegistryConfig) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalBus::new()),
            config,
        )
    }

    /// Seconds since the state was assembled
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
