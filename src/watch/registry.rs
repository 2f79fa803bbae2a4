//! Watch registry - one store watch per key, shared through tickets
//!
//! The registry is responsible for:
//! - Opening a store watch the first time a key is registered
//! - Relaying every event from that watch onto the bus topic named after the key
//! - Tracking outstanding tickets per key
//! - Cancelling the watch the moment the last ticket is released

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{WatchTicket, WatchedKey};
use crate::bus::Bus;
use crate::store::{ChangeEvent, StateStore, StoreError, WatchStream, WatchTermination, EVENT_CONTENT_TYPE};

/// Default delay before a relay re-opens a store watch that disconnected
pub const DEFAULT_REOPEN_BACKOFF: Duration = Duration::from_secs(5);

/// Errors that can occur in the watch registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Failed to open store watch: {0}")]
    Store(#[from] StoreError),
}

/// A request against the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchCommand {
    /// Join (or create) the shared watch for `key`
    Register { key: WatchedKey },
    /// Give back a ticket previously issued for `key`
    Release { key: WatchedKey, ticket: WatchTicket },
}

/// Outcome of a [`WatchCommand`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchReply {
    Registered(WatchTicket),
    /// `entry_closed` is true when this release tore down the shared watch
    Released { entry_closed: bool },
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a relay waits before re-opening a disconnected store watch
    pub reopen_backoff: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reopen_backoff: DEFAULT_REOPEN_BACKOFF,
        }
    }
}

/// Point-in-time view of one shared watch
#[derive(Debug, Clone, Serialize)]
pub struct WatchStat {
    #[serde(flatten)]
    pub key: WatchedKey,

    pub tickets: usize,

    #[serde(rename = "openedAt")]
    pub opened_at: DateTime<Utc>,
}

struct WatcherEntry {
    tickets: HashSet<WatchTicket>,
    cancel: CancellationToken,
    relay: JoinHandle<()>,
    opened_at: DateTime<Utc>,
}

/// Multiplexes remote watch requests onto one store watch per key
///
/// Constructed explicitly by whichever process hosts it; independent
/// instances never share state.
pub struct WatchRegistry {
    store: Arc<dyn StateStore>,
    bus: Arc<dyn Bus>,
    entries: Mutex<HashMap<WatchedKey, WatcherEntry>>,
    next_ticket: AtomicU64,
    config: RegistryConfig,
}

impl WatchRegistry {
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<dyn Bus>) -> Self {
        Self::with_config(store, bus, RegistryConfig::default())
    }

    pub fn with_config(store: Arc<dyn StateStore>, bus: Arc<dyn Bus>, config: RegistryConfig) -> Self {
        Self {
            store,
            bus,
            entries: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
            config,
        }
    }

    /// Apply a single command
    pub async fn apply(&self, command: WatchCommand) -> Result<WatchReply, RegistryError> {
        match command {
            WatchCommand::Register { key } => self.register(&key).await.map(WatchReply::Registered),
            WatchCommand::Release { key, ticket } => {
                let entry_closed = self.release(&key, ticket).await;
                Ok(WatchReply::Released { entry_closed })
            }
        }
    }

    /// Join the shared watch for `key`, opening it if this is the first ticket
    pub async fn register(&self, key: &WatchedKey) -> Result<WatchTicket, RegistryError> {
        // Held across opening the store watch so two registrations for the
        // same key can never both open one.
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(key) {
            let ticket = self.mint_ticket();
            entry.tickets.insert(ticket);
            debug!(
                "Ticket {} joined watch on {} ({} outstanding)",
                ticket,
                key,
                entry.tickets.len()
            );
            return Ok(ticket);
        }

        let stream = self.store.watch(&key.key, key.with_prefix).await?;
        let ticket = self.mint_ticket();
        let cancel = CancellationToken::new();

        let relay = tokio::spawn(relay_events(
            key.clone(),
            stream,
            cancel.clone(),
            self.store.clone(),
            self.bus.clone(),
            self.config.reopen_backoff,
        ));

        entries.insert(
            key.clone(),
            WatcherEntry {
                tickets: HashSet::from([ticket]),
                cancel,
                relay,
                opened_at: Utc::now(),
            },
        );

        info!("Opened shared watch on {} for ticket {}", key, ticket);
        Ok(ticket)
    }

    /// Give back a ticket. Unknown keys and tickets are ignored.
    ///
    /// Returns true if this release closed the shared watch. In that case the
    /// relay task has exited and the store watch is cancelled before return.
    pub async fn release(&self, key: &WatchedKey, ticket: WatchTicket) -> bool {
        let mut entries = self.entries.lock().await;

        let Some(entry) = entries.get_mut(key) else {
            debug!("Release of ticket {} for unwatched {} ignored", ticket, key);
            return false;
        };
        if !entry.tickets.remove(&ticket) {
            debug!("Release of unknown ticket {} for {} ignored", ticket, key);
            return false;
        }
        if !entry.tickets.is_empty() {
            debug!(
                "Ticket {} released on {} ({} outstanding)",
                ticket,
                key,
                entry.tickets.len()
            );
            return false;
        }

        // Removed and closed under the lock, so a concurrent register opens
        // its store watch only after this one is gone.
        let Some(entry) = entries.remove(key) else {
            return false;
        };
        entry.cancel.cancel();
        if let Err(e) = entry.relay.await {
            error!("Relay task for {} failed: {}", key, e);
        }
        drop(entries);

        info!("Closed shared watch on {} (last ticket {})", key, ticket);
        true
    }

    /// Cancel every shared watch, e.g. on process shutdown
    pub async fn shutdown(&self) {
        let drained: Vec<(WatchedKey, WatcherEntry)> = {
            let mut entries = self.entries.lock().await;
            entries.drain().collect()
        };

        for (key, entry) in drained {
            entry.cancel.cancel();
            if let Err(e) = entry.relay.await {
                error!("Relay task for {} failed: {}", key, e);
            }
        }
    }

    /// Whether a shared watch is currently open for `key`
    pub async fn is_watching(&self, key: &WatchedKey) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    /// Outstanding tickets for `key`
    pub async fn ticket_count(&self, key: &WatchedKey) -> usize {
        self.entries
            .lock()
            .await
            .get(key)
            .map(|e| e.tickets.len())
            .unwrap_or(0)
    }

    /// Number of shared watches currently open
    pub async fn entry_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Snapshot of every open shared watch
    pub async fn stats(&self) -> Vec<WatchStat> {
        let entries = self.entries.lock().await;
        let mut stats: Vec<WatchStat> = entries
            .iter()
            .map(|(key, entry)| WatchStat {
                key: key.clone(),
                tickets: entry.tickets.len(),
                opened_at: entry.opened_at,
            })
            .collect();
        stats.sort_by(|a, b| a.key.key.cmp(&b.key.key));
        stats
    }

    fn mint_ticket(&self) -> WatchTicket {
        WatchTicket(self.next_ticket.fetch_add(1, Ordering::SeqCst))
    }
}

/// Drain a store watch onto the bus until the entry is cancelled.
///
/// A watch that disconnects on its own is re-opened after `backoff`; events
/// committed in the gap are left to consumers' resync.
async fn relay_events(
    key: WatchedKey,
    mut stream: WatchStream,
    cancel: CancellationToken,
    store: Arc<dyn StateStore>,
    bus: Arc<dyn Bus>,
    backoff: Duration,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                stream.cancel();
                break;
            }
            event = stream.next() => match event {
                Some(event) => publish_event(bus.as_ref(), &key, event).await,
                None => {
                    if stream.termination() == WatchTermination::Cancelled {
                        break;
                    }
                    warn!("Store watch on {} disconnected, re-opening in {:?}", key, backoff);
                    match reopen_watch(store.as_ref(), &key, &cancel, backoff).await {
                        Some(reopened) => stream = reopened,
                        None => break,
                    }
                }
            },
        }
    }
    debug!("Relay for {} exited", key);
}

async fn reopen_watch(
    store: &dyn StateStore,
    key: &WatchedKey,
    cancel: &CancellationToken,
    backoff: Duration,
) -> Option<WatchStream> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(backoff) => {}
        }
        match store.watch(&key.key, key.with_prefix).await {
            Ok(stream) => {
                info!("Re-opened store watch on {}", key);
                return Some(stream);
            }
            Err(e) => warn!("Failed to re-open store watch on {}: {}", key, e),
        }
    }
}

async fn publish_event(bus: &dyn Bus, key: &WatchedKey, event: ChangeEvent) {
    let payload = match event.to_envelope() {
        Ok(payload) => payload,
        Err(e) => {
            error!("Failed to encode event for {}: {}", key, e);
            return;
        }
    };

    if let Err(e) = bus.publish(&key.key, payload, EVENT_CONTENT_TYPE).await {
        warn!(
            "Dropped {} event for {} at revision {}: {}",
            event.kind, event.key, event.revision, e
        );
    }
}
