//! Client-side list + watch
//!
//! Every consumer stays in sync with cluster state the same way: list a
//! snapshot, take a ticket, subscribe to the bus topic named after the key,
//! and hand decoded events to a handler. The ticket is owned by a
//! [`WatchGuard`] so it is given back on every exit path.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{RegistrationError, WatchRegistrar};
use super::{WatchTicket, WatchedKey};
use crate::bus::{Bus, BusError, BusMessage, SubscriptionEnd};
use crate::store::{ChangeEvent, ListResult, StateStore, StoreError};

/// Errors that end a list or watch
#[derive(Error, Debug)]
pub enum WatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// One row of a snapshot read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedObject {
    pub key: String,

    #[serde(with = "crate::store::event::base64_bytes")]
    pub value: Vec<u8>,

    /// Store revision of the object's last modification
    pub version: i64,
}

/// Lists and watches keys through a store, a registrar and a bus
#[derive(Clone)]
pub struct ListerWatcher {
    store: Arc<dyn StateStore>,
    registrar: Arc<dyn WatchRegistrar>,
    bus: Arc<dyn Bus>,
}

impl ListerWatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        registrar: Arc<dyn WatchRegistrar>,
        bus: Arc<dyn Bus>,
    ) -> Self {
        Self {
            store,
            registrar,
            bus,
        }
    }

    /// Snapshot read of a single key or of every key under a prefix
    pub async fn list(&self, key: &WatchedKey) -> Result<Vec<ListedObject>, WatchError> {
        if !key.with_prefix {
            let kv = self.store.get(&key.key).await?;
            return Ok(kv
                .map(|kv| ListedObject {
                    key: kv.key,
                    value: kv.value,
                    version: kv.mod_revision,
                })
                .into_iter()
                .collect());
        }

        let result = self.store.list(&key.key).await?;
        Ok(result
            .items
            .into_iter()
            .map(|kv| ListedObject {
                key: kv.key,
                value: kv.value,
                version: kv.mod_revision,
            })
            .collect())
    }

    /// Snapshot read that also reports the store revision it was taken at
    pub async fn snapshot(&self, key: &WatchedKey) -> Result<ListResult, WatchError> {
        let mut result = self.store.list(&key.key).await?;
        if !key.with_prefix {
            result.items.retain(|kv| kv.key == key.key);
        }
        Ok(result)
    }

    /// Watch `key` until `stop` fires, calling `handler` for every event.
    ///
    /// Returns `Ok(())` once stopped and [`BusError::Closed`] if the bus ends
    /// the subscription first. The ticket is released on both paths.
    pub async fn watch<F>(
        &self,
        key: &WatchedKey,
        handler: F,
        stop: CancellationToken,
    ) -> Result<(), WatchError>
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let mut guard = self.open(key, handler).await?;
        let outcome = guard.wait(&stop).await;
        let released = guard.release().await;
        outcome.and(released)
    }

    /// Start watching `key` and return immediately.
    ///
    /// If registration fails nothing is subscribed and nothing needs
    /// cleaning up.
    pub async fn watch_non_blocking<F>(
        &self,
        key: &WatchedKey,
        handler: F,
    ) -> Result<WatchHandle, WatchError>
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let guard = self.open(key, handler).await?;
        Ok(WatchHandle { guard })
    }

    /// Register, then subscribe. A failed subscribe gives the ticket back.
    async fn open<F>(&self, key: &WatchedKey, handler: F) -> Result<WatchGuard, WatchError>
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let ticket = self.registrar.register(key).await?;
        let mut guard = WatchGuard {
            registrar: self.registrar.clone(),
            key: key.clone(),
            ticket: Some(ticket),
            stop: CancellationToken::new(),
            dispatch: None,
        };

        let subscription = match self.bus.subscribe(&key.key).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("Subscribe to {} failed, releasing ticket {}: {}", key, ticket, e);
                if let Err(release_err) = guard.release().await {
                    warn!("Release of ticket {} failed: {}", ticket, release_err);
                }
                return Err(e.into());
            }
        };

        guard.dispatch = Some(subscription.dispatch(decode_events(key, handler), guard.stop.clone()));
        debug!("Watching {} with ticket {}", key, ticket);
        Ok(guard)
    }
}

/// Adapt an event handler to raw bus messages.
///
/// Payloads that do not decode are logged and dropped; the watch goes on.
fn decode_events<F>(key: &WatchedKey, mut handler: F) -> impl FnMut(BusMessage) + Send + 'static
where
    F: FnMut(ChangeEvent) + Send + 'static,
{
    let key = key.clone();
    move |msg| match ChangeEvent::from_envelope(&msg.payload) {
        Ok(mut event) => {
            if event.key.is_empty() && !key.with_prefix {
                event.key = key.key.clone();
            }
            handler(event)
        }
        Err(e) => warn!("Dropping undecodable event on {}: {}", msg.topic, e),
    }
}

/// Holds a watch ticket and the bus subscription opened with it
///
/// [`WatchGuard::release`] is the normal way out. A guard dropped without it
/// still unsubscribes and releases the ticket on a background task.
pub struct WatchGuard {
    registrar: Arc<dyn WatchRegistrar>,
    key: WatchedKey,
    ticket: Option<WatchTicket>,
    stop: CancellationToken,
    dispatch: Option<JoinHandle<SubscriptionEnd>>,
}

impl WatchGuard {
    pub fn key(&self) -> &WatchedKey {
        &self.key
    }

    pub fn ticket(&self) -> Option<WatchTicket> {
        self.ticket
    }

    /// Wait until `stop` fires or the subscription ends on its own
    async fn wait(&mut self, stop: &CancellationToken) -> Result<(), WatchError> {
        let Some(dispatch) = self.dispatch.as_mut() else {
            return Ok(());
        };

        let end = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            end = dispatch => end,
        };
        self.dispatch = None;

        match end {
            Ok(SubscriptionEnd::Stopped) => Ok(()),
            Ok(SubscriptionEnd::Closed) => Err(BusError::Closed(self.key.key.clone()).into()),
            Err(e) => Err(BusError::Unavailable(format!("dispatch task failed: {}", e)).into()),
        }
    }

    /// Unsubscribe, then give the ticket back
    pub async fn release(mut self) -> Result<(), WatchError> {
        self.stop.cancel();
        if let Some(dispatch) = self.dispatch.take() {
            if let Err(e) = dispatch.await {
                error!("Dispatch task for {} failed: {}", self.key, e);
            }
        }

        let Some(ticket) = self.ticket else {
            return Ok(());
        };
        // Cleared only after the release completes; Drop releases anything still held
        let released = self.registrar.release(&self.key, ticket).await;
        self.ticket = None;
        released?;
        debug!("Released ticket {} for {}", ticket, self.key);
        Ok(())
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.stop.cancel();

        let Some(ticket) = self.ticket.take() else {
            return;
        };
        let registrar = self.registrar.clone();
        let key = self.key.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                info!("Watch on {} dropped without release, releasing ticket {}", key, ticket);
                handle.spawn(async move {
                    if let Err(e) = registrar.release(&key, ticket).await {
                        warn!("Background release of ticket {} for {} failed: {}", ticket, key, e);
                    }
                });
            }
            Err(_) => error!(
                "Watch on {} dropped outside a runtime, ticket {} leaked",
                key, ticket
            ),
        }
    }
}

/// A running watch started by [`ListerWatcher::watch_non_blocking`]
pub struct WatchHandle {
    guard: WatchGuard,
}

impl WatchHandle {
    pub fn key(&self) -> &WatchedKey {
        self.guard.key()
    }

    pub fn ticket(&self) -> Option<WatchTicket> {
        self.guard.ticket()
    }

    /// True once the bus has ended the subscription on its own
    pub fn is_finished(&self) -> bool {
        self.guard
            .dispatch
            .as_ref()
            .map(|d| d.is_finished())
            .unwrap_or(true)
    }

    /// Stop delivering events and release the ticket
    pub async fn cancel(self) -> Result<(), WatchError> {
        self.guard.release().await
    }
}
