//! Command implementations for the CLI
//!
//! SBIO pattern: commands return Results, printing is left to the caller.
//! The watch commands are the exception: they stream until interrupted.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::display::{format_cache_change, format_event, format_listed};
use super::WatchArgs;
use crate::bus::RemoteBus;
use crate::cache::{Informer, InformerConfig};
use crate::store::{HttpStore, KeyValue, StateStore, StoreError};
use crate::watch::{HttpRegistrar, ListerWatcher, WatchError, WatchedKey};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("Key '{0}' not found")]
    NotFound(String),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Key-value commands
// ============================================================================

pub async fn put_key(store: &dyn StateStore, key: &str, value: &str) -> CommandResult<i64> {
    Ok(store.put(key, value.as_bytes().to_vec()).await?)
}

/// Read one key, or every key under it when `prefix` is set
pub async fn get_keys(store: &dyn StateStore, key: &str, prefix: bool) -> CommandResult<Vec<KeyValue>> {
    if prefix {
        return Ok(store.list(key).await?.items);
    }
    match store.get(key).await? {
        Some(kv) => Ok(vec![kv]),
        None => Err(CommandError::NotFound(key.to_string())),
    }
}

pub async fn delete_key(store: &dyn StateStore, key: &str) -> CommandResult<bool> {
    Ok(store.delete(key).await?)
}

// ============================================================================
// Watch commands
// ============================================================================

/// Key a `watch` invocation refers to
pub fn watch_target(args: &WatchArgs) -> WatchedKey {
    match &args.name {
        Some(name) => WatchedKey::object(&args.kind, &args.namespace, name),
        None => WatchedKey::collection(&args.kind, &args.namespace),
    }
}

/// ListerWatcher that reaches a control plane entirely over HTTP
pub fn remote_lister(control_plane: &str) -> ListerWatcher {
    ListerWatcher::new(
        Arc::new(HttpStore::new(control_plane)),
        Arc::new(HttpRegistrar::new(control_plane)),
        Arc::new(RemoteBus::new(control_plane)),
    )
}

/// Print a snapshot of `key`, then every change event, until `stop` fires.
///
/// A failed list or watch is retried after `retry_backoff`.
pub async fn run_watch(
    lister: &ListerWatcher,
    key: &WatchedKey,
    retry_backoff: Duration,
    stop: CancellationToken,
) {
    loop {
        match list_and_watch(lister, key, stop.clone()).await {
            Ok(()) => break,
            Err(e) => warn!("Watch on {} failed, retrying in {:?}: {}", key, retry_backoff, e),
        }

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(retry_backoff) => {}
        }
    }
}

async fn list_and_watch(
    lister: &ListerWatcher,
    key: &WatchedKey,
    stop: CancellationToken,
) -> Result<(), WatchError> {
    let listed = lister.list(key).await?;
    print!("{}", format_listed(&listed));

    lister
        .watch(key, |event| println!("{}", format_event(&event)), stop)
        .await
}

/// Mirror `key` into a reconciled cache and print every cache change
pub async fn run_informer(
    lister: ListerWatcher,
    key: WatchedKey,
    config: InformerConfig,
    stop: CancellationToken,
) {
    let informer = Informer::<serde_json::Value>::new(lister, key, config)
        .on_change(|change| println!("{}", format_cache_change(&change)));
    informer.run(stop).await;
}
