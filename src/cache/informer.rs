//! Informer - keeps a [`ReconciliationCache`] converged with the store
//!
//! Runs the list + watch cycle every consumer needs:
//! - List the key, decode every row and merge it as a sweep
//! - Watch the key through the relay, applying each event as it arrives
//! - Re-list on a fixed interval to heal events lost while reconnecting
//! - On any failure, back off and start the cycle again, forever
//!
//! The cache stays readable throughout and keeps its last-known contents
//! while the watch is down.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ReconciliationCache, ResyncPolicy, SweepReport, VersionedObject};
use crate::store::{ChangeEvent, EventKind};
use crate::watch::{ListerWatcher, WatchError, WatchedKey};

/// Default interval between full re-lists
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default delay before retrying a failed list + watch cycle
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Default age at which tombstones are dropped when periodic resync is off
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(60);

/// A payload that does not decode into the cached type
#[derive(Error, Debug)]
#[error("Failed to decode '{key}' at revision {revision}: {source}")]
pub struct DecodeError {
    pub key: String,
    pub revision: i64,
    #[source]
    pub source: serde_json::Error,
}

/// A change the informer made to its cache
#[derive(Debug, Clone, PartialEq)]
pub enum CacheChange<T> {
    Upserted {
        key: String,
        object: VersionedObject<T>,
    },
    Removed {
        key: String,
        last: Option<VersionedObject<T>>,
    },
}

/// Informer configuration
#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Interval between full re-lists; zero disables periodic resync
    pub resync_interval: Duration,

    /// Delay before retrying after a failed cycle
    pub retry_backoff: Duration,

    /// What a resync does with keys it no longer sees
    pub policy: ResyncPolicy,

    /// With periodic resync disabled, tombstones older than this are dropped
    pub tombstone_ttl: Duration,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            policy: ResyncPolicy::default(),
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
        }
    }
}

impl InformerConfig {
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_policy(mut self, policy: ResyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }
}

type ChangeCallback<T> = Arc<dyn Fn(CacheChange<T>) + Send + Sync>;

/// Watches one key (usually a collection) and mirrors it into a cache of `T`
pub struct Informer<T> {
    key: WatchedKey,
    lister: ListerWatcher,
    cache: Arc<ReconciliationCache<String, T>>,
    config: InformerConfig,
    on_change: Option<ChangeCallback<T>>,
}

impl<T> Clone for Informer<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            lister: self.lister.clone(),
            cache: self.cache.clone(),
            config: self.config.clone(),
            on_change: self.on_change.clone(),
        }
    }
}

impl<T> Informer<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(lister: ListerWatcher, key: WatchedKey, config: InformerConfig) -> Self {
        Self {
            key,
            lister,
            cache: Arc::new(ReconciliationCache::new()),
            config,
            on_change: None,
        }
    }

    /// Call `callback` for every change the informer makes to its cache
    pub fn on_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(CacheChange<T>) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(callback));
        self
    }

    pub fn key(&self) -> &WatchedKey {
        &self.key
    }

    /// The cache this informer maintains
    pub fn cache(&self) -> Arc<ReconciliationCache<String, T>> {
        self.cache.clone()
    }

    /// Decode a stored value into `T`
    pub fn decode(key: &str, revision: i64, bytes: &[u8]) -> Result<T, DecodeError> {
        serde_json::from_slice(bytes).map_err(|source| DecodeError {
            key: key.to_string(),
            revision,
            source,
        })
    }

    /// List the key once and merge the result into the cache
    pub async fn resync(&self) -> Result<SweepReport<String>, WatchError> {
        let snapshot = self.lister.snapshot(&self.key).await?;

        let rows: Vec<(String, VersionedObject<T>)> = snapshot
            .items
            .into_iter()
            .filter_map(|kv| match Self::decode(&kv.key, kv.mod_revision, &kv.value) {
                Ok(value) => Some((kv.key, VersionedObject::new(kv.mod_revision, value))),
                Err(e) => {
                    warn!("Skipping resync row: {}", e);
                    None
                }
            })
            .collect();

        let report = self
            .cache
            .merge_sweep(rows, snapshot.revision, self.config.policy);

        if let Some(callback) = &self.on_change {
            for key in &report.applied {
                if let Some(object) = self.cache.get(key) {
                    callback(CacheChange::Upserted {
                        key: key.clone(),
                        object,
                    });
                }
            }
            for key in &report.pruned {
                callback(CacheChange::Removed {
                    key: key.clone(),
                    last: None,
                });
            }
        }

        debug!(
            "Resync of {} at revision {}: {} applied, {} stale, {} pruned",
            self.key,
            snapshot.revision,
            report.applied.len(),
            report.stale,
            report.pruned.len()
        );
        Ok(report)
    }

    /// Apply one watch event to the cache
    pub fn apply(&self, event: ChangeEvent) -> Result<(), DecodeError> {
        apply_event(&self.cache, self.on_change.as_ref(), event)
    }

    /// Run list + watch cycles until `stop` fires
    pub async fn run(self, stop: CancellationToken) {
        let mut consecutive_failures = 0u32;

        info!(
            "Starting informer: key={}, resync={:?}, backoff={:?}",
            self.key, self.config.resync_interval, self.config.retry_backoff
        );

        loop {
            match self.run_cycle(&stop).await {
                Ok(()) => break,
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures > 1 {
                        error!(
                            "Informer for {} failed {} consecutive times: {}",
                            self.key, consecutive_failures, e
                        );
                    } else {
                        warn!("Informer for {} failed: {}", self.key, e);
                    }
                }
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_backoff) => {
                    debug!("Retrying list + watch for {}", self.key);
                }
            }
        }

        info!("Informer for {} stopped", self.key);
    }

    /// One list + watch cycle. Returns `Ok` only when `stop` fired.
    async fn run_cycle(&self, stop: &CancellationToken) -> Result<(), WatchError> {
        if stop.is_cancelled() {
            return Ok(());
        }

        self.resync().await?;

        let cycle = stop.child_token();
        let resync_task = {
            let this = self.clone();
            let cycle = cycle.clone();
            tokio::spawn(async move { this.resync_loop(cycle).await })
        };

        let cache = self.cache.clone();
        let on_change = self.on_change.clone();
        let handler = move |event: ChangeEvent| {
            if let Err(e) = apply_event(&cache, on_change.as_ref(), event) {
                warn!("Dropping event: {}", e);
            }
        };

        let result = self.lister.watch(&self.key, handler, cycle.clone()).await;

        cycle.cancel();
        if let Err(e) = resync_task.await {
            error!("Resync task for {} failed: {}", self.key, e);
        }
        result
    }

    async fn resync_loop(&self, stop: CancellationToken) {
        if self.config.resync_interval.is_zero() {
            return self.tombstone_loop(stop).await;
        }

        let mut ticker = tokio::time::interval(self.config.resync_interval);
        // The first tick completes immediately; the cycle already listed.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!("Periodic resync of {} failed: {}", self.key, e);
                    }
                }
            }
        }
    }

    /// Without resyncs nothing supersedes tombstones, so age them out: each
    /// tick drops those no newer than the highest version seen a tick ago.
    async fn tombstone_loop(&self, stop: CancellationToken) {
        if self.config.tombstone_ttl.is_zero() {
            return;
        }

        let mut ticker = tokio::time::interval(self.config.tombstone_ttl);
        ticker.tick().await;
        let mut horizon = self.cache.max_version();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(up_to) = horizon {
                        let collected = self.cache.collect_tombstones(up_to);
                        if collected > 0 {
                            debug!("Dropped {} tombstones of {} up to revision {}", collected, self.key, up_to);
                        }
                    }
                    horizon = self.cache.max_version();
                }
            }
        }
    }
}

fn apply_event<T>(
    cache: &ReconciliationCache<String, T>,
    on_change: Option<&ChangeCallback<T>>,
    event: ChangeEvent,
) -> Result<(), DecodeError>
where
    T: DeserializeOwned + Clone,
{
    if event.key.is_empty() {
        warn!("Dropping {} event without a key", event.kind);
        return Ok(());
    }

    match event.kind {
        EventKind::Put => {
            let value: T = serde_json::from_slice(&event.value).map_err(|source| DecodeError {
                key: event.key.clone(),
                revision: event.revision,
                source,
            })?;
            let object = VersionedObject::new(event.revision, value);
            if cache.upsert(event.key.clone(), object.clone()) {
                if let Some(callback) = on_change {
                    callback(CacheChange::Upserted {
                        key: event.key,
                        object,
                    });
                }
            }
        }
        EventKind::Delete => {
            let last = cache.remove(event.key.clone(), event.revision);
            if let Some(callback) = on_change {
                callback(CacheChange::Removed {
                    key: event.key,
                    last,
                });
            }
        }
    }
    Ok(())
}
