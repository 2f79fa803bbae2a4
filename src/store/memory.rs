//! In-memory linearizable store with revision-stamped watches
//!
//! All writes are serialized behind one lock and stamped with a store-wide
//! revision, so watchers observe events in commit order. Not persisted.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::event::ChangeEvent;
use super::watch::WatchStream;
use super::{key_in_prefix, KeyValue, ListResult, StateStore, StoreError};

struct Watcher {
    id: u64,
    key: String,
    with_prefix: bool,
    tx: mpsc::Sender<ChangeEvent>,
    cancel: CancellationToken,
}

impl Watcher {
    fn matches(&self, key: &str) -> bool {
        if self.with_prefix {
            key_in_prefix(key, &self.key)
        } else {
            self.key == key
        }
    }

    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }
}

struct MemInner {
    data: BTreeMap<String, KeyValue>,
    revision: i64,
    watchers: Vec<Watcher>,
    next_watcher_id: u64,
    available: bool,
}

impl MemInner {
    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store is offline".to_string()))
        }
    }

    /// Deliver an event to every matching watcher, dropping dead or stalled ones
    fn notify(&mut self, event: ChangeEvent) {
        self.watchers.retain(|w| {
            if !w.is_live() {
                return false;
            }
            if !w.matches(&event.key) {
                return true;
            }
            match w.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Watcher {} on {} fell behind, closing its stream",
                        w.id, w.key
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// In-memory [`StateStore`]
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemInner {
                data: BTreeMap::new(),
                revision: 0,
                watchers: Vec::new(),
                next_watcher_id: 1,
                available: true,
            })),
        }
    }

    /// Current store revision
    pub async fn revision(&self) -> i64 {
        self.inner.read().await.revision
    }

    /// Take the store offline or bring it back.
    ///
    /// Going offline closes every open watch as a disconnect.
    pub async fn set_available(&self, available: bool) {
        let mut g = self.inner.write().await;
        g.available = available;
        if !available {
            g.watchers.clear();
        }
    }

    /// Close every open watch as if the connection dropped
    pub async fn disconnect_watches(&self) {
        self.inner.write().await.watchers.clear();
    }

    /// Number of watches currently open
    pub async fn active_watches(&self) -> usize {
        let g = self.inner.read().await;
        g.watchers.iter().filter(|w| w.is_live()).count()
    }

    /// Number of watches currently open on exactly this key and mode
    pub async fn active_watches_on(&self, key: &str, with_prefix: bool) -> usize {
        let g = self.inner.read().await;
        g.watchers
            .iter()
            .filter(|w| w.is_live() && w.key == key && w.with_prefix == with_prefix)
            .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let g = self.inner.read().await;
        g.ensure_available()?;
        Ok(g.data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64, StoreError> {
        let mut g = self.inner.write().await;
        g.ensure_available()?;

        g.revision += 1;
        let revision = g.revision;
        let (create_revision, version) = g
            .data
            .get(key)
            .map(|kv| (kv.create_revision, kv.version + 1))
            .unwrap_or((revision, 1));

        g.data.insert(
            key.to_string(),
            KeyValue {
                key: key.to_string(),
                value: value.clone(),
                create_revision,
                mod_revision: revision,
                version,
            },
        );
        g.notify(ChangeEvent::put(key, value, revision));

        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut g = self.inner.write().await;
        g.ensure_available()?;

        let Some(prev) = g.data.remove(key) else {
            return Ok(false);
        };
        g.revision += 1;
        let revision = g.revision;
        g.notify(ChangeEvent::delete(key, prev.value, revision));

        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<ListResult, StoreError> {
        let g = self.inner.read().await;
        g.ensure_available()?;

        let items = g
            .data
            .values()
            .filter(|kv| key_in_prefix(&kv.key, prefix))
            .cloned()
            .collect();

        Ok(ListResult {
            revision: g.revision,
            items,
        })
    }

    async fn watch(&self, key: &str, with_prefix: bool) -> Result<WatchStream, StoreError> {
        let mut g = self.inner.write().await;
        g.ensure_available()?;

        let cancel = CancellationToken::new();
        let (tx, stream) = WatchStream::channel(cancel.clone());
        let id = g.next_watcher_id;
        g.next_watcher_id += 1;

        // Drop watchers whose streams are gone before adding a new one
        g.watchers.retain(Watcher::is_live);
        g.watchers.push(Watcher {
            id,
            key: key.to_string(),
            with_prefix,
            tx,
            cancel,
        });

        debug!("Opened store watch {} on {} (prefix={})", id, key, with_prefix);
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EventKind, WatchTermination, WATCH_QUEUE_CAPACITY};

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();

        let rev = store.put("/registry/pod/default/web", b"v1".to_vec()).await.unwrap();
        let kv = store.get("/registry/pod/default/web").await.unwrap().unwrap();
        assert_eq!(kv.value, b"v1");
        assert_eq!(kv.mod_revision, rev);
        assert_eq!(kv.version, 1);

        assert!(store.delete("/registry/pod/default/web").await.unwrap());
        assert!(store.get("/registry/pod/default/web").await.unwrap().is_none());
        assert!(!store.delete("/registry/pod/default/web").await.unwrap());
    }

    #[tokio::test]
    async fn test_revisions_increase() {
        let store = MemoryStore::new();

        let r1 = store.put("/a", b"1".to_vec()).await.unwrap();
        let r2 = store.put("/a", b"2".to_vec()).await.unwrap();
        let kv = store.get("/a").await.unwrap().unwrap();

        assert!(r2 > r1);
        assert_eq!(kv.create_revision, r1);
        assert_eq!(kv.mod_revision, r2);
        assert_eq!(kv.version, 2);
    }

    #[tokio::test]
    async fn test_list_respects_segments() {
        let store = MemoryStore::new();
        store.put("/registry/pod/default/a", b"a".to_vec()).await.unwrap();
        store.put("/registry/pod/default/b", b"b".to_vec()).await.unwrap();
        store.put("/registry/pod/default-2/c", b"c".to_vec()).await.unwrap();

        let listed = store.list("/registry/pod/default").await.unwrap();
        assert_eq!(listed.items.len(), 2);
        assert_eq!(listed.revision, store.revision().await);

        let values = store.prefix_get("/registry/pod").await.unwrap();
        assert_eq!(values.len(), 3);
    }

    #[tokio::test]
    async fn test_point_and_prefix_watch() {
        let store = MemoryStore::new();
        let mut point = store.watch("/registry/pod/default/a", false).await.unwrap();
        let mut prefix = store.watch("/registry/pod/default", true).await.unwrap();

        store.put("/registry/pod/default/a", b"a".to_vec()).await.unwrap();
        store.put("/registry/pod/default/b", b"b".to_vec()).await.unwrap();
        store.delete("/registry/pod/default/a").await.unwrap();

        let first = point.next().await.unwrap();
        assert_eq!(first.kind, EventKind::Put);
        let second = point.next().await.unwrap();
        assert_eq!(second.kind, EventKind::Delete);
        assert_eq!(second.value, b"a");

        let keys: Vec<String> = vec![
            prefix.next().await.unwrap().key,
            prefix.next().await.unwrap().key,
            prefix.next().await.unwrap().key,
        ];
        assert_eq!(
            keys,
            vec![
                "/registry/pod/default/a",
                "/registry/pod/default/b",
                "/registry/pod/default/a"
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_removes_watch() {
        let store = MemoryStore::new();
        let stream = store.watch("/a", false).await.unwrap();
        assert_eq!(store.active_watches().await, 1);

        stream.cancel();
        assert_eq!(store.active_watches().await, 0);
    }

    #[tokio::test]
    async fn test_outage_fails_ops_and_disconnects() {
        let store = MemoryStore::new();
        let mut stream = store.watch("/a", false).await.unwrap();

        store.set_available(false).await;

        assert!(matches!(
            store.put("/a", vec![]).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.watch("/a", false).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(stream.next().await.is_none());
        assert_eq!(stream.termination(), WatchTermination::Disconnected);

        store.set_available(true).await;
        assert!(store.put("/a", vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn test_stalled_watcher_is_dropped() {
        let store = MemoryStore::new();
        let mut stream = store.watch("/a", false).await.unwrap();

        for i in 0..=WATCH_QUEUE_CAPACITY {
            store.put("/a", vec![i as u8]).await.unwrap();
        }

        let mut received = 0;
        while stream.next().await.is_some() {
            received += 1;
        }
        assert_eq!(received, WATCH_QUEUE_CAPACITY);
        assert_eq!(stream.termination(), WatchTermination::Disconnected);
    }
}
