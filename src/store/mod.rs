//! # Cluster state store
//!
//! Thin adapter contract over a linearizable key-value store. Every write
//! bumps a store-wide revision; the revision at which a key was last written
//! (`mod_revision`) is the version consumers use for conflict resolution.
//!
//! Keys follow the registry layout:
//!
//! ```text
//! /registry/<kind>/<namespace>/<name>   point key
//! /registry/<kind>/<namespace>          collection prefix
//! ```

pub mod event;
pub mod http;
pub mod memory;
pub mod watch;

pub use event::{ChangeEvent, EventKind, EVENT_CONTENT_TYPE};
pub use http::HttpStore;
pub use memory::MemoryStore;
pub use watch::{WatchStream, WatchTermination, WATCH_QUEUE_CAPACITY};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Root of every key the control plane writes
pub const REGISTRY_ROOT: &str = "/registry";

/// Errors surfaced by a state store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("State store unavailable: {0}")]
    Unavailable(String),

    #[error("Operation not supported by this store: {0}")]
    Unsupported(String),
}

/// A stored key with its revision metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,

    #[serde(with = "event::base64_bytes")]
    pub value: Vec<u8>,

    /// Revision of the write that created the key
    #[serde(rename = "createRevision")]
    pub create_revision: i64,

    /// Revision of the latest write to the key
    #[serde(rename = "modRevision")]
    pub mod_revision: i64,

    /// Number of writes since creation
    pub version: i64,
}

/// Snapshot of every key under a prefix
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListResult {
    /// Store revision the snapshot was taken at
    pub revision: i64,

    pub items: Vec<KeyValue>,
}

/// Key-value contract consumed by the watch relay and its clients
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a single key; `None` when absent
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError>;

    /// Write a key, returning the revision of the write
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64, StoreError>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Consistent snapshot of all keys starting with `prefix`
    async fn list(&self, prefix: &str) -> Result<ListResult, StoreError>;

    /// Open a live watch on `key`, or on every key under it when `with_prefix`
    async fn watch(&self, key: &str, with_prefix: bool) -> Result<WatchStream, StoreError>;

    /// Values under a prefix, in no particular order
    async fn prefix_get(&self, prefix: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let listed = self.list(prefix).await?;
        Ok(listed.items.into_iter().map(|kv| kv.value).collect())
    }
}

/// Check whether `key` falls under `prefix` in the registry layout
///
/// Matching is by path segment, so `/registry/pod/default` covers
/// `/registry/pod/default/web` but not `/registry/pod/default-2/web`.
pub fn key_in_prefix(key: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match key.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.is_empty(),
        None => false,
    }
}
