//! Reconciliation cache
//!
//! A concurrently readable map of versioned objects fed by two independent
//! writers: watch events and periodic full-list resyncs. Every write goes
//! through [`select_newer`], so after any mix of the two settles each key
//! holds the highest version either path has seen.
//!
//! Deletes leave a tombstone at the delete's revision. A resync that was
//! read before the delete, and so still reports the key, cannot bring it
//! back.

pub mod informer;

pub use informer::{CacheChange, DecodeError, Informer, InformerConfig};

use std::collections::HashSet;
use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A value stamped with the store revision it was observed at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedObject<T> {
    pub version: i64,
    pub value: T,
}

impl<T> VersionedObject<T> {
    pub fn new(version: i64, value: T) -> Self {
        Self { version, value }
    }
}

/// The observation with the larger version. Ties go to `a`.
pub fn select_newer<T>(a: VersionedObject<T>, b: VersionedObject<T>) -> VersionedObject<T> {
    if b.version > a.version {
        b
    } else {
        a
    }
}

/// What a resync does with cached entries the sweep did not report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResyncPolicy {
    /// Drop them, as long as they are not newer than the sweep itself
    #[default]
    Prune,
    /// Keep them until a delete event arrives
    Retain,
}

/// Outcome of [`ReconciliationCache::merge_sweep`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport<K> {
    /// Keys whose cached value was inserted or replaced
    pub applied: Vec<K>,
    /// Rows ignored because the cache already held the same or a newer
    /// version, or a tombstone
    pub stale: usize,
    /// Live keys removed because the sweep no longer reported them
    pub pruned: Vec<K>,
    /// Tombstones dropped because the sweep superseded them
    pub collected: usize,
}

impl<K> Default for SweepReport<K> {
    fn default() -> Self {
        Self {
            applied: Vec::new(),
            stale: 0,
            pruned: Vec::new(),
            collected: 0,
        }
    }
}

#[derive(Debug, Clone)]
enum Slot<T> {
    Live(VersionedObject<T>),
    Tombstone(i64),
}

impl<T> Slot<T> {
    fn version(&self) -> i64 {
        match self {
            Slot::Live(obj) => obj.version,
            Slot::Tombstone(version) => *version,
        }
    }
}

/// Concurrent `K -> VersionedObject<T>` map with last-writer-wins by version
pub struct ReconciliationCache<K, T> {
    entries: DashMap<K, Slot<T>>,
}

impl<K, T> ReconciliationCache<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Current value for `key`, if live
    pub fn get(&self, key: &K) -> Option<VersionedObject<T>> {
        match self.entries.get(key)?.value() {
            Slot::Live(obj) => Some(obj.clone()),
            Slot::Tombstone(_) => None,
        }
    }

    /// Highest version recorded for `key`, live or deleted
    pub fn version(&self, key: &K) -> Option<i64> {
        self.entries.get(key).map(|slot| slot.version())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Store `incoming` unless the cache already holds something newer.
    ///
    /// An equal version replaces a live value but does not count as a
    /// change. A tombstone only yields to a strictly newer version. Returns
    /// true if the cache now holds a newer version than before.
    pub fn upsert(&self, key: K, incoming: VersionedObject<T>) -> bool {
        match self.entries.entry(key) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Live(incoming));
                true
            }
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get().version();
                match occupied.insert(Slot::Tombstone(stored)) {
                    Slot::Tombstone(_) if incoming.version <= stored => false,
                    Slot::Tombstone(_) => {
                        occupied.insert(Slot::Live(incoming));
                        true
                    }
                    Slot::Live(current) => {
                        let replaces = incoming.version > current.version;
                        occupied.insert(Slot::Live(select_newer(incoming, current)));
                        replaces
                    }
                }
            }
        }
    }

    /// Remove `key` unconditionally, leaving a tombstone at `revision` (or
    /// the removed value's version if that is higher).
    pub fn remove(&self, key: K, revision: i64) -> Option<VersionedObject<T>> {
        match self.entries.entry(key) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Tombstone(revision));
                None
            }
            Entry::Occupied(mut occupied) => {
                let tombstone = Slot::Tombstone(revision.max(occupied.get().version()));
                match occupied.insert(tombstone) {
                    Slot::Live(obj) => Some(obj),
                    Slot::Tombstone(_) => None,
                }
            }
        }
    }

    /// Merge a full listing taken at `sweep_revision`.
    ///
    /// Each row goes through [`ReconciliationCache::upsert`]. Keys the sweep
    /// did not report are handled per `policy`, but only when their version
    /// is at or below the sweep revision: anything newer arrived after the
    /// listing was read.
    pub fn merge_sweep<I>(&self, rows: I, sweep_revision: i64, policy: ResyncPolicy) -> SweepReport<K>
    where
        I: IntoIterator<Item = (K, VersionedObject<T>)>,
    {
        let mut report = SweepReport::default();
        let mut seen = HashSet::new();

        for (key, obj) in rows {
            seen.insert(key.clone());
            if self.upsert(key.clone(), obj) {
                report.applied.push(key);
            } else {
                report.stale += 1;
            }
        }

        self.entries.retain(|key, slot| {
            if seen.contains(key) || slot.version() > sweep_revision {
                return true;
            }
            match slot {
                Slot::Tombstone(_) => {
                    report.collected += 1;
                    false
                }
                Slot::Live(_) if policy == ResyncPolicy::Prune => {
                    report.pruned.push(key.clone());
                    false
                }
                Slot::Live(_) => true,
            }
        });

        report
    }

    /// Drop tombstones at or below `up_to`, returning how many went.
    ///
    /// Used when no resync runs to supersede them.
    pub fn collect_tombstones(&self, up_to: i64) -> usize {
        let mut collected = 0;
        self.entries.retain(|_, slot| match slot {
            Slot::Tombstone(version) if *version <= up_to => {
                collected += 1;
                false
            }
            _ => true,
        });
        collected
    }

    /// Highest version recorded for any key, live or deleted
    pub fn max_version(&self) -> Option<i64> {
        self.entries.iter().map(|entry| entry.value().version()).max()
    }

    /// Every live entry
    pub fn snapshot(&self) -> Vec<(K, VersionedObject<T>)> {
        self.entries
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Live(obj) => Some((entry.key().clone(), obj.clone())),
                Slot::Tombstone(_) => None,
            })
            .collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Live(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, T> Default for ReconciliationCache<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
