//! Per-guild keyed storage with a parallel dirty set.
//!
//! Every stateful manager keeps its entities in a [`TenantCache`]. Writes mark
//! the key dirty; the persistence flush drains the dirty set, writes a
//! snapshot of the matching entries, and re-marks the keys if the write fails.
//!
//! The internal mutex is only held for the duration of a single synchronous
//! read or write, never across an await point.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::guild::GuildId;

#[derive(Debug)]
struct GuildShard<V> {
    entries: HashMap<String, V>,
    dirty: BTreeSet<String>,
}

impl<V> Default for GuildShard<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            dirty: BTreeSet::new(),
        }
    }
}

/// Guild-sharded in-memory store.
#[derive(Debug)]
pub struct TenantCache<V> {
    shards: Mutex<HashMap<GuildId, GuildShard<V>>>,
}

impl<V> Default for TenantCache<V> {
    fn default() -> Self {
        Self {
            shards: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> TenantCache<V> {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn shards(&self) -> MutexGuard<'_, HashMap<GuildId, GuildShard<V>>> {
        self.shards.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a clone of the value stored under `key`.
    #[must_use]
    pub fn get(&self, guild: GuildId, key: &str) -> Option<V> {
        self.shards()
            .get(&guild)
            .and_then(|shard| shard.entries.get(key).cloned())
    }

    /// Returns `true` if `key` is present for `guild`.
    #[must_use]
    pub fn contains(&self, guild: GuildId, key: &str) -> bool {
        self.shards()
            .get(&guild)
            .is_some_and(|shard| shard.entries.contains_key(key))
    }

    /// Stores `value` under `key` and marks the key dirty.
    pub fn put(&self, guild: GuildId, key: impl Into<String>, value: V) {
        let key = key.into();
        let mut shards = self.shards();
        let shard = shards.entry(guild).or_default();
        shard.dirty.insert(key.clone());
        shard.entries.insert(key, value);
    }

    /// Stores `value` without marking it dirty. Used when hydrating the cache
    /// from persisted state.
    pub fn insert_clean(&self, guild: GuildId, key: impl Into<String>, value: V) {
        self.shards()
            .entry(guild)
            .or_default()
            .entries
            .insert(key.into(), value);
    }

    /// Removes `key`, marks it dirty, and returns the previous value.
    pub fn delete(&self, guild: GuildId, key: &str) -> Option<V> {
        let mut shards = self.shards();
        let shard = shards.entry(guild).or_default();
        shard.dirty.insert(key.to_owned());
        shard.entries.remove(key)
    }

    /// Atomically returns and clears the dirty set for `guild`.
    ///
    /// Clearing is optimistic: if the subsequent persistence write fails the
    /// caller must hand the keys back through [`TenantCache::mark_dirty`].
    pub fn drain_dirty(&self, guild: GuildId) -> BTreeSet<String> {
        self.shards()
            .get_mut(&guild)
            .map(|shard| std::mem::take(&mut shard.dirty))
            .unwrap_or_default()
    }

    /// Marks the given keys dirty.
    pub fn mark_dirty<I, K>(&self, guild: GuildId, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let mut shards = self.shards();
        let shard = shards.entry(guild).or_default();
        shard.dirty.extend(keys.into_iter().map(Into::into));
    }

    /// Returns the current dirty keys without clearing them.
    #[must_use]
    pub fn dirty_keys(&self, guild: GuildId) -> BTreeSet<String> {
        self.shards()
            .get(&guild)
            .map(|shard| shard.dirty.clone())
            .unwrap_or_default()
    }

    /// Clears the dirty set for `guild` without returning it.
    pub fn clear_dirty(&self, guild: GuildId) {
        if let Some(shard) = self.shards().get_mut(&guild) {
            shard.dirty.clear();
        }
    }

    /// Reads the current value (or absence) of each key, for a flush.
    #[must_use]
    pub fn snapshot<'a, I>(&self, guild: GuildId, keys: I) -> Vec<(String, Option<V>)>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let shards = self.shards();
        let shard = shards.get(&guild);
        keys.into_iter()
            .map(|key| {
                let value = shard.and_then(|s| s.entries.get(key).cloned());
                (key.clone(), value)
            })
            .collect()
    }

    /// Returns clones of all values stored for `guild`.
    #[must_use]
    pub fn values(&self, guild: GuildId) -> Vec<V> {
        self.shards()
            .get(&guild)
            .map(|shard| shard.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the guilds that currently hold entries or dirty keys.
    #[must_use]
    pub fn guilds(&self) -> Vec<GuildId> {
        let mut guilds: Vec<GuildId> = self.shards().keys().copied().collect();
        guilds.sort();
        guilds
    }

    /// Drops every entry and dirty mark for `guild`.
    pub fn evict_guild(&self, guild: GuildId) {
        self.shards().remove(&guild);
    }
}
