//! Flushing and hydrating tenant caches through the persistence port.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::cache::TenantCache;
use crate::error::DomainError;
use crate::guild::{GuildId, GuildScoped};
use crate::isolation::TenantIsolationGuard;
use crate::ports::{PersistedRow, PersistenceService, RowKind};

/// Counts reported by a successful flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Rows upserted.
    pub upserted: usize,
    /// Rows deleted.
    pub deleted: usize,
}

impl FlushStats {
    /// Sums two flush results.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            upserted: self.upserted + other.upserted,
            deleted: self.deleted + other.deleted,
        }
    }
}

/// Drains the dirty set of `cache` for `guild` and writes the snapshot.
///
/// Keys whose entry is gone are deleted; the rest are upserted. If either
/// write fails the drained keys are marked dirty again so the next flush
/// retries them.
///
/// # Errors
///
/// Returns the persistence service's error (usually
/// `DomainError::Collaborator`), or `DomainError::Validation` if an entry
/// cannot be serialized.
pub async fn flush_cache<V>(
    cache: &TenantCache<V>,
    guild: GuildId,
    kind: RowKind,
    persistence: &dyn PersistenceService,
) -> Result<FlushStats, DomainError>
where
    V: Serialize + Clone,
{
    let keys = cache.drain_dirty(guild);
    if keys.is_empty() {
        return Ok(FlushStats::default());
    }

    let mut rows = Vec::new();
    let mut deleted = Vec::new();
    for (key, value) in cache.snapshot(guild, &keys) {
        match value {
            Some(value) => match serde_json::to_value(&value) {
                Ok(data) => rows.push(PersistedRow { kind, key, data }),
                Err(e) => {
                    cache.mark_dirty(guild, keys.iter().cloned());
                    return Err(DomainError::Validation(format!(
                        "failed to serialize {kind:?} row {key}: {e}"
                    )));
                }
            },
            None => deleted.push(key),
        }
    }

    let stats = FlushStats {
        upserted: rows.len(),
        deleted: deleted.len(),
    };

    let result = async {
        if !rows.is_empty() {
            persistence.upsert_batch(guild, rows).await?;
        }
        if !deleted.is_empty() {
            persistence.delete_batch(guild, kind, deleted).await?;
        }
        Ok::<(), DomainError>(())
    }
    .await;

    match result {
        Ok(()) => {
            debug!(%guild, ?kind, upserted = stats.upserted, deleted = stats.deleted, "flushed cache");
            Ok(stats)
        }
        Err(e) => {
            warn!(%guild, ?kind, error = %e, keys = keys.len(), "flush failed, restoring dirty marks");
            cache.mark_dirty(guild, keys);
            Err(e)
        }
    }
}

/// Loads persisted rows of `kind` into `cache` without marking them dirty.
///
/// Every row is verified against `guild` before anything is inserted.
///
/// # Errors
///
/// Returns `DomainError::Validation` if a row cannot be deserialized and
/// `DomainError::TenantViolation` if a row belongs to another guild.
pub fn hydrate_cache<V>(
    cache: &TenantCache<V>,
    guild: GuildId,
    kind: RowKind,
    rows: &[PersistedRow],
) -> Result<usize, DomainError>
where
    V: DeserializeOwned + GuildScoped + Clone,
{
    let mut entities = Vec::new();
    for row in rows.iter().filter(|row| row.kind == kind) {
        let entity: V = serde_json::from_value(row.data.clone()).map_err(|e| {
            DomainError::Validation(format!("failed to deserialize {kind:?} row {}: {e}", row.key))
        })?;
        TenantIsolationGuard::check(guild, &entity)?;
        entities.push(entity);
    }

    let count = entities.len();
    for entity in entities {
        cache.insert_clean(guild, entity.cache_key(), entity);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        guild_id: Option<GuildId>,
        name: String,
        value: i64,
    }

    impl GuildScoped for Counter {
        fn guild_id(&self) -> Option<GuildId> {
            self.guild_id
        }

        fn stamp_guild(&mut self, guild_id: GuildId) {
            self.guild_id = Some(guild_id);
        }

        fn cache_key(&self) -> String {
            self.name.clone()
        }
    }

    #[derive(Default)]
    struct Store {
        fail: bool,
        upserts: Mutex<Vec<PersistedRow>>,
        deletes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PersistenceService for Store {
        async fn load_guild_state(
            &self,
            _guild: GuildId,
        ) -> Result<Vec<PersistedRow>, DomainError> {
            Ok(Vec::new())
        }

        async fn upsert_batch(
            &self,
            _guild: GuildId,
            rows: Vec<PersistedRow>,
        ) -> Result<(), DomainError> {
            if self.fail {
                return Err(DomainError::Collaborator("connection refused".into()));
            }
            self.upserts.lock().unwrap().extend(rows);
            Ok(())
        }

        async fn delete_batch(
            &self,
            _guild: GuildId,
            _kind: RowKind,
            keys: Vec<String>,
        ) -> Result<(), DomainError> {
            self.deletes.lock().unwrap().extend(keys);
            Ok(())
        }
    }

    const G1: GuildId = GuildId(1);

    fn counter(name: &str, guild: u64) -> Counter {
        Counter {
            guild_id: Some(GuildId(guild)),
            name: name.to_owned(),
            value: 1,
        }
    }

    #[tokio::test]
    async fn test_flush_upserts_present_and_deletes_absent_keys() {
        let cache = TenantCache::new();
        cache.put(G1, "a", counter("a", 1));
        cache.delete(G1, "b");
        let store = Store::default();

        let stats = flush_cache(&cache, G1, RowKind::QuestLog, &store)
            .await
            .unwrap();

        assert_eq!(stats, FlushStats { upserted: 1, deleted: 1 });
        assert_eq!(store.upserts.lock().unwrap()[0].key, "a");
        assert_eq!(*store.deletes.lock().unwrap(), vec!["b".to_owned()]);
        assert!(cache.dirty_keys(G1).is_empty());
    }

    #[tokio::test]
    async fn test_failed_flush_restores_dirty_marks() {
        let cache = TenantCache::new();
        cache.put(G1, "a", counter("a", 1));
        let store = Store {
            fail: true,
            ..Store::default()
        };

        let result = flush_cache(&cache, G1, RowKind::QuestLog, &store).await;

        assert!(result.is_err());
        assert!(cache.dirty_keys(G1).contains("a"));
    }

    #[test]
    fn test_hydrate_rejects_rows_from_other_guild() {
        let cache: TenantCache<Counter> = TenantCache::new();
        let rows = vec![
            PersistedRow {
                kind: RowKind::QuestLog,
                key: "a".into(),
                data: serde_json::to_value(counter("a", 1)).unwrap(),
            },
            PersistedRow {
                kind: RowKind::QuestLog,
                key: "b".into(),
                data: serde_json::to_value(counter("b", 2)).unwrap(),
            },
        ];

        let result = hydrate_cache(&cache, G1, RowKind::QuestLog, &rows);

        assert!(matches!(result, Err(DomainError::TenantViolation { .. })));
        assert!(!cache.contains(G1, "a"));
    }

    #[test]
    fn test_hydrate_skips_other_row_kinds_and_stays_clean() {
        let cache: TenantCache<Counter> = TenantCache::new();
        let rows = vec![PersistedRow {
            kind: RowKind::QuestLog,
            key: "a".into(),
            data: serde_json::to_value(counter("a", 1)).unwrap(),
        }];

        let loaded = hydrate_cache(&cache, G1, RowKind::Relationship, &rows).unwrap();

        assert_eq!(loaded, 0);
        assert!(cache.values(G1).is_empty());
    }
}
