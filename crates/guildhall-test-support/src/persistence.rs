//! Test persistence: in-memory and failing `PersistenceService` doubles.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use guildhall_core::error::DomainError;
use guildhall_core::guild::GuildId;
use guildhall_core::ports::{PersistedRow, PersistenceService, RowKind};

/// A persistence service that keeps rows in memory, keyed by guild, kind and
/// key, and counts how often each operation ran.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    rows: Mutex<HashMap<GuildId, BTreeMap<(RowKind, String), PersistedRow>>>,
    loads: Mutex<Vec<GuildId>>,
    upsert_calls: Mutex<usize>,
    writes_down: AtomicBool,
}

impl InMemoryPersistence {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates a guild with rows, as if written by an earlier process.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn seed(&self, guild: GuildId, rows: Vec<PersistedRow>) {
        let mut all = self.rows.lock().unwrap();
        let guild_rows = all.entry(guild).or_default();
        for row in rows {
            guild_rows.insert((row.kind, row.key.clone()), row);
        }
    }

    /// Returns the stored row for `kind`/`key`, if any.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn row(&self, guild: GuildId, kind: RowKind, key: &str) -> Option<PersistedRow> {
        self.rows
            .lock()
            .unwrap()
            .get(&guild)
            .and_then(|rows| rows.get(&(kind, key.to_owned())).cloned())
    }

    /// Returns every stored row of `kind` for `guild`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn rows_of(&self, guild: GuildId, kind: RowKind) -> Vec<PersistedRow> {
        self.rows
            .lock()
            .unwrap()
            .get(&guild)
            .map(|rows| {
                rows.values()
                    .filter(|row| row.kind == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Guilds for which `load_guild_state` was called, in call order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn loads(&self) -> Vec<GuildId> {
        self.loads.lock().unwrap().clone()
    }

    /// Number of `upsert_batch` calls.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn upsert_calls(&self) -> usize {
        *self.upsert_calls.lock().unwrap()
    }

    /// While `down`, writes fail with a collaborator error; loads still work.
    pub fn set_writes_down(&self, down: bool) {
        self.writes_down.store(down, Ordering::SeqCst);
    }

    fn check_writes(&self) -> Result<(), DomainError> {
        if self.writes_down.load(Ordering::SeqCst) {
            return Err(DomainError::Collaborator("storage unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceService for InMemoryPersistence {
    async fn load_guild_state(&self, guild: GuildId) -> Result<Vec<PersistedRow>, DomainError> {
        self.loads.lock().unwrap().push(guild);
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&guild)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_batch(
        &self,
        guild: GuildId,
        rows: Vec<PersistedRow>,
    ) -> Result<(), DomainError> {
        *self.upsert_calls.lock().unwrap() += 1;
        self.check_writes()?;
        self.seed(guild, rows);
        Ok(())
    }

    async fn delete_batch(
        &self,
        guild: GuildId,
        kind: RowKind,
        keys: Vec<String>,
    ) -> Result<(), DomainError> {
        self.check_writes()?;
        if let Some(rows) = self.rows.lock().unwrap().get_mut(&guild) {
            for key in keys {
                rows.remove(&(kind, key));
            }
        }
        Ok(())
    }
}

/// A persistence service that always returns a collaborator error. Useful for
/// testing that failed flushes keep their dirty marks.
#[derive(Debug)]
pub struct FailingPersistence;

#[async_trait]
impl PersistenceService for FailingPersistence {
    async fn load_guild_state(&self, _guild: GuildId) -> Result<Vec<PersistedRow>, DomainError> {
        Err(DomainError::Collaborator("connection refused".into()))
    }

    async fn upsert_batch(
        &self,
        _guild: GuildId,
        _rows: Vec<PersistedRow>,
    ) -> Result<(), DomainError> {
        Err(DomainError::Collaborator("connection refused".into()))
    }

    async fn delete_batch(
        &self,
        _guild: GuildId,
        _kind: RowKind,
        _keys: Vec<String>,
    ) -> Result<(), DomainError> {
        Err(DomainError::Collaborator("connection refused".into()))
    }
}
