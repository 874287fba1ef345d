//! Tenant isolation guard.
//!
//! The persistence layer is shared across guilds. Every write to a
//! [`TenantCache`] goes through [`TenantIsolationGuard::with_guild_scope`],
//! which stamps new entities with the active guild and rejects any tracked
//! entity that declares a different one. Nothing reaches the cache unless the
//! whole unit of work verifies.

use tracing::error;

use crate::cache::TenantCache;
use crate::error::DomainError;
use crate::guild::{GuildId, GuildScoped};

/// How an entity was touched inside a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Created inside this unit of work.
    New,
    /// Loaded earlier and changed inside this unit of work.
    Modified,
}

/// Collects the entities a guild-scoped operation wants to write.
#[derive(Debug)]
pub struct UnitOfWork<T> {
    guild_id: GuildId,
    tracked: Vec<(EntityState, T)>,
    removed: Vec<String>,
}

impl<T: GuildScoped> UnitOfWork<T> {
    fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            tracked: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// The guild this unit of work is scoped to.
    #[must_use]
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Tracks a newly created entity.
    pub fn add_new(&mut self, entity: T) {
        self.tracked.push((EntityState::New, entity));
    }

    /// Tracks a modified entity.
    pub fn add_modified(&mut self, entity: T) {
        self.tracked.push((EntityState::Modified, entity));
    }

    /// Schedules removal of the entity stored under `key`.
    pub fn remove(&mut self, key: impl Into<String>) {
        self.removed.push(key.into());
    }
}

/// Entities that passed verification, ready to be written.
#[derive(Debug)]
pub struct VerifiedChanges<T, R> {
    /// Value returned by the unit of work.
    pub output: R,
    /// Verified entities, all carrying the scoped guild id.
    pub entities: Vec<T>,
    /// Keys scheduled for removal.
    pub removed: Vec<String>,
}

/// Enforces that a unit of work only writes entities of its own guild.
#[derive(Debug, Clone, Copy, Default)]
pub struct TenantIsolationGuard;

impl TenantIsolationGuard {
    /// Runs `work` inside a guild scope and verifies everything it tracked.
    ///
    /// New entities without a guild id are stamped with `guild_id`. Any new or
    /// modified entity declaring another guild aborts the unit of work.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `work`, or
    /// `DomainError::TenantViolation` if a tracked entity belongs to another
    /// guild. In both cases nothing is returned for commit.
    pub fn with_guild_scope<T, R, F>(
        guild_id: GuildId,
        work: F,
    ) -> Result<VerifiedChanges<T, R>, DomainError>
    where
        T: GuildScoped,
        F: FnOnce(&mut UnitOfWork<T>) -> Result<R, DomainError>,
    {
        let mut unit = UnitOfWork::new(guild_id);
        let output = work(&mut unit)?;

        let mut entities = Vec::with_capacity(unit.tracked.len());
        for (state, mut entity) in unit.tracked {
            match (state, entity.guild_id()) {
                (EntityState::New, None) => entity.stamp_guild(guild_id),
                (_, Some(found)) if found != guild_id => {
                    error!(
                        expected = %guild_id,
                        found = %found,
                        key = %entity.cache_key(),
                        "cross-tenant write rejected"
                    );
                    return Err(DomainError::TenantViolation {
                        expected: guild_id,
                        found,
                        entity: entity.cache_key(),
                    });
                }
                (EntityState::Modified, None) => {
                    return Err(DomainError::Validation(format!(
                        "modified entity {} carries no guild id",
                        entity.cache_key()
                    )));
                }
                _ => {}
            }
            entities.push(entity);
        }

        Ok(VerifiedChanges {
            output,
            entities,
            removed: unit.removed,
        })
    }

    /// Verifies a single entity that is about to enter the cache from outside
    /// a unit of work (e.g. hydrated from persistence).
    ///
    /// # Errors
    ///
    /// Returns `DomainError::TenantViolation` if the entity declares another
    /// guild, or `DomainError::Validation` if it declares none.
    pub fn check<T: GuildScoped>(guild_id: GuildId, entity: &T) -> Result<(), DomainError> {
        match entity.guild_id() {
            Some(found) if found == guild_id => Ok(()),
            Some(found) => Err(DomainError::TenantViolation {
                expected: guild_id,
                found,
                entity: entity.cache_key(),
            }),
            None => Err(DomainError::Validation(format!(
                "entity {} carries no guild id",
                entity.cache_key()
            ))),
        }
    }
}

/// Runs a guild-scoped unit of work and commits the verified result to
/// `cache`, marking every written or removed key dirty.
///
/// # Errors
///
/// Propagates errors from [`TenantIsolationGuard::with_guild_scope`]; the
/// cache is untouched in that case.
pub fn write_scoped<V, R, F>(cache: &TenantCache<V>, guild_id: GuildId, work: F) -> Result<R, DomainError>
where
    V: GuildScoped + Clone,
    F: FnOnce(&mut UnitOfWork<V>) -> Result<R, DomainError>,
{
    let changes = TenantIsolationGuard::with_guild_scope(guild_id, work)?;
    for entity in changes.entities {
        cache.put(guild_id, entity.cache_key(), entity);
    }
    for key in changes.removed {
        cache.delete(guild_id, &key);
    }
    Ok(changes.output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Note {
        key: String,
        guild: Option<GuildId>,
    }

    impl Note {
        fn new(key: &str, guild: Option<GuildId>) -> Self {
            Self {
                key: key.to_owned(),
                guild,
            }
        }
    }

    impl GuildScoped for Note {
        fn guild_id(&self) -> Option<GuildId> {
            self.guild
        }

        fn stamp_guild(&mut self, guild_id: GuildId) {
            self.guild = Some(guild_id);
        }

        fn cache_key(&self) -> String {
            self.key.clone()
        }
    }

    const G1: GuildId = GuildId(1);
    const G2: GuildId = GuildId(2);

    #[test]
    fn test_untagged_new_entity_is_stamped_with_scope_guild() {
        let changes = TenantIsolationGuard::with_guild_scope(G1, |unit| {
            unit.add_new(Note::new("n-1", None));
            Ok(())
        })
        .unwrap();

        assert_eq!(changes.entities[0].guild, Some(G1));
    }

    #[test]
    fn test_new_entity_tagged_with_other_guild_is_rejected() {
        let result = TenantIsolationGuard::with_guild_scope(G1, |unit| {
            unit.add_new(Note::new("n-1", Some(G2)));
            Ok(())
        });

        match result.unwrap_err() {
            DomainError::TenantViolation {
                expected, found, ..
            } => {
                assert_eq!(expected, G1);
                assert_eq!(found, G2);
            }
            other => panic!("expected TenantViolation, got {other:?}"),
        }
    }

    #[test]
    fn test_modified_entity_tagged_with_other_guild_is_rejected() {
        let result = TenantIsolationGuard::with_guild_scope(G1, |unit| {
            unit.add_modified(Note::new("n-1", Some(G2)));
            Ok(())
        });

        assert!(result.unwrap_err().is_fatal());
    }

    #[test]
    fn test_violation_leaves_cache_untouched() {
        let cache = TenantCache::new();

        let result = write_scoped(&cache, G1, |unit| {
            unit.add_new(Note::new("ok", None));
            unit.add_new(Note::new("bad", Some(G2)));
            Ok(())
        });

        assert!(result.is_err());
        assert!(!cache.contains(G1, "ok"));
        assert!(cache.dirty_keys(G1).is_empty());
    }

    #[test]
    fn test_write_scoped_commits_and_marks_dirty() {
        let cache = TenantCache::new();
        cache.insert_clean(G1, "old", Note::new("old", Some(G1)));

        write_scoped(&cache, G1, |unit| {
            unit.add_new(Note::new("n-1", None));
            unit.remove("old");
            Ok(())
        })
        .unwrap();

        assert_eq!(cache.get(G1, "n-1").unwrap().guild, Some(G1));
        assert!(!cache.contains(G1, "old"));
        let dirty = cache.dirty_keys(G1);
        assert!(dirty.contains("n-1") && dirty.contains("old"));
    }

    #[test]
    fn test_check_rejects_hydrated_entity_from_other_guild() {
        let note = Note::new("n-1", Some(G2));

        assert!(TenantIsolationGuard::check(G1, &note).is_err());
        assert!(TenantIsolationGuard::check(G2, &note).is_ok());
    }
}
