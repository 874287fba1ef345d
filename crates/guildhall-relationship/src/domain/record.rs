//! Symmetric relationship records.

use chrono::{DateTime, Utc};
use guildhall_core::config::StrengthBounds;
use guildhall_core::error::DomainError;
use guildhall_core::guild::{EntityRef, GuildId, GuildScoped};
use guildhall_core::localized::LocalizedText;
use guildhall_core::ports::StrengthChange;
use serde::{Deserialize, Serialize};

/// An unordered pair of entities, stored sorted so `(a, b)` and `(b, a)`
/// name the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityPair {
    /// The smaller entity.
    pub a: EntityRef,
    /// The larger entity.
    pub b: EntityRef,
}

impl EntityPair {
    /// Canonicalizes two distinct entities.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if both refer to the same entity.
    pub fn new(x: EntityRef, y: EntityRef) -> Result<Self, DomainError> {
        if x == y {
            return Err(DomainError::Validation(format!(
                "an entity cannot have a relationship with itself ({x})"
            )));
        }
        let (a, b) = if x <= y { (x, y) } else { (y, x) };
        Ok(Self { a, b })
    }

    /// Whether `entity` is one side of the pair.
    #[must_use]
    pub fn contains(&self, entity: &EntityRef) -> bool {
        &self.a == entity || &self.b == entity
    }
}

/// Cache key of the record for `pair` and `relationship_type`.
#[must_use]
pub fn record_key(pair: &EntityPair, relationship_type: &str) -> String {
    format!("{}|{}|{relationship_type}", pair.a, pair.b)
}

/// The strength of one typed relationship between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    /// Owning guild, stamped on first write.
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    /// The canonical pair.
    pub pair: EntityPair,
    /// Relationship type tag (`trust`, `rivalry`, ...).
    pub relationship_type: String,
    /// Current strength, always within the configured bounds.
    pub strength: f64,
    /// Free-form description per locale.
    #[serde(default)]
    pub detail: LocalizedText,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl RelationshipRecord {
    /// Creates a neutral (strength 0) record.
    #[must_use]
    pub fn new(pair: EntityPair, relationship_type: &str, now: DateTime<Utc>) -> Self {
        Self {
            guild_id: None,
            pair,
            relationship_type: relationship_type.to_owned(),
            strength: 0.0,
            detail: LocalizedText::default(),
            updated_at: now,
        }
    }

    /// Applies `change`, clamped to `bounds`, and returns the prior strength.
    pub fn apply(
        &mut self,
        change: StrengthChange,
        bounds: StrengthBounds,
        now: DateTime<Utc>,
    ) -> f64 {
        let prior = self.strength;
        let target = match change {
            StrengthChange::Add(delta) => prior + delta,
            StrengthChange::Set(value) => value,
        };
        self.strength = bounds.clamp(target);
        self.updated_at = now;
        prior
    }
}

impl GuildScoped for RelationshipRecord {
    fn guild_id(&self) -> Option<GuildId> {
        self.guild_id
    }

    fn stamp_guild(&mut self, guild_id: GuildId) {
        self.guild_id = Some(guild_id);
    }

    fn cache_key(&self) -> String {
        record_key(&self.pair, &self.relationship_type)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use guildhall_core::guild::EntityKind;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()
    }

    fn hero() -> EntityRef {
        EntityRef::new("c-1", EntityKind::Character)
    }

    fn smith() -> EntityRef {
        EntityRef::new("npc-smith", EntityKind::Npc)
    }

    #[test]
    fn test_pair_is_order_independent() {
        let forward = EntityPair::new(hero(), smith()).unwrap();
        let backward = EntityPair::new(smith(), hero()).unwrap();

        assert_eq!(forward, backward);
        assert_eq!(record_key(&forward, "trust"), record_key(&backward, "trust"));
        assert!(forward.contains(&hero()));
    }

    #[test]
    fn test_self_relationship_is_rejected() {
        assert!(EntityPair::new(hero(), hero()).is_err());
    }

    #[test]
    fn test_apply_adds_sets_and_clamps() {
        let bounds = StrengthBounds::default();
        let mut record = RelationshipRecord::new(EntityPair::new(hero(), smith()).unwrap(), "trust", now());

        let prior = record.apply(StrengthChange::Add(30.0), bounds, now());
        assert_eq!(prior, 0.0);
        assert_eq!(record.strength, 30.0);

        record.apply(StrengthChange::Add(500.0), bounds, now());
        assert_eq!(record.strength, 100.0);

        record.apply(StrengthChange::Set(-250.0), bounds, now());
        assert_eq!(record.strength, -100.0);
    }
}
