//! Read-only relationship queries.

use guildhall_core::error::DomainError;
use guildhall_core::guild::{EntityRef, GuildId};

use super::evaluator::RelationshipRuleEvaluator;
use crate::domain::record::{EntityPair, RelationshipRecord, record_key};

impl RelationshipRuleEvaluator {
    /// The record of `relationship_type` between `a` and `b`, in either
    /// order.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if `a` and `b` are the same entity.
    pub fn get_relationship(
        &self,
        guild: GuildId,
        a: &EntityRef,
        b: &EntityRef,
        relationship_type: &str,
    ) -> Result<Option<RelationshipRecord>, DomainError> {
        let pair = EntityPair::new(a.clone(), b.clone())?;
        Ok(self.records.get(guild, &record_key(&pair, relationship_type)))
    }

    /// Every record `entity` takes part in, ordered by pair and type.
    #[must_use]
    pub fn relationships_for(&self, guild: GuildId, entity: &EntityRef) -> Vec<RelationshipRecord> {
        let mut records: Vec<RelationshipRecord> = self
            .records
            .values(guild)
            .into_iter()
            .filter(|record| record.pair.contains(entity))
            .collect();
        records.sort_by(|x, y| {
            (&x.pair, &x.relationship_type).cmp(&(&y.pair, &y.relationship_type))
        });
        records
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use guildhall_core::config::StrengthBounds;
    use guildhall_core::guild::EntityKind;
    use guildhall_core::ports::StrengthChange;
    use guildhall_test_support::fixed_clock;

    use super::*;

    const GUILD: GuildId = GuildId(1);

    #[test]
    fn test_relationships_for_lists_both_sides() {
        // Arrange
        let evaluator =
            RelationshipRuleEvaluator::new(StrengthBounds::default(), Arc::new(fixed_clock()));
        let hero = EntityRef::new("c-1", EntityKind::Character);
        let smith = EntityRef::new("npc-smith", EntityKind::Npc);
        let guard = EntityRef::new("faction-guard", EntityKind::Faction);
        evaluator
            .adjust_strength(GUILD, &smith, &hero, "trust", StrengthChange::Add(5.0))
            .unwrap();
        evaluator
            .adjust_strength(GUILD, &hero, &guard, "rivalry", StrengthChange::Set(-20.0))
            .unwrap();
        evaluator
            .adjust_strength(GUILD, &smith, &guard, "trust", StrengthChange::Add(1.0))
            .unwrap();

        // Act
        let records = evaluator.relationships_for(GUILD, &hero);

        // Assert
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.pair.contains(&hero)));
        assert_eq!(evaluator.relationships_for(GUILD, &smith).len(), 2);
    }

    #[test]
    fn test_get_relationship_for_unknown_pair_is_none() {
        let evaluator =
            RelationshipRuleEvaluator::new(StrengthBounds::default(), Arc::new(fixed_clock()));
        let hero = EntityRef::new("c-1", EntityKind::Character);
        let smith = EntityRef::new("npc-smith", EntityKind::Npc);

        let record = evaluator.get_relationship(GUILD, &hero, &smith, "trust").unwrap();

        assert!(record.is_none());
    }
}
