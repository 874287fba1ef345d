//! Relationship rules: which events change which relationships, and by
//! how much.

use guildhall_core::error::DomainError;
use guildhall_core::guild::{EntityKind, EntityRef, GuildId, GuildScoped};
use guildhall_core::localized::LocalizedText;
use guildhall_core::ports::{EventContext, StrengthChange};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::expression::{CURRENT_STRENGTH, Expression};

/// Names one side of a rule change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntitySelector {
    /// The entity whose id is stored in an event context field.
    Field {
        /// Context key holding the id.
        field: String,
        /// Kind of the entity.
        kind: EntityKind,
    },
    /// A fixed entity, e.g. a faction.
    Fixed {
        /// Entity id.
        id: String,
        /// Kind of the entity.
        kind: EntityKind,
    },
}

impl EntitySelector {
    /// Reads the id from `field` of the event context.
    #[must_use]
    pub fn field(field: &str, kind: EntityKind) -> Self {
        Self::Field {
            field: field.to_owned(),
            kind,
        }
    }

    /// Resolves against `context`; `None` when the field is missing, empty
    /// or not a scalar.
    #[must_use]
    pub fn resolve(&self, context: &EventContext) -> Option<EntityRef> {
        match self {
            Self::Fixed { id, kind } => Some(EntityRef::new(id.clone(), *kind)),
            Self::Field { field, kind } => {
                let id = match context.get(field)? {
                    Value::String(s) if !s.trim().is_empty() => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                Some(EntityRef::new(id, *kind))
            }
        }
    }
}

/// Whether a change adds its magnitude or replaces the strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Add the magnitude as a delta.
    #[default]
    Add,
    /// Set the strength to the magnitude.
    Set,
}

impl UpdateMode {
    /// The strength change for `magnitude`.
    #[must_use]
    pub fn change(self, magnitude: f64) -> StrengthChange {
        match self {
            Self::Add => StrengthChange::Add(magnitude),
            Self::Set => StrengthChange::Set(magnitude),
        }
    }
}

/// One relationship adjustment performed when a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleChange {
    /// First entity.
    pub entity_a: EntitySelector,
    /// Second entity.
    pub entity_b: EntitySelector,
    /// Relationship type tag.
    pub relationship_type: String,
    /// Add or set.
    #[serde(default)]
    pub mode: UpdateMode,
    /// Magnitude; may reference event fields and `current_strength`.
    pub formula: Expression,
    /// Replaces the record's detail text when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<LocalizedText>,
}

/// A rule reacting to one event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRule {
    /// Owning guild, stamped on install.
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    /// Unique rule id.
    pub id: String,
    /// Event type the rule listens to (`quest_completed`, ...).
    pub event_type: String,
    /// The rule fires only when this evaluates to true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expression>,
    /// Applied in order when the rule fires.
    pub changes: Vec<RuleChange>,
}

impl RelationshipRule {
    /// Structural checks beyond what deserialization enforces.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` describing the first problem.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.id.trim().is_empty() {
            return Err(DomainError::Validation("rule id must not be empty".into()));
        }
        if self.event_type.trim().is_empty() {
            return Err(DomainError::Validation(format!(
                "rule {} has no event type",
                self.id
            )));
        }
        if self.changes.is_empty() {
            return Err(DomainError::Validation(format!(
                "rule {} has no changes",
                self.id
            )));
        }
        if self
            .condition
            .as_ref()
            .is_some_and(|condition| condition.references(CURRENT_STRENGTH))
        {
            return Err(DomainError::Validation(format!(
                "rule {} reads {CURRENT_STRENGTH} in its condition; it is only bound in formulas",
                self.id
            )));
        }
        for change in &self.changes {
            if change.relationship_type.trim().is_empty() {
                return Err(DomainError::Validation(format!(
                    "rule {} has a change without a relationship type",
                    self.id
                )));
            }
            if change.entity_a == change.entity_b {
                return Err(DomainError::Validation(format!(
                    "rule {} relates an entity to itself",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

impl GuildScoped for RelationshipRule {
    fn guild_id(&self) -> Option<GuildId> {
        self.guild_id
    }

    fn stamp_guild(&mut self, guild_id: GuildId) {
        self.guild_id = Some(guild_id);
    }

    fn cache_key(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn context() -> EventContext {
        let mut context = EventContext::new();
        context.insert("character_id".into(), json!("c-1"));
        context.insert("npc_id".into(), json!(""));
        context.insert("level".into(), json!(7));
        context
    }

    #[test]
    fn test_rule_deserializes_from_json() {
        let rule: RelationshipRule = serde_json::from_value(json!({
            "id": "reward-trust",
            "event_type": "quest_completed",
            "condition": "outcome == 'success'",
            "changes": [{
                "entity_a": { "field": "character_id", "kind": "character" },
                "entity_b": { "id": "npc-giver", "kind": "npc" },
                "relationship_type": "trust",
                "formula": "xp * 0.1"
            }]
        }))
        .unwrap();

        assert_eq!(rule.changes[0].mode, UpdateMode::Add);
        assert_eq!(rule.condition.as_ref().unwrap().source(), "outcome == 'success'");
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_malformed_formula_fails_deserialization() {
        let result: Result<RelationshipRule, _> = serde_json::from_value(json!({
            "id": "broken",
            "event_type": "x",
            "changes": [{
                "entity_a": { "field": "a", "kind": "character" },
                "entity_b": { "field": "b", "kind": "npc" },
                "relationship_type": "trust",
                "formula": "xp *"
            }]
        }));

        assert!(result.is_err());
    }

    #[test]
    fn test_selector_resolution() {
        let context = context();

        assert_eq!(
            EntitySelector::field("character_id", EntityKind::Character).resolve(&context),
            Some(EntityRef::new("c-1", EntityKind::Character))
        );
        assert_eq!(
            EntitySelector::field("level", EntityKind::Npc).resolve(&context),
            Some(EntityRef::new("7", EntityKind::Npc))
        );
        assert_eq!(EntitySelector::field("npc_id", EntityKind::Npc).resolve(&context), None);
        assert_eq!(EntitySelector::field("missing", EntityKind::Npc).resolve(&context), None);
    }

    #[test]
    fn test_rule_without_changes_is_invalid() {
        let rule = RelationshipRule {
            guild_id: None,
            id: "empty".into(),
            event_type: "quest_completed".into(),
            condition: None,
            changes: Vec::new(),
        };

        assert!(matches!(rule.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn test_condition_reading_current_strength_is_invalid() {
        let rule: RelationshipRule = serde_json::from_value(json!({
            "id": "loyal-only",
            "event_type": "gift_given",
            "condition": "current_strength > 50",
            "changes": [{
                "entity_a": { "field": "character_id", "kind": "character" },
                "entity_b": { "id": "npc-giver", "kind": "npc" },
                "relationship_type": "trust",
                "formula": "current_strength + 1"
            }]
        }))
        .unwrap();

        assert!(matches!(rule.validate(), Err(DomainError::Validation(_))));
    }
}
