//! Ports to external collaborators.
//!
//! The engine depends on these services but does not implement them. Row
//! shapes are opaque JSON owned by the persistence adapter; the content
//! generator is untrusted and its output always passes through the
//! structured validator before anything else sees it.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::guild::{CharacterId, EntityRef, GuildId};

/// Named values describing an event, used by relationship rules.
pub type EventContext = BTreeMap<String, serde_json::Value>;

/// Known id sets passed to the structured validator (e.g. `"templates"`).
pub type ExistingIdSets = BTreeMap<String, BTreeSet<String>>;

/// The kind of entity a persisted row holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    /// An immutable quest template.
    QuestTemplate,
    /// A character's active and completed quests.
    QuestLog,
    /// A queued AI-content moderation request.
    ModerationRequest,
    /// A relationship record between two entities.
    Relationship,
    /// A relationship rule.
    RelationshipRule,
}

/// A JSON-compatible row exchanged with the persistence service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRow {
    /// Which manager owns the row.
    pub kind: RowKind,
    /// Cache key of the entity.
    pub key: String,
    /// Serialized entity.
    pub data: serde_json::Value,
}

/// Guild-state storage.
#[async_trait]
pub trait PersistenceService: Send + Sync {
    /// Loads every row stored for `guild`.
    async fn load_guild_state(&self, guild: GuildId) -> Result<Vec<PersistedRow>, DomainError>;

    /// Inserts or replaces the given rows.
    async fn upsert_batch(&self, guild: GuildId, rows: Vec<PersistedRow>)
    -> Result<(), DomainError>;

    /// Deletes rows of `kind` by key.
    async fn delete_batch(
        &self,
        guild: GuildId,
        kind: RowKind,
        keys: Vec<String>,
    ) -> Result<(), DomainError>;
}

/// LLM-backed content generation. Output is untrusted.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Generates a structured payload for `concept`.
    async fn generate(
        &self,
        guild: GuildId,
        concept: &str,
        hints: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, DomainError>;
}

/// Result status of a structured validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    /// Payload matched the expected shape.
    Valid,
    /// Payload was repaired into the expected shape.
    Autocorrected,
    /// Payload could not be used.
    Invalid,
}

impl ValidationStatus {
    /// Whether validated data may be materialized.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Valid | Self::Autocorrected)
    }
}

/// Outcome reported by the structured validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// Overall status.
    pub status: ValidationStatus,
    /// The validated (possibly corrected) payload.
    pub validated_data: Option<serde_json::Value>,
    /// Problems found, for logging.
    pub errors: Vec<String>,
    /// Whether a human must approve the payload before it goes live.
    pub requires_moderation: bool,
}

/// Shape validation for untrusted payloads.
#[async_trait]
pub trait StructuredValidator: Send + Sync {
    /// Validates `payload` against `expected_shape`.
    async fn validate(
        &self,
        payload: &serde_json::Value,
        expected_shape: &str,
        existing_ids: &ExistingIdSets,
    ) -> Result<ValidationOutcome, DomainError>;
}

/// Player-facing notifications. Fire-and-forget from the engine's view.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Notifies `character` about `event_kind`.
    async fn notify(
        &self,
        guild: GuildId,
        character: &CharacterId,
        event_kind: &str,
        payload: &serde_json::Value,
    ) -> Result<(), DomainError>;
}

/// Game-world state owned by other subsystems (stats, inventory, location,
/// status effects, experience, world events).
#[async_trait]
pub trait WorldGateway: Send + Sync {
    /// Adds `delta` to `stat` and returns the new value.
    async fn modify_stat(
        &self,
        guild: GuildId,
        target: &EntityRef,
        stat: &str,
        delta: f64,
    ) -> Result<f64, DomainError>;

    /// Gives `quantity` of `item_id` to `target`.
    async fn add_item(
        &self,
        guild: GuildId,
        target: &EntityRef,
        item_id: &str,
        quantity: u32,
    ) -> Result<(), DomainError>;

    /// Takes `quantity` of `item_id` from `target`.
    async fn remove_item(
        &self,
        guild: GuildId,
        target: &EntityRef,
        item_id: &str,
        quantity: u32,
    ) -> Result<(), DomainError>;

    /// Moves `target` to `location_id`.
    async fn change_location(
        &self,
        guild: GuildId,
        target: &EntityRef,
        location_id: &str,
    ) -> Result<(), DomainError>;

    /// Starts a world event.
    async fn start_event(
        &self,
        guild: GuildId,
        event_id: &str,
        params: &serde_json::Value,
    ) -> Result<(), DomainError>;

    /// Applies a status effect, optionally for a number of turns.
    async fn apply_status_effect(
        &self,
        guild: GuildId,
        target: &EntityRef,
        effect: &str,
        duration_turns: Option<u32>,
    ) -> Result<(), DomainError>;

    /// Awards experience points.
    async fn award_experience(
        &self,
        guild: GuildId,
        target: &EntityRef,
        amount: i64,
    ) -> Result<(), DomainError>;
}

/// How a relationship strength is changed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum StrengthChange {
    /// Add a delta to the current strength.
    Add(f64),
    /// Replace the current strength.
    Set(f64),
}

/// Entry point into the relationship subsystem for other components.
#[async_trait]
pub trait RelationshipGateway: Send + Sync {
    /// Applies `change` to the relationship of `relationship_type` between
    /// `a` and `b` and returns the resulting (clamped) strength.
    async fn adjust(
        &self,
        guild: GuildId,
        a: &EntityRef,
        b: &EntityRef,
        relationship_type: &str,
        change: StrengthChange,
    ) -> Result<f64, DomainError>;

    /// Fires a relationship event and returns how many records changed.
    async fn fire_event(
        &self,
        guild: GuildId,
        event_type: &str,
        context: &EventContext,
    ) -> Result<usize, DomainError>;
}
