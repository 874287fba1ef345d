//! Consequence instructions and their typed validation.
//!
//! An instruction is plain data: an action tag, zero or more targets and a
//! JSON parameter map. [`ConsequenceInstruction::validate`] turns it into a
//! [`ValidatedAction`] whose parameters are typed, without touching any
//! collaborator.

use std::fmt;

use guildhall_core::error::DomainError;
use guildhall_core::guild::EntityRef;
use guildhall_core::ports::{EventContext, StrengthChange};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The action an instruction performs.
///
/// Built-in kinds are variants; any other tag is an extension resolved by
/// name from the handler registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    /// Add a delta to a character or NPC stat.
    ModifyStat,
    /// Give an item.
    AddItem,
    /// Take an item.
    RemoveItem,
    /// Move an entity.
    ChangeLocation,
    /// Start a world event.
    StartEvent,
    /// Start, complete, fail or cancel a quest.
    UpdateQuestState,
    /// Apply a status effect.
    ApplyStatusEffect,
    /// Award experience points.
    AwardExperience,
    /// Add to or set the strength of a relationship.
    ModifyRelationship,
    /// Fire a relationship rule event.
    RelationshipEvent,
    /// Call a named function from the custom-function registry.
    Custom,
    /// An action registered by name at startup.
    Extension(String),
}

impl ActionKind {
    /// The tag used in serialized instructions.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ModifyStat => "modify_stat",
            Self::AddItem => "add_item",
            Self::RemoveItem => "remove_item",
            Self::ChangeLocation => "change_location",
            Self::StartEvent => "start_event",
            Self::UpdateQuestState => "update_quest_state",
            Self::ApplyStatusEffect => "apply_status_effect",
            Self::AwardExperience => "award_experience",
            Self::ModifyRelationship => "modify_relationship",
            Self::RelationshipEvent => "relationship_event",
            Self::Custom => "custom",
            Self::Extension(name) => name,
        }
    }
}

impl From<&str> for ActionKind {
    fn from(tag: &str) -> Self {
        match tag {
            "modify_stat" => Self::ModifyStat,
            "add_item" => Self::AddItem,
            "remove_item" => Self::RemoveItem,
            "change_location" => Self::ChangeLocation,
            "start_event" => Self::StartEvent,
            "update_quest_state" => Self::UpdateQuestState,
            "apply_status_effect" => Self::ApplyStatusEffect,
            "award_experience" => Self::AwardExperience,
            "modify_relationship" => Self::ModifyRelationship,
            "relationship_event" => Self::RelationshipEvent,
            "custom" => Self::Custom,
            other => Self::Extension(other.to_owned()),
        }
    }
}

impl From<String> for ActionKind {
    fn from(tag: String) -> Self {
        Self::from(tag.as_str())
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        kind.as_str().to_owned()
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single, data-only description of a gameplay effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsequenceInstruction {
    /// What to do.
    pub action: ActionKind,
    /// Who it happens to. Empty means the dispatch target.
    #[serde(default)]
    pub targets: Vec<EntityRef>,
    /// Action-specific parameters.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl ConsequenceInstruction {
    /// Creates an instruction with no targets and no parameters.
    #[must_use]
    pub fn new(action: ActionKind) -> Self {
        Self {
            action,
            targets: Vec::new(),
            params: serde_json::Map::new(),
        }
    }

    /// Adds an explicit target.
    #[must_use]
    pub fn with_target(mut self, target: EntityRef) -> Self {
        self.targets.push(target);
        self
    }

    /// Sets a parameter.
    #[must_use]
    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_owned(), value.into());
        self
    }

    fn params_as<T: DeserializeOwned>(&self) -> Result<T, DomainError> {
        serde_json::from_value(serde_json::Value::Object(self.params.clone())).map_err(|e| {
            DomainError::Validation(format!("invalid parameters for {}: {e}", self.action))
        })
    }

    /// Checks the parameters of this instruction and returns the typed action.
    ///
    /// Validation is independent of any collaborator: it only looks at the
    /// instruction itself.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if a parameter is missing, has the
    /// wrong type, or is out of range.
    pub fn validate(&self) -> Result<ValidatedAction, DomainError> {
        let action = match &self.action {
            ActionKind::ModifyStat => {
                let params: ModifyStat = self.params_as()?;
                require_non_blank("stat", &params.stat)?;
                if !params.delta.is_finite() {
                    return Err(DomainError::Validation("stat delta must be finite".into()));
                }
                ValidatedAction::ModifyStat(params)
            }
            ActionKind::AddItem => ValidatedAction::AddItem(self.item_params()?),
            ActionKind::RemoveItem => ValidatedAction::RemoveItem(self.item_params()?),
            ActionKind::ChangeLocation => {
                let params: ChangeLocation = self.params_as()?;
                require_non_blank("location_id", &params.location_id)?;
                ValidatedAction::ChangeLocation(params)
            }
            ActionKind::StartEvent => {
                let params: StartEvent = self.params_as()?;
                require_non_blank("event_id", &params.event_id)?;
                ValidatedAction::StartEvent(params)
            }
            ActionKind::UpdateQuestState => {
                let params: UpdateQuestState = self.params_as()?;
                if params.quest_id.is_none() && params.template_id.is_none() {
                    return Err(DomainError::Validation(
                        "update_quest_state needs quest_id or template_id".into(),
                    ));
                }
                if params.state == QuestStateAction::Start && params.template_id.is_none() {
                    return Err(DomainError::Validation(
                        "starting a quest needs template_id".into(),
                    ));
                }
                ValidatedAction::UpdateQuestState(params)
            }
            ActionKind::ApplyStatusEffect => {
                let params: ApplyStatusEffect = self.params_as()?;
                require_non_blank("effect", &params.effect)?;
                ValidatedAction::ApplyStatusEffect(params)
            }
            ActionKind::AwardExperience => {
                let params: AwardExperience = self.params_as()?;
                if params.amount == 0 {
                    return Err(DomainError::Validation(
                        "experience amount must not be zero".into(),
                    ));
                }
                ValidatedAction::AwardExperience(params)
            }
            ActionKind::ModifyRelationship => {
                let params: ModifyRelationship = self.params_as()?;
                require_non_blank("relationship_type", &params.relationship_type)?;
                if !params.amount.is_finite() {
                    return Err(DomainError::Validation(
                        "relationship amount must be finite".into(),
                    ));
                }
                if self.targets.len() > 2 {
                    return Err(DomainError::Validation(
                        "modify_relationship takes at most two targets".into(),
                    ));
                }
                ValidatedAction::ModifyRelationship(params)
            }
            ActionKind::RelationshipEvent => {
                let params: RelationshipEvent = self.params_as()?;
                require_non_blank("event_type", &params.event_type)?;
                ValidatedAction::RelationshipEvent(params)
            }
            ActionKind::Custom => {
                let params: CustomCall = self.params_as()?;
                require_non_blank("function", &params.function)?;
                ValidatedAction::Custom(params)
            }
            ActionKind::Extension(name) => ValidatedAction::Extension(name.clone()),
        };
        Ok(action)
    }

    fn item_params(&self) -> Result<ItemTransfer, DomainError> {
        let params: ItemTransfer = self.params_as()?;
        require_non_blank("item_id", &params.item_id)?;
        if params.quantity == 0 {
            return Err(DomainError::Validation("item quantity must be positive".into()));
        }
        Ok(params)
    }

    /// Whether this instruction needs at least one target entity.
    #[must_use]
    pub fn needs_target(&self) -> bool {
        !matches!(
            self.action,
            ActionKind::StartEvent
                | ActionKind::RelationshipEvent
                | ActionKind::Custom
                | ActionKind::Extension(_)
        )
    }
}

fn require_non_blank(field: &str, value: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::Validation(format!("{field} must not be blank")));
    }
    Ok(())
}

fn one() -> u32 {
    1
}

/// Parameters of `modify_stat`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModifyStat {
    /// Stat name.
    pub stat: String,
    /// Amount to add (negative to subtract).
    pub delta: f64,
}

/// Parameters of `add_item` and `remove_item`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ItemTransfer {
    /// Item id.
    pub item_id: String,
    /// Number of items, at least one.
    #[serde(default = "one")]
    pub quantity: u32,
}

/// Parameters of `change_location`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeLocation {
    /// Destination location id.
    pub location_id: String,
}

/// Parameters of `start_event`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartEvent {
    /// Event id.
    pub event_id: String,
    /// Extra event parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The quest transition requested by `update_quest_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestStateAction {
    /// Start a quest from a template.
    Start,
    /// Complete successfully.
    Complete,
    /// Complete as a failure.
    Fail,
    /// Cancel without consequences.
    Cancel,
}

/// Parameters of `update_quest_state`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateQuestState {
    /// Requested transition.
    pub state: QuestStateAction,
    /// The quest instance, if known.
    #[serde(default)]
    pub quest_id: Option<Uuid>,
    /// The template, used to start or to locate the active instance.
    #[serde(default)]
    pub template_id: Option<String>,
}

/// Parameters of `apply_status_effect`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApplyStatusEffect {
    /// Effect name.
    pub effect: String,
    /// Duration in turns; `None` until removed.
    #[serde(default)]
    pub duration_turns: Option<u32>,
}

/// Parameters of `award_experience`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AwardExperience {
    /// Experience points; negative values take experience away.
    pub amount: i64,
}

/// How `modify_relationship` applies its amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMode {
    /// Add to the current strength.
    #[default]
    Add,
    /// Replace the current strength.
    Set,
}

/// Parameters of `modify_relationship`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModifyRelationship {
    /// Relationship type tag.
    pub relationship_type: String,
    /// Add or set.
    #[serde(default)]
    pub mode: ChangeMode,
    /// Delta or absolute strength.
    pub amount: f64,
}

impl ModifyRelationship {
    /// The strength change this instruction describes.
    #[must_use]
    pub fn change(&self) -> StrengthChange {
        match self.mode {
            ChangeMode::Add => StrengthChange::Add(self.amount),
            ChangeMode::Set => StrengthChange::Set(self.amount),
        }
    }
}

/// Parameters of `relationship_event`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelationshipEvent {
    /// Event type used to select rules.
    pub event_type: String,
    /// Event context passed to the rules.
    #[serde(default)]
    pub context: EventContext,
}

/// Parameters of `custom`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CustomCall {
    /// Registered function name.
    pub function: String,
    /// Arguments passed to the function.
    #[serde(default)]
    pub args: serde_json::Value,
}

/// An instruction whose parameters passed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedAction {
    /// See [`ModifyStat`].
    ModifyStat(ModifyStat),
    /// See [`ItemTransfer`].
    AddItem(ItemTransfer),
    /// See [`ItemTransfer`].
    RemoveItem(ItemTransfer),
    /// See [`ChangeLocation`].
    ChangeLocation(ChangeLocation),
    /// See [`StartEvent`].
    StartEvent(StartEvent),
    /// See [`UpdateQuestState`].
    UpdateQuestState(UpdateQuestState),
    /// See [`ApplyStatusEffect`].
    ApplyStatusEffect(ApplyStatusEffect),
    /// See [`AwardExperience`].
    AwardExperience(AwardExperience),
    /// See [`ModifyRelationship`].
    ModifyRelationship(ModifyRelationship),
    /// See [`RelationshipEvent`].
    RelationshipEvent(RelationshipEvent),
    /// See [`CustomCall`].
    Custom(CustomCall),
    /// A registry-resolved extension; its handler validates its own params.
    Extension(String),
}
