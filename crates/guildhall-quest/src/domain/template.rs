//! Quest templates and the content they share with instances.
//!
//! A [`QuestContent`] is the playable part of a quest: localized text,
//! objectives, rewards and the consequence lists fired on each trigger. The
//! same structure is used by authored templates, by live instances (which
//! embed a copy) and by AI-generated payloads awaiting moderation.

use std::collections::BTreeSet;

use guildhall_consequence::domain::instruction::{ActionKind, ConsequenceInstruction};
use guildhall_core::error::DomainError;
use guildhall_core::guild::{GuildId, GuildScoped};
use guildhall_core::localized::LocalizedText;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a quest's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Written by a game master or content author.
    #[default]
    Authored,
    /// Produced by the content generator and approved by a moderator.
    AiGenerated,
}

/// When an objective counts as satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionPredicate {
    /// Numeric progress reaches `value`. Progress accumulates.
    AtLeast {
        /// Threshold.
        value: f64,
    },
    /// Progress equals `value`. Progress is replaced.
    Equals {
        /// Expected value.
        value: Value,
    },
    /// Progress is `true`. Progress is replaced.
    Flag,
}

impl CompletionPredicate {
    /// Whether `progress` satisfies this predicate.
    #[must_use]
    pub fn is_satisfied(&self, progress: Option<&Value>) -> bool {
        match (self, progress) {
            (_, None) => false,
            (Self::AtLeast { value }, Some(progress)) => {
                progress.as_f64().is_some_and(|current| current >= *value)
            }
            (Self::Equals { value }, Some(progress)) => progress == value,
            (Self::Flag, Some(progress)) => progress.as_bool() == Some(true),
        }
    }

    /// Whether updates add to the current progress instead of replacing it.
    #[must_use]
    pub fn accumulates(&self) -> bool {
        matches!(self, Self::AtLeast { .. })
    }
}

/// One step of a quest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    /// Identifier, unique within the quest.
    pub id: String,
    /// Objective kind tag (`collect`, `defeat`, `visit`, ...).
    pub kind: String,
    /// What the objective is about (item, NPC, location id).
    pub target: String,
    /// When the objective is satisfied.
    pub completion: CompletionPredicate,
}

impl Objective {
    /// Creates an objective that completes once progress reaches `count`.
    #[must_use]
    pub fn at_least(id: &str, kind: &str, target: &str, count: f64) -> Self {
        Self {
            id: id.to_owned(),
            kind: kind.to_owned(),
            target: target.to_owned(),
            completion: CompletionPredicate::AtLeast { value: count },
        }
    }

    /// Creates an objective that completes when its flag is set.
    #[must_use]
    pub fn flag(id: &str, kind: &str, target: &str) -> Self {
        Self {
            id: id.to_owned(),
            kind: kind.to_owned(),
            target: target.to_owned(),
            completion: CompletionPredicate::Flag,
        }
    }
}

/// An item granted on successful completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardItem {
    /// Item id.
    pub item_id: String,
    /// Quantity.
    #[serde(default = "one")]
    pub quantity: u32,
}

fn one() -> u32 {
    1
}

/// Rewards granted on successful completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSpec {
    /// Experience points.
    #[serde(default)]
    pub experience: i64,
    /// Items.
    #[serde(default)]
    pub items: Vec<RewardItem>,
}

impl RewardSpec {
    /// Whether there is nothing to grant.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.experience == 0 && self.items.is_empty()
    }

    /// Expands the rewards into consequence instructions aimed at the
    /// dispatch target.
    #[must_use]
    pub fn to_instructions(&self) -> Vec<ConsequenceInstruction> {
        let mut instructions = Vec::new();
        if self.experience != 0 {
            instructions.push(
                ConsequenceInstruction::new(ActionKind::AwardExperience)
                    .with_param("amount", self.experience),
            );
        }
        for item in &self.items {
            instructions.push(
                ConsequenceInstruction::new(ActionKind::AddItem)
                    .with_param("item_id", item.item_id.clone())
                    .with_param("quantity", item.quantity),
            );
        }
        instructions
    }
}

/// The playable content of a quest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestContent {
    /// Display name per locale.
    pub name: LocalizedText,
    /// Description per locale.
    #[serde(default)]
    pub description: LocalizedText,
    /// Objectives, in order.
    pub objectives: Vec<Objective>,
    /// Rewards on success.
    #[serde(default)]
    pub rewards: RewardSpec,
    /// Consequences fired when the quest starts.
    #[serde(default)]
    pub on_start: Vec<ConsequenceInstruction>,
    /// Consequences fired on successful completion, after the rewards.
    #[serde(default)]
    pub on_complete: Vec<ConsequenceInstruction>,
    /// Consequences fired on failure.
    #[serde(default)]
    pub on_fail: Vec<ConsequenceInstruction>,
}

impl QuestContent {
    /// Creates content with a plain name and no objectives.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: LocalizedText::plain(name),
            description: LocalizedText::default(),
            objectives: Vec::new(),
            rewards: RewardSpec::default(),
            on_start: Vec::new(),
            on_complete: Vec::new(),
            on_fail: Vec::new(),
        }
    }

    /// Appends an objective.
    #[must_use]
    pub fn with_objective(mut self, objective: Objective) -> Self {
        self.objectives.push(objective);
        self
    }

    /// Looks up an objective by id.
    #[must_use]
    pub fn objective(&self, objective_id: &str) -> Option<&Objective> {
        self.objectives.iter().find(|o| o.id == objective_id)
    }

    /// Checks the content is playable.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the name is empty, there are no
    /// objectives, an objective id is blank or repeated, a threshold is not
    /// finite, or a consequence instruction is malformed.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.is_empty() {
            return Err(DomainError::Validation("quest name must not be empty".into()));
        }
        if self.objectives.is_empty() {
            return Err(DomainError::Validation(
                "quest must have at least one objective".into(),
            ));
        }
        let mut seen = BTreeSet::new();
        for objective in &self.objectives {
            if objective.id.trim().is_empty() {
                return Err(DomainError::Validation("objective id must not be blank".into()));
            }
            if !seen.insert(objective.id.as_str()) {
                return Err(DomainError::Validation(format!(
                    "duplicate objective id {}",
                    objective.id
                )));
            }
            if let CompletionPredicate::AtLeast { value } = objective.completion {
                if !value.is_finite() {
                    return Err(DomainError::Validation(format!(
                        "objective {} threshold must be finite",
                        objective.id
                    )));
                }
            }
        }
        for instruction in self
            .on_start
            .iter()
            .chain(&self.on_complete)
            .chain(&self.on_fail)
        {
            instruction.validate()?;
        }
        Ok(())
    }
}

/// An immutable quest definition, loaded once per guild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestTemplate {
    /// Owning guild, stamped on first write.
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    /// Template id, unique within the guild.
    pub id: String,
    /// Content copied into every instance.
    #[serde(flatten)]
    pub content: QuestContent,
    /// Templates the character must have completed successfully first.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Where the template came from.
    #[serde(default)]
    pub provenance: Provenance,
}

impl QuestTemplate {
    /// Creates an authored template with no prerequisites.
    #[must_use]
    pub fn authored(id: &str, content: QuestContent) -> Self {
        Self {
            guild_id: None,
            id: id.to_owned(),
            content,
            prerequisites: Vec::new(),
            provenance: Provenance::Authored,
        }
    }

    /// Adds a prerequisite template id.
    #[must_use]
    pub fn requires(mut self, template_id: &str) -> Self {
        self.prerequisites.push(template_id.to_owned());
        self
    }

    /// Checks the template id and content.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the id is blank, the template
    /// lists itself as a prerequisite, or the content is not playable.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.id.trim().is_empty() {
            return Err(DomainError::Validation("template id must not be blank".into()));
        }
        if self.prerequisites.iter().any(|p| p == &self.id) {
            return Err(DomainError::Validation(format!(
                "template {} cannot require itself",
                self.id
            )));
        }
        self.content.validate()
    }
}

impl GuildScoped for QuestTemplate {
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
