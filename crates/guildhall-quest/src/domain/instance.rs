//! Live quest instances and the per-character quest log.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use guildhall_core::error::DomainError;
use guildhall_core::guild::{CharacterId, GuildId, GuildScoped};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::template::{Provenance, QuestContent};

/// Lifecycle status of a quest instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestStatus {
    /// Offered but not started.
    Available,
    /// In progress.
    Active,
    /// Finished with every objective satisfied.
    CompletedSuccess,
    /// Finished as a failure, with `on_fail` consequences.
    CompletedFailure,
    /// Cancelled or abandoned, without consequences.
    Failed,
    /// Generated content waiting for a moderator.
    PendingModeration,
}

impl QuestStatus {
    /// Snake-case name used in logs and errors.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Active => "active",
            Self::CompletedSuccess => "completed_success",
            Self::CompletedFailure => "completed_failure",
            Self::Failed => "failed",
            Self::PendingModeration => "pending_moderation",
        }
    }

    /// Whether no further transition is allowed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::CompletedSuccess | Self::CompletedFailure | Self::Failed
        )
    }

    /// Whether moving from `self` to `next` is a forward transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Available, Self::Active | Self::PendingModeration)
                | (Self::PendingModeration, Self::Active | Self::Failed)
                | (
                    Self::Active,
                    Self::CompletedSuccess | Self::CompletedFailure | Self::Failed
                )
        )
    }
}

impl fmt::Display for QuestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A quest a character has started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveQuestInstance {
    /// Unique instance id.
    pub id: Uuid,
    /// Source template; `None` for generated content.
    pub template_id: Option<String>,
    /// The character running the quest.
    pub owner: CharacterId,
    /// Current status.
    pub status: QuestStatus,
    /// Progress per objective id.
    #[serde(default)]
    pub progress: BTreeMap<String, Value>,
    /// Content copied from the template or the approved payload.
    pub content: QuestContent,
    /// Where the content came from.
    pub provenance: Provenance,
    /// When the instance was created.
    pub started_at: DateTime<Utc>,
    /// Last mutation.
    pub updated_at: DateTime<Utc>,
    /// When the instance reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl ActiveQuestInstance {
    /// Creates an instance in `Available` status with empty progress.
    #[must_use]
    pub fn new(
        owner: CharacterId,
        template_id: Option<String>,
        content: QuestContent,
        provenance: Provenance,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            template_id,
            owner,
            status: QuestStatus::Available,
            progress: BTreeMap::new(),
            content,
            provenance,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Moves to `next`, stamping the completion time on terminal statuses.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidTransition` if the move is not forward.
    pub fn transition(&mut self, next: QuestStatus, now: DateTime<Utc>) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Records progress on an objective and returns the prior value.
    ///
    /// Numeric (`at_least`) objectives add `delta` to the current value;
    /// every other objective replaces it.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an undeclared objective and
    /// `DomainError::Validation` if an accumulating objective receives a
    /// non-numeric delta.
    pub fn apply_progress(
        &mut self,
        objective_id: &str,
        delta: &Value,
        now: DateTime<Utc>,
    ) -> Result<Option<Value>, DomainError> {
        let objective = self
            .content
            .objective(objective_id)
            .ok_or_else(|| DomainError::not_found("objective", objective_id))?;
        let prior = self.progress.get(objective_id).cloned();
        let next = if objective.completion.accumulates() {
            let base = prior.clone().unwrap_or_else(|| Value::from(0));
            add_numbers(&base, delta).ok_or_else(|| {
                DomainError::Validation(format!(
                    "objective {objective_id} expects a numeric delta, got {delta}"
                ))
            })?
        } else {
            delta.clone()
        };
        self.progress.insert(objective_id.to_owned(), next);
        self.updated_at = now;
        Ok(prior)
    }

    /// Ids of objectives whose predicate is not yet satisfied.
    #[must_use]
    pub fn unsatisfied_objectives(&self) -> Vec<String> {
        self.content
            .objectives
            .iter()
            .filter(|o| !o.completion.is_satisfied(self.progress.get(&o.id)))
            .map(|o| o.id.clone())
            .collect()
    }

    /// Whether every objective is satisfied.
    #[must_use]
    pub fn all_objectives_satisfied(&self) -> bool {
        self.unsatisfied_objectives().is_empty()
    }
}

/// Adds two JSON numbers, keeping integers integral.
fn add_numbers(a: &Value, b: &Value) -> Option<Value> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(Value::from(sum));
        }
    }
    let sum = a.as_f64()? + b.as_f64()?;
    serde_json::Number::from_f64(sum).map(Value::Number)
}

/// Every quest a character has started, active and finished.
///
/// This is the cache entry for a character; any quest mutation rewrites the
/// whole log and marks the character dirty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterQuestLog {
    /// Owning guild, stamped on first write.
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    /// The character.
    pub character_id: CharacterId,
    /// Quests in a non-terminal status.
    #[serde(default)]
    pub active: Vec<ActiveQuestInstance>,
    /// Quests in a terminal status, in completion order.
    #[serde(default)]
    pub completed: Vec<ActiveQuestInstance>,
}

impl CharacterQuestLog {
    /// Creates an empty, unstamped log.
    #[must_use]
    pub fn new(character_id: CharacterId) -> Self {
        Self {
            guild_id: None,
            character_id,
            active: Vec::new(),
            completed: Vec::new(),
        }
    }

    /// The active instance with `quest_id`.
    #[must_use]
    pub fn active_quest(&self, quest_id: Uuid) -> Option<&ActiveQuestInstance> {
        self.active.iter().find(|q| q.id == quest_id)
    }

    /// The active instance started from `template_id`.
    #[must_use]
    pub fn active_for_template(&self, template_id: &str) -> Option<&ActiveQuestInstance> {
        self.active
            .iter()
            .find(|q| q.template_id.as_deref() == Some(template_id))
    }

    /// The instance with `quest_id`, active or finished.
    #[must_use]
    pub fn find(&self, quest_id: Uuid) -> Option<&ActiveQuestInstance> {
        self.active
            .iter()
            .chain(&self.completed)
            .find(|q| q.id == quest_id)
    }

    /// Whether the character completed `template_id` successfully.
    #[must_use]
    pub fn has_completed(&self, template_id: &str) -> bool {
        self.completed.iter().any(|q| {
            q.status == QuestStatus::CompletedSuccess && q.template_id.as_deref() == Some(template_id)
        })
    }

    /// Removes the instance with `quest_id` from either list.
    pub fn take(&mut self, quest_id: Uuid) -> Option<ActiveQuestInstance> {
        if let Some(pos) = self.active.iter().position(|q| q.id == quest_id) {
            return Some(self.active.remove(pos));
        }
        self.completed
            .iter()
            .position(|q| q.id == quest_id)
            .map(|pos| self.completed.remove(pos))
    }

    /// Files `instance` under active or completed according to its status.
    pub fn file(&mut self, instance: ActiveQuestInstance) {
        if instance.status.is_terminal() {
            self.completed.push(instance);
        } else {
            self.active.push(instance);
        }
    }
}

impl GuildScoped for CharacterQuestLog {
    fn guild_id(&self) -> Option<GuildId> {
        self.guild_id
    }

    fn stamp_guild(&mut self, guild_id: GuildId) {
        self.guild_id = Some(guild_id);
    }

    fn cache_key(&self) -> String {
        self.character_id.as_str().to_owned()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::domain::template::Objective;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()
    }

    fn instance() -> ActiveQuestInstance {
        let content = QuestContent::new("Wolf Trouble")
            .with_objective(Objective::at_least("obj1", "collect", "wolf_pelt", 3.0))
            .with_objective(Objective::flag("obj2", "visit", "den"));
        ActiveQuestInstance::new(
            CharacterId::new("c-1"),
            Some("T1".into()),
            content,
            Provenance::Authored,
            now(),
        )
    }

    #[test]
    fn test_instance_ids_are_time_ordered_v7() {
        let first = instance();
        let second = instance();

        assert_eq!(first.id.get_version_num(), 7);
        assert!(first.id < second.id);
    }

    #[test]
    fn test_forward_transitions_only() {
        assert!(QuestStatus::Available.can_transition_to(QuestStatus::Active));
        assert!(QuestStatus::PendingModeration.can_transition_to(QuestStatus::Active));
        assert!(QuestStatus::Active.can_transition_to(QuestStatus::CompletedFailure));
        assert!(!QuestStatus::CompletedSuccess.can_transition_to(QuestStatus::Active));
        assert!(!QuestStatus::Active.can_transition_to(QuestStatus::Available));
    }

    #[test]
    fn test_transition_to_terminal_stamps_completion_time() {
        let mut quest = instance();
        quest.transition(QuestStatus::Active, now()).unwrap();

        quest.transition(QuestStatus::CompletedSuccess, now()).unwrap();

        assert_eq!(quest.completed_at, Some(now()));
        let err = quest.transition(QuestStatus::Active, now()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
    }

    #[test]
    fn test_numeric_progress_accumulates_and_keeps_integers() {
        let mut quest = instance();

        let first = quest.apply_progress("obj1", &json!(2), now()).unwrap();
        let second = quest.apply_progress("obj1", &json!(1), now()).unwrap();

        assert_eq!(first, None);
        assert_eq!(second, Some(json!(2)));
        assert_eq!(quest.progress["obj1"], json!(3));
    }

    #[test]
    fn test_flag_progress_is_replaced() {
        let mut quest = instance();

        quest.apply_progress("obj2", &json!(false), now()).unwrap();
        quest.apply_progress("obj2", &json!(true), now()).unwrap();

        assert_eq!(quest.progress["obj2"], json!(true));
    }

    #[test]
    fn test_progress_on_unknown_objective_is_not_found() {
        let mut quest = instance();

        let err = quest.apply_progress("obj9", &json!(1), now()).unwrap_err();

        assert!(matches!(err, DomainError::NotFound { .. }));
        assert!(quest.progress.is_empty());
    }

    #[test]
    fn test_non_numeric_delta_for_counter_is_rejected() {
        let mut quest = instance();

        let err = quest.apply_progress("obj1", &json!("many"), now()).unwrap_err();

        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn test_unsatisfied_objectives_lists_remaining_ids() {
        let mut quest = instance();
        quest.apply_progress("obj1", &json!(3), now()).unwrap();

        assert_eq!(quest.unsatisfied_objectives(), vec!["obj2".to_owned()]);
        quest.apply_progress("obj2", &json!(true), now()).unwrap();
        assert!(quest.all_objectives_satisfied());
    }

    #[test]
    fn test_log_files_by_status_and_takes_from_either_list() {
        let mut log = CharacterQuestLog::new(CharacterId::new("c-1"));
        let mut done = instance();
        done.status = QuestStatus::CompletedSuccess;
        let done_id = done.id;
        log.file(instance());
        log.file(done);

        assert_eq!(log.active.len(), 1);
        assert!(log.has_completed("T1"));
        assert!(log.take(done_id).is_some());
        assert!(log.completed.is_empty());
    }
}
