//! Compensating operations for quest lifecycle mutations.
//!
//! Callers capture a [`QuestLifecycle::snapshot`] (or keep the returned
//! prior value) before a mutation and, if a later step of their operation
//! fails, invoke the matching revert. Reverts bypass the forward-only status
//! table and re-mark the character dirty so the restored state is flushed.

use guildhall_core::error::DomainError;
use guildhall_core::guild::{CharacterId, GuildId};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use super::lifecycle::QuestLifecycle;
use crate::domain::instance::{ActiveQuestInstance, QuestStatus};

/// Undoes lifecycle mutations for one [`QuestLifecycle`].
#[derive(Debug, Clone, Copy)]
pub struct RevertLedger<'a> {
    lifecycle: &'a QuestLifecycle,
}

impl QuestLifecycle {
    /// The revert ledger for this lifecycle.
    #[must_use]
    pub fn reverts(&self) -> RevertLedger<'_> {
        RevertLedger { lifecycle: self }
    }
}

impl RevertLedger<'_> {
    /// Removes an instance created by `start_quest` or `approve_moderated`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown character or quest.
    pub fn revert_quest_start(
        &self,
        guild: GuildId,
        character: &CharacterId,
        quest_id: Uuid,
    ) -> Result<ActiveQuestInstance, DomainError> {
        let mut log = self.lifecycle.log_for(guild, character)?;
        let removed = log
            .take(quest_id)
            .ok_or_else(|| DomainError::not_found("quest", quest_id))?;
        self.lifecycle.save_log(guild, log)?;
        info!(%guild, %character, %quest_id, "quest start reverted");
        Ok(removed)
    }

    /// Restores an instance to `prior_snapshot` with `prior_status`, filing
    /// it back under active or completed accordingly.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown character and
    /// `DomainError::Validation` if the snapshot is of another quest or
    /// belongs to someone else.
    pub fn revert_status_change(
        &self,
        guild: GuildId,
        character: &CharacterId,
        quest_id: Uuid,
        prior_status: QuestStatus,
        prior_snapshot: ActiveQuestInstance,
    ) -> Result<ActiveQuestInstance, DomainError> {
        if prior_snapshot.id != quest_id {
            return Err(DomainError::Validation(format!(
                "snapshot is of quest {}, not {quest_id}",
                prior_snapshot.id
            )));
        }
        if &prior_snapshot.owner != character {
            return Err(DomainError::Validation(format!(
                "quest {} is owned by {}, not {character}",
                prior_snapshot.id, prior_snapshot.owner
            )));
        }
        let mut log = self.lifecycle.log_for(guild, character)?;
        let mut restored = prior_snapshot;
        restored.status = prior_status;
        if !prior_status.is_terminal() {
            restored.completed_at = None;
        }
        log.take(restored.id);
        log.file(restored.clone());
        self.lifecycle.save_log(guild, log)?;
        info!(%guild, %character, quest_id = %restored.id, status = %prior_status, "quest status reverted");
        Ok(restored)
    }

    /// Puts an objective's progress back to `prior_value`; `None` removes
    /// the entry.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown character or quest.
    pub fn revert_progress_update(
        &self,
        guild: GuildId,
        character: &CharacterId,
        quest_id: Uuid,
        objective_id: &str,
        prior_value: Option<Value>,
    ) -> Result<ActiveQuestInstance, DomainError> {
        let mut log = self.lifecycle.log_for(guild, character)?;
        let instance = log
            .active
            .iter_mut()
            .chain(log.completed.iter_mut())
            .find(|q| q.id == quest_id)
            .ok_or_else(|| DomainError::not_found("quest", quest_id))?;
        match prior_value {
            Some(value) => {
                instance.progress.insert(objective_id.to_owned(), value);
            }
            None => {
                instance.progress.remove(objective_id);
            }
        }
        let reverted = instance.clone();
        self.lifecycle.save_log(guild, log)?;
        info!(%guild, %character, %quest_id, objective_id, "quest progress reverted");
        Ok(reverted)
    }
}
