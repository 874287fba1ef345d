//! Read-only quest queries.
//!
//! These return cloned views of cached state; nothing here marks a key
//! dirty.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use guildhall_core::error::DomainError;
use guildhall_core::guild::{CharacterId, GuildId};
use serde::Serialize;
use uuid::Uuid;

use super::lifecycle::QuestLifecycle;
use crate::domain::instance::{ActiveQuestInstance, QuestStatus};
use crate::domain::moderation::ModerationRequest;
use crate::domain::template::QuestTemplate;

/// A display-ready summary of a quest instance in one locale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestSummary {
    /// Instance id.
    pub quest_id: Uuid,
    /// Source template, if authored.
    pub template_id: Option<String>,
    /// Name in the requested locale.
    pub name: String,
    /// Current status.
    pub status: QuestStatus,
    /// Progress per objective id.
    pub progress: BTreeMap<String, serde_json::Value>,
    /// Objectives still unsatisfied.
    pub remaining: Vec<String>,
    /// Last mutation.
    pub updated_at: DateTime<Utc>,
}

impl QuestSummary {
    /// Summarizes `instance` in `locale`.
    #[must_use]
    pub fn of(instance: &ActiveQuestInstance, locale: &str) -> Self {
        Self {
            quest_id: instance.id,
            template_id: instance.template_id.clone(),
            name: instance
                .content
                .name
                .get(locale)
                .unwrap_or_default()
                .to_owned(),
            status: instance.status,
            progress: instance.progress.clone(),
            remaining: instance.unsatisfied_objectives(),
            updated_at: instance.updated_at,
        }
    }
}

impl QuestLifecycle {
    /// Quests the character is currently running.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown character.
    pub fn list_active_quests(
        &self,
        guild: GuildId,
        character: &CharacterId,
    ) -> Result<Vec<ActiveQuestInstance>, DomainError> {
        Ok(self.log_for(guild, character)?.active)
    }

    /// Quests the character has finished, in completion order.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown character.
    pub fn list_completed_quests(
        &self,
        guild: GuildId,
        character: &CharacterId,
    ) -> Result<Vec<ActiveQuestInstance>, DomainError> {
        Ok(self.log_for(guild, character)?.completed)
    }

    /// Templates the character could start now: prerequisites met and no
    /// active instance, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown character.
    pub fn list_available_quests(
        &self,
        guild: GuildId,
        character: &CharacterId,
    ) -> Result<Vec<QuestTemplate>, DomainError> {
        let log = self.log_for(guild, character)?;
        let mut available: Vec<QuestTemplate> = self
            .templates_of(guild)
            .into_iter()
            .filter(|t| log.active_for_template(&t.id).is_none())
            .filter(|t| t.prerequisites.iter().all(|p| log.has_completed(p)))
            .collect();
        available.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(available)
    }

    /// Requests waiting for a moderator, oldest first.
    #[must_use]
    pub fn list_pending_moderation(&self, guild: GuildId) -> Vec<ModerationRequest> {
        let mut pending: Vec<ModerationRequest> = self
            .moderation_requests(guild)
            .into_iter()
            .filter(ModerationRequest::is_pending)
            .collect();
        pending.sort_by_key(|r| r.submitted_at);
        pending
    }

    /// Summaries of the character's active quests in `locale`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown character.
    pub fn quest_summaries(
        &self,
        guild: GuildId,
        character: &CharacterId,
        locale: &str,
    ) -> Result<Vec<QuestSummary>, DomainError> {
        Ok(self
            .list_active_quests(guild, character)?
            .iter()
            .map(|q| QuestSummary::of(q, locale))
            .collect())
    }
}
