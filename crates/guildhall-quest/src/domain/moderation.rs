//! Moderation requests for generated content.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use guildhall_core::error::DomainError;
use guildhall_core::guild::{CharacterId, GuildId, GuildScoped};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Review status of a moderation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStatus {
    /// Waiting for a moderator.
    Pending,
    /// Approved and materialized.
    Approved,
    /// Rejected; never reaches live state.
    Rejected,
}

/// What kind of content a request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// A quest payload shaped like [`QuestContent`](super::template::QuestContent).
    Quest,
}

/// Generated content held back until a moderator reviews it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationRequest {
    /// Request id.
    pub id: Uuid,
    /// Owning guild, stamped on first write.
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    /// The character the content was generated for.
    pub submitter: CharacterId,
    /// Kind of content.
    pub content_kind: ContentKind,
    /// The concept the generator was given.
    pub concept: String,
    /// Validated payload.
    pub payload: serde_json::Value,
    /// Hex SHA-256 of the serialized payload.
    pub digest: String,
    /// Review status.
    pub status: ModerationStatus,
    /// When the request was queued.
    pub submitted_at: DateTime<Utc>,
    /// When a moderator decided.
    #[serde(default)]
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Moderator's reason for a rejection.
    #[serde(default)]
    pub rejection_reason: Option<String>,
    /// The instance created on approval.
    #[serde(default)]
    pub materialized_quest: Option<Uuid>,
}

impl ModerationRequest {
    /// Creates a pending quest request.
    #[must_use]
    pub fn quest(
        submitter: CharacterId,
        concept: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        let digest = payload_digest(&payload);
        Self {
            id: Uuid::now_v7(),
            guild_id: None,
            submitter,
            content_kind: ContentKind::Quest,
            concept: concept.to_owned(),
            payload,
            digest,
            status: ModerationStatus::Pending,
            submitted_at: now,
            reviewed_at: None,
            rejection_reason: None,
            materialized_quest: None,
        }
    }

    /// Whether the request still waits for review.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == ModerationStatus::Pending
    }

    /// Marks the request approved.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidTransition` if it was already reviewed.
    pub fn approve(&mut self, quest_id: Uuid, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.review(ModerationStatus::Approved, now)?;
        self.materialized_quest = Some(quest_id);
        Ok(())
    }

    /// Marks the request rejected.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidTransition` if it was already reviewed.
    pub fn reject(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.review(ModerationStatus::Rejected, now)?;
        self.rejection_reason = Some(reason.to_owned());
        Ok(())
    }

    fn review(&mut self, next: ModerationStatus, now: DateTime<Utc>) -> Result<(), DomainError> {
        if !self.is_pending() {
            return Err(DomainError::InvalidTransition {
                from: format!("{:?}", self.status).to_lowercase(),
                to: format!("{next:?}").to_lowercase(),
            });
        }
        self.status = next;
        self.reviewed_at = Some(now);
        Ok(())
    }
}

impl GuildScoped for ModerationRequest {
    fn guild_id(&self) -> Option<GuildId> {
        self.guild_id
    }

    fn stamp_guild(&mut self, guild_id: GuildId) {
        self.guild_id = Some(guild_id);
    }

    fn cache_key(&self) -> String {
        self.id.to_string()
    }
}

/// Hex SHA-256 of the canonical JSON encoding of `payload`.
#[must_use]
pub fn payload_digest(payload: &serde_json::Value) -> String {
    let digest = Sha256::digest(payload.to_string().as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
