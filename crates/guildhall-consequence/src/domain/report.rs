//! What a dispatch did, instruction by instruction.

use chrono::{DateTime, Utc};
use guildhall_core::error::DomainError;
use guildhall_core::guild::EntityRef;
use serde::Serialize;
use uuid::Uuid;

use super::instruction::{ActionKind, QuestStateAction};

/// Audit record of an applied instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    /// Position in the dispatched list.
    pub index: usize,
    /// Action that ran.
    pub action: ActionKind,
    /// What triggered the dispatch (quest id, rule id, command id).
    pub source_id: String,
    /// Entities affected.
    pub targets: Vec<EntityRef>,
    /// Action-specific result (new stat value, resulting strength, ...).
    pub detail: serde_json::Value,
    /// Attempts needed.
    pub attempts: u32,
    /// When the instruction was applied.
    pub occurred_at: DateTime<Utc>,
}

/// An instruction that was not applied because of an error.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionFailure {
    /// Position in the dispatched list.
    pub index: usize,
    /// Action that failed.
    pub action: ActionKind,
    /// Last error seen.
    pub error: DomainError,
    /// Attempts made.
    pub attempts: u32,
    /// The target that failed, for per-target actions. Other targets of the
    /// same instruction may have been applied.
    pub target: Option<EntityRef>,
}

/// An instruction that was skipped on purpose (e.g. unregistered function).
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedInstruction {
    /// Position in the dispatched list.
    pub index: usize,
    /// Action that was skipped.
    pub action: ActionKind,
    /// Why it was skipped.
    pub reason: String,
}

/// A quest transition requested by an `update_quest_state` instruction.
///
/// The consequence engine does not own quests; these requests are handed
/// back to the quest lifecycle, which applies them after the dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestStateRequest {
    /// Position in the dispatched list.
    pub index: usize,
    /// The quest owner.
    pub owner: EntityRef,
    /// Requested transition.
    pub state: QuestStateAction,
    /// The quest instance, if named.
    pub quest_id: Option<Uuid>,
    /// The template, if named.
    pub template_id: Option<String>,
}

/// Result of dispatching a list of instructions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    /// Applied instructions, in order.
    pub applied: Vec<AuditEntry>,
    /// Skipped instructions.
    pub skipped: Vec<SkippedInstruction>,
    /// Failed instructions.
    pub failed: Vec<InstructionFailure>,
    /// Quest transitions for the quest lifecycle to apply.
    pub quest_requests: Vec<QuestStateRequest>,
}

impl DispatchReport {
    /// Whether every instruction was applied or deferred.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// Appends another report, e.g. from a cascaded dispatch.
    pub fn absorb(&mut self, other: DispatchReport) {
        self.applied.extend(other.applied);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
        self.quest_requests.extend(other.quest_requests);
    }
}
