//! The quest lifecycle state machine.
//!
//! `available → active → completed_success | completed_failure | failed`,
//! with a side channel for generated content:
//! `(generation requested) → pending_moderation → active`.
//!
//! Every write goes through [`write_scoped`], so an entity tagged with
//! another guild never reaches the cache. Cache reads and writes are
//! synchronous; the only suspension points are collaborator calls
//! (generation, validation, consequence dispatch), which happen after the
//! quest's own mutation has been written.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use guildhall_consequence::application::engine::ConsequenceEngine;
use guildhall_consequence::domain::instruction::{
    ActionKind, ConsequenceInstruction, QuestStateAction,
};
use guildhall_consequence::domain::report::{
    DispatchReport, InstructionFailure, QuestStateRequest, SkippedInstruction,
};
use guildhall_core::cache::TenantCache;
use guildhall_core::clock::Clock;
use guildhall_core::error::DomainError;
use guildhall_core::guild::{CharacterId, EntityKind, EntityRef, GuildId};
use guildhall_core::isolation::write_scoped;
use guildhall_core::persistence::{FlushStats, flush_cache, hydrate_cache};
use guildhall_core::ports::{
    ContentGenerator, ExistingIdSets, PersistedRow, PersistenceService, RowKind,
    StructuredValidator,
};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::instance::{ActiveQuestInstance, CharacterQuestLog, QuestStatus};
use crate::domain::moderation::{ModerationRequest, payload_digest};
use crate::domain::template::{Provenance, QuestContent, QuestTemplate};

/// Shape name passed to the structured validator for quest payloads.
pub const QUEST_SHAPE: &str = "quest";

/// Which quest to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateRef {
    /// An authored template by id.
    Authored(String),
    /// Generated content; goes through the moderation queue.
    Generated {
        /// What the quest should be about.
        concept: String,
        /// Free-form hints for the generator.
        hints: BTreeMap<String, String>,
    },
}

/// A quest together with the consequences its transition dispatched.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestOutcome {
    /// The instance after the transition.
    pub instance: ActiveQuestInstance,
    /// What the transition's consequence list did.
    pub dispatch: DispatchReport,
}

/// Result of [`QuestLifecycle::start_quest`].
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// A new active instance was created.
    Started(QuestOutcome),
    /// The character already runs this template; nothing changed.
    AlreadyActive(ActiveQuestInstance),
    /// Generated content was queued for moderation.
    PendingModeration(ModerationRequest),
}

/// Result of [`QuestLifecycle::complete_quest`].
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionResult {
    /// Success was requested but objectives remain; nothing changed.
    Incomplete {
        /// Ids of the unsatisfied objectives.
        unsatisfied: Vec<String>,
    },
    /// The quest reached its terminal status.
    Finalized(Box<QuestOutcome>),
}

impl CompletionResult {
    /// Whether the quest was finalized.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Finalized(_))
    }
}

/// Result of [`QuestLifecycle::update_progress`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressOutcome {
    /// The instance right after the progress update.
    pub instance: ActiveQuestInstance,
    /// The objective's value before the update, for reverting.
    pub prior_value: Option<Value>,
    /// Set when the update satisfied every objective.
    pub completion: Option<CompletionResult>,
}

/// A consequence list waiting to be dispatched on behalf of a quest.
#[derive(Debug)]
struct PendingDispatch {
    instructions: Vec<ConsequenceInstruction>,
    source_id: String,
    owner: EntityRef,
}

impl PendingDispatch {
    fn for_quest(instance: &ActiveQuestInstance, instructions: Vec<ConsequenceInstruction>) -> Self {
        Self {
            instructions,
            source_id: instance.id.to_string(),
            owner: EntityRef::character(&instance.owner),
        }
    }
}

enum StartStep {
    Existing(ActiveQuestInstance),
    Created(ActiveQuestInstance, PendingDispatch),
}

enum FinalizeStep {
    Incomplete(Vec<String>),
    Done(ActiveQuestInstance, PendingDispatch),
}

/// Owns quest templates, character quest logs and the moderation queue for
/// every loaded guild.
pub struct QuestLifecycle {
    templates: TenantCache<QuestTemplate>,
    logs: TenantCache<CharacterQuestLog>,
    moderation: TenantCache<ModerationRequest>,
    consequences: Arc<ConsequenceEngine>,
    generator: Arc<dyn ContentGenerator>,
    validator: Arc<dyn StructuredValidator>,
    clock: Arc<dyn Clock>,
    max_cascade_depth: u32,
}

impl std::fmt::Debug for QuestLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuestLifecycle")
            .field("guilds", &self.logs.guilds())
            .field("max_cascade_depth", &self.max_cascade_depth)
            .finish_non_exhaustive()
    }
}

impl QuestLifecycle {
    /// Creates a lifecycle with empty caches and a cascade depth of 4.
    #[must_use]
    pub fn new(
        consequences: Arc<ConsequenceEngine>,
        generator: Arc<dyn ContentGenerator>,
        validator: Arc<dyn StructuredValidator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            templates: TenantCache::new(),
            logs: TenantCache::new(),
            moderation: TenantCache::new(),
            consequences,
            generator,
            validator,
            clock,
            max_cascade_depth: 4,
        }
    }

    /// Bounds how many rounds of quest transitions consequences may trigger.
    #[must_use]
    pub fn with_max_cascade_depth(mut self, depth: u32) -> Self {
        self.max_cascade_depth = depth;
        self
    }

    /// Installs templates for `guild`, replacing templates with the same id.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if any template is malformed and
    /// `DomainError::TenantViolation` if any is tagged with another guild.
    /// Nothing is installed in either case.
    pub fn install_templates(
        &self,
        guild: GuildId,
        templates: Vec<QuestTemplate>,
    ) -> Result<usize, DomainError> {
        for template in &templates {
            template.validate()?;
        }
        let count = templates.len();
        write_scoped(&self.templates, guild, |unit| {
            for template in templates {
                unit.add_new(template);
            }
            Ok(())
        })?;
        info!(%guild, count, "quest templates installed");
        Ok(count)
    }

    /// Looks up a template.
    #[must_use]
    pub fn template(&self, guild: GuildId, template_id: &str) -> Option<QuestTemplate> {
        self.templates.get(guild, template_id)
    }

    /// Creates an empty quest log for `character`, or returns the existing
    /// one.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` only if the written log cannot be
    /// read back.
    pub fn register_character(
        &self,
        guild: GuildId,
        character: &CharacterId,
    ) -> Result<CharacterQuestLog, DomainError> {
        if let Some(log) = self.logs.get(guild, character.as_str()) {
            return Ok(log);
        }
        write_scoped(&self.logs, guild, |unit| {
            unit.add_new(CharacterQuestLog::new(character.clone()));
            Ok(())
        })?;
        info!(%guild, %character, "character registered");
        self.log_for(guild, character)
    }

    /// Starts a quest for `character`.
    ///
    /// Authored templates create an active instance and dispatch `on_start`;
    /// a second start of the same template returns the running instance.
    /// Generated content is produced, validated and queued for moderation.
    ///
    /// # Errors
    ///
    /// - `DomainError::NotFound` for an unknown character or template.
    /// - `DomainError::Validation` for unmet prerequisites or a payload the
    ///   validator rejects.
    /// - `DomainError::Collaborator` if generation or validation fails.
    ///
    /// Nothing is mutated on error.
    #[instrument(skip_all, fields(guild = %guild, character = %character))]
    pub async fn start_quest(
        &self,
        guild: GuildId,
        character: &CharacterId,
        template: &TemplateRef,
    ) -> Result<StartOutcome, DomainError> {
        match template {
            TemplateRef::Authored(template_id) => {
                match self.begin_start(guild, character, template_id)? {
                    StartStep::Existing(instance) => {
                        debug!(quest_id = %instance.id, template_id = %template_id, "quest already active");
                        Ok(StartOutcome::AlreadyActive(instance))
                    }
                    StartStep::Created(instance, pending) => {
                        let dispatch = self.run_dispatch(guild, pending).await;
                        Ok(StartOutcome::Started(QuestOutcome { instance, dispatch }))
                    }
                }
            }
            TemplateRef::Generated { concept, hints } => {
                let request = self.request_generated(guild, character, concept, hints).await?;
                Ok(StartOutcome::PendingModeration(request))
            }
        }
    }

    fn begin_start(
        &self,
        guild: GuildId,
        character: &CharacterId,
        template_id: &str,
    ) -> Result<StartStep, DomainError> {
        let mut log = self.log_for(guild, character)?;
        let template = self
            .templates
            .get(guild, template_id)
            .ok_or_else(|| DomainError::not_found("quest_template", template_id))?;
        if let Some(existing) = log.active_for_template(template_id) {
            return Ok(StartStep::Existing(existing.clone()));
        }
        let missing: Vec<&str> = template
            .prerequisites
            .iter()
            .filter(|p| !log.has_completed(p))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(DomainError::Validation(format!(
                "quest {template_id} requires {}",
                missing.join(", ")
            )));
        }

        let instance = self.materialize(
            &mut log,
            Some(template.id.clone()),
            template.content,
            template.provenance,
            false,
        )?;
        self.save_log(guild, log)?;
        info!(%guild, %character, quest_id = %instance.id, template_id, "quest started");
        let pending = PendingDispatch::for_quest(&instance, instance.content.on_start.clone());
        Ok(StartStep::Created(instance, pending))
    }

    /// Creates an active instance in `log`. Moderated content passes through
    /// `pending_moderation` first.
    fn materialize(
        &self,
        log: &mut CharacterQuestLog,
        template_id: Option<String>,
        content: QuestContent,
        provenance: Provenance,
        moderated: bool,
    ) -> Result<ActiveQuestInstance, DomainError> {
        let now = self.clock.now();
        let mut instance = ActiveQuestInstance::new(
            log.character_id.clone(),
            template_id,
            content,
            provenance,
            now,
        );
        if moderated {
            instance.transition(QuestStatus::PendingModeration, now)?;
        }
        instance.transition(QuestStatus::Active, now)?;
        log.file(instance.clone());
        Ok(instance)
    }

    async fn request_generated(
        &self,
        guild: GuildId,
        character: &CharacterId,
        concept: &str,
        hints: &BTreeMap<String, String>,
    ) -> Result<ModerationRequest, DomainError> {
        let log = self.log_for(guild, character)?;
        let payload = self.generator.generate(guild, concept, hints).await?;
        let existing = self.existing_ids(guild, &log);
        let outcome = self
            .validator
            .validate(&payload, QUEST_SHAPE, &existing)
            .await?;
        if !outcome.status.is_success() {
            warn!(%guild, %character, concept, errors = ?outcome.errors, "generated quest rejected by validator");
            return Err(DomainError::Validation(format!(
                "generated quest is invalid: {}",
                outcome.errors.join("; ")
            )));
        }
        let data = outcome.validated_data.unwrap_or(payload);
        let content: QuestContent = serde_json::from_value(data.clone())
            .map_err(|e| DomainError::Validation(format!("generated quest is malformed: {e}")))?;
        content.validate()?;

        let digest = payload_digest(&data);
        if let Some(queued) = self
            .moderation
            .values(guild)
            .into_iter()
            .find(|r| r.is_pending() && &r.submitter == character && r.digest == digest)
        {
            debug!(request_id = %queued.id, "identical payload already queued");
            return Ok(queued);
        }

        let request = ModerationRequest::quest(character.clone(), concept, data, self.clock.now());
        let request_id = request.id;
        write_scoped(&self.moderation, guild, |unit| {
            unit.add_new(request);
            Ok(())
        })?;
        info!(
            %guild,
            %character,
            %request_id,
            requires_moderation = outcome.requires_moderation,
            "generated quest queued for moderation"
        );
        self.moderation_request(guild, request_id)
    }

    fn existing_ids(&self, guild: GuildId, log: &CharacterQuestLog) -> ExistingIdSets {
        let mut sets = ExistingIdSets::new();
        sets.insert(
            "quest_template".to_owned(),
            self.templates
                .values(guild)
                .into_iter()
                .map(|t| t.id)
                .collect(),
        );
        sets.insert(
            "active_quest".to_owned(),
            log.active.iter().map(|q| q.id.to_string()).collect(),
        );
        sets
    }

    /// Approves a pending request and materializes it exactly as an authored
    /// start would, with AI provenance.
    ///
    /// # Errors
    ///
    /// - `DomainError::NotFound` for an unknown request or submitter.
    /// - `DomainError::InvalidTransition` if the request was already reviewed.
    /// - `DomainError::Validation` if the payload is not playable.
    #[instrument(skip_all, fields(guild = %guild, request_id = %request_id))]
    pub async fn approve_moderated(
        &self,
        guild: GuildId,
        request_id: Uuid,
    ) -> Result<QuestOutcome, DomainError> {
        let mut request = self.moderation_request(guild, request_id)?;
        let content: QuestContent = serde_json::from_value(request.payload.clone())
            .map_err(|e| DomainError::Validation(format!("queued quest is malformed: {e}")))?;
        content.validate()?;
        let mut log = self.log_for(guild, &request.submitter)?;

        let instance = self.materialize(&mut log, None, content, Provenance::AiGenerated, true)?;
        request.approve(instance.id, self.clock.now())?;
        self.save_log(guild, log)?;
        write_scoped(&self.moderation, guild, |unit| {
            unit.add_modified(request);
            Ok(())
        })?;
        info!(%guild, quest_id = %instance.id, character = %instance.owner, "moderated quest approved");

        let pending = PendingDispatch::for_quest(&instance, instance.content.on_start.clone());
        let dispatch = self.run_dispatch(guild, pending).await;
        Ok(QuestOutcome { instance, dispatch })
    }

    /// Rejects a pending request. The content never reaches live state.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown request and
    /// `DomainError::InvalidTransition` if it was already reviewed.
    pub fn reject_moderated(
        &self,
        guild: GuildId,
        request_id: Uuid,
        reason: &str,
    ) -> Result<ModerationRequest, DomainError> {
        let mut request = self.moderation_request(guild, request_id)?;
        request.reject(reason, self.clock.now())?;
        write_scoped(&self.moderation, guild, |unit| {
            unit.add_modified(request.clone());
            Ok(())
        })?;
        info!(%guild, %request_id, reason, "moderated quest rejected");
        Ok(request)
    }

    /// Looks up a moderation request.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` if there is no such request.
    pub fn moderation_request(
        &self,
        guild: GuildId,
        request_id: Uuid,
    ) -> Result<ModerationRequest, DomainError> {
        self.moderation
            .get(guild, &request_id.to_string())
            .ok_or_else(|| DomainError::not_found("moderation_request", request_id))
    }

    /// Records progress on an objective; completes the quest when every
    /// objective is satisfied.
    ///
    /// # Errors
    ///
    /// - `DomainError::NotFound` for an unknown character, quest or objective.
    /// - `DomainError::Validation` for a non-numeric delta on a counter or a
    ///   quest that is not active.
    #[instrument(skip_all, fields(guild = %guild, character = %character, quest_id = %quest_id))]
    pub async fn update_progress(
        &self,
        guild: GuildId,
        character: &CharacterId,
        quest_id: Uuid,
        objective_id: &str,
        delta: &Value,
    ) -> Result<ProgressOutcome, DomainError> {
        let mut log = self.log_for(guild, character)?;
        let now = self.clock.now();
        let instance = log
            .active
            .iter_mut()
            .find(|q| q.id == quest_id)
            .ok_or_else(|| DomainError::not_found("active_quest", quest_id))?;
        if instance.status != QuestStatus::Active {
            return Err(DomainError::Validation(format!(
                "quest {quest_id} is {}, not active",
                instance.status
            )));
        }
        let prior_value = instance.apply_progress(objective_id, delta, now)?;
        let instance = instance.clone();
        self.save_log(guild, log)?;
        debug!(objective_id, progress = ?instance.progress.get(objective_id), "quest progress updated");

        let completion = if instance.all_objectives_satisfied() {
            Some(self.complete_quest(guild, character, quest_id, true).await?)
        } else {
            None
        };
        Ok(ProgressOutcome {
            instance,
            prior_value,
            completion,
        })
    }

    /// Finalizes an active quest.
    ///
    /// Success requires every objective to be satisfied; otherwise
    /// [`CompletionResult::Incomplete`] is returned and nothing changes. On
    /// success the rewards and `on_complete` are dispatched, on failure
    /// `on_fail`. Failed consequences are recorded in the outcome but do not
    /// undo the transition.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown character or active
    /// quest and `DomainError::InvalidTransition` if the quest is not active.
    #[instrument(skip_all, fields(guild = %guild, character = %character, quest_id = %quest_id, success = success))]
    pub async fn complete_quest(
        &self,
        guild: GuildId,
        character: &CharacterId,
        quest_id: Uuid,
        success: bool,
    ) -> Result<CompletionResult, DomainError> {
        match self.finalize(guild, character, quest_id, success)? {
            FinalizeStep::Incomplete(unsatisfied) => {
                debug!(?unsatisfied, "completion refused, objectives remain");
                Ok(CompletionResult::Incomplete { unsatisfied })
            }
            FinalizeStep::Done(instance, pending) => {
                let dispatch = self.run_dispatch(guild, pending).await;
                Ok(CompletionResult::Finalized(Box::new(QuestOutcome {
                    instance,
                    dispatch,
                })))
            }
        }
    }

    /// Finalizes an active quest as a failure.
    ///
    /// # Errors
    ///
    /// See [`QuestLifecycle::complete_quest`].
    pub async fn fail_quest(
        &self,
        guild: GuildId,
        character: &CharacterId,
        quest_id: Uuid,
    ) -> Result<CompletionResult, DomainError> {
        self.complete_quest(guild, character, quest_id, false).await
    }

    fn finalize(
        &self,
        guild: GuildId,
        character: &CharacterId,
        quest_id: Uuid,
        success: bool,
    ) -> Result<FinalizeStep, DomainError> {
        let mut log = self.log_for(guild, character)?;
        let current = log
            .active_quest(quest_id)
            .ok_or_else(|| DomainError::not_found("active_quest", quest_id))?;
        if success {
            let unsatisfied = current.unsatisfied_objectives();
            if !unsatisfied.is_empty() {
                return Ok(FinalizeStep::Incomplete(unsatisfied));
            }
        }

        let mut instance = log
            .take(quest_id)
            .ok_or_else(|| DomainError::not_found("active_quest", quest_id))?;
        let next = if success {
            QuestStatus::CompletedSuccess
        } else {
            QuestStatus::CompletedFailure
        };
        instance.transition(next, self.clock.now())?;
        let instructions = if success {
            let mut list = instance.content.rewards.to_instructions();
            list.extend(instance.content.on_complete.iter().cloned());
            list
        } else {
            instance.content.on_fail.clone()
        };
        log.file(instance.clone());
        self.save_log(guild, log)?;
        info!(%guild, %character, %quest_id, status = %next, "quest finalized");
        let pending = PendingDispatch::for_quest(&instance, instructions);
        Ok(FinalizeStep::Done(instance, pending))
    }

    /// Cancels a quest without dispatching consequences.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown character or active
    /// quest.
    pub fn cancel_quest(
        &self,
        guild: GuildId,
        character: &CharacterId,
        quest_id: Uuid,
    ) -> Result<ActiveQuestInstance, DomainError> {
        let mut log = self.log_for(guild, character)?;
        if log.active_quest(quest_id).is_none() {
            return Err(DomainError::not_found("active_quest", quest_id));
        }
        let mut instance = log
            .take(quest_id)
            .ok_or_else(|| DomainError::not_found("active_quest", quest_id))?;
        instance.transition(QuestStatus::Failed, self.clock.now())?;
        log.file(instance.clone());
        self.save_log(guild, log)?;
        info!(%guild, %character, %quest_id, "quest cancelled");
        Ok(instance)
    }

    /// Removes a quest from the character's log entirely.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown character or quest.
    pub fn delete_quest(
        &self,
        guild: GuildId,
        character: &CharacterId,
        quest_id: Uuid,
    ) -> Result<ActiveQuestInstance, DomainError> {
        let mut log = self.log_for(guild, character)?;
        let removed = log
            .take(quest_id)
            .ok_or_else(|| DomainError::not_found("quest", quest_id))?;
        self.save_log(guild, log)?;
        warn!(%guild, %character, %quest_id, status = %removed.status, "quest deleted");
        Ok(removed)
    }

    /// Copies an instance before a mutation, for the revert ledger.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown character or quest.
    pub fn snapshot(
        &self,
        guild: GuildId,
        character: &CharacterId,
        quest_id: Uuid,
    ) -> Result<ActiveQuestInstance, DomainError> {
        self.log_for(guild, character)?
            .find(quest_id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("quest", quest_id))
    }

    /// Dispatches `first` and any quest transitions its consequences
    /// request, breadth first, up to the configured cascade depth.
    async fn run_dispatch(&self, guild: GuildId, first: PendingDispatch) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut queue = VecDeque::from([(first, 0_u32)]);
        while let Some((pending, depth)) = queue.pop_front() {
            let step = self
                .consequences
                .apply(
                    guild,
                    &pending.instructions,
                    &pending.source_id,
                    Some(&pending.owner),
                )
                .await;
            let requests = step.quest_requests.clone();
            report.absorb(step);
            for request in requests {
                if depth >= self.max_cascade_depth {
                    warn!(%guild, source_id = %pending.source_id, depth, "quest transition cascade too deep");
                    report.skipped.push(SkippedInstruction {
                        index: request.index,
                        action: ActionKind::UpdateQuestState,
                        reason: format!("cascade depth {} reached", self.max_cascade_depth),
                    });
                    continue;
                }
                match self.apply_quest_request(guild, &request) {
                    Ok(Some(next)) => queue.push_back((next, depth + 1)),
                    Ok(None) => {}
                    Err(error) => {
                        warn!(%guild, source_id = %pending.source_id, index = request.index, error = %error, "quest transition failed");
                        report.failed.push(InstructionFailure {
                            index: request.index,
                            action: ActionKind::UpdateQuestState,
                            error,
                            attempts: 1,
                            target: None,
                        });
                    }
                }
            }
        }
        report
    }

    fn apply_quest_request(
        &self,
        guild: GuildId,
        request: &QuestStateRequest,
    ) -> Result<Option<PendingDispatch>, DomainError> {
        if request.owner.kind != EntityKind::Character {
            return Err(DomainError::Validation(format!(
                "quest owner {} is not a character",
                request.owner
            )));
        }
        let character = CharacterId::new(request.owner.id.clone());
        match request.state {
            QuestStateAction::Start => {
                let template_id = request.template_id.as_deref().ok_or_else(|| {
                    DomainError::Validation("starting a quest needs template_id".into())
                })?;
                match self.begin_start(guild, &character, template_id)? {
                    StartStep::Existing(_) => Ok(None),
                    StartStep::Created(_, pending) => Ok(Some(pending)),
                }
            }
            QuestStateAction::Complete | QuestStateAction::Fail => {
                let quest_id = self.resolve_quest(guild, &character, request)?;
                let success = request.state == QuestStateAction::Complete;
                match self.finalize(guild, &character, quest_id, success)? {
                    FinalizeStep::Incomplete(unsatisfied) => Err(DomainError::Validation(format!(
                        "quest {quest_id} has unsatisfied objectives: {}",
                        unsatisfied.join(", ")
                    ))),
                    FinalizeStep::Done(_, pending) => Ok(Some(pending)),
                }
            }
            QuestStateAction::Cancel => {
                let quest_id = self.resolve_quest(guild, &character, request)?;
                self.cancel_quest(guild, &character, quest_id)?;
                Ok(None)
            }
        }
    }

    fn resolve_quest(
        &self,
        guild: GuildId,
        character: &CharacterId,
        request: &QuestStateRequest,
    ) -> Result<Uuid, DomainError> {
        if let Some(quest_id) = request.quest_id {
            return Ok(quest_id);
        }
        let template_id = request.template_id.as_deref().unwrap_or_default();
        self.log_for(guild, character)?
            .active_for_template(template_id)
            .map(|q| q.id)
            .ok_or_else(|| DomainError::not_found("active_quest", template_id))
    }

    pub(crate) fn log_for(
        &self,
        guild: GuildId,
        character: &CharacterId,
    ) -> Result<CharacterQuestLog, DomainError> {
        self.logs
            .get(guild, character.as_str())
            .ok_or_else(|| DomainError::not_found("character", character))
    }

    pub(crate) fn save_log(&self, guild: GuildId, log: CharacterQuestLog) -> Result<(), DomainError> {
        write_scoped(&self.logs, guild, |unit| {
            unit.add_modified(log);
            Ok(())
        })
    }

    pub(crate) fn templates_of(&self, guild: GuildId) -> Vec<QuestTemplate> {
        self.templates.values(guild)
    }

    pub(crate) fn moderation_requests(&self, guild: GuildId) -> Vec<ModerationRequest> {
        self.moderation.values(guild)
    }

    /// Loads persisted templates, quest logs and moderation requests.
    ///
    /// # Errors
    ///
    /// Returns the first row that fails to deserialize or belongs to
    /// another guild.
    pub fn hydrate(&self, guild: GuildId, rows: &[PersistedRow]) -> Result<usize, DomainError> {
        let templates = hydrate_cache(&self.templates, guild, RowKind::QuestTemplate, rows)?;
        let logs = hydrate_cache(&self.logs, guild, RowKind::QuestLog, rows)?;
        let requests = hydrate_cache(&self.moderation, guild, RowKind::ModerationRequest, rows)?;
        Ok(templates + logs + requests)
    }

    /// Writes every dirty template, log and request of `guild`.
    ///
    /// All three caches are attempted; keys of a cache whose write fails
    /// stay dirty.
    ///
    /// # Errors
    ///
    /// Returns the first persistence error.
    pub async fn flush(
        &self,
        guild: GuildId,
        persistence: &dyn PersistenceService,
    ) -> Result<FlushStats, DomainError> {
        let results = [
            flush_cache(&self.templates, guild, RowKind::QuestTemplate, persistence).await,
            flush_cache(&self.logs, guild, RowKind::QuestLog, persistence).await,
            flush_cache(&self.moderation, guild, RowKind::ModerationRequest, persistence).await,
        ];
        let mut stats = FlushStats::default();
        for result in results {
            stats = stats.merge(result?);
        }
        Ok(stats)
    }

    /// Dirty keys per row kind; kinds without dirty keys are omitted.
    #[must_use]
    pub fn dirty_keys(&self, guild: GuildId) -> BTreeMap<RowKind, BTreeSet<String>> {
        [
            (RowKind::QuestTemplate, self.templates.dirty_keys(guild)),
            (RowKind::QuestLog, self.logs.dirty_keys(guild)),
            (RowKind::ModerationRequest, self.moderation.dirty_keys(guild)),
        ]
        .into_iter()
        .filter(|(_, keys)| !keys.is_empty())
        .collect()
    }

    /// Forgets every dirty mark of `guild` without writing.
    pub fn clear_dirty(&self, guild: GuildId) {
        self.templates.clear_dirty(guild);
        self.logs.clear_dirty(guild);
        self.moderation.clear_dirty(guild);
    }

    /// Drops everything cached for `guild`.
    pub fn evict(&self, guild: GuildId) {
        self.templates.evict_guild(guild);
        self.logs.evict_guild(guild);
        self.moderation.evict_guild(guild);
    }
}
