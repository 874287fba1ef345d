//! The consequence engine.
//!
//! Dispatches an ordered list of instructions one at a time. Each instruction
//! is validated, resolved against its targets and executed in isolation; a
//! failure is logged with the full instruction and recorded in the
//! [`DispatchReport`], and the next instruction runs regardless.

use std::future::Future;
use std::sync::Arc;

use guildhall_core::clock::Clock;
use guildhall_core::config::RetryPolicy;
use guildhall_core::error::DomainError;
use guildhall_core::guild::{CharacterId, EntityRef, GuildId};
use guildhall_core::ports::{Notifier, RelationshipGateway, WorldGateway};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::application::registry::{
    ConsequenceHandler, CustomFunction, CustomFunctionRegistry, HandlerContext, HandlerRegistry,
};
use crate::domain::instruction::{ConsequenceInstruction, ValidatedAction};
use crate::domain::report::{
    AuditEntry, DispatchReport, InstructionFailure, QuestStateRequest, SkippedInstruction,
};

/// Fans consequence instructions out to the subsystems that own the state.
pub struct ConsequenceEngine {
    world: Arc<dyn WorldGateway>,
    notifier: Arc<dyn Notifier>,
    relationships: Option<Arc<dyn RelationshipGateway>>,
    handlers: HandlerRegistry,
    functions: CustomFunctionRegistry,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ConsequenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsequenceEngine")
            .field("handlers", &self.handlers)
            .field("functions", &self.functions)
            .field("relationships", &self.relationships.is_some())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// The unit a single attempt works on.
enum Scope<'a> {
    /// One target of a per-target action.
    Target(&'a EntityRef),
    /// The whole instruction.
    Instruction,
}

impl ConsequenceEngine {
    /// Creates an engine with no extensions, no relationship gateway and the
    /// `Drop` retry policy.
    #[must_use]
    pub fn new(
        world: Arc<dyn WorldGateway>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            world,
            notifier,
            relationships: None,
            handlers: HandlerRegistry::default(),
            functions: CustomFunctionRegistry::default(),
            retry: RetryPolicy::Drop,
            clock,
        }
    }

    /// Routes relationship actions to `gateway`.
    #[must_use]
    pub fn with_relationships(mut self, gateway: Arc<dyn RelationshipGateway>) -> Self {
        self.relationships = Some(gateway);
        self
    }

    /// Sets the policy for instructions that fail in a collaborator.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Registers a handler for an extension action tag.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if `name` is built in or taken.
    pub fn register_handler(
        &mut self,
        name: &str,
        handler: Arc<dyn ConsequenceHandler>,
    ) -> Result<(), DomainError> {
        self.handlers.register(name, handler)
    }

    /// Registers a function for the `custom` action kind.
    pub fn register_function(&mut self, name: &str, function: Arc<dyn CustomFunction>) {
        self.functions.register(name, function);
    }

    /// Applies `instructions` in order on behalf of `source_id`.
    ///
    /// `target` is used for instructions without explicit targets. This
    /// never fails as a whole: every instruction ends up applied, deferred
    /// (quest transitions), skipped or failed in the returned report.
    #[instrument(
        skip_all,
        fields(guild = %guild, source_id = %source_id, count = instructions.len())
    )]
    pub async fn apply(
        &self,
        guild: GuildId,
        instructions: &[ConsequenceInstruction],
        source_id: &str,
        target: Option<&EntityRef>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        for (index, instruction) in instructions.iter().enumerate() {
            self.apply_one(guild, index, instruction, source_id, target, &mut report)
                .await;
        }
        if !report.failed.is_empty() {
            warn!(
                failed = report.failed.len(),
                applied = report.applied.len(),
                "consequence dispatch finished with failures"
            );
        }
        report
    }

    async fn apply_one(
        &self,
        guild: GuildId,
        index: usize,
        instruction: &ConsequenceInstruction,
        source_id: &str,
        dispatch_target: Option<&EntityRef>,
        report: &mut DispatchReport,
    ) {
        let fail = |report: &mut DispatchReport,
                    error: DomainError,
                    attempts: u32,
                    target: Option<&EntityRef>| {
            warn!(
                %guild,
                source_id,
                index,
                action = %instruction.action,
                target = ?target.map(ToString::to_string),
                instruction = %serde_json::to_string(instruction).unwrap_or_default(),
                error = %error,
                attempts,
                "consequence instruction failed"
            );
            report.failed.push(InstructionFailure {
                index,
                action: instruction.action.clone(),
                error,
                attempts,
                target: target.cloned(),
            });
        };

        let action = match instruction.validate() {
            Ok(action) => action,
            Err(error) => return fail(report, error, 0, None),
        };

        let targets: Vec<EntityRef> = if instruction.targets.is_empty() {
            dispatch_target.cloned().into_iter().collect()
        } else {
            instruction.targets.clone()
        };
        if instruction.needs_target() && targets.is_empty() {
            return fail(
                report,
                DomainError::Validation(format!("{} has no target", instruction.action)),
                0,
                None,
            );
        }

        if let Some(reason) = self.skip_reason(&action) {
            warn!(%guild, source_id, index, action = %instruction.action, reason = %reason, "consequence instruction skipped");
            report.skipped.push(SkippedInstruction {
                index,
                action: instruction.action.clone(),
                reason,
            });
            return;
        }

        if let ValidatedAction::UpdateQuestState(params) = &action {
            let owner = targets[0].clone();
            debug!(%guild, index, owner = %owner, state = ?params.state, "deferring quest transition");
            report.quest_requests.push(QuestStateRequest {
                index,
                owner,
                state: params.state,
                quest_id: params.quest_id,
                template_id: params.template_id.clone(),
            });
            self.record_applied(guild, index, instruction, source_id, &targets, json!({ "deferred": true }), 1, report);
            return;
        }

        let pair = if let ValidatedAction::ModifyRelationship(_) = &action {
            match relationship_pair(instruction, dispatch_target) {
                Ok(pair) => Some(pair),
                Err(error) => return fail(report, error, 0, None),
            }
        } else {
            None
        };

        let context = HandlerContext {
            guild,
            source_id,
            targets: &targets,
        };

        let per_target = matches!(
            action,
            ValidatedAction::ModifyStat(_)
                | ValidatedAction::AddItem(_)
                | ValidatedAction::RemoveItem(_)
                | ValidatedAction::ChangeLocation(_)
                | ValidatedAction::ApplyStatusEffect(_)
                | ValidatedAction::AwardExperience(_)
        );

        if !per_target {
            let (result, attempts) = self
                .with_retry(|| self.execute(context, Scope::Instruction, instruction, &action, pair.as_ref()))
                .await;
            match result {
                Ok(detail) => {
                    self.notify_players(guild, instruction, &targets, &detail).await;
                    self.record_applied(guild, index, instruction, source_id, &targets, detail, attempts, report);
                }
                Err(error) => fail(report, error, attempts, None),
            }
            return;
        }

        // A failing target is reported on its own; targets already changed
        // stay applied.
        let mut reached = Vec::new();
        let mut details = Vec::new();
        let mut total_attempts = 0;
        for target in &targets {
            let (result, attempts) = self
                .with_retry(|| self.execute(context, Scope::Target(target), instruction, &action, None))
                .await;
            match result {
                Ok(detail) => {
                    total_attempts += attempts;
                    reached.push(target.clone());
                    details.push(detail);
                }
                Err(error) => fail(report, error, attempts, Some(target)),
            }
        }
        if reached.is_empty() {
            return;
        }

        let detail = if details.len() == 1 {
            details.remove(0)
        } else {
            serde_json::Value::Array(details)
        };
        self.notify_players(guild, instruction, &reached, &detail).await;
        self.record_applied(guild, index, instruction, source_id, &reached, detail, total_attempts, report);
    }

    fn skip_reason(&self, action: &ValidatedAction) -> Option<String> {
        match action {
            ValidatedAction::Custom(call) if self.functions.get(&call.function).is_none() => {
                Some(format!("custom function {} is not registered", call.function))
            }
            ValidatedAction::Extension(name) if self.handlers.get(name).is_none() => {
                Some(format!("no handler registered for action {name}"))
            }
            ValidatedAction::ModifyRelationship(_) | ValidatedAction::RelationshipEvent(_)
                if self.relationships.is_none() =>
            {
                Some("relationship gateway is not configured".to_owned())
            }
            _ => None,
        }
    }

    async fn with_retry<F, Fut>(&self, mut attempt: F) -> (Result<serde_json::Value, DomainError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, DomainError>>,
    {
        let allowed = self.retry.attempts();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match attempt().await {
                Err(error) if error.is_collaborator() && attempts < allowed => {
                    debug!(attempts, allowed, error = %error, "retrying consequence instruction");
                }
                result => return (result, attempts),
            }
        }
    }

    async fn execute(
        &self,
        context: HandlerContext<'_>,
        scope: Scope<'_>,
        instruction: &ConsequenceInstruction,
        action: &ValidatedAction,
        pair: Option<&(EntityRef, EntityRef)>,
    ) -> Result<serde_json::Value, DomainError> {
        let guild = context.guild;
        let target = match scope {
            Scope::Target(target) => Some(target),
            Scope::Instruction => None,
        };
        let require_target = || {
            target.ok_or_else(|| DomainError::Validation(format!("{} has no target", instruction.action)))
        };

        match action {
            ValidatedAction::ModifyStat(params) => {
                let target = require_target()?;
                let value = self
                    .world
                    .modify_stat(guild, target, &params.stat, params.delta)
                    .await?;
                Ok(json!({ "target": target.to_string(), "stat": params.stat, "delta": params.delta, "value": value }))
            }
            ValidatedAction::AddItem(params) => {
                let target = require_target()?;
                self.world
                    .add_item(guild, target, &params.item_id, params.quantity)
                    .await?;
                Ok(json!({ "target": target.to_string(), "item_id": params.item_id, "quantity": params.quantity }))
            }
            ValidatedAction::RemoveItem(params) => {
                let target = require_target()?;
                self.world
                    .remove_item(guild, target, &params.item_id, params.quantity)
                    .await?;
                Ok(json!({ "target": target.to_string(), "item_id": params.item_id, "quantity": params.quantity }))
            }
            ValidatedAction::ChangeLocation(params) => {
                let target = require_target()?;
                self.world
                    .change_location(guild, target, &params.location_id)
                    .await?;
                Ok(json!({ "target": target.to_string(), "location_id": params.location_id }))
            }
            ValidatedAction::ApplyStatusEffect(params) => {
                let target = require_target()?;
                self.world
                    .apply_status_effect(guild, target, &params.effect, params.duration_turns)
                    .await?;
                Ok(json!({ "target": target.to_string(), "effect": params.effect, "duration_turns": params.duration_turns }))
            }
            ValidatedAction::AwardExperience(params) => {
                let target = require_target()?;
                self.world
                    .award_experience(guild, target, params.amount)
                    .await?;
                Ok(json!({ "target": target.to_string(), "amount": params.amount }))
            }
            ValidatedAction::StartEvent(params) => {
                self.world
                    .start_event(guild, &params.event_id, &params.params)
                    .await?;
                Ok(json!({ "event_id": params.event_id }))
            }
            ValidatedAction::ModifyRelationship(params) => {
                let gateway = self.relationship_gateway()?;
                let (a, b) = pair.ok_or_else(|| {
                    DomainError::Validation("modify_relationship needs two entities".into())
                })?;
                let strength = gateway
                    .adjust(guild, a, b, &params.relationship_type, params.change())
                    .await?;
                Ok(json!({ "a": a.to_string(), "b": b.to_string(), "relationship_type": params.relationship_type, "strength": strength }))
            }
            ValidatedAction::RelationshipEvent(params) => {
                let gateway = self.relationship_gateway()?;
                let mut event_context = params.context.clone();
                event_context
                    .entry("source_id".to_owned())
                    .or_insert_with(|| json!(context.source_id));
                if let Some(first) = context.targets.first() {
                    event_context
                        .entry("target_id".to_owned())
                        .or_insert_with(|| json!(first.id));
                }
                let changed = gateway
                    .fire_event(guild, &params.event_type, &event_context)
                    .await?;
                Ok(json!({ "event_type": params.event_type, "changed": changed }))
            }
            ValidatedAction::Custom(call) => {
                let function = self.functions.get(&call.function).ok_or_else(|| {
                    DomainError::Validation(format!("custom function {} is not registered", call.function))
                })?;
                function.call(context, &call.args).await
            }
            ValidatedAction::Extension(name) => {
                let handler = self.handlers.get(name).ok_or_else(|| {
                    DomainError::Validation(format!("no handler registered for action {name}"))
                })?;
                handler.handle(context, instruction).await
            }
            ValidatedAction::UpdateQuestState(_) => Err(DomainError::Validation(
                "quest transitions are applied by the quest lifecycle".into(),
            )),
        }
    }

    fn relationship_gateway(&self) -> Result<&Arc<dyn RelationshipGateway>, DomainError> {
        self.relationships
            .as_ref()
            .ok_or_else(|| DomainError::Validation("relationship gateway is not configured".into()))
    }

    async fn notify_players(
        &self,
        guild: GuildId,
        instruction: &ConsequenceInstruction,
        targets: &[EntityRef],
        detail: &serde_json::Value,
    ) {
        let event_kind = format!("consequence.{}", instruction.action);
        for target in targets.iter().filter(|t| t.kind.is_player_controlled()) {
            let character = CharacterId::new(target.id.clone());
            if let Err(error) = self
                .notifier
                .notify(guild, &character, &event_kind, detail)
                .await
            {
                warn!(%guild, character = %character, event_kind = %event_kind, error = %error, "notification failed");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_applied(
        &self,
        guild: GuildId,
        index: usize,
        instruction: &ConsequenceInstruction,
        source_id: &str,
        targets: &[EntityRef],
        detail: serde_json::Value,
        attempts: u32,
        report: &mut DispatchReport,
    ) {
        info!(
            target: "guildhall::audit",
            %guild,
            source_id,
            index,
            action = %instruction.action,
            targets = ?targets.iter().map(ToString::to_string).collect::<Vec<_>>(),
            detail = %detail,
            attempts,
            "consequence applied"
        );
        report.applied.push(AuditEntry {
            index,
            action: instruction.action.clone(),
            source_id: source_id.to_owned(),
            targets: targets.to_vec(),
            detail,
            attempts,
            occurred_at: self.clock.now(),
        });
    }
}

/// Resolves the two entities of a `modify_relationship` instruction: both
/// explicit targets, or the dispatch target and the single explicit target.
fn relationship_pair(
    instruction: &ConsequenceInstruction,
    dispatch_target: Option<&EntityRef>,
) -> Result<(EntityRef, EntityRef), DomainError> {
    match (instruction.targets.as_slice(), dispatch_target) {
        ([a, b], _) => Ok((a.clone(), b.clone())),
        ([other], Some(owner)) => Ok((owner.clone(), other.clone())),
        _ => Err(DomainError::Validation(
            "modify_relationship needs two entities".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use guildhall_core::guild::EntityKind;
    use guildhall_core::ports::{EventContext, StrengthChange};
    use guildhall_test_support::{RecordingNotifier, RecordingWorld, WorldCall, fixed_clock};
    use serde_json::json;

    use super::*;
    use crate::domain::instruction::{ActionKind, QuestStateAction};

    const GUILD: GuildId = GuildId(7);

    fn hero() -> EntityRef {
        EntityRef::new("c-1", EntityKind::Character)
    }

    fn engine_with(world: Arc<RecordingWorld>, notifier: Arc<RecordingNotifier>) -> ConsequenceEngine {
        ConsequenceEngine::new(world, notifier, Arc::new(fixed_clock()))
    }

    fn award(amount: i64) -> ConsequenceInstruction {
        ConsequenceInstruction::new(ActionKind::AwardExperience).with_param("amount", amount)
    }

    #[tokio::test]
    async fn test_malformed_instruction_does_not_stop_later_ones() {
        // Arrange
        let world = Arc::new(RecordingWorld::new());
        let engine = engine_with(world.clone(), Arc::new(RecordingNotifier::new()));
        let instructions = vec![
            award(10),
            ConsequenceInstruction::new(ActionKind::ModifyStat).with_param("stat", "hp"),
            ConsequenceInstruction::new(ActionKind::AddItem).with_param("item_id", "rope"),
        ];

        // Act
        let report = engine.apply(GUILD, &instructions, "quest-1", Some(&hero())).await;

        // Assert
        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].index, 1);
        assert_eq!(
            world.calls(),
            vec![
                WorldCall::AwardExperience {
                    target: "c-1".into(),
                    amount: 10
                },
                WorldCall::AddItem {
                    target: "c-1".into(),
                    item_id: "rope".into(),
                    quantity: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_collaborator_failure_for_one_target_is_isolated() {
        let world = Arc::new(RecordingWorld::new().failing_for("ghost"));
        let engine = engine_with(world.clone(), Arc::new(RecordingNotifier::new()));
        let instructions = vec![
            award(5).with_target(EntityRef::new("ghost", EntityKind::Npc)),
            award(7),
        ];

        let report = engine.apply(GUILD, &instructions, "quest-1", Some(&hero())).await;

        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].error, DomainError::NotFound { .. }));
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].index, 1);
    }

    #[tokio::test]
    async fn test_failing_second_target_keeps_first_target_audited() {
        // Arrange
        let world = Arc::new(RecordingWorld::new().failing_for("ghost"));
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = engine_with(world.clone(), notifier.clone());
        let ghost = EntityRef::new("ghost", EntityKind::Npc);
        let instruction = award(10).with_target(hero()).with_target(ghost.clone());

        // Act
        let report = engine.apply(GUILD, &[instruction], "quest-1", None).await;

        // Assert
        assert_eq!(
            world.calls(),
            vec![WorldCall::AwardExperience {
                target: "c-1".into(),
                amount: 10
            }]
        );
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].targets, vec![hero()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].index, 0);
        assert_eq!(report.failed[0].target, Some(ghost));
        assert!(matches!(report.failed[0].error, DomainError::NotFound { .. }));
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_instruction_without_any_target_fails_validation() {
        let engine = engine_with(Arc::new(RecordingWorld::new()), Arc::new(RecordingNotifier::new()));

        let report = engine.apply(GUILD, &[award(5)], "rule-1", None).await;

        assert!(matches!(report.failed[0].error, DomainError::Validation(_)));
        assert_eq!(report.failed[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_player_targets_are_notified_and_npcs_are_not() {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = engine_with(Arc::new(RecordingWorld::new()), notifier.clone());
        let instructions = vec![
            award(5),
            award(5).with_target(EntityRef::new("n-1", EntityKind::Npc)),
        ];

        engine.apply(GUILD, &instructions, "quest-1", Some(&hero())).await;

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].character, CharacterId::new("c-1"));
        assert_eq!(sent[0].event_kind, "consequence.award_experience");
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_fail_instruction() {
        let engine = engine_with(Arc::new(RecordingWorld::new()), Arc::new(RecordingNotifier::failing()));

        let report = engine.apply(GUILD, &[award(5)], "quest-1", Some(&hero())).await;

        assert!(report.is_clean());
        assert_eq!(report.applied.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_policy_retries_collaborator_failures() {
        let world = Arc::new(RecordingWorld::flaky(2));
        let engine = engine_with(world.clone(), Arc::new(RecordingNotifier::new()))
            .with_retry_policy(RetryPolicy::Retry { max_attempts: 3 });

        let report = engine.apply(GUILD, &[award(5)], "quest-1", Some(&hero())).await;

        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].attempts, 3);
        assert_eq!(world.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_policy_gives_up_after_first_failure() {
        let world = Arc::new(RecordingWorld::flaky(1));
        let engine = engine_with(world.clone(), Arc::new(RecordingNotifier::new()));

        let report = engine.apply(GUILD, &[award(5), award(6)], "quest-1", Some(&hero())).await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].attempts, 1);
        assert_eq!(report.applied.len(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_custom_function_is_skipped() {
        let world = Arc::new(RecordingWorld::new());
        let engine = engine_with(world.clone(), Arc::new(RecordingNotifier::new()));
        let instructions = vec![
            ConsequenceInstruction::new(ActionKind::Custom).with_param("function", "open_portal"),
            award(5),
        ];

        let report = engine.apply(GUILD, &instructions, "quest-1", Some(&hero())).await;

        assert_eq!(report.skipped.len(), 1);
        assert!(report.failed.is_empty());
        assert_eq!(report.applied.len(), 1);
    }

    struct Echo;

    #[async_trait]
    impl CustomFunction for Echo {
        async fn call(
            &self,
            context: HandlerContext<'_>,
            args: &serde_json::Value,
        ) -> Result<serde_json::Value, DomainError> {
            Ok(json!({ "source": context.source_id, "args": args }))
        }
    }

    #[tokio::test]
    async fn test_registered_custom_function_runs_with_args() {
        let mut engine = engine_with(Arc::new(RecordingWorld::new()), Arc::new(RecordingNotifier::new()));
        engine.register_function("echo", Arc::new(Echo));
        let instruction = ConsequenceInstruction::new(ActionKind::Custom)
            .with_param("function", "echo")
            .with_param("args", json!({ "door": "north" }));

        let report = engine.apply(GUILD, &[instruction], "quest-9", None).await;

        assert_eq!(
            report.applied[0].detail,
            json!({ "source": "quest-9", "args": { "door": "north" } })
        );
    }

    struct CountTargets;

    #[async_trait]
    impl ConsequenceHandler for CountTargets {
        async fn handle(
            &self,
            context: HandlerContext<'_>,
            _instruction: &ConsequenceInstruction,
        ) -> Result<serde_json::Value, DomainError> {
            Ok(json!(context.targets.len()))
        }
    }

    #[tokio::test]
    async fn test_extension_handler_resolves_by_name() {
        let mut engine = engine_with(Arc::new(RecordingWorld::new()), Arc::new(RecordingNotifier::new()));
        engine.register_handler("summon_storm", Arc::new(CountTargets)).unwrap();
        let instructions = vec![
            ConsequenceInstruction::new(ActionKind::from("summon_storm")),
            ConsequenceInstruction::new(ActionKind::from("unknown_thing")),
        ];

        let report = engine.apply(GUILD, &instructions, "event-1", Some(&hero())).await;

        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].detail, json!(1));
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].index, 1);
    }

    #[tokio::test]
    async fn test_quest_state_instruction_is_deferred_to_lifecycle() {
        let engine = engine_with(Arc::new(RecordingWorld::new()), Arc::new(RecordingNotifier::new()));
        let instruction = ConsequenceInstruction::new(ActionKind::UpdateQuestState)
            .with_param("state", "start")
            .with_param("template_id", "T2");

        let report = engine.apply(GUILD, &[instruction], "quest-1", Some(&hero())).await;

        assert_eq!(report.quest_requests.len(), 1);
        let request = &report.quest_requests[0];
        assert_eq!(request.owner, hero());
        assert_eq!(request.state, QuestStateAction::Start);
        assert_eq!(request.template_id.as_deref(), Some("T2"));
    }

    #[derive(Default)]
    struct RecordingRelationships {
        adjusted: Mutex<Vec<(EntityRef, EntityRef, String, StrengthChange)>>,
        events: Mutex<Vec<(String, EventContext)>>,
    }

    #[async_trait]
    impl RelationshipGateway for RecordingRelationships {
        async fn adjust(
            &self,
            _guild: GuildId,
            a: &EntityRef,
            b: &EntityRef,
            relationship_type: &str,
            change: StrengthChange,
        ) -> Result<f64, DomainError> {
            self.adjusted.lock().unwrap().push((
                a.clone(),
                b.clone(),
                relationship_type.to_owned(),
                change,
            ));
            Ok(12.0)
        }

        async fn fire_event(
            &self,
            _guild: GuildId,
            event_type: &str,
            context: &EventContext,
        ) -> Result<usize, DomainError> {
            self.events
                .lock()
                .unwrap()
                .push((event_type.to_owned(), context.clone()));
            Ok(2)
        }
    }

    #[tokio::test]
    async fn test_modify_relationship_pairs_dispatch_target_with_single_target() {
        let relationships = Arc::new(RecordingRelationships::default());
        let engine = engine_with(Arc::new(RecordingWorld::new()), Arc::new(RecordingNotifier::new()))
            .with_relationships(relationships.clone());
        let smith = EntityRef::new("npc-smith", EntityKind::Npc);
        let instruction = ConsequenceInstruction::new(ActionKind::ModifyRelationship)
            .with_target(smith.clone())
            .with_param("relationship_type", "trust")
            .with_param("mode", "set")
            .with_param("amount", 12.0);

        let report = engine.apply(GUILD, &[instruction], "quest-1", Some(&hero())).await;

        assert!(report.is_clean());
        let adjusted = relationships.adjusted.lock().unwrap().clone();
        assert_eq!(
            adjusted,
            vec![(hero(), smith, "trust".to_owned(), StrengthChange::Set(12.0))]
        );
        assert_eq!(report.applied[0].detail["strength"], json!(12.0));
    }

    #[tokio::test]
    async fn test_relationship_event_fills_source_and_target_context() {
        let relationships = Arc::new(RecordingRelationships::default());
        let engine = engine_with(Arc::new(RecordingWorld::new()), Arc::new(RecordingNotifier::new()))
            .with_relationships(relationships.clone());
        let instruction = ConsequenceInstruction::new(ActionKind::RelationshipEvent)
            .with_param("event_type", "quest_completed")
            .with_param("context", json!({ "outcome": "success" }));

        let report = engine.apply(GUILD, &[instruction], "quest-1", Some(&hero())).await;

        assert_eq!(report.applied[0].detail["changed"], json!(2));
        let events = relationships.events.lock().unwrap().clone();
        let (event_type, context) = &events[0];
        assert_eq!(event_type, "quest_completed");
        assert_eq!(context["outcome"], json!("success"));
        assert_eq!(context["source_id"], json!("quest-1"));
        assert_eq!(context["target_id"], json!("c-1"));
    }

    #[tokio::test]
    async fn test_relationship_actions_skip_without_gateway() {
        let engine = engine_with(Arc::new(RecordingWorld::new()), Arc::new(RecordingNotifier::new()));
        let instruction = ConsequenceInstruction::new(ActionKind::RelationshipEvent)
            .with_param("event_type", "quest_completed");

        let report = engine.apply(GUILD, &[instruction], "quest-1", None).await;

        assert_eq!(report.skipped.len(), 1);
    }
}
