//! The guild engine.
//!
//! Guild state lives in the managers' caches. A guild is hydrated from the
//! persistence service on first use; afterwards every operation works on
//! the cache and leaves dirty keys behind for [`GuildEngine::flush`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use guildhall_consequence::application::engine::ConsequenceEngine;
use guildhall_content::application::installer::{InstallSummary, install_pack};
use guildhall_content::domain::pack::ContentPack;
use guildhall_core::clock::Clock;
use guildhall_core::config::EngineConfig;
use guildhall_core::error::DomainError;
use guildhall_core::guild::{CharacterId, EntityRef, GuildId};
use guildhall_core::persistence::FlushStats;
use guildhall_core::ports::{
    ContentGenerator, EventContext, Notifier, PersistenceService, RowKind, StructuredValidator,
    WorldGateway,
};
use guildhall_quest::application::lifecycle::{
    CompletionResult, ProgressOutcome, QuestLifecycle, QuestOutcome, StartOutcome, TemplateRef,
};
use guildhall_quest::domain::instance::ActiveQuestInstance;
use guildhall_relationship::application::evaluator::RelationshipRuleEvaluator;
use guildhall_relationship::domain::record::RelationshipRecord;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::EngineError;

/// The services the engine depends on but does not implement.
pub struct Collaborators {
    /// Guild-state storage.
    pub persistence: Arc<dyn PersistenceService>,
    /// Quest content generation.
    pub generator: Arc<dyn ContentGenerator>,
    /// Structured validation of generated content.
    pub validator: Arc<dyn StructuredValidator>,
    /// Player notifications.
    pub notifier: Arc<dyn Notifier>,
    /// World, inventory and stats.
    pub world: Arc<dyn WorldGateway>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Owns every manager and the set of loaded guilds.
pub struct GuildEngine {
    config: EngineConfig,
    persistence: Arc<dyn PersistenceService>,
    quests: QuestLifecycle,
    relationships: Arc<RelationshipRuleEvaluator>,
    loaded: Mutex<BTreeSet<GuildId>>,
}

impl std::fmt::Debug for GuildEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuildEngine")
            .field("config", &self.config)
            .field("loaded", &self.loaded_guilds())
            .finish_non_exhaustive()
    }
}

impl GuildEngine {
    /// Builds an engine without consequence extensions.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if `config` is inconsistent.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self, EngineError> {
        Self::with_extensions(config, collaborators, |_| Ok(()))
    }

    /// Builds an engine, letting `extend` register consequence handlers and
    /// custom functions before the engine is shared.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if `config` is inconsistent and
    /// `EngineError::Domain` if `extend` fails.
    pub fn with_extensions<F>(
        config: EngineConfig,
        collaborators: Collaborators,
        extend: F,
    ) -> Result<Self, EngineError>
    where
        F: FnOnce(&mut ConsequenceEngine) -> Result<(), DomainError>,
    {
        config.validate()?;
        let Collaborators {
            persistence,
            generator,
            validator,
            notifier,
            world,
            clock,
        } = collaborators;

        let relationships = Arc::new(RelationshipRuleEvaluator::new(
            config.strength_bounds,
            clock.clone(),
        ));
        let mut consequences = ConsequenceEngine::new(world, notifier, clock.clone())
            .with_relationships(relationships.clone())
            .with_retry_policy(config.consequence_retry);
        extend(&mut consequences)?;

        let quests = QuestLifecycle::new(Arc::new(consequences), generator, validator, clock)
            .with_max_cascade_depth(config.max_cascade_depth);

        Ok(Self {
            config,
            persistence,
            quests,
            relationships,
            loaded: Mutex::new(BTreeSet::new()),
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Guilds whose state is in memory.
    #[must_use]
    pub fn loaded_guilds(&self) -> BTreeSet<GuildId> {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Loads `guild` from persistence unless it is already in memory.
    ///
    /// Two tasks racing to load the same guild may both read from
    /// persistence; only the first result is hydrated.
    ///
    /// # Errors
    ///
    /// Returns the persistence error, or a hydration error
    /// (`DomainError::Validation` or `DomainError::TenantViolation`), in
    /// which case nothing of the guild stays cached.
    #[instrument(skip_all, fields(guild = %guild))]
    pub async fn load_guild_state(&self, guild: GuildId) -> Result<(), DomainError> {
        if self.is_loaded(guild) {
            return Ok(());
        }
        let rows = self.persistence.load_guild_state(guild).await?;

        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        if loaded.contains(&guild) {
            debug!("guild loaded concurrently, discarding rows");
            return Ok(());
        }
        let hydrated = self.quests.hydrate(guild, &rows).and_then(|quests| {
            self.relationships
                .hydrate(guild, &rows)
                .map(|relationships| quests + relationships)
        });
        match hydrated {
            Ok(count) => {
                loaded.insert(guild);
                info!(rows = count, "guild state loaded");
                Ok(())
            }
            Err(e) => {
                self.quests.evict(guild);
                self.relationships.evict(guild);
                warn!(error = %e, "guild state rejected");
                Err(e)
            }
        }
    }

    fn is_loaded(&self, guild: GuildId) -> bool {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&guild)
    }

    /// The quest lifecycle, after making sure `guild` is loaded.
    ///
    /// # Errors
    ///
    /// See [`GuildEngine::load_guild_state`].
    pub async fn quests(&self, guild: GuildId) -> Result<&QuestLifecycle, DomainError> {
        self.load_guild_state(guild).await?;
        Ok(&self.quests)
    }

    /// The relationship evaluator, after making sure `guild` is loaded.
    ///
    /// # Errors
    ///
    /// See [`GuildEngine::load_guild_state`].
    pub async fn relationships(
        &self,
        guild: GuildId,
    ) -> Result<&RelationshipRuleEvaluator, DomainError> {
        self.load_guild_state(guild).await?;
        Ok(&self.relationships)
    }

    /// Parses, validates and installs a YAML content pack.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a malformed pack.
    pub async fn install_content_pack(
        &self,
        guild: GuildId,
        yaml: &str,
    ) -> Result<InstallSummary, DomainError> {
        self.load_guild_state(guild).await?;
        let parsed = ContentPack::parse(yaml)?;
        install_pack(guild, parsed, &self.quests, &self.relationships)
    }

    /// Creates the character's quest log if it does not exist.
    ///
    /// # Errors
    ///
    /// See [`GuildEngine::load_guild_state`].
    pub async fn register_character(
        &self,
        guild: GuildId,
        character: &CharacterId,
    ) -> Result<(), DomainError> {
        self.quests(guild).await?.register_character(guild, character)?;
        Ok(())
    }

    /// See [`QuestLifecycle::start_quest`].
    ///
    /// # Errors
    ///
    /// As [`QuestLifecycle::start_quest`], plus load errors.
    pub async fn start_quest(
        &self,
        guild: GuildId,
        character: &CharacterId,
        template: &TemplateRef,
    ) -> Result<StartOutcome, DomainError> {
        self.quests(guild)
            .await?
            .start_quest(guild, character, template)
            .await
    }

    /// See [`QuestLifecycle::approve_moderated`].
    ///
    /// # Errors
    ///
    /// As [`QuestLifecycle::approve_moderated`], plus load errors.
    pub async fn approve_moderated(
        &self,
        guild: GuildId,
        request_id: Uuid,
    ) -> Result<QuestOutcome, DomainError> {
        self.quests(guild)
            .await?
            .approve_moderated(guild, request_id)
            .await
    }

    /// See [`QuestLifecycle::update_progress`].
    ///
    /// # Errors
    ///
    /// As [`QuestLifecycle::update_progress`], plus load errors.
    pub async fn update_progress(
        &self,
        guild: GuildId,
        character: &CharacterId,
        quest_id: Uuid,
        objective_id: &str,
        delta: &Value,
    ) -> Result<ProgressOutcome, DomainError> {
        self.quests(guild)
            .await?
            .update_progress(guild, character, quest_id, objective_id, delta)
            .await
    }

    /// See [`QuestLifecycle::complete_quest`].
    ///
    /// # Errors
    ///
    /// As [`QuestLifecycle::complete_quest`], plus load errors.
    pub async fn complete_quest(
        &self,
        guild: GuildId,
        character: &CharacterId,
        quest_id: Uuid,
        success: bool,
    ) -> Result<CompletionResult, DomainError> {
        self.quests(guild)
            .await?
            .complete_quest(guild, character, quest_id, success)
            .await
    }

    /// See [`QuestLifecycle::fail_quest`].
    ///
    /// # Errors
    ///
    /// As [`QuestLifecycle::fail_quest`], plus load errors.
    pub async fn fail_quest(
        &self,
        guild: GuildId,
        character: &CharacterId,
        quest_id: Uuid,
    ) -> Result<CompletionResult, DomainError> {
        self.quests(guild)
            .await?
            .fail_quest(guild, character, quest_id)
            .await
    }

    /// The character's active quests.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown character, plus load
    /// errors.
    pub async fn list_active_quests(
        &self,
        guild: GuildId,
        character: &CharacterId,
    ) -> Result<Vec<ActiveQuestInstance>, DomainError> {
        self.quests(guild)
            .await?
            .list_active_quests(guild, character)
    }

    /// See [`RelationshipRuleEvaluator::on_event`].
    ///
    /// # Errors
    ///
    /// As [`RelationshipRuleEvaluator::on_event`], plus load errors.
    pub async fn on_event(
        &self,
        guild: GuildId,
        event_type: &str,
        context: &EventContext,
    ) -> Result<Vec<RelationshipRecord>, DomainError> {
        self.relationships(guild)
            .await?
            .on_event(guild, event_type, context)
    }

    /// See [`RelationshipRuleEvaluator::get_relationship`].
    ///
    /// # Errors
    ///
    /// As [`RelationshipRuleEvaluator::get_relationship`], plus load errors.
    pub async fn get_relationship(
        &self,
        guild: GuildId,
        a: &EntityRef,
        b: &EntityRef,
        relationship_type: &str,
    ) -> Result<Option<RelationshipRecord>, DomainError> {
        self.relationships(guild)
            .await?
            .get_relationship(guild, a, b, relationship_type)
    }

    /// Keys of `guild` changed since the last successful flush, per row kind.
    #[must_use]
    pub fn get_dirty_keys(&self, guild: GuildId) -> BTreeMap<RowKind, BTreeSet<String>> {
        let mut keys = self.quests.dirty_keys(guild);
        keys.extend(self.relationships.dirty_keys(guild));
        keys
    }

    /// Forgets the dirty marks of `guild`, e.g. after the host persisted
    /// the state by other means.
    pub fn clear_dirty_keys(&self, guild: GuildId) {
        self.quests.clear_dirty(guild);
        self.relationships.clear_dirty(guild);
    }

    /// Writes the dirty state of `guild`. Both managers are attempted; keys
    /// whose write failed stay dirty for the next flush.
    ///
    /// # Errors
    ///
    /// Returns the first persistence error.
    #[instrument(skip_all, fields(guild = %guild))]
    pub async fn flush(&self, guild: GuildId) -> Result<FlushStats, DomainError> {
        let persistence = self.persistence.as_ref();
        let results = [
            self.quests.flush(guild, persistence).await,
            self.relationships.flush(guild, persistence).await,
        ];
        let mut stats = FlushStats::default();
        for result in results {
            stats = stats.merge(result?);
        }
        if stats != FlushStats::default() {
            info!(upserted = stats.upserted, deleted = stats.deleted, "guild flushed");
        }
        Ok(stats)
    }

    /// Flushes every loaded guild.
    ///
    /// # Errors
    ///
    /// Returns the first guild's error after attempting all of them.
    pub async fn flush_all(&self) -> Result<FlushStats, DomainError> {
        let mut stats = FlushStats::default();
        let mut first_error = None;
        for guild in self.loaded_guilds() {
            match self.flush(guild).await {
                Ok(flushed) => stats = stats.merge(flushed),
                Err(e) => {
                    warn!(%guild, error = %e, "flush failed, keys stay dirty");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    /// Flushes every loaded guild each `flush_interval_secs` until
    /// `shutdown` turns true or its sender is dropped.
    pub async fn run_flush_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        info!(interval_secs = self.config.flush_interval_secs, "flush loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Errors are logged per guild; the loop keeps going.
                    let _ = self.flush_all().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("flush loop stopped");
    }

    /// Flushes and unloads `guild`. The guild stays loaded if the flush
    /// fails.
    ///
    /// # Errors
    ///
    /// Returns the flush error.
    pub async fn unload_guild(&self, guild: GuildId) -> Result<FlushStats, DomainError> {
        let stats = self.flush(guild).await?;
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&guild);
        self.quests.evict(guild);
        self.relationships.evict(guild);
        info!(%guild, "guild unloaded");
        Ok(stats)
    }

    /// Flushes and unloads every guild.
    ///
    /// # Errors
    ///
    /// Returns the first flush error after attempting every guild; guilds
    /// that failed stay loaded.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) -> Result<FlushStats, DomainError> {
        let mut stats = FlushStats::default();
        let mut first_error = None;
        for guild in self.loaded_guilds() {
            match self.unload_guild(guild).await {
                Ok(flushed) => stats = stats.merge(flushed),
                Err(e) => {
                    warn!(%guild, error = %e, "guild could not be flushed at shutdown");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(upserted = stats.upserted, deleted = stats.deleted, "engine shut down");
                Ok(stats)
            }
        }
    }
}
