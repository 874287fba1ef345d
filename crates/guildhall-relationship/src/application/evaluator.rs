//! Applies relationship rules to game events.
//!
//! All changes caused by one event are staged locally, so later changes see
//! the strength produced by earlier ones, and then committed through a
//! single [`write_scoped`] unit of work.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use guildhall_core::cache::TenantCache;
use guildhall_core::clock::Clock;
use guildhall_core::config::StrengthBounds;
use guildhall_core::error::DomainError;
use guildhall_core::guild::{EntityRef, GuildId};
use guildhall_core::isolation::write_scoped;
use guildhall_core::persistence::{FlushStats, flush_cache, hydrate_cache};
use guildhall_core::ports::{
    EventContext, PersistedRow, PersistenceService, RelationshipGateway, RowKind, StrengthChange,
};
use tracing::{debug, info, instrument, warn};

use crate::domain::expression::EventScope;
use crate::domain::record::{EntityPair, RelationshipRecord, record_key};
use crate::domain::rules::{RelationshipRule, RuleChange};

/// One committed strength change, logged after the write succeeds.
struct AuditLine {
    rule_id: String,
    a: String,
    b: String,
    relationship_type: String,
    prior: f64,
    strength: f64,
}

/// Owns relationship records and rules for every loaded guild.
pub struct RelationshipRuleEvaluator {
    pub(crate) records: TenantCache<RelationshipRecord>,
    rules: TenantCache<RelationshipRule>,
    bounds: StrengthBounds,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RelationshipRuleEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationshipRuleEvaluator")
            .field("guilds", &self.records.guilds())
            .field("bounds", &self.bounds)
            .finish_non_exhaustive()
    }
}

impl RelationshipRuleEvaluator {
    /// Creates an evaluator with empty caches.
    #[must_use]
    pub fn new(bounds: StrengthBounds, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: TenantCache::new(),
            rules: TenantCache::new(),
            bounds,
            clock,
        }
    }

    /// The configured strength bounds.
    #[must_use]
    pub fn bounds(&self) -> StrengthBounds {
        self.bounds
    }

    /// Installs rules for `guild`, replacing rules with the same id.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if any rule is malformed and
    /// `DomainError::TenantViolation` if any is tagged with another guild.
    /// Nothing is installed in either case.
    pub fn install_rules(
        &self,
        guild: GuildId,
        rules: Vec<RelationshipRule>,
    ) -> Result<usize, DomainError> {
        for rule in &rules {
            rule.validate()?;
        }
        let count = rules.len();
        write_scoped(&self.rules, guild, |unit| {
            for rule in rules {
                unit.add_new(rule);
            }
            Ok(())
        })?;
        info!(%guild, count, "relationship rules installed");
        Ok(count)
    }

    /// Rules of `guild` listening to `event_type`, ordered by id.
    #[must_use]
    pub fn rules_for_event(&self, guild: GuildId, event_type: &str) -> Vec<RelationshipRule> {
        let mut rules: Vec<RelationshipRule> = self
            .rules
            .values(guild)
            .into_iter()
            .filter(|rule| rule.event_type == event_type)
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    /// Runs every rule of `event_type` against `context` and returns the
    /// changed records in the order they were first touched.
    ///
    /// Rules whose condition is false or cannot be evaluated, and changes
    /// whose entities are missing from the context, are skipped.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::TenantViolation` if a cached record belongs to
    /// another guild; no record is changed in that case.
    #[instrument(skip_all, fields(guild = %guild, event_type = event_type))]
    pub fn on_event(
        &self,
        guild: GuildId,
        event_type: &str,
        context: &EventContext,
    ) -> Result<Vec<RelationshipRecord>, DomainError> {
        let now = self.clock.now();
        let mut staged: BTreeMap<String, RelationshipRecord> = BTreeMap::new();
        let mut touched: Vec<String> = Vec::new();
        let mut audit: Vec<AuditLine> = Vec::new();

        for rule in self.rules_for_event(guild, event_type) {
            if !condition_holds(&rule, context) {
                continue;
            }
            for change in &rule.changes {
                let Some(pair) = resolve_pair(&rule.id, change, context) else {
                    continue;
                };
                let key = record_key(&pair, &change.relationship_type);
                let mut record = staged
                    .get(&key)
                    .cloned()
                    .or_else(|| self.records.get(guild, &key))
                    .unwrap_or_else(|| RelationshipRecord::new(pair, &change.relationship_type, now));

                let scope = EventScope::new(context, record.strength);
                let magnitude = match change.formula.evaluate_number(&scope) {
                    Ok(magnitude) => magnitude,
                    Err(e) => {
                        warn!(%guild, rule = %rule.id, formula = %change.formula, error = %e, "formula failed, change skipped");
                        continue;
                    }
                };
                let prior = record.apply(change.mode.change(magnitude), self.bounds, now);
                if let Some(detail) = &change.detail {
                    record.detail = detail.clone();
                }

                if !staged.contains_key(&key) {
                    touched.push(key.clone());
                }
                audit.push(AuditLine {
                    rule_id: rule.id.clone(),
                    a: record.pair.a.to_string(),
                    b: record.pair.b.to_string(),
                    relationship_type: record.relationship_type.clone(),
                    prior,
                    strength: record.strength,
                });
                staged.insert(key, record);
            }
        }

        if staged.is_empty() {
            debug!(%guild, event_type, "no relationship changed");
            return Ok(Vec::new());
        }

        self.commit(guild, staged.into_values())?;

        for line in audit {
            info!(
                target: "guildhall::audit",
                %guild,
                event_type,
                rule = %line.rule_id,
                a = %line.a,
                b = %line.b,
                relationship_type = %line.relationship_type,
                delta = line.strength - line.prior,
                strength = line.strength,
                "relationship changed"
            );
        }

        Ok(touched
            .iter()
            .filter_map(|key| self.records.get(guild, key))
            .collect())
    }

    /// Applies `change` directly to the `(a, b)` record of
    /// `relationship_type`, creating it at strength 0 if needed.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if `a` and `b` are the same entity
    /// or the change is not finite, and `DomainError::TenantViolation` if
    /// the cached record belongs to another guild.
    pub fn adjust_strength(
        &self,
        guild: GuildId,
        a: &EntityRef,
        b: &EntityRef,
        relationship_type: &str,
        change: StrengthChange,
    ) -> Result<RelationshipRecord, DomainError> {
        let magnitude = match change {
            StrengthChange::Add(value) | StrengthChange::Set(value) => value,
        };
        if !magnitude.is_finite() {
            return Err(DomainError::Validation(format!(
                "strength change {magnitude} is not finite"
            )));
        }
        if relationship_type.trim().is_empty() {
            return Err(DomainError::Validation(
                "relationship type must not be empty".into(),
            ));
        }

        let now = self.clock.now();
        let pair = EntityPair::new(a.clone(), b.clone())?;
        let key = record_key(&pair, relationship_type);
        let mut record = self
            .records
            .get(guild, &key)
            .unwrap_or_else(|| RelationshipRecord::new(pair, relationship_type, now));
        let prior = record.apply(change, self.bounds, now);

        self.commit(guild, std::iter::once(record))?;
        let record = self
            .records
            .get(guild, &key)
            .ok_or_else(|| DomainError::not_found("relationship", &key))?;
        info!(
            target: "guildhall::audit",
            %guild,
            a = %record.pair.a,
            b = %record.pair.b,
            relationship_type,
            delta = record.strength - prior,
            strength = record.strength,
            "relationship adjusted"
        );
        Ok(record)
    }

    fn commit(
        &self,
        guild: GuildId,
        records: impl IntoIterator<Item = RelationshipRecord>,
    ) -> Result<(), DomainError> {
        write_scoped(&self.records, guild, |unit| {
            for record in records {
                if record.guild_id.is_some() {
                    unit.add_modified(record);
                } else {
                    unit.add_new(record);
                }
            }
            Ok(())
        })
    }

    /// Loads persisted records and rules of `guild`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for undecodable rows and
    /// `DomainError::TenantViolation` for rows of another guild.
    pub fn hydrate(&self, guild: GuildId, rows: &[PersistedRow]) -> Result<usize, DomainError> {
        let rules = hydrate_cache(&self.rules, guild, RowKind::RelationshipRule, rows)?;
        let records = hydrate_cache(&self.records, guild, RowKind::Relationship, rows)?;
        Ok(rules + records)
    }

    /// Writes every dirty record and rule of `guild`.
    ///
    /// # Errors
    ///
    /// Returns the first persistence error; keys of the failed cache stay
    /// dirty.
    pub async fn flush(
        &self,
        guild: GuildId,
        persistence: &dyn PersistenceService,
    ) -> Result<FlushStats, DomainError> {
        let results = [
            flush_cache(&self.rules, guild, RowKind::RelationshipRule, persistence).await,
            flush_cache(&self.records, guild, RowKind::Relationship, persistence).await,
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
            (RowKind::RelationshipRule, self.rules.dirty_keys(guild)),
            (RowKind::Relationship, self.records.dirty_keys(guild)),
        ]
        .into_iter()
        .filter(|(_, keys)| !keys.is_empty())
        .collect()
    }

    /// Forgets every dirty mark of `guild` without writing.
    pub fn clear_dirty(&self, guild: GuildId) {
        self.rules.clear_dirty(guild);
        self.records.clear_dirty(guild);
    }

    /// Drops everything cached for `guild`.
    pub fn evict(&self, guild: GuildId) {
        self.rules.evict_guild(guild);
        self.records.evict_guild(guild);
    }
}

fn condition_holds(rule: &RelationshipRule, context: &EventContext) -> bool {
    let Some(condition) = &rule.condition else {
        return true;
    };
    match condition.evaluate_bool(&EventScope::new(context, 0.0)) {
        Ok(holds) => {
            if !holds {
                debug!(rule = %rule.id, "condition not met");
            }
            holds
        }
        Err(e) => {
            debug!(rule = %rule.id, error = %e, "condition not evaluable, rule skipped");
            false
        }
    }
}

fn resolve_pair(rule_id: &str, change: &RuleChange, context: &EventContext) -> Option<EntityPair> {
    let (Some(a), Some(b)) = (
        change.entity_a.resolve(context),
        change.entity_b.resolve(context),
    ) else {
        debug!(rule = rule_id, "referenced entity missing from context");
        return None;
    };
    match EntityPair::new(a, b) {
        Ok(pair) => Some(pair),
        Err(e) => {
            debug!(rule = rule_id, error = %e, "change skipped");
            None
        }
    }
}

#[async_trait]
impl RelationshipGateway for RelationshipRuleEvaluator {
    async fn adjust(
        &self,
        guild: GuildId,
        a: &EntityRef,
        b: &EntityRef,
        relationship_type: &str,
        change: StrengthChange,
    ) -> Result<f64, DomainError> {
        Ok(self
            .adjust_strength(guild, a, b, relationship_type, change)?
            .strength)
    }

    async fn fire_event(
        &self,
        guild: GuildId,
        event_type: &str,
        context: &EventContext,
    ) -> Result<usize, DomainError> {
        Ok(self.on_event(guild, event_type, context)?.len())
    }
}
