//! Test world gateway: records every effect applied to the game world.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use guildhall_core::error::DomainError;
use guildhall_core::guild::{EntityRef, GuildId};
use guildhall_core::ports::WorldGateway;

/// An effect captured by [`RecordingWorld`].
#[derive(Debug, Clone, PartialEq)]
pub enum WorldCall {
    /// `modify_stat`.
    ModifyStat {
        /// Target entity id.
        target: String,
        /// Stat name.
        stat: String,
        /// Delta applied.
        delta: f64,
    },
    /// `add_item`.
    AddItem {
        /// Target entity id.
        target: String,
        /// Item id.
        item_id: String,
        /// Quantity.
        quantity: u32,
    },
    /// `remove_item`.
    RemoveItem {
        /// Target entity id.
        target: String,
        /// Item id.
        item_id: String,
        /// Quantity.
        quantity: u32,
    },
    /// `change_location`.
    ChangeLocation {
        /// Target entity id.
        target: String,
        /// Destination.
        location_id: String,
    },
    /// `start_event`.
    StartEvent {
        /// Event id.
        event_id: String,
    },
    /// `apply_status_effect`.
    ApplyStatusEffect {
        /// Target entity id.
        target: String,
        /// Effect name.
        effect: String,
        /// Duration in turns.
        duration_turns: Option<u32>,
    },
    /// `award_experience`.
    AwardExperience {
        /// Target entity id.
        target: String,
        /// Amount.
        amount: i64,
    },
}

/// A world gateway that records calls. Calls aimed at targets registered
/// with [`RecordingWorld::failing_for`] fail, and the first `n` calls fail
/// when built with [`RecordingWorld::flaky`].
#[derive(Debug, Default)]
pub struct RecordingWorld {
    failing_targets: HashSet<String>,
    remaining_failures: Mutex<u32>,
    stats: Mutex<HashMap<(String, String), f64>>,
    calls: Mutex<Vec<WorldCall>>,
}

impl RecordingWorld {
    /// Creates a world where every call succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call aimed at `target_id` fail.
    #[must_use]
    pub fn failing_for(mut self, target_id: &str) -> Self {
        self.failing_targets.insert(target_id.to_owned());
        self
    }

    /// Makes the first `failures` calls fail with a collaborator error.
    #[must_use]
    pub fn flaky(failures: u32) -> Self {
        Self {
            remaining_failures: Mutex::new(failures),
            ..Self::default()
        }
    }

    /// Calls recorded so far, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn calls(&self) -> Vec<WorldCall> {
        self.calls.lock().unwrap().clone()
    }

    fn check(&self, target: Option<&EntityRef>) -> Result<(), DomainError> {
        {
            let mut remaining = self.remaining_failures.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DomainError::Collaborator("world service timed out".into()));
            }
        }
        if let Some(target) = target {
            if self.failing_targets.contains(&target.id) {
                return Err(DomainError::not_found("entity", &target.id));
            }
        }
        Ok(())
    }

    fn record(&self, call: WorldCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl WorldGateway for RecordingWorld {
    async fn modify_stat(
        &self,
        _guild: GuildId,
        target: &EntityRef,
        stat: &str,
        delta: f64,
    ) -> Result<f64, DomainError> {
        self.check(Some(target))?;
        let value = {
            let mut stats = self.stats.lock().unwrap();
            let entry = stats
                .entry((target.id.clone(), stat.to_owned()))
                .or_insert(0.0);
            *entry += delta;
            *entry
        };
        self.record(WorldCall::ModifyStat {
            target: target.id.clone(),
            stat: stat.to_owned(),
            delta,
        });
        Ok(value)
    }

    async fn add_item(
        &self,
        _guild: GuildId,
        target: &EntityRef,
        item_id: &str,
        quantity: u32,
    ) -> Result<(), DomainError> {
        self.check(Some(target))?;
        self.record(WorldCall::AddItem {
            target: target.id.clone(),
            item_id: item_id.to_owned(),
            quantity,
        });
        Ok(())
    }

    async fn remove_item(
        &self,
        _guild: GuildId,
        target: &EntityRef,
        item_id: &str,
        quantity: u32,
    ) -> Result<(), DomainError> {
        self.check(Some(target))?;
        self.record(WorldCall::RemoveItem {
            target: target.id.clone(),
            item_id: item_id.to_owned(),
            quantity,
        });
        Ok(())
    }

    async fn change_location(
        &self,
        _guild: GuildId,
        target: &EntityRef,
        location_id: &str,
    ) -> Result<(), DomainError> {
        self.check(Some(target))?;
        self.record(WorldCall::ChangeLocation {
            target: target.id.clone(),
            location_id: location_id.to_owned(),
        });
        Ok(())
    }

    async fn start_event(
        &self,
        _guild: GuildId,
        event_id: &str,
        _params: &serde_json::Value,
    ) -> Result<(), DomainError> {
        self.check(None)?;
        self.record(WorldCall::StartEvent {
            event_id: event_id.to_owned(),
        });
        Ok(())
    }

    async fn apply_status_effect(
        &self,
        _guild: GuildId,
        target: &EntityRef,
        effect: &str,
        duration_turns: Option<u32>,
    ) -> Result<(), DomainError> {
        self.check(Some(target))?;
        self.record(WorldCall::ApplyStatusEffect {
            target: target.id.clone(),
            effect: effect.to_owned(),
            duration_turns,
        });
        Ok(())
    }

    async fn award_experience(
        &self,
        _guild: GuildId,
        target: &EntityRef,
        amount: i64,
    ) -> Result<(), DomainError> {
        self.check(Some(target))?;
        self.record(WorldCall::AwardExperience {
            target: target.id.clone(),
            amount,
        });
        Ok(())
    }
}
