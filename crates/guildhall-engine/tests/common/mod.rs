//! Shared helpers for engine integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use guildhall_core::config::EngineConfig;
use guildhall_core::guild::{CharacterId, EntityKind, EntityRef, GuildId};
use guildhall_engine::engine::{Collaborators, GuildEngine};
use guildhall_test_support::{
    InMemoryPersistence, RecordingNotifier, RecordingWorld, ScriptedGenerator, ScriptedValidator,
    fixed_clock,
};
use serde_json::json;

pub const GUILD: GuildId = GuildId(100);
pub const OTHER_GUILD: GuildId = GuildId(200);

/// Templates and rules used by the scenarios: `T1` needs three wolf pelts
/// and, on success, fires `quest_completed`, which raises the hero's trust
/// with the quest giver by a tenth of the experience.
pub const WOLVES_PACK: &str = r"
name: wolves-of-the-vale
version: '1.0'
templates:
  - id: T1
    name:
      en: Wolf Trouble
    objectives:
      - id: obj1
        kind: collect
        target: wolf_pelt
        completion:
          type: at_least
          value: 3
    rewards:
      experience: 50
    on_complete:
      - action: relationship_event
        params:
          event_type: quest_completed
          context:
            outcome: success
            xp: 200
rules:
  - id: giver-trust
    event_type: quest_completed
    condition: outcome == 'success'
    changes:
      - entity_a: { field: target_id, kind: character }
        entity_b: { id: npc-giver, kind: npc }
        relationship_type: trust
        formula: xp * 0.1
  - id: gift-bonus
    event_type: gift_given
    changes:
      - entity_a: { field: character_id, kind: character }
        entity_b: { field: npc_id, kind: npc }
        relationship_type: trust
        mode: set
        formula: 15 + current_strength
";

pub struct TestEngine {
    pub engine: GuildEngine,
    pub persistence: Arc<InMemoryPersistence>,
    pub world: Arc<RecordingWorld>,
    pub notifier: Arc<RecordingNotifier>,
}

/// Builds an engine over `persistence` with default configuration.
pub fn build_engine_on(persistence: Arc<InMemoryPersistence>) -> TestEngine {
    let world = Arc::new(RecordingWorld::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let collaborators = Collaborators {
        persistence: persistence.clone(),
        generator: Arc::new(ScriptedGenerator::new(json!({}))),
        validator: Arc::new(ScriptedValidator::accepting()),
        notifier: notifier.clone(),
        world: world.clone(),
        clock: Arc::new(fixed_clock()),
    };
    let engine = GuildEngine::new(EngineConfig::default(), collaborators).unwrap();
    TestEngine {
        engine,
        persistence,
        world,
        notifier,
    }
}

pub fn build_engine() -> TestEngine {
    build_engine_on(Arc::new(InMemoryPersistence::new()))
}

/// Builds an engine with the wolves pack installed and `hero` registered.
pub async fn seeded_engine() -> TestEngine {
    let test = build_engine();
    test.engine
        .install_content_pack(GUILD, WOLVES_PACK)
        .await
        .unwrap();
    test.engine.register_character(GUILD, &hero()).await.unwrap();
    test
}

pub fn hero() -> CharacterId {
    CharacterId::new("c-1")
}

pub fn hero_ref() -> EntityRef {
    EntityRef::character(&hero())
}

pub fn giver() -> EntityRef {
    EntityRef::new("npc-giver", EntityKind::Npc)
}
