//! Lazy loading, flushing and shutdown against in-memory persistence.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{GUILD, WOLVES_PACK, build_engine, build_engine_on, hero, seeded_engine};
use guildhall_core::config::EngineConfig;
use guildhall_core::ports::RowKind;
use guildhall_engine::engine::{Collaborators, GuildEngine};
use guildhall_quest::application::lifecycle::{StartOutcome, TemplateRef};
use guildhall_test_support::{
    InMemoryPersistence, RecordingNotifier, RecordingWorld, ScriptedGenerator, ScriptedValidator,
    fixed_clock,
};
use serde_json::json;
use tokio::sync::watch;

#[tokio::test]
async fn test_flush_writes_dirty_state_and_clears_marks() {
    // Arrange
    let test = seeded_engine().await;
    let engine = &test.engine;
    let dirty = engine.get_dirty_keys(GUILD);
    assert!(dirty[&RowKind::QuestTemplate].contains("T1"));
    assert!(dirty[&RowKind::QuestLog].contains("c-1"));
    assert_eq!(dirty[&RowKind::RelationshipRule].len(), 2);

    // Act
    let stats = engine.flush(GUILD).await.unwrap();

    // Assert
    assert_eq!(stats.upserted, 4);
    assert!(engine.get_dirty_keys(GUILD).is_empty());
    assert!(test.persistence.row(GUILD, RowKind::QuestLog, "c-1").is_some());
}

#[tokio::test]
async fn test_failed_flush_keeps_keys_for_the_next_attempt() {
    let test = seeded_engine().await;
    let engine = &test.engine;
    test.persistence.set_writes_down(true);

    let failed = engine.flush(GUILD).await;
    let still_dirty = engine.get_dirty_keys(GUILD);
    test.persistence.set_writes_down(false);
    let retried = engine.flush(GUILD).await.unwrap();

    assert!(failed.is_err());
    assert!(still_dirty[&RowKind::QuestLog].contains("c-1"));
    assert_eq!(retried.upserted, 4);
    assert!(engine.get_dirty_keys(GUILD).is_empty());
}

#[tokio::test]
async fn test_state_survives_a_restart() {
    // Arrange
    let persistence = Arc::new(InMemoryPersistence::new());
    let first = build_engine_on(persistence.clone());
    first
        .engine
        .install_content_pack(GUILD, WOLVES_PACK)
        .await
        .unwrap();
    first.engine.register_character(GUILD, &hero()).await.unwrap();
    let StartOutcome::Started(started) = first
        .engine
        .start_quest(GUILD, &hero(), &TemplateRef::Authored("T1".into()))
        .await
        .unwrap()
    else {
        panic!("expected a new quest");
    };
    first
        .engine
        .update_progress(GUILD, &hero(), started.instance.id, "obj1", &json!(2))
        .await
        .unwrap();
    first.engine.shutdown().await.unwrap();

    // Act
    let second = build_engine_on(persistence.clone());
    let active = second.engine.list_active_quests(GUILD, &hero()).await.unwrap();
    second
        .engine
        .update_progress(GUILD, &hero(), started.instance.id, "obj1", &json!(1))
        .await
        .unwrap();

    // Assert
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].progress["obj1"], json!(2));
    assert!(second.engine.list_active_quests(GUILD, &hero()).await.unwrap().is_empty());
    assert_eq!(persistence.loads(), vec![GUILD, GUILD]);
}

#[tokio::test]
async fn test_guild_is_loaded_once() {
    let test = build_engine();

    test.engine.register_character(GUILD, &hero()).await.unwrap();
    test.engine.list_active_quests(GUILD, &hero()).await.unwrap();

    assert_eq!(test.persistence.loads(), vec![GUILD]);
    assert!(test.engine.loaded_guilds().contains(&GUILD));
}

#[tokio::test]
async fn test_shutdown_with_storage_down_keeps_guild_loaded() {
    let test = seeded_engine().await;
    test.persistence.set_writes_down(true);

    let result = test.engine.shutdown().await;

    assert!(result.is_err());
    assert!(test.engine.loaded_guilds().contains(&GUILD));
    assert!(!test.engine.get_dirty_keys(GUILD).is_empty());
}

#[tokio::test]
async fn test_flush_loop_flushes_until_shutdown() {
    // Arrange
    let persistence = Arc::new(InMemoryPersistence::new());
    let config = EngineConfig {
        flush_interval_secs: 1,
        ..EngineConfig::default()
    };
    let engine = Arc::new(
        GuildEngine::new(
            config,
            Collaborators {
                persistence: persistence.clone(),
                generator: Arc::new(ScriptedGenerator::new(json!({}))),
                validator: Arc::new(ScriptedValidator::accepting()),
                notifier: Arc::new(RecordingNotifier::new()),
                world: Arc::new(RecordingWorld::new()),
                clock: Arc::new(fixed_clock()),
            },
        )
        .unwrap(),
    );
    engine.register_character(GUILD, &hero()).await.unwrap();
    let (stop, stopped) = watch::channel(false);
    let background = engine.clone();

    // Act
    let handle = tokio::spawn(async move { background.run_flush_loop(stopped).await });
    tokio::time::sleep(Duration::from_millis(1500)).await;
    stop.send(true).unwrap();
    handle.await.unwrap();

    // Assert
    assert!(engine.get_dirty_keys(GUILD).is_empty());
    assert!(persistence.row(GUILD, RowKind::QuestLog, "c-1").is_some());
}
