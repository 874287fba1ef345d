//! End-to-end quest scenarios through the engine facade.

mod common;

use common::{GUILD, giver, hero, hero_ref, seeded_engine};
use guildhall_core::error::DomainError;
use guildhall_core::guild::CharacterId;
use guildhall_core::ports::EventContext;
use guildhall_quest::application::lifecycle::{CompletionResult, StartOutcome, TemplateRef};
use guildhall_quest::domain::instance::QuestStatus;
use guildhall_test_support::WorldCall;
use serde_json::json;

#[tokio::test]
async fn test_collecting_three_pelts_completes_the_quest() {
    // Arrange
    let test = seeded_engine().await;
    let engine = &test.engine;

    // Act
    let StartOutcome::Started(started) = engine
        .start_quest(GUILD, &hero(), &TemplateRef::Authored("T1".into()))
        .await
        .unwrap()
    else {
        panic!("expected a new quest");
    };
    let quest_id = started.instance.id;
    let progress = engine
        .update_progress(GUILD, &hero(), quest_id, "obj1", &json!(3))
        .await
        .unwrap();

    // Assert
    assert_eq!(started.instance.status, QuestStatus::Active);
    assert!(started.instance.progress.is_empty());
    assert_eq!(progress.instance.progress["obj1"], json!(3));
    assert!(matches!(progress.completion, Some(CompletionResult::Finalized(_))));

    let quests = engine.quests(GUILD).await.unwrap();
    let completed = quests.list_completed_quests(GUILD, &hero()).unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, quest_id);
    assert_eq!(completed[0].status, QuestStatus::CompletedSuccess);
    assert!(engine.list_active_quests(GUILD, &hero()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_completion_pays_rewards_and_raises_trust() {
    let test = seeded_engine().await;
    let engine = &test.engine;
    let StartOutcome::Started(started) = engine
        .start_quest(GUILD, &hero(), &TemplateRef::Authored("T1".into()))
        .await
        .unwrap()
    else {
        panic!("expected a new quest");
    };

    engine
        .update_progress(GUILD, &hero(), started.instance.id, "obj1", &json!(3))
        .await
        .unwrap();

    assert!(test.world.calls().contains(&WorldCall::AwardExperience {
        target: "c-1".into(),
        amount: 50,
    }));
    let trust = engine
        .get_relationship(GUILD, &giver(), &hero_ref(), "trust")
        .await
        .unwrap()
        .unwrap();
    assert!((trust.strength - 20.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_second_event_builds_on_current_strength() {
    let test = seeded_engine().await;
    let engine = &test.engine;
    let mut completed = EventContext::new();
    completed.insert("target_id".into(), json!("c-1"));
    completed.insert("outcome".into(), json!("success"));
    completed.insert("xp".into(), json!(200));
    engine.on_event(GUILD, "quest_completed", &completed).await.unwrap();

    let mut gift = EventContext::new();
    gift.insert("character_id".into(), json!("c-1"));
    gift.insert("npc_id".into(), json!("npc-giver"));
    let changed = engine.on_event(GUILD, "gift_given", &gift).await.unwrap();

    assert_eq!(changed.len(), 1);
    assert!((changed[0].strength - 35.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_second_start_returns_existing_instance() {
    let test = seeded_engine().await;
    let engine = &test.engine;
    let template = TemplateRef::Authored("T1".into());
    let StartOutcome::Started(first) = engine.start_quest(GUILD, &hero(), &template).await.unwrap()
    else {
        panic!("expected a new quest");
    };

    let second = engine.start_quest(GUILD, &hero(), &template).await.unwrap();

    assert_eq!(second, StartOutcome::AlreadyActive(first.instance));
    assert_eq!(engine.list_active_quests(GUILD, &hero()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_premature_success_changes_nothing() {
    let test = seeded_engine().await;
    let engine = &test.engine;
    let StartOutcome::Started(started) = engine
        .start_quest(GUILD, &hero(), &TemplateRef::Authored("T1".into()))
        .await
        .unwrap()
    else {
        panic!("expected a new quest");
    };
    engine
        .update_progress(GUILD, &hero(), started.instance.id, "obj1", &json!(2))
        .await
        .unwrap();
    let before = engine.list_active_quests(GUILD, &hero()).await.unwrap();

    let result = engine
        .complete_quest(GUILD, &hero(), started.instance.id, true)
        .await
        .unwrap();

    assert_eq!(
        result,
        CompletionResult::Incomplete {
            unsatisfied: vec!["obj1".into()]
        }
    );
    assert_eq!(engine.list_active_quests(GUILD, &hero()).await.unwrap(), before);
}

#[tokio::test]
async fn test_failing_quest_then_reverting_restores_snapshot() {
    let test = seeded_engine().await;
    let engine = &test.engine;
    let StartOutcome::Started(started) = engine
        .start_quest(GUILD, &hero(), &TemplateRef::Authored("T1".into()))
        .await
        .unwrap()
    else {
        panic!("expected a new quest");
    };
    let quest_id = started.instance.id;
    engine
        .update_progress(GUILD, &hero(), quest_id, "obj1", &json!(1))
        .await
        .unwrap();
    let quests = engine.quests(GUILD).await.unwrap();
    let snapshot = quests.snapshot(GUILD, &hero(), quest_id).unwrap();
    engine.fail_quest(GUILD, &hero(), quest_id).await.unwrap();

    quests
        .reverts()
        .revert_status_change(GUILD, &hero(), quest_id, snapshot.status, snapshot.clone())
        .unwrap();

    let active = engine.list_active_quests(GUILD, &hero()).await.unwrap();
    assert_eq!(active, vec![snapshot]);
}

#[tokio::test]
async fn test_unknown_character_is_rejected_without_mutation() {
    let test = seeded_engine().await;
    let engine = &test.engine;
    engine.clear_dirty_keys(GUILD);

    let result = engine
        .start_quest(GUILD, &CharacterId::new("ghost"), &TemplateRef::Authored("T1".into()))
        .await;

    assert!(matches!(result, Err(DomainError::NotFound { .. })));
    assert!(engine.get_dirty_keys(GUILD).is_empty());
}
