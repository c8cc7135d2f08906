//! Cache reconciliation of fetched pages, pushes and optimistic edits.

use grantwire::{CacheSyncEngine, Entity, EntityId, FetchPage, Resolution, SyncError, TokenState};
use serde_json::json;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn grant(id: &str, title: &str) -> Entity {
    Entity::new(id)
        .with_field("title", title)
        .with_field("saved", false)
}

fn mark_saved(entity: &mut Entity) {
    entity.set("saved", true);
}

fn first_page() -> FetchPage {
    serde_json::from_value(json!({
        "items": [
            {"id": "g1", "title": "Community Arts", "saved": false},
            {"id": "g2", "title": "Rural Broadband", "saved": false},
            {"id": "g3", "title": "Youth Sports", "saved": false}
        ],
        "has_more": true,
        "page": 1
    }))
    .unwrap()
}

// --- Pushes ---

#[test]
fn test_push_of_existing_id_merges_in_place() {
    let engine = CacheSyncEngine::new();
    engine.apply_page(first_page());
    let id = EntityId::new("g1");

    engine.apply_push(Entity::new("g1").with_field("deadline", "2026-12-01"));

    let entry = engine.entry(&id).unwrap();
    assert_eq!(entry.position, 0);
    assert_eq!(entry.entity.get("title"), Some(&json!("Community Arts")));
    assert_eq!(entry.entity.get("deadline"), Some(&json!("2026-12-01")));
    assert_eq!(engine.len(), 3);
}

#[test]
fn test_push_never_reorders_visible_list() {
    let engine = CacheSyncEngine::new();
    engine.apply_page(first_page());
    let before = engine.ids();

    for id in ["g3", "g1", "g2", "g3"] {
        engine.apply_push(Entity::new(id).with_field("score", 1));
    }

    assert_eq!(engine.ids(), before);
}

#[test]
fn test_new_push_then_fetch_keeps_unique_ids() {
    let engine = CacheSyncEngine::new();
    engine.apply_page(first_page());
    engine.apply_push(grant("g9", "Clean Water"));
    assert_eq!(engine.position(&"g9".into()), Some(0));

    // The server now lists g9 on page 2.
    engine.apply_fetch_page(
        vec![grant("g9", "Clean Water"), grant("g10", "Libraries")],
        2,
    );

    let ids: Vec<String> = engine.ids().into_iter().map(|id| id.0).collect();
    assert_eq!(ids, vec!["g1", "g2", "g3", "g9", "g10"]);
}

// --- Optimistic edits ---

#[test]
fn test_failed_save_rolls_back_and_ignores_late_confirm() {
    init_tracing();
    let engine = CacheSyncEngine::new();
    engine.apply_page(first_page());
    let id = EntityId::new("g2");
    let before = engine.get(&id).unwrap();

    let token = engine.apply_optimistic(&id, mark_saved).unwrap();
    assert_eq!(engine.get(&id).unwrap().get("saved"), Some(&json!(true)));
    assert_eq!(token.snapshot(), &before);

    // The network call fails.
    assert_eq!(engine.rollback(&token), Resolution::RolledBack);
    assert_eq!(engine.get(&id).unwrap(), before);
    assert_eq!(token.state(), TokenState::RolledBack);
    assert_eq!(engine.rollback(&token), Resolution::AlreadyResolved);
    assert_eq!(engine.get(&id).unwrap(), before);

    let late = grant("g2", "Rural Broadband").with_field("saved", true);
    assert_eq!(engine.confirm(&token, late), Resolution::AlreadyResolved);
    assert_eq!(engine.get(&id).unwrap(), before);
    assert_eq!(token.state(), TokenState::RolledBack);
}

#[test]
fn test_confirm_is_idempotent() {
    let engine = CacheSyncEngine::new();
    engine.apply_page(first_page());
    let id = EntityId::new("g1");

    let token = engine.apply_optimistic(&id, mark_saved).unwrap();
    let server = grant("g1", "Community Arts")
        .with_field("saved", true)
        .with_field("saved_at", "2026-10-19");

    assert_eq!(engine.confirm(&token, server.clone()), Resolution::Confirmed);
    assert_eq!(engine.confirm(&token, grant("g1", "other")), Resolution::AlreadyResolved);
    assert_eq!(engine.rollback(&token), Resolution::AlreadyResolved);

    assert_eq!(engine.get(&id).unwrap(), server);
    assert_eq!(engine.pending_count(), 0);
}

#[test]
fn test_pending_edit_wins_over_push_until_resolved() {
    let engine = CacheSyncEngine::new();
    engine.apply_page(first_page());
    let id = EntityId::new("g3");

    let token = engine.apply_optimistic(&id, mark_saved).unwrap();

    // The server broadcasts the entity before it processed our save.
    engine.apply_push(Entity::new("g3").with_field("saved", false));
    assert_eq!(engine.get(&id).unwrap().get("saved"), Some(&json!(true)));
    assert!(engine.is_pending(&id));

    let server = grant("g3", "Youth Sports").with_field("saved", true);
    engine.confirm(&token, server.clone());
    assert_eq!(engine.get(&id).unwrap(), server);
    assert!(!engine.is_pending(&id));
}

#[test]
fn test_rollback_after_push_shows_server_value() {
    let engine = CacheSyncEngine::new();
    engine.apply_page(first_page());
    let id = EntityId::new("g3");

    let token = engine.apply_optimistic(&id, mark_saved).unwrap();
    engine.apply_push(Entity::new("g3").with_field("title", "Youth Sports 2027"));

    let visible = engine.get(&id).unwrap();
    assert_eq!(visible.get("saved"), Some(&json!(true)));
    assert_eq!(visible.get("title"), Some(&json!("Youth Sports 2027")));

    engine.rollback(&token);
    let visible = engine.get(&id).unwrap();
    assert_eq!(visible.get("saved"), Some(&json!(false)));
    assert_eq!(visible.get("title"), Some(&json!("Youth Sports 2027")));
}

#[test]
fn test_refetch_keeps_pending_edit_visible() {
    let engine = CacheSyncEngine::new();
    engine.apply_page(first_page());
    let id = EntityId::new("g1");

    let _token = engine.apply_optimistic(&id, mark_saved).unwrap();
    engine.apply_page(first_page());

    assert_eq!(engine.get(&id).unwrap().get("saved"), Some(&json!(true)));
}

#[test]
fn test_pending_edit_survives_refetch_without_its_entity() {
    let engine = CacheSyncEngine::new();
    engine.apply_fetch_page(
        vec![grant("g1", "Community Arts"), grant("g2", "Rural Broadband")],
        1,
    );
    let id = EntityId::new("g2");

    let token = engine.apply_optimistic(&id, mark_saved).unwrap();

    // The server's page no longer lists g2, then broadcasts it unsaved.
    engine.apply_fetch_page(vec![grant("g1", "Community Arts")], 1);
    engine.apply_push(Entity::new("g2").with_field("saved", false));

    assert_eq!(engine.get(&id).unwrap().get("saved"), Some(&json!(true)));
    assert!(engine.is_pending(&id));
    assert!(token.is_pending());
    assert_eq!(engine.position(&id), None);
    assert_eq!(engine.len(), 1);

    let server = grant("g2", "Rural Broadband").with_field("saved", true);
    assert_eq!(engine.confirm(&token, server), Resolution::Confirmed);
    assert!(engine.get(&id).is_none());
    assert_eq!(engine.pending_count(), 0);
}

#[test]
fn test_rejected_edit_settles_by_rollback() {
    init_tracing();
    let engine = CacheSyncEngine::new();
    engine.apply_page(first_page());
    let id = EntityId::new("g2");
    let before = engine.get(&id).unwrap();

    let token = engine.apply_optimistic(&id, mark_saved).unwrap();
    let outcome = engine.settle(&token, Err(SyncError::Transport("409 Conflict".to_string())));

    assert_eq!(outcome, Resolution::RolledBack);
    assert_eq!(engine.get(&id).unwrap(), before);
    assert_eq!(engine.settle(&token, Ok(before.clone())), Resolution::AlreadyResolved);
}

#[test]
fn test_optimistic_on_unknown_id() {
    let engine = CacheSyncEngine::new();
    let result = engine.apply_optimistic(&"ghost".into(), mark_saved);
    assert!(matches!(result, Err(SyncError::EntryNotFound(_))));
}
