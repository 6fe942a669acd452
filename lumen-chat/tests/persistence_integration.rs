//! Persistence integration tests.
//!
//! Verifies:
//! - Messages and rooms survive closing and reopening the RocksDB cache
//! - A coordinator started on a reopened cache replays history immediately
//! - Upserts stay idempotent across restarts

mod common;

use std::sync::Arc;

use common::{msg, MockLive, ScriptedFetcher};
use lumen_chat::{
    CacheConfig, CoordinatorConfig, MessageCache, PageOutcome, RocksCache, SyncCoordinator,
};
use lumen_core::{Room, RoomId, UserSummary};
use tempfile::tempdir;
use tokio::sync::mpsc;

#[test]
fn test_messages_survive_reopen() {
    let dir = tempdir().unwrap();
    let room = RoomId::from("r1");

    {
        let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
        cache
            .upsert(&[msg("m2", "r1", 2), msg("m1", "r1", 1), msg("x1", "r2", 1)])
            .unwrap();
        cache.flush().unwrap();
    }

    let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
    let ids: Vec<String> = cache
        .query(&room)
        .unwrap()
        .into_iter()
        .map(|m| m.id.into_inner())
        .collect();
    assert_eq!(ids, vec!["m1", "m2"]);
    assert_eq!(cache.message_count(&RoomId::from("r2")).unwrap(), 1);
}

#[test]
fn test_duplicate_after_reopen_is_idempotent() {
    let dir = tempdir().unwrap();
    let room = RoomId::from("r1");

    {
        let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
        cache.upsert(&[msg("m1", "r1", 1)]).unwrap();
    }

    let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
    cache.upsert(&[msg("m1", "r1", 1).with_content("edited")]).unwrap();

    let stored = cache.query(&room).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content.as_deref(), Some("edited"));
}

#[test]
fn test_rooms_survive_reopen() {
    let dir = tempdir().unwrap();

    {
        let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
        let mut room = Room::new("r1", common::at(0)).with_name("general");
        room.add_participant(UserSummary::new("u1", "Ada"));
        cache.upsert_rooms(&[room]).unwrap();
        cache.upsert(&[msg("m1", "r1", 5)]).unwrap();
    }

    let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
    let rooms = cache.rooms().unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].name.as_deref(), Some("general"));
    assert_eq!(
        rooms[0].last_message.as_ref().map(|m| m.id.as_str()),
        Some("m1")
    );
}

#[tokio::test]
async fn test_coordinator_replays_persisted_history() {
    let dir = tempdir().unwrap();

    {
        let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
        cache
            .upsert(&[msg("m3", "r1", 3), msg("m1", "r1", 1)])
            .unwrap();
    }

    let cache = Arc::new(RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap());
    let fetcher = ScriptedFetcher::new().page(None, vec![msg("m2", "r1", 2)], None);
    let (_events_tx, events_rx) = mpsc::channel(8);
    let (handle, _task) = SyncCoordinator::spawn(
        cache.clone(),
        Arc::new(fetcher),
        Arc::new(MockLive::new(true)),
        events_rx,
        CoordinatorConfig::default(),
    );

    handle.open_room("r1").await.unwrap();
    assert_eq!(handle.current_view().ids(), vec!["m1", "m3"]);

    let outcome = handle.load_initial_page().await.unwrap();
    assert_eq!(outcome, PageOutcome::Loaded { received: 1, exhausted: true });
    assert_eq!(handle.current_view().ids(), vec!["m1", "m2", "m3"]);
    assert_eq!(cache.message_count(&RoomId::from("r1")).unwrap(), 3);
}
