//! Integration test: restart and persistence semantics.
//!
//! Validates that:
//! - Flushed data survives store close + reopen
//! - Segment numbering resumes at the highest existing index
//! - Rollover fills each segment to capacity before opening the next
//! - Stale temp files from interrupted writes are ignored on reopen

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chatstore::{BatchSubscriber, ChatStore, MessageFilter, StoreConfig};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn noop_subscriber() -> BatchSubscriber {
    Arc::new(|_, _| {})
}

fn config(max_records_per_segment: usize) -> StoreConfig {
    StoreConfig {
        max_records_per_segment,
        batch_size: 1,
        flush_interval: Duration::from_millis(20),
        ..StoreConfig::default()
    }
}

async fn open(dir: &std::path::Path, segment_cap: usize) -> ChatStore {
    ChatStore::open(dir, config(segment_cap), noop_subscriber())
        .await
        .unwrap()
}

fn segment_files(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("messages_") && n.ends_with(".json"))
        .collect();
    names.sort();
    names
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn records_survive_close_and_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let store = open(dir.path(), 100).await;
        store.create_user("alice", "hash1").await.unwrap();
        let room = store
            .create_room("general", "alice", BTreeSet::new())
            .await
            .unwrap();
        store.submit_message(&room.room_id, "alice", "hello");
        store.close().await.unwrap();

        let store = open(dir.path(), 100).await;
        let user = store.find_user_by_username("alice").await.unwrap().unwrap();
        assert_eq!(user.password_hash, "hash1");
        let rooms = store.find_rooms_by_participant("alice").await.unwrap();
        assert_eq!(rooms.len(), 1);
        let messages = store
            .query_messages(&MessageFilter::room(&room.room_id))
            .await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
        store.close().await.unwrap();
    }
}

#[tokio::test]
async fn segments_fill_to_capacity_then_roll() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path(), 3).await;

    for i in 1..=5 {
        store.submit_message("r1", "alice", &format!("m{}", i));
        store.flush().await.unwrap();
    }
    store.close().await.unwrap();

    // Five messages at capacity 3: segment 1 full, segment 2 holds two.
    let files = segment_files(dir.path());
    assert_eq!(files, vec!["messages_1.json", "messages_2.json"]);

    let seg1: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("messages_1.json")).unwrap())
            .unwrap();
    let seg2: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("messages_2.json")).unwrap())
            .unwrap();
    assert_eq!(seg1.len(), 3);
    assert_eq!(seg2.len(), 2);
}

#[tokio::test]
async fn numbering_resumes_at_highest_segment() {
    let dir = TempDir::new().unwrap();

    let store = open(dir.path(), 2).await;
    for i in 1..=4 {
        store.submit_message("r1", "alice", &format!("m{}", i));
        store.flush().await.unwrap();
    }
    store.close().await.unwrap();
    assert_eq!(
        segment_files(dir.path()),
        vec!["messages_1.json", "messages_2.json"]
    );

    // Reopen and keep writing: the partial last segment fills first.
    let store = open(dir.path(), 2).await;
    store.submit_message("r1", "alice", "m5");
    store.flush().await.unwrap();
    store.close().await.unwrap();

    assert_eq!(
        segment_files(dir.path()),
        vec!["messages_1.json", "messages_2.json", "messages_3.json"]
    );

    let store = open(dir.path(), 2).await;
    let messages = store.query_messages(&MessageFilter::room("r1")).await;
    assert_eq!(messages.len(), 5);
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m1", "m2", "m3", "m4", "m5"]);
    store.close().await.unwrap();
}

#[tokio::test]
async fn stale_temp_files_ignored_on_reopen() {
    let dir = TempDir::new().unwrap();

    let store = open(dir.path(), 100).await;
    store.submit_message("r1", "alice", "real");
    store.flush().await.unwrap();
    store.close().await.unwrap();

    // Simulate a crash mid-write: leftover temp files next to the real ones.
    std::fs::write(dir.path().join("messages_1.json.tmp.1712000000.abc123"), "[garbage").unwrap();
    std::fs::write(dir.path().join("users.json.tmp.1712000000.def456"), "{").unwrap();

    let store = open(dir.path(), 100).await;
    let messages = store.query_messages(&MessageFilter::room("r1")).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "real");
    store.close().await.unwrap();
}

#[tokio::test]
async fn deleted_room_stays_deleted_after_reopen() {
    let dir = TempDir::new().unwrap();

    let store = open(dir.path(), 2).await;
    let room = store
        .create_room("doomed", "alice", BTreeSet::new())
        .await
        .unwrap();
    for i in 1..=3 {
        store.submit_message(&room.room_id, "alice", &format!("m{}", i));
        store.flush().await.unwrap();
    }
    store.delete_room(&room.room_id).await.unwrap();
    store.close().await.unwrap();

    let store = open(dir.path(), 2).await;
    assert!(store.find_room_by_id(&room.room_id).await.unwrap().is_none());
    assert!(store
        .query_messages(&MessageFilter::room(&room.room_id))
        .await
        .is_empty());
    store.close().await.unwrap();
}
