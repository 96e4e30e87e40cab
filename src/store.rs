//! Top-level store facade.
//!
//! `ChatStore` owns the full persistence stack for one data directory:
//!
//! ```text
//!   ChatStore
//!     ├── ResourceQueue          one writer per file, process-wide
//!     ├── Collection<User>       users.json
//!     ├── Collection<Room>       rooms.json
//!     ├── SegmentSet             messages_<N>.json
//!     └── IngestBatcher ──────── batched message writes + fan-out
//! ```
//!
//! Everything is constructed in `open` and dependency-injected downward.
//! There are no ambient singletons: two stores over two directories
//! coexist in one process without sharing state.
//!
//! Write path for messages is asynchronous: `submit_message` assigns the
//! id and timestamp, hands the record to the batcher, and returns it
//! immediately. User and room writes are synchronous read-modify-write
//! transactions on their collection's queue slot.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::collection::Collection;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::ingest::{BatchSubscriber, IngestBatcher};
use crate::queue::ResourceQueue;
use crate::reader::{query_messages, MessageFilter};
use crate::records::{generate_id, now_millis, Message, Room, User};
use crate::segments::SegmentSet;

pub struct ChatStore {
    dir: PathBuf,
    queue: Arc<ResourceQueue>,
    users: Arc<Collection<User>>,
    rooms: Arc<Collection<Room>>,
    segments: Arc<SegmentSet>,
    batcher: IngestBatcher,
}

impl ChatStore {
    /// Open (or create) a store rooted at `dir`. The subscriber is called
    /// once per persisted message batch, after it is durable on disk.
    pub async fn open(
        dir: impl Into<PathBuf>,
        config: StoreConfig,
        subscriber: BatchSubscriber,
    ) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let config = Arc::new(config);
        let queue = Arc::new(ResourceQueue::new());
        let users = Arc::new(Collection::new(
            dir.join("users.json"),
            Arc::clone(&queue),
            Arc::clone(&config),
        ));
        let rooms = Arc::new(Collection::new(
            dir.join("rooms.json"),
            Arc::clone(&queue),
            Arc::clone(&config),
        ));
        let segments = Arc::new(
            SegmentSet::open(dir.clone(), Arc::clone(&queue), Arc::clone(&config)).await?,
        );
        let batcher = IngestBatcher::new(Arc::clone(&segments), config, subscriber);

        tracing::info!(
            "chat store opened at {} (resuming at segment {})",
            dir.display(),
            segments.current_index().await
        );

        Ok(Self {
            dir,
            queue,
            users,
            rooms,
            segments,
            batcher,
        })
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    // ── Users ───────────────────────────────────────────────────────────

    /// Register a user. The uniqueness check runs inside the collection's
    /// write slot, so two racing registrations of the same username cannot
    /// both succeed.
    pub async fn create_user(&self, username: &str, password_hash: &str) -> Result<User> {
        let user = User {
            id: generate_id(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: now_millis(),
        };
        self.users
            .mutate(move |mut records| {
                if records.iter().any(|u: &User| u.username == user.username) {
                    return Err(StoreError::DuplicateUser(user.username));
                }
                records.push(user.clone());
                Ok((records, user))
            })
            .await
    }

    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let records = self.users.read().await;
        Ok(records.iter().find(|u| u.username == username).cloned())
    }

    // ── Rooms ───────────────────────────────────────────────────────────

    /// Create a room. The creator is always a participant.
    pub async fn create_room(
        &self,
        name: &str,
        created_by: &str,
        participants: BTreeSet<String>,
    ) -> Result<Room> {
        let mut participants = participants;
        participants.insert(created_by.to_string());
        let room = Room {
            room_id: generate_id(),
            name: name.to_string(),
            participants,
            created_by: created_by.to_string(),
            created_at: now_millis(),
        };
        self.rooms
            .mutate(move |mut records| {
                records.push(room.clone());
                Ok((records, room))
            })
            .await
    }

    pub async fn find_room_by_id(&self, room_id: &str) -> Result<Option<Room>> {
        let records = self.rooms.read().await;
        Ok(records.iter().find(|r| r.room_id == room_id).cloned())
    }

    pub async fn find_rooms_by_participant(&self, username: &str) -> Result<Vec<Room>> {
        let records = self.rooms.read().await;
        Ok(records
            .iter()
            .filter(|r| r.participants.contains(username))
            .cloned()
            .collect())
    }

    /// Replace a room's participant set.
    pub async fn update_room_participants(
        &self,
        room_id: &str,
        participants: BTreeSet<String>,
    ) -> Result<Room> {
        let room_id = room_id.to_string();
        self.rooms
            .mutate(move |mut records| {
                let Some(room) = records.iter_mut().find(|r| r.room_id == room_id) else {
                    return Err(StoreError::RoomNotFound(room_id));
                };
                room.participants = participants;
                let updated = room.clone();
                Ok((records, updated))
            })
            .await
    }

    /// Delete a room and purge its messages from every segment. Buffered
    /// but unflushed messages for the room are discarded, and a flush
    /// already in flight is waited out before the purge so it cannot
    /// re-persist messages afterwards. Messages submitted concurrently
    /// with the deletion may still land; the transport layer stops
    /// routing to a room before deleting it.
    pub async fn delete_room(&self, room_id: &str) -> Result<()> {
        let key = room_id.to_string();
        let removed = self
            .rooms
            .mutate(move |mut records| {
                let before = records.len();
                records.retain(|r: &Room| r.room_id != key);
                let removed = before != records.len();
                Ok((records, removed))
            })
            .await?;
        if !removed {
            return Err(StoreError::RoomNotFound(room_id.to_string()));
        }

        self.batcher.drop_room(room_id).await;
        let purged = self.segments.purge_room(room_id).await?;
        tracing::info!("deleted room '{}' ({} messages purged)", room_id, purged);
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────────

    /// Submit a message for eventual persistence. The id and timestamp
    /// are assigned here; the returned record is what will be written and
    /// fanned out. Persistence errors are retried by the batcher and never
    /// surface to the submitter.
    pub fn submit_message(&self, room_id: &str, sender: &str, content: &str) -> Message {
        let message = Message {
            id: generate_id(),
            room_id: room_id.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp: now_millis(),
        };
        self.batcher.enqueue(room_id, message.clone());
        message
    }

    /// Query persisted messages across all segments. Buffered messages
    /// that have not flushed yet are not visible; call `flush` first for
    /// read-your-writes.
    pub async fn query_messages(&self, filter: &MessageFilter) -> Vec<Message> {
        query_messages(&self.segments, filter).await
    }

    /// Force-flush every room buffer to disk.
    pub async fn flush(&self) -> Result<()> {
        self.batcher.flush().await;
        Ok(())
    }

    /// Flush pending buffers, stop the periodic flusher, and drain the
    /// write queue. The store must not be used afterwards.
    pub async fn close(&self) -> Result<()> {
        self.batcher.close().await;
        self.queue.close().await;
        tracing::info!("chat store at {} closed", self.dir.display());
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
