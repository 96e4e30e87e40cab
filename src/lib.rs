//! chatstore — concurrent append-only record store for chat persistence.
//!
//! Records live in JSON collection files under one data directory:
//! `users.json`, `rooms.json`, and a series of `messages_<N>.json`
//! segments that roll over at a configured capacity. Every collection
//! write is an atomic replace (temp file + rename) serialized through a
//! per-file async queue, so concurrent writers never interleave and a
//! crash never leaves a half-written file behind.
//!
//! ```text
//!   Write path:
//!     submit_message ──► IngestBatcher (per-room buffer)
//!                          │ batch_size / flush_interval
//!                          ▼
//!     create_user ─────► ResourceQueue ──► Collection ──► tmp + rename
//!     create_room ─────►   (per-file)        (cache)
//!
//!   Read path:
//!     query_messages ──► SegmentSet ──► Collection cache (TTL)
//!                          │                 │ miss / stale
//!                          ▼                 ▼
//!                        merge + sort      disk read (throttled)
//! ```
//!
//! Reads fail open (stale cache or empty set on IO trouble), writes fail
//! closed. See [`ChatStore`] for the public entry point.

pub mod collection;
pub mod config;
pub mod error;
pub mod ingest;
pub mod queue;
pub mod reader;
pub mod records;
pub mod segments;
pub mod store;

pub use collection::{Collection, CollectionStats};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use ingest::{BatchSubscriber, IngestBatcher};
pub use queue::ResourceQueue;
pub use reader::MessageFilter;
pub use records::{Message, Room, User};
pub use segments::SegmentSet;
pub use store::ChatStore;
