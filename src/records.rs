//! Persisted record types and id generation.
//!
//! Collection files are JSON arrays with camelCase keys, matching the
//! layout consumed by the chat transport layer. Record ids are assigned
//! at creation time — before durability — so ordering by id or timestamp
//! reflects arrival order, not persistence order.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A registered user. Stored in `users.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// A chat room. Stored in `rooms.json`. Mutated in place (participants).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: String,
    pub name: String,
    /// Usernames of members. BTreeSet keeps the on-disk order stable.
    pub participants: BTreeSet<String>,
    pub created_by: String,
    pub created_at: u64,
}

/// A chat message. Stored in `messages_<N>.json` segments; never mutated
/// after persistence, deleted only by room-id bulk purge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub sender: String,
    pub content: String,
    /// Milliseconds since the Unix epoch, assigned on submit.
    pub timestamp: u64,
}

// ── Id generation ───────────────────────────────────────────────────

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a process-unique record id: hex millisecond prefix plus a
/// 24-bit random suffix. Lexicographic order of ids from one process
/// tracks arrival order at millisecond granularity.
pub fn generate_id() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{:012x}-{:06x}", now_millis(), suffix)
}

// ── Tests ───────────────────────────────────────────────────────────
