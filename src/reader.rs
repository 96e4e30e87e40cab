//! Cross-shard message queries.
//!
//! Range/filter queries read every segment of the message collection
//! through the cached store, merge, filter, and sort. O(total records)
//! per query — acceptable because callers page with `since` + `limit`
//! and the dominant pattern is "recent messages for one room".
//!
//! Sorting by timestamp is required: once rollovers and batched writes
//! interleave, segment boundaries carry no time-ordering guarantee.

use crate::records::Message;
use crate::segments::SegmentSet;

/// Predicate and paging options for a message query.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    /// Only messages of this room.
    pub room_id: String,
    /// Only messages with `timestamp > since`, when given.
    pub since: Option<u64>,
    /// Cap on the number of returned messages, when given.
    pub limit: Option<usize>,
}

impl MessageFilter {
    pub fn room(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            since: None,
            limit: None,
        }
    }

    pub fn since(mut self, ts: u64) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    fn matches(&self, message: &Message) -> bool {
        if message.room_id != self.room_id {
            return false;
        }
        match self.since {
            Some(since) => message.timestamp > since,
            None => true,
        }
    }
}

/// Scan all segments oldest-first, filter, sort ascending by timestamp,
/// truncate to the limit. Reads degrade per the cached store's rules and
/// never fail the caller.
pub async fn query_messages(segments: &SegmentSet, filter: &MessageFilter) -> Vec<Message> {
    let mut matched = Vec::new();
    for segment in segments.all_segments().await {
        let records = segment.read().await;
        matched.extend(records.iter().filter(|m| filter.matches(m)).cloned());
    }

    // Stable sort: equal timestamps keep segment (arrival) order.
    matched.sort_by_key(|m| m.timestamp);

    if let Some(limit) = filter.limit {
        matched.truncate(limit);
    }
    matched
}

// ── Tests ───────────────────────────────────────────────────────────
