//! Inbound message bookkeeping
//!
//! Duplicate suppression, welcome/system message accounting, semantic
//! failure rate limiting, and the recent-message ring buffer.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{classify, ErrorKind, SemanticError};
use crate::peer::RawMessage;

/// Content types the peer client uses for membership/system notices
const SYSTEM_CONTENT_TYPES: &[&str] = &[
    "welcome",
    "system",
    "group_updated",
    "group_membership_change",
    "membership_change",
];

/// A message forwarded to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sent_at: DateTime<Utc>,
    pub content: String,
    /// Stream generation that delivered the message
    pub stream_generation: u64,
}

impl MessageEvent {
    pub fn from_raw(raw: RawMessage, stream_generation: u64) -> Self {
        Self {
            id: raw.id,
            conversation_id: raw.conversation_id,
            sender_id: raw.sender_id,
            sent_at: raw.sent_at,
            content: raw.content,
            stream_generation,
        }
    }
}

/// What the processing loop should do with a raw message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inspection {
    /// Forward to subscribers
    Clean,
    /// Welcome or system notice; triggers a resync, never forwarded
    Welcome,
    /// Broken message; handled by targeted resync
    Semantic(SemanticError),
}

/// Best-effort classification of a raw message
///
/// Text messages are always clean: user content is never pattern-matched.
/// Other content types are checked for system notices and for error
/// payloads the peer client substitutes when it cannot read a message.
pub fn inspect(raw: &RawMessage) -> Inspection {
    let content_type = raw.content_type.to_lowercase();

    if content_type == "text" {
        return Inspection::Clean;
    }

    if SYSTEM_CONTENT_TYPES.contains(&content_type.as_str())
        || raw.content.trim_start().starts_with("[system]")
    {
        return Inspection::Welcome;
    }

    match content_type.as_str() {
        "epoch_mismatch" => return Inspection::Semantic(SemanticError::EpochMismatch),
        "decode_error" | "undecryptable" => {
            return Inspection::Semantic(SemanticError::DecodeFailure)
        }
        _ => {}
    }

    match classify(&raw.content) {
        ErrorKind::Semantic(kind) => Inspection::Semantic(kind),
        _ => Inspection::Clean,
    }
}

/// Per-manager message processing state
///
/// `processed` and the welcome counts are each bounded two ways: entries
/// older than the TTL are pruned on a timer, and inserts beyond the cap
/// evict the oldest entry.
#[derive(Debug)]
pub struct MessageProcessingState {
    processed: HashMap<String, Instant>,
    order: VecDeque<String>,
    max_processed: usize,
    special_retry_counts: HashMap<String, (u32, Instant)>,
    special_order: VecDeque<String>,
    last_special_error_at: Option<Instant>,
    consecutive_decode_failures: u32,
}

impl MessageProcessingState {
    pub fn new(max_processed: usize) -> Self {
        Self {
            processed: HashMap::new(),
            order: VecDeque::new(),
            max_processed: max_processed.max(1),
            special_retry_counts: HashMap::new(),
            special_order: VecDeque::new(),
            last_special_error_at: None,
            consecutive_decode_failures: 0,
        }
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.processed.contains_key(id)
    }

    /// Remember a forwarded message id
    pub fn mark_processed(&mut self, id: &str, now: Instant) {
        if self.processed.insert(id.to_string(), now).is_some() {
            return;
        }
        self.order.push_back(id.to_string());

        while self.order.len() > self.max_processed {
            if let Some(oldest) = self.order.pop_front() {
                self.processed.remove(&oldest);
            }
        }
    }

    /// Forget ids older than `ttl`; returns how many were pruned
    pub fn prune(&mut self, now: Instant, ttl: Duration) -> usize {
        let mut pruned = 0;
        while let Some(oldest) = self.order.front() {
            let expired = self
                .processed
                .get(oldest)
                .map_or(true, |seen| now.saturating_duration_since(*seen) >= ttl);
            if !expired {
                break;
            }
            if let Some(id) = self.order.pop_front() {
                self.processed.remove(&id);
                pruned += 1;
            }
        }

        while let Some(oldest) = self.special_order.front() {
            let expired = self
                .special_retry_counts
                .get(oldest)
                .map_or(true, |(_, first)| now.saturating_duration_since(*first) >= ttl);
            if !expired {
                break;
            }
            if let Some(id) = self.special_order.pop_front() {
                self.special_retry_counts.remove(&id);
            }
        }
        pruned
    }

    pub fn processed_len(&self) -> usize {
        self.processed.len()
    }

    /// Count one more occurrence of a welcome/system message; returns the count
    ///
    /// The count ages from the first occurrence, so a welcome that keeps
    /// replaying is still forgotten once the TTL passes.
    pub fn record_special(&mut self, id: &str, now: Instant) -> u32 {
        if let Some((count, _)) = self.special_retry_counts.get_mut(id) {
            *count += 1;
            return *count;
        }

        self.special_retry_counts.insert(id.to_string(), (1, now));
        self.special_order.push_back(id.to_string());
        while self.special_order.len() > self.max_processed {
            if let Some(oldest) = self.special_order.pop_front() {
                self.special_retry_counts.remove(&oldest);
            }
        }
        1
    }

    pub fn special_len(&self) -> usize {
        self.special_retry_counts.len()
    }

    /// Rate limit for semantic-error resyncs
    ///
    /// Returns true (and arms the limiter) if no resync was triggered within `cooldown`.
    pub fn should_resync(&mut self, now: Instant, cooldown: Duration) -> bool {
        let ready = self
            .last_special_error_at
            .map_or(true, |last| now.saturating_duration_since(last) >= cooldown);
        if ready {
            self.last_special_error_at = Some(now);
        }
        ready
    }

    /// Count a decode/epoch failure; returns the consecutive count
    pub fn record_decode_failure(&mut self) -> u32 {
        self.consecutive_decode_failures += 1;
        self.consecutive_decode_failures
    }

    pub fn reset_decode_failures(&mut self) {
        self.consecutive_decode_failures = 0;
    }

    pub fn consecutive_decode_failures(&self) -> u32 {
        self.consecutive_decode_failures
    }

    /// Reset failure bookkeeping across stream recreation
    ///
    /// The processed-id window is kept: a recreated stream may replay
    /// messages from its resumption point.
    pub fn reset_counters(&mut self) {
        self.special_retry_counts.clear();
        self.special_order.clear();
        self.last_special_error_at = None;
        self.consecutive_decode_failures = 0;
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.processed.clear();
        self.order.clear();
        self.reset_counters();
    }
}

/// Fixed-capacity buffer of the most recent forwarded messages
#[derive(Debug)]
pub struct RecentMessages {
    buffer: VecDeque<MessageEvent>,
    capacity: usize,
}

impl RecentMessages {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, event: MessageEvent) {
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(event);
    }

    /// The last `n` messages, oldest first
    pub fn last(&self, n: usize) -> Vec<MessageEvent> {
        let skip = self.buffer.len().saturating_sub(n);
        self.buffer.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
