//! Message envelope, lease token, and the per-message state machine.
//!
//! An envelope is the full addressable unit: identity, routing, payload,
//! metadata, attempt count, and timestamps. A lease is a time-bounded
//! exclusive assignment of a message to a consumer; it exists iff the
//! message is inflight.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Every message is in exactly one of these states at any time.
///
/// Transitions: enqueue lands in `Ready` (or `Delayed` when scheduled for
/// the future), a lease grant moves `Ready` to `Inflight`, ack moves
/// `Inflight` to `Archived`, and nack or lease expiry moves `Inflight` back
/// to `Ready`/`Delayed` or on to `Dlq` once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageState {
    Ready,
    Inflight,
    Delayed,
    Dlq,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Server-assigned opaque id, globally unique.
    pub message_id: String,
    /// Storage key, unique per queue. Equals `message_id` unless the
    /// producer supplied an idempotency key.
    pub key: String,
    pub queue: String,
    /// Opaque payload, typically UTF-8 JSON.
    pub payload: String,
    /// Opaque user metadata, typically a JSON object.
    pub attributes: String,
    /// Lower numeric value wins.
    pub priority: i32,
    /// Delivery attempt counter; incremented on each lease grant.
    pub attempt: u32,
    pub state: MessageState,
    pub created_at_ms: i64,
    /// The message is eligible for leasing only once this has passed.
    pub available_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseToken {
    pub lease_id: String,
    pub queue: String,
    pub message_key: String,
    pub consumer_id: String,
    pub lease_until_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub ready: u64,
    pub inflight: u64,
    pub delayed: u64,
    pub dlq: u64,
}

/// What a nack (or expiry reclaim) did with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackDisposition {
    /// Back to ready, eligible immediately.
    Requeued,
    /// Back to delayed with a backoff; eligible at the returned timestamp.
    Delayed { available_at_ms: i64 },
    /// Moved to the dead-letter queue.
    DeadLettered,
    /// Retries exhausted and no DLQ is configured; the message was deleted.
    Dropped,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn state_round_trips_through_strings() {
        for (state, text) in [
            (MessageState::Ready, "ready"),
            (MessageState::Inflight, "inflight"),
            (MessageState::Delayed, "delayed"),
            (MessageState::Dlq, "dlq"),
            (MessageState::Archived, "archived"),
        ] {
            assert_eq!(state.to_string(), text);
            assert_eq!(MessageState::from_str(text).unwrap(), state);
        }
    }

    #[test]
    fn unknown_state_is_rejected() {
        assert!(MessageState::from_str("pending").is_err());
    }
}
