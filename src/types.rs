//! Core types for the engine.

use crate::id::StreamId;
use crate::registry::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Position meaning "nothing applied yet / tail unknown".
pub const UNKNOWN_POSITION: i64 = -1;

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A single stored record.
///
/// `number` is the record's position inside its entity stream (1-based,
/// gap-free). `group_number` is its position in the merged group order;
/// zero until the record has been assigned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub number: i64,
    pub stream: StreamId,
    pub data: Vec<u8>,
    pub group: String,
    pub content_type: String,
    pub group_number: i64,
    pub time: Timestamp,
    pub correlation_id: String,
}

impl Record {
    /// Position of this record as seen from `scope`.
    pub fn position_in(&self, scope: &StreamId) -> i64 {
        if scope.is_entity() {
            self.number
        } else {
            self.group_number
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.group_number > 0
    }
}

/// Input for writing a record (before positions are assigned).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordInput {
    pub data: Vec<u8>,
    pub content_type: String,
    pub correlation_id: String,
}

impl RecordInput {
    pub fn new(data: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            data,
            content_type: content_type.into(),
            correlation_id: String::new(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }
}

/// Application view of a record with its payload decoded.
#[derive(Clone, Debug)]
pub struct Message {
    pub number: i64,
    pub stream: StreamId,
    pub group_number: i64,
    pub message_type: String,
    pub data: Payload,
    pub time: Timestamp,
}

impl Message {
    /// Position of this message as seen from `scope`.
    pub fn position_in(&self, scope: &StreamId) -> i64 {
        if scope.is_entity() {
            self.number
        } else {
            self.group_number
        }
    }

    /// Typed access to the payload.
    pub fn data<T: 'static>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }
}

/// Serialized projection state and the log position it reflects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub data: Vec<u8>,
    pub position: i64,
    pub content_type: String,
}

/// Last position a subscriber has applied on a stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionPosition {
    pub subscription_id: String,
    pub position: i64,
}

impl SubscriptionPosition {
    pub fn new(subscription_id: impl Into<String>, position: i64) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            position,
        }
    }

    /// Position of a subscriber that has never applied anything.
    pub fn initial(subscription_id: impl Into<String>) -> Self {
        Self::new(subscription_id, UNKNOWN_POSITION)
    }
}
