//! Transport boundary.
//!
//! A transport carries "new record in this group" notifications from writers
//! to the broker. Registering a group hands the transport the broker's
//! inbound handler and returns the outbound handler writers publish to.
//! Delivery is expected to be at-least-once; the distributors make repeated
//! deliveries harmless.

mod local;

pub use local::LocalTransport;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::id::StreamId;
use crate::types::Record;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// One side of a group registration.
pub trait RecordHandler: Send + Sync {
    /// Returns whether the record was taken.
    fn handle(&self, ctx: &Context, record: &Record) -> Result<bool>;
}

/// Carries record notifications for groups.
pub trait Transport: Send + Sync {
    /// Attach `inbound` to `group` and return the handler to publish into.
    fn register(
        &self,
        ctx: &Context,
        group: &str,
        inbound: Arc<dyn RecordHandler>,
    ) -> Result<Arc<dyn RecordHandler>>;
}

/// Flat record identifier: `"<number>#<group_number>#<stream>"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub number: i64,
    pub group_number: i64,
    pub stream: StreamId,
}

impl From<&Record> for MessageId {
    fn from(record: &Record) -> Self {
        Self {
            number: record.number,
            group_number: record.group_number,
            stream: record.stream.clone(),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}#{}", self.number, self.group_number, self.stream)
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidMessageId(s.to_string());

        let mut parts = s.splitn(3, '#');
        let (Some(number), Some(group_number), Some(stream)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        Ok(Self {
            number: number.parse().map_err(|_| invalid())?,
            group_number: group_number.parse().map_err(|_| invalid())?,
            stream: stream.parse().map_err(|_| invalid())?,
        })
    }
}
