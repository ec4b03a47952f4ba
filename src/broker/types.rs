//! Subscription types.

use crate::id::StreamId;
use crate::stream::Handler;
use crate::types::Message;
use parking_lot::Mutex;
use std::fmt;

/// A registered subscriber and the stream it follows.
pub struct Subscription {
    id: String,
    stream: StreamId,
    pub(crate) handler: Mutex<Box<dyn Handler>>,
}

impl Subscription {
    pub(crate) fn new(id: String, stream: StreamId, handler: Box<dyn Handler>) -> Self {
        Self {
            id,
            stream,
            handler: Mutex::new(handler),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    /// Whether `message` belongs to what this subscription follows.
    ///
    /// Entity subscriptions only take their own entity. Group subscriptions
    /// only take records that already have a group number.
    pub fn accepts(&self, message: &Message) -> bool {
        if self.stream.is_entity() {
            message.stream == self.stream
        } else {
            message.group_number > 0
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("stream", &self.stream)
            .finish()
    }
}
