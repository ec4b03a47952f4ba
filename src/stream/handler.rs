//! Handler, command and snapshot capabilities.

use crate::error::{BoxError, Result};
use crate::registry::{Encoding, Payload};
use crate::types::Message;
use std::any::Any;

/// Receives messages in stream order.
///
/// Used for projections, command replay and subscriptions alike.
pub trait Handler: Send {
    fn handle(&mut self, message: &Message) -> std::result::Result<(), BoxError>;

    /// Snapshot capability, if this handler can save and restore its state.
    fn snapshot(&mut self) -> Option<&mut dyn Snapshotter> {
        None
    }
}

/// State that can be persisted to accelerate replay.
///
/// `restore` must leave the state untouched when it fails.
pub trait Snapshotter {
    /// One snapshot is kept per stream and name.
    fn snapshot_name(&self) -> &str;

    fn save(&self, encoding: Encoding) -> Result<Vec<u8>>;

    fn restore(&mut self, encoding: Encoding, data: &[u8]) -> Result<()>;
}

/// A handler that decides new messages from the state it was replayed into.
pub trait Command: Handler {
    fn command(&mut self, appender: &mut Appender) -> std::result::Result<(), BoxError>;
}

/// Collects the messages a command emits.
#[derive(Debug)]
pub struct Appender {
    position: i64,
    messages: Vec<Payload>,
}

impl Appender {
    pub(crate) fn new(position: i64) -> Self {
        Self {
            position,
            messages: Vec::new(),
        }
    }

    /// Stream position the command was replayed to.
    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn append<T: Any + Send + Sync>(&mut self, message: T) {
        self.messages.push(Payload::new(message));
    }

    pub fn append_payload(&mut self, payload: Payload) {
        self.messages.push(payload);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub(crate) fn into_messages(self) -> Vec<Payload> {
        self.messages
    }
}

/// Handler backed by a closure.
pub struct HandlerFn<F>(F);

/// Wrap a closure as a [`Handler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: FnMut(&Message) -> std::result::Result<(), BoxError> + Send,
{
    HandlerFn(f)
}

impl<F> Handler for HandlerFn<F>
where
    F: FnMut(&Message) -> std::result::Result<(), BoxError> + Send,
{
    fn handle(&mut self, message: &Message) -> std::result::Result<(), BoxError> {
        (self.0)(message)
    }
}
