//! Per-stream append, execute and project.
//!
//! A [`Stream`] is the single entry point for one [`StreamId`]. It caches the
//! last known tail (the lock position) so appends can go straight to an
//! optimistic `write_records_from` instead of reading the tail first, and it
//! serializes every operation on itself behind one mutex.
//!
//! Commands run replay-then-append under a bounded retry: when another writer
//! moves the tail between the replay and the write, the command is caught up
//! on the records it missed and asked again.

mod handler;
mod projector;

pub use handler::{handler_fn, Appender, Command, Handler, HandlerFn, Snapshotter};
pub use projector::{Projection, Projector};

use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::id::StreamId;
use crate::registry::{Payload, Registry};
use crate::store::Store;
use crate::types::{Record, RecordInput, UNKNOWN_POSITION};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives records right after they were written.
pub trait Publisher: Send + Sync {
    fn publish(&self, ctx: &Context, records: &[Record]) -> Result<()>;
}

/// Append/execute/project entry point for one stream.
pub struct Stream {
    id: StreamId,
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    config: EngineConfig,
    publisher: Option<Arc<dyn Publisher>>,
    lock_position: Mutex<i64>,
}

impl Stream {
    pub fn new(
        id: StreamId,
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            id,
            store,
            registry,
            config,
            publisher: None,
            lock_position: Mutex::new(UNKNOWN_POSITION),
        }
    }

    /// Hand every written record to `publisher` once the stream lock is
    /// released.
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// Last known tail, -1 if unknown.
    pub fn position(&self) -> i64 {
        *self.lock_position.lock()
    }

    /// Append `messages` one by one.
    ///
    /// Stops at the first error. Messages written before it stay written and
    /// are still published; [`Stream::position`] reflects them.
    pub fn append(&self, ctx: &Context, messages: Vec<Payload>) -> Result<i64> {
        self.require_entity()?;

        let mut written = Vec::with_capacity(messages.len());
        let result = {
            let mut lock = self.lock_position.lock();
            self.append_locked(ctx, &mut lock, messages, &mut written)
        };

        self.publish(ctx, &written);
        result
    }

    fn append_locked(
        &self,
        ctx: &Context,
        lock: &mut i64,
        messages: Vec<Payload>,
        written: &mut Vec<Record>,
    ) -> Result<i64> {
        for payload in messages {
            ctx.check()?;
            let input = vec![self.marshal(&payload)?];
            let records = if *lock < 0 {
                self.store.write_records(ctx, &self.id, input)
            } else {
                self.store.write_records_from(ctx, &self.id, *lock, input)
            };

            match records {
                Ok(records) => {
                    if let Some(last) = records.last() {
                        *lock = last.number;
                    }
                    written.extend(records);
                }
                Err(e) => {
                    if e.is_write_conflict() {
                        warn!(stream = %self.id, position = *lock, "Write conflict on append");
                        *lock = UNKNOWN_POSITION;
                    }
                    return Err(e);
                }
            }
        }

        debug!(stream = %self.id, position = *lock, count = written.len(), "Appended");
        Ok(*lock)
    }

    /// Replay the stream into `cmd`, then append what it emits.
    ///
    /// Write conflicts are retried up to `execute_retries` attempts in total.
    /// Each retry replays only the records `cmd` has not seen yet. Returns
    /// the stream position after the write.
    pub fn execute<C: Command>(&self, ctx: &Context, cmd: &mut C) -> Result<i64> {
        self.require_entity()?;

        let (position, written) = {
            let mut lock = self.lock_position.lock();
            self.execute_locked(ctx, &mut lock, cmd)?
        };

        self.publish(ctx, &written);
        Ok(position)
    }

    fn execute_locked<C: Command>(
        &self,
        ctx: &Context,
        lock: &mut i64,
        cmd: &mut C,
    ) -> Result<(i64, Vec<Record>)> {
        let projector = self.projector();
        let mut replayed = None;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let position = match replayed {
                None => {
                    let outcome = projector.project_with_snapshot(
                        ctx,
                        &self.id,
                        UNKNOWN_POSITION,
                        &mut *cmd,
                    )?;
                    self.report_snapshot(outcome.snapshot_error);
                    outcome.position
                }
                Some(from) => projector.project(ctx, &self.id, from, &mut *cmd)?,
            };

            // A fully replayed stream with no records has tail 0.
            let expected = position.max(0);
            let mut appender = Appender::new(expected);
            cmd.command(&mut appender).map_err(Error::Handler)?;

            let inputs = appender
                .into_messages()
                .iter()
                .map(|payload| self.marshal(payload))
                .collect::<Result<Vec<_>>>()?;
            if inputs.is_empty() {
                *lock = expected;
                return Ok((expected, Vec::new()));
            }

            match self.store.write_records_from(ctx, &self.id, expected, inputs) {
                Ok(records) => {
                    *lock = records.last().map_or(expected, |r| r.number);
                    debug!(stream = %self.id, position = *lock, attempt, "Executed command");
                    return Ok((*lock, records));
                }
                Err(e) if e.is_write_conflict() => {
                    *lock = UNKNOWN_POSITION;
                    if attempt >= self.config.execute_retries {
                        warn!(stream = %self.id, attempt, "Execute retries exhausted");
                        return Err(e);
                    }
                    debug!(
                        stream = %self.id,
                        position = expected,
                        attempt,
                        "Write conflict, replaying"
                    );
                    replayed = Some(position);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Replay the whole stream into `handler`.
    ///
    /// Uses the handler's snapshot when it has one. Snapshot failures are
    /// logged and never fail the projection.
    pub fn project(&self, ctx: &Context, handler: &mut dyn Handler) -> Result<i64> {
        let mut lock = self.lock_position.lock();

        let outcome = self
            .projector()
            .project_with_snapshot(ctx, &self.id, UNKNOWN_POSITION, handler)?;
        self.report_snapshot(outcome.snapshot_error);

        if self.id.is_entity() {
            *lock = outcome.position.max(0);
        }
        Ok(outcome.position)
    }

    fn projector(&self) -> Projector<'_> {
        Projector::new(
            self.store.as_ref(),
            &self.registry,
            self.config.projection_page_size,
        )
    }

    fn marshal(&self, payload: &Payload) -> Result<RecordInput> {
        let (data, content_type) = self.registry.marshal(payload)?;
        Ok(RecordInput::new(data, content_type))
    }

    fn require_entity(&self) -> Result<()> {
        if self.id.is_entity() {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!(
                "cannot write to group stream {}",
                self.id
            )))
        }
    }

    fn report_snapshot(&self, error: Option<Error>) {
        if let Some(e) = error {
            warn!(stream = %self.id, error = %e, "Snapshot write failed");
        }
    }

    fn publish(&self, ctx: &Context, records: &[Record]) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        if records.is_empty() {
            return;
        }
        if let Err(e) = publisher.publish(ctx, records) {
            warn!(stream = %self.id, count = records.len(), error = %e, "Publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::memory::MemoryStore;
    use crate::types::Message;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Deposited(i64);

    fn registry() -> Arc<Registry> {
        let mut registry = Registry::new();
        registry.register::<Deposited>("Deposited").unwrap();
        Arc::new(registry)
    }

    fn stream(store: &MemoryStore, id: &str) -> Stream {
        Stream::new(
            id.parse().unwrap(),
            Arc::new(store.clone()),
            registry(),
            EngineConfig::default(),
        )
    }

    fn deposits(values: &[i64]) -> Vec<Payload> {
        values.iter().map(|v| Payload::new(Deposited(*v))).collect()
    }

    /// Balance command that deposits once, optionally racing another writer.
    struct Deposit {
        balance: i64,
        amount: i64,
        replayed: Vec<i64>,
        interfere: Option<Stream>,
    }

    impl Handler for Deposit {
        fn handle(&mut self, message: &Message) -> std::result::Result<(), BoxError> {
            self.balance += message.data::<Deposited>().ok_or("unknown")?.0;
            self.replayed.push(message.number);
            Ok(())
        }
    }

    impl Command for Deposit {
        fn command(&mut self, appender: &mut Appender) -> std::result::Result<(), BoxError> {
            if let Some(other) = self.interfere.take() {
                other.append(&Context::background(), deposits(&[100]))?;
            }
            appender.append(Deposited(self.amount));
            Ok(())
        }
    }

    fn deposit(amount: i64) -> Deposit {
        Deposit {
            balance: 0,
            amount,
            replayed: Vec::new(),
            interfere: None,
        }
    }

    #[test]
    fn test_append_numbers_sequentially() {
        let store = MemoryStore::new();
        let orders = stream(&store, "orders-42");
        let ctx = Context::background();

        assert_eq!(orders.append(&ctx, deposits(&[1, 2, 3])).unwrap(), 3);
        assert_eq!(orders.position(), 3);
        assert_eq!(orders.append(&ctx, deposits(&[4])).unwrap(), 4);
        assert_eq!(store.tail(orders.id()), 4);
    }

    #[test]
    fn test_stale_lock_position_conflicts_then_recovers() {
        let store = MemoryStore::new();
        let ctx = Context::background();
        let first = stream(&store, "orders-42");
        let second = stream(&store, "orders-42");

        first.append(&ctx, deposits(&[1])).unwrap();
        second.append(&ctx, deposits(&[2])).unwrap();

        let err = first.append(&ctx, deposits(&[3])).unwrap_err();
        assert!(err.is_write_conflict());
        assert_eq!(first.position(), UNKNOWN_POSITION);
        assert_eq!(store.tail(first.id()), 2);

        // Unknown lock position lets the store pick the tail.
        assert_eq!(first.append(&ctx, deposits(&[3])).unwrap(), 3);
    }

    #[test]
    fn test_unregistered_message_stops_append() {
        let store = MemoryStore::new();
        let orders = stream(&store, "orders-42");
        let messages = vec![Payload::new(Deposited(1)), Payload::new(7u8)];

        let err = orders.append(&Context::background(), messages).unwrap_err();
        assert!(matches!(err, Error::UnregisteredType(_)));
        assert_eq!(orders.position(), 1);
    }

    #[test]
    fn test_group_stream_rejects_writes() {
        let store = MemoryStore::new();
        let orders = stream(&store, "orders");
        let err = orders
            .append(&Context::background(), deposits(&[1]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_execute_replays_then_appends() {
        let store = MemoryStore::new();
        let ctx = Context::background();
        let account = stream(&store, "account-1");
        account.append(&ctx, deposits(&[5, 7])).unwrap();

        let mut cmd = deposit(3);
        assert_eq!(account.execute(&ctx, &mut cmd).unwrap(), 3);
        assert_eq!(cmd.balance, 12);
        assert_eq!(account.position(), 3);
    }

    #[test]
    fn test_execute_retries_after_conflict() {
        let store = MemoryStore::new();
        let ctx = Context::background();
        let account = stream(&store, "account-1");

        let mut cmd = deposit(3);
        cmd.interfere = Some(stream(&store, "account-1"));

        assert_eq!(account.execute(&ctx, &mut cmd).unwrap(), 2);
        // The retry caught up on the competing write only.
        assert_eq!(cmd.replayed, vec![1]);
        assert_eq!(cmd.balance, 100);
    }

    #[test]
    fn test_execute_surfaces_last_conflict() {
        struct AlwaysRaced {
            rival: Stream,
        }

        impl Handler for AlwaysRaced {
            fn handle(&mut self, _: &Message) -> std::result::Result<(), BoxError> {
                Ok(())
            }
        }

        impl Command for AlwaysRaced {
            fn command(&mut self, appender: &mut Appender) -> std::result::Result<(), BoxError> {
                self.rival
                    .append(&Context::background(), deposits(&[1]))?;
                appender.append(Deposited(0));
                Ok(())
            }
        }

        let store = MemoryStore::new();
        let account = stream(&store, "account-1");
        let mut cmd = AlwaysRaced {
            rival: stream(&store, "account-1"),
        };

        let err = account
            .execute(&Context::background(), &mut cmd)
            .unwrap_err();
        assert!(err.is_write_conflict());
        assert_eq!(store.tail(account.id()), 3);
    }

    #[test]
    fn test_execute_handler_error_aborts() {
        struct Refuse;

        impl Handler for Refuse {
            fn handle(&mut self, _: &Message) -> std::result::Result<(), BoxError> {
                Ok(())
            }
        }

        impl Command for Refuse {
            fn command(&mut self, _: &mut Appender) -> std::result::Result<(), BoxError> {
                Err("insufficient funds".into())
            }
        }

        let store = MemoryStore::new();
        let account = stream(&store, "account-1");
        let err = account
            .execute(&Context::background(), &mut Refuse)
            .unwrap_err();
        assert!(matches!(err, Error::Handler(_)));
        assert!(store.is_empty(account.id()));
    }

    #[test]
    fn test_project_sets_lock_position() {
        let store = MemoryStore::new();
        let ctx = Context::background();
        stream(&store, "account-1")
            .append(&ctx, deposits(&[1, 2]))
            .unwrap();

        let account = stream(&store, "account-1");
        let mut seen = 0;
        let mut handler = handler_fn(|_: &Message| {
            seen += 1;
            Ok(())
        });
        assert_eq!(account.project(&ctx, &mut handler).unwrap(), 2);
        assert_eq!(account.position(), 2);
        drop(handler);
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_project_empty_stream() {
        let store = MemoryStore::new();
        let account = stream(&store, "account-1");
        let mut handler = handler_fn(|_: &Message| Ok(()));
        assert_eq!(
            account
                .project(&Context::background(), &mut handler)
                .unwrap(),
            UNKNOWN_POSITION
        );
        assert_eq!(account.position(), 0);
    }

    #[test]
    fn test_publisher_sees_written_records() {
        #[derive(Default)]
        struct Collect(Mutex<Vec<i64>>);

        impl Publisher for Collect {
            fn publish(&self, _: &Context, records: &[Record]) -> Result<()> {
                self.0.lock().extend(records.iter().map(|r| r.number));
                Ok(())
            }
        }

        let store = MemoryStore::new();
        let collect = Arc::new(Collect::default());
        let account = stream(&store, "account-1").with_publisher(collect.clone());

        account
            .append(&Context::background(), deposits(&[1, 2]))
            .unwrap();
        account
            .execute(&Context::background(), &mut deposit(3))
            .unwrap();
        assert_eq!(*collect.0.lock(), vec![1, 2, 3]);
    }
}
