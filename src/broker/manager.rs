//! Subscription registry and delivery rounds.

use super::distributor::Distributor;
use super::types::Subscription;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::id::StreamId;
use crate::pager::Pager;
use crate::registry::Registry;
use crate::store::{Store, Transaction};
use crate::stream::{Handler, Publisher};
use crate::transport::{RecordHandler, Transport};
use crate::types::{Record, UNKNOWN_POSITION};
use crossbeam_channel::unbounded;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, info, warn};

/// Per-group state.
struct Group {
    name: String,
    /// Outbound side of the group's single transport registration.
    outbound: Mutex<Option<Arc<dyn RecordHandler>>>,
    /// Read-locked for a whole delivery round, write-locked to register.
    subscriptions: RwLock<Vec<Subscription>>,
    pending: Mutex<Pending>,
}

/// Notifications waiting for the group's running rounds to finish.
///
/// Only one caller drains a group at a time. Anyone notifying while a drain
/// is running queues the record and returns, which keeps a subscriber that
/// writes into its own group from waiting on the round it runs inside.
#[derive(Default)]
struct Pending {
    queue: VecDeque<Record>,
    draining: bool,
}

struct Inner {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    registry: Arc<Registry>,
    config: EngineConfig,
    groups: Mutex<HashMap<String, Arc<Group>>>,
}

/// Fans record notifications out to registered subscribers.
///
/// Cloning shares the same registry of groups and subscriptions.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        registry: Arc<Registry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                registry,
                config,
                groups: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Add `handler` as subscriber `subscriber_id` of `stream`.
    ///
    /// The stream's group is registered with the transport on first use. A
    /// subscriber id may follow several streams, but each stream only once.
    pub fn register(
        &self,
        ctx: &Context,
        subscriber_id: impl Into<String>,
        stream: StreamId,
        handler: Box<dyn Handler>,
    ) -> Result<()> {
        let subscriber_id = subscriber_id.into();
        if subscriber_id.is_empty() {
            return Err(Error::Configuration("subscriber id must not be empty".into()));
        }

        let group = self.inner.group(stream.group_name());
        self.outbound(ctx, &group)?;

        let mut subscriptions = group.subscriptions.write();
        if subscriptions
            .iter()
            .any(|s| s.id() == subscriber_id && *s.stream() == stream)
        {
            return Err(Error::Configuration(format!(
                "subscriber {} already registered on {}",
                subscriber_id, stream
            )));
        }

        info!(subscriber = %subscriber_id, stream = %stream, "Registered subscription");
        subscriptions.push(Subscription::new(subscriber_id, stream, handler));
        Ok(())
    }

    /// Run delivery for a newly written record.
    ///
    /// Returns once the record's round has run, unless a round for the same
    /// group is already running elsewhere; the record is then queued and
    /// delivered by that caller.
    pub fn deliver(&self, ctx: &Context, record: &Record) -> Result<()> {
        self.inner.notify(ctx, record)
    }

    pub fn subscription_count(&self, group: &str) -> usize {
        self.inner
            .groups
            .lock()
            .get(group)
            .map_or(0, |g| g.subscriptions.read().len())
    }

    /// Groups known to this broker, sorted.
    pub fn groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.groups.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Outbound handler of `group`, registering with the transport once.
    fn outbound(&self, ctx: &Context, group: &Group) -> Result<Arc<dyn RecordHandler>> {
        let mut outbound = group.outbound.lock();
        if let Some(handler) = outbound.as_ref() {
            return Ok(Arc::clone(handler));
        }

        let inbound = Arc::new(Inbound {
            broker: Arc::downgrade(&self.inner),
        });
        let handler = self.inner.transport.register(ctx, &group.name, inbound)?;
        *outbound = Some(Arc::clone(&handler));
        info!(group = %group.name, "Registered group with transport");
        Ok(handler)
    }
}

impl Publisher for Broker {
    /// Hand every record to its group's outbound handler.
    ///
    /// A failure does not stop the records after it: each of them still has
    /// to be numbered within its group. The first error is returned.
    fn publish(&self, ctx: &Context, records: &[Record]) -> Result<()> {
        let mut first_error = None;
        for record in records {
            let group = self.inner.group(&record.group);
            let published = self
                .outbound(ctx, &group)
                .and_then(|outbound| outbound.handle(ctx, record));
            if let Err(e) = published {
                debug!(
                    stream = %record.stream,
                    number = record.number,
                    error = %e,
                    "Record publish failed, continuing"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Inner {
    fn group(&self, name: &str) -> Arc<Group> {
        let mut groups = self.groups.lock();
        let group = groups.entry(name.to_string()).or_insert_with(|| {
            Arc::new(Group {
                name: name.to_string(),
                outbound: Mutex::new(None),
                subscriptions: RwLock::new(Vec::new()),
                pending: Mutex::new(Pending::default()),
            })
        });
        Arc::clone(group)
    }

    /// Queue `record` and drain the group unless someone else already is.
    fn notify(&self, ctx: &Context, record: &Record) -> Result<()> {
        let Some(group) = self.groups.lock().get(&record.group).cloned() else {
            return Ok(());
        };

        {
            let mut pending = group.pending.lock();
            pending.queue.push_back(record.clone());
            if pending.draining {
                debug!(
                    group = %group.name,
                    queued = pending.queue.len(),
                    "Round running, queued"
                );
                return Ok(());
            }
            pending.draining = true;
        }

        let mut first_error = None;
        loop {
            let next = {
                let mut pending = group.pending.lock();
                match pending.queue.pop_front() {
                    Some(record) => record,
                    None => {
                        pending.draining = false;
                        break;
                    }
                }
            };
            if let Err(e) = self.deliver(ctx, &group, &next) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn deliver(&self, ctx: &Context, group: &Group, record: &Record) -> Result<()> {
        let subscriptions = group.subscriptions.read();
        if subscriptions.is_empty() {
            debug!(group = %group.name, "No subscribers");
            return Ok(());
        }

        // Unassigned records can only be ordered within their own entity.
        let scan = if record.is_assigned() {
            record.stream.to_group()
        } else {
            record.stream.clone()
        };
        let high = record.position_in(&scan);

        let tx = self.store.begin(ctx)?;
        match self.round(ctx, tx.as_ref(), &subscriptions, &scan, high) {
            Ok(()) => {
                tx.commit()?;
                debug!(
                    stream = %scan,
                    position = high,
                    subscribers = subscriptions.len(),
                    "Delivery round committed"
                );
                Ok(())
            }
            Err(e) => {
                warn!(stream = %scan, position = high, error = %e, "Delivery round failed");
                if let Err(rollback) = tx.rollback() {
                    warn!(stream = %scan, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    fn round(
        &self,
        ctx: &Context,
        tx: &dyn Transaction,
        subscriptions: &[Subscription],
        scan: &StreamId,
        high: i64,
    ) -> Result<()> {
        let positions = lock_positions(ctx, tx, subscriptions)?;

        // Low watermark over subscribers counting in the scanned stream's
        // positions. The scan always covers the triggering record; anyone
        // further behind backfills from their own stream.
        let low = subscriptions
            .iter()
            .zip(&positions)
            .filter(|(s, _)| s.stream() == scan)
            .map(|(_, p)| *p)
            .min()
            .unwrap_or(high - 1)
            .min(high - 1)
            .max(UNKNOWN_POSITION);

        debug!(stream = %scan, low, high, "Starting delivery round");

        thread::scope(|scope| {
            let mut senders = Vec::with_capacity(subscriptions.len());
            let mut pipes = Vec::with_capacity(subscriptions.len());

            for (subscription, position) in subscriptions.iter().zip(positions) {
                let (sender, receiver) = unbounded();
                let distributor = Distributor::new(
                    subscription,
                    tx,
                    self.store.as_ref(),
                    &self.registry,
                    self.config.backfill_page_size,
                    position,
                );
                senders.push(sender);
                pipes.push(scope.spawn(move || distributor.run(ctx, receiver)));
            }

            let scanned = Pager::range(low, high, self.config.broker_page_size).run(
                ctx,
                |from, to, limit| {
                    let records = self.store.read_records(ctx, scan, from, to, limit)?;
                    for record in &records {
                        let message = self.registry.to_message(record)?;
                        for sender in &senders {
                            // A pipe that stopped early has already failed the round.
                            let _ = sender.send(message.clone());
                        }
                    }
                    Ok(records.len())
                },
            );
            drop(senders);

            let mut outcome = scanned.map(|_| ());
            for (pipe, subscription) in pipes.into_iter().zip(subscriptions) {
                let result = pipe.join().unwrap_or_else(|_| {
                    Err(Error::handler(format!(
                        "subscriber {} panicked",
                        subscription.id()
                    )))
                });
                match result {
                    Ok(position) => {
                        debug!(subscriber = subscription.id(), position, "Pipe finished")
                    }
                    Err(e) => {
                        warn!(subscriber = subscription.id(), error = %e, "Pipe failed");
                        if outcome.is_ok() {
                            outcome = Err(e);
                        }
                    }
                }
            }
            outcome
        })
    }
}

/// Lock every subscriber's position row, one stream at a time in sorted
/// order. Returns positions in subscription order.
fn lock_positions(
    ctx: &Context,
    tx: &dyn Transaction,
    subscriptions: &[Subscription],
) -> Result<Vec<i64>> {
    let mut by_stream: BTreeMap<&StreamId, Vec<usize>> = BTreeMap::new();
    for (index, subscription) in subscriptions.iter().enumerate() {
        by_stream.entry(subscription.stream()).or_default().push(index);
    }

    let mut positions = vec![UNKNOWN_POSITION; subscriptions.len()];
    for (stream, indexes) in by_stream {
        let ids: Vec<String> = indexes
            .iter()
            .map(|&i| subscriptions[i].id().to_string())
            .collect();
        let locked = tx.subscription_position_lock(ctx, stream, &ids)?;
        for (&index, position) in indexes.iter().zip(locked) {
            positions[index] = position.position;
        }
    }
    Ok(positions)
}

/// Inbound side of a group registration.
struct Inbound {
    broker: Weak<Inner>,
}

impl RecordHandler for Inbound {
    fn handle(&self, ctx: &Context, record: &Record) -> Result<bool> {
        match self.broker.upgrade() {
            Some(inner) => {
                inner.notify(ctx, record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
