//! In-memory store.

use super::locks::{LockTable, RowKey};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::id::StreamId;
use crate::store::{Store, Transaction};
use crate::types::{
    Record, RecordInput, Snapshot, SubscriptionPosition, Timestamp, UNKNOWN_POSITION,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct Data {
    /// Entity stream -> records, index = number - 1.
    streams: HashMap<StreamId, Vec<Record>>,

    /// Group -> assigned (stream, number), index = group_number - 1.
    groups: HashMap<String, Vec<(StreamId, i64)>>,

    snapshots: HashMap<(StreamId, String), Snapshot>,

    /// Committed subscriber positions.
    positions: HashMap<RowKey, i64>,
}

impl Data {
    fn tail(&self, stream: &StreamId) -> i64 {
        self.streams.get(stream).map_or(0, |r| r.len() as i64)
    }

    fn append(&mut self, stream: &StreamId, inputs: Vec<RecordInput>) -> Vec<Record> {
        let log = self.streams.entry(stream.clone()).or_default();
        let time = Timestamp::now();
        let mut written = Vec::with_capacity(inputs.len());

        for input in inputs {
            let record = Record {
                number: log.len() as i64 + 1,
                stream: stream.clone(),
                data: input.data,
                group: stream.group_name().to_string(),
                content_type: input.content_type,
                group_number: 0,
                time,
                correlation_id: input.correlation_id,
            };
            log.push(record.clone());
            written.push(record);
        }

        written
    }
}

struct Shared {
    data: RwLock<Data>,
    locks: LockTable,
}

/// Store that keeps everything in process memory.
///
/// Intended for tests, examples and embedding where durability is not needed.
/// Cloning shares the underlying data.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                data: RwLock::new(Data::default()),
                locks: LockTable::default(),
            }),
        }
    }

    /// Current tail of an entity stream (0 when empty).
    pub fn tail(&self, stream: &StreamId) -> i64 {
        self.shared.data.read().tail(stream)
    }

    /// Committed position of a subscriber, if any.
    pub fn subscription_position(&self, stream: &StreamId, subscriber_id: &str) -> Option<i64> {
        self.shared
            .data
            .read()
            .positions
            .get(&(stream.clone(), subscriber_id.to_string()))
            .copied()
    }

    /// Number of records in an entity stream or assigned in a group.
    pub fn len(&self, stream: &StreamId) -> usize {
        let data = self.shared.data.read();
        if stream.is_entity() {
            data.streams.get(stream).map_or(0, Vec::len)
        } else {
            data.groups.get(stream.group_name()).map_or(0, Vec::len)
        }
    }

    pub fn is_empty(&self, stream: &StreamId) -> bool {
        self.len(stream) == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn require_entity(stream: &StreamId) -> Result<()> {
    if stream.is_entity() {
        Ok(())
    } else {
        Err(Error::InvalidOperation(format!(
            "cannot write to group stream {}",
            stream
        )))
    }
}

impl Store for MemoryStore {
    fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction>> {
        ctx.check()?;
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            locked: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            finished: AtomicBool::new(false),
        }))
    }

    fn write_records(
        &self,
        ctx: &Context,
        stream: &StreamId,
        records: Vec<RecordInput>,
    ) -> Result<Vec<Record>> {
        ctx.check()?;
        require_entity(stream)?;
        Ok(self.shared.data.write().append(stream, records))
    }

    fn write_records_from(
        &self,
        ctx: &Context,
        stream: &StreamId,
        position: i64,
        records: Vec<RecordInput>,
    ) -> Result<Vec<Record>> {
        ctx.check()?;
        require_entity(stream)?;

        let mut data = self.shared.data.write();
        let tail = data.tail(stream);
        if position > tail {
            return Err(Error::InvalidSequence {
                stream: stream.clone(),
                got: position + 1,
                expected: tail + 1,
            });
        }
        if position != tail {
            debug!(stream = %stream, expected = position, tail, "Write conflict");
            return Err(Error::WriteConflict {
                stream: stream.clone(),
                position,
            });
        }

        Ok(data.append(stream, records))
    }

    fn read_records(
        &self,
        ctx: &Context,
        stream: &StreamId,
        from: i64,
        to: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        ctx.check()?;
        let data = self.shared.data.read();

        // Positions are dense, so (from, to] maps straight onto slice indices.
        let start = from.max(0) as usize;
        let window = |len: usize| {
            let end = to.map_or(len, |to| (to.max(0) as usize).min(len));
            let end = end.min(start.saturating_add(limit));
            start.min(end)..end
        };

        if stream.is_entity() {
            let Some(log) = data.streams.get(stream) else {
                return Ok(Vec::new());
            };
            return Ok(log[window(log.len())].to_vec());
        }

        let Some(order) = data.groups.get(stream.group_name()) else {
            return Ok(Vec::new());
        };
        order[window(order.len())]
            .iter()
            .map(|(entity, number)| {
                data.streams
                    .get(entity)
                    .and_then(|log| log.get(*number as usize - 1))
                    .cloned()
                    .ok_or_else(|| Error::RecordNotFound {
                        stream: entity.clone(),
                        number: *number,
                    })
            })
            .collect()
    }

    fn read_snapshot(
        &self,
        ctx: &Context,
        stream: &StreamId,
        name: &str,
    ) -> Result<Option<Snapshot>> {
        ctx.check()?;
        Ok(self
            .shared
            .data
            .read()
            .snapshots
            .get(&(stream.clone(), name.to_string()))
            .cloned())
    }

    fn update_snapshot(
        &self,
        ctx: &Context,
        stream: &StreamId,
        name: &str,
        snapshot: Snapshot,
    ) -> Result<()> {
        ctx.check()?;
        self.shared
            .data
            .write()
            .snapshots
            .insert((stream.clone(), name.to_string()), snapshot);
        Ok(())
    }

    fn assign_group(&self, ctx: &Context, stream: &StreamId, number: i64) -> Result<Record> {
        ctx.check()?;
        require_entity(stream)?;

        let mut data = self.shared.data.write();
        let Data {
            streams, groups, ..
        } = &mut *data;

        let record = streams
            .get_mut(stream)
            .and_then(|log| {
                usize::try_from(number - 1)
                    .ok()
                    .and_then(|idx| log.get_mut(idx))
            })
            .ok_or_else(|| Error::RecordNotFound {
                stream: stream.clone(),
                number,
            })?;

        if record.is_assigned() {
            return Err(Error::AssignmentConflict {
                stream: stream.clone(),
                number,
            });
        }

        let order = groups.entry(stream.group_name().to_string()).or_default();
        order.push((stream.clone(), number));
        record.group_number = order.len() as i64;

        debug!(
            stream = %stream,
            number,
            group_number = record.group_number,
            "Assigned group number"
        );
        Ok(record.clone())
    }
}

/// Transaction over [`MemoryStore`] subscriber positions.
///
/// Position writes are buffered and become visible on commit.
struct MemoryTransaction {
    shared: Arc<Shared>,
    locked: Mutex<Vec<RowKey>>,
    pending: Mutex<HashMap<RowKey, i64>>,
    finished: AtomicBool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<()> {
        if self.finished.load(Ordering::SeqCst) {
            Err(Error::Transaction("transaction already finished".into()))
        } else {
            Ok(())
        }
    }

    fn finish(&self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            let keys = std::mem::take(&mut *self.locked.lock());
            self.shared.locks.release(&keys);
        }
    }
}

impl Transaction for MemoryTransaction {
    fn subscription_position_lock(
        &self,
        ctx: &Context,
        stream: &StreamId,
        subscriber_ids: &[String],
    ) -> Result<Vec<SubscriptionPosition>> {
        self.ensure_open()?;

        let keys: Vec<RowKey> = subscriber_ids
            .iter()
            .map(|id| (stream.clone(), id.clone()))
            .collect();
        let fresh: Vec<RowKey> = {
            let locked = self.locked.lock();
            let mut fresh: Vec<RowKey> = keys
                .iter()
                .filter(|k| !locked.contains(k))
                .cloned()
                .collect();
            fresh.sort();
            fresh.dedup();
            fresh
        };

        self.shared.locks.acquire(ctx, &fresh)?;
        self.locked.lock().extend(fresh);

        let data = self.shared.data.read();
        let pending = self.pending.lock();
        Ok(keys
            .into_iter()
            .map(|key| {
                let position = pending
                    .get(&key)
                    .or_else(|| data.positions.get(&key))
                    .copied()
                    .unwrap_or(UNKNOWN_POSITION);
                SubscriptionPosition::new(key.1, position)
            })
            .collect())
    }

    fn set_subscription_position(
        &self,
        ctx: &Context,
        stream: &StreamId,
        position: SubscriptionPosition,
    ) -> Result<()> {
        ctx.check()?;
        self.ensure_open()?;

        let key = (stream.clone(), position.subscription_id);
        if !self.locked.lock().contains(&key) {
            return Err(Error::Transaction(format!(
                "position of {} on {} is not locked",
                key.1, stream
            )));
        }

        // Lock order is always data before pending.
        let committed = self.shared.data.read().positions.get(&key).copied();
        let mut pending = self.pending.lock();
        let current = pending
            .get(&key)
            .copied()
            .or(committed)
            .unwrap_or(UNKNOWN_POSITION);
        if position.position < current {
            return Err(Error::Transaction(format!(
                "position of {} on {} would move back from {} to {}",
                key.1, stream, current, position.position
            )));
        }

        pending.insert(key, position.position);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.ensure_open()?;
        {
            let mut data = self.shared.data.write();
            for (key, position) in self.pending.lock().drain() {
                data.positions.insert(key, position);
            }
        }
        self.finish();
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        self.ensure_open()?;
        self.pending.lock().clear();
        self.finish();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.finish();
    }
}
