//! Storage boundary.
//!
//! The engine never touches a database directly; it talks to a [`Store`].
//! A store owns the records and is the source of truth for:
//!
//! - Per-entity numbering: `number` runs 1, 2, 3, ... with no gaps
//! - Group numbering: `group_number` is assigned once per record, in call order
//! - Snapshots, one per `(stream, name)`
//! - Subscriber positions, read and written under a [`Transaction`]
//!
//! # Position ranges
//!
//! Reads take a half-open window `(from, to]`: records whose position is
//! strictly greater than `from` and at most `to` (`None` = to the tail), in
//! ascending order. Position means `number` for entity streams and
//! `group_number` for group streams. A group stream only yields records that
//! have been assigned a group number.

use crate::context::Context;
use crate::error::Result;
use crate::id::StreamId;
use crate::types::{Record, RecordInput, Snapshot, SubscriptionPosition};
use std::sync::Arc;

/// Durable record storage consumed by the engine.
pub trait Store: Send + Sync {
    /// Start a transaction for subscriber-position bookkeeping.
    fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction>>;

    /// Append at the current tail, whatever it is.
    fn write_records(
        &self,
        ctx: &Context,
        stream: &StreamId,
        records: Vec<RecordInput>,
    ) -> Result<Vec<Record>>;

    /// Append at `position + 1`.
    ///
    /// Fails with `Error::WriteConflict { stream, position }` and writes
    /// nothing when the tail is no longer `position`.
    fn write_records_from(
        &self,
        ctx: &Context,
        stream: &StreamId,
        position: i64,
        records: Vec<RecordInput>,
    ) -> Result<Vec<Record>>;

    /// Read at most `limit` records in `(from, to]`.
    fn read_records(
        &self,
        ctx: &Context,
        stream: &StreamId,
        from: i64,
        to: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Record>>;

    fn read_snapshot(&self, ctx: &Context, stream: &StreamId, name: &str)
        -> Result<Option<Snapshot>>;

    fn update_snapshot(
        &self,
        ctx: &Context,
        stream: &StreamId,
        name: &str,
        snapshot: Snapshot,
    ) -> Result<()>;

    /// Give `stream@number` the next group number of its group.
    ///
    /// Returns the fully populated record. A record that already has a group
    /// number fails with `Error::AssignmentConflict` and keeps its number.
    fn assign_group(&self, ctx: &Context, stream: &StreamId, number: i64) -> Result<Record>;
}

/// Unit of work for subscriber positions.
///
/// Locks taken by [`Transaction::subscription_position_lock`] are held until
/// commit or rollback. Dropping an unfinished transaction rolls it back.
pub trait Transaction: Send + Sync {
    /// Lock and read the positions of `subscriber_ids` on `stream`.
    ///
    /// Blocks while another transaction holds any of them. Subscribers with no
    /// stored position come back at -1. Results follow the order of
    /// `subscriber_ids`.
    fn subscription_position_lock(
        &self,
        ctx: &Context,
        stream: &StreamId,
        subscriber_ids: &[String],
    ) -> Result<Vec<SubscriptionPosition>>;

    fn set_subscription_position(
        &self,
        ctx: &Context,
        stream: &StreamId,
        position: SubscriptionPosition,
    ) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}

impl<S> Store for Arc<S>
where
    S: Store + ?Sized,
{
    fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction>> {
        (**self).begin(ctx)
    }

    fn write_records(
        &self,
        ctx: &Context,
        stream: &StreamId,
        records: Vec<RecordInput>,
    ) -> Result<Vec<Record>> {
        (**self).write_records(ctx, stream, records)
    }

    fn write_records_from(
        &self,
        ctx: &Context,
        stream: &StreamId,
        position: i64,
        records: Vec<RecordInput>,
    ) -> Result<Vec<Record>> {
        (**self).write_records_from(ctx, stream, position, records)
    }

    fn read_records(
        &self,
        ctx: &Context,
        stream: &StreamId,
        from: i64,
        to: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        (**self).read_records(ctx, stream, from, to, limit)
    }

    fn read_snapshot(
        &self,
        ctx: &Context,
        stream: &StreamId,
        name: &str,
    ) -> Result<Option<Snapshot>> {
        (**self).read_snapshot(ctx, stream, name)
    }

    fn update_snapshot(
        &self,
        ctx: &Context,
        stream: &StreamId,
        name: &str,
        snapshot: Snapshot,
    ) -> Result<()> {
        (**self).update_snapshot(ctx, stream, name, snapshot)
    }

    fn assign_group(&self, ctx: &Context, stream: &StreamId, number: i64) -> Result<Record> {
        (**self).assign_group(ctx, stream, number)
    }
}
