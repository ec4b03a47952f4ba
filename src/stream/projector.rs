//! Replays stored records into a handler.

use super::handler::Handler;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::id::StreamId;
use crate::pager::Pager;
use crate::registry::{ContentType, Encoding, Registry};
use crate::store::Store;
use crate::types::{Snapshot, UNKNOWN_POSITION};
use tracing::{debug, warn};

/// Outcome of a snapshot-aware projection.
///
/// A failed snapshot write does not fail the projection; it is reported here
/// next to the position that was reached.
#[derive(Debug)]
pub struct Projection {
    pub position: i64,
    pub snapshot_error: Option<Error>,
}

/// Drives a handler from a known position to the tail of a stream.
pub struct Projector<'a> {
    store: &'a dyn Store,
    registry: &'a Registry,
    page_size: usize,
}

impl<'a> Projector<'a> {
    pub fn new(store: &'a dyn Store, registry: &'a Registry, page_size: usize) -> Self {
        Self {
            store,
            registry,
            page_size,
        }
    }

    /// Apply every record after `from` to `handler`, in order.
    ///
    /// Returns the position of the last applied record, or `from` when the
    /// stream had nothing new. A handler error stops the replay; records
    /// applied before it stay applied.
    pub fn project(
        &self,
        ctx: &Context,
        stream: &StreamId,
        from: i64,
        handler: &mut dyn Handler,
    ) -> Result<i64> {
        let mut position = from;

        Pager::new(from, self.page_size).run(ctx, |from, to, limit| {
            let records = self.store.read_records(ctx, stream, from, to, limit)?;
            for record in &records {
                let message = self.registry.to_message(record)?;
                handler.handle(&message).map_err(Error::Handler)?;
                position = record.position_in(stream);
            }
            Ok(records.len())
        })?;

        Ok(position)
    }

    /// Like [`Projector::project`], but starts from the handler's snapshot
    /// when it has one and saves a fresh snapshot when the replay moved on.
    ///
    /// Snapshots are only restored when replaying from the beginning.
    pub fn project_with_snapshot(
        &self,
        ctx: &Context,
        stream: &StreamId,
        from: i64,
        handler: &mut dyn Handler,
    ) -> Result<Projection> {
        let name = handler
            .snapshot()
            .map(|snapshotter| snapshotter.snapshot_name().to_string());
        let Some(name) = name else {
            let position = self.project(ctx, stream, from, handler)?;
            return Ok(Projection {
                position,
                snapshot_error: None,
            });
        };

        let start = if from < 0 {
            self.restore(ctx, stream, &name, handler)
        } else {
            from
        };

        let position = self.project(ctx, stream, start, handler)?;
        let snapshot_error = if position > start {
            self.save(ctx, stream, &name, position, handler).err()
        } else {
            None
        };

        Ok(Projection {
            position,
            snapshot_error,
        })
    }

    /// Load the named snapshot into `handler`, returning the position to
    /// replay from. Any failure means a full replay.
    fn restore(
        &self,
        ctx: &Context,
        stream: &StreamId,
        name: &str,
        handler: &mut dyn Handler,
    ) -> i64 {
        let snapshot = match self.store.read_snapshot(ctx, stream, name) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return UNKNOWN_POSITION,
            Err(e) => {
                warn!(
                    stream = %stream,
                    snapshot = name,
                    error = %e,
                    "Snapshot read failed, replaying from start"
                );
                return UNKNOWN_POSITION;
            }
        };

        let restored = snapshot
            .content_type
            .parse::<ContentType>()
            .map(|ct| ct.encoding)
            .or_else(|_| Encoding::from_mime(&snapshot.content_type))
            .and_then(|encoding| match handler.snapshot() {
                Some(snapshotter) => snapshotter.restore(encoding, &snapshot.data),
                None => Err(Error::InvalidOperation("handler lost its snapshot".into())),
            });

        match restored {
            Ok(()) => {
                debug!(
                    stream = %stream,
                    snapshot = name,
                    position = snapshot.position,
                    "Restored snapshot"
                );
                snapshot.position
            }
            Err(e) => {
                warn!(
                    stream = %stream,
                    snapshot = name,
                    error = %e,
                    "Snapshot restore failed, replaying from start"
                );
                UNKNOWN_POSITION
            }
        }
    }

    fn save(
        &self,
        ctx: &Context,
        stream: &StreamId,
        name: &str,
        position: i64,
        handler: &mut dyn Handler,
    ) -> Result<()> {
        let encoding = self.registry.encoding();
        let data = match handler.snapshot() {
            Some(snapshotter) => snapshotter.save(encoding)?,
            None => return Ok(()),
        };
        let snapshot = Snapshot {
            data,
            position,
            content_type: ContentType::new(encoding, name).to_string(),
        };
        self.store.update_snapshot(ctx, stream, name, snapshot)?;
        debug!(stream = %stream, snapshot = name, position, "Saved snapshot");
        Ok(())
    }
}
