//! Row locks for subscriber positions.

use crate::context::Context;
use crate::error::Result;
use crate::id::StreamId;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::time::Duration;

/// How often a blocked locker re-checks its context.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Key of one subscriber-position row.
pub(crate) type RowKey = (StreamId, String);

/// Set of rows currently held by open transactions.
#[derive(Default)]
pub(crate) struct LockTable {
    held: Mutex<HashSet<RowKey>>,
    released: Condvar,
}

impl LockTable {
    /// Take every row in `keys`, waiting until none is held by anyone else.
    ///
    /// Rows are taken all at once, so two lockers asking for overlapping sets
    /// can never each hold half of what the other needs.
    pub(crate) fn acquire(&self, ctx: &Context, keys: &[RowKey]) -> Result<()> {
        let mut held = self.held.lock();
        loop {
            ctx.check()?;
            if keys.iter().all(|k| !held.contains(k)) {
                held.extend(keys.iter().cloned());
                return Ok(());
            }
            let wait = ctx
                .remaining()
                .map_or(POLL_INTERVAL, |left| left.min(POLL_INTERVAL));
            self.released.wait_for(&mut held, wait);
        }
    }

    pub(crate) fn release(&self, keys: &[RowKey]) {
        if keys.is_empty() {
            return;
        }
        let mut held = self.held.lock();
        for key in keys {
            held.remove(key);
        }
        self.released.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}
