//! Bounded-range page iteration.
//!
//! Every "read until caught up" loop in the engine runs through a [`Pager`]:
//! the projector pages open-ended to the tail, the broker pages a closed range
//! up to a notification, the distributor pages a backfill.

use crate::context::Context;
use crate::error::Result;

/// Iterates `(from, to]` windows of at most `page_size` positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pager {
    from: i64,
    to: Option<i64>,
    page_size: usize,
}

impl Pager {
    /// Open-ended pager starting after `from`.
    pub fn new(from: i64, page_size: usize) -> Self {
        Self {
            from,
            to: None,
            page_size: page_size.max(1),
        }
    }

    /// Closed-range pager covering `(from, to]`.
    pub fn range(from: i64, to: i64, page_size: usize) -> Self {
        Self {
            from,
            to: Some(to),
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Run `page(from, to, limit)` until it reports a short or empty page.
    ///
    /// The callback returns how many records it read. The window start moves
    /// forward by that count. Returns the total number of records read.
    pub fn run<F>(&self, ctx: &Context, mut page: F) -> Result<usize>
    where
        F: FnMut(i64, Option<i64>, usize) -> Result<usize>,
    {
        // Positions start at 1, so -1 ("unknown") and 0 bound the same window.
        let mut from = self.from.max(0);
        let mut total = 0;

        loop {
            if let Some(to) = self.to {
                if from >= to {
                    break;
                }
            }
            ctx.check()?;

            let read = page(from, self.to, self.page_size)?;
            total += read;

            if read == 0 || read < self.page_size {
                break;
            }
            from += read as i64;
        }

        Ok(total)
    }
}
