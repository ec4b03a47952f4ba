//! Per-subscriber delivery.
//!
//! A distributor owns one subscriber's pipe for the length of a broker round.
//! It compares every incoming message against the subscriber's last applied
//! position:
//!
//! - already applied: dropped
//! - exactly the next one: applied
//! - further ahead: the missing records are read from the store and applied
//!   first, which ends with the incoming message itself
//!
//! The position is written to the round's transaction after every applied
//! message. A handler error stops the pipe with the position untouched, so the
//! next round sees the same message as a gap and tries again.

use super::types::Subscription;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::pager::Pager;
use crate::registry::Registry;
use crate::store::{Store, Transaction};
use crate::stream::Handler;
use crate::types::{Message, SubscriptionPosition};
use crossbeam_channel::Receiver;
use tracing::{debug, trace};

pub(crate) struct Distributor<'a> {
    subscription: &'a Subscription,
    tx: &'a dyn Transaction,
    store: &'a dyn Store,
    registry: &'a Registry,
    page_size: usize,
    position: i64,
}

impl<'a> Distributor<'a> {
    pub(crate) fn new(
        subscription: &'a Subscription,
        tx: &'a dyn Transaction,
        store: &'a dyn Store,
        registry: &'a Registry,
        page_size: usize,
        position: i64,
    ) -> Self {
        Self {
            subscription,
            tx,
            store,
            registry,
            page_size,
            position,
        }
    }

    /// Last applied position.
    #[cfg(test)]
    pub(crate) fn position(&self) -> i64 {
        self.position
    }

    /// Drain `messages` until the broker closes the pipe.
    pub(crate) fn run(mut self, ctx: &Context, messages: Receiver<Message>) -> Result<i64> {
        let subscription = self.subscription;
        let mut handler = subscription.handler.lock();
        for message in messages {
            ctx.check()?;
            self.deliver(ctx, handler.as_mut(), &message)?;
        }
        Ok(self.position)
    }

    pub(crate) fn deliver(
        &mut self,
        ctx: &Context,
        handler: &mut dyn Handler,
        message: &Message,
    ) -> Result<()> {
        if !self.subscription.accepts(message) {
            return Ok(());
        }

        let subscription = self.subscription;
        let stream = subscription.stream();
        let position = message.position_in(stream);
        let next = self.position + 1;

        if next > position {
            trace!(subscriber = subscription.id(), position, "Discarding applied message");
            return Ok(());
        }
        if next == position {
            return self.apply(ctx, handler, message);
        }

        debug!(
            subscriber = subscription.id(),
            stream = %stream,
            from = self.position,
            to = position,
            "Backfilling gap"
        );
        Pager::range(self.position, position, self.page_size).run(ctx, |from, to, limit| {
            let records = self.store.read_records(ctx, stream, from, to, limit)?;
            for record in &records {
                let message = self.registry.to_message(record)?;
                self.apply(ctx, handler, &message)?;
            }
            Ok(records.len())
        })?;

        Ok(())
    }

    fn apply(&mut self, ctx: &Context, handler: &mut dyn Handler, message: &Message) -> Result<()> {
        let subscription = self.subscription;
        let position = message.position_in(subscription.stream());
        handler.handle(message).map_err(Error::Handler)?;
        self.tx.set_subscription_position(
            ctx,
            subscription.stream(),
            SubscriptionPosition::new(subscription.id(), position),
        )?;
        self.position = position;
        Ok(())
    }
}
