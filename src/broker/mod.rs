//! Subscriber fan-out.
//!
//! The [`Broker`] keeps, per group, the registered subscriptions and the
//! group's single transport registration. Every notification runs one
//! delivery round:
//!
//! 1. Open a store transaction and lock the position row of every subscriber
//!    in the group.
//! 2. Page the store from the lowest locked position up to the notified
//!    record, broadcasting each message to one pipe per subscriber.
//! 3. Close the pipes, wait for all of them, then commit, or roll back if any
//!    read or handler failed.
//!
//! Each pipe is drained by a distributor that drops what its subscriber has
//! already applied and backfills what it has missed.
//!
//! Rounds of one group never overlap within a broker. A notification that
//! arrives while a round is running, including one raised by a subscriber
//! writing into its own group, is queued and run by the caller already
//! draining the group once its current round has committed.

mod distributor;
mod manager;
mod types;

pub use manager::Broker;
pub use types::Subscription;
