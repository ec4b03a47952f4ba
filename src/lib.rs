//! # Ordinal
//!
//! An embeddable event-sourcing engine: append-only, strictly ordered streams
//! with at-least-once fan-out to subscribers that apply every record exactly
//! once, in order.
//!
//! ## Core Concepts
//!
//! - **Streams**: `group-entity` ids. Each entity stream numbers its records
//!   1, 2, 3, ... and every record also gets a group number that orders it
//!   among all entities of its group
//! - **Commands**: replay a stream, decide new messages, append them under
//!   optimistic concurrency with bounded retry
//! - **Projections**: replay a stream into a handler, accelerated by snapshots
//! - **Subscriptions**: per-subscriber durable positions; missed records are
//!   backfilled from the store and re-deliveries are dropped
//!
//! ## Example
//!
//! ```ignore
//! use ordinal::{Context, EngineConfig, EventStore, Payload, Registry, StreamId};
//!
//! let mut registry = Registry::new();
//! registry.register::<OrderPlaced>("OrderPlaced")?;
//! let engine = EventStore::in_memory(registry, EngineConfig::default())?;
//!
//! let ctx = Context::background();
//! engine.subscribe(&ctx, "billing", &StreamId::group("orders"), Billing::default())?;
//!
//! // Positions 1..=2, and "billing" sees both
//! engine.append(&ctx, &"orders-42".parse()?, vec![
//!     Payload::new(OrderPlaced { .. }),
//!     Payload::new(OrderPlaced { .. }),
//! ])?;
//! ```

pub mod broker;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod id;
pub mod memory;
pub mod pager;
pub mod registry;
pub mod store;
pub mod stream;
pub mod transport;
pub mod types;

// Re-exports
pub use broker::{Broker, Subscription};
pub use config::EngineConfig;
pub use context::Context;
pub use engine::EventStore;
pub use error::{BoxError, Error, Result};
pub use id::StreamId;
pub use memory::MemoryStore;
pub use pager::Pager;
pub use registry::{ContentType, Encoding, Payload, Registry};
pub use store::{Store, Transaction};
pub use stream::{
    handler_fn, Appender, Command, Handler, HandlerFn, Projection, Projector, Publisher,
    Snapshotter, Stream,
};
pub use transport::{LocalTransport, MessageId, RecordHandler, Transport};
pub use types::{
    Message, Record, RecordInput, Snapshot, SubscriptionPosition, Timestamp, UNKNOWN_POSITION,
};
