//! In-memory store backend.
//!
//! Implements the full [`Store`](crate::store::Store) contract, including
//! group assignment and row-locked subscriber positions, without any I/O.

mod locks;
mod store;

pub use store::MemoryStore;
