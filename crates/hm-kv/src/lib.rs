//! Store client for the health manager.
//!
//! A hierarchical key-value store with per-key TTL behind the
//! [`StoreAdapter`] capability trait, an async [`StoreClient`] that runs
//! adapter calls on a bounded worker pool, and a distributed lock with
//! background lease renewal.

pub mod adapter;
pub mod client;
pub mod error;
pub mod lock;
pub mod memory;
mod node;
mod ops;
pub mod pool;
pub mod redb_adapter;
mod tables;

pub use adapter::StoreAdapter;
pub use client::{StoreClient, StoreWrite};
pub use error::{StoreError, StoreResult};
pub use lock::{LockHandle, LockRelease, lock_key};
pub use memory::MemoryAdapter;
pub use node::StoreNode;
pub use redb_adapter::RedbAdapter;
