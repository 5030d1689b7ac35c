//! hm-state: typed health manager state.
//!
//! Layers the health manager's key layout, JSON encoding, TTL policy and
//! freshness tombstones over the generic [`hm_kv::StoreClient`].

pub mod freshness;
pub mod keys;
pub mod snapshot;
pub mod store;

pub use freshness::Freshness;
pub use snapshot::{CrashKey, StoreSnapshot};
pub use store::Store;
