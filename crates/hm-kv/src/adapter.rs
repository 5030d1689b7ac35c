//! The capability interface every store backend implements.
//!
//! Adapters are synchronous; [`StoreClient`](crate::StoreClient) runs them
//! on its bounded worker pool. Core logic only ever sees this trait.

use crate::error::StoreResult;
use crate::node::StoreNode;

/// A hierarchical key-value store with per-key TTL.
///
/// `ttl` is in seconds; 0 means the key never expires.
pub trait StoreAdapter: Send + Sync + 'static {
    /// Read a single value. Directories yield `IsDirectory`.
    fn get(&self, key: &str) -> StoreResult<StoreNode>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &[u8], ttl: u64) -> StoreResult<()>;

    /// Read the whole tree beneath `key`.
    fn list_recursively(&self, key: &str) -> StoreResult<StoreNode>;

    /// Remove a value, or a directory and everything beneath it.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// Write a value only if the key does not exist (`Conflict` otherwise).
    fn create(&self, key: &str, value: &[u8], ttl: u64) -> StoreResult<()>;

    /// Replace a value only if it currently equals `expected`.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: &[u8],
        ttl: u64,
    ) -> StoreResult<()>;
}
