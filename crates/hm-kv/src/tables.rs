//! redb table definitions for the persistent store adapter.
//!
//! The store is a single flat table keyed by normalized path
//! (`/actual/app-v1/0/guid`); directories are implied by key prefixes.

use redb::TableDefinition;

/// Every store entry, keyed by path. Values carry an expiry prefix.
pub const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
