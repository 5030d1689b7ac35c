//! hm-fetcher: keeps desired state in the store.
//!
//! [`Fetcher`] asks for bulk API credentials over the bus, pages through
//! the bulk API with [`BulkClient`], and writes each app's desired state
//! with a TTL. A pass that reaches the last page renews the desired-state
//! freshness tombstone.

pub mod bulk;
pub mod error;
pub mod fetcher;

#[cfg(test)]
mod fake;

pub use bulk::{BulkClient, BulkPage};
pub use error::{FetchError, FetchResult};
pub use fetcher::{FetchReport, FetchState, Fetcher};
