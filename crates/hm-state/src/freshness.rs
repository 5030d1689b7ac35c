//! Freshness tombstones.
//!
//! A data source is fresh while its tombstone key exists. The stored
//! timestamp records when the tombstone was first created and is carried
//! over unchanged on every bump; only the TTL moves. That lets readers
//! tell how long a source has been continuously reporting.

use hm_core::FreshnessTimestamp;
use hm_kv::{StoreClient, StoreError, StoreResult};
use tracing::warn;

/// Creation time of the tombstone at `key`, or `None` when absent.
pub async fn timestamp(client: &StoreClient, key: &str) -> StoreResult<Option<u64>> {
    match client.get(key).await {
        Ok(node) => {
            let stamp: FreshnessTimestamp = serde_json::from_slice(&node.value)
                .map_err(|e| StoreError::Codec(format!("{key}: {e}")))?;
            Ok(Some(stamp.timestamp))
        }
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Create the tombstone at `now`, or refresh its TTL keeping the original
/// timestamp.
pub async fn bump(client: &StoreClient, key: &str, ttl: u64, now: u64) -> StoreResult<()> {
    let created = match timestamp(client, key).await {
        Ok(Some(created)) => created,
        Ok(None) => now,
        Err(StoreError::Codec(reason)) => {
            warn!(key, %reason, "replacing undecodable freshness tombstone");
            now
        }
        Err(e) => return Err(e),
    };
    let value = serde_json::to_vec(&FreshnessTimestamp { timestamp: created })
        .map_err(|e| StoreError::Codec(e.to_string()))?;
    client.set(key, value, ttl).await
}

/// Whether the tombstone at `key` exists.
pub async fn is_fresh(client: &StoreClient, key: &str) -> StoreResult<bool> {
    match client.get(key).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Tombstone creation times of both data sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Freshness {
    pub actual: Option<u64>,
    pub desired: Option<u64>,
}

impl Freshness {
    /// Both tombstones exist.
    pub fn is_fresh(&self) -> bool {
        self.actual.is_some() && self.desired.is_some()
    }

    /// Both tombstones exist and the actual one has been alive for at
    /// least `actual_window` seconds, so every host has had a chance to
    /// report.
    pub fn is_settled(&self, now: u64, actual_window: u64) -> bool {
        match (self.actual, self.desired) {
            (Some(actual), Some(_)) => now.saturating_sub(actual) >= actual_window,
            _ => false,
        }
    }
}
