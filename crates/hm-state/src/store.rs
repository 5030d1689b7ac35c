//! Store: typed health manager state over the generic store client.
//!
//! Every entity is JSON-encoded under the key layout in [`crate::keys`]
//! with the TTL its owner needs. Reads of a whole directory treat a
//! missing directory as empty and skip entries that fail to decode, so
//! one corrupt record never hides the rest.

use std::collections::BTreeMap;
use std::sync::Arc;

use hm_core::{
    CrashCount, DesiredAppState, HmConfig, InstanceHeartbeat, PendingStartMessage,
    PendingStopMessage, app_key,
};
use hm_kv::{StoreClient, StoreError, StoreResult, StoreWrite};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::freshness::{self, Freshness};
use crate::keys::*;
use crate::snapshot::{CrashKey, StoreSnapshot};

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Codec(e.to_string()))
}

/// Typed access to health manager state. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    client: StoreClient,
    config: Arc<HmConfig>,
}

impl Store {
    pub fn new(client: StoreClient, config: Arc<HmConfig>) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &StoreClient {
        &self.client
    }

    pub fn config(&self) -> &HmConfig {
        &self.config
    }

    async fn list<T: DeserializeOwned>(&self, dir: &str) -> StoreResult<Vec<T>> {
        let tree = match self.client.list_recursively(dir).await {
            Ok(tree) => tree,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut items = Vec::new();
        for leaf in tree.leaves() {
            match serde_json::from_slice(&leaf.value) {
                Ok(item) => items.push(item),
                Err(e) => warn!(key = %leaf.key, error = %e, "skipping undecodable entry"),
            }
        }
        Ok(items)
    }

    async fn get_one<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.client.get(key).await {
            Ok(node) => serde_json::from_slice(&node.value)
                .map(Some)
                .map_err(|e| StoreError::Codec(format!("{key}: {e}"))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ── Freshness ──────────────────────────────────────────────────

    pub async fn bump_actual_freshness(&self, now: u64) -> StoreResult<()> {
        freshness::bump(
            &self.client,
            ACTUAL_FRESHNESS,
            self.config.actual_freshness_ttl(),
            now,
        )
        .await
    }

    pub async fn bump_desired_freshness(&self, now: u64) -> StoreResult<()> {
        freshness::bump(
            &self.client,
            DESIRED_FRESHNESS,
            self.config.desired_freshness_ttl(),
            now,
        )
        .await
    }

    pub async fn is_actual_fresh(&self) -> StoreResult<bool> {
        freshness::is_fresh(&self.client, ACTUAL_FRESHNESS).await
    }

    pub async fn is_desired_fresh(&self) -> StoreResult<bool> {
        freshness::is_fresh(&self.client, DESIRED_FRESHNESS).await
    }

    pub async fn freshness(&self) -> StoreResult<Freshness> {
        let (actual, desired) = tokio::try_join!(
            freshness::timestamp(&self.client, ACTUAL_FRESHNESS),
            freshness::timestamp(&self.client, DESIRED_FRESHNESS),
        )?;
        Ok(Freshness { actual, desired })
    }

    /// Both sources are fresh and the actual state has had a full
    /// freshness window to fill in.
    pub async fn is_settled(&self, now: u64) -> StoreResult<bool> {
        Ok(self
            .freshness()
            .await?
            .is_settled(now, self.config.actual_freshness_ttl()))
    }

    // ── Desired state ──────────────────────────────────────────────

    pub async fn save_desired_states(&self, states: &[DesiredAppState]) -> StoreResult<()> {
        let ttl = self.config.desired_state_ttl();
        let writes = states
            .iter()
            .map(|s| Ok(StoreWrite::new(desired_key(s), encode(s)?, ttl)))
            .collect::<StoreResult<Vec<_>>>()?;
        self.client.set_many(writes).await?;
        debug!(count = states.len(), "desired states stored");
        Ok(())
    }

    pub async fn get_desired_states(&self) -> StoreResult<BTreeMap<String, DesiredAppState>> {
        let states: Vec<DesiredAppState> = self.list(DESIRED_DIR).await?;
        Ok(states.into_iter().map(|s| (s.store_key(), s)).collect())
    }

    pub async fn get_desired_state(
        &self,
        app_id: &str,
        app_version: &str,
    ) -> StoreResult<Option<DesiredAppState>> {
        let key = format!("{DESIRED_DIR}/{}", app_key(app_id, app_version));
        self.get_one(&key).await
    }

    // ── Actual state ───────────────────────────────────────────────

    /// Write each heartbeat with the heartbeat TTL and report every
    /// instance's outcome, keyed by instance guid.
    pub async fn save_heartbeats(
        &self,
        heartbeats: &[InstanceHeartbeat],
    ) -> Vec<(String, StoreResult<()>)> {
        let ttl = self.config.heartbeat_ttl();
        let mut outcomes = Vec::with_capacity(heartbeats.len());
        let mut writes = Vec::with_capacity(heartbeats.len());
        let mut guids = Vec::with_capacity(heartbeats.len());
        for hb in heartbeats {
            match encode(hb) {
                Ok(value) => {
                    writes.push(StoreWrite::new(heartbeat_key(hb), value, ttl));
                    guids.push(hb.instance_guid.clone());
                }
                Err(e) => outcomes.push((hb.instance_guid.clone(), Err(e))),
            }
        }
        let results = self.client.set_each(writes).await;
        outcomes.extend(guids.into_iter().zip(results).map(|(guid, (_, r))| (guid, r)));
        outcomes
    }

    pub async fn get_heartbeats(&self) -> StoreResult<Vec<InstanceHeartbeat>> {
        self.list(ACTUAL_DIR).await
    }

    // ── Crash history ──────────────────────────────────────────────

    pub async fn save_crash_counts(&self, crashes: &[CrashCount]) -> StoreResult<()> {
        let ttl = self.config.crash_count_ttl();
        let writes = crashes
            .iter()
            .map(|c| Ok(StoreWrite::new(crash_key(c), encode(c)?, ttl)))
            .collect::<StoreResult<Vec<_>>>()?;
        self.client.set_many(writes).await
    }

    pub async fn get_crash_counts(&self) -> StoreResult<BTreeMap<CrashKey, CrashCount>> {
        let crashes: Vec<CrashCount> = self.list(CRASHES_DIR).await?;
        Ok(crashes
            .into_iter()
            .map(|c| ((c.app_key(), c.instance_index), c))
            .collect())
    }

    // ── Pending starts ─────────────────────────────────────────────

    pub async fn save_pending_starts(&self, starts: &[PendingStartMessage]) -> StoreResult<()> {
        let writes = starts
            .iter()
            .map(|s| Ok(StoreWrite::new(start_key(s), encode(s)?, 0)))
            .collect::<StoreResult<Vec<_>>>()?;
        self.client.set_many(writes).await
    }

    pub async fn get_pending_starts(&self) -> StoreResult<BTreeMap<String, PendingStartMessage>> {
        let starts: Vec<PendingStartMessage> = self.list(PENDING_START_DIR).await?;
        Ok(starts.into_iter().map(|s| (s.store_key(), s)).collect())
    }

    pub async fn get_pending_start(&self, key: &str) -> StoreResult<Option<PendingStartMessage>> {
        self.get_one(&pending_start_key(key)).await
    }

    /// Delete pending starts by app key. Already-missing keys are fine.
    pub async fn delete_pending_starts(&self, keys: &[String]) -> StoreResult<()> {
        let keys = keys.iter().map(|k| pending_start_key(k)).collect();
        self.client.delete_many(keys).await
    }

    // ── Pending stops ──────────────────────────────────────────────

    pub async fn save_pending_stops(&self, stops: &[PendingStopMessage]) -> StoreResult<()> {
        let writes = stops
            .iter()
            .map(|s| Ok(StoreWrite::new(stop_key(s), encode(s)?, 0)))
            .collect::<StoreResult<Vec<_>>>()?;
        self.client.set_many(writes).await
    }

    pub async fn get_pending_stops(&self) -> StoreResult<BTreeMap<String, PendingStopMessage>> {
        let stops: Vec<PendingStopMessage> = self.list(PENDING_STOP_DIR).await?;
        Ok(stops.into_iter().map(|s| (s.store_key(), s)).collect())
    }

    /// Delete pending stops by instance guid. Already-missing keys are fine.
    pub async fn delete_pending_stops(&self, guids: &[String]) -> StoreResult<()> {
        let keys = guids.iter().map(|g| pending_stop_key(g)).collect();
        self.client.delete_many(keys).await
    }

    // ── Snapshot ───────────────────────────────────────────────────

    /// Read every directory the analyzer needs. Any store error aborts the
    /// whole read.
    pub async fn snapshot(&self) -> StoreResult<StoreSnapshot> {
        let (desired, heartbeats, crash_counts, pending_starts, pending_stops) = tokio::try_join!(
            self.get_desired_states(),
            self.get_heartbeats(),
            self.get_crash_counts(),
            self.get_pending_starts(),
            self.get_pending_stops(),
        )?;
        Ok(StoreSnapshot {
            desired,
            heartbeats,
            crash_counts,
            pending_starts,
            pending_stops,
        })
    }
}
