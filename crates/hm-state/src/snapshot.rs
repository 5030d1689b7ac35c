//! Point-in-time view of everything the analyzer reasons about.

use std::collections::BTreeMap;

use hm_core::{CrashCount, DesiredAppState, InstanceHeartbeat, PendingStartMessage, PendingStopMessage};

/// Crash records are keyed by `(app key, instance index)`.
pub type CrashKey = (String, u32);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    /// Desired states by app key.
    pub desired: BTreeMap<String, DesiredAppState>,
    pub heartbeats: Vec<InstanceHeartbeat>,
    pub crash_counts: BTreeMap<CrashKey, CrashCount>,
    /// Pending starts by app key.
    pub pending_starts: BTreeMap<String, PendingStartMessage>,
    /// Pending stops by instance guid.
    pub pending_stops: BTreeMap<String, PendingStopMessage>,
}

impl StoreSnapshot {
    /// Every app key that is desired or has at least one heartbeat.
    pub fn app_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.desired.keys().cloned().collect();
        keys.extend(self.heartbeats.iter().map(|hb| hb.app_key()));
        keys.sort();
        keys.dedup();
        keys
    }

    /// Heartbeats grouped by app key.
    pub fn heartbeats_by_app(&self) -> BTreeMap<String, Vec<InstanceHeartbeat>> {
        let mut grouped: BTreeMap<String, Vec<InstanceHeartbeat>> = BTreeMap::new();
        for hb in &self.heartbeats {
            grouped.entry(hb.app_key()).or_default().push(hb.clone());
        }
        grouped
    }
}
