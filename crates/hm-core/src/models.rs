//! Domain types for the health manager.
//!
//! These types represent desired app state, instance heartbeats, crash
//! history, and the pending-message queue. All types are serializable
//! to/from JSON for storage and for the message bus.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Unique identifier for an application.
pub type AppId = String;

/// Unique identifier for a running instance.
pub type InstanceGuid = String;

/// Composite key for an app at a specific version: `{app_id}-{app_version}`.
pub fn app_key(app_id: &str, app_version: &str) -> String {
    format!("{app_id}-{app_version}")
}

// ── Desired state ─────────────────────────────────────────────────

/// The platform's record of how an app should be running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DesiredAppState {
    pub app_id: AppId,
    pub app_version: String,
    pub number_of_instances: u32,
    /// Memory per instance in megabytes.
    pub memory: u64,
    pub state: AppState,
    pub package_state: PackageState,
    /// Unix timestamp (seconds) of the last upstream update.
    pub updated_at: u64,
}

impl DesiredAppState {
    pub fn store_key(&self) -> String {
        app_key(&self.app_id, &self.app_version)
    }

    /// Whether the upstream wants instances of this app running.
    pub fn is_started(&self) -> bool {
        self.state == AppState::Started
    }

    /// Whether instances of this app can be started right now.
    pub fn is_startable(&self) -> bool {
        self.is_started() && self.package_state == PackageState::Staged
    }
}

/// Lifecycle state requested for an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppState {
    Started,
    Stopped,
}

/// Staging state of an app's package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageState {
    Staged,
    Pending,
    Failed,
    #[serde(other)]
    Invalid,
}

// ── Actual state ──────────────────────────────────────────────────

/// One instance as reported by its host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceHeartbeat {
    pub instance_guid: InstanceGuid,
    pub app_id: AppId,
    pub app_version: String,
    pub instance_index: u32,
    pub state: InstanceState,
    /// Unix timestamp of the last state transition on the host.
    pub state_timestamp: u64,
    pub host_id: String,
}

impl InstanceHeartbeat {
    pub fn app_key(&self) -> String {
        app_key(&self.app_id, &self.app_version)
    }

    /// Starting or running, and not on its way out.
    pub fn is_starting_or_running(&self) -> bool {
        matches!(self.state, InstanceState::Starting | InstanceState::Running)
    }

    pub fn is_crashed(&self) -> bool {
        self.state == InstanceState::Crashed
    }

    pub fn is_evacuating(&self) -> bool {
        self.state == InstanceState::Evacuating
    }
}

/// Instance lifecycle state reported in a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Starting,
    Running,
    Crashed,
    Evacuating,
}

/// A host's periodic report of every instance it runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatSnapshot {
    pub host_id: String,
    pub instance_heartbeats: Vec<InstanceHeartbeat>,
}

// ── Freshness ─────────────────────────────────────────────────────

/// Tombstone value for a tracked data source.
///
/// `timestamp` is written when the tombstone is created and carried over
/// unchanged on every renewal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FreshnessTimestamp {
    pub timestamp: u64,
}

// ── Crash history ─────────────────────────────────────────────────

/// Crash history for one index of one app version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrashCount {
    pub app_id: AppId,
    pub app_version: String,
    pub instance_index: u32,
    pub crash_count: u32,
    /// State timestamp of the most recent crash already counted.
    pub last_crash_at: u64,
    /// No restart is scheduled for this index before this time.
    pub restart_after: u64,
}

impl CrashCount {
    pub fn new(app_id: &str, app_version: &str, instance_index: u32) -> Self {
        Self {
            app_id: app_id.to_string(),
            app_version: app_version.to_string(),
            instance_index,
            crash_count: 0,
            last_crash_at: 0,
            restart_after: 0,
        }
    }

    pub fn app_key(&self) -> String {
        app_key(&self.app_id, &self.app_version)
    }
}

// ── Pending messages ──────────────────────────────────────────────

/// Why a start was queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartReason {
    Missing,
    Crashed,
    Evacuating,
}

/// Why a stop was queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The app is no longer desired, or is desired stopped.
    Undesired,
    /// The instance index is beyond the desired instance count.
    Extra,
    /// Another instance already occupies the same index.
    Duplicate,
    /// A replacement for an evacuating instance is running.
    Evacuated,
}

/// Queued start intent for one app version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingStartMessage {
    pub app_id: AppId,
    pub app_version: String,
    pub indices_to_start: BTreeSet<u32>,
    /// Desired instance count at queue time; the sender's priority key.
    pub desired_instances: u32,
    pub send_on: u64,
    pub sent_on: u64,
    pub keep_alive: u64,
    pub reason: StartReason,
}

impl PendingStartMessage {
    pub fn store_key(&self) -> String {
        app_key(&self.app_id, &self.app_version)
    }

    pub fn is_ready(&self, now: u64) -> bool {
        self.send_on <= now
    }

    pub fn has_been_sent(&self) -> bool {
        self.sent_on != 0
    }
}

/// Queued stop intent for one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingStopMessage {
    pub instance_guid: InstanceGuid,
    pub app_id: AppId,
    pub app_version: String,
    pub instance_index: u32,
    pub is_duplicate: bool,
    pub send_on: u64,
    pub sent_on: u64,
    pub keep_alive: u64,
    pub reason: StopReason,
}

impl PendingStopMessage {
    pub fn store_key(&self) -> String {
        self.instance_guid.clone()
    }

    pub fn is_ready(&self, now: u64) -> bool {
        self.send_on <= now
    }
}

// ── Wire messages ─────────────────────────────────────────────────

/// Outbound request to start instances of an app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartMessage {
    pub message_id: String,
    pub app_id: AppId,
    pub app_version: String,
    pub instance_indices: Vec<u32>,
}

impl StartMessage {
    pub fn from_pending(pending: &PendingStartMessage, now: u64) -> Self {
        Self {
            message_id: format!("start-{}-{now}", pending.store_key()),
            app_id: pending.app_id.clone(),
            app_version: pending.app_version.clone(),
            instance_indices: pending.indices_to_start.iter().copied().collect(),
        }
    }
}

/// Outbound request to stop one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopMessage {
    pub message_id: String,
    pub app_id: AppId,
    pub app_version: String,
    pub instance_index: u32,
    pub instance_guid: InstanceGuid,
    pub is_duplicate: bool,
}

impl StopMessage {
    pub fn from_pending(pending: &PendingStopMessage, now: u64) -> Self {
        Self {
            message_id: format!("stop-{}-{now}", pending.instance_guid),
            app_id: pending.app_id.clone(),
            app_version: pending.app_version.clone(),
            instance_index: pending.instance_index,
            instance_guid: pending.instance_guid.clone(),
            is_duplicate: pending.is_duplicate,
        }
    }
}

/// Inbound notification that an instance exited on its host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DropletExited {
    pub app_id: AppId,
    pub app_version: String,
    pub instance_guid: InstanceGuid,
    pub instance_index: u32,
    pub reason: ExitReason,
}

/// Why an instance exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    Stopped,
    Crashed,
    DeaShutdown,
    DeaEvacuation,
}

impl ExitReason {
    /// The host is going away and the instance needs to run elsewhere.
    pub fn is_evacuation(self) -> bool {
        matches!(self, ExitReason::DeaShutdown | ExitReason::DeaEvacuation)
    }
}

/// Basic-auth credentials for the bulk desired-state API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkCredentials {
    pub user: String,
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired() -> DesiredAppState {
        DesiredAppState {
            app_id: "app-1".to_string(),
            app_version: "v1".to_string(),
            number_of_instances: 3,
            memory: 256,
            state: AppState::Started,
            package_state: PackageState::Staged,
            updated_at: 1000,
        }
    }

    fn heartbeat() -> InstanceHeartbeat {
        InstanceHeartbeat {
            instance_guid: "guid-0".to_string(),
            app_id: "app-1".to_string(),
            app_version: "v1".to_string(),
            instance_index: 0,
            state: InstanceState::Evacuating,
            state_timestamp: 1234,
            host_id: "host-a".to_string(),
        }
    }

    fn pending_start() -> PendingStartMessage {
        PendingStartMessage {
            app_id: "app-1".to_string(),
            app_version: "v1".to_string(),
            indices_to_start: BTreeSet::from([1, 2]),
            desired_instances: 3,
            send_on: 1030,
            sent_on: 0,
            keep_alive: 30,
            reason: StartReason::Missing,
        }
    }

    fn pending_stop() -> PendingStopMessage {
        PendingStopMessage {
            instance_guid: "guid-9".to_string(),
            app_id: "app-1".to_string(),
            app_version: "v1".to_string(),
            instance_index: 1,
            is_duplicate: true,
            send_on: 1030,
            sent_on: 1040,
            keep_alive: 0,
            reason: StopReason::Duplicate,
        }
    }

    #[test]
    fn desired_state_serializes_with_platform_enum_names() {
        let json = serde_json::to_value(desired()).unwrap();
        assert_eq!(json["state"], "STARTED");
        assert_eq!(json["package_state"], "STAGED");

        let back: DesiredAppState = serde_json::from_value(json).unwrap();
        assert_eq!(back, desired());
    }

    #[test]
    fn unknown_package_state_decodes_as_invalid() {
        let mut json = serde_json::to_value(desired()).unwrap();
        json["package_state"] = serde_json::Value::from("EXPLODED");
        let back: DesiredAppState = serde_json::from_value(json).unwrap();
        assert_eq!(back.package_state, PackageState::Invalid);
        assert!(!back.is_startable());
    }

    #[test]
    fn heartbeat_round_trips() {
        let bytes = serde_json::to_vec(&heartbeat()).unwrap();
        let back: InstanceHeartbeat = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, heartbeat());
        assert!(back.is_evacuating());
        assert!(!back.is_starting_or_running());
    }

    #[test]
    fn pending_messages_round_trip() {
        let start = pending_start();
        let bytes = serde_json::to_vec(&start).unwrap();
        assert_eq!(serde_json::from_slice::<PendingStartMessage>(&bytes).unwrap(), start);

        let stop = pending_stop();
        let bytes = serde_json::to_vec(&stop).unwrap();
        assert_eq!(serde_json::from_slice::<PendingStopMessage>(&bytes).unwrap(), stop);
    }

    #[test]
    fn keys_use_app_id_and_version() {
        assert_eq!(desired().store_key(), "app-1-v1");
        assert_eq!(heartbeat().app_key(), "app-1-v1");
        assert_eq!(pending_start().store_key(), "app-1-v1");
        assert_eq!(pending_stop().store_key(), "guid-9");
    }

    #[test]
    fn wire_messages_carry_pending_payload() {
        let start = StartMessage::from_pending(&pending_start(), 2000);
        assert_eq!(start.instance_indices, vec![1, 2]);
        assert_eq!(start.message_id, "start-app-1-v1-2000");

        let stop = StopMessage::from_pending(&pending_stop(), 2000);
        assert!(stop.is_duplicate);
        assert_eq!(stop.instance_guid, "guid-9");
    }

    #[test]
    fn exit_reasons() {
        assert!(ExitReason::DeaEvacuation.is_evacuation());
        assert!(ExitReason::DeaShutdown.is_evacuation());
        assert!(!ExitReason::Crashed.is_evacuation());
        let json = serde_json::to_string(&ExitReason::DeaShutdown).unwrap();
        assert_eq!(json, "\"DEA_SHUTDOWN\"");
    }
}
