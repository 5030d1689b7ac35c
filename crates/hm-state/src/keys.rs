//! Store key layout.
//!
//! ```text
//! /actual/{app_id}-{app_version}/{index}/{guid}   instance heartbeat
//! /desired/{app_id}-{app_version}                 desired app state
//! /actual-fresh, /desired-fresh                   freshness tombstones
//! /crashes/{app_id}-{app_version}/{index}         crash history
//! /pending/start/{app_id}-{app_version}           queued start
//! /pending/stop/{instance_guid}                   queued stop
//! /hm/locks/{name}                                role locks (hm-kv)
//! ```

use hm_core::{CrashCount, DesiredAppState, InstanceHeartbeat, PendingStartMessage, PendingStopMessage};

pub const ACTUAL_DIR: &str = "/actual";
pub const DESIRED_DIR: &str = "/desired";
pub const CRASHES_DIR: &str = "/crashes";
pub const PENDING_START_DIR: &str = "/pending/start";
pub const PENDING_STOP_DIR: &str = "/pending/stop";

pub const ACTUAL_FRESHNESS: &str = "/actual-fresh";
pub const DESIRED_FRESHNESS: &str = "/desired-fresh";

pub fn heartbeat_key(heartbeat: &InstanceHeartbeat) -> String {
    format!(
        "{ACTUAL_DIR}/{}/{}/{}",
        heartbeat.app_key(),
        heartbeat.instance_index,
        heartbeat.instance_guid
    )
}

pub fn desired_key(desired: &DesiredAppState) -> String {
    format!("{DESIRED_DIR}/{}", desired.store_key())
}

pub fn crash_key(crash: &CrashCount) -> String {
    format!("{CRASHES_DIR}/{}/{}", crash.app_key(), crash.instance_index)
}

pub fn pending_start_key(key: &str) -> String {
    format!("{PENDING_START_DIR}/{key}")
}

pub fn pending_stop_key(instance_guid: &str) -> String {
    format!("{PENDING_STOP_DIR}/{instance_guid}")
}

pub fn start_key(start: &PendingStartMessage) -> String {
    pending_start_key(&start.store_key())
}

pub fn stop_key(stop: &PendingStopMessage) -> String {
    pending_stop_key(&stop.store_key())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_core::InstanceState;

    #[test]
    fn heartbeat_key_nests_by_app_and_index() {
        let hb = InstanceHeartbeat {
            instance_guid: "g1".into(),
            app_id: "app".into(),
            app_version: "v2".into(),
            instance_index: 3,
            state: InstanceState::Running,
            state_timestamp: 0,
            host_id: "h".into(),
        };
        assert_eq!(heartbeat_key(&hb), "/actual/app-v2/3/g1");
    }

    #[test]
    fn crash_and_pending_keys() {
        let crash = CrashCount::new("app", "v1", 0);
        assert_eq!(crash_key(&crash), "/crashes/app-v1/0");
        assert_eq!(pending_start_key("app-v1"), "/pending/start/app-v1");
        assert_eq!(pending_stop_key("g9"), "/pending/stop/g9");
    }
}
