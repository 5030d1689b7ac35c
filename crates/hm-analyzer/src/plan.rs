//! Reconciliation: turn a store snapshot into pending-message and crash
//! record changes.
//!
//! ```text
//!  StoreSnapshot ──► App (per app key) ──► per-index decision
//!                                            │
//!        ┌───────────────┬──────────────────┼──────────────────┐
//!        ▼               ▼                  ▼                  ▼
//!     Running        Evacuating          Crashed            Missing
//!   stop dupes &    start now         count crash,        start after
//!   evacuees                          start if allowed    grace period
//!                                            │
//!            index ≥ desired count ──► stop (extra / undesired)
//! ```
//!
//! Planning is pure: it reads a snapshot and the current time and says
//! what to write. [`crate::Analyzer`] applies the result.

use std::collections::{BTreeMap, BTreeSet};

use hm_core::{
    CrashCount, HmConfig, InstanceHeartbeat, PendingStartMessage, PendingStopMessage, StartReason,
    StopReason,
};
use hm_state::StoreSnapshot;

use crate::app::{App, IndexState};
use crate::backoff::BackoffPolicy;
use crate::metrics::HealthMetrics;

/// Timing knobs the planner needs, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanPolicy {
    pub grace_period: u64,
    pub start_keep_alive: u64,
    pub backoff: BackoffPolicy,
}

impl PlanPolicy {
    pub fn from_config(config: &HmConfig) -> Self {
        Self {
            grace_period: config.grace_period(),
            start_keep_alive: config.start_keep_alive(),
            backoff: BackoffPolicy::from_config(config),
        }
    }
}

/// Store changes decided by one analysis pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub starts_to_save: Vec<PendingStartMessage>,
    /// App keys of pending starts that are no longer needed.
    pub starts_to_delete: Vec<String>,
    pub stops_to_save: Vec<PendingStopMessage>,
    /// Instance guids of pending stops that are no longer needed.
    pub stops_to_delete: Vec<String>,
    pub crashes_to_save: Vec<CrashCount>,
    pub metrics: HealthMetrics,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.starts_to_save.is_empty()
            && self.starts_to_delete.is_empty()
            && self.stops_to_save.is_empty()
            && self.stops_to_delete.is_empty()
            && self.crashes_to_save.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct StartNeed {
    reason: StartReason,
    delay: u64,
}

/// Compute the plan for `snapshot` at time `now`.
pub fn plan(snapshot: &StoreSnapshot, now: u64, policy: &PlanPolicy) -> Plan {
    let mut plan = Plan {
        starts_to_save: Vec::new(),
        starts_to_delete: Vec::new(),
        stops_to_save: Vec::new(),
        stops_to_delete: Vec::new(),
        crashes_to_save: Vec::new(),
        metrics: HealthMetrics::zero(),
    };
    let heartbeats = snapshot.heartbeats_by_app();
    let mut wanted_stops: BTreeMap<String, PendingStopMessage> = BTreeMap::new();

    for key in snapshot.app_keys() {
        let beats: Vec<&InstanceHeartbeat> = heartbeats
            .get(&key)
            .map(|hbs| hbs.iter().collect())
            .unwrap_or_default();
        let Some(app) = App::new(key.clone(), snapshot.desired.get(&key), beats) else {
            continue;
        };

        plan.metrics.record(&app);

        let needs = plan_app(&app, snapshot, now, policy, &mut plan, &mut wanted_stops);
        reconcile_start(&app, needs, snapshot, now, policy, &mut plan);
    }

    // Stops that were not asked for again this pass are resolved. A stop
    // already pending keeps its original schedule.
    plan.stops_to_delete = snapshot
        .pending_stops
        .keys()
        .filter(|guid| !wanted_stops.contains_key(*guid))
        .cloned()
        .collect();
    plan.stops_to_save = wanted_stops
        .into_iter()
        .filter(|(guid, _)| !snapshot.pending_stops.contains_key(guid))
        .map(|(_, stop)| stop)
        .collect();
    plan
}

/// Walk one app's indices: queue stops directly, return the starts it needs.
fn plan_app(
    app: &App<'_>,
    snapshot: &StoreSnapshot,
    now: u64,
    policy: &PlanPolicy,
    plan: &mut Plan,
    stops: &mut BTreeMap<String, PendingStopMessage>,
) -> BTreeMap<u32, StartNeed> {
    let wanted = app.desired_instances();
    let mut needs = BTreeMap::new();

    for index in 0..wanted {
        match app.index_state(index) {
            IndexState::Running => {
                let running = app.running_at(index);
                for duplicate in running.iter().skip(1) {
                    let stop = stop_for(duplicate, StopReason::Duplicate, now + policy.grace_period);
                    stops.insert(stop.instance_guid.clone(), stop);
                }
                for evacuee in app.evacuating_at(index) {
                    let stop = stop_for(evacuee, StopReason::Evacuated, now);
                    stops.insert(stop.instance_guid.clone(), stop);
                }
            }
            IndexState::Evacuating => {
                needs.insert(
                    index,
                    StartNeed {
                        reason: StartReason::Evacuating,
                        delay: 0,
                    },
                );
            }
            IndexState::Crashed => {
                if crash_restart_allowed(app, index, snapshot, now, policy, plan) {
                    needs.insert(
                        index,
                        StartNeed {
                            reason: StartReason::Crashed,
                            delay: 0,
                        },
                    );
                }
            }
            IndexState::Missing => {
                needs.insert(
                    index,
                    StartNeed {
                        reason: StartReason::Missing,
                        delay: policy.grace_period,
                    },
                );
            }
        }
    }

    let reason = if app.is_desired() {
        StopReason::Extra
    } else {
        StopReason::Undesired
    };
    for hb in &app.heartbeats {
        if hb.instance_index >= wanted && hb.is_starting_or_running() {
            let stop = stop_for(hb, reason, now);
            stops.insert(stop.instance_guid.clone(), stop);
        }
    }

    if !app.is_startable() {
        needs.clear();
    }
    needs
}

/// Count any new crash at `index` and decide whether it may restart now.
fn crash_restart_allowed(
    app: &App<'_>,
    index: u32,
    snapshot: &StoreSnapshot,
    now: u64,
    policy: &PlanPolicy,
    plan: &mut Plan,
) -> bool {
    let mut record = snapshot
        .crash_counts
        .get(&(app.key.clone(), index))
        .cloned()
        .unwrap_or_else(|| CrashCount::new(&app.app_id, &app.app_version, index));

    let latest = app
        .crashed_at(index)
        .iter()
        .map(|hb| hb.state_timestamp)
        .max()
        .unwrap_or_default();
    if policy.backoff.record_crash(&mut record, latest, now) {
        plan.crashes_to_save.push(record.clone());
    }

    // With nothing running, only index 0 comes back first.
    let staged = index == 0 || app.has_running_instance();
    staged && now >= record.restart_after
}

fn stop_for(hb: &InstanceHeartbeat, reason: StopReason, send_on: u64) -> PendingStopMessage {
    PendingStopMessage {
        instance_guid: hb.instance_guid.clone(),
        app_id: hb.app_id.clone(),
        app_version: hb.app_version.clone(),
        instance_index: hb.instance_index,
        is_duplicate: reason == StopReason::Duplicate,
        send_on,
        sent_on: 0,
        keep_alive: 0,
        reason,
    }
}

/// The most urgent reason wins the message label.
fn dominant_reason<'a>(needs: impl Iterator<Item = &'a StartNeed>) -> StartReason {
    let mut reason = StartReason::Missing;
    for need in needs {
        match (need.reason, reason) {
            (StartReason::Evacuating, _) => return StartReason::Evacuating,
            (StartReason::Crashed, StartReason::Missing) => reason = StartReason::Crashed,
            _ => {}
        }
    }
    reason
}

/// Merge this pass's start needs with any start already pending for the app.
fn reconcile_start(
    app: &App<'_>,
    mut needs: BTreeMap<u32, StartNeed>,
    snapshot: &StoreSnapshot,
    now: u64,
    policy: &PlanPolicy,
    plan: &mut Plan,
) {
    let existing = snapshot.pending_starts.get(&app.key);

    // An evacuation start is kept whole until it has gone out once; the
    // evacuee's last heartbeat can still read as running.
    if let Some(pending) = existing
        && pending.reason == StartReason::Evacuating
        && !pending.has_been_sent()
        && app.is_startable()
    {
        for index in &pending.indices_to_start {
            needs.entry(*index).or_insert(StartNeed {
                reason: StartReason::Evacuating,
                delay: 0,
            });
        }
    }

    if needs.is_empty() {
        if existing.is_some() {
            plan.starts_to_delete.push(app.key.clone());
        }
        return;
    }

    let Some(pending) = existing else {
        plan.starts_to_save.push(new_start(app, &needs, now, policy));
        return;
    };

    let (carried, mut joining): (BTreeMap<u32, StartNeed>, BTreeMap<u32, StartNeed>) = needs
        .into_iter()
        .partition(|(index, _)| pending.indices_to_start.contains(index));

    if carried.is_empty() {
        // Nothing the pending start covered is still needed.
        plan.starts_to_save.push(new_start(app, &joining, now, policy));
        return;
    }

    // An unsent start keeps its timer. Indices that would not be due by
    // then wait until it has gone out.
    if !pending.has_been_sent() {
        joining.retain(|_, need| now + need.delay <= pending.send_on);
    }

    let added_delay = joining.values().map(|need| need.delay).max();
    let merged: BTreeMap<u32, StartNeed> = carried.into_iter().chain(joining).collect();
    let indices: BTreeSet<u32> = merged.keys().copied().collect();
    if pending.indices_to_start == indices {
        return;
    }

    let mut updated = pending.clone();
    if let Some(delay) = added_delay
        && pending.has_been_sent()
    {
        updated.send_on = pending.send_on.max(now + delay);
    }
    updated.indices_to_start = indices;
    updated.desired_instances = app.desired_instances();
    updated.reason = dominant_reason(merged.values());
    plan.starts_to_save.push(updated);
}

fn new_start(
    app: &App<'_>,
    needs: &BTreeMap<u32, StartNeed>,
    now: u64,
    policy: &PlanPolicy,
) -> PendingStartMessage {
    let delay = needs.values().map(|need| need.delay).max().unwrap_or_default();
    PendingStartMessage {
        app_id: app.app_id.clone(),
        app_version: app.app_version.clone(),
        indices_to_start: needs.keys().copied().collect(),
        desired_instances: app.desired_instances(),
        send_on: now + delay,
        sent_on: 0,
        keep_alive: policy.start_keep_alive,
        reason: dominant_reason(needs.values()),
    }
}
