//! Per-app view of a store snapshot.
//!
//! An [`App`] joins one app version's desired state (if any) with every
//! heartbeat reported for it, and answers the per-index questions the
//! analyzer asks.

use std::collections::BTreeSet;

use hm_core::{AppState, DesiredAppState, InstanceHeartbeat, PackageState};

/// What is happening at one instance index, strongest signal first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// At least one instance is starting or running.
    Running,
    /// The only live instance is being evacuated off its host.
    Evacuating,
    /// Every reported instance has crashed.
    Crashed,
    /// Nothing is reported.
    Missing,
}

#[derive(Debug, Clone)]
pub struct App<'a> {
    pub key: String,
    pub app_id: String,
    pub app_version: String,
    pub desired: Option<&'a DesiredAppState>,
    pub heartbeats: Vec<&'a InstanceHeartbeat>,
}

impl<'a> App<'a> {
    /// `None` if neither a desired state nor a heartbeat is given.
    pub fn new(
        key: String,
        desired: Option<&'a DesiredAppState>,
        heartbeats: Vec<&'a InstanceHeartbeat>,
    ) -> Option<Self> {
        let (app_id, app_version) = match (desired, heartbeats.first()) {
            (Some(d), _) => (d.app_id.clone(), d.app_version.clone()),
            (None, Some(hb)) => (hb.app_id.clone(), hb.app_version.clone()),
            (None, None) => return None,
        };
        Some(Self {
            key,
            app_id,
            app_version,
            desired,
            heartbeats,
        })
    }

    /// Desired and started.
    pub fn is_desired(&self) -> bool {
        self.desired.is_some_and(|d| d.state == AppState::Started)
    }

    pub fn is_startable(&self) -> bool {
        self.desired.is_some_and(|d| d.is_startable())
    }

    pub fn is_pending_staging(&self) -> bool {
        self.is_desired() && self.desired.is_some_and(|d| d.package_state == PackageState::Pending)
    }

    /// Instance count the app should have; 0 unless desired and started.
    pub fn desired_instances(&self) -> u32 {
        match self.desired {
            Some(d) if d.state == AppState::Started => d.number_of_instances,
            _ => 0,
        }
    }

    pub fn heartbeats_at(&self, index: u32) -> impl Iterator<Item = &'a InstanceHeartbeat> + '_ {
        self.heartbeats
            .iter()
            .copied()
            .filter(move |hb| hb.instance_index == index)
    }

    /// Starting or running instances at `index`, oldest first by
    /// `(state_timestamp, instance_guid)`.
    pub fn running_at(&self, index: u32) -> Vec<&'a InstanceHeartbeat> {
        let mut running: Vec<_> = self
            .heartbeats_at(index)
            .filter(|hb| hb.is_starting_or_running())
            .collect();
        running.sort_by(|a, b| {
            (a.state_timestamp, &a.instance_guid).cmp(&(b.state_timestamp, &b.instance_guid))
        });
        running
    }

    pub fn evacuating_at(&self, index: u32) -> Vec<&'a InstanceHeartbeat> {
        self.heartbeats_at(index).filter(|hb| hb.is_evacuating()).collect()
    }

    pub fn crashed_at(&self, index: u32) -> Vec<&'a InstanceHeartbeat> {
        self.heartbeats_at(index).filter(|hb| hb.is_crashed()).collect()
    }

    pub fn index_state(&self, index: u32) -> IndexState {
        let mut state = IndexState::Missing;
        for hb in self.heartbeats_at(index) {
            if hb.is_starting_or_running() {
                return IndexState::Running;
            }
            if hb.is_evacuating() {
                state = IndexState::Evacuating;
            } else if hb.is_crashed() && state == IndexState::Missing {
                state = IndexState::Crashed;
            }
        }
        state
    }

    pub fn has_running_instance(&self) -> bool {
        self.heartbeats.iter().any(|hb| hb.is_starting_or_running())
    }

    pub fn running_instance_count(&self) -> usize {
        self.heartbeats
            .iter()
            .filter(|hb| hb.is_starting_or_running())
            .count()
    }

    pub fn crashed_instance_count(&self) -> usize {
        self.heartbeats.iter().filter(|hb| hb.is_crashed()).count()
    }

    /// Every index with at least one heartbeat.
    pub fn reported_indices(&self) -> BTreeSet<u32> {
        self.heartbeats.iter().map(|hb| hb.instance_index).collect()
    }
}
