//! Health metrics computed on every analysis pass.
//!
//! Every value is `-1` when the store is not fresh enough to be trusted,
//! so a reader can tell "unknown" apart from "zero".

use crate::app::{App, IndexState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthMetrics {
    pub desired_apps: i64,
    pub desired_instances: i64,
    pub desired_apps_pending_staging: i64,
    pub running_instances: i64,
    pub apps_with_all_instances_reporting: i64,
    pub apps_with_missing_instances: i64,
    pub missing_indices: i64,
    pub undesired_running_apps: i64,
    pub crashed_instances: i64,
    pub crashed_indices: i64,
}

impl HealthMetrics {
    pub fn stale() -> Self {
        Self {
            desired_apps: -1,
            desired_instances: -1,
            desired_apps_pending_staging: -1,
            running_instances: -1,
            apps_with_all_instances_reporting: -1,
            apps_with_missing_instances: -1,
            missing_indices: -1,
            undesired_running_apps: -1,
            crashed_instances: -1,
            crashed_indices: -1,
        }
    }

    pub fn zero() -> Self {
        Self {
            desired_apps: 0,
            desired_instances: 0,
            desired_apps_pending_staging: 0,
            running_instances: 0,
            apps_with_all_instances_reporting: 0,
            apps_with_missing_instances: 0,
            missing_indices: 0,
            undesired_running_apps: 0,
            crashed_instances: 0,
            crashed_indices: 0,
        }
    }

    pub fn is_stale(&self) -> bool {
        *self == Self::stale()
    }

    /// Fold one app into the totals.
    pub fn record(&mut self, app: &App<'_>) {
        self.running_instances += app.running_instance_count() as i64;
        self.crashed_instances += app.crashed_instance_count() as i64;

        if !app.is_desired() {
            if app.has_running_instance() {
                self.undesired_running_apps += 1;
            }
            return;
        }

        let wanted = app.desired_instances();
        self.desired_apps += 1;
        self.desired_instances += i64::from(wanted);
        if app.is_pending_staging() {
            self.desired_apps_pending_staging += 1;
        }

        let (mut missing, mut crashed) = (0i64, 0i64);
        for index in 0..wanted {
            match app.index_state(index) {
                IndexState::Running => {}
                IndexState::Crashed => crashed += 1,
                IndexState::Missing | IndexState::Evacuating => missing += 1,
            }
        }
        self.missing_indices += missing;
        self.crashed_indices += crashed;
        if missing > 0 {
            self.apps_with_missing_instances += 1;
        }
        if missing == 0 && crashed == 0 {
            self.apps_with_all_instances_reporting += 1;
        }
    }

    /// `(name, value)` pairs in a stable order, for logging and export.
    pub fn pairs(&self) -> [(&'static str, i64); 10] {
        [
            ("desired_apps", self.desired_apps),
            ("desired_instances", self.desired_instances),
            ("desired_apps_pending_staging", self.desired_apps_pending_staging),
            ("running_instances", self.running_instances),
            (
                "apps_with_all_instances_reporting",
                self.apps_with_all_instances_reporting,
            ),
            ("apps_with_missing_instances", self.apps_with_missing_instances),
            ("missing_indices", self.missing_indices),
            ("undesired_running_apps", self.undesired_running_apps),
            ("crashed_instances", self.crashed_instances),
            ("crashed_indices", self.crashed_indices),
        ]
    }
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self::stale()
    }
}
