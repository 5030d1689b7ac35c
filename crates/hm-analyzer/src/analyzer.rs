//! Analyzer: the periodic reconciliation pass.
//!
//! Each tick checks that both freshness tombstones exist and the actual
//! state has settled, reads a full snapshot, plans the delta and writes
//! it back. When the store is stale or unreadable nothing is written and
//! every metric reads `-1`.

use std::sync::Arc;
use std::time::Duration;

use hm_core::{Clock, HmConfig};
use hm_state::Store;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::AnalyzerResult;
use crate::metrics::HealthMetrics;
use crate::plan::{Plan, PlanPolicy, plan};

/// Result of one analysis pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Analysis {
    /// The store could not be trusted; nothing was written.
    Stale,
    /// The plan was computed and applied.
    Applied(Plan),
}

impl Analysis {
    pub fn metrics(&self) -> HealthMetrics {
        match self {
            Analysis::Stale => HealthMetrics::stale(),
            Analysis::Applied(plan) => plan.metrics,
        }
    }
}

pub struct Analyzer {
    store: Store,
    clock: Arc<dyn Clock>,
    policy: PlanPolicy,
    metrics: watch::Sender<HealthMetrics>,
}

impl Analyzer {
    pub fn new(store: Store, config: Arc<HmConfig>, clock: Arc<dyn Clock>) -> Self {
        let (metrics, _) = watch::channel(HealthMetrics::stale());
        Self {
            store,
            clock,
            policy: PlanPolicy::from_config(&config),
            metrics,
        }
    }

    /// Latest metrics, updated after every pass.
    pub fn subscribe_metrics(&self) -> watch::Receiver<HealthMetrics> {
        self.metrics.subscribe()
    }

    /// Run one pass. Store errors before anything is written abort the
    /// pass; write errors are returned after the metrics are published.
    pub async fn analyze(&self) -> AnalyzerResult<Analysis> {
        let now = self.clock.now();

        let settled = match self.store.is_settled(now).await {
            Ok(settled) => settled,
            Err(e) => {
                self.metrics.send_replace(HealthMetrics::stale());
                return Err(e.into());
            }
        };
        if !settled {
            info!("store is not fresh, skipping analysis");
            self.metrics.send_replace(HealthMetrics::stale());
            return Ok(Analysis::Stale);
        }

        let snapshot = match self.store.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.metrics.send_replace(HealthMetrics::stale());
                return Err(e.into());
            }
        };

        let plan = plan(&snapshot, now, &self.policy);
        self.metrics.send_replace(plan.metrics);
        self.apply(&plan).await?;

        debug!(
            starts = plan.starts_to_save.len(),
            starts_deleted = plan.starts_to_delete.len(),
            stops = plan.stops_to_save.len(),
            stops_deleted = plan.stops_to_delete.len(),
            crashes = plan.crashes_to_save.len(),
            "analysis applied"
        );
        Ok(Analysis::Applied(plan))
    }

    async fn apply(&self, plan: &Plan) -> AnalyzerResult<()> {
        for crash in &plan.crashes_to_save {
            info!(
                app = %crash.app_key(),
                index = crash.instance_index,
                count = crash.crash_count,
                restart_after = crash.restart_after,
                "recorded crash"
            );
        }
        for start in &plan.starts_to_save {
            info!(
                app = %start.store_key(),
                indices = ?start.indices_to_start,
                send_on = start.send_on,
                reason = ?start.reason,
                "queued start"
            );
        }
        for stop in &plan.stops_to_save {
            info!(
                app = %hm_core::app_key(&stop.app_id, &stop.app_version),
                guid = %stop.instance_guid,
                index = stop.instance_index,
                send_on = stop.send_on,
                reason = ?stop.reason,
                "queued stop"
            );
        }

        self.store.save_crash_counts(&plan.crashes_to_save).await?;
        self.store.save_pending_starts(&plan.starts_to_save).await?;
        self.store.delete_pending_starts(&plan.starts_to_delete).await?;
        self.store.save_pending_stops(&plan.stops_to_save).await?;
        self.store.delete_pending_stops(&plan.stops_to_delete).await?;
        Ok(())
    }

    /// Run the analyzer loop.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "analyzer started");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.analyze().await {
                        Ok(Analysis::Applied(plan)) => {
                            for (name, value) in plan.metrics.pairs() {
                                debug!(metric = name, value, "health metric");
                            }
                        }
                        Ok(Analysis::Stale) => {}
                        Err(e) => error!(error = %e, "analysis failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("analyzer shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_core::{
        AppState, DesiredAppState, InstanceHeartbeat, InstanceState, ManualClock, PackageState,
    };
    use hm_kv::{MemoryAdapter, StoreClient};

    struct Fixture {
        store: Store,
        clock: Arc<ManualClock>,
        analyzer: Analyzer,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(10_000));
        let config = Arc::new(HmConfig::default());
        let adapter = Arc::new(MemoryAdapter::with_clock(clock.clone()));
        let client = StoreClient::new(adapter, 8, Duration::from_secs(1));
        let store = Store::new(client, config.clone());
        let analyzer = Analyzer::new(store.clone(), config, clock.clone());
        Fixture {
            store,
            clock,
            analyzer,
        }
    }

    fn desired(n: u32) -> DesiredAppState {
        DesiredAppState {
            app_id: "app".into(),
            app_version: "v1".into(),
            number_of_instances: n,
            memory: 128,
            state: AppState::Started,
            package_state: PackageState::Staged,
            updated_at: 0,
        }
    }

    fn running(index: u32) -> InstanceHeartbeat {
        InstanceHeartbeat {
            instance_guid: format!("g{index}"),
            app_id: "app".into(),
            app_version: "v1".into(),
            instance_index: index,
            state: InstanceState::Running,
            state_timestamp: 1,
            host_id: "host".into(),
        }
    }

    /// Bump both tombstones and let the actual window elapse.
    async fn settle(f: &Fixture) {
        let now = f.clock.now();
        f.store.bump_desired_freshness(now).await.unwrap();
        f.store.bump_actual_freshness(now).await.unwrap();
        f.clock.advance(f.store.config().actual_freshness_ttl() - 1);
        f.store.bump_actual_freshness(f.clock.now()).await.unwrap();
        f.clock.advance(1);
    }

    #[tokio::test]
    async fn stale_store_writes_nothing() {
        let f = fixture();
        f.store.save_desired_states(&[desired(2)]).await.unwrap();

        let analysis = f.analyzer.analyze().await.unwrap();
        assert_eq!(analysis, Analysis::Stale);
        assert!(analysis.metrics().is_stale());
        assert!(f.analyzer.subscribe_metrics().borrow().is_stale());

        let snapshot = f.store.snapshot().await.unwrap();
        assert!(snapshot.pending_starts.is_empty());
        assert!(snapshot.crash_counts.is_empty());
    }

    #[tokio::test]
    async fn unsettled_actual_state_writes_nothing() {
        let f = fixture();
        let now = f.clock.now();
        f.store.save_desired_states(&[desired(2)]).await.unwrap();
        f.store.bump_desired_freshness(now).await.unwrap();
        f.store.bump_actual_freshness(now).await.unwrap();

        assert_eq!(f.analyzer.analyze().await.unwrap(), Analysis::Stale);
        assert!(f.store.get_pending_starts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fresh_store_queues_missing_start() {
        let f = fixture();
        f.store.save_desired_states(&[desired(2)]).await.unwrap();
        settle(&f).await;
        let outcomes = f.store.save_heartbeats(&[running(0)]).await;
        assert!(outcomes.iter().all(|(_, r)| r.is_ok()));

        let analysis = f.analyzer.analyze().await.unwrap();
        assert_eq!(analysis.metrics().missing_indices, 1);
        assert_eq!(f.analyzer.subscribe_metrics().borrow().desired_instances, 2);

        let starts = f.store.get_pending_starts().await.unwrap();
        let start = &starts["app-v1"];
        assert_eq!(start.indices_to_start.iter().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(start.send_on, f.clock.now() + 30);
    }

    #[tokio::test]
    async fn second_pass_leaves_pending_start_alone() {
        let f = fixture();
        f.store.save_desired_states(&[desired(2)]).await.unwrap();
        settle(&f).await;
        f.store.save_heartbeats(&[running(0)]).await;

        f.analyzer.analyze().await.unwrap();
        let before = f.store.get_pending_starts().await.unwrap();

        f.clock.advance(5);
        f.store.bump_actual_freshness(f.clock.now()).await.unwrap();
        f.store.save_heartbeats(&[running(0)]).await;
        match f.analyzer.analyze().await.unwrap() {
            Analysis::Applied(plan) => assert!(plan.is_empty()),
            Analysis::Stale => panic!("store should be fresh"),
        }
        assert_eq!(f.store.get_pending_starts().await.unwrap(), before);
    }

    #[tokio::test]
    async fn resolved_start_is_removed_from_store() {
        let f = fixture();
        f.store.save_desired_states(&[desired(1)]).await.unwrap();
        settle(&f).await;

        f.analyzer.analyze().await.unwrap();
        assert_eq!(f.store.get_pending_starts().await.unwrap().len(), 1);

        f.store.save_heartbeats(&[running(0)]).await;
        f.analyzer.analyze().await.unwrap();
        assert!(f.store.get_pending_starts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn crash_backoff_resets_once_the_record_expires() {
        let f = fixture();
        let key = ("app-v1".to_string(), 0);
        let crash = |at: u64| InstanceHeartbeat {
            state: InstanceState::Crashed,
            state_timestamp: at,
            ..running(0)
        };

        // The fourth crash in a row is past the backoff threshold.
        f.store.save_desired_states(&[desired(1)]).await.unwrap();
        for _ in 0..4 {
            settle(&f).await;
            let now = f.clock.now();
            f.store.save_heartbeats(&[crash(now)]).await;
            f.analyzer.analyze().await.unwrap();
        }
        let record = f.store.snapshot().await.unwrap().crash_counts[&key].clone();
        assert_eq!(record.crash_count, 4);
        assert_eq!(record.restart_after - f.clock.now(), 30);

        f.clock.advance(f.store.config().crash_count_ttl());
        f.store.save_desired_states(&[desired(1)]).await.unwrap();
        settle(&f).await;
        let now = f.clock.now();
        f.store.save_heartbeats(&[crash(now)]).await;
        f.analyzer.analyze().await.unwrap();

        let record = f.store.snapshot().await.unwrap().crash_counts[&key].clone();
        assert_eq!(record.crash_count, 1);
        assert_eq!(record.restart_after - now, 0);
    }
}
