//! End-to-end runs of the control loop: heartbeats in, analysis, and
//! start/stop messages out, all in one process on a manual clock.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use hm_analyzer::{Analysis, Analyzer};
use hm_bus::{LocalBus, Message, MessageBus, publish_json};
use hm_core::{
    AppState, Clock, DesiredAppState, DropletExited, ExitReason, HeartbeatSnapshot, HmConfig,
    InstanceHeartbeat, InstanceState, ManualClock, PackageState, StartMessage, StartReason,
    StopMessage,
};
use hm_listener::Ingestor;
use hm_sender::{SendOutcome, Sender};
use hm_state::Store;
use hmd::{Daemon, Exit, Role, open_store};
use tokio::sync::{mpsc, watch};

const T0: u64 = 100_000;

struct World {
    config: Arc<HmConfig>,
    clock: Arc<ManualClock>,
    store: Store,
    bus: Arc<LocalBus>,
    ingestor: Ingestor,
    analyzer: Analyzer,
    sender: Sender,
    starts: mpsc::Receiver<Message>,
    stops: mpsc::Receiver<Message>,
    /// Heartbeats every host reports on each tick.
    reporting: Vec<InstanceHeartbeat>,
}

impl World {
    async fn new(config: HmConfig) -> Self {
        let mut config = config;
        config.store.backend = "memory".into();
        let config = Arc::new(config);
        let clock = Arc::new(ManualClock::new(T0));
        let store = open_store(&config, clock.clone()).unwrap();
        let bus = Arc::new(LocalBus::new());
        let starts = bus.subscribe(&config.subjects.start).await.unwrap();
        let stops = bus.subscribe(&config.subjects.stop).await.unwrap();

        Self {
            ingestor: Ingestor::new(store.clone(), bus.clone(), clock.clone()),
            analyzer: Analyzer::new(store.clone(), config.clone(), clock.clone()),
            sender: Sender::new(store.clone(), bus.clone(), config.clone(), clock.clone()),
            config,
            clock,
            store,
            bus,
            starts,
            stops,
            reporting: Vec::new(),
        }
    }

    async fn desire(&self, states: &[DesiredAppState]) {
        self.store.save_desired_states(states).await.unwrap();
        self.store
            .bump_desired_freshness(self.clock.now())
            .await
            .unwrap();
    }

    /// Report the current heartbeats once per heartbeat period for `secs`
    /// seconds, ending on a report.
    async fn run_for(&self, secs: u64) {
        let period = self.config.heartbeat_period_secs;
        let mut elapsed = 0;
        loop {
            let snapshot = HeartbeatSnapshot {
                host_id: "dea-1".into(),
                instance_heartbeats: self.reporting.clone(),
            };
            self.ingestor.ingest(&snapshot).await;
            if elapsed >= secs {
                break;
            }
            self.clock.advance(period);
            elapsed += period;
        }
    }

    async fn analyze(&self) -> Analysis {
        self.analyzer.analyze().await.unwrap()
    }

    async fn send(&self) -> hm_sender::SendReport {
        match self.sender.send().await.unwrap() {
            SendOutcome::Sent(report) => report,
            SendOutcome::Stale => panic!("sender saw a stale store"),
        }
    }

    fn drain<T: serde::de::DeserializeOwned>(rx: &mut mpsc::Receiver<Message>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message.json().unwrap());
        }
        out
    }

    fn sent_starts(&mut self) -> Vec<StartMessage> {
        Self::drain(&mut self.starts)
    }

    fn sent_stops(&mut self) -> Vec<StopMessage> {
        Self::drain(&mut self.stops)
    }
}

fn desired(app_id: &str, instances: u32) -> DesiredAppState {
    DesiredAppState {
        app_id: app_id.into(),
        app_version: "v1".into(),
        number_of_instances: instances,
        memory: 256,
        state: AppState::Started,
        package_state: PackageState::Staged,
        updated_at: T0,
    }
}

fn instance(app_id: &str, index: u32, state: InstanceState) -> InstanceHeartbeat {
    InstanceHeartbeat {
        instance_guid: format!("{app_id}-{index}"),
        app_id: app_id.into(),
        app_version: "v1".into(),
        instance_index: index,
        state,
        state_timestamp: T0 - 100,
        host_id: "dea-1".into(),
    }
}

#[tokio::test]
async fn missing_instance_is_started_after_grace_and_kept_alive() {
    let mut world = World::new(HmConfig::default()).await;
    world.desire(&[desired("web", 2)]).await;
    world.reporting = vec![instance("web", 0, InstanceState::Running)];

    // Not settled before a full freshness window.
    world.run_for(20).await;
    assert_eq!(world.analyze().await, Analysis::Stale);

    world.run_for(10).await;
    let analysis = world.analyze().await;
    assert_eq!(analysis.metrics().missing_indices, 1);
    assert_eq!(world.send().await.starts_sent, 0);

    // The start goes out once the grace period has passed.
    world.run_for(30).await;
    world.analyze().await;
    let report = world.send().await;
    assert_eq!(report.starts_sent, 1);

    let now = world.clock.now();
    let starts = world.sent_starts();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].app_id, "web");
    assert_eq!(starts[0].instance_indices, vec![1]);

    let pending = world.store.get_pending_start("web-v1").await.unwrap().unwrap();
    assert_eq!(pending.sent_on, now);
    assert_eq!(pending.send_on, now + world.config.start_keep_alive());

    // Once the instance reports, the pending start is cleared.
    world.reporting.push(instance("web", 1, InstanceState::Running));
    world.run_for(10).await;
    world.analyze().await;
    assert!(world.store.get_pending_starts().await.unwrap().is_empty());
}

#[tokio::test]
async fn undesired_stops_are_uncapped_and_starts_prefer_small_apps() {
    let config = HmConfig {
        sender_message_limit: 8,
        ..HmConfig::default()
    };
    let mut world = World::new(config).await;

    let missing: Vec<_> = (1..=9u32).map(|n| desired(&format!("missing-{n}"), n)).collect();
    world.desire(&missing).await;
    world.reporting = (0..40)
        .map(|i| instance(&format!("undesired-{i:02}"), 0, InstanceState::Running))
        .collect();

    world.run_for(30).await;
    let analysis = world.analyze().await;
    assert_eq!(analysis.metrics().undesired_running_apps, 40);
    world.run_for(30).await;

    let report = world.send().await;
    assert_eq!(report.stops_sent, 40);
    assert_eq!(report.starts_sent, 8);
    assert_eq!(report.starts_deferred, 1);

    let stops = world.sent_stops();
    assert_eq!(stops.len(), 40);
    assert!(stops.iter().all(|s| !s.is_duplicate));

    let sizes: Vec<usize> = world
        .sent_starts()
        .iter()
        .map(|s| s.instance_indices.len())
        .collect();
    assert_eq!(sizes, vec![1, 2, 3, 4, 5, 6, 7, 8]);

    // The largest app goes out on the next cycle.
    let report = world.send().await;
    assert_eq!(report.starts_sent, 1);
    assert_eq!(world.sent_starts()[0].app_id, "missing-9");
}

#[tokio::test]
async fn fully_crashed_app_restarts_index_zero_first() {
    let mut world = World::new(HmConfig::default()).await;
    world.desire(&[desired("worker", 3)]).await;
    world.reporting = (0..3)
        .map(|i| instance("worker", i, InstanceState::Crashed))
        .collect();

    world.run_for(30).await;
    let analysis = world.analyze().await;
    assert_eq!(analysis.metrics().crashed_instances, 3);

    world.send().await;
    let starts = world.sent_starts();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].instance_indices, vec![0]);

    let pending = world.store.get_pending_start("worker-v1").await.unwrap().unwrap();
    assert_eq!(pending.reason, StartReason::Crashed);
    assert_eq!(pending.indices_to_start, BTreeSet::from([0]));
}

#[tokio::test]
async fn stale_store_is_left_alone() {
    let mut world = World::new(HmConfig::default()).await;
    world.store.save_desired_states(&[desired("web", 2)]).await.unwrap();
    world.run_for(30).await;

    // Heartbeats are fresh but desired state never was.
    let analysis = world.analyze().await;
    assert_eq!(analysis, Analysis::Stale);
    assert!(analysis.metrics().is_stale());
    assert_eq!(world.sender.send().await.unwrap(), SendOutcome::Stale);
    assert!(world.store.get_pending_starts().await.unwrap().is_empty());
    assert!(world.sent_starts().is_empty());
}

#[tokio::test]
async fn daemon_queues_evacuation_replacements_from_the_bus() {
    let world = World::new(HmConfig::default()).await;
    world.desire(&[desired("web", 2)]).await;

    let bus: Arc<dyn MessageBus> = world.bus.clone();
    let daemon = Daemon::new(world.config.clone(), world.store.clone(), bus, world.clock.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(async move {
        daemon
            .run(&[Role::Listener, Role::Evacuator], shutdown_rx)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    publish_json(
        world.bus.as_ref(),
        &world.config.subjects.droplet_exited,
        &DropletExited {
            app_id: "web".into(),
            app_version: "v1".into(),
            instance_guid: "web-1".into(),
            instance_index: 1,
            reason: ExitReason::DeaEvacuation,
        },
    )
    .await
    .unwrap();

    let mut pending = None;
    for _ in 0..50 {
        pending = world.store.get_pending_start("web-v1").await.unwrap();
        if pending.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let pending = pending.expect("evacuation start should be queued");
    assert_eq!(pending.reason, StartReason::Evacuating);
    assert_eq!(pending.send_on, T0);
    assert_eq!(pending.indices_to_start, BTreeSet::from([1]));

    shutdown_tx.send(true).unwrap();
    assert_eq!(running.await.unwrap().unwrap(), Exit::Shutdown);
}
