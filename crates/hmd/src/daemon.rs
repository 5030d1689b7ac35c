//! Role assembly.
//!
//! ```text
//!   listener  ── hm.heartbeat ──────────►┐
//!   evacuator ── hm.droplet.exited ─────►│
//!   fetcher   ── lock "fetcher"  ───────►│  Store ◄── analyzer ── lock "analyzer"
//!                                        │    │
//!                                        └────┴───► sender ── lock "sender" ──► hm.start / hm.stop
//! ```
//!
//! Timer-driven roles only run while they hold their lock. Losing a lock
//! ends the whole daemon with [`LOCK_LOST_EXIT_CODE`] so a supervisor can
//! restart it cleanly.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use hm_analyzer::Analyzer;
use hm_bus::MessageBus;
use hm_core::{Clock, HmConfig};
use hm_fetcher::Fetcher;
use hm_kv::{MemoryAdapter, RedbAdapter, StoreAdapter, StoreClient};
use hm_listener::{Evacuator, Ingestor};
use hm_sender::Sender;
use hm_state::Store;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Process exit status after a lock is lost.
pub const LOCK_LOST_EXIT_CODE: i32 = 197;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum)]
pub enum Role {
    Listener,
    Evacuator,
    Fetcher,
    Analyzer,
    Sender,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Listener,
        Role::Evacuator,
        Role::Fetcher,
        Role::Analyzer,
        Role::Sender,
    ];

    /// Name of the lock guarding this role, if it needs one.
    pub fn lock_name(self) -> Option<&'static str> {
        match self {
            Role::Listener | Role::Evacuator => None,
            Role::Fetcher => Some("fetcher"),
            Role::Analyzer => Some("analyzer"),
            Role::Sender => Some("sender"),
        }
    }
}

/// Why the daemon stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Shutdown,
    LockLost(&'static str),
}

impl Exit {
    pub fn code(self) -> i32 {
        match self {
            Exit::Shutdown => 0,
            Exit::LockLost(_) => LOCK_LOST_EXIT_CODE,
        }
    }
}

/// Build the store the config asks for.
pub fn open_store(config: &Arc<HmConfig>, clock: Arc<dyn Clock>) -> anyhow::Result<Store> {
    let adapter: Arc<dyn StoreAdapter> = match config.store.backend.as_str() {
        "memory" => Arc::new(MemoryAdapter::with_clock(clock)),
        "redb" => {
            if let Some(parent) = config.store.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Arc::new(RedbAdapter::open_with_clock(&config.store.path, clock)?)
        }
        other => anyhow::bail!("unknown store backend {other:?}"),
    };
    info!(backend = %config.store.backend, "store opened");

    let client = StoreClient::new(
        adapter,
        config.store.max_concurrent_requests,
        config.store_timeout(),
    );
    Ok(Store::new(client, config.clone()))
}

#[derive(Clone)]
pub struct Daemon {
    config: Arc<HmConfig>,
    store: Store,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
}

impl Daemon {
    pub fn new(
        config: Arc<HmConfig>,
        store: Store,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            clock,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run `roles` until shutdown or until a lock is lost.
    pub async fn run(&self, roles: &[Role], shutdown: watch::Receiver<bool>) -> anyhow::Result<Exit> {
        let roles: BTreeSet<Role> = roles.iter().copied().collect();
        info!(?roles, "health manager starting");

        let mut tasks = JoinSet::new();
        for role in roles {
            tasks.spawn(self.clone().run_role(role, shutdown.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined? {
                Ok(Exit::Shutdown) => {}
                // Dropping the set aborts the remaining roles.
                Ok(exit) => return Ok(exit),
                Err(e) => return Err(e),
            }
        }
        info!("health manager stopped");
        Ok(Exit::Shutdown)
    }

    async fn run_role(self, role: Role, shutdown: watch::Receiver<bool>) -> anyhow::Result<Exit> {
        let config = self.config.clone();
        match role {
            Role::Listener => {
                let ingestor = Ingestor::new(self.store.clone(), self.bus.clone(), self.clock.clone());
                ingestor.run(&config.subjects.heartbeat, shutdown).await?;
                Ok(Exit::Shutdown)
            }
            Role::Evacuator => {
                let evacuator = Evacuator::new(
                    self.store.clone(),
                    self.bus.clone(),
                    config.clone(),
                    self.clock.clone(),
                );
                evacuator.run(&config.subjects.droplet_exited, shutdown).await?;
                Ok(Exit::Shutdown)
            }
            Role::Fetcher => {
                let fetcher = Fetcher::new(
                    self.store.clone(),
                    self.bus.clone(),
                    config.clone(),
                    self.clock.clone(),
                )?;
                let interval = config.fetcher_polling_interval();
                self.locked(role, shutdown, move |stop| async move {
                    fetcher.run(interval, stop).await
                })
                .await
            }
            Role::Analyzer => {
                let analyzer = Analyzer::new(self.store.clone(), config.clone(), self.clock.clone());
                let interval = config.analyzer_polling_interval();
                self.locked(role, shutdown, move |stop| async move {
                    analyzer.run(interval, stop).await
                })
                .await
            }
            Role::Sender => {
                let sender = Sender::new(
                    self.store.clone(),
                    self.bus.clone(),
                    config.clone(),
                    self.clock.clone(),
                );
                let interval = config.sender_polling_interval();
                self.locked(role, shutdown, move |stop| async move {
                    sender.run(interval, stop).await
                })
                .await
            }
        }
    }

    /// Hold the role's lock for as long as `body` runs.
    async fn locked<F, Fut>(
        &self,
        role: Role,
        mut shutdown: watch::Receiver<bool>,
        body: F,
    ) -> anyhow::Result<Exit>
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let Some(name) = role.lock_name() else {
            body(shutdown).await;
            return Ok(Exit::Shutdown);
        };

        let client = self.store.client();
        let handle = tokio::select! {
            handle = client.get_and_maintain_lock(name, self.config.lock_ttl_secs) => handle?,
            _ = shutdown.changed() => return Ok(Exit::Shutdown),
        };
        let (lost, release) = handle.into_parts();

        tokio::select! {
            _ = body(shutdown) => {
                release.release().await;
                Ok(Exit::Shutdown)
            }
            Ok(()) = lost => {
                error!(lock = name, "lost lock, exiting");
                Ok(Exit::LockLost(name))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_bus::LocalBus;
    use hm_core::{ManualClock, SystemClock};
    use hm_kv::lock_key;
    use std::time::Duration;

    fn memory_config() -> HmConfig {
        let mut config = HmConfig {
            lock_ttl_secs: 1,
            ..HmConfig::default()
        };
        config.store.backend = "memory".into();
        config
    }

    fn daemon(config: HmConfig) -> Daemon {
        let config = Arc::new(config);
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let store = open_store(&config, clock.clone()).unwrap();
        Daemon::new(config, store, Arc::new(LocalBus::new()), clock)
    }

    #[test]
    fn only_timer_roles_take_locks() {
        let locked: Vec<_> = Role::ALL.iter().filter_map(|r| r.lock_name()).collect();
        assert_eq!(locked, vec!["fetcher", "analyzer", "sender"]);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Exit::Shutdown.code(), 0);
        assert_eq!(Exit::LockLost("sender").code(), 197);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let mut config = HmConfig::default();
        config.store.backend = "etcd".into();
        let err = open_store(&Arc::new(config), Arc::new(SystemClock)).err().unwrap();
        assert!(err.to_string().contains("etcd"));
    }

    #[tokio::test]
    async fn redb_backend_creates_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HmConfig::default();
        config.store.path = dir.path().join("nested").join("hm.redb");
        let store = open_store(&Arc::new(config.clone()), Arc::new(SystemClock)).unwrap();

        store.bump_desired_freshness(SystemClock.now()).await.unwrap();
        assert!(store.is_desired_fresh().await.unwrap());
        assert!(config.store.path.exists());
    }

    #[tokio::test]
    async fn shutdown_stops_roles_and_releases_locks() {
        let daemon = daemon(memory_config());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let roles = [Role::Listener, Role::Evacuator, Role::Analyzer, Role::Sender];
        let running = {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.run(&roles, shutdown_rx).await })
        };

        // Let the roles take their locks.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let client = daemon.store().client();
        assert!(client.get(&lock_key("analyzer")).await.is_ok());

        shutdown_tx.send(true).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("daemon should stop")
            .unwrap()
            .unwrap();
        assert_eq!(exit, Exit::Shutdown);
        assert_eq!(client.get(&lock_key("analyzer")).await.unwrap().ttl, 1);
        assert_eq!(client.get(&lock_key("sender")).await.unwrap().ttl, 1);
    }

    #[tokio::test]
    async fn lock_loss_ends_the_daemon() {
        let daemon = daemon(memory_config());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.run(&[Role::Analyzer], shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        daemon
            .store()
            .client()
            .set(&lock_key("analyzer"), b"another-process".to_vec(), 10)
            .await
            .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(3), running)
            .await
            .expect("lock loss should end the daemon")
            .unwrap()
            .unwrap();
        assert_eq!(exit, Exit::LockLost("analyzer"));
        assert_eq!(exit.code(), LOCK_LOST_EXIT_CODE);
    }
}
