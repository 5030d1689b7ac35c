//! Heartbeat ingestion.
//!
//! ```text
//!   hm.heartbeat ──► decode HeartbeatSnapshot ──► bump /actual-fresh
//!                          │ bad payload                │
//!                          ▼                            ▼
//!                     warn, drop            /actual/{app}/{index}/{guid}
//!                                           (heartbeat TTL, one per instance)
//! ```
//!
//! Writes are last-write-wins, so redelivered snapshots are harmless.

use std::sync::Arc;

use hm_bus::{BusError, Message, MessageBus};
use hm_core::{Clock, HeartbeatSnapshot};
use hm_state::Store;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ListenerResult;

/// Outcome of storing one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub stored: usize,
    /// Guids of instances whose record could not be written.
    pub failed: Vec<String>,
}

pub struct Ingestor {
    store: Store,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
}

impl Ingestor {
    pub fn new(store: Store, bus: Arc<dyn MessageBus>, clock: Arc<dyn Clock>) -> Self {
        Self { store, bus, clock }
    }

    /// Store one snapshot. A failed freshness bump is logged and the
    /// instances are still written.
    pub async fn ingest(&self, snapshot: &HeartbeatSnapshot) -> IngestReport {
        let now = self.clock.now();
        if let Err(e) = self.store.bump_actual_freshness(now).await {
            warn!(host = %snapshot.host_id, error = %e, "failed to bump actual freshness");
        }

        let mut report = IngestReport::default();
        for (guid, result) in self.store.save_heartbeats(&snapshot.instance_heartbeats).await {
            match result {
                Ok(()) => report.stored += 1,
                Err(e) => {
                    warn!(host = %snapshot.host_id, guid = %guid, error = %e, "failed to store heartbeat");
                    report.failed.push(guid);
                }
            }
        }

        debug!(
            host = %snapshot.host_id,
            stored = report.stored,
            failed = report.failed.len(),
            "ingested heartbeat"
        );
        report
    }

    /// Decode and store one bus message; undecodable payloads are dropped.
    pub async fn handle(&self, message: &Message) -> Option<IngestReport> {
        match message.json::<HeartbeatSnapshot>() {
            Ok(snapshot) => Some(self.ingest(&snapshot).await),
            Err(e) => {
                warn!(error = %e, "dropping malformed heartbeat");
                None
            }
        }
    }

    /// Consume `subject` until shutdown.
    pub async fn run(&self, subject: &str, mut shutdown: watch::Receiver<bool>) -> ListenerResult<()> {
        let mut messages = self.bus.subscribe(subject).await?;
        info!(subject, "heartbeat ingestor started");

        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(message) => {
                        self.handle(&message).await;
                    }
                    None => return Err(BusError::Closed.into()),
                },
                _ = shutdown.changed() => {
                    info!("heartbeat ingestor shutting down");
                    return Ok(());
                }
            }
        }
    }
}
