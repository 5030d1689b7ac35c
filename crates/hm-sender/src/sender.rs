//! Sender: publishes due pending messages.
//!
//! Each cycle, gated on the same freshness check as the analyzer:
//!
//! 1. Every due stop is published and then deleted. Stops are not capped.
//! 2. Due starts are ordered by ascending desired instance count (small
//!    apps first), then `send_on`, then app key, and at most
//!    `sender_message_limit` of them are published. A published start is
//!    re-armed: `sent_on = now`, `send_on = now + keep_alive`.
//!
//! A message whose publish fails is left exactly as it was.

use std::sync::Arc;
use std::time::Duration;

use hm_bus::{MessageBus, publish_json};
use hm_core::{Clock, HmConfig, PendingStartMessage, StartMessage, StopMessage};
use hm_state::Store;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::SenderResult;

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    pub starts_sent: usize,
    pub stops_sent: usize,
    /// Due starts left for a later cycle by the message limit.
    pub starts_deferred: usize,
    pub publish_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The store could not be trusted; nothing was sent.
    Stale,
    Sent(SendReport),
}

pub struct Sender {
    store: Store,
    bus: Arc<dyn MessageBus>,
    config: Arc<HmConfig>,
    clock: Arc<dyn Clock>,
}

impl Sender {
    pub fn new(
        store: Store,
        bus: Arc<dyn MessageBus>,
        config: Arc<HmConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            clock,
        }
    }

    pub async fn send(&self) -> SenderResult<SendOutcome> {
        let now = self.clock.now();
        if !self.store.is_settled(now).await? {
            info!("store is not fresh, skipping send");
            return Ok(SendOutcome::Stale);
        }

        let (starts, stops) = tokio::try_join!(
            self.store.get_pending_starts(),
            self.store.get_pending_stops(),
        )?;
        let mut report = SendReport::default();

        let mut sent_stops = Vec::new();
        for stop in stops.values().filter(|s| s.is_ready(now)) {
            let message = StopMessage::from_pending(stop, now);
            match publish_json(self.bus.as_ref(), &self.config.subjects.stop, &message).await {
                Ok(()) => {
                    info!(
                        guid = %stop.instance_guid,
                        index = stop.instance_index,
                        duplicate = stop.is_duplicate,
                        reason = ?stop.reason,
                        "sent stop"
                    );
                    sent_stops.push(stop.instance_guid.clone());
                }
                Err(e) => {
                    warn!(guid = %stop.instance_guid, error = %e, "failed to publish stop");
                    report.publish_failures += 1;
                }
            }
        }
        report.stops_sent = sent_stops.len();
        self.store.delete_pending_stops(&sent_stops).await?;

        let mut due: Vec<&PendingStartMessage> =
            starts.values().filter(|s| s.is_ready(now)).collect();
        due.sort_by(|a, b| {
            (a.desired_instances, a.send_on, a.store_key())
                .cmp(&(b.desired_instances, b.send_on, b.store_key()))
        });
        let limit = self.config.sender_message_limit;
        report.starts_deferred = due.len().saturating_sub(limit);

        let mut rearmed = Vec::new();
        for start in due.into_iter().take(limit) {
            let message = StartMessage::from_pending(start, now);
            match publish_json(self.bus.as_ref(), &self.config.subjects.start, &message).await {
                Ok(()) => {
                    info!(
                        app = %start.store_key(),
                        indices = ?start.indices_to_start,
                        desired = start.desired_instances,
                        reason = ?start.reason,
                        "sent start"
                    );
                    let mut next = start.clone();
                    next.sent_on = now;
                    next.send_on = now + start.keep_alive;
                    rearmed.push(next);
                }
                Err(e) => {
                    warn!(app = %start.store_key(), error = %e, "failed to publish start");
                    report.publish_failures += 1;
                }
            }
        }
        report.starts_sent = rearmed.len();
        self.store.save_pending_starts(&rearmed).await?;

        if report.starts_deferred > 0 {
            debug!(deferred = report.starts_deferred, limit, "start limit reached");
        }
        Ok(SendOutcome::Sent(report))
    }

    /// Run the sender loop.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "sender started");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.send().await {
                        error!(error = %e, "send cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("sender shutting down");
                    break;
                }
            }
        }
    }
}
