//! Evacuation handling.
//!
//! A host that is shutting down or evacuating announces each instance it
//! drops. Waiting for the heartbeat to expire would leave the index empty
//! for a full heartbeat TTL plus the start delay, so the replacement start
//! is queued immediately instead.

use std::collections::BTreeSet;
use std::sync::Arc;

use hm_bus::{BusError, Message, MessageBus};
use hm_core::{Clock, DropletExited, HmConfig, PendingStartMessage, StartReason};
use hm_state::Store;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ListenerResult;

/// What happened to one droplet-exited notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvacuationOutcome {
    /// A start for the index is now pending and due.
    Queued(PendingStartMessage),
    /// Not an evacuation; the analyzer handles it.
    NotEvacuation,
    /// The app is not desired, not startable, or the index is out of range.
    NotWanted,
}

pub struct Evacuator {
    store: Store,
    bus: Arc<dyn MessageBus>,
    config: Arc<HmConfig>,
    clock: Arc<dyn Clock>,
}

impl Evacuator {
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

    pub async fn evacuate(&self, exited: &DropletExited) -> ListenerResult<EvacuationOutcome> {
        if !exited.reason.is_evacuation() {
            return Ok(EvacuationOutcome::NotEvacuation);
        }

        let desired = self
            .store
            .get_desired_state(&exited.app_id, &exited.app_version)
            .await?;
        let Some(desired) = desired.filter(|d| d.is_startable()) else {
            debug!(app = %exited.app_id, guid = %exited.instance_guid, "evacuated app is not wanted");
            return Ok(EvacuationOutcome::NotWanted);
        };
        if exited.instance_index >= desired.number_of_instances {
            return Ok(EvacuationOutcome::NotWanted);
        }

        let now = self.clock.now();
        let key = desired.store_key();
        let start = match self.store.get_pending_start(&key).await? {
            Some(mut pending) => {
                pending.indices_to_start.insert(exited.instance_index);
                pending.desired_instances = desired.number_of_instances;
                pending.send_on = now;
                // Unsent again: the new index must survive until it goes out.
                pending.sent_on = 0;
                pending.reason = StartReason::Evacuating;
                pending
            }
            None => PendingStartMessage {
                app_id: desired.app_id.clone(),
                app_version: desired.app_version.clone(),
                indices_to_start: BTreeSet::from([exited.instance_index]),
                desired_instances: desired.number_of_instances,
                send_on: now,
                sent_on: 0,
                keep_alive: self.config.start_keep_alive(),
                reason: StartReason::Evacuating,
            },
        };
        self.store.save_pending_starts(std::slice::from_ref(&start)).await?;

        info!(
            app = %key,
            index = exited.instance_index,
            guid = %exited.instance_guid,
            reason = ?exited.reason,
            "queued evacuation start"
        );
        Ok(EvacuationOutcome::Queued(start))
    }

    /// Decode and handle one bus message. Bad payloads and store errors are
    /// logged; the next notification is processed regardless.
    pub async fn handle(&self, message: &Message) -> Option<EvacuationOutcome> {
        let exited = match message.json::<DropletExited>() {
            Ok(exited) => exited,
            Err(e) => {
                warn!(error = %e, "dropping malformed droplet-exited message");
                return None;
            }
        };
        match self.evacuate(&exited).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(guid = %exited.instance_guid, error = %e, "evacuation failed");
                None
            }
        }
    }

    pub async fn run(&self, subject: &str, mut shutdown: watch::Receiver<bool>) -> ListenerResult<()> {
        let mut messages = self.bus.subscribe(subject).await?;
        info!(subject, "evacuator started");

        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(message) => {
                        self.handle(&message).await;
                    }
                    None => return Err(BusError::Closed.into()),
                },
                _ = shutdown.changed() => {
                    info!("evacuator shutting down");
                    return Ok(());
                }
            }
        }
    }
}
