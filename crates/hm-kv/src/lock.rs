//! Distributed lock with lease renewal.
//!
//! ```text
//!   get_and_maintain_lock(name, ttl)
//!        │  create-if-absent /hm/locks/{name} = token   (retry until held)
//!        ▼
//!   renewal task ── every ttl/2 ──► compare_and_swap(token, token, ttl)
//!        │                               │ failure
//!        │                               ▼
//!        │                         lost.send(())  (once), task exits
//!        ▼
//!   release() ──► compare_and_swap(token, token, 1), task exits
//! ```
//!
//! The lock value is the client's unique token, so a process that already
//! holds a lock re-acquires it immediately.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::client::StoreClient;
use crate::error::{StoreError, StoreResult};

/// Store key of the lock called `name`.
pub fn lock_key(name: &str) -> String {
    format!("/hm/locks/{name}")
}

/// A held lock.
///
/// `lost` resolves once if renewal fails. Dropping `release` without
/// calling [`LockRelease::release`] also releases the lock, but without
/// waiting for the final write.
pub struct LockHandle {
    pub lost: oneshot::Receiver<()>,
    pub release: LockRelease,
}

impl LockHandle {
    pub fn into_parts(self) -> (oneshot::Receiver<()>, LockRelease) {
        (self.lost, self.release)
    }
}

pub struct LockRelease {
    request: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl LockRelease {
    /// Stop renewing and shorten the lease to one second.
    pub async fn release(self) {
        let _ = self.request.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "lock renewal task failed");
        }
    }
}

impl StoreClient {
    /// Block until the lock `name` holds this client's token, then keep it
    /// alive in the background.
    pub async fn get_and_maintain_lock(&self, name: &str, ttl: u64) -> StoreResult<LockHandle> {
        if ttl == 0 {
            return Err(StoreError::InvalidArgument(format!(
                "lock {name} needs a non-zero ttl"
            )));
        }

        let key = lock_key(name);
        let token = self.lock_token().as_bytes().to_vec();
        while !self.try_acquire(&key, &token, ttl).await {
            tokio::time::sleep(self.lock_retry_interval()).await;
        }
        info!(lock = %key, ttl, "acquired lock");

        let (lost_tx, lost_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        let task = tokio::spawn(maintain(self.clone(), key, ttl, lost_tx, release_rx));

        Ok(LockHandle {
            lost: lost_rx,
            release: LockRelease {
                request: release_tx,
                task,
            },
        })
    }

    async fn try_acquire(&self, key: &str, token: &[u8], ttl: u64) -> bool {
        match self.create(key, token.to_vec(), ttl).await {
            Ok(()) => true,
            // Held by someone; if it is us, refresh the lease and carry on.
            Err(StoreError::Conflict(_)) => self
                .compare_and_swap(key, token.to_vec(), token.to_vec(), ttl)
                .await
                .is_ok(),
            Err(e) => {
                warn!(lock = %key, error = %e, "lock acquisition failed, retrying");
                false
            }
        }
    }
}

async fn maintain(
    client: StoreClient,
    key: String,
    ttl: u64,
    lost: oneshot::Sender<()>,
    mut release: oneshot::Receiver<()>,
) {
    let token = client.lock_token().as_bytes().to_vec();
    let period = Duration::from_millis(ttl.saturating_mul(500));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut release => {
                if let Err(e) = client
                    .compare_and_swap(&key, token.clone(), token.clone(), 1)
                    .await
                {
                    warn!(lock = %key, error = %e, "final lock write failed");
                }
                info!(lock = %key, "released lock");
                return;
            }
            _ = ticker.tick() => {
                match client
                    .compare_and_swap(&key, token.clone(), token.clone(), ttl)
                    .await
                {
                    Ok(()) => debug!(lock = %key, "renewed lock"),
                    Err(e) => {
                        warn!(lock = %key, error = %e, "lost lock");
                        let _ = lost.send(());
                        return;
                    }
                }
            }
        }
    }
}
