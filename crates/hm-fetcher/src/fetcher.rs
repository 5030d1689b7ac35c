//! Desired-state poller.
//!
//! ```text
//!   Unauthenticated ──► Authenticating ──► Fetching(0) ──► Fetching(1) ──► … ──► Done
//!         ▲              (bus request)           │ 401            │ empty page:
//!         └──────── credentials dropped ◄────────┘                │ bump /desired-fresh
//!                                                 any other failure ──► Error
//! ```
//!
//! Credentials are cached across cycles and only re-requested after the
//! bulk API rejects them or a request for them fails. Only a pass that
//! reaches the empty last page renews desired freshness, so a partial
//! pass can never make stale desired state look trustworthy.

use std::sync::Arc;
use std::time::Duration;

use hm_bus::MessageBus;
use hm_core::{BulkCredentials, Clock, DesiredAppState, HmConfig};
use hm_state::Store;
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

use crate::bulk::BulkClient;
use crate::error::{FetchError, FetchResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchState {
    Unauthenticated,
    Authenticating,
    /// Requesting the zero-based page.
    Fetching { page: usize },
    Done { apps: usize },
    Error(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    /// Pages requested, including the final empty one.
    pub pages: usize,
    pub apps: usize,
}

pub struct Fetcher {
    store: Store,
    bus: Arc<dyn MessageBus>,
    config: Arc<HmConfig>,
    clock: Arc<dyn Clock>,
    client: BulkClient,
    credentials: Mutex<Option<BulkCredentials>>,
    state: watch::Sender<FetchState>,
}

impl Fetcher {
    pub fn new(
        store: Store,
        bus: Arc<dyn MessageBus>,
        config: Arc<HmConfig>,
        clock: Arc<dyn Clock>,
    ) -> FetchResult<Self> {
        let client = BulkClient::new(&config.bulk_api_url, config.fetcher_network_timeout())?;
        let (state, _) = watch::channel(FetchState::Unauthenticated);
        Ok(Self {
            store,
            bus,
            config,
            clock,
            client,
            credentials: Mutex::new(None),
            state,
        })
    }

    pub fn subscribe_state(&self) -> watch::Receiver<FetchState> {
        self.state.subscribe()
    }

    pub async fn has_credentials(&self) -> bool {
        self.credentials.lock().await.is_some()
    }

    /// Run one full pass over the bulk API.
    pub async fn fetch(&self) -> FetchResult<FetchReport> {
        let result = self.fetch_pass().await;
        match &result {
            Ok(report) => {
                self.state.send_replace(FetchState::Done { apps: report.apps });
            }
            Err(e) => {
                self.state.send_replace(FetchState::Error(e.to_string()));
            }
        }
        result
    }

    async fn fetch_pass(&self) -> FetchResult<FetchReport> {
        let credentials = self.credentials().await?;
        let batch_size = self.config.desired_state_batch_size;
        let mut token = serde_json::json!({});
        let mut report = FetchReport::default();

        loop {
            self.state
                .send_replace(FetchState::Fetching { page: report.pages });
            let page = match self.client.fetch_page(&credentials, &token, batch_size).await {
                Ok(page) => page,
                Err(FetchError::Unauthorized) => {
                    warn!("bulk api rejected credentials, dropping them");
                    *self.credentials.lock().await = None;
                    return Err(FetchError::Unauthorized);
                }
                Err(e) => return Err(e),
            };
            report.pages += 1;

            if page.is_last() {
                self.store.bump_desired_freshness(self.clock.now()).await?;
                info!(pages = report.pages, apps = report.apps, "desired state fetched");
                return Ok(report);
            }

            let states: Vec<DesiredAppState> = page.results.into_values().collect();
            self.store.save_desired_states(&states).await?;
            report.apps += states.len();
            token = page.bulk_token;
        }
    }

    async fn credentials(&self) -> FetchResult<BulkCredentials> {
        let mut cached = self.credentials.lock().await;
        if let Some(credentials) = cached.as_ref() {
            return Ok(credentials.clone());
        }

        self.state.send_replace(FetchState::Authenticating);
        let subject = &self.config.subjects.bulk_credentials;
        let reply = self
            .bus
            .request(subject, Vec::new(), self.config.credentials_timeout())
            .await?;
        let credentials: BulkCredentials = reply
            .json()
            .map_err(|e| FetchError::Credentials(e.to_string()))?;

        info!(user = %credentials.user, "received bulk api credentials");
        *cached = Some(credentials.clone());
        Ok(credentials)
    }

    /// Run the fetcher loop.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), url = %self.config.bulk_api_url, "fetcher started");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.fetch().await {
                        error!(error = %e, "desired state fetch failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("fetcher shutting down");
                    break;
                }
            }
        }
    }
}
