//! Async store client.
//!
//! Wraps a [`StoreAdapter`] with the bounded [`WorkerPool`]: every request
//! is timed out individually and batched writes fan out across the pool.
//! The client also carries the unique token it uses for distributed
//! locks (see [`crate::lock`]).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::debug;

use crate::adapter::StoreAdapter;
use crate::error::{StoreError, StoreResult};
use crate::node::StoreNode;
use crate::pool::WorkerPool;

/// One write in a batched `set_many`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreWrite {
    pub key: String,
    pub value: Vec<u8>,
    pub ttl: u64,
}

impl StoreWrite {
    pub fn new(key: impl Into<String>, value: Vec<u8>, ttl: u64) -> Self {
        Self {
            key: key.into(),
            value,
            ttl,
        }
    }
}

#[derive(Clone)]
pub struct StoreClient {
    adapter: Arc<dyn StoreAdapter>,
    pool: WorkerPool,
    lock_token: String,
    lock_retry_interval: Duration,
}

impl StoreClient {
    pub fn new(adapter: Arc<dyn StoreAdapter>, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            adapter,
            pool: WorkerPool::new(max_concurrent, timeout),
            lock_token: uuid::Uuid::new_v4().to_string(),
            lock_retry_interval: Duration::from_secs(1),
        }
    }

    /// Override how often a blocked lock acquisition retries.
    pub fn with_lock_retry_interval(mut self, interval: Duration) -> Self {
        self.lock_retry_interval = interval;
        self
    }

    /// The value this client writes into locks it holds.
    pub fn lock_token(&self) -> &str {
        &self.lock_token
    }

    pub(crate) fn lock_retry_interval(&self) -> Duration {
        self.lock_retry_interval
    }

    pub async fn get(&self, key: &str) -> StoreResult<StoreNode> {
        let adapter = self.adapter.clone();
        let owned = key.to_string();
        self.pool
            .run(&format!("get {key}"), move || adapter.get(&owned))
            .await
    }

    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: u64) -> StoreResult<()> {
        let adapter = self.adapter.clone();
        let owned = key.to_string();
        self.pool
            .run(&format!("set {key}"), move || adapter.set(&owned, &value, ttl))
            .await
    }

    pub async fn list_recursively(&self, key: &str) -> StoreResult<StoreNode> {
        let adapter = self.adapter.clone();
        let owned = key.to_string();
        self.pool
            .run(&format!("list {key}"), move || adapter.list_recursively(&owned))
            .await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        let adapter = self.adapter.clone();
        let owned = key.to_string();
        self.pool
            .run(&format!("delete {key}"), move || adapter.delete(&owned))
            .await
    }

    pub async fn create(&self, key: &str, value: Vec<u8>, ttl: u64) -> StoreResult<()> {
        let adapter = self.adapter.clone();
        let owned = key.to_string();
        self.pool
            .run(&format!("create {key}"), move || {
                adapter.create(&owned, &value, ttl)
            })
            .await
    }

    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected: Vec<u8>,
        value: Vec<u8>,
        ttl: u64,
    ) -> StoreResult<()> {
        let adapter = self.adapter.clone();
        let owned = key.to_string();
        self.pool
            .run(&format!("cas {key}"), move || {
                adapter.compare_and_swap(&owned, &expected, &value, ttl)
            })
            .await
    }

    /// Write every entry concurrently, returning the first error.
    pub async fn set_many(&self, writes: Vec<StoreWrite>) -> StoreResult<()> {
        for (_, result) in self.set_each(writes).await {
            result?;
        }
        Ok(())
    }

    /// Write every entry concurrently and report each key's outcome, in
    /// input order.
    pub async fn set_each(&self, writes: Vec<StoreWrite>) -> Vec<(String, StoreResult<()>)> {
        let count = writes.len();
        let mut tasks = JoinSet::new();
        for (position, write) in writes.into_iter().enumerate() {
            let client = self.clone();
            tasks.spawn(async move {
                let result = client.set(&write.key, write.value, write.ttl).await;
                (position, write.key, result)
            });
        }

        let mut results = collect(tasks, count).await;
        results.sort_by_key(|(position, _, _)| *position);
        debug!(count, "batched set complete");
        results
            .into_iter()
            .map(|(_, key, result)| (key, result))
            .collect()
    }

    /// Delete every key concurrently. Keys that are already gone are not
    /// an error; otherwise the first error is returned.
    pub async fn delete_many(&self, keys: Vec<String>) -> StoreResult<()> {
        let count = keys.len();
        let mut tasks = JoinSet::new();
        for (position, key) in keys.into_iter().enumerate() {
            let client = self.clone();
            tasks.spawn(async move {
                let result = match client.delete(&key).await {
                    Err(e) if e.is_not_found() => Ok(()),
                    other => other,
                };
                (position, key, result)
            });
        }

        let mut results = collect(tasks, count).await;
        results.sort_by_key(|(position, _, _)| *position);
        for (_, _, result) in results {
            result?;
        }
        Ok(())
    }
}

type Outcome = (usize, String, StoreResult<()>);

async fn collect(mut tasks: JoinSet<Outcome>, count: usize) -> Vec<Outcome> {
    let mut results = Vec::with_capacity(count);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => results.push(outcome),
            Err(e) => results.push((
                usize::MAX,
                String::new(),
                Err(StoreError::Backend(format!("store task failed: {e}"))),
            )),
        }
    }
    results
}
