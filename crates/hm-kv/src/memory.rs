//! Process-local store adapter.
//!
//! Holds every entry in a `BTreeMap` behind a mutex. TTLs are evaluated
//! against an injected [`Clock`], which makes this backend the natural
//! choice for tests and for single-process deployments.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use hm_core::{Clock, SystemClock};

use crate::adapter::StoreAdapter;
use crate::error::{StoreError, StoreResult};
use crate::node::{StoreNode, StoredEntry};
use crate::ops::{self, EntryRead, EntryWrite};

type EntryMap = BTreeMap<String, StoredEntry>;

impl EntryRead for EntryMap {
    fn entry(&self, key: &str) -> StoreResult<Option<StoredEntry>> {
        Ok(self.get(key).cloned())
    }

    fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, StoredEntry)>> {
        Ok(self
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

impl EntryWrite for EntryMap {
    fn insert(&mut self, key: &str, entry: &StoredEntry) -> StoreResult<()> {
        BTreeMap::insert(self, key.to_string(), entry.clone());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> StoreResult<()> {
        BTreeMap::remove(self, key);
        Ok(())
    }
}

/// In-memory store adapter with clock-driven TTL expiry.
pub struct MemoryAdapter {
    entries: Mutex<EntryMap>,
    clock: Arc<dyn Clock>,
}

impl MemoryAdapter {
    /// An empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// An empty store whose TTLs follow `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    fn entries(&self) -> StoreResult<MutexGuard<'_, EntryMap>> {
        self.entries
            .lock()
            .map_err(|e| StoreError::Backend(format!("memory store poisoned: {e}")))
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) -> StoreResult<usize> {
        let now = self.clock.now();
        let mut entries = self.entries()?;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok(before - entries.len())
    }

    /// Number of live keys.
    pub fn len(&self) -> StoreResult<usize> {
        let now = self.clock.now();
        Ok(self.entries()?.values().filter(|e| e.is_live(now)).count())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreAdapter for MemoryAdapter {
    fn get(&self, key: &str) -> StoreResult<StoreNode> {
        ops::get(&*self.entries()?, key, self.clock.now())
    }

    fn set(&self, key: &str, value: &[u8], ttl: u64) -> StoreResult<()> {
        ops::set(&mut *self.entries()?, key, value, ttl, self.clock.now())
    }

    fn list_recursively(&self, key: &str) -> StoreResult<StoreNode> {
        self.purge_expired()?;
        ops::list_recursively(&*self.entries()?, key, self.clock.now())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        ops::delete(&mut *self.entries()?, key, self.clock.now())
    }

    fn create(&self, key: &str, value: &[u8], ttl: u64) -> StoreResult<()> {
        ops::create(&mut *self.entries()?, key, value, ttl, self.clock.now())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: &[u8],
        ttl: u64,
    ) -> StoreResult<()> {
        ops::compare_and_swap(
            &mut *self.entries()?,
            key,
            expected,
            value,
            ttl,
            self.clock.now(),
        )
    }
}
