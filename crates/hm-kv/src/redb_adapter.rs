//! Persistent store adapter backed by redb.
//!
//! Every key lives in one table. Values are stored as an 8-byte
//! big-endian expiry followed by the raw value bytes; expiry is checked
//! on read, and write transactions give create/compare-and-swap their
//! atomicity. Recursive listings run in a write transaction and drop the
//! expired entries they pass over, so dead heartbeats do not pile up.

use std::path::Path;
use std::sync::Arc;

use hm_core::{Clock, SystemClock};
use redb::{Database, ReadOnlyTable, ReadableDatabase, ReadableTable, Table};
use tracing::debug;

use crate::adapter::StoreAdapter;
use crate::error::{StoreError, StoreResult};
use crate::node::{StoreNode, StoredEntry};
use crate::ops::{self, EntryRead, EntryWrite};
use crate::tables::KV;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

fn encode_entry(entry: &StoredEntry) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + entry.value.len());
    bytes.extend_from_slice(&entry.expires_at.to_be_bytes());
    bytes.extend_from_slice(&entry.value);
    bytes
}

fn decode_entry(key: &str, bytes: &[u8]) -> StoreResult<StoredEntry> {
    let (expiry, value) = bytes
        .split_first_chunk::<8>()
        .ok_or_else(|| StoreError::Codec(format!("truncated entry at {key}")))?;
    Ok(StoredEntry {
        value: value.to_vec(),
        expires_at: u64::from_be_bytes(*expiry),
    })
}

/// Entry access over any readable redb table.
struct RedbTable<T>(T);

impl<T> EntryRead for RedbTable<T>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    fn entry(&self, key: &str) -> StoreResult<Option<StoredEntry>> {
        match self.0.get(key).map_err(map_err!(Backend))? {
            Some(guard) => Ok(Some(decode_entry(key, guard.value())?)),
            None => Ok(None),
        }
    }

    fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, StoredEntry)>> {
        let mut results = Vec::new();
        for item in self.0.range(prefix..).map_err(map_err!(Backend))? {
            let (key, value) = item.map_err(map_err!(Backend))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_string(), decode_entry(key, value.value())?));
        }
        Ok(results)
    }
}

impl EntryWrite for RedbTable<Table<'_, &'static str, &'static [u8]>> {
    fn insert(&mut self, key: &str, entry: &StoredEntry) -> StoreResult<()> {
        let bytes = encode_entry(entry);
        self.0
            .insert(key, bytes.as_slice())
            .map_err(map_err!(Backend))?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> StoreResult<()> {
        self.0.remove(key).map_err(map_err!(Backend))?;
        Ok(())
    }
}

/// Thread-safe store adapter backed by a redb database file.
#[derive(Clone)]
pub struct RedbAdapter {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl RedbAdapter {
    /// Drop every expired entry in the store.
    pub fn purge_expired(&self) -> StoreResult<usize> {
        let now = self.clock.now();
        self.write(|table| ops::purge_expired(table, "/", now))
    }

    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: &Path, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Backend))?;
        let store = Self {
            db: Arc::new(db),
            clock,
        };
        store.ensure_tables()?;
        debug!(?path, "redb store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory redb database (for testing).
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Backend))?;
        let store = Self {
            db: Arc::new(db),
            clock,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Backend))?;
        txn.open_table(KV).map_err(map_err!(Backend))?;
        txn.commit().map_err(map_err!(Backend))?;
        Ok(())
    }

    fn read<R>(
        &self,
        f: impl FnOnce(&RedbTable<ReadOnlyTable<&'static str, &'static [u8]>>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let txn = self.db.begin_read().map_err(map_err!(Backend))?;
        let table = RedbTable(txn.open_table(KV).map_err(map_err!(Backend))?);
        f(&table)
    }

    /// Run `f` in a write transaction; the transaction commits only if `f`
    /// succeeds.
    fn write<R>(
        &self,
        f: impl FnOnce(&mut RedbTable<Table<'_, &'static str, &'static [u8]>>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Backend))?;
        let result = {
            let mut table = RedbTable(txn.open_table(KV).map_err(map_err!(Backend))?);
            f(&mut table)?
        };
        txn.commit().map_err(map_err!(Backend))?;
        Ok(result)
    }
}

impl StoreAdapter for RedbAdapter {
    fn get(&self, key: &str) -> StoreResult<StoreNode> {
        let now = self.clock.now();
        self.read(|table| ops::get(table, key, now))
    }

    fn set(&self, key: &str, value: &[u8], ttl: u64) -> StoreResult<()> {
        let now = self.clock.now();
        self.write(|table| ops::set(table, key, value, ttl, now))
    }

    fn list_recursively(&self, key: &str) -> StoreResult<StoreNode> {
        let now = self.clock.now();
        self.write(|table| {
            let purged = ops::purge_expired(table, key, now)?;
            if purged > 0 {
                debug!(key, purged, "dropped expired entries");
            }
            ops::list_recursively(&*table, key, now)
        })
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let now = self.clock.now();
        self.write(|table| ops::delete(table, key, now))
    }

    fn create(&self, key: &str, value: &[u8], ttl: u64) -> StoreResult<()> {
        let now = self.clock.now();
        self.write(|table| ops::create(table, key, value, ttl, now))
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: &[u8],
        ttl: u64,
    ) -> StoreResult<()> {
        let now = self.clock.now();
        self.write(|table| ops::compare_and_swap(table, key, expected, value, ttl, now))
    }
}
