//! Store semantics shared by every adapter.
//!
//! Adapters only provide ordered entry access ([`EntryRead`] /
//! [`EntryWrite`]); directory rules, TTL expiry and the atomic
//! create/compare-and-swap checks live here once.

use crate::error::{StoreError, StoreResult};
use crate::node::{StoreNode, StoredEntry, ancestors, build_tree, child_prefix, normalize_key};

/// Ordered read access to raw entries, expired or not.
pub(crate) trait EntryRead {
    fn entry(&self, key: &str) -> StoreResult<Option<StoredEntry>>;

    /// Every entry whose key starts with `prefix`, in key order.
    fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, StoredEntry)>>;
}

pub(crate) trait EntryWrite: EntryRead {
    fn insert(&mut self, key: &str, entry: &StoredEntry) -> StoreResult<()>;
    fn remove(&mut self, key: &str) -> StoreResult<()>;
}

fn live_entry(map: &impl EntryRead, key: &str, now: u64) -> StoreResult<Option<StoredEntry>> {
    Ok(map.entry(key)?.filter(|e| e.is_live(now)))
}

fn live_children(
    map: &impl EntryRead,
    key: &str,
    now: u64,
) -> StoreResult<Vec<(String, StoredEntry)>> {
    Ok(map
        .scan(&child_prefix(key))?
        .into_iter()
        .filter(|(_, e)| e.is_live(now))
        .collect())
}

/// A key can hold a value if nothing lives beneath it and no ancestor is a
/// live value. Expired ancestor values are cleared on the way.
fn ensure_writable(map: &mut impl EntryWrite, key: &str, now: u64) -> StoreResult<()> {
    if key == "/" || !live_children(map, key, now)?.is_empty() {
        return Err(StoreError::IsDirectory(key.to_string()));
    }
    for ancestor in ancestors(key) {
        match map.entry(&ancestor)? {
            Some(e) if e.is_live(now) => return Err(StoreError::IsNotDirectory(ancestor)),
            Some(_) => map.remove(&ancestor)?,
            None => {}
        }
    }
    Ok(())
}

/// Remove every expired entry at or beneath `key`.
pub(crate) fn purge_expired(map: &mut impl EntryWrite, key: &str, now: u64) -> StoreResult<usize> {
    let key = normalize_key(key);
    let mut expired: Vec<String> = map
        .scan(&child_prefix(&key))?
        .into_iter()
        .filter(|(_, e)| !e.is_live(now))
        .map(|(k, _)| k)
        .collect();
    if map.entry(&key)?.is_some_and(|e| !e.is_live(now)) {
        expired.push(key);
    }
    for k in &expired {
        map.remove(k)?;
    }
    Ok(expired.len())
}

pub(crate) fn get(map: &impl EntryRead, key: &str, now: u64) -> StoreResult<StoreNode> {
    let key = normalize_key(key);
    if let Some(entry) = live_entry(map, &key, now)? {
        return Ok(entry.to_node(&key, now));
    }
    if live_children(map, &key, now)?.is_empty() {
        Err(StoreError::KeyNotFound(key))
    } else {
        Err(StoreError::IsDirectory(key))
    }
}

pub(crate) fn set(
    map: &mut impl EntryWrite,
    key: &str,
    value: &[u8],
    ttl: u64,
    now: u64,
) -> StoreResult<()> {
    let key = normalize_key(key);
    ensure_writable(map, &key, now)?;
    map.insert(&key, &StoredEntry::new(value, ttl, now))
}

pub(crate) fn list_recursively(
    map: &impl EntryRead,
    key: &str,
    now: u64,
) -> StoreResult<StoreNode> {
    let key = normalize_key(key);
    if live_entry(map, &key, now)?.is_some() {
        return Err(StoreError::IsNotDirectory(key));
    }
    let children = live_children(map, &key, now)?;
    if children.is_empty() && key != "/" {
        return Err(StoreError::KeyNotFound(key));
    }
    Ok(build_tree(&key, &children, now))
}

pub(crate) fn delete(map: &mut impl EntryWrite, key: &str, now: u64) -> StoreResult<()> {
    let key = normalize_key(key);
    if let Some(entry) = map.entry(&key)? {
        map.remove(&key)?;
        if entry.is_live(now) {
            return Ok(());
        }
    }

    let beneath = map.scan(&child_prefix(&key))?;
    let any_live = beneath.iter().any(|(_, e)| e.is_live(now));
    for (child, _) in &beneath {
        map.remove(child)?;
    }
    if any_live {
        Ok(())
    } else {
        Err(StoreError::KeyNotFound(key))
    }
}

pub(crate) fn create(
    map: &mut impl EntryWrite,
    key: &str,
    value: &[u8],
    ttl: u64,
    now: u64,
) -> StoreResult<()> {
    let key = normalize_key(key);
    if live_entry(map, &key, now)?.is_some() {
        return Err(StoreError::Conflict(format!("{key} already exists")));
    }
    ensure_writable(map, &key, now)?;
    map.insert(&key, &StoredEntry::new(value, ttl, now))
}

pub(crate) fn compare_and_swap(
    map: &mut impl EntryWrite,
    key: &str,
    expected: &[u8],
    value: &[u8],
    ttl: u64,
    now: u64,
) -> StoreResult<()> {
    let key = normalize_key(key);
    match live_entry(map, &key, now)? {
        Some(current) if current.value == expected => {
            map.insert(&key, &StoredEntry::new(value, ttl, now))
        }
        Some(_) => Err(StoreError::Conflict(format!("{key} holds a different value"))),
        None if !live_children(map, &key, now)?.is_empty() => {
            Err(StoreError::IsDirectory(key))
        }
        None => Err(StoreError::KeyNotFound(key)),
    }
}
