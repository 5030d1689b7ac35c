//! Store nodes and the key-path helpers shared by every adapter.
//!
//! Keys are slash-separated paths (`/actual/app-v1/0/guid`). A key that
//! has live keys beneath it is a directory; directories are implied and
//! never stored.

use std::collections::BTreeMap;

/// A value or directory read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNode {
    pub key: String,
    pub value: Vec<u8>,
    /// Remaining time to live in seconds; 0 means no expiry.
    pub ttl: u64,
    pub dir: bool,
    pub children: Vec<StoreNode>,
}

impl StoreNode {
    pub fn leaf(key: impl Into<String>, value: Vec<u8>, ttl: u64) -> Self {
        Self {
            key: key.into(),
            value,
            ttl,
            dir: false,
            children: Vec::new(),
        }
    }

    pub fn directory(key: impl Into<String>, children: Vec<StoreNode>) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            ttl: 0,
            dir: true,
            children,
        }
    }

    /// All leaves beneath this node, depth first, in key order.
    pub fn leaves(&self) -> Vec<&StoreNode> {
        if !self.dir {
            return vec![self];
        }
        self.children.iter().flat_map(|c| c.leaves()).collect()
    }
}

/// A value record with its absolute expiry, as persisted by adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub value: Vec<u8>,
    /// Unix time after which the entry is gone; 0 means never.
    pub expires_at: u64,
}

impl StoredEntry {
    pub fn new(value: &[u8], ttl: u64, now: u64) -> Self {
        Self {
            value: value.to_vec(),
            expires_at: if ttl == 0 { 0 } else { now.saturating_add(ttl) },
        }
    }

    pub fn is_live(&self, now: u64) -> bool {
        self.expires_at == 0 || now < self.expires_at
    }

    pub fn remaining_ttl(&self, now: u64) -> u64 {
        if self.expires_at == 0 {
            0
        } else {
            self.expires_at.saturating_sub(now)
        }
    }

    pub fn to_node(&self, key: &str, now: u64) -> StoreNode {
        StoreNode::leaf(key, self.value.clone(), self.remaining_ttl(now))
    }
}

/// Canonical form of a key: leading slash, no trailing slash, no empty
/// segments.
pub fn normalize_key(key: &str) -> String {
    let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Prefix shared by every key strictly beneath `key`.
pub fn child_prefix(key: &str) -> String {
    if key == "/" {
        "/".to_string()
    } else {
        format!("{key}/")
    }
}

/// Proper ancestors of a normalized key, nearest to the root first.
///
/// `/a/b/c` yields `/a`, `/a/b`.
pub fn ancestors(key: &str) -> Vec<String> {
    let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
    (1..segments.len())
        .map(|n| format!("/{}", segments[..n].join("/")))
        .collect()
}

/// Build the directory tree rooted at `key` from the live leaves beneath it.
///
/// `entries` must all start with `child_prefix(key)`.
pub fn build_tree(key: &str, entries: &[(String, StoredEntry)], now: u64) -> StoreNode {
    let prefix = child_prefix(key);
    let mut groups: BTreeMap<String, Vec<&(String, StoredEntry)>> = BTreeMap::new();
    for entry in entries {
        let Some(rest) = entry.0.strip_prefix(&prefix) else {
            continue;
        };
        let segment = rest.split('/').next().unwrap_or_default();
        let child_key = format!("{prefix}{segment}");
        groups.entry(child_key).or_default().push(entry);
    }

    let children = groups
        .into_iter()
        .map(|(child_key, group)| {
            if let [(leaf_key, entry)] = group.as_slice()
                && *leaf_key == child_key
            {
                return entry.to_node(leaf_key, now);
            }
            let owned: Vec<(String, StoredEntry)> = group.into_iter().cloned().collect();
            build_tree(&child_key, &owned, now)
        })
        .collect();

    StoreNode::directory(key, children)
}
