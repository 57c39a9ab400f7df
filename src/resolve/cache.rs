//! Fixed-TTL resolution cache.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

struct CacheEntry {
    addrs: Vec<IpAddr>,
    inserted: Instant,
}

/// Hostname to address cache with a single TTL for every entry.
///
/// An entry inserted at `T` is served for lookups before `T + ttl` and
/// dropped on the first lookup at or after it.
pub struct DnsCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl DnsCache {
    /// Create an empty cache.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Configured TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Non-expired addresses for `host`.
    pub fn get(&self, host: &str) -> Option<Vec<IpAddr>> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(host) {
                Some(entry) if now.duration_since(entry.inserted) < self.ttl => {
                    return Some(entry.addrs.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: evict unless someone refreshed it meanwhile
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(host) {
            if now.duration_since(entry.inserted) >= self.ttl {
                entries.remove(host);
            }
        }
        None
    }

    /// Store a successful resolution.
    pub fn insert(&self, host: &str, addrs: Vec<IpAddr>) {
        if addrs.is_empty() || self.ttl.is_zero() {
            return;
        }
        self.entries.write().insert(
            host.to_string(),
            CacheEntry {
                addrs,
                inserted: Instant::now(),
            },
        );
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.inserted) < self.ttl);
        before - entries.len()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
