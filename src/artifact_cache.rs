use crate::messenger::DeliveryRef;
use parking_lot::Mutex;
use std::{collections::HashMap, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Clone, Debug)]
struct CacheEntry {
    reference: DeliveryRef,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Remembers which platform reference was produced for an artifact key so the
/// same media can be re-sent without downloading it again.
#[derive(Debug)]
pub struct ArtifactCache {
    name: &'static str,
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl ArtifactCache {
    pub fn new(name: &'static str, ttl: Duration, capacity: usize) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the live reference for `key`. An expired entry is removed and
    /// reported as a miss.
    pub fn get(&self, key: &str) -> Option<DeliveryRef> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                debug!(event = "artifact_cache_expired", cache = self.name, key = %key);
                None
            }
            Some(entry) => Some(entry.reference.clone()),
            None => None,
        }
    }

    pub fn put(&self, key: impl Into<String>, reference: DeliveryRef) {
        let key = key.into();
        if key.is_empty() || reference.as_str().is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        entries.insert(
            key,
            CacheEntry {
                reference,
                expires_at: Instant::now() + self.ttl,
            },
        );
        if entries.len() > self.capacity {
            let removed = prune_locked(&mut entries, self.capacity);
            debug!(event = "artifact_cache_pruned_on_put", cache = self.name, removed);
        }
    }

    pub fn remove(&self, key: &str) -> Option<DeliveryRef> {
        self.entries.lock().remove(key).map(|e| e.reference)
    }

    /// Drops expired entries, then the entries closest to expiry until at most
    /// `max_items` remain. Returns how many were removed.
    pub fn prune(&self, max_items: usize) -> usize {
        let removed = prune_locked(&mut self.entries.lock(), max_items);
        info!(event = "artifact_cache_pruned", cache = self.name, removed, max_items);
        removed
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let removed = entries.len();
        entries.clear();
        info!(event = "artifact_cache_cleared", cache = self.name, removed);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn prune_locked(entries: &mut HashMap<String, CacheEntry>, max_items: usize) -> usize {
    let now = Instant::now();
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));

    if entries.len() > max_items {
        let mut by_expiry: Vec<(Instant, String)> = entries
            .iter()
            .map(|(key, entry)| (entry.expires_at, key.clone()))
            .collect();
        by_expiry.sort();
        let overflow = entries.len() - max_items;
        for (_, key) in by_expiry.into_iter().take(overflow) {
            entries.remove(&key);
        }
    }
    before - entries.len()
}
