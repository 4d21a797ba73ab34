//! Bounded, time-to-live result cache.
//!
//! Keys are parameter fingerprints, not job ids, so an entry can outlive the
//! job that produced it. Eviction drops the oldest *insertion* first; reads
//! do not refresh an entry. Expired entries are purged when read.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    data: V,
    inserted_at: Instant,
    ttl: Duration,
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < self.ttl
    }
}

/// Hit/miss counters exposed to the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug)]
pub struct ResultCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Insertion order: seq -> key.
    insertion: BTreeMap<u64, String>,
    next_seq: u64,
    max_size: usize,
    default_ttl: Duration,
    hits: u64,
    misses: u64,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            insertion: BTreeMap::new(),
            next_seq: 0,
            max_size,
            default_ttl,
            hits: 0,
            misses: 0,
        }
    }

    /// Look up `key`. An expired entry counts as a miss and is removed.
    pub fn get(&mut self, key: &str, now: Instant) -> Option<V> {
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => {
                self.hits += 1;
                Some(entry.data.clone())
            }
            Some(_) => {
                self.remove(key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Like [`get`](Self::get) but leaves the counters alone.
    pub fn contains(&self, key: &str, now: Instant) -> bool {
        self.entries.get(key).is_some_and(|e| e.is_live(now))
    }

    /// Insert or overwrite `key`. Overwriting counts as a fresh insertion.
    pub fn set(&mut self, key: impl Into<String>, data: V, ttl: Option<Duration>, now: Instant) {
        if self.max_size == 0 {
            return;
        }
        let key = key.into();
        self.remove(&key);

        while self.entries.len() >= self.max_size {
            let Some((_, oldest)) = self.insertion.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            tracing::debug!(key = %oldest, "evicted oldest cache entry");
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.insertion.insert(seq, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                data,
                inserted_at: now,
                ttl: ttl.unwrap_or(self.default_ttl),
                seq,
            },
        );
    }

    /// Drop entries whose key contains `pattern`, or everything when `None`.
    /// Returns how many entries were removed.
    pub fn invalidate(&mut self, pattern: Option<&str>) -> usize {
        let Some(pattern) = pattern else {
            let removed = self.entries.len();
            self.entries.clear();
            self.insertion.clear();
            return removed;
        };

        let doomed: Vec<String> = self
            .entries
            .keys()
            .filter(|key| key.contains(pattern))
            .cloned()
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    fn remove(&mut self, key: &str) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.insertion.remove(&entry.seq);
        Some(entry.data)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }
}
