
use moka::notification::RemovalCause;
use moka::sync::Cache;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// moka refuses lifetimes past 1000 years
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Where a cached vector came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingSource {
    Model,
    Fallback,
}

#[derive(Debug)]
struct CacheEntry {
    vector: Vec<f32>,
    source: EmbeddingSource,
    /// Logical clock value of the most recent insert or hit
    last_access: AtomicU64,
    hit_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl Counters {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Bounded embedding cache keyed by the blake3 hash of the exact input text.
///
/// Storage and TTL expiry are moka's. Capacity is enforced here instead of
/// through moka's admission policy, which may reject the entry just written:
/// the victim is the live entry with the lowest combined frequency and
/// recency score, and the most recently touched entry is never chosen while
/// others remain.
pub struct EmbeddingCache {
    entries: Cache<String, Arc<CacheEntry>>,
    counters: Arc<Counters>,
    /// Single writer for inserts and purges
    writer: Mutex<()>,
    max_entries: usize,
}

impl fmt::Debug for EmbeddingCache {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("max_entries", &self.max_entries)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl EmbeddingCache {
    #[inline]
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let counters = Arc::new(Counters::default());
        let listener_counters = Arc::clone(&counters);
        let entries: Cache<String, Arc<CacheEntry>> = Cache::builder()
            .time_to_live(ttl.min(MAX_TTL))
            .eviction_listener(move |_key, _value, cause| {
                if matches!(cause, RemovalCause::Expired) {
                    listener_counters
                        .expirations
                        .fetch_add(1, Ordering::Relaxed);
                }
            })
            .build();

        Self {
            entries,
            counters,
            writer: Mutex::new(()),
            max_entries: max_entries.max(1),
        }
    }

    /// Cache key for a piece of text
    #[inline]
    pub fn key(text: &str) -> String {
        blake3::hash(text.as_bytes()).to_hex().to_string()
    }

    #[inline]
    pub fn get(&self, text: &str) -> Option<(Vec<f32>, EmbeddingSource)> {
        let now = self.counters.tick();
        match self.entries.get(&Self::key(text)) {
            Some(entry) => {
                entry.hit_count.fetch_add(1, Ordering::Relaxed);
                entry.last_access.store(now, Ordering::Relaxed);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some((entry.vector.clone(), entry.source))
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace a vector, evicting when the cache is full
    #[inline]
    pub fn insert(&self, text: &str, vector: Vec<f32>, source: EmbeddingSource) {
        let key = Self::key(text);
        let _writer = self.write_lock();
        let now = self.counters.tick();

        let hit_count = match self.entries.get(&key) {
            Some(existing) => existing.hit_count.load(Ordering::Relaxed),
            None => {
                self.make_room();
                0
            }
        };

        self.entries.insert(
            key,
            Arc::new(CacheEntry {
                vector,
                source,
                last_access: AtomicU64::new(now),
                hit_count: AtomicU64::new(hit_count),
            }),
        );
    }

    fn make_room(&self) {
        // Expired entries are never visited, so they give up their slot first
        while self.len() >= self.max_entries {
            let Some(victim) = self.choose_victim() else {
                break;
            };
            self.entries.invalidate(victim.as_str());
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Evicted embedding cache entry {}", victim);
        }
    }

    fn choose_victim(&self) -> Option<Arc<String>> {
        let live: Vec<(Arc<String>, u64, u64)> = self
            .entries
            .iter()
            .map(|(key, entry)| {
                (
                    key,
                    entry.last_access.load(Ordering::Relaxed),
                    entry.hit_count.load(Ordering::Relaxed),
                )
            })
            .collect();
        let newest = live.iter().map(|(_, last_access, _)| *last_access).max()?;
        let clock = self.counters.clock.load(Ordering::Relaxed).max(1) as f64;
        let only_one = live.len() == 1;

        live.into_iter()
            .filter(|(_, last_access, _)| only_one || *last_access != newest)
            .map(|(key, last_access, hits)| {
                let frequency = (1.0 + hits as f64).ln();
                let recency = last_access as f64 / clock;
                (key, frequency + recency, last_access)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.2.cmp(&b.2)))
            .map(|(key, _, _)| key)
    }

    /// Remove every entry produced by `source`, returning how many were removed
    #[inline]
    pub fn purge_source(&self, source: EmbeddingSource) -> usize {
        let _writer = self.write_lock();
        let matching: Vec<Arc<String>> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.source == source)
            .map(|(key, _)| key)
            .collect();
        for key in &matching {
            self.entries.invalidate(key.as_str());
        }
        matching.len()
    }

    #[inline]
    pub fn clear(&self) {
        let _writer = self.write_lock();
        let keys: Vec<Arc<String>> = self.entries.iter().map(|(key, _)| key).collect();
        for key in &keys {
            self.entries.invalidate(key.as_str());
        }
    }

    /// Live entries; expired ones are not counted even before moka drops them
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.iter().count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn stats(&self) -> CacheStats {
        // Expired entries are reported to the listener during housekeeping
        self.entries.run_pending_tasks();
        CacheStats {
            entries: self.len(),
            capacity: self.max_entries,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }

    fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
