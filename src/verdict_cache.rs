//! Process-wide fingerprint → verdict cache.
//!
//! Sits in front of OCR and the store so repeated content skips extraction.
//!
//! Key properties:
//! - Bounded by entry count, least-recently-used entry evicted first
//! - Every entry expires after its own TTL, whichever limit hits first
//! - Last writer wins; readers never block each other for long
//! - Degraded verdicts are refused, they do not describe the content
//! - Cleared at shutdown, after the dispatcher has drained

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::{ContentFingerprint, Verdict};

// ═══════════════════════════════════════════════════════════
// Entry bookkeeping
// ═══════════════════════════════════════════════════════════

struct CacheEntry {
    verdict: Verdict,
    expires_at: Instant,
    /// Position in the recency index.
    tick: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<ContentFingerprint, CacheEntry>,
    /// tick → fingerprint, oldest first.
    recency: BTreeMap<u64, ContentFingerprint>,
    next_tick: u64,
}

impl CacheInner {
    fn touch(&mut self, fingerprint: &ContentFingerprint) {
        self.next_tick += 1;
        let tick = self.next_tick;
        if let Some(entry) = self.entries.get_mut(fingerprint) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, fingerprint.clone());
        }
    }

    fn remove(&mut self, fingerprint: &ContentFingerprint) {
        if let Some(entry) = self.entries.remove(fingerprint) {
            self.recency.remove(&entry.tick);
        }
    }

    fn evict_oldest(&mut self) -> bool {
        let oldest = match self.recency.iter().next() {
            Some((&tick, fp)) => (tick, fp.clone()),
            None => return false,
        };
        self.recency.remove(&oldest.0);
        self.entries.remove(&oldest.1);
        true
    }
}

/// Snapshot of cache counters, logged at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

// ═══════════════════════════════════════════════════════════
// VerdictCache
// ═══════════════════════════════════════════════════════════

pub struct VerdictCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl VerdictCache {
    /// Capacity is clamped to at least one entry.
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity: capacity.max(1),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up a live verdict and mark it recently used.
    pub fn get(&self, fingerprint: &ContentFingerprint) -> Option<Verdict> {
        self.get_at(fingerprint, Instant::now())
    }

    /// Insert or replace with an explicit TTL.
    pub fn put(&self, fingerprint: ContentFingerprint, verdict: Verdict, ttl: Duration) {
        self.put_at(fingerprint, verdict, ttl, Instant::now());
    }

    /// Insert or replace with the configured TTL.
    pub fn insert(&self, fingerprint: ContentFingerprint, verdict: Verdict) {
        self.put(fingerprint, verdict, self.default_ttl);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.recency.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn get_at(&self, fingerprint: &ContentFingerprint, now: Instant) -> Option<Verdict> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => {
                // A poisoned cache behaves as empty; the store stays authoritative.
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let live = match inner.entries.get(fingerprint) {
            Some(entry) if entry.expires_at > now => Some(entry.verdict.clone()),
            Some(_) => {
                inner.remove(fingerprint);
                None
            }
            None => None,
        };

        match live {
            Some(verdict) => {
                inner.touch(fingerprint);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(verdict)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put_at(&self, fingerprint: ContentFingerprint, verdict: Verdict, ttl: Duration, now: Instant) {
        if verdict.degraded {
            tracing::debug!(fingerprint = %fingerprint, "Refusing to cache degraded verdict");
            return;
        }

        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        inner.remove(&fingerprint);

        // Expired entries go first, then least recently used.
        if inner.entries.len() >= self.capacity {
            let expired: Vec<ContentFingerprint> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.expires_at <= now)
                .map(|(fp, _)| fp.clone())
                .collect();
            for fp in &expired {
                inner.remove(fp);
            }
        }
        while inner.entries.len() >= self.capacity {
            if !inner.evict_oldest() {
                break;
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        inner.next_tick += 1;
        let tick = inner.next_tick;
        inner.recency.insert(tick, fingerprint.clone());
        inner.entries.insert(
            fingerprint,
            CacheEntry {
                verdict,
                expires_at: now + ttl,
                tick,
            },
        );
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VerdictKind;
    use std::sync::Arc;

    fn fp(s: &str) -> ContentFingerprint {
        ContentFingerprint::from_hex(s)
    }

    fn flagged(reason: &str) -> Verdict {
        Verdict::new(VerdictKind::Flagged, reason)
    }

    #[test]
    fn get_returns_inserted_verdict() {
        let cache = VerdictCache::new(4, Duration::from_secs(60));
        cache.insert(fp("a"), flagged("spam"));
        assert_eq!(cache.get(&fp("a")), Some(flagged("spam")));
        assert_eq!(cache.get(&fp("b")), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let cache = VerdictCache::new(2, Duration::from_secs(60));
        cache.insert(fp("a"), flagged("a"));
        cache.insert(fp("b"), flagged("b"));
        // Touch "a" so "b" becomes the oldest
        assert!(cache.get(&fp("a")).is_some());
        cache.insert(fp("c"), flagged("c"));

        assert!(cache.get(&fp("a")).is_some());
        assert!(cache.get(&fp("b")).is_none());
        assert!(cache.get(&fp("c")).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = VerdictCache::new(4, Duration::from_secs(60));
        let start = Instant::now();
        cache.put_at(fp("a"), flagged("a"), Duration::from_secs(5), start);

        assert!(cache.get_at(&fp("a"), start + Duration::from_secs(4)).is_some());
        assert!(cache.get_at(&fp("a"), start + Duration::from_secs(5)).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn expired_entries_make_room_before_lru() {
        let cache = VerdictCache::new(2, Duration::from_secs(60));
        let start = Instant::now();
        cache.put_at(fp("short"), flagged("s"), Duration::from_secs(1), start);
        cache.put_at(fp("long"), flagged("l"), Duration::from_secs(100), start);
        cache.put_at(fp("new"), flagged("n"), Duration::from_secs(100), start + Duration::from_secs(2));

        let later = start + Duration::from_secs(3);
        assert!(cache.get_at(&fp("long"), later).is_some());
        assert!(cache.get_at(&fp("new"), later).is_some());
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn last_writer_wins() {
        let cache = VerdictCache::new(4, Duration::from_secs(60));
        cache.insert(fp("a"), flagged("first"));
        cache.insert(fp("a"), Verdict::new(VerdictKind::Escalate, "second"));
        assert_eq!(cache.get(&fp("a")).unwrap().rationale, "second");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn degraded_verdicts_are_not_cached() {
        let cache = VerdictCache::new(4, Duration::from_secs(60));
        cache.insert(fp("a"), Verdict::degraded(VerdictKind::Clean, "OCR timed out"));
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_empties_cache() {
        let cache = VerdictCache::new(4, Duration::from_secs(60));
        cache.insert(fp("a"), flagged("a"));
        cache.insert(fp("b"), flagged("b"));
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(&fp("a")).is_none());
    }

    #[test]
    fn zero_capacity_clamped() {
        let cache = VerdictCache::new(0, Duration::from_secs(60));
        assert_eq!(cache.capacity(), 1);
        cache.insert(fp("a"), flagged("a"));
        cache.insert(fp("b"), flagged("b"));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&fp("b")).is_some());
    }

    #[test]
    fn concurrent_access_stays_within_capacity() {
        let cache = Arc::new(VerdictCache::new(16, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let key = fp(&format!("{t}-{i}"));
                        cache.insert(key.clone(), flagged("x"));
                        cache.get(&key);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.len() <= 16);
    }
}
