//! Time-bounded fingerprint cache for duplicate suppression.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How long a fingerprint suppresses duplicates.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// A set of message fingerprints that forgets entries after a TTL.
///
/// Expired entries are swept lazily on insert, so the cache never grows
/// beyond what one TTL window of traffic produces.
pub struct TimedCache {
    ttl: Duration,
    entries: HashMap<[u8; 32], Instant>,
    last_sweep: Instant,
}

impl TimedCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }

    pub fn contains(&self, fp: &[u8; 32]) -> bool {
        match self.entries.get(fp) {
            Some(at) => at.elapsed() < self.ttl,
            None => false,
        }
    }

    /// Record a fingerprint. Returns false when it was already present
    /// (and unexpired).
    pub fn insert(&mut self, fp: [u8; 32]) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_sweep) > self.ttl / 2 {
            self.entries.retain(|_, at| now.duration_since(*at) < self.ttl);
            self.last_sweep = now;
        }
        match self.entries.get_mut(&fp) {
            Some(at) if now.duration_since(*at) < self.ttl => false,
            Some(at) => {
                *at = now;
                true
            }
            None => {
                self.entries.insert(fp, now);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TimedCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_contains() {
        let mut cache = TimedCache::default();
        let fp = [7u8; 32];
        assert!(!cache.contains(&fp));
        assert!(cache.insert(fp));
        assert!(cache.contains(&fp));
        assert!(!cache.insert(fp), "second insert reports duplicate");
    }

    #[test]
    fn entries_expire() {
        let mut cache = TimedCache::new(Duration::from_millis(10));
        let fp = [1u8; 32];
        cache.insert(fp);
        std::thread::sleep(Duration::from_millis(25));
        assert!(!cache.contains(&fp));
        assert!(cache.insert(fp), "expired entry accepts re-insert");
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let mut cache = TimedCache::new(Duration::from_millis(10));
        for i in 0..16u8 {
            let mut fp = [0u8; 32];
            fp[0] = i;
            cache.insert(fp);
        }
        std::thread::sleep(Duration::from_millis(25));
        // The insert after the sweep window purges everything stale.
        cache.insert([0xffu8; 32]);
        assert_eq!(cache.len(), 1);
    }
}
