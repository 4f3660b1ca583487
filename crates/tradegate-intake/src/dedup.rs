//! Sliding-window deduplication.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// Fingerprint -> claim time, bounded by periodic [`DedupCache::sweep`].
///
/// [`DedupCache::try_claim`] is atomic per fingerprint: of several callers
/// presenting the same fingerprint inside the window exactly one wins.
#[derive(Debug)]
pub struct DedupCache {
    window_ms: u64,
    entries: DashMap<String, u64>,
}

impl DedupCache {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            entries: DashMap::new(),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Claim `fingerprint` at `now_ms`. Returns `false` if it was already
    /// claimed within the window.
    pub fn try_claim(&self, fingerprint: &str, now_ms: u64) -> bool {
        match self.entries.entry(fingerprint.to_string()) {
            Entry::Occupied(mut e) => {
                if now_ms.saturating_sub(*e.get()) >= self.window_ms {
                    e.insert(now_ms);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(now_ms);
                true
            }
        }
    }

    /// Forget a claim so the same signal version can be evaluated again.
    pub fn release(&self, fingerprint: &str) {
        self.entries.remove(fingerprint);
    }

    pub fn contains(&self, fingerprint: &str, now_ms: u64) -> bool {
        self.entries
            .get(fingerprint)
            .map_or(false, |at| now_ms.saturating_sub(*at) < self.window_ms)
    }

    /// Evict entries older than the window. Returns the number evicted.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, at| now_ms.saturating_sub(*at) < self.window_ms);
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "Dedup cache swept");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const HOUR_MS: u64 = 3_600_000;

    #[test]
    fn test_claim_once_within_window() {
        let cache = DedupCache::new(HOUR_MS);
        assert!(cache.try_claim("fp", 0));
        assert!(!cache.try_claim("fp", 1_000));
        assert!(!cache.try_claim("fp", HOUR_MS - 1));
        assert!(cache.try_claim("fp", HOUR_MS));
    }

    #[test]
    fn test_release_allows_reclaim() {
        let cache = DedupCache::new(HOUR_MS);
        assert!(cache.try_claim("fp", 0));
        cache.release("fp");
        assert!(!cache.contains("fp", 1));
        assert!(cache.try_claim("fp", 1));
    }

    #[test]
    fn test_sweep_evicts_old_entries() {
        let cache = DedupCache::new(HOUR_MS);
        cache.try_claim("old", 0);
        cache.try_claim("new", HOUR_MS / 2);
        assert_eq!(cache.sweep(HOUR_MS + 1), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("new", HOUR_MS + 1));
        assert!(!cache.contains("old", HOUR_MS + 1));
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let cache = Arc::new(DedupCache::new(HOUR_MS));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.try_claim("fp", 10))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
