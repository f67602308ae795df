//! Single-use nonce cache.
//!
//! Process-local and intentionally not persisted: the 30-second timestamp
//! window is the backstop if the cache is reset. Entries are evicted
//! lazily on insert and by a periodic sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// How long a nonce blocks replays.
pub const NONCE_TTL: Duration = Duration::from_secs(300);

/// How often the sweeper removes expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// In-memory nonce cache with TTL-based expiration.
pub struct NonceCache {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceCache {
    pub fn new() -> Self {
        Self::with_ttl(NONCE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Atomically test-and-insert. Returns `true` when the nonce is fresh;
    /// `false` means it was seen within the TTL (replay).
    pub fn check_and_add(&self, nonce: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if let Some(first_seen) = entries.get(nonce) {
            if now.duration_since(*first_seen) <= self.ttl {
                return false;
            }
        }
        entries.insert(nonce.to_string(), now);
        true
    }

    /// Remove entries older than the TTL.
    pub fn sweep(&self) {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        entries.retain(|_, first_seen| now.duration_since(*first_seen) <= self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the periodic sweeper. The task runs until aborted.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                cache.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_is_fresh_second_is_replay() {
        let cache = NonceCache::new();
        assert!(cache.check_and_add("nonce-1"));
        assert!(!cache.check_and_add("nonce-1"));
        assert!(cache.check_and_add("nonce-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn nonce_is_reusable_after_ttl() {
        let cache = NonceCache::new();
        assert!(cache.check_and_add("n"));
        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!cache.check_and_add("n"));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.check_and_add("n"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_expired_entries() {
        let cache = NonceCache::new();
        cache.check_and_add("old");
        tokio::time::advance(Duration::from_secs(301)).await;
        cache.check_and_add("new");
        cache.sweep();
        assert_eq!(cache.len(), 1);
    }
}
