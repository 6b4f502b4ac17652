//! Replay cache for key-exchange nonces.
//!
//! The timestamp window alone still lets a captured KeyExchange be replayed for a
//! few seconds; this cache closes that gap by remembering every nonce it has
//! accepted until it expires.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    peer: String,
    nonce: [u8; 16],
}

/// TTL-bounded set of seen nonces with FIFO eviction at capacity
#[derive(Debug)]
pub struct ReplayCache {
    seen: HashMap<CacheKey, Instant>,
    order: VecDeque<CacheKey>,
    ttl: Duration,
    max_entries: usize,
}

impl ReplayCache {
    /// TTL of 5 minutes, well past the handshake timestamp window
    pub fn new() -> Self {
        Self::with_settings(Duration::from_secs(300), 10_000)
    }

    pub fn with_settings(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Record `nonce` for `peer`. Returns true if it was already seen.
    pub fn check_and_insert(&mut self, peer: &str, nonce: &[u8; 16]) -> bool {
        self.expire();

        let key = CacheKey {
            peer: peer.to_string(),
            nonce: *nonce,
        };
        if self.seen.contains_key(&key) {
            warn!(peer, "Replayed key-exchange nonce");
            return true;
        }

        while self.seen.len() >= self.max_entries {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.seen.remove(&oldest);
                }
                None => break,
            }
        }

        self.seen.insert(key.clone(), Instant::now());
        self.order.push_back(key);
        false
    }

    fn expire(&mut self) {
        let now = Instant::now();
        while let Some(front) = self.order.front() {
            match self.seen.get(front) {
                Some(added) if now.duration_since(*added) < self.ttl => break,
                _ => {
                    if let Some(key) = self.order.pop_front() {
                        self.seen.remove(&key);
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
        debug!("Replay cache cleared");
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_replay_detected_per_peer() {
        let mut cache = ReplayCache::with_settings(Duration::from_secs(60), 100);
        let nonce = [1u8; 16];

        assert!(!cache.check_and_insert("a", &nonce));
        assert!(cache.check_and_insert("a", &nonce));
        assert!(!cache.check_and_insert("b", &nonce));
    }

    #[test]
    fn test_entries_expire() {
        let mut cache = ReplayCache::with_settings(Duration::from_millis(10), 100);
        let nonce = [2u8; 16];

        assert!(!cache.check_and_insert("a", &nonce));
        thread::sleep(Duration::from_millis(20));
        assert!(!cache.check_and_insert("a", &nonce));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = ReplayCache::with_settings(Duration::from_secs(60), 5);
        for i in 0..10u8 {
            assert!(!cache.check_and_insert("peer", &[i; 16]));
        }
        assert_eq!(cache.len(), 5);
        // the first nonces were evicted, so they read as fresh again
        assert!(!cache.check_and_insert("peer", &[0u8; 16]));
        assert!(cache.check_and_insert("peer", &[9u8; 16]));
    }
}
