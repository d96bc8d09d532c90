//! Insertion-time tracking for TTL expiry.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Tracks when each key was stored, for TTL-based expiry.
///
/// Uses the tokio clock so paused-time tests can advance it.
#[derive(Debug)]
pub struct TtlTracker {
    stored_at: HashMap<String, Instant>,
    ttl: Option<Duration>,
}

impl TtlTracker {
    /// Create a new tracker with the given TTL.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            stored_at: HashMap::new(),
            ttl,
        }
    }

    /// Record that `key` was (re)stored now.
    pub fn touch(&mut self, key: &str) {
        self.stored_at.insert(key.to_string(), Instant::now());
    }

    /// Check whether `key` has expired. Untracked keys count as expired.
    pub fn is_expired(&self, key: &str) -> bool {
        match self.ttl {
            None => false,
            Some(ttl) => match self.stored_at.get(key) {
                None => true,
                Some(at) => at.elapsed() >= ttl,
            },
        }
    }

    /// Stop tracking `key`.
    pub fn remove(&mut self, key: &str) {
        self.stored_at.remove(key);
    }

    /// Remove all expired keys and return them.
    pub fn drain_expired(&mut self) -> Vec<String> {
        let Some(ttl) = self.ttl else {
            return Vec::new();
        };
        let now = Instant::now();
        let expired: Vec<String> = self
            .stored_at
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.stored_at.remove(key);
        }
        expired
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.stored_at.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.stored_at.is_empty()
    }

    /// The configured TTL.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}
