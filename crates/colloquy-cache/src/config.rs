//! Configuration for TTL caches.

use std::time::Duration;

/// Default maximum number of entries held before LRU eviction.
pub const DEFAULT_MAX_ENTRIES: usize = 64;

/// Default time-to-live for cached entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Configuration for a [`TtlCache`](crate::TtlCache).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries to cache before LRU eviction.
    pub max_entries: usize,

    /// Optional time-to-live, measured from insertion.
    /// `None` means entries only leave through eviction or invalidation.
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: Some(DEFAULT_TTL),
        }
    }
}

impl CacheConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of entries.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Set the TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Disable time-based expiry.
    pub fn without_ttl(mut self) -> Self {
        self.ttl = None;
        self
    }
}
