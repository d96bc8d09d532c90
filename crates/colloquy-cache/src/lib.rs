//! Process-wide caches with LRU eviction and TTL expiry.
//!
//! Colloquy keeps a few short-lived, process-wide caches: adapter
//! instances for tool-less models and the tool lists fetched from remote
//! MCP servers. Both are read-mostly and must tolerate a miss at any
//! time, so the cache here never promises that an entry survives.
//!
//! # Example
//!
//! ```rust,ignore
//! use colloquy_cache::{CacheConfig, TtlCache};
//!
//! let cache: TtlCache<String> = TtlCache::new(
//!     CacheConfig::new()
//!         .with_max_entries(64)
//!         .with_ttl(Duration::from_secs(300)),
//! );
//!
//! let value = cache
//!     .get_or_try_insert_with("key", || async { Ok::<_, MyError>("v".to_string()) })
//!     .await?;
//! ```

mod cache;
mod config;
mod ttl;

pub use cache::{CacheStats, TtlCache};
pub use config::CacheConfig;
pub use ttl::TtlTracker;
