//! Cache store, key derivation and cacheable-call wrappers.
//!
//! [`CacheStore`] fronts Redis when it is reachable at construction and
//! an in-process moka cache otherwise. Values are encoded with
//! [`Encoded`] and stored under `"{category}:{key}"`, where `key` comes
//! from [`derive_key`]. [`CachedCall`] and [`AsyncCachedCall`] wrap an
//! operation so that repeated calls with equal arguments are served from
//! the store.

mod cached;
mod codec;
mod key;
mod store;

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

pub use cached::{AsyncCachedCall, CachedCall, KeyFn};
pub use codec::Encoded;
pub use key::{CacheCategory, CallArgs, KEY_NAMESPACE, derive_key};
pub use store::{Backend, CacheStats, CacheStore};

/// Configuration for [`CacheStore`].
///
/// ```rust
/// # use muninn::cache::{CacheCategory, CacheConfig};
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .without_redis()
///     .ttl(CacheCategory::Stats, Duration::from_secs(60));
/// assert_eq!(config.ttl_for(CacheCategory::Stats), Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Redis URL. `None` (or an empty string) means in-process only.
    #[serde(default = "default_redis_url")]
    pub redis_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub response_timeout_secs: u64,
    /// In-process entry count above which expired entries are pruned on write.
    #[serde(default = "default_cleanup_threshold")]
    pub fallback_cleanup_threshold: u64,
    /// Hard capacity of the in-process store.
    #[serde(default = "default_fallback_max_entries")]
    pub fallback_max_entries: u64,
    /// Per-category TTL overrides in seconds.
    #[serde(default)]
    pub ttl: HashMap<CacheCategory, u64>,
}

fn default_redis_url() -> Option<String> {
    Some("redis://localhost:6379".to_string())
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_cleanup_threshold() -> u64 {
    1000
}

fn default_fallback_max_entries() -> u64 {
    100_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            connect_timeout_secs: default_timeout_secs(),
            response_timeout_secs: default_timeout_secs(),
            fallback_cleanup_threshold: default_cleanup_threshold(),
            fallback_max_entries: default_fallback_max_entries(),
            ttl: HashMap::new(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the given Redis URL as primary backend.
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Never contact Redis; use the in-process store only.
    pub fn without_redis(mut self) -> Self {
        self.redis_url = None;
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    pub fn fallback_cleanup_threshold(mut self, n: u64) -> Self {
        self.fallback_cleanup_threshold = n;
        self
    }

    /// Override the default TTL of a category.
    pub fn ttl(mut self, category: CacheCategory, ttl: Duration) -> Self {
        self.ttl.insert(category, ttl.as_secs());
        self
    }

    /// Effective TTL for a category.
    pub fn ttl_for(&self, category: CacheCategory) -> Duration {
        self.ttl
            .get(&category)
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| category.default_ttl())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    /// The configured Redis URL, treating an empty string as unset.
    pub(crate) fn effective_redis_url(&self) -> Option<&str> {
        self.redis_url.as_deref().filter(|url| !url.trim().is_empty())
    }
}
