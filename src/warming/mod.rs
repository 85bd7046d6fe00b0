//! Cache warming: preloading the caches ahead of demand.
//!
//! A [`CacheWarmer`] runs the same [`CachedOperations`](crate::services::CachedOperations)
//! the request path uses, so a warmed entry is exactly the entry a later
//! request will hit. Warming runs once at startup ([`CacheWarmer::warm_on_startup`]),
//! optionally on a schedule, and for queries related to what users ask
//! (see [`WarmerHandle`]).

mod corpus;
mod keywords;
mod warmer;
mod worker;

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub use corpus::{WarmingCorpus, load_query_patterns};
pub use keywords::{extract_keywords, related_queries};
pub use warmer::{CacheWarmer, WarmingReport, WarmingStats};
pub use worker::WarmerHandle;

/// Default periodic warming interval (6 h).
pub const DEFAULT_WARM_INTERVAL: Duration = Duration::from_secs(6 * 3600);

/// `[warming]` configuration section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WarmingConfig {
    /// Seconds between periodic warming cycles.
    pub interval_secs: u64,
    /// Pending related-query requests before new ones are dropped.
    pub related_queue_size: usize,
    /// Log file mined for frequent queries at startup.
    pub query_log: Option<PathBuf>,
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_WARM_INTERVAL.as_secs(),
            related_queue_size: 32,
            query_log: None,
        }
    }
}

impl WarmingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
