//! Telemetry metric name constants.
//!
//! Centralised metric names for muninn operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `muninn_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `category`: cache category tag (e.g. "knowledge_base", "stats")
//! - `backend`: cache backend: "redis" or "memory"
//! - `pass`: warming pass: "knowledge_base", "intent_detection", "database_queries", "related"
//! - `status`: outcome: "warmed", "skipped" or "failed"
//! - `client`: API client name: "generation" or "retrieval"

/// Total cache hits.
///
/// Labels: `category`.
pub const CACHE_HITS_TOTAL: &str = "muninn_cache_hits_total";

/// Total cache misses.
///
/// Labels: `category`.
pub const CACHE_MISSES_TOTAL: &str = "muninn_cache_misses_total";

/// Total cache backend errors (degraded to a miss or a failed write).
///
/// Labels: `category`, `backend`.
pub const CACHE_ERRORS_TOTAL: &str = "muninn_cache_errors_total";

/// Total warming items processed.
///
/// Labels: `pass`, `status` ("warmed" | "skipped" | "failed").
pub const WARMING_ITEMS_TOTAL: &str = "muninn_warming_items_total";

/// Duration of a full warming cycle in seconds.
pub const WARMING_CYCLE_SECONDS: &str = "muninn_warming_cycle_seconds";

/// Total database connections checked out of the pool.
pub const POOL_ACQUIRED_TOTAL: &str = "muninn_pool_acquired_total";

/// Time spent waiting for a free pool slot, in seconds.
pub const POOL_ACQUIRE_WAIT_SECONDS: &str = "muninn_pool_acquire_wait_seconds";

/// Total retry attempts by API clients (not counting the initial request).
///
/// Labels: `client`.
pub const API_RETRIES_TOTAL: &str = "muninn_api_retries_total";
