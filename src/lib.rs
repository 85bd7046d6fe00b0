//! Muninn - caching and resource pooling for retrieval-backed assistants
//!
//! This crate provides a category-aware cache with a Redis primary and an
//! in-process fallback, wrappers that make any operation cacheable by its
//! arguments, a shared pool of database connections and API clients, and
//! a warmer that fills the caches ahead of demand.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use muninn::cache::{CacheCategory, CacheConfig, CacheStore, CachedCall};
//!
//! let store = Arc::new(CacheStore::connect(CacheConfig::default()));
//! let squares: CachedCall<u64, u64> =
//!     CachedCall::new(Arc::clone(&store), CacheCategory::Stats, "square");
//!
//! let first = squares.call(&12, || 12 * 12);
//! let again = squares.call(&12, || unreachable!("served from cache"));
//! assert_eq!(first, again);
//! ```
//!
//! # Daemon
//!
//! With the `server` feature, the `muninnd` binary loads [`Config`],
//! builds every component, warms the caches and runs the background
//! warmer until interrupted.

pub mod cache;
pub mod config;
pub mod error;
pub mod pool;
pub mod services;
pub mod telemetry;
pub mod warming;

// Re-export main types at crate root
pub use cache::{CacheCategory, CacheConfig, CacheStats, CacheStore, CachedCall, derive_key};
pub use config::Config;
pub use error::{MuninnError, Result};
pub use pool::{PoolStats, ResourcePool};
pub use services::CachedOperations;
pub use warming::{CacheWarmer, WarmerHandle, WarmingCorpus};
