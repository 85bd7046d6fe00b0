//! Cache categories and deterministic key derivation.
//!
//! Keys are content hashes of `(function, arguments)` so that equal
//! logical calls always map to the same entry, across processes and
//! restarts. Arguments are canonicalised through `serde_json::Value`,
//! whose maps are ordered by key, so neither struct field order nor
//! `HashMap` iteration order leaks into the key.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::Result;

/// Namespace tag prefixed to every derived key.
pub const KEY_NAMESPACE: &str = "muninn";

/// A named class of cached operation with its own default TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    /// Knowledge-base retrieval results. 24 hours.
    KnowledgeBase,
    /// Structured database query results. 1 hour.
    DatabaseQueries,
    /// Intent classification of free-text queries. 2 hours.
    IntentDetection,
    /// Generated answers. 6 hours.
    Responses,
    /// Aggregate statistics. 30 minutes.
    Stats,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 5] = [
        CacheCategory::KnowledgeBase,
        CacheCategory::DatabaseQueries,
        CacheCategory::IntentDetection,
        CacheCategory::Responses,
        CacheCategory::Stats,
    ];

    /// Stable tag used in storage keys and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::KnowledgeBase => "knowledge_base",
            CacheCategory::DatabaseQueries => "database_queries",
            CacheCategory::IntentDetection => "intent_detection",
            CacheCategory::Responses => "responses",
            CacheCategory::Stats => "stats",
        }
    }

    /// Default time-to-live for entries in this category.
    pub fn default_ttl(&self) -> Duration {
        let secs = match self {
            CacheCategory::KnowledgeBase => 86_400,
            CacheCategory::DatabaseQueries => 3_600,
            CacheCategory::IntentDetection => 7_200,
            CacheCategory::Responses => 21_600,
            CacheCategory::Stats => 1_800,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Positional and keyword arguments of a cacheable call.
///
/// Keyword arguments live in a `BTreeMap`, which fixes their order
/// regardless of the order they were supplied in.
///
/// ```rust
/// # use muninn::cache::CallArgs;
/// let a = CallArgs::new().arg("oil")?.kwarg("limit", &5)?.kwarg("kb", &"kb-1")?;
/// let b = CallArgs::new().arg("oil")?.kwarg("kb", &"kb-1")?.kwarg("limit", &5)?;
/// assert_eq!(a, b);
/// # Ok::<(), muninn::MuninnError>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallArgs {
    positional: Vec<Value>,
    keyword: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        self.positional.push(serde_json::to_value(value)?);
        Ok(self)
    }

    /// Set a keyword argument.
    pub fn kwarg<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Result<Self> {
        self.keyword
            .insert(name.to_string(), serde_json::to_value(value)?);
        Ok(self)
    }
}

/// Derive the cache key for a call of `function` with `args`.
///
/// Returns `muninn:<sha256 hex>` over `"{function}:{canonical args}"`.
/// Fails only if `args` cannot be represented as JSON (e.g. a map with
/// non-string keys); callers treat that as "not cacheable".
pub fn derive_key<A: Serialize + ?Sized>(function: &str, args: &A) -> Result<String> {
    let canonical = serde_json::to_value(args)?;
    let material = format!("{function}:{canonical}");
    let digest = Sha256::digest(material.as_bytes());
    Ok(format!("{KEY_NAMESPACE}:{}", hex::encode(digest)))
}
