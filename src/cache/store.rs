//! The cache store: Redis primary with an in-process fallback.
//!
//! # Backend selection
//!
//! The backend is chosen once, in [`CacheStore::connect`]: if Redis
//! answers a `PING` within the connect timeout it becomes the primary
//! for the lifetime of the store, otherwise the moka fallback is used.
//! A store never switches backends after construction.
//!
//! # Sync and async paths
//!
//! [`get`](CacheStore::get) and [`set`](CacheStore::set) are blocking
//! and must run off the async executor (see
//! [`tokio::task::spawn_blocking`]). [`get_async`](CacheStore::get_async)
//! and [`set_async`](CacheStore::set_async) talk to Redis over a lazily
//! established multiplexed connection and silently do nothing when Redis
//! is unreachable; they never touch the fallback.
//!
//! # Failure handling
//!
//! No operation propagates a backend or codec failure. Reads degrade to a
//! miss, writes report `false`, and both are counted in
//! [`CacheStats::errors`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use redis::aio::MultiplexedConnection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use super::codec::Encoded;
use super::key::{CacheCategory, KEY_NAMESPACE};
use super::CacheConfig;
use crate::telemetry;
use crate::{MuninnError, Result};

const SCAN_BATCH: u64 = 100;

/// Which storage backend a [`CacheStore`] is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Redis,
    Memory,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Redis => "redis",
            Backend::Memory => "memory",
        }
    }
}

/// Point-in-time statistics for a [`CacheStore`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub total_requests: u64,
    /// Percentage of requests served from cache, 0 when there were none.
    pub hit_rate: f64,
    pub backend: Backend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_memory_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_keys: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_cache_size: Option<u64>,
}

/// An in-process entry: the encoded payload and the TTL it was written with.
#[derive(Clone)]
struct FallbackEntry {
    payload: Encoded,
    ttl: Duration,
}

/// Expires each fallback entry after its own TTL, restarting on overwrite.
struct EntryExpiry;

impl moka::Expiry<String, FallbackEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &FallbackEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &FallbackEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

type FallbackCache = moka::sync::Cache<String, FallbackEntry>;

/// Blocking Redis access over a single lazily (re)opened connection.
struct RedisPrimary {
    client: redis::Client,
    conn: Mutex<Option<redis::Connection>>,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl RedisPrimary {
    /// Open a connection and `PING` it. Any failure means Redis is unusable.
    fn probe(client: redis::Client, config: &CacheConfig) -> Result<Self> {
        let primary = Self {
            client,
            conn: Mutex::new(None),
            connect_timeout: config.connect_timeout(),
            response_timeout: config.response_timeout(),
        };
        let pong: String = primary.run(|conn| redis::cmd("PING").query(conn))?;
        if pong != "PONG" {
            return Err(MuninnError::Redis(format!("unexpected PING reply: {pong}")));
        }
        Ok(primary)
    }

    fn open(&self) -> Result<redis::Connection> {
        let conn = self.client.get_connection_with_timeout(self.connect_timeout)?;
        conn.set_read_timeout(Some(self.response_timeout))?;
        conn.set_write_timeout(Some(self.response_timeout))?;
        Ok(conn)
    }

    fn lock(&self) -> MutexGuard<'_, Option<redis::Connection>> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                // A panic mid-command leaves the connection state unknown.
                let mut guard = poisoned.into_inner();
                *guard = None;
                guard
            }
        }
    }

    /// Run a command, reopening the connection if the previous one broke.
    fn run<T>(
        &self,
        command: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T> {
        let mut guard = self.lock();
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(MuninnError::BackendUnavailable(
                "Redis connection missing".to_string(),
            ));
        };
        match command(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() || e.is_timeout() {
                    *guard = None;
                }
                Err(e.into())
            }
        }
    }

    fn get(&self, key: &str) -> Result<Option<Encoded>> {
        let raw: Option<String> = self.run(|conn| redis::cmd("GET").arg(key).query(conn))?;
        raw.map(|raw| Encoded::from_wire(&raw)).transpose()
    }

    fn set(&self, key: &str, payload: &Encoded, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            // Zero TTL means "never serve": drop any previous value.
            return self.run(|conn| redis::cmd("DEL").arg(key).query::<()>(conn));
        }
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        self.run(|conn| {
            redis::cmd("PSETEX")
                .arg(key)
                .arg(millis)
                .arg(payload.to_wire())
                .query::<()>(conn)
        })
    }

    /// Delete every key matching a glob `pattern`, returning the count removed.
    fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let mut deleted: u64 = 0;
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = self.run(|conn| {
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query(conn)
            })?;

            if !keys.is_empty() {
                let count: u64 = self.run(|conn| redis::cmd("DEL").arg(&keys).query(conn))?;
                deleted += count;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(deleted)
    }

    fn used_memory_mb(&self) -> Result<f64> {
        let info: String = self.run(|conn| redis::cmd("INFO").arg("memory").query(conn))?;
        let bytes = info
            .lines()
            .find_map(|line| line.strip_prefix("used_memory:"))
            .and_then(|value| value.trim().parse::<f64>().ok())
            .ok_or_else(|| MuninnError::Redis("INFO memory has no used_memory".to_string()))?;
        Ok((bytes / (1024.0 * 1024.0) * 100.0).round() / 100.0)
    }

    fn key_count(&self) -> Result<u64> {
        self.run(|conn| redis::cmd("DBSIZE").query(conn))
    }
}

/// Cache store with Redis primary and in-process fallback.
///
/// Thread-safe: share it behind an `Arc`.
pub struct CacheStore {
    config: CacheConfig,
    backend: Backend,
    primary: Option<RedisPrimary>,
    fallback: FallbackCache,
    /// Client for the async path; present whenever a Redis URL is configured.
    async_client: Option<redis::Client>,
    async_conn: OnceCell<MultiplexedConnection>,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl CacheStore {
    /// Create a store, probing Redis if a URL is configured.
    ///
    /// Blocks for at most the connect timeout. Never fails: an
    /// unreachable or misconfigured Redis selects the in-process backend.
    pub fn connect(config: CacheConfig) -> Self {
        let client = match config.effective_redis_url() {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!(error = %e, "invalid Redis URL, using in-process cache");
                    None
                }
            },
            None => None,
        };

        let primary = client.clone().and_then(|client| {
            match RedisPrimary::probe(client, &config) {
                Ok(primary) => {
                    info!("Redis cache connected");
                    Some(primary)
                }
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, using in-process cache");
                    None
                }
            }
        });

        Self::assemble(config, primary, client)
    }

    /// Create a store that only uses the in-process backend.
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::assemble(config.without_redis(), None, None)
    }

    fn assemble(
        config: CacheConfig,
        primary: Option<RedisPrimary>,
        async_client: Option<redis::Client>,
    ) -> Self {
        let backend = if primary.is_some() {
            Backend::Redis
        } else {
            Backend::Memory
        };
        let fallback = moka::sync::Cache::builder()
            .max_capacity(config.fallback_max_entries)
            .expire_after(EntryExpiry)
            .build();

        Self {
            config,
            backend,
            primary,
            fallback,
            async_client,
            async_conn: OnceCell::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Fetch and decode an entry. Blocking.
    ///
    /// Returns `None` on a miss, an expired entry, or any backend or
    /// decode failure.
    pub fn get<T: DeserializeOwned>(&self, category: CacheCategory, key: &str) -> Option<T> {
        let lookup = self
            .fetch_payload(&storage_key(category, key))
            .and_then(|payload| payload.map(|p| p.decode::<T>()).transpose());

        match lookup {
            Ok(Some(value)) => {
                self.record_hit(category);
                Some(value)
            }
            Ok(None) => {
                self.record_miss(category);
                None
            }
            Err(e) => {
                error!(category = %category, key, error = %e, "cache get failed");
                self.record_error(category);
                None
            }
        }
    }

    /// Whether an unexpired entry exists. Blocking; counts as a lookup.
    pub fn contains(&self, category: CacheCategory, key: &str) -> bool {
        match self.fetch_payload(&storage_key(category, key)) {
            Ok(Some(_)) => {
                self.record_hit(category);
                true
            }
            Ok(None) => {
                self.record_miss(category);
                false
            }
            Err(e) => {
                error!(category = %category, key, error = %e, "cache lookup failed");
                self.record_error(category);
                false
            }
        }
    }

    /// Encode and store a value. Blocking.
    ///
    /// `ttl` defaults to the category's TTL. A zero TTL stores nothing
    /// retrievable. Returns whether the write succeeded.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        category: CacheCategory,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let ttl = ttl.unwrap_or_else(|| self.config.ttl_for(category));
        let storage_key = storage_key(category, key);

        let result = Encoded::encode(value).and_then(|payload| match &self.primary {
            Some(primary) => primary.set(&storage_key, &payload, ttl),
            None => {
                self.fallback_insert(storage_key.clone(), payload, ttl);
                Ok(())
            }
        });

        match result {
            Ok(()) => {
                debug!(category = %category, key = %storage_key, ttl_secs = ttl.as_secs(), "cache set");
                true
            }
            Err(e) => {
                error!(category = %category, key, error = %e, "cache set failed");
                self.record_error(category);
                false
            }
        }
    }

    /// Remove every entry whose storage key contains `pattern`. Blocking.
    ///
    /// Returns the number of entries removed, or 0 on failure.
    pub fn invalidate_pattern(&self, pattern: &str) -> u64 {
        let result = match &self.primary {
            Some(primary) => primary.delete_matching(&format!("*{}*", escape_glob(pattern))),
            None => Ok(self.fallback_remove_where(|key| key.contains(pattern))),
        };
        match result {
            Ok(removed) => {
                info!(pattern, removed, "invalidated cache entries");
                removed
            }
            Err(e) => {
                error!(pattern, error = %e, "cache invalidation failed");
                self.errors.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Remove every entry in this namespace and reset the counters. Blocking.
    ///
    /// Returns `false` if any category could not be cleared.
    pub fn clear_all(&self) -> bool {
        let mut cleared = true;
        match &self.primary {
            Some(primary) => {
                for category in CacheCategory::ALL {
                    let pattern = format!("{}:{KEY_NAMESPACE}:*", category.as_str());
                    if let Err(e) = primary.delete_matching(&pattern) {
                        error!(category = %category, error = %e, "failed to clear category");
                        cleared = false;
                    }
                }
            }
            None => {
                self.fallback.invalidate_all();
                self.fallback.run_pending_tasks();
            }
        }
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        info!(cleared, "cleared cache");
        cleared
    }

    /// Snapshot of counters and backend details. Blocking when on Redis.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let hit_rate = if total_requests == 0 {
            0.0
        } else {
            hits as f64 / total_requests as f64 * 100.0
        };

        let mut stats = CacheStats {
            hits,
            misses,
            errors: self.errors.load(Ordering::Relaxed),
            total_requests,
            hit_rate,
            backend: self.backend,
            redis_memory_mb: None,
            redis_keys: None,
            memory_cache_size: None,
        };

        match &self.primary {
            Some(primary) => {
                match primary.used_memory_mb() {
                    Ok(mb) => stats.redis_memory_mb = Some(mb),
                    Err(e) => warn!(error = %e, "failed to read Redis memory usage"),
                }
                match primary.key_count() {
                    Ok(keys) => stats.redis_keys = Some(keys),
                    Err(e) => warn!(error = %e, "failed to read Redis key count"),
                }
            }
            None => {
                self.fallback.run_pending_tasks();
                stats.memory_cache_size = Some(self.fallback.entry_count());
            }
        }
        stats
    }

    /// Fetch and decode an entry from Redis without blocking.
    ///
    /// Returns `None` when Redis is unconfigured or unreachable.
    pub async fn get_async<T: DeserializeOwned>(
        &self,
        category: CacheCategory,
        key: &str,
    ) -> Option<T> {
        let mut conn = self.async_connection().await?;
        let storage_key = storage_key(category, key);

        let fetched = tokio::time::timeout(
            self.config.response_timeout(),
            redis::cmd("GET")
                .arg(&storage_key)
                .query_async::<Option<String>>(&mut conn),
        )
        .await;

        let lookup = match fetched {
            Ok(Ok(raw)) => raw
                .map(|raw| Encoded::from_wire(&raw).and_then(|p| p.decode::<T>()))
                .transpose(),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(MuninnError::BackendUnavailable(
                "Redis GET timed out".to_string(),
            )),
        };

        match lookup {
            Ok(Some(value)) => {
                self.record_hit(category);
                Some(value)
            }
            Ok(None) => {
                self.record_miss(category);
                None
            }
            Err(e) => {
                error!(category = %category, key, error = %e, "async cache get failed");
                self.record_error(category);
                None
            }
        }
    }

    /// Encode and store a value in Redis without blocking.
    ///
    /// Returns `false` when Redis is unconfigured, unreachable, or the
    /// write fails.
    pub async fn set_async<T: Serialize + ?Sized>(
        &self,
        category: CacheCategory,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let Some(mut conn) = self.async_connection().await else {
            return false;
        };
        let ttl = ttl.unwrap_or_else(|| self.config.ttl_for(category));
        let storage_key = storage_key(category, key);

        let payload = match Encoded::encode(value) {
            Ok(payload) => payload,
            Err(e) => {
                error!(category = %category, key, error = %e, "async cache encode failed");
                self.record_error(category);
                return false;
            }
        };

        let command = if ttl.is_zero() {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(&storage_key);
            cmd
        } else {
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            let mut cmd = redis::cmd("PSETEX");
            cmd.arg(&storage_key).arg(millis).arg(payload.to_wire());
            cmd
        };

        let written = tokio::time::timeout(
            self.config.response_timeout(),
            command.query_async::<()>(&mut conn),
        )
        .await;

        match written {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(category = %category, key, error = %e, "async cache set failed");
                self.record_error(category);
                false
            }
            Err(_) => {
                error!(category = %category, key, "async cache set timed out");
                self.record_error(category);
                false
            }
        }
    }

    async fn async_connection(&self) -> Option<MultiplexedConnection> {
        let client = self.async_client.as_ref()?;
        let timeout = self.config.connect_timeout();
        let conn = self
            .async_conn
            .get_or_try_init(|| async {
                match tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
                    .await
                {
                    Ok(Ok(conn)) => {
                        info!("async Redis connection established");
                        Ok(conn)
                    }
                    Ok(Err(e)) => Err(MuninnError::from(e)),
                    Err(_) => Err(MuninnError::BackendUnavailable(
                        "Redis connect timed out".to_string(),
                    )),
                }
            })
            .await;

        match conn {
            Ok(conn) => Some(conn.clone()),
            Err(e) => {
                debug!(error = %e, "async Redis unavailable");
                None
            }
        }
    }

    fn fetch_payload(&self, storage_key: &str) -> Result<Option<Encoded>> {
        match &self.primary {
            Some(primary) => primary.get(storage_key),
            None => Ok(self.fallback.get(storage_key).map(|entry| entry.payload)),
        }
    }

    fn fallback_insert(&self, storage_key: String, payload: Encoded, ttl: Duration) {
        self.fallback.insert(storage_key, FallbackEntry { payload, ttl });
        if self.fallback.entry_count() > self.config.fallback_cleanup_threshold {
            self.fallback.run_pending_tasks();
        }
    }

    fn fallback_remove_where(&self, matches: impl Fn(&str) -> bool) -> u64 {
        let doomed: Vec<String> = self
            .fallback
            .iter()
            .filter(|(key, _)| matches(key.as_str()))
            .map(|(key, _)| key.to_string())
            .collect();
        for key in &doomed {
            self.fallback.invalidate(key);
        }
        doomed.len() as u64
    }

    fn record_hit(&self, category: CacheCategory) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_HITS_TOTAL, "category" => category.as_str())
            .increment(1);
    }

    fn record_miss(&self, category: CacheCategory) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "category" => category.as_str())
            .increment(1);
    }

    fn record_error(&self, category: CacheCategory) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            telemetry::CACHE_ERRORS_TOTAL,
            "category" => category.as_str(),
            "backend" => self.backend.as_str()
        )
        .increment(1);
    }
}

fn storage_key(category: CacheCategory, key: &str) -> String {
    format!("{}:{key}", category.as_str())
}

/// Escape Redis glob metacharacters so `pattern` matches literally.
fn escape_glob(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> CacheStore {
        CacheStore::in_memory(CacheConfig::new())
    }

    #[test]
    fn unreachable_redis_selects_memory() {
        let config = CacheConfig::new()
            .redis_url("redis://127.0.0.1:1")
            .connect_timeout_secs(1);
        let store = CacheStore::connect(config);
        assert_eq!(store.backend(), Backend::Memory);
    }

    #[test]
    fn invalid_redis_url_selects_memory() {
        let store = CacheStore::connect(CacheConfig::new().redis_url("not a url"));
        assert_eq!(store.backend(), Backend::Memory);
    }

    #[test]
    fn empty_redis_url_is_unset() {
        let config = CacheConfig {
            redis_url: Some("  ".to_string()),
            ..CacheConfig::default()
        };
        assert_eq!(config.effective_redis_url(), None);
    }

    #[test]
    fn storage_key_is_category_prefixed() {
        assert_eq!(
            storage_key(CacheCategory::Responses, "muninn:abc"),
            "responses:muninn:abc"
        );
    }

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
        assert_eq!(escape_glob("plain"), "plain");
    }

    #[test]
    fn hit_rate_is_zero_without_requests() {
        let stats = memory_store().stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.hit_rate, 0.0);
        assert_eq!(stats.memory_cache_size, Some(0));
        assert_eq!(stats.redis_keys, None);
    }

    #[test]
    fn stats_serialize_backend_tag() {
        let json = serde_json::to_value(memory_store().stats()).unwrap();
        assert_eq!(json["backend"], "memory");
        assert!(json.get("redis_keys").is_none());
    }

    #[tokio::test]
    async fn async_path_is_noop_without_redis() {
        let store = memory_store();
        assert!(
            !store
                .set_async(CacheCategory::Stats, "k", &1, None)
                .await
        );
        assert_eq!(store.get_async::<i32>(CacheCategory::Stats, "k").await, None);
        // The sync fallback is not touched by the async path.
        assert_eq!(store.get::<i32>(CacheCategory::Stats, "k"), None);
    }
}
