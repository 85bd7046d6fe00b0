//! Wrappers that make an operation cacheable.
//!
//! A wrapper is bound to a store, a category and a function identity.
//! Calling it derives a key from the arguments, returns the stored value
//! on a hit, and otherwise runs the operation and stores its result.
//!
//! ```rust
//! # use std::sync::Arc;
//! # use muninn::cache::{CacheCategory, CacheConfig, CacheStore, CachedCall};
//! let store = Arc::new(CacheStore::in_memory(CacheConfig::new()));
//! let lookup: CachedCall<String, usize> =
//!     CachedCall::new(Arc::clone(&store), CacheCategory::Stats, "word_count");
//!
//! let text = "one two three".to_string();
//! assert_eq!(lookup.call(&text, || text.split_whitespace().count()), 3);
//! // Served from the store; the closure is not run.
//! assert_eq!(lookup.call(&text, || unreachable!()), 3);
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::key::{CacheCategory, derive_key};
use super::store::CacheStore;

/// Custom key derivation for a wrapper's argument type.
pub type KeyFn<A> = Arc<dyn Fn(&A) -> String + Send + Sync>;

/// Shared binding of a wrapper to its category, identity and TTL.
struct Keying<A: ?Sized> {
    category: CacheCategory,
    function: String,
    ttl: Option<Duration>,
    key_fn: Option<KeyFn<A>>,
}

impl<A: Serialize + ?Sized> Keying<A> {
    fn key_for(&self, args: &A) -> Option<String> {
        if let Some(key_fn) = &self.key_fn {
            return Some(key_fn(args));
        }
        match derive_key(&self.function, args) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(function = %self.function, error = %e, "arguments not cacheable, bypassing cache");
                None
            }
        }
    }
}

impl<A: ?Sized> Clone for Keying<A> {
    fn clone(&self) -> Self {
        Self {
            category: self.category,
            function: self.function.clone(),
            ttl: self.ttl,
            key_fn: self.key_fn.clone(),
        }
    }
}

/// A blocking cacheable call over the store's sync path.
///
/// `A` is the argument type hashed into the key, `T` the result type.
/// Call it from a blocking context (e.g. inside
/// [`tokio::task::spawn_blocking`]) since the store may do network I/O.
pub struct CachedCall<A: ?Sized, T> {
    store: Arc<CacheStore>,
    keying: Keying<A>,
    _result: PhantomData<fn() -> T>,
}

impl<A, T> CachedCall<A, T>
where
    A: Serialize + ?Sized,
    T: Serialize + DeserializeOwned,
{
    /// Bind to `store` under `category`, identified as `function`.
    pub fn new(store: Arc<CacheStore>, category: CacheCategory, function: impl Into<String>) -> Self {
        Self {
            store,
            keying: Keying {
                category,
                function: function.into(),
                ttl: None,
                key_fn: None,
            },
            _result: PhantomData,
        }
    }

    /// Store results for `ttl` instead of the category default.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.keying.ttl = Some(ttl);
        self
    }

    /// Derive keys with `key_fn` instead of hashing the arguments.
    pub fn key_fn(mut self, key_fn: impl Fn(&A) -> String + Send + Sync + 'static) -> Self {
        self.keying.key_fn = Some(Arc::new(key_fn));
        self
    }

    pub fn category(&self) -> CacheCategory {
        self.keying.category
    }

    /// The key a call with `args` reads and writes, if `args` are cacheable.
    pub fn key_for(&self, args: &A) -> Option<String> {
        self.keying.key_for(args)
    }

    /// Whether a call with `args` would currently be a hit.
    pub fn is_cached(&self, args: &A) -> bool {
        self.key_for(args)
            .is_some_and(|key| self.store.contains(self.keying.category, &key))
    }

    /// Return the cached result for `args`, or run `op` and cache its result.
    pub fn call(&self, args: &A, op: impl FnOnce() -> T) -> T {
        let Some(key) = self.key_for(args) else {
            return op();
        };
        if let Some(hit) = self.store.get::<T>(self.keying.category, &key) {
            return hit;
        }
        let value = op();
        self.store.set(self.keying.category, &key, &value, self.keying.ttl);
        value
    }

    /// Like [`call`](Self::call), but only successful results are cached.
    pub fn try_call<E>(&self, args: &A, op: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let Some(key) = self.key_for(args) else {
            return op();
        };
        if let Some(hit) = self.store.get::<T>(self.keying.category, &key) {
            return Ok(hit);
        }
        let value = op()?;
        self.store.set(self.keying.category, &key, &value, self.keying.ttl);
        Ok(value)
    }
}

impl<A: ?Sized, T> Clone for CachedCall<A, T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keying: self.keying.clone(),
            _result: PhantomData,
        }
    }
}

/// A non-blocking cacheable call over the store's async (Redis-only) path.
///
/// Without a reachable Redis every call runs the operation.
pub struct AsyncCachedCall<A: ?Sized, T> {
    store: Arc<CacheStore>,
    keying: Keying<A>,
    _result: PhantomData<fn() -> T>,
}

impl<A, T> AsyncCachedCall<A, T>
where
    A: Serialize + ?Sized,
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<CacheStore>, category: CacheCategory, function: impl Into<String>) -> Self {
        Self {
            store,
            keying: Keying {
                category,
                function: function.into(),
                ttl: None,
                key_fn: None,
            },
            _result: PhantomData,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.keying.ttl = Some(ttl);
        self
    }

    pub fn key_fn(mut self, key_fn: impl Fn(&A) -> String + Send + Sync + 'static) -> Self {
        self.keying.key_fn = Some(Arc::new(key_fn));
        self
    }

    pub fn key_for(&self, args: &A) -> Option<String> {
        self.keying.key_for(args)
    }

    /// Return the cached result for `args`, or await `op` and cache its result.
    pub async fn call<F, Fut>(&self, args: &A, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(key) = self.key_for(args) else {
            return op().await;
        };
        if let Some(hit) = self.store.get_async::<T>(self.keying.category, &key).await {
            return hit;
        }
        let value = op().await;
        self.store
            .set_async(self.keying.category, &key, &value, self.keying.ttl)
            .await;
        value
    }

    /// Like [`call`](Self::call), but only successful results are cached.
    pub async fn try_call<E, F, Fut>(&self, args: &A, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(key) = self.key_for(args) else {
            return op().await;
        };
        if let Some(hit) = self.store.get_async::<T>(self.keying.category, &key).await {
            return Ok(hit);
        }
        let value = op().await?;
        self.store
            .set_async(self.keying.category, &key, &value, self.keying.ttl)
            .await;
        Ok(value)
    }
}

impl<A: ?Sized, T> Clone for AsyncCachedCall<A, T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keying: self.keying.clone(),
            _result: PhantomData,
        }
    }
}
