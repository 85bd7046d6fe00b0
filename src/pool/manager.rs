//! The resource pool manager.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, RwLockWriteGuard};

use futures_util::future::BoxFuture;
use serde::Serialize;
use tracing::{error, info, warn};

use super::clients::{ApiClient, ApiClientKind, ApiConfig, ClientSession};
use super::db::{ConnectionFactory, DatabaseConfig, DbConnection, DbPool, PooledConnection};
use super::postgres::PgConnector;
use crate::config::Config;
use crate::{MuninnError, Result};

/// Lifecycle of a [`ResourcePool`]'s database side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    /// Assembled; [`ResourcePool::initialize`] has not run.
    Uninitialized,
    Initializing,
    /// Database pool is open.
    Ready,
    /// Database initialization failed; database operations are refused.
    Degraded,
    /// [`ResourcePool::close_all`] has run.
    Closed,
}

/// Point-in-time view of a [`ResourcePool`].
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub state: PoolState,
    pub db_pool_available: bool,
    pub db_pool_status: &'static str,
    pub api_clients_available: bool,
    pub api_clients_status: &'static str,
    /// Unix seconds.
    pub timestamp: i64,
    pub min_connections: usize,
    pub max_connections: usize,
}

#[derive(Default)]
struct ApiClients {
    generation: Option<Arc<ApiClient>>,
    retrieval: Option<Arc<ApiClient>>,
}

impl ApiClients {
    fn build(config: &ApiConfig) -> Self {
        match ClientSession::new(config) {
            Ok(session) => {
                info!(region = %config.region, "API clients initialized");
                Self {
                    generation: Some(Arc::new(session.client(ApiClientKind::Generation))),
                    retrieval: Some(Arc::new(session.client(ApiClientKind::Retrieval))),
                }
            }
            Err(e) => {
                error!(error = %e, "failed to initialize API clients");
                Self::default()
            }
        }
    }

    fn get(&self, kind: ApiClientKind) -> Option<&Arc<ApiClient>> {
        match kind {
            ApiClientKind::Generation => self.generation.as_ref(),
            ApiClientKind::Retrieval => self.retrieval.as_ref(),
        }
    }

    fn all_present(&self) -> bool {
        self.generation.is_some() && self.retrieval.is_some()
    }
}

/// Owner of the database pool and the shared API clients.
///
/// Construct once with [`ResourcePool::connect`] or
/// [`ResourcePool::builder`], share behind an `Arc`, and call
/// [`close_all`](Self::close_all) at shutdown.
pub struct ResourcePool {
    state: RwLock<PoolState>,
    /// `None` when the database is disabled.
    connector: Option<Arc<dyn ConnectionFactory>>,
    db: OnceLock<Arc<DbPool>>,
    database: DatabaseConfig,
    api: ApiConfig,
    clients: Mutex<ApiClients>,
    closed: AtomicBool,
}

impl ResourcePool {
    pub fn builder() -> ResourcePoolBuilder {
        ResourcePoolBuilder::new()
    }

    /// Build from configuration using PostgreSQL for the database.
    pub async fn connect(config: &Config) -> Self {
        Self::builder()
            .database(config.database.clone())
            .api(config.api.clone())
            .build()
            .await
    }

    pub fn state(&self) -> PoolState {
        *self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open the database pool, moving to [`PoolState::Ready`] or
    /// [`PoolState::Degraded`].
    ///
    /// Only the first call on an uninitialized pool does anything. Never
    /// fails: a database that cannot be reached leaves the pool degraded.
    pub async fn initialize(&self) {
        {
            let mut state = self.write_state();
            if *state != PoolState::Uninitialized {
                return;
            }
            *state = PoolState::Initializing;
        }

        let opened = match &self.connector {
            Some(connector) => match DbPool::open(
                Arc::clone(connector),
                self.database.min_connections,
                self.database.max_connections,
            )
            .await
            {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!(error = %e, "database pool initialization failed, continuing without database");
                    None
                }
            },
            None => {
                info!("database disabled");
                None
            }
        };

        let superseded = {
            let mut state = self.write_state();
            if *state == PoolState::Closed {
                true
            } else {
                if let Some(db) = &opened {
                    // Only the call that left `Uninitialized` gets here.
                    let _ = self.db.set(Arc::clone(db));
                }
                *state = if opened.is_some() {
                    PoolState::Ready
                } else {
                    PoolState::Degraded
                };
                false
            }
        };
        if superseded {
            if let Some(db) = opened {
                db.close().await;
            }
        }
    }

    /// Whether database operations can currently be attempted.
    pub fn db_available(&self) -> bool {
        self.state() == PoolState::Ready && self.db.get().is_some()
    }

    fn db(&self) -> Result<&Arc<DbPool>> {
        if self.state() != PoolState::Ready {
            return Err(MuninnError::PoolUnavailable);
        }
        self.db.get().ok_or(MuninnError::PoolUnavailable)
    }

    /// Check out a database connection.
    ///
    /// Returns [`MuninnError::PoolUnavailable`] when the pool is degraded
    /// or closed. The connection is returned when the guard is dropped.
    pub async fn acquire_db_connection(&self) -> Result<PooledConnection> {
        self.db()?.acquire().await
    }

    /// Run `f` with a database connection, rolling back if it fails.
    ///
    /// ```rust,no_run
    /// # use muninn::pool::ResourcePool;
    /// # async fn example(pool: &ResourcePool) -> muninn::Result<()> {
    /// let rows = pool
    ///     .with_db_connection(|conn| Box::pin(async move {
    ///         conn.fetch_json("SELECT 1 AS one", &[]).await
    ///     }))
    ///     .await?;
    /// assert_eq!(rows[0]["one"], 1);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_db_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut dyn DbConnection) -> BoxFuture<'c, Result<T>>,
    {
        self.db()?.with_connection(f).await
    }

    /// The shared client for `kind`.
    ///
    /// If any client handle is absent, all of them are rebuilt first.
    /// Returns `None` if rebuilding fails.
    pub fn get_api_client(&self, kind: ApiClientKind) -> Option<Arc<ApiClient>> {
        let mut clients = self.lock_clients();
        if clients.get(kind).is_none() {
            warn!(client = %kind, "API client missing, reinitializing");
            *clients = ApiClients::build(&self.api);
        }
        clients.get(kind).cloned()
    }

    /// Drop all client handles so the next [`get_api_client`](Self::get_api_client) rebuilds them.
    pub fn invalidate_api_clients(&self) {
        *self.lock_clients() = ApiClients::default();
    }

    /// Probe each resource. Never fails.
    ///
    /// Keys: `database`, `generation`, `retrieval`.
    pub async fn health_check(&self) -> BTreeMap<String, bool> {
        let mut health = BTreeMap::new();

        let database = if self.db_available() {
            match self
                .with_db_connection(|conn| Box::pin(async move { conn.ping().await }))
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    error!(error = %e, "database health check failed");
                    false
                }
            }
        } else {
            false
        };
        health.insert("database".to_string(), database);

        let clients = self.lock_clients();
        for kind in ApiClientKind::ALL {
            health.insert(kind.name().to_string(), clients.get(kind).is_some());
        }
        health
    }

    pub fn pool_stats(&self) -> PoolStats {
        let state = self.state();
        let db_pool_available = self.db_available();
        let db_pool_status = match state {
            PoolState::Ready if db_pool_available => "healthy",
            PoolState::Closed => "closed",
            _ => "not_initialized",
        };
        let api_clients_available = self.lock_clients().all_present();

        PoolStats {
            state,
            db_pool_available,
            db_pool_status,
            api_clients_available,
            api_clients_status: if api_clients_available {
                "healthy"
            } else {
                "not_initialized"
            },
            timestamp: chrono::Utc::now().timestamp(),
            min_connections: self.database.min_connections,
            max_connections: self.database.max_connections,
        }
    }

    /// Close the database pool and drop client handles. Idempotent.
    pub async fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.write_state() = PoolState::Closed;
        if let Some(db) = self.db.get() {
            db.close().await;
        }
        self.invalidate_api_clients();
        info!("resource pool closed");
    }

    fn lock_clients(&self) -> MutexGuard<'_, ApiClients> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Builder for [`ResourcePool`].
pub struct ResourcePoolBuilder {
    database: DatabaseConfig,
    api: ApiConfig,
    connector: Option<Arc<dyn ConnectionFactory>>,
    database_enabled: bool,
}

impl ResourcePoolBuilder {
    pub fn new() -> Self {
        Self {
            database: DatabaseConfig::default(),
            api: ApiConfig::default(),
            connector: None,
            database_enabled: true,
        }
    }

    pub fn database(mut self, config: DatabaseConfig) -> Self {
        self.database = config;
        self
    }

    pub fn api(mut self, config: ApiConfig) -> Self {
        self.api = config;
        self
    }

    /// Open database sessions with `connector` instead of PostgreSQL.
    pub fn connector(mut self, connector: Arc<dyn ConnectionFactory>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Skip database initialization; the pool starts degraded.
    pub fn without_database(mut self) -> Self {
        self.database_enabled = false;
        self
    }

    /// Assemble the pool and its API clients without touching the
    /// database. The pool starts [`PoolState::Uninitialized`].
    pub fn build_uninitialized(self) -> ResourcePool {
        let connector = if self.database_enabled {
            let database = &self.database;
            Some(
                self.connector
                    .unwrap_or_else(|| Arc::new(PgConnector::new(database))),
            )
        } else {
            None
        };

        ResourcePool {
            state: RwLock::new(PoolState::Uninitialized),
            connector,
            db: OnceLock::new(),
            clients: Mutex::new(ApiClients::build(&self.api)),
            database: self.database,
            api: self.api,
            closed: AtomicBool::new(false),
        }
    }

    /// Assemble the pool and [`initialize`](ResourcePool::initialize) it.
    ///
    /// Never fails: a database that cannot be reached leaves the pool
    /// [`PoolState::Degraded`].
    pub async fn build(self) -> ResourcePool {
        let pool = self.build_uninitialized();
        pool.initialize().await;
        pool
    }
}

impl Default for ResourcePoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
