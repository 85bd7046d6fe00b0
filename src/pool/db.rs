//! Bounded database connection pool.
//!
//! [`DbPool`] hands out [`PooledConnection`] guards. At most
//! `max_connections` guards exist at once; further callers wait in FIFO
//! order on a semaphore until one is dropped. Idle connections sit in a
//! queue behind a `std::sync::Mutex` that is only ever held for a push
//! or pop, never across an await.
//!
//! A guard returns its connection to the idle queue exactly once, when
//! dropped. Connections that report [`DbConnection::is_closed`] are
//! discarded instead, and the slot is refilled lazily on the next
//! checkout.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::telemetry;
use crate::{MuninnError, Result};

/// A single database session.
#[async_trait]
pub trait DbConnection: Send {
    /// Whether the session is known to be unusable.
    fn is_closed(&self) -> bool;

    /// Round-trip a trivial statement.
    async fn ping(&mut self) -> Result<()>;

    /// Abandon any open transaction.
    async fn rollback(&mut self) -> Result<()>;

    /// Run a query with text parameters, returning each row as a JSON object.
    async fn fetch_json(&mut self, sql: &str, params: &[String]) -> Result<Vec<Value>>;

    /// Close the session gracefully.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens new database sessions for a [`DbPool`].
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DbConnection>>;
}

/// PostgreSQL connection settings.
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Connections opened eagerly at startup.
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,
    /// Upper bound on connections checked out at once.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "websites".to_string()
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_min_connections() -> usize {
    2
}

fn default_max_connections() -> usize {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: default_database(),
            user: default_user(),
            password: String::new(),
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

struct IdleConnection {
    conn: Box<dyn DbConnection>,
    needs_rollback: bool,
}

/// A bounded pool of [`DbConnection`]s.
pub struct DbPool {
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<VecDeque<IdleConnection>>,
    slots: Arc<Semaphore>,
    min_connections: usize,
    max_connections: usize,
    closed: AtomicBool,
    opened: AtomicU64,
    discarded: AtomicU64,
}

impl DbPool {
    /// Open `min_connections` sessions eagerly and build the pool.
    ///
    /// Fails if the bounds are inconsistent or any eager connect fails.
    pub async fn open(
        factory: Arc<dyn ConnectionFactory>,
        min_connections: usize,
        max_connections: usize,
    ) -> Result<Arc<Self>> {
        if max_connections == 0 || min_connections > max_connections {
            return Err(MuninnError::Configuration(format!(
                "invalid pool bounds: min {min_connections}, max {max_connections}"
            )));
        }

        let mut idle = VecDeque::with_capacity(max_connections);
        for _ in 0..min_connections {
            let conn = factory.connect().await?;
            idle.push_back(IdleConnection {
                conn,
                needs_rollback: false,
            });
        }

        info!(
            min_connections,
            max_connections, "database connection pool initialized"
        );

        Ok(Arc::new(Self {
            factory,
            idle: Mutex::new(idle),
            slots: Arc::new(Semaphore::new(max_connections)),
            min_connections,
            max_connections,
            closed: AtomicBool::new(false),
            opened: AtomicU64::new(min_connections as u64),
            discarded: AtomicU64::new(0),
        }))
    }

    /// Check out a connection, waiting for a free slot if necessary.
    ///
    /// Closed idle connections are replaced, and connections released
    /// after a failure are rolled back before being handed out. A newly
    /// opened session that is already closed gives
    /// [`MuninnError::ConnectionClosed`].
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(MuninnError::PoolUnavailable);
        }

        let started = Instant::now();
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| MuninnError::PoolUnavailable)?;
        metrics::histogram!(telemetry::POOL_ACQUIRE_WAIT_SECONDS)
            .record(started.elapsed().as_secs_f64());

        let conn = loop {
            match self.pop_idle() {
                Some(idle) if idle.conn.is_closed() => {
                    warn!("discarding closed idle connection");
                    self.discarded.fetch_add(1, Ordering::Relaxed);
                }
                Some(mut idle) => {
                    if !idle.needs_rollback {
                        break idle.conn;
                    }
                    match idle.conn.rollback().await {
                        Ok(()) => break idle.conn,
                        Err(e) => {
                            warn!(error = %e, "rollback of released connection failed, discarding");
                            self.discarded.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                None => {
                    let conn = self.factory.connect().await?;
                    self.opened.fetch_add(1, Ordering::Relaxed);
                    if conn.is_closed() {
                        warn!("new database connection was closed on arrival");
                        self.discarded.fetch_add(1, Ordering::Relaxed);
                        return Err(MuninnError::ConnectionClosed);
                    }
                    debug!("opened new database connection");
                    break conn;
                }
            }
        };

        metrics::counter!(telemetry::POOL_ACQUIRED_TOTAL).increment(1);
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            needs_rollback: false,
            _permit: permit,
        })
    }

    /// Run `f` with a checked-out connection.
    ///
    /// On error the connection is rolled back (if still open) and the
    /// error is returned. The connection is released on every path,
    /// including cancellation and panics; if `f` did not finish, the
    /// connection is rolled back on its next checkout.
    pub async fn with_connection<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut dyn DbConnection) -> BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.acquire().await?;
        conn.needs_rollback = true;

        match f(&mut *conn).await {
            Ok(value) => {
                conn.needs_rollback = false;
                Ok(value)
            }
            Err(e) => {
                error!(error = %e, "database operation failed");
                if !conn.is_closed() {
                    match conn.rollback().await {
                        Ok(()) => conn.needs_rollback = false,
                        Err(rb) => warn!(error = %rb, "rollback failed"),
                    }
                }
                Err(e)
            }
        }
    }

    /// Refuse new checkouts and close every idle connection.
    ///
    /// Connections still checked out are dropped when their guards are.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.slots.close();

        let drained: Vec<IdleConnection> = self.lock_idle().drain(..).collect();
        let count = drained.len();
        for idle in drained {
            if let Err(e) = idle.conn.close().await {
                warn!(error = %e, "error closing database connection");
            }
        }
        info!(closed = count, "database pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn min_connections(&self) -> usize {
        self.min_connections
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Connections currently idle in the pool.
    pub fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }

    /// Guards currently alive.
    pub fn in_use(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.max_connections - self.slots.available_permits()
    }

    /// Total sessions opened over the pool's lifetime.
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// Total sessions discarded as closed or unrecoverable.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<IdleConnection>> {
        // The queue holds no invariant a panicking holder could break.
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pop_idle(&self) -> Option<IdleConnection> {
        self.lock_idle().pop_front()
    }

    fn release(&self, conn: Box<dyn DbConnection>, needs_rollback: bool) {
        if self.is_closed() {
            debug!("pool closed, dropping released connection");
            return;
        }
        if conn.is_closed() {
            warn!("discarding closed connection on release");
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.lock_idle().push_back(IdleConnection {
            conn,
            needs_rollback,
        });
    }
}

/// A connection checked out of a [`DbPool`].
///
/// Dereferences to the underlying [`DbConnection`]. Dropping the guard
/// returns the connection and frees its slot.
pub struct PooledConnection {
    conn: Option<Box<dyn DbConnection>>,
    pool: Arc<DbPool>,
    needs_rollback: bool,
    // Dropped after `Drop::drop` has returned the connection.
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Mark the connection as mid-failure so it is rolled back before reuse.
    pub fn mark_failed(&mut self) {
        self.needs_rollback = true;
    }
}

impl Deref for PooledConnection {
    type Target = dyn DbConnection;

    fn deref(&self) -> &Self::Target {
        // Only `Drop` takes the connection out.
        self.conn
            .as_deref()
            .expect("pooled connection accessed after release")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_deref_mut()
            .expect("pooled connection accessed after release")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.needs_rollback);
        }
    }
}
