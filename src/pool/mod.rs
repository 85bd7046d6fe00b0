//! Database connection pool and shared API clients.
//!
//! [`ResourcePool`] owns a bounded [`DbPool`] and one [`ApiClient`] per
//! remote service. Database checkout is scoped: a [`PooledConnection`]
//! returns itself on drop, and [`ResourcePool::with_db_connection`] rolls
//! back on failure.

mod clients;
mod db;
mod manager;
mod postgres;
mod retry;

pub use clients::{ApiClient, ApiClientKind, ApiConfig, ClientSession};
pub use db::{ConnectionFactory, DatabaseConfig, DbConnection, DbPool, PooledConnection};
pub use manager::{PoolState, PoolStats, ResourcePool, ResourcePoolBuilder};
pub use postgres::{PgConnector, PgSession};
pub use retry::{ParseRetryModeError, RetryMode, RetryPolicy};
