//! PostgreSQL sessions backed by sqlx.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use tracing::debug;

use super::db::{ConnectionFactory, DatabaseConfig, DbConnection};
use crate::Result;

/// Opens [`PgSession`]s from a [`DatabaseConfig`].
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    pub fn new(config: &DatabaseConfig) -> Self {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .application_name("muninn");
        Self { options }
    }
}

#[async_trait]
impl ConnectionFactory for PgConnector {
    async fn connect(&self) -> Result<Box<dyn DbConnection>> {
        let conn = self.options.connect().await?;
        debug!("opened PostgreSQL session");
        Ok(Box::new(PgSession {
            conn,
            broken: false,
        }))
    }
}

/// A single PostgreSQL session.
///
/// Transport-level failures mark the session broken, after which it
/// reports itself closed and the pool discards it.
pub struct PgSession {
    conn: PgConnection,
    broken: bool,
}

impl PgSession {
    fn track<T>(&mut self, result: std::result::Result<T, sqlx::Error>) -> Result<T> {
        if matches!(
            &result,
            Err(sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::WorkerCrashed)
        ) {
            self.broken = true;
        }
        result.map_err(Into::into)
    }
}

#[async_trait]
impl DbConnection for PgSession {
    fn is_closed(&self) -> bool {
        self.broken
    }

    async fn ping(&mut self) -> Result<()> {
        let result = self.conn.ping().await;
        self.track(result)
    }

    async fn rollback(&mut self) -> Result<()> {
        let result = sqlx::query("ROLLBACK")
            .execute(&mut self.conn)
            .await
            .map(|_| ());
        self.track(result)
    }

    async fn fetch_json(&mut self, sql: &str, params: &[String]) -> Result<Vec<Value>> {
        let wrapped = format!("SELECT row_to_json(q)::jsonb FROM ({sql}) AS q");
        let mut query = sqlx::query_scalar::<_, Value>(&wrapped);
        for param in params {
            query = query.bind(param.as_str());
        }
        let result = query.fetch_all(&mut self.conn).await;
        self.track(result)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}
