//! Structured query execution.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use super::intent::{Intent, IntentKind};
use crate::pool::ResourcePool;

/// Result of running an [`Intent`]. Failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    /// One JSON object per result row.
    Rows(Vec<Value>),
    Failed { error: String },
}

impl QueryOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        QueryOutcome::Failed {
            error: error.into(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, QueryOutcome::Failed { .. })
    }

    pub fn rows(&self) -> &[Value] {
        match self {
            QueryOutcome::Rows(rows) => rows,
            QueryOutcome::Failed { .. } => &[],
        }
    }
}

/// Runs structured intents against the data store.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, intent: &Intent) -> QueryOutcome;
}

/// Executes intents against the `websites` table through a [`ResourcePool`].
pub struct PgQueryExecutor {
    pool: Arc<ResourcePool>,
}

impl PgQueryExecutor {
    pub fn new(pool: Arc<ResourcePool>) -> Self {
        Self { pool }
    }
}

/// SQL and text parameters for an intent.
fn statement_for(intent: &Intent) -> (&'static str, Vec<String>) {
    let term = intent.search_term.clone().unwrap_or_default();
    match intent.kind {
        IntentKind::CountWebsites => (
            "SELECT COUNT(*) AS count FROM websites WHERE content ILIKE $1",
            vec![format!("%{term}%")],
        ),
        IntentKind::SearchContent => (
            "SELECT url, domain, downloaded_at, \
                 substring(content, greatest(1, position(lower($1) in lower(content)) - 100), 300) AS context_snippet, \
                 (length(lower(content)) - length(replace(lower(content), lower($1), ''))) / greatest(length($1), 1) AS occurrence_count \
             FROM websites WHERE content ILIKE $2 \
             ORDER BY occurrence_count DESC, downloaded_at DESC LIMIT 10",
            vec![term.clone(), format!("%{term}%")],
        ),
        IntentKind::FindLinks => (
            "SELECT url, domain, downloaded_at, \
                 substring(content FROM '<a[^>]*href[^>]*' || $1 || '[^>]*>') AS link_context \
             FROM websites WHERE content ~* ('<a[^>]*href[^>]*' || $1 || '[^>]*>') \
             ORDER BY downloaded_at DESC LIMIT 10",
            vec![regex::escape(&term)],
        ),
        IntentKind::ListWebsites => (
            "SELECT domain, COUNT(*) AS page_count, MAX(downloaded_at) AS last_updated \
             FROM websites WHERE domain IS NOT NULL \
             GROUP BY domain ORDER BY page_count DESC LIMIT 20",
            Vec::new(),
        ),
        IntentKind::WebsiteStats => (
            "SELECT COUNT(*) AS total_websites, COUNT(DISTINCT domain) AS unique_domains, \
                 AVG(length(content)) AS avg_content_length, MAX(downloaded_at) AS last_download \
             FROM websites",
            Vec::new(),
        ),
    }
}

#[async_trait]
impl QueryExecutor for PgQueryExecutor {
    async fn execute(&self, intent: &Intent) -> QueryOutcome {
        if !self.pool.db_available() {
            return QueryOutcome::failed("Database not available");
        }

        let (sql, params) = statement_for(intent);
        info!(intent = %intent, "executing database intent");

        let result = self
            .pool
            .with_db_connection(move |conn| {
                Box::pin(async move { conn.fetch_json(sql, &params).await })
            })
            .await;

        match result {
            Ok(rows) => QueryOutcome::Rows(rows),
            Err(e) => {
                error!(intent = %intent, error = %e, "database intent failed");
                QueryOutcome::failed(format!("Database query failed: {e}"))
            }
        }
    }
}
