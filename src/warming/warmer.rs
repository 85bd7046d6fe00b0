//! Warming passes and their statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::WarmingConfig;
use super::corpus::WarmingCorpus;
use super::keywords::{extract_keywords, related_queries};
use crate::cache::CacheStats;
use crate::services::{CachedOperations, Intent, QueryOutcome};
use crate::telemetry;

/// Characters of a query shown in log lines.
const LOG_PREVIEW_CHARS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    KnowledgeBase,
    IntentDetection,
    DatabaseQueries,
    Related,
}

impl Pass {
    fn as_str(self) -> &'static str {
        match self {
            Pass::KnowledgeBase => "knowledge_base",
            Pass::IntentDetection => "intent_detection",
            Pass::DatabaseQueries => "database_queries",
            Pass::Related => "related",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Warmed,
    Skipped,
    Failed,
}

impl ItemOutcome {
    fn as_str(self) -> &'static str {
        match self {
            ItemOutcome::Warmed => "warmed",
            ItemOutcome::Skipped => "skipped",
            ItemOutcome::Failed => "failed",
        }
    }
}

/// Warming statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarmingStats {
    pub sessions_started: u64,
    pub items_warmed: u64,
    pub items_skipped: u64,
    pub items_failed: u64,
    /// Seconds spent in completed warming cycles.
    pub total_time: f64,
    /// `total_time` per started session.
    pub avg_warming_time: f64,
    /// RFC 3339 time the last cycle completed.
    pub last_warming: Option<String>,
}

/// Warming statistics together with the store's.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarmingReport {
    #[serde(flatten)]
    pub warming: WarmingStats,
    pub cache_stats: CacheStats,
}

#[derive(Debug, Default)]
struct WarmingCounters {
    sessions_started: AtomicU64,
    items_warmed: AtomicU64,
    items_skipped: AtomicU64,
    items_failed: AtomicU64,
    total_time_us: AtomicU64,
    last_warming: Mutex<Option<String>>,
}

impl WarmingCounters {
    fn record(&self, pass: Pass, outcome: ItemOutcome) {
        let counter = match outcome {
            ItemOutcome::Warmed => &self.items_warmed,
            ItemOutcome::Skipped => &self.items_skipped,
            ItemOutcome::Failed => &self.items_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            telemetry::WARMING_ITEMS_TOTAL,
            "pass" => pass.as_str(),
            "status" => outcome.as_str()
        )
        .increment(1);
    }

    fn finish_cycle(&self, elapsed: Duration) {
        self.total_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        let now = chrono::Utc::now().to_rfc3339();
        match self.last_warming.lock() {
            Ok(mut last) => *last = Some(now),
            Err(poisoned) => *poisoned.into_inner() = Some(now),
        }
        metrics::histogram!(telemetry::WARMING_CYCLE_SECONDS).record(elapsed.as_secs_f64());
    }

    fn snapshot(&self) -> WarmingStats {
        let sessions_started = self.sessions_started.load(Ordering::Relaxed);
        let total_time = self.total_time_us.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let last_warming = match self.last_warming.lock() {
            Ok(last) => last.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        WarmingStats {
            sessions_started,
            items_warmed: self.items_warmed.load(Ordering::Relaxed),
            items_skipped: self.items_skipped.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            total_time,
            avg_warming_time: total_time / sessions_started.max(1) as f64,
            last_warming,
        }
    }
}

/// Preloads the caches by running [`CachedOperations`] over a
/// [`WarmingCorpus`].
///
/// Items already cached are skipped, so a cycle over a warm cache touches
/// nothing but the store. Cycles never overlap: a cycle started while
/// another runs waits for it.
pub struct CacheWarmer {
    pub(super) ops: Arc<CachedOperations>,
    corpus: WarmingCorpus,
    pub(super) config: WarmingConfig,
    counters: WarmingCounters,
    cycle: tokio::sync::Mutex<()>,
}

impl CacheWarmer {
    pub fn new(ops: Arc<CachedOperations>, corpus: WarmingCorpus, config: WarmingConfig) -> Self {
        Self {
            ops,
            corpus,
            config,
            counters: WarmingCounters::default(),
            cycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn corpus(&self) -> &WarmingCorpus {
        &self.corpus
    }

    /// Run one full warming cycle: knowledge-base retrievals, then intent
    /// classification, then structured queries.
    ///
    /// Individual failures are logged and counted; the cycle itself never
    /// fails.
    pub async fn warm_on_startup(&self) -> WarmingStats {
        let _cycle = self.cycle.lock().await;
        let started = Instant::now();
        self.counters.sessions_started.fetch_add(1, Ordering::Relaxed);
        info!(
            queries = self.corpus.queries.len(),
            intents = self.corpus.intents.len(),
            "starting cache warming"
        );

        let knowledge: Vec<String> = self.corpus.knowledge_queries().map(String::from).collect();
        self.run_pass(Pass::KnowledgeBase, knowledge, |ops, query| {
            warm_contexts(ops, query)
        })
        .await;
        self.run_pass(
            Pass::IntentDetection,
            self.corpus.queries.clone(),
            |ops, query| warm_classification(ops, query),
        )
        .await;
        self.run_pass(Pass::DatabaseQueries, self.corpus.intents.clone(), |ops, intent| {
            warm_intent(ops, intent)
        })
        .await;

        let elapsed = started.elapsed();
        self.counters.finish_cycle(elapsed);
        let stats = self.counters.snapshot();
        info!(
            elapsed_ms = elapsed.as_millis() as u64,
            items_warmed = stats.items_warmed,
            items_skipped = stats.items_skipped,
            items_failed = stats.items_failed,
            "cache warming completed"
        );
        stats
    }

    /// Warm structured queries related to `query`.
    ///
    /// Each related query is classified (through the cache) and, when it
    /// maps to an intent, the intent's result is warmed. Returns the number
    /// of results newly cached.
    pub async fn warm_related_queries(&self, query: &str) -> usize {
        let related = related_queries(&extract_keywords(query));
        if related.is_empty() {
            return 0;
        }

        let ops = Arc::clone(&self.ops);
        let joined = tokio::task::spawn_blocking(move || {
            related
                .iter()
                .filter_map(|q| ops.classify_blocking(q))
                .map(|intent| warm_intent(&ops, &intent))
                .collect::<Vec<_>>()
        })
        .await;

        match joined {
            Ok(outcomes) => {
                for outcome in &outcomes {
                    metrics::counter!(
                        telemetry::WARMING_ITEMS_TOTAL,
                        "pass" => Pass::Related.as_str(),
                        "status" => outcome.as_str()
                    )
                    .increment(1);
                }
                outcomes
                    .iter()
                    .filter(|o| **o == ItemOutcome::Warmed)
                    .count()
            }
            Err(e) => {
                debug!(query = %preview(query), error = %e, "related query warming failed");
                0
            }
        }
    }

    pub fn stats(&self) -> WarmingReport {
        WarmingReport {
            warming: self.counters.snapshot(),
            cache_stats: self.ops.store().stats(),
        }
    }

    /// One task per item on the blocking pool; waits for all of them.
    async fn run_pass<I>(
        &self,
        pass: Pass,
        items: Vec<I>,
        warm: fn(&CachedOperations, &I) -> ItemOutcome,
    ) where
        I: Send + 'static,
    {
        debug!(pass = pass.as_str(), items = items.len(), "warming pass");
        let mut tasks = JoinSet::new();
        for item in items {
            let ops = Arc::clone(&self.ops);
            tasks.spawn_blocking(move || warm(&ops, &item));
        }
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                error!(pass = pass.as_str(), error = %e, "warming task failed");
                ItemOutcome::Failed
            });
            self.counters.record(pass, outcome);
        }
    }
}

fn warm_contexts(ops: &CachedOperations, query: &str) -> ItemOutcome {
    if ops.contexts_cached(query) {
        debug!(query = %preview(query), "knowledge base query already cached");
        return ItemOutcome::Skipped;
    }
    match ops.contexts_blocking(query) {
        Ok(_) => {
            debug!(query = %preview(query), "warmed knowledge base query");
            ItemOutcome::Warmed
        }
        Err(e) => {
            warn!(query = %preview(query), error = %e, "failed to warm knowledge base query");
            ItemOutcome::Failed
        }
    }
}

fn warm_classification(ops: &CachedOperations, query: &str) -> ItemOutcome {
    if ops.classification_cached(query) {
        return ItemOutcome::Skipped;
    }
    ops.classify_blocking(query);
    debug!(query = %preview(query), "warmed intent detection");
    ItemOutcome::Warmed
}

fn warm_intent(ops: &CachedOperations, intent: &Intent) -> ItemOutcome {
    if ops.intent_cached(intent) {
        return ItemOutcome::Skipped;
    }
    match ops.execute_intent_blocking(intent) {
        QueryOutcome::Failed { error } => {
            warn!(intent = %intent, error = %error, "failed to warm database query");
            ItemOutcome::Failed
        }
        QueryOutcome::Rows(_) => {
            debug!(intent = %intent, "warmed database query");
            ItemOutcome::Warmed
        }
    }
}

fn preview(query: &str) -> String {
    query.chars().take(LOG_PREVIEW_CHARS).collect()
}
