//! The cached operations: retrieval, intent detection, query execution
//! and answering, each behind a [`CachedCall`].
//!
//! Every operation has a blocking form (`*_blocking`) that runs the sync
//! cache path and drives async collaborators with
//! [`Handle::block_on`](tokio::runtime::Handle::block_on), and an async
//! form that moves the blocking form onto tokio's blocking pool. The
//! blocking forms must be called from a runtime's blocking thread (e.g.
//! inside [`tokio::task::spawn_blocking`]), never from an async task.
//!
//! Failures never escape as errors from the async forms: retrieval
//! failures give an empty context list, query failures a
//! [`QueryOutcome::Failed`], answer failures an apologetic [`Answer`].
//! None of these are cached.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::error;

use super::executor::{QueryExecutor, QueryOutcome};
use super::intent::{Intent, IntentClassifier};
use super::retrieval::{Answer, ChatTurn, Context, RetrievalService};
use crate::cache::{AsyncCachedCall, CacheCategory, CacheStore, CachedCall};
use crate::{MuninnError, Result};

/// Passages fetched per retrieval by default.
pub const DEFAULT_CONTEXT_LIMIT: usize = 5;

/// Key arguments of a retrieval: query, knowledge base, limit.
type ContextArgs = (String, Option<String>, usize);
/// Key arguments of an answer: query and prior turns.
type AnswerArgs = (String, Vec<ChatTurn>);

/// The application's cacheable operations over shared collaborators.
pub struct CachedOperations {
    store: Arc<CacheStore>,
    classifier: Arc<dyn IntentClassifier>,
    executor: Arc<dyn QueryExecutor>,
    retrieval: Arc<dyn RetrievalService>,
    knowledge_base_id: Option<String>,
    context_limit: usize,
    contexts: CachedCall<ContextArgs, Vec<Context>>,
    contexts_async: AsyncCachedCall<ContextArgs, Vec<Context>>,
    intents: CachedCall<str, Option<Intent>>,
    queries: CachedCall<Intent, QueryOutcome>,
    answers: CachedCall<AnswerArgs, Answer>,
}

impl CachedOperations {
    pub fn new(
        store: Arc<CacheStore>,
        classifier: Arc<dyn IntentClassifier>,
        executor: Arc<dyn QueryExecutor>,
        retrieval: Arc<dyn RetrievalService>,
    ) -> Self {
        Self {
            contexts: CachedCall::new(Arc::clone(&store), CacheCategory::KnowledgeBase, "get_contexts"),
            contexts_async: AsyncCachedCall::new(
                Arc::clone(&store),
                CacheCategory::KnowledgeBase,
                "get_contexts",
            ),
            intents: CachedCall::new(
                Arc::clone(&store),
                CacheCategory::IntentDetection,
                "detect_database_intent",
            ),
            queries: CachedCall::new(
                Arc::clone(&store),
                CacheCategory::DatabaseQueries,
                "execute_database_intent",
            ),
            answers: CachedCall::new(Arc::clone(&store), CacheCategory::Responses, "answer_query"),
            store,
            classifier,
            executor,
            retrieval,
            knowledge_base_id: None,
            context_limit: DEFAULT_CONTEXT_LIMIT,
        }
    }

    /// Knowledge base identity folded into retrieval keys.
    pub fn knowledge_base_id(mut self, id: impl Into<String>) -> Self {
        self.knowledge_base_id = Some(id.into());
        self
    }

    pub fn context_limit(mut self, limit: usize) -> Self {
        self.context_limit = limit;
        self
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    fn context_args(&self, query: &str) -> ContextArgs {
        (
            query.to_string(),
            self.knowledge_base_id.clone(),
            self.context_limit,
        )
    }

    // Blocking forms

    /// Retrieve passages for `query`, caching successful retrievals.
    pub fn contexts_blocking(&self, query: &str) -> Result<Vec<Context>> {
        self.contexts.try_call(&self.context_args(query), || {
            block_on(self.retrieval.retrieve(query, self.context_limit))?
        })
    }

    pub fn contexts_cached(&self, query: &str) -> bool {
        self.contexts.is_cached(&self.context_args(query))
    }

    /// Classify `query`. "No intent" is cached too.
    pub fn classify_blocking(&self, query: &str) -> Option<Intent> {
        self.intents.call(query, || self.classifier.classify(query))
    }

    pub fn classification_cached(&self, query: &str) -> bool {
        self.intents.is_cached(query)
    }

    /// Run `intent`, caching only successful outcomes.
    pub fn execute_intent_blocking(&self, intent: &Intent) -> QueryOutcome {
        self.queries
            .try_call(intent, || {
                let outcome = match block_on(self.executor.execute(intent)) {
                    Ok(outcome) => outcome,
                    Err(e) => QueryOutcome::failed(e.to_string()),
                };
                if outcome.is_failed() {
                    Err(outcome)
                } else {
                    Ok(outcome)
                }
            })
            .unwrap_or_else(|failed| failed)
    }

    pub fn intent_cached(&self, intent: &Intent) -> bool {
        self.queries.is_cached(intent)
    }

    /// Answer `query`, caching only generated answers.
    pub fn answer_blocking(&self, query: &str, history: &[ChatTurn]) -> Answer {
        let args = (query.to_string(), history.to_vec());
        self.answers
            .try_call(&args, || block_on(self.retrieval.answer(query, history))?)
            .unwrap_or_else(|e| {
                error!(error = %e, "answer generation failed");
                Answer {
                    text: format!(
                        "I'm sorry, I encountered an error processing your request: {e}"
                    ),
                    references: Vec::new(),
                }
            })
    }

    // Async forms

    /// Retrieve passages for `query`; empty on failure.
    pub async fn contexts(self: &Arc<Self>, query: &str) -> Vec<Context> {
        let query = query.to_string();
        match self.offload(move |ops| ops.contexts_blocking(&query)).await {
            Ok(Ok(contexts)) => contexts,
            Ok(Err(e)) | Err(e) => {
                error!(error = %e, "knowledge base retrieval failed");
                Vec::new()
            }
        }
    }

    /// Like [`contexts`](Self::contexts) but over the store's async
    /// (Redis-only) path, without using the blocking pool.
    pub async fn contexts_async(&self, query: &str) -> Vec<Context> {
        let args = self.context_args(query);
        let result = self
            .contexts_async
            .try_call(&args, || self.retrieval.retrieve(query, self.context_limit))
            .await;
        result.unwrap_or_else(|e| {
            error!(error = %e, "knowledge base retrieval failed");
            Vec::new()
        })
    }

    pub async fn classify(self: &Arc<Self>, query: &str) -> Option<Intent> {
        let query = query.to_string();
        match self.offload(move |ops| ops.classify_blocking(&query)).await {
            Ok(intent) => intent,
            Err(e) => {
                error!(error = %e, "intent detection failed");
                None
            }
        }
    }

    pub async fn execute_intent(self: &Arc<Self>, intent: &Intent) -> QueryOutcome {
        let intent = intent.clone();
        self.offload(move |ops| ops.execute_intent_blocking(&intent))
            .await
            .unwrap_or_else(|e| QueryOutcome::failed(e.to_string()))
    }

    pub async fn answer(self: &Arc<Self>, query: &str, history: &[ChatTurn]) -> Answer {
        let query = query.to_string();
        let history = history.to_vec();
        match self.offload(move |ops| ops.answer_blocking(&query, &history)).await {
            Ok(answer) => answer,
            Err(e) => Answer {
                text: format!("I'm sorry, I encountered an error processing your request: {e}"),
                references: Vec::new(),
            },
        }
    }

    /// Run `f` on the blocking pool.
    async fn offload<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> T + Send + 'static,
        T: Send + 'static,
    {
        let ops = Arc::clone(self);
        Ok(tokio::task::spawn_blocking(move || f(&ops)).await?)
    }
}

/// Drive `fut` to completion from a blocking thread.
fn block_on<F: Future>(fut: F) -> Result<F::Output> {
    let handle = Handle::try_current()
        .map_err(|e| MuninnError::Task(format!("no runtime to drive collaborator: {e}")))?;
    Ok(handle.block_on(fut))
}
