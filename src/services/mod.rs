//! Collaborators behind the cached operations, and the operations themselves.
//!
//! The traits ([`IntentClassifier`], [`QueryExecutor`],
//! [`RetrievalService`]) are the seams for tests and alternative
//! backends; the reference implementations run over a
//! [`ResourcePool`](crate::pool::ResourcePool).

mod executor;
mod intent;
mod operations;
mod retrieval;

pub use executor::{PgQueryExecutor, QueryExecutor, QueryOutcome};
pub use intent::{Intent, IntentClassifier, IntentKind, PatternClassifier};
pub use operations::{CachedOperations, DEFAULT_CONTEXT_LIMIT};
pub use retrieval::{
    Answer, ChatTurn, Context, HttpRetrievalService, Reference, RetrievalService, clean_text,
};
