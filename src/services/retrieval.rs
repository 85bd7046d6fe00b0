//! Knowledge-base retrieval and answer generation.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::pool::{ApiClientKind, ResourcePool};
use crate::{MuninnError, Result};

/// Characters kept in a context snippet before truncation.
const SNIPPET_CHARS: usize = 150;
/// Prior conversation turns forwarded to the model.
const HISTORY_TURNS: usize = 6;

/// A retrieved knowledge-base passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub text: String,
    pub snippet: String,
    pub top_lines: String,
    pub document_reference: String,
    #[serde(default)]
    pub score: f64,
}

impl Context {
    /// Build a context from raw passage text, deriving snippet and top lines.
    pub fn from_passage(text: &str, document_reference: &str, score: f64) -> Self {
        let text = clean_text(text);
        let top_lines = text.trim().lines().take(3).collect::<Vec<_>>().join("\n");
        let snippet = if text.chars().count() > SNIPPET_CHARS {
            let head: String = text.chars().take(SNIPPET_CHARS).collect();
            format!("{head}...")
        } else {
            text.clone()
        };
        Self {
            snippet,
            top_lines,
            document_reference: clean_text(document_reference),
            score,
            text,
        }
    }
}

/// A source cited by an [`Answer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub source: String,
    pub top_lines: String,
    pub snippet: String,
}

impl From<&Context> for Reference {
    fn from(context: &Context) -> Self {
        Self {
            source: context.document_reference.clone(),
            top_lines: context.top_lines.clone(),
            snippet: context.snippet.clone(),
        }
    }
}

/// A generated answer with the passages it drew on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub references: Vec<Reference>,
}

/// A prior conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Remote knowledge-base retrieval and grounded answer generation.
#[async_trait]
pub trait RetrievalService: Send + Sync {
    /// Up to `limit` passages relevant to `query`.
    async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<Context>>;

    /// Answer `query` from retrieved passages, continuing `history`.
    async fn answer(&self, query: &str, history: &[ChatTurn]) -> Result<Answer>;
}

/// [`RetrievalService`] over the pool's retrieval and generation clients.
pub struct HttpRetrievalService {
    pool: Arc<ResourcePool>,
    knowledge_base_id: String,
    model_id: String,
    limit: usize,
}

impl HttpRetrievalService {
    pub fn new(
        pool: Arc<ResourcePool>,
        knowledge_base_id: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            knowledge_base_id: knowledge_base_id.into(),
            model_id: model_id.into(),
            limit: 5,
        }
    }

    /// Passages retrieved per answer. Default: 5.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveResponse {
    #[serde(default)]
    retrieval_results: Vec<RetrievalResult>,
}

#[derive(Deserialize)]
struct RetrievalResult {
    content: RetrievalContent,
    #[serde(default)]
    location: Option<RetrievalLocation>,
    #[serde(default)]
    score: f64,
}

#[derive(Deserialize)]
struct RetrievalContent {
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrievalLocation {
    s3_location: Option<S3Location>,
}

#[derive(Deserialize)]
struct S3Location {
    uri: String,
}

#[derive(Deserialize)]
struct InvokeResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl RetrievalService for HttpRetrievalService {
    async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<Context>> {
        let started = Instant::now();
        let client = self
            .pool
            .get_api_client(ApiClientKind::Retrieval)
            .ok_or(MuninnError::ClientUnavailable("retrieval"))?;

        let body = json!({
            "retrievalQuery": { "text": query },
            "retrievalConfiguration": {
                "vectorSearchConfiguration": { "numberOfResults": limit }
            }
        });
        let path = format!("knowledgebases/{}/retrieve", self.knowledge_base_id);
        let response: RetrieveResponse = client.post_json(&path, &body).await?;

        info!(
            results = response.retrieval_results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "knowledge base query completed"
        );

        Ok(response
            .retrieval_results
            .into_iter()
            .map(|result| {
                let reference = result
                    .location
                    .and_then(|l| l.s3_location)
                    .map(|s3| s3.uri)
                    .unwrap_or_default();
                Context::from_passage(&result.content.text, &reference, result.score)
            })
            .collect())
    }

    async fn answer(&self, query: &str, history: &[ChatTurn]) -> Result<Answer> {
        let started = Instant::now();
        let contexts = self.retrieve(query, self.limit).await?;
        let references = contexts.iter().map(Reference::from).collect();
        let documents = contexts
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut messages: Vec<serde_json::Value> = history
            .iter()
            .skip(history.len().saturating_sub(HISTORY_TURNS))
            .map(|turn| json!({ "role": turn.role, "content": turn.content }))
            .collect();
        messages.push(json!({
            "role": "user",
            "content": [{
                "type": "text",
                "text": format!(
                    "Based on the following documents, please provide a detailed and accurate answer to this question: {query}\n\n{documents}\n\nAnswer the question based only on the information provided above. If you're unsure or the information isn't in the provided documents, say so."
                ),
            }]
        }));

        let client = self
            .pool
            .get_api_client(ApiClientKind::Generation)
            .ok_or(MuninnError::ClientUnavailable("generation"))?;
        let body = json!({
            "anthropic_version": "bedrock-2023-05-31",
            "max_tokens": 1000,
            "messages": messages,
            "temperature": 0.7,
        });
        let path = format!("model/{}/invoke", self.model_id);
        let response: InvokeResponse = client.post_json(&path, &body).await?;

        let text = response
            .content
            .into_iter()
            .next()
            .map(|block| clean_text(&block.text))
            .ok_or_else(|| MuninnError::Serialization("model returned no content".to_string()))?;

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "answer generated"
        );
        Ok(Answer { text, references })
    }
}

/// Strip replacement and NUL characters left over from lossy decoding upstream.
pub fn clean_text(text: &str) -> String {
    text.chars()
        .filter(|c| *c != '\u{FFFD}' && *c != '\0')
        .collect()
}
