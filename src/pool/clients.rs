//! Shared HTTP clients for the generation and retrieval services.
//!
//! A [`ClientSession`] owns one `reqwest::Client`, so both service clients
//! share its connection pool, keep-alive and timeout settings. Clients
//! are cheap to clone and are handed out as `Arc<ApiClient>`.

use std::fmt;
use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::retry::{RetryMode, RetryPolicy, with_retry};
use crate::{MuninnError, Result};

/// Default generation model.
const DEFAULT_MODEL_ID: &str = "anthropic.claude-3-haiku-20240307-v1:0";

/// Which remote service a client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiClientKind {
    /// Text generation (model invocation).
    Generation,
    /// Knowledge-base retrieval.
    Retrieval,
}

impl ApiClientKind {
    pub const ALL: [ApiClientKind; 2] = [ApiClientKind::Generation, ApiClientKind::Retrieval];

    pub fn name(&self) -> &'static str {
        match self {
            ApiClientKind::Generation => "generation",
            ApiClientKind::Retrieval => "retrieval",
        }
    }

    fn service(&self) -> &'static str {
        match self {
            ApiClientKind::Generation => "bedrock-runtime",
            ApiClientKind::Retrieval => "bedrock-agent-runtime",
        }
    }
}

impl fmt::Display for ApiClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Settings shared by all API clients.
#[derive(Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_region")]
    pub region: String,
    /// Attempts per request including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub retry_mode: RetryMode,
    /// Idle connections kept per host.
    #[serde(default = "default_max_pool_connections")]
    pub max_pool_connections: usize,
    #[serde(default = "default_true")]
    pub tcp_keepalive: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Bearer token sent with every request.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Override for the generation endpoint (proxies, tests).
    #[serde(default)]
    pub generation_endpoint: Option<String>,
    /// Override for the retrieval endpoint (proxies, tests).
    #[serde(default)]
    pub retrieval_endpoint: Option<String>,
    #[serde(default)]
    pub knowledge_base_id: Option<String>,
    #[serde(default = "default_model_id")]
    pub model_id: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_pool_connections() -> usize {
    50
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            max_attempts: default_max_attempts(),
            retry_mode: RetryMode::default(),
            max_pool_connections: default_max_pool_connections(),
            tcp_keepalive: true,
            request_timeout_secs: default_request_timeout_secs(),
            api_key: None,
            generation_endpoint: None,
            retrieval_endpoint: None,
            knowledge_base_id: None,
            model_id: default_model_id(),
        }
    }
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("region", &self.region)
            .field("max_attempts", &self.max_attempts)
            .field("retry_mode", &self.retry_mode)
            .field("max_pool_connections", &self.max_pool_connections)
            .field("tcp_keepalive", &self.tcp_keepalive)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("generation_endpoint", &self.generation_endpoint)
            .field("retrieval_endpoint", &self.retrieval_endpoint)
            .field("knowledge_base_id", &self.knowledge_base_id)
            .field("model_id", &self.model_id)
            .finish()
    }
}

impl ApiConfig {
    /// Endpoint for `kind`: the override if set, else the regional default.
    pub fn endpoint(&self, kind: ApiClientKind) -> String {
        let custom = match kind {
            ApiClientKind::Generation => self.generation_endpoint.as_ref(),
            ApiClientKind::Retrieval => self.retrieval_endpoint.as_ref(),
        };
        match custom {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.{}.amazonaws.com", kind.service(), self.region),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.retry_mode)
    }
}

/// Shared transport for all API clients.
pub struct ClientSession {
    http: reqwest::Client,
    config: ApiConfig,
}

impl ClientSession {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_pool_connections)
            .timeout(Duration::from_secs(config.request_timeout_secs));
        if config.tcp_keepalive {
            builder = builder.tcp_keepalive(Duration::from_secs(60));
        }
        let http = builder
            .build()
            .map_err(|e| MuninnError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    /// A client for `kind` sharing this session's transport.
    pub fn client(&self, kind: ApiClientKind) -> ApiClient {
        ApiClient {
            kind,
            http: self.http.clone(),
            endpoint: self.config.endpoint(kind),
            retry: self.config.retry_policy(),
            api_key: self.config.api_key.clone(),
        }
    }
}

/// A handle to one remote service.
#[derive(Clone)]
pub struct ApiClient {
    kind: ApiClientKind,
    http: reqwest::Client,
    endpoint: String,
    retry: RetryPolicy,
    api_key: Option<String>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn kind(&self) -> ApiClientKind {
        self.kind
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST `body` as JSON to `path` and decode the JSON response.
    ///
    /// Transient failures are retried according to the client's policy.
    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.endpoint, path.trim_start_matches('/'));
        with_retry(&self.retry, self.kind.name(), || self.send(&url, body)).await
    }

    async fn send<B, R>(&self, url: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request = self.http.post(url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| MuninnError::Serialization(format!("invalid response body: {e}")));
        }

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(MuninnError::RateLimited { retry_after });
        }

        let message = response.text().await.unwrap_or_default();
        Err(MuninnError::Api {
            status: status.as_u16(),
            message,
        })
    }
}
