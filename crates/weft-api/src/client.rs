//! Backend trait and the HTTP implementation of the query/status contract

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::{Error, Result},
    types::{ConversationSnapshot, QueryAccepted, QueryRequest},
};

/// Placeholder substituted with the (url-encoded) conversation id
pub const CONVERSATION_ID_PLACEHOLDER: &str = "{conversation_id}";

/// The two calls the reconciliation engine makes against the backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Submit a query and learn which conversation it was assigned to
    async fn submit_query(&self, request: &QueryRequest) -> Result<QueryAccepted>;

    /// Fetch the current status snapshot of a conversation.
    ///
    /// `Ok(None)` means the backend has nothing to report yet.
    async fn fetch_status(&self, conversation_id: &str) -> Result<Option<ConversationSnapshot>>;
}

/// Endpoint configuration for [`HttpBackend`]
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Base URL, e.g. `http://localhost:8000/api`
    pub base_url: String,
    /// Path of the submit endpoint, relative to the base URL
    pub query_path: String,
    /// Path of the status endpoint; must contain `{conversation_id}`
    pub status_path: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            query_path: "/query".to_string(),
            status_path: format!("/status/{}", CONVERSATION_ID_PLACEHOLDER),
            timeout: Duration::from_secs(30),
        }
    }
}

impl HttpBackendConfig {
    fn validate(&self) -> Result<()> {
        let base = self.base_url.trim();
        if base.is_empty() {
            return Err(Error::InvalidConfig("base_url is empty".into()));
        }
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(Error::InvalidConfig(format!(
                "base_url must start with http:// or https://: {}",
                base
            )));
        }
        if !self.status_path.contains(CONVERSATION_ID_PLACEHOLDER) {
            return Err(Error::InvalidConfig(format!(
                "status_path must contain {}",
                CONVERSATION_ID_PLACEHOLDER
            )));
        }
        Ok(())
    }
}

/// HTTP client for the conversation backend
pub struct HttpBackend {
    client: reqwest::Client,
    config: HttpBackendConfig,
}

impl HttpBackend {
    /// Create a new backend client, building a `reqwest::Client` with the configured timeout
    pub fn new(config: HttpBackendConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    /// Create from an existing `reqwest::Client`
    pub fn with_client(client: reqwest::Client, config: HttpBackendConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpBackendConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        let base = self.config.base_url.trim().trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }

    fn query_url(&self) -> String {
        self.url(&self.config.query_path)
    }

    fn status_url(&self, conversation_id: &str) -> String {
        let path = self.config.status_path.replace(
            CONVERSATION_ID_PLACEHOLDER,
            &urlencoding::encode(conversation_id),
        );
        self.url(&path)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn submit_query(&self, request: &QueryRequest) -> Result<QueryAccepted> {
        let url = self.query_url();
        tracing::debug!("POST {}", url);

        let response = self.client.post(&url).json(request).send().await?;
        let body = read_json(response).await?;
        QueryAccepted::from_value(body)
    }

    async fn fetch_status(&self, conversation_id: &str) -> Result<Option<ConversationSnapshot>> {
        let url = self.status_url(conversation_id);
        tracing::debug!("GET {}", url);

        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        match read_json(response).await? {
            Value::Null => Ok(None),
            body => ConversationSnapshot::from_value(body).map(Some),
        }
    }
}

/// Turn a response into JSON, mapping non-success statuses to `Error::Api`.
/// An empty body reads as `null`.
async fn read_json(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(Error::api(status.as_u16(), text));
    }

    let text = response.text().await?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}
