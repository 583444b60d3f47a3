//! HTTP client for the OpenAI-compatible upstream API.
//!
//! [`ChatBackend`] is the seam the orchestrator talks to: it issues one
//! streaming chat completion and hands back the raw response lines. The
//! production implementation is [`HttpChatBackend`], which also serves the
//! model listing.

use crate::config::RelayConfig;
use crate::retry::{RetryPolicy, retry_transient};
use crate::stream::{LineStream, lines_from_bytes, with_idle_timeout};
use crate::types::ChatCompletionRequest;
use crate::{Error, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// Issues streaming chat completions.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Send `request` with the caller's credential and return the response
    /// body as lines. Fails with an upstream error on transport failures and
    /// non-success statuses.
    async fn stream_chat(&self, request: &ChatCompletionRequest, api_key: &str) -> Result<LineStream>;
}

/// Lists the models available to a credential.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn list_models(&self, api_key: &str) -> Result<Vec<ModelInfo>>;
}

/// [`ChatBackend`] over `reqwest`.
#[derive(Clone)]
pub struct HttpChatBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl HttpChatBackend {
    /// Create a backend for `base_url` (e.g. `https://openrouter.ai/api/v1`).
    ///
    /// `timeout` bounds connecting, waiting for response headers, and each
    /// silence between streamed lines. A chat stream that keeps producing
    /// data is never cut off. The model listing is bounded as a whole.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            retry: RetryPolicy::default(),
        })
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        Self::new(&config.upstream_url, config.upstream_timeout)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch and normalize the upstream model catalogue.
    ///
    /// Transient failures (network, 429, 5xx) are retried; other statuses are
    /// returned as [`Error::UpstreamStatus`] so callers can forward them.
    pub async fn list_models(&self, api_key: &str) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/models", self.base_url);
        let client = &self.client;
        let url_ref = url.as_str();
        let timeout = self.timeout;

        let body: Value = retry_transient(&self.retry, "GET /models", move || async move {
            let response = client
                .get(url_ref)
                .header("Authorization", format!("Bearer {}", api_key))
                .timeout(timeout)
                .send()
                .await?;
            let response = ensure_success(response).await?;
            Ok::<Value, Error>(response.json::<Value>().await?)
        })
        .await?;

        let models = parse_model_list(&body);
        debug!("Fetched {} models from {}", models.len(), url);
        Ok(models)
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn stream_chat(&self, request: &ChatCompletionRequest, api_key: &str) -> Result<LineStream> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(
            "POST {} model={} messages={} tools={}",
            url,
            request.model,
            request.messages.len(),
            request.offers_tools()
        );

        let send = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send();
        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| {
                Error::upstream(format!("no response from upstream within {:?}", self.timeout))
            })??;
        let response = ensure_success(response).await?;

        Ok(with_idle_timeout(
            lines_from_bytes(response.bytes_stream()),
            self.timeout,
        ))
    }
}

#[async_trait]
impl ModelCatalog for HttpChatBackend {
    async fn list_models(&self, api_key: &str) -> Result<Vec<ModelInfo>> {
        HttpChatBackend::list_models(self, api_key).await
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_else(|e| {
        warn!("Failed to read upstream error body: {}", e);
        String::new()
    });
    warn!("Upstream returned {}: {}", status, body);
    Err(Error::upstream_status(status.as_u16(), body))
}

/// Per-token and per-request prices of a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ModelPricing {
    pub prompt: f64,
    pub completion: f64,
    pub image: f64,
    pub request: f64,
}

/// A model as exposed by `GET /api/get_models`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub pricing: ModelPricing,
    pub context_length: Option<u64>,
    pub input_modalities: Vec<String>,
}

impl ModelInfo {
    /// Normalize one entry of the upstream `data` array.
    ///
    /// Entries without an `id` are dropped. Prices may arrive as strings or
    /// numbers; anything unparsable counts as 0.0.
    pub fn from_upstream(model: &Value) -> Option<Self> {
        let id = model.get("id").and_then(Value::as_str)?.to_string();
        let name = model
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| id.clone());

        let pricing = model.get("pricing");
        let price = |key: &str| pricing.and_then(|p| p.get(key)).map(coerce_price).unwrap_or(0.0);

        let input_modalities = model
            .pointer("/architecture/input_modalities")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            pricing: ModelPricing {
                prompt: price("prompt"),
                completion: price("completion"),
                image: price("image"),
                request: price("request"),
            },
            context_length: model.get("context_length").and_then(Value::as_u64),
            input_modalities,
            id,
            name,
        })
    }
}

fn coerce_price(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Transform an upstream `{ "data": [...] }` listing.
pub fn parse_model_list(body: &Value) -> Vec<ModelInfo> {
    let Some(entries) = body.get("data").and_then(Value::as_array) else {
        warn!("Model listing has no data array");
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let model = ModelInfo::from_upstream(entry);
            if model.is_none() {
                debug!("Skipping model entry without id: {}", entry);
            }
            model
        })
        .collect()
}
