//! Provider adapters - one client per upstream platform family
//!
//! Every adapter speaks one wire protocol and exposes the same capability
//! set: list available models, issue a chat completion (streaming or not),
//! and test connectivity. Chat streams yield raw chunk strings exactly as
//! the upstream delivered them - one SSE line per item for SSE upstreams
//! (`data: ` prefix intact), one JSON object per line for Ollama's NDJSON
//! endpoint. Interpreting chunk contents is the stream converter's job.
//!
//! Hosted platforms authenticate with a bearer token; local platforms
//! (Ollama, LMStudio) need none. All requests send
//! `Content-Type: application/json`.

mod dashscope;
mod lmstudio;
mod ollama;
mod openai_compat;
mod openrouter;
mod siliconflow;

pub use dashscope::DashScopeClient;
pub use lmstudio::LmStudioClient;
pub use ollama::OllamaClient;
pub use openai_compat::OpenAiCompatibleClient;
pub use openrouter::OpenRouterClient;
pub use siliconflow::SiliconFlowClient;

use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Platform Types
// ─────────────────────────────────────────────────────────────────────────────

/// The upstream platform families the gateway can dispatch to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformType {
    DashScope,
    OpenRouter,
    Ollama,
    LmStudio,
    SiliconFlow,
    OpenAiCompatible,
}

impl PlatformType {
    /// Wire name used in the database and in model specs
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformType::DashScope => "dashscope",
            PlatformType::OpenRouter => "openrouter",
            PlatformType::Ollama => "ollama",
            PlatformType::LmStudio => "lmstudio",
            PlatformType::SiliconFlow => "siliconflow",
            PlatformType::OpenAiCompatible => "openai_compatible",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dashscope" => Some(PlatformType::DashScope),
            "openrouter" => Some(PlatformType::OpenRouter),
            "ollama" => Some(PlatformType::Ollama),
            "lmstudio" => Some(PlatformType::LmStudio),
            "siliconflow" => Some(PlatformType::SiliconFlow),
            "openai_compatible" => Some(PlatformType::OpenAiCompatible),
            _ => None,
        }
    }

    /// Local platforms run on the operator's machine and need no API key
    pub fn is_local(&self) -> bool {
        matches!(self, PlatformType::Ollama | PlatformType::LmStudio)
    }
}

impl fmt::Display for PlatformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration for one platform client
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub platform: PlatformType,
    pub api_key: String,
    pub base_url: String,
    pub timeout_sec: u64,
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec.max(1))
    }

    /// Build the per-platform HTTP client with the configured timeout
    pub(crate) fn build_http(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(self.timeout())
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_default()
    }
}

/// One model advertised by a platform
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub platform: PlatformType,
    pub description: String,
}

/// Lazy sequence of raw upstream chunk strings
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A chat call in flight: the upstream's response headers plus the chunk
/// stream. Headers are kept for the interaction record.
pub struct ChatExchange {
    pub headers: Vec<(String, String)>,
    pub stream: ChunkStream,
}

// ─────────────────────────────────────────────────────────────────────────────
// Upstream Error
// ─────────────────────────────────────────────────────────────────────────────

/// Error from an upstream HTTP call, carrying the status when one was seen
#[derive(Debug)]
pub struct UpstreamError {
    pub status: Option<u16>,
    pub body: String,
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "API error: {} - {}", status, self.body),
            None => write!(f, "Request failed: {}", self.body),
        }
    }
}

impl std::error::Error for UpstreamError {}

// ─────────────────────────────────────────────────────────────────────────────
// Provider Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Uniform capability set implemented by every adapter
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn platform(&self) -> PlatformType;

    /// Base URL of the upstream (canonical for hosted, configured for local)
    fn base_url(&self) -> String;

    /// Chat-completions endpoint URL
    fn chat_url(&self) -> String;

    /// Bearer token for hosted platforms, None for local ones
    fn bearer_token(&self) -> Option<String>;

    fn http(&self) -> &reqwest::Client;

    /// List available models. Adapters with curated defaults fall back to
    /// those when the upstream answers with an unrecognized shape.
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;

    /// Issue a chat completion from a pre-built OpenAI-shaped payload
    ///
    /// Streaming yields one raw chunk per item; non-streaming yields a
    /// single item containing the whole response body.
    async fn chat_with_payload(&self, payload: &Value, stream: bool) -> Result<ChatExchange> {
        http_chat(
            self.http(),
            &self.chat_url(),
            self.bearer_token().as_deref(),
            payload,
            stream,
        )
        .await
    }

    /// Issue a chat completion from message parts
    async fn chat(
        &self,
        model_id: &str,
        messages: &[Value],
        stream: bool,
        extra_params: &serde_json::Map<String, Value>,
    ) -> Result<ChunkStream> {
        let mut payload = serde_json::json!({
            "model": model_id,
            "messages": messages,
            "stream": stream,
        });
        if let Some(obj) = payload.as_object_mut() {
            for (key, value) in extra_params {
                obj.insert(key.clone(), value.clone());
            }
        }
        Ok(self.chat_with_payload(&payload, stream).await?.stream)
    }

    /// True iff the platform answers with a non-empty model list
    async fn test_connection(&self) -> bool {
        match self.list_models().await {
            Ok(models) => !models.is_empty(),
            Err(e) => {
                tracing::error!("Platform {} connection test failed: {}", self.platform(), e);
                false
            }
        }
    }
}

/// Shared POST helper for all chat endpoints
pub(crate) async fn http_chat(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    payload: &Value,
    stream: bool,
) -> Result<ChatExchange> {
    let mut request = client
        .post(url)
        .header("Content-Type", "application/json")
        .json(payload);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(|e| {
        anyhow::Error::new(UpstreamError {
            status: None,
            body: e.to_string(),
        })
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow::Error::new(UpstreamError {
            status: Some(status.as_u16()),
            body,
        }));
    }

    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect();

    let chunk_stream: ChunkStream = if stream {
        response_lines(response)
    } else {
        let text = response.text().await.map_err(|e| {
            anyhow::Error::new(UpstreamError {
                status: None,
                body: e.to_string(),
            })
        })?;
        Box::pin(futures::stream::once(async move { Ok(text) }))
    };

    Ok(ChatExchange {
        headers,
        stream: chunk_stream,
    })
}

/// Split a response byte stream into trimmed non-empty lines
///
/// Works for SSE (`data: {...}` lines) and NDJSON alike; partial lines are
/// buffered until their newline arrives, and a trailing unterminated line is
/// flushed when the stream ends.
fn response_lines(response: reqwest::Response) -> ChunkStream {
    struct LineState {
        inner: Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
        buffer: String,
        pending: std::collections::VecDeque<String>,
        done: bool,
    }

    let state = LineState {
        inner: Box::pin(response.bytes_stream()),
        buffer: String::new(),
        pending: std::collections::VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.pending.pop_front() {
                return Some((Ok(line), state));
            }
            if state.done {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = state.buffer.find('\n') {
                        let line = state.buffer[..pos].trim_end_matches('\r').to_string();
                        state.buffer.drain(..=pos);
                        if !line.trim().is_empty() {
                            state.pending.push_back(line);
                        }
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((
                        Err(anyhow::Error::new(UpstreamError {
                            status: None,
                            body: e.to_string(),
                        })),
                        state,
                    ));
                }
                None => {
                    state.done = true;
                    let rest = state.buffer.trim();
                    if !rest.is_empty() {
                        let line = rest.to_string();
                        state.buffer.clear();
                        state.pending.push_back(line);
                    }
                }
            }
        }
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Loaded platform clients, keyed by platform type
///
/// Built once at startup and rebuilt on admin-triggered reinitialization;
/// the whole registry is swapped as an immutable snapshot so readers never
/// observe a torn update.
pub struct ProviderRegistry {
    platforms: HashMap<PlatformType, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            platforms: HashMap::new(),
        }
    }

    /// Build clients for the given configs, skipping ones that cannot load
    pub fn from_configs(configs: Vec<ProviderConfig>) -> Self {
        let mut platforms: HashMap<PlatformType, Arc<dyn ProviderClient>> = HashMap::new();
        for config in configs {
            let platform = config.platform;
            if !platform.is_local() && config.api_key.is_empty() {
                tracing::warn!("{} has no API key configured, calls will fail", platform);
            }
            let client: Arc<dyn ProviderClient> = match platform {
                PlatformType::DashScope => Arc::new(DashScopeClient::new(config)),
                PlatformType::OpenRouter => Arc::new(OpenRouterClient::new(config)),
                PlatformType::Ollama => Arc::new(OllamaClient::new(config)),
                PlatformType::LmStudio => Arc::new(LmStudioClient::new(config)),
                PlatformType::SiliconFlow => Arc::new(SiliconFlowClient::new(config)),
                PlatformType::OpenAiCompatible => {
                    if config.base_url.is_empty() {
                        tracing::warn!("openai_compatible platform has no base_url, skipping");
                        continue;
                    }
                    Arc::new(OpenAiCompatibleClient::new(config))
                }
            };
            platforms.insert(platform, client);
        }
        tracing::info!("Provider registry loaded with {} platform(s)", platforms.len());
        Self { platforms }
    }

    pub fn get(&self, platform: PlatformType) -> Option<Arc<dyn ProviderClient>> {
        self.platforms.get(&platform).cloned()
    }

    pub fn is_loaded(&self, platform: PlatformType) -> bool {
        self.platforms.contains_key(&platform)
    }

    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }

    /// Model lists from every loaded platform; per-platform failures are
    /// logged and skipped so one dead upstream cannot hide the others
    pub async fn all_models(&self) -> Vec<ModelInfo> {
        let mut all = Vec::new();
        for (platform, client) in &self.platforms {
            match client.list_models().await {
                Ok(models) => {
                    tracing::info!("{} returned {} model(s)", platform, models.len());
                    all.extend(models);
                }
                Err(e) => tracing::error!("Failed to list {} models: {}", platform, e),
            }
        }
        all
    }

    /// Connectivity check for every loaded platform
    pub async fn test_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for (platform, client) in &self.platforms {
            results.insert(platform.as_str().to_string(), client.test_connection().await);
        }
        results
    }
}
