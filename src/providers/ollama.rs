//! Ollama adapter
//!
//! Local inference server. The chat endpoint (`/api/chat`) is not SSE: it
//! streams newline-delimited JSON objects, one per chunk, with `done: true`
//! on the final object. The shared line splitter yields exactly one JSON
//! object per item, which the stream converter understands as the Ollama
//! flavor. No authentication.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{ModelInfo, PlatformType, ProviderClient, ProviderConfig};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaClient {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: ProviderConfig) -> Self {
        let http = config.build_http();
        Self { config, http }
    }

    fn effective_base(&self) -> String {
        if self.config.base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            self.config.base_url.trim_end_matches('/').to_string()
        }
    }
}

#[async_trait]
impl ProviderClient for OllamaClient {
    fn platform(&self) -> PlatformType {
        PlatformType::Ollama
    }

    fn base_url(&self) -> String {
        self.effective_base()
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.effective_base())
    }

    fn bearer_token(&self) -> Option<String> {
        None
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/api/tags", self.effective_base());
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("Ollama model listing request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Ollama API error: {}", response.status());
        }

        let data: Value = response
            .json()
            .await
            .context("Ollama model listing was not JSON")?;
        Ok(parse_models(&data))
    }
}

fn parse_models(data: &Value) -> Vec<ModelInfo> {
    data.get("models")
        .and_then(|m| m.as_array())
        .map(|models| {
            models
                .iter()
                .filter_map(|model| {
                    let name = model.get("name")?.as_str()?;
                    Some(ModelInfo {
                        id: name.to_string(),
                        name: name.to_string(),
                        platform: PlatformType::Ollama,
                        description: format!(
                            "size: {}",
                            model.get("size").and_then(|s| s.as_u64()).unwrap_or(0)
                        ),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}
