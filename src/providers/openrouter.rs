//! OpenRouter adapter
//!
//! Standard OpenAI wire protocol at `https://openrouter.ai/api/v1`. The
//! streaming endpoint interleaves `: OPENROUTER PROCESSING` comment lines
//! with data lines; those are forwarded verbatim and dropped by the stream
//! converter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{ModelInfo, PlatformType, ProviderClient, ProviderConfig};

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

pub struct OpenRouterClient {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new(config: ProviderConfig) -> Self {
        let http = config.build_http();
        Self { config, http }
    }
}

#[async_trait]
impl ProviderClient for OpenRouterClient {
    fn platform(&self) -> PlatformType {
        PlatformType::OpenRouter
    }

    fn base_url(&self) -> String {
        OPENROUTER_BASE_URL.to_string()
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", OPENROUTER_BASE_URL)
    }

    fn bearer_token(&self) -> Option<String> {
        Some(self.config.api_key.clone())
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        if self.config.api_key.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/models", OPENROUTER_BASE_URL);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .header("Content-Type", "application/json")
            .send()
            .await
            .context("OpenRouter model listing request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("OpenRouter API error: {}", response.status());
        }

        let data: Value = response
            .json()
            .await
            .context("OpenRouter model listing was not JSON")?;
        Ok(parse_models(&data))
    }
}

fn parse_models(data: &Value) -> Vec<ModelInfo> {
    data.get("data")
        .and_then(|d| d.as_array())
        .map(|models| {
            models
                .iter()
                .filter_map(|model| {
                    let id = model.get("id")?.as_str()?;
                    Some(ModelInfo {
                        id: id.to_string(),
                        name: model
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or(id)
                            .to_string(),
                        platform: PlatformType::OpenRouter,
                        description: model
                            .get("description")
                            .and_then(|d| d.as_str())
                            .unwrap_or("")
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}
