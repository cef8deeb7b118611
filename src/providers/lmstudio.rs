//! LMStudio adapter
//!
//! Local inference server exposing the OpenAI wire protocol under `/v1`.
//! No authentication.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{ModelInfo, PlatformType, ProviderClient, ProviderConfig};

const DEFAULT_BASE_URL: &str = "http://localhost:1234";

pub struct LmStudioClient {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl LmStudioClient {
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
impl ProviderClient for LmStudioClient {
    fn platform(&self) -> PlatformType {
        PlatformType::LmStudio
    }

    fn base_url(&self) -> String {
        self.effective_base()
    }

    fn chat_url(&self) -> String {
        format!("{}/v1/chat/completions", self.effective_base())
    }

    fn bearer_token(&self) -> Option<String> {
        None
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/v1/models", self.effective_base());
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("LMStudio model listing request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("LMStudio API error: {}", response.status());
        }

        let data: Value = response
            .json()
            .await
            .context("LMStudio model listing was not JSON")?;
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
                        name: id.to_string(),
                        platform: PlatformType::LmStudio,
                        description: "LMStudio local model".to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}
