//! Generic OpenAI-compatible adapter
//!
//! For any upstream that speaks the OpenAI wire protocol. The base URL must
//! be configured (it is expected to include the version segment, e.g.
//! `https://api.example.com/v1`); there is no sensible default.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{ModelInfo, PlatformType, ProviderClient, ProviderConfig};

pub struct OpenAiCompatibleClient {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl OpenAiCompatibleClient {
    pub fn new(config: ProviderConfig) -> Self {
        let http = config.build_http();
        Self { config, http }
    }

    fn effective_base(&self) -> String {
        self.config.base_url.trim_end_matches('/').to_string()
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatibleClient {
    fn platform(&self) -> PlatformType {
        PlatformType::OpenAiCompatible
    }

    fn base_url(&self) -> String {
        self.effective_base()
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.effective_base())
    }

    fn bearer_token(&self) -> Option<String> {
        Some(self.config.api_key.clone())
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        if self.config.base_url.is_empty() || self.config.api_key.is_empty() {
            tracing::warn!("openai_compatible platform missing base_url or api_key");
            return Ok(Vec::new());
        }

        let url = format!("{}/models", self.effective_base());
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .header("Content-Type", "application/json")
            .send()
            .await
            .context("Model listing request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("API error: {}", response.status());
        }

        let data: Value = response
            .json()
            .await
            .context("Model listing was not JSON")?;
        Ok(parse_models(&data))
    }
}

/// Accepts both `{"data": [...]}` and a bare JSON array of model objects
fn parse_models(data: &Value) -> Vec<ModelInfo> {
    let items = match data.get("data").and_then(|d| d.as_array()) {
        Some(items) => items,
        None => match data.as_array() {
            Some(items) => items,
            None => return Vec::new(),
        },
    };

    items
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
                platform: PlatformType::OpenAiCompatible,
                description: model
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or("")
                    .to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_url_appends_to_configured_base() {
        let client = OpenAiCompatibleClient::new(ProviderConfig {
            platform: PlatformType::OpenAiCompatible,
            api_key: "sk-123".to_string(),
            base_url: "https://api.example.com/v1/".to_string(),
            timeout_sec: 30,
        });
        assert_eq!(client.chat_url(), "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn test_parse_data_and_bare_array_shapes() {
        let wrapped = json!({"data": [{"id": "glm-4"}]});
        assert_eq!(parse_models(&wrapped).len(), 1);

        let bare = json!([{"id": "glm-4"}, {"id": "glm-4-air"}]);
        assert_eq!(parse_models(&bare).len(), 2);

        assert!(parse_models(&json!({"status": "ok"})).is_empty());
    }
}
