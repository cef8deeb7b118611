//! DashScope (Alibaba Cloud Model Studio) adapter
//!
//! Speaks the OpenAI-compatible endpoint under `/compatible-mode/v1`. The
//! model listing accepts both the current `data` array and the legacy
//! `output.models` shape; when neither matches, a curated default list keeps
//! the gateway operational.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{ModelInfo, PlatformType, ProviderClient, ProviderConfig};

const DASHSCOPE_BASE_URL: &str = "https://dashscope.aliyuncs.com";

/// Fallback models used when the listing endpoint answers with an
/// unrecognized shape
const DEFAULT_MODELS: &[(&str, &str)] = &[
    ("qwen-plus", "Qwen enhanced model"),
    ("qwen-turbo", "Qwen fast model"),
    ("qwen-max", "Qwen flagship model"),
    ("qwen-coder", "Code generation and repair"),
    ("qwen3-coder-plus", "Qwen3 code enhanced model"),
    ("qwen2.5-coder-instruct", "Qwen2.5 code instruct model"),
    ("qwen2-72b-instruct", "Qwen2 72B instruct model"),
];

pub struct DashScopeClient {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl DashScopeClient {
    pub fn new(config: ProviderConfig) -> Self {
        let http = config.build_http();
        Self { config, http }
    }
}

#[async_trait]
impl ProviderClient for DashScopeClient {
    fn platform(&self) -> PlatformType {
        PlatformType::DashScope
    }

    fn base_url(&self) -> String {
        DASHSCOPE_BASE_URL.to_string()
    }

    fn chat_url(&self) -> String {
        format!("{}/compatible-mode/v1/chat/completions", DASHSCOPE_BASE_URL)
    }

    fn bearer_token(&self) -> Option<String> {
        Some(self.config.api_key.clone())
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        if self.config.api_key.is_empty() {
            tracing::warn!("DashScope API key not configured, skipping model listing");
            return Ok(Vec::new());
        }

        let url = format!("{}/compatible-mode/v1/models", DASHSCOPE_BASE_URL);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .header("Content-Type", "application/json")
            .send()
            .await
            .context("DashScope model listing request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("DashScope API error: {}", response.status());
        }

        let data: Value = response
            .json()
            .await
            .context("DashScope model listing was not JSON")?;
        Ok(parse_models(&data))
    }
}

/// Map a listing response to models, falling back to the curated defaults
fn parse_models(data: &Value) -> Vec<ModelInfo> {
    // Legacy shape: {"output": {"models": [{"model_name": ...}]}}
    if let Some(models) = data
        .get("output")
        .and_then(|o| o.get("models"))
        .and_then(|m| m.as_array())
    {
        return models
            .iter()
            .filter_map(|model| {
                let name = model.get("model_name")?.as_str()?;
                Some(ModelInfo {
                    id: name.to_string(),
                    name: name.to_string(),
                    platform: PlatformType::DashScope,
                    description: format!(
                        "capacity: {}",
                        model.get("base_capacity").and_then(|c| c.as_u64()).unwrap_or(1)
                    ),
                })
            })
            .collect();
    }

    // OpenAI-compatible shape: {"data": [{"id": ...}]}
    if let Some(models) = data.get("data").and_then(|d| d.as_array()) {
        return models
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
                    platform: PlatformType::DashScope,
                    description: model
                        .get("description")
                        .and_then(|d| d.as_str())
                        .unwrap_or("")
                        .to_string(),
                })
            })
            .collect();
    }

    tracing::info!("DashScope listing shape not recognized, using default model list");
    DEFAULT_MODELS
        .iter()
        .map(|(id, description)| ModelInfo {
            id: id.to_string(),
            name: id.to_string(),
            platform: PlatformType::DashScope,
            description: description.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_openai_shape() {
        let data = json!({"data": [{"id": "qwen-max", "description": "flagship"}]});
        let models = parse_models(&data);
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "qwen-max");
        assert_eq!(models[0].description, "flagship");
    }

    #[test]
    fn test_parse_legacy_output_shape() {
        let data = json!({"output": {"models": [{"model_name": "qwen-plus", "base_capacity": 2}]}});
        let models = parse_models(&data);
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "qwen-plus");
        assert_eq!(models[0].description, "capacity: 2");
    }

    #[test]
    fn test_unrecognized_shape_falls_back_to_defaults() {
        let data = json!({"unexpected": true});
        let models = parse_models(&data);
        assert_eq!(models.len(), DEFAULT_MODELS.len());
        assert!(models.iter().any(|m| m.id == "qwen-plus"));
    }
}
