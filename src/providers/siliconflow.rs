//! SiliconFlow adapter
//!
//! Hosted OpenAI-compatible platform at `https://api.siliconflow.cn`. Like
//! DashScope, the model listing falls back to a curated default list when
//! the upstream answers with an unrecognized shape.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{ModelInfo, PlatformType, ProviderClient, ProviderConfig};

const SILICONFLOW_BASE_URL: &str = "https://api.siliconflow.cn";

const DEFAULT_MODELS: &[(&str, &str)] = &[
    ("Qwen/QwQ-32B", "Qwen reasoning model, 32B"),
    ("Qwen/Qwen2.5-72B-Instruct", "Qwen2.5 72B instruct model"),
    ("Qwen/Qwen2.5-32B-Instruct", "Qwen2.5 32B instruct model"),
    ("Qwen/Qwen2.5-14B-Instruct", "Qwen2.5 14B instruct model"),
    ("Qwen/Qwen2.5-7B-Instruct", "Qwen2.5 7B instruct model"),
    ("meta-llama/Llama-3.1-70B-Instruct", "Llama 3.1 70B instruct model"),
    ("meta-llama/Llama-3.1-8B-Instruct", "Llama 3.1 8B instruct model"),
    ("deepseek-ai/DeepSeek-V2.5", "DeepSeek V2.5"),
];

pub struct SiliconFlowClient {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl SiliconFlowClient {
    pub fn new(config: ProviderConfig) -> Self {
        let http = config.build_http();
        Self { config, http }
    }
}

#[async_trait]
impl ProviderClient for SiliconFlowClient {
    fn platform(&self) -> PlatformType {
        PlatformType::SiliconFlow
    }

    fn base_url(&self) -> String {
        SILICONFLOW_BASE_URL.to_string()
    }

    fn chat_url(&self) -> String {
        format!("{}/v1/chat/completions", SILICONFLOW_BASE_URL)
    }

    fn bearer_token(&self) -> Option<String> {
        Some(self.config.api_key.clone())
    }

    fn http(&self) -> &reqwest::Client {
        &self.http
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        if self.config.api_key.is_empty() {
            tracing::warn!("SiliconFlow API key not configured, skipping model listing");
            return Ok(Vec::new());
        }

        let url = format!("{}/v1/models", SILICONFLOW_BASE_URL);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .header("Content-Type", "application/json")
            .send()
            .await
            .context("SiliconFlow model listing request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("SiliconFlow API error: {}", response.status());
        }

        let data: Value = response
            .json()
            .await
            .context("SiliconFlow model listing was not JSON")?;
        Ok(parse_models(&data))
    }
}

fn parse_models(data: &Value) -> Vec<ModelInfo> {
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
                    platform: PlatformType::SiliconFlow,
                    description: model
                        .get("description")
                        .and_then(|d| d.as_str())
                        .unwrap_or("")
                        .to_string(),
                })
            })
            .collect();
    }

    tracing::info!("SiliconFlow listing shape not recognized, using default model list");
    DEFAULT_MODELS
        .iter()
        .map(|(id, description)| ModelInfo {
            id: id.to_string(),
            name: id.rsplit('/').next().unwrap_or(id).to_string(),
            platform: PlatformType::SiliconFlow,
            description: description.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_data_shape() {
        let data = json!({"data": [{"id": "Qwen/QwQ-32B"}]});
        let models = parse_models(&data);
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "Qwen/QwQ-32B");
    }

    #[test]
    fn test_fallback_defaults_strip_vendor_prefix_in_name() {
        let models = parse_models(&json!({}));
        assert_eq!(models.len(), DEFAULT_MODELS.len());
        let qwq = models.iter().find(|m| m.id == "Qwen/QwQ-32B").unwrap();
        assert_eq!(qwq.name, "QwQ-32B");
    }
}
