//! Request routing: picks the upstream (platform, model) for each call
//!
//! Three modes, selected by the active routing configuration:
//!
//! - `claude_code`: legacy passthrough, routing is a no-op
//! - `global_direct`: walk an ordered model priority list, first loaded wins
//! - `smart_routing`: classify the last user message into a scene with a
//!   small routing model, then walk that scene's fallback list
//!
//! The snapshot is immutable; admin mutations build a new one and swap it,
//! so in-flight requests keep routing against the configuration they saw at
//! entry.

use std::fmt;
use std::sync::OnceLock;

use anyhow::Result;
use futures::StreamExt;
use regex::Regex;
use serde_json::{json, Value};

use crate::providers::{PlatformType, ProviderRegistry};
use crate::store::{SceneRow, Store};

/// Legacy endpoint used in claude_code mode when none is configured
pub const DEFAULT_LEGACY_URL: &str =
    "https://dashscope.aliyuncs.com/api/v2/apps/claude-code-proxy";

/// Legacy Claude-Code servers stream long answers; they get a longer timeout
pub const DEFAULT_LEGACY_TIMEOUT_SEC: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    ClaudeCode,
    GlobalDirect,
    SmartRouting,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMode::ClaudeCode => "claude_code",
            RoutingMode::GlobalDirect => "global_direct",
            RoutingMode::SmartRouting => "smart_routing",
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scene: a named cluster of user intents with an ordered fallback list
/// of model specs
#[derive(Debug, Clone)]
pub struct Scene {
    pub name: String,
    pub description: String,
    pub models: Vec<String>,
}

impl From<SceneRow> for Scene {
    fn from(row: SceneRow) -> Self {
        Scene {
            name: row.scene_name,
            description: row.scene_description,
            models: row.models,
        }
    }
}

/// Target of the claude_code passthrough mode
#[derive(Debug, Clone)]
pub struct PassthroughTarget {
    pub url: String,
    pub timeout_sec: u64,
}

impl Default for PassthroughTarget {
    fn default() -> Self {
        Self {
            url: DEFAULT_LEGACY_URL.to_string(),
            timeout_sec: DEFAULT_LEGACY_TIMEOUT_SEC,
        }
    }
}

/// Immutable routing configuration captured at request entry
#[derive(Debug, Clone)]
pub struct RoutingSnapshot {
    pub mode: RoutingMode,
    /// global_direct: ordered priority list of model specs
    pub model_priority_list: Vec<String>,
    /// smart_routing: ordered priority list of classifier models
    pub routing_models: Vec<String>,
    /// smart_routing: enabled scenes, ordered by priority
    pub scenes: Vec<Scene>,
    pub passthrough: PassthroughTarget,
}

impl RoutingSnapshot {
    /// Mode used when no routing configuration is active
    pub fn claude_code_default() -> Self {
        Self {
            mode: RoutingMode::ClaudeCode,
            model_priority_list: Vec::new(),
            routing_models: Vec::new(),
            scenes: Vec::new(),
            passthrough: PassthroughTarget::default(),
        }
    }

    /// Build a snapshot from the active routing config in the database
    pub fn from_store(store: &Store) -> Result<Self> {
        let Some(config) = store.active_routing_config()? else {
            return Ok(Self::claude_code_default());
        };

        let data: Value = serde_json::from_str(&config.config_data).unwrap_or_else(|e| {
            tracing::error!("Unparseable routing config data: {}", e);
            json!({})
        });

        let snapshot = match config.config_type.as_str() {
            "global_direct" => Self {
                mode: RoutingMode::GlobalDirect,
                model_priority_list: string_list(&data, "model_priority_list"),
                routing_models: Vec::new(),
                scenes: Vec::new(),
                passthrough: PassthroughTarget::default(),
            },
            "smart_routing" => {
                let scenes = store
                    .scenes_for_config(config.id)?
                    .into_iter()
                    .map(Scene::from)
                    .collect();
                Self {
                    mode: RoutingMode::SmartRouting,
                    model_priority_list: Vec::new(),
                    routing_models: string_list(&data, "routing_models"),
                    scenes,
                    passthrough: PassthroughTarget::default(),
                }
            }
            "claude_code" => Self {
                mode: RoutingMode::ClaudeCode,
                model_priority_list: Vec::new(),
                routing_models: Vec::new(),
                scenes: Vec::new(),
                passthrough: PassthroughTarget {
                    url: data
                        .get("target_url")
                        .and_then(|u| u.as_str())
                        .unwrap_or(DEFAULT_LEGACY_URL)
                        .to_string(),
                    timeout_sec: data
                        .get("timeout_sec")
                        .and_then(|t| t.as_u64())
                        .unwrap_or(DEFAULT_LEGACY_TIMEOUT_SEC),
                },
            },
            other => {
                tracing::error!("Unknown routing config type '{}', using passthrough", other);
                Self::claude_code_default()
            }
        };
        Ok(snapshot)
    }
}

fn string_list(data: &Value, key: &str) -> Vec<String> {
    data.get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

/// Outcome of routing one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// claude_code mode: proxy the raw call to the legacy endpoint
    Passthrough,
    Dispatch {
        platform: PlatformType,
        model_id: String,
        /// Scene name when smart routing picked one
        scene: Option<String>,
    },
}

/// Routing failed: no adapter for any candidate model
#[derive(Debug)]
pub struct RoutingError(pub String);

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RoutingError {}

/// Router over one snapshot and one registry snapshot
pub struct Router<'a> {
    snapshot: &'a RoutingSnapshot,
    registry: &'a ProviderRegistry,
}

impl<'a> Router<'a> {
    pub fn new(snapshot: &'a RoutingSnapshot, registry: &'a ProviderRegistry) -> Self {
        Self { snapshot, registry }
    }

    /// Route a request given the flattened last user message
    pub async fn route(&self, last_user_message: &str) -> Result<RouteDecision, RoutingError> {
        match self.snapshot.mode {
            RoutingMode::ClaudeCode => Ok(RouteDecision::Passthrough),
            RoutingMode::GlobalDirect => self.route_global_direct(),
            RoutingMode::SmartRouting => self.route_smart(last_user_message).await,
        }
    }

    fn route_global_direct(&self) -> Result<RouteDecision, RoutingError> {
        match self.first_loaded(&self.snapshot.model_priority_list) {
            Some((platform, model_id)) => Ok(RouteDecision::Dispatch {
                platform,
                model_id,
                scene: None,
            }),
            None => Err(RoutingError(
                "None of the configured models has a loaded platform adapter".to_string(),
            )),
        }
    }

    async fn route_smart(&self, last_user_message: &str) -> Result<RouteDecision, RoutingError> {
        let scenes = &self.snapshot.scenes;
        if scenes.is_empty() {
            return Err(RoutingError("No routing scenes are configured".to_string()));
        }

        let scene = self.classify_scene(last_user_message, scenes).await;

        match self.first_loaded(&scene.models) {
            Some((platform, model_id)) => Ok(RouteDecision::Dispatch {
                platform,
                model_id,
                scene: Some(scene.name.clone()),
            }),
            None => Err(RoutingError(format!(
                "All models for scene '{}' are unavailable",
                scene.name
            ))),
        }
    }

    /// Ask each routing model in turn for a scene number; all failures fall
    /// back to the first scene (the default)
    async fn classify_scene<'s>(&self, user_message: &str, scenes: &'s [Scene]) -> &'s Scene {
        let prompt = judgment_prompt(user_message, scenes);

        for routing_model in &self.snapshot.routing_models {
            let Some((platform, model_id)) = parse_model_spec(routing_model) else {
                tracing::error!("Invalid routing model spec: {}", routing_model);
                continue;
            };
            let Some(client) = self.registry.get(platform) else {
                tracing::debug!("Routing model platform {} not loaded", platform);
                continue;
            };

            let messages = vec![json!({"role": "user", "content": prompt})];
            let reply = match client
                .chat(&model_id, &messages, false, &serde_json::Map::new())
                .await
            {
                Ok(stream) => read_reply_content(stream).await,
                Err(e) => {
                    tracing::error!("Routing model {} failed: {}", routing_model, e);
                    continue;
                }
            };

            if let Some(reply) = reply {
                if let Some(index) = parse_scene_number(&reply) {
                    if index >= 1 && index <= scenes.len() {
                        tracing::debug!(
                            "Scene classifier {} picked scene {} ({})",
                            routing_model,
                            index,
                            scenes[index - 1].name
                        );
                        return &scenes[index - 1];
                    }
                }
                tracing::debug!("Unusable classifier reply: {:?}", reply);
            }
        }

        // The default scene is always first after a config save
        &scenes[0]
    }

    fn first_loaded(&self, model_specs: &[String]) -> Option<(PlatformType, String)> {
        for spec in model_specs {
            match parse_model_spec(spec) {
                Some((platform, model_id)) => {
                    if self.registry.is_loaded(platform) {
                        return Some((platform, model_id));
                    }
                }
                None => tracing::error!("Invalid model spec: {}", spec),
            }
        }
        None
    }
}

/// Parse `"<platform_type>:<model_id>"`
pub fn parse_model_spec(spec: &str) -> Option<(PlatformType, String)> {
    let (platform_str, model_id) = spec.split_once(':')?;
    let platform = PlatformType::parse(platform_str)?;
    if model_id.is_empty() {
        return None;
    }
    Some((platform, model_id.to_string()))
}

/// Compose the classifier prompt: numbered scene list, answer with the
/// number only
fn judgment_prompt(user_message: &str, scenes: &[Scene]) -> String {
    let scene_lines: Vec<String> = scenes
        .iter()
        .enumerate()
        .map(|(i, scene)| format!("{}. {}: {}", i + 1, scene.name, scene.description))
        .collect();

    format!(
        "Decide which scene the following user request belongs to. \
         Reply with the scene number only (1-{count}).\n\n\
         User request: {message}\n\n\
         Scenes:\n{scenes}\n\n\
         Reply with the single scene number (e.g. 1, 2, 3). \
         No explanation, no other text.",
        count = scenes.len(),
        message = user_message,
        scenes = scene_lines.join("\n"),
    )
}

/// Pull the assistant text out of a non-streaming classifier reply
async fn read_reply_content(mut stream: crate::providers::ChunkStream) -> Option<String> {
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { continue };
        if let Ok(data) = serde_json::from_str::<Value>(&chunk) {
            if let Some(content) = data
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(|t| t.as_str())
            {
                return Some(content.to_string());
            }
        }
    }
    None
}

/// First integer appearing anywhere in the reply
fn parse_scene_number(reply: &str) -> Option<usize> {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let re = NUMBER.get_or_init(|| Regex::new(r"\d+").expect("static regex"));
    re.find(reply.trim())?.as_str().parse().ok()
}
