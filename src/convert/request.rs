//! Anthropic → OpenAI request conversion
//!
//! Converts an Anthropic Messages request into the payload sent upstream.
//!
//! # Key Transformations
//!
//! | Anthropic                       | Upstream                            |
//! |---------------------------------|-------------------------------------|
//! | Top-level `system` field        | `messages[0]` with role "system"    |
//! | Array `content` blocks          | Flattened prose string              |
//! | `image` blocks                  | `[Image: <media_type>]` placeholder |
//! | `tool_use` blocks               | "Called tool" prose                 |
//! | `tools` schemas                 | `<use_tool>` grammar system prompt  |
//!
//! Tool schemas never reach the upstream as structured `tools`: they are
//! compressed into the system prompt so backends without native tool support
//! still see them, and the stream converter recovers tool calls from the
//! `<use_tool>` convention on the way back.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::providers::PlatformType;

/// DashScope rejects max_tokens outside this range
const DASHSCOPE_MAX_TOKENS_RANGE: (u64, u64) = (1, 8192);

/// Request parameters that only make sense on the Anthropic side
const ANTHROPIC_ONLY_PARAMS: [&str; 3] = [
    "anthropic-version",
    "anthropic-beta",
    "anthropic-dangerous-direct-browser-access",
];

// ─────────────────────────────────────────────────────────────────────────────
// Inbound Request Types
// ─────────────────────────────────────────────────────────────────────────────

/// An Anthropic-shaped chat request as received from the client
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub system: Option<SystemPrompt>,
    #[serde(default)]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    /// Everything else (max_tokens, temperature, metadata, ...) passes
    /// through the per-platform filter unchanged
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(default)]
        content: Option<ToolResultContent>,
    },
    // Extended thinking blocks are dropped, they are not part of the
    // upstream protocol
    #[serde(rename = "thinking")]
    Thinking {
        #[allow(dead_code)]
        thinking: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ToolResultBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ToolResultBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
pub struct ImageSource {
    #[serde(default)]
    pub media_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum SystemBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

// ─────────────────────────────────────────────────────────────────────────────
// Payload Construction
// ─────────────────────────────────────────────────────────────────────────────

/// Build the complete upstream payload for one request
///
/// `target_model` is the routed model id, not the name the client asked for.
pub fn build_upstream_payload(
    request: &ChatRequest,
    platform: PlatformType,
    target_model: &str,
    stream: bool,
) -> Value {
    let mut messages = flatten_messages(&request.messages);

    // Non-empty system becomes the first message
    if let Some(system_text) = system_text(&request.system) {
        if !system_text.is_empty() {
            messages.insert(0, json!({"role": "system", "content": system_text}));
        }
    }

    // Tool schemas are appended to the system message as the <use_tool> grammar
    let has_tools = matches!(&request.tools, Some(tools) if !tools.is_empty());
    if let Some(tools) = &request.tools {
        if !tools.is_empty() {
            append_tools_prompt(&mut messages, tools);
        }
    }

    let mut payload = json!({
        "model": target_model,
        "messages": messages,
        "stream": stream,
    });

    let filtered = filter_params(&request.extra, platform);
    if let Some(obj) = payload.as_object_mut() {
        for (key, value) in filtered {
            obj.insert(key, value);
        }
        // tool_choice only survives when tools were not compressed away and
        // the platform accepts it on its own
        if !has_tools {
            if let Some(tool_choice) = &request.tool_choice {
                if keeps_bare_tool_choice(platform) {
                    obj.insert("tool_choice".to_string(), tool_choice.clone());
                }
            }
        }
    }

    payload
}

/// Flatten Anthropic messages into plain-prose OpenAI messages
pub fn flatten_messages(messages: &[InboundMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| {
            json!({
                "role": message.role,
                "content": flatten_content(&message.content),
            })
        })
        .collect()
}

fn flatten_content(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Blocks(blocks) => {
            let mut text_content = String::new();
            let mut tool_descriptions: Vec<String> = Vec::new();

            for block in blocks {
                match block {
                    ContentBlock::Text { text } => text_content.push_str(text),
                    ContentBlock::Image { source } => {
                        let media_type = if source.media_type.is_empty() {
                            "image"
                        } else {
                            &source.media_type
                        };
                        text_content.push_str(&format!("[Image: {}]", media_type));
                    }
                    ContentBlock::ToolUse { name, input } => {
                        let mut desc = format!("Called tool: {}", name);
                        if !matches!(input, Value::Null)
                            && input.as_object().map(|o| !o.is_empty()).unwrap_or(true)
                        {
                            let args = serde_json::to_string_pretty(input).unwrap_or_default();
                            desc.push_str(&format!("\nArguments: {}", args));
                        }
                        tool_descriptions.push(desc);
                    }
                    ContentBlock::ToolResult { content } => {
                        if let Some(text) = tool_result_text(content) {
                            if !text.is_empty() {
                                if !text_content.is_empty() {
                                    text_content.push('\n');
                                }
                                text_content.push_str(&text);
                            }
                        }
                    }
                    ContentBlock::Thinking { .. } => {}
                }
            }

            if !tool_descriptions.is_empty() {
                let tool_text = tool_descriptions.join("\n\n");
                text_content = format!("{}\n\n{}", text_content, tool_text)
                    .trim()
                    .to_string();
            }

            text_content
        }
    }
}

fn tool_result_text(content: &Option<ToolResultContent>) -> Option<String> {
    match content {
        None => None,
        Some(ToolResultContent::Text(text)) => Some(text.clone()),
        Some(ToolResultContent::Blocks(blocks)) => Some(
            blocks
                .iter()
                .map(|ToolResultBlock::Text { text }| text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        ),
    }
}

/// The last user message flattened to plain text, for scene classification
///
/// Array content keeps only `text` items, joined with spaces.
pub fn extract_last_user_message(messages: &[InboundMessage]) -> String {
    for message in messages.iter().rev() {
        if message.role == "user" {
            return match &message.content {
                MessageContent::Text(text) => text.clone(),
                MessageContent::Blocks(blocks) => blocks
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            };
        }
    }
    String::new()
}

/// Join the top-level system value into one string (array form joined on
/// newlines)
fn system_text(system: &Option<SystemPrompt>) -> Option<String> {
    match system {
        None => None,
        Some(SystemPrompt::Text(text)) => Some(text.clone()),
        Some(SystemPrompt::Blocks(blocks)) => Some(
            blocks
                .iter()
                .map(|SystemBlock::Text { text }| text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        ),
    }
}

/// Append the tool-usage grammar to the system message, creating one if the
/// request had none
fn append_tools_prompt(messages: &mut Vec<Value>, tools: &[ToolDefinition]) {
    let prompt = tools_system_prompt(tools);

    for message in messages.iter_mut() {
        if message.get("role").and_then(|r| r.as_str()) == Some("system") {
            let existing = message
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or("")
                .to_string();
            message["content"] = json!(format!("{}{}", existing, prompt));
            return;
        }
    }

    messages.insert(0, json!({"role": "system", "content": prompt}));
}

/// Render the tool descriptions and the strict `<use_tool>` grammar
fn tools_system_prompt(tools: &[ToolDefinition]) -> String {
    let mut prompt = String::from("\n\n=== Available Tools ===\n");
    prompt.push_str(
        "You have access to the following tools. You MUST follow the exact XML format specified below.\n\n",
    );

    for tool in tools {
        prompt.push_str(&format!("**{}**\n", tool.name));
        prompt.push_str(&format!(
            "Description: {}\n",
            tool.description.as_deref().unwrap_or("No description")
        ));

        if let Some(properties) = tool
            .input_schema
            .get("properties")
            .and_then(|p| p.as_object())
        {
            let required: Vec<&str> = tool
                .input_schema
                .get("required")
                .and_then(|r| r.as_array())
                .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
                .unwrap_or_default();

            prompt.push_str("Parameters:\n");
            for (param_name, param_info) in properties {
                let param_type = param_info
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("unknown");
                let param_desc = param_info
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or("No description");
                let requirement = if required.contains(&param_name.as_str()) {
                    "required"
                } else {
                    "optional"
                };
                prompt.push_str(&format!(
                    "  - {} ({}) ({}): {}\n",
                    param_name, param_type, requirement, param_desc
                ));
            }
        }
        prompt.push('\n');
    }

    prompt.push_str(
        r#"**CRITICAL TOOL USAGE REQUIREMENTS:**

YOU MUST use tools in the EXACT format specified below. NO EXCEPTIONS.

**MANDATORY FORMAT:**
<use_tool>
<tool_name>exact_tool_name</tool_name>
<parameters>
{
  "parameter1": "value1",
  "parameter2": "value2"
}
</parameters>
</use_tool>

**STRICT RULES:**
1. NEVER describe a tool call in plain prose like "Tool: Bash"
2. ALWAYS use the <use_tool> XML tags exactly as shown
3. Tool names MUST match exactly what's listed above
4. Parameters MUST be valid JSON
5. NO additional text between the XML tags
6. NO explanations inside the tool call

**CORRECT Example:**
<use_tool>
<tool_name>Bash</tool_name>
<parameters>
{
  "command": "ls -la",
  "description": "List files"
}
</parameters>
</use_tool>

Multiple tools can be used by repeating the <use_tool> block, but only one
tool at a time. Before responding, verify that ALL tool calls use the exact
format:
<use_tool><tool_name>NAME</tool_name><parameters>{JSON}</parameters></use_tool>

"#,
    );

    prompt
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-Platform Parameter Handling
// ─────────────────────────────────────────────────────────────────────────────

fn keeps_bare_tool_choice(platform: PlatformType) -> bool {
    // OpenRouter rejects tool_choice without tools; DashScope and the local
    // servers reject it outright
    matches!(
        platform,
        PlatformType::SiliconFlow | PlatformType::OpenAiCompatible
    )
}

/// Drop parameters the target platform does not accept and clamp the rest
fn filter_params(extra: &Map<String, Value>, platform: PlatformType) -> Map<String, Value> {
    let mut filtered = Map::new();

    for (key, value) in extra {
        if ANTHROPIC_ONLY_PARAMS.contains(&key.as_str()) {
            continue;
        }
        let dropped_for_platform = match platform {
            PlatformType::DashScope | PlatformType::Ollama | PlatformType::LmStudio => {
                matches!(key.as_str(), "tools" | "tool_choice" | "metadata")
            }
            _ => false,
        };
        if dropped_for_platform {
            continue;
        }
        filtered.insert(key.clone(), value.clone());
    }

    if platform == PlatformType::DashScope {
        if let Some(max_tokens) = filtered.get("max_tokens").and_then(|v| v.as_u64()) {
            let (min, max) = DASHSCOPE_MAX_TOKENS_RANGE;
            let clamped = max_tokens.clamp(min, max);
            if clamped != max_tokens {
                tracing::debug!("DashScope max_tokens clamped {} -> {}", max_tokens, clamped);
                filtered.insert("max_tokens".to_string(), json!(clamped));
            }
        }
    }

    filtered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_request(body: &str) -> ChatRequest {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_simple_request() {
        let request = parse_request(
            r#"{
                "model": "claude-x",
                "max_tokens": 1024,
                "messages": [{"role": "user", "content": "Hello"}]
            }"#,
        );
        let payload =
            build_upstream_payload(&request, PlatformType::OpenRouter, "openai/gpt-4o-mini", true);

        assert_eq!(payload["model"], "openai/gpt-4o-mini");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["max_tokens"], 1024);
        assert_eq!(payload["messages"][0]["role"], "user");
        assert_eq!(payload["messages"][0]["content"], "Hello");
    }

    #[test]
    fn test_system_string_becomes_first_message() {
        let request = parse_request(
            r#"{
                "model": "claude-x",
                "system": "You are helpful",
                "messages": [{"role": "user", "content": "Hi"}]
            }"#,
        );
        let payload = build_upstream_payload(&request, PlatformType::OpenRouter, "m", false);

        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][0]["content"], "You are helpful");
        assert_eq!(payload["messages"][1]["role"], "user");
    }

    #[test]
    fn test_system_array_joined_on_newlines() {
        let request = parse_request(
            r#"{
                "model": "claude-x",
                "system": [
                    {"type": "text", "text": "line one"},
                    {"type": "text", "text": "line two"}
                ],
                "messages": [{"role": "user", "content": "Hi"}]
            }"#,
        );
        let payload = build_upstream_payload(&request, PlatformType::OpenRouter, "m", false);

        assert_eq!(payload["messages"][0]["content"], "line one\nline two");
    }

    #[test]
    fn test_array_content_flattened() {
        let request = parse_request(
            r#"{
                "model": "claude-x",
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": "look: "},
                        {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "aaaa"}}
                    ]
                }]
            }"#,
        );
        let payload = build_upstream_payload(&request, PlatformType::OpenRouter, "m", false);

        assert_eq!(payload["messages"][0]["content"], "look: [Image: image/png]");
    }

    #[test]
    fn test_tool_use_compressed_to_prose() {
        let request = parse_request(
            r#"{
                "model": "claude-x",
                "messages": [{
                    "role": "assistant",
                    "content": [
                        {"type": "text", "text": "Running it."},
                        {"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls"}}
                    ]
                }]
            }"#,
        );
        let payload = build_upstream_payload(&request, PlatformType::OpenRouter, "m", false);

        let content = payload["messages"][0]["content"].as_str().unwrap();
        assert!(content.starts_with("Running it."));
        assert!(content.contains("Called tool: Bash"));
        assert!(content.contains(r#""command": "ls""#));
    }

    #[test]
    fn test_tool_result_text_included() {
        let request = parse_request(
            r#"{
                "model": "claude-x",
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "tool_result", "tool_use_id": "t1", "content": "file1\nfile2"}
                    ]
                }]
            }"#,
        );
        let payload = build_upstream_payload(&request, PlatformType::OpenRouter, "m", false);

        assert_eq!(payload["messages"][0]["content"], "file1\nfile2");
    }

    #[test]
    fn test_empty_content_array_yields_empty_string() {
        let request = parse_request(
            r#"{
                "model": "claude-x",
                "messages": [{"role": "user", "content": []}]
            }"#,
        );
        let payload = build_upstream_payload(&request, PlatformType::OpenRouter, "m", false);

        assert_eq!(payload["messages"][0]["content"], "");
    }

    #[test]
    fn test_tools_become_system_prompt_and_are_removed() {
        let request = parse_request(
            r#"{
                "model": "claude-x",
                "tools": [{
                    "name": "Bash",
                    "description": "Run a shell command",
                    "input_schema": {
                        "type": "object",
                        "properties": {
                            "command": {"type": "string", "description": "the command"},
                            "timeout": {"type": "number", "description": "seconds"}
                        },
                        "required": ["command"]
                    }
                }],
                "tool_choice": {"type": "auto"},
                "messages": [{"role": "user", "content": "list files"}]
            }"#,
        );
        let payload = build_upstream_payload(&request, PlatformType::OpenRouter, "m", false);

        let system = payload["messages"][0]["content"].as_str().unwrap();
        assert!(system.contains("**Bash**"));
        assert!(system.contains("Run a shell command"));
        assert!(system.contains("command (string) (required)"));
        assert!(system.contains("timeout (number) (optional)"));
        assert!(system.contains("<use_tool>"));
        // tools and tool_choice never reach the upstream
        assert!(payload.get("tools").is_none());
        assert!(payload.get("tool_choice").is_none());
    }

    #[test]
    fn test_tools_appended_to_existing_system() {
        let request = parse_request(
            r#"{
                "model": "claude-x",
                "system": "You are helpful",
                "tools": [{"name": "Bash", "input_schema": {}}],
                "messages": [{"role": "user", "content": "hi"}]
            }"#,
        );
        let payload = build_upstream_payload(&request, PlatformType::OpenRouter, "m", false);

        let system = payload["messages"][0]["content"].as_str().unwrap();
        assert!(system.starts_with("You are helpful"));
        assert!(system.contains("=== Available Tools ==="));
        // Only one system message
        let systems = payload["messages"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|m| m["role"] == "system")
            .count();
        assert_eq!(systems, 1);
    }

    #[test]
    fn test_anthropic_only_params_dropped_everywhere() {
        let request = parse_request(
            r#"{
                "model": "claude-x",
                "anthropic-version": "2023-06-01",
                "anthropic-beta": "tools-2024",
                "temperature": 0.5,
                "messages": [{"role": "user", "content": "hi"}]
            }"#,
        );
        let payload = build_upstream_payload(&request, PlatformType::OpenAiCompatible, "m", false);

        assert!(payload.get("anthropic-version").is_none());
        assert!(payload.get("anthropic-beta").is_none());
        assert_eq!(payload["temperature"], 0.5);
    }

    #[test]
    fn test_dashscope_drops_metadata_and_clamps_max_tokens() {
        let request = parse_request(
            r#"{
                "model": "claude-x",
                "max_tokens": 9000,
                "metadata": {"user_id": "u1"},
                "messages": [{"role": "user", "content": "hi"}]
            }"#,
        );
        let payload = build_upstream_payload(&request, PlatformType::DashScope, "qwen-plus", false);

        assert_eq!(payload["max_tokens"], 8192);
        assert!(payload.get("metadata").is_none());
    }

    #[test]
    fn test_dashscope_clamps_max_tokens_low_end() {
        let request = parse_request(
            r#"{
                "model": "claude-x",
                "max_tokens": 0,
                "messages": [{"role": "user", "content": "hi"}]
            }"#,
        );
        let payload = build_upstream_payload(&request, PlatformType::DashScope, "qwen-plus", false);
        assert_eq!(payload["max_tokens"], 1);
    }

    #[test]
    fn test_openrouter_drops_bare_tool_choice() {
        let request = parse_request(
            r#"{
                "model": "claude-x",
                "tool_choice": {"type": "auto"},
                "messages": [{"role": "user", "content": "hi"}]
            }"#,
        );
        let payload = build_upstream_payload(&request, PlatformType::OpenRouter, "m", false);
        assert!(payload.get("tool_choice").is_none());

        // An OpenAI-compatible backend keeps it
        let payload = build_upstream_payload(&request, PlatformType::OpenAiCompatible, "m", false);
        assert_eq!(payload["tool_choice"]["type"], "auto");
    }

    #[test]
    fn test_extract_last_user_message() {
        let request = parse_request(
            r#"{
                "model": "claude-x",
                "messages": [
                    {"role": "user", "content": "first"},
                    {"role": "assistant", "content": "answer"},
                    {"role": "user", "content": [
                        {"type": "text", "text": "translate"},
                        {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "x"}},
                        {"type": "text", "text": "this"}
                    ]}
                ]
            }"#,
        );
        assert_eq!(extract_last_user_message(&request.messages), "translate this");
    }

    #[test]
    fn test_extract_last_user_message_none() {
        let request = parse_request(
            r#"{"model": "claude-x", "messages": [{"role": "assistant", "content": "hi"}]}"#,
        );
        assert_eq!(extract_last_user_message(&request.messages), "");
    }

    #[test]
    fn test_thinking_blocks_dropped() {
        let request = parse_request(
            r#"{
                "model": "claude-x",
                "messages": [{
                    "role": "assistant",
                    "content": [
                        {"type": "thinking", "thinking": "secret reasoning"},
                        {"type": "text", "text": "answer"}
                    ]
                }]
            }"#,
        );
        let payload = build_upstream_payload(&request, PlatformType::OpenRouter, "m", false);
        assert_eq!(payload["messages"][0]["content"], "answer");
    }
}
