//! Buffered upstream JSON → Anthropic message document
//!
//! The non-streaming counterpart of the stream converter: the complete
//! OpenAI-shaped response is mapped at once, including recovery of
//! `<use_tool>` calls embedded in the text and native `tool_calls` entries.
//! Responses that do not look like chat completions pass through unchanged.

use serde::Deserialize;
use serde_json::{json, Value};

use super::normalize_message_id;
use crate::util::generate_message_id;

const OPEN_TAG: &str = "<use_tool>";
const CLOSE_TAG: &str = "</use_tool>";

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<NativeToolCall>>,
}

#[derive(Debug, Deserialize)]
struct NativeToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<NativeFunction>,
}

#[derive(Debug, Deserialize)]
struct NativeFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Convert a buffered upstream response body to an Anthropic message
/// document, reporting the client's original model name
///
/// Bodies that are not recognizable chat completions are returned verbatim.
pub fn convert_complete_response(body: &str, original_model: &str) -> String {
    let completion: ChatCompletion = match serde_json::from_str(body) {
        Ok(completion) => completion,
        Err(_) => return body.to_string(),
    };
    if completion.choices.is_empty() {
        return body.to_string();
    }

    let choice = &completion.choices[0];
    let mut content: Vec<Value> = Vec::new();
    let mut tool_counter: u64 = 0;

    // Text first, with inline <use_tool> regions lifted into tool_use blocks
    if let Some(text) = &choice.message.content {
        if !text.trim().is_empty() {
            let (remaining, extracted) = extract_tool_calls(text, &mut tool_counter);
            if !remaining.trim().is_empty() {
                content.push(json!({"type": "text", "text": remaining}));
            }
            content.extend(extracted);
        }
    }

    // Then any native tool_calls
    if let Some(tool_calls) = &choice.message.tool_calls {
        for call in tool_calls {
            let name = call
                .function
                .as_ref()
                .and_then(|f| f.name.clone())
                .unwrap_or_else(|| "unknown".to_string());
            let input: Value = call
                .function
                .as_ref()
                .and_then(|f| f.arguments.as_deref())
                .and_then(|args| serde_json::from_str(args).ok())
                .unwrap_or_else(|| json!({}));
            tool_counter += 1;
            let id = call
                .id
                .clone()
                .unwrap_or_else(|| format!("call_{:012}f", tool_counter));
            content.push(json!({"type": "tool_use", "id": id, "name": name, "input": input}));
        }
    }

    if content.is_empty() {
        content.push(json!({"type": "text", "text": ""}));
    }

    let has_tools = content
        .iter()
        .any(|block| block.get("type").and_then(|t| t.as_str()) == Some("tool_use"));
    let stop_reason = if has_tools || choice.finish_reason.as_deref() == Some("tool_calls") {
        "tool_use"
    } else {
        "end_turn"
    };

    let id = match &completion.id {
        Some(id) if !id.is_empty() => normalize_message_id(id),
        _ => generate_message_id(),
    };

    let usage = completion
        .usage
        .as_ref()
        .map(|u| json!({"input_tokens": u.prompt_tokens, "output_tokens": u.completion_tokens}))
        .unwrap_or_else(|| json!({"input_tokens": 0, "output_tokens": 0}));

    let document = json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "content": content,
        "model": original_model,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": usage,
    });

    serde_json::to_string(&document).unwrap_or_else(|_| body.to_string())
}

/// Token usage of a buffered response, for record keeping
pub fn extract_usage(body: &str) -> (u64, u64) {
    serde_json::from_str::<ChatCompletion>(body)
        .ok()
        .and_then(|c| c.usage)
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or((0, 0))
}

/// Remove every complete `<use_tool>` region from the text and convert it
/// into a tool_use block. Malformed regions are dropped entirely.
fn extract_tool_calls(text: &str, counter: &mut u64) -> (String, Vec<Value>) {
    let mut remaining = String::new();
    let mut extracted = Vec::new();
    let mut rest = text;

    loop {
        match rest.find(OPEN_TAG) {
            None => {
                remaining.push_str(rest);
                break;
            }
            Some(start) => {
                remaining.push_str(&rest[..start]);
                let after_open = &rest[start..];
                match after_open.find(CLOSE_TAG) {
                    None => {
                        // Unterminated region: keep the raw text
                        remaining.push_str(after_open);
                        break;
                    }
                    Some(end) => {
                        let inner = &after_open[OPEN_TAG.len()..end];
                        if let Some(block) = parse_tool_region(inner, counter) {
                            extracted.push(block);
                        }
                        rest = &after_open[end + CLOSE_TAG.len()..];
                    }
                }
            }
        }
    }

    (remaining.trim().to_string(), extracted)
}

fn parse_tool_region(inner: &str, counter: &mut u64) -> Option<Value> {
    let name = extract_tag(inner, "tool_name")?;
    if name.is_empty() {
        return None;
    }
    let params_str = extract_tag(inner, "parameters")?;
    let params: Value = serde_json::from_str(params_str).ok()?;

    *counter += 1;
    Some(json!({
        "type": "tool_use",
        "id": format!("call_{:012}f", *counter),
        "name": name,
        "input": params,
    }))
}

fn extract_tag<'a>(content: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = content.find(&open)? + open.len();
    let end = content[start..].find(&close)? + start;
    Some(content[start..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_response() {
        let body = r#"{
            "id": "chatcmpl-123",
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello!"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;

        let converted = convert_complete_response(body, "claude-x");
        let document: Value = serde_json::from_str(&converted).unwrap();

        assert_eq!(document["type"], "message");
        assert_eq!(document["role"], "assistant");
        assert_eq!(document["id"], "msg_123");
        assert_eq!(document["model"], "claude-x");
        assert_eq!(document["content"][0]["text"], "Hello!");
        assert_eq!(document["stop_reason"], "end_turn");
        assert_eq!(document["usage"]["input_tokens"], 10);
        assert_eq!(document["usage"]["output_tokens"], 5);
    }

    #[test]
    fn test_inline_tool_call_lifted_from_text() {
        let body = r#"{
            "id": "chatcmpl-1",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "Let me check. <use_tool><tool_name>Bash</tool_name><parameters>{\"command\":\"ls\"}</parameters></use_tool>"
                },
                "finish_reason": "stop"
            }]
        }"#;

        let converted = convert_complete_response(body, "claude-x");
        let document: Value = serde_json::from_str(&converted).unwrap();

        assert_eq!(document["content"][0]["type"], "text");
        assert_eq!(document["content"][0]["text"], "Let me check.");
        assert_eq!(document["content"][1]["type"], "tool_use");
        assert_eq!(document["content"][1]["id"], "call_000000000001f");
        assert_eq!(document["content"][1]["name"], "Bash");
        assert_eq!(document["content"][1]["input"]["command"], "ls");
        assert_eq!(document["stop_reason"], "tool_use");
    }

    #[test]
    fn test_native_tool_calls_mapped() {
        let body = r#"{
            "id": "chatcmpl-2",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"city\":\"London\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }"#;

        let converted = convert_complete_response(body, "claude-x");
        let document: Value = serde_json::from_str(&converted).unwrap();

        assert_eq!(document["content"][0]["type"], "tool_use");
        assert_eq!(document["content"][0]["id"], "call_abc");
        assert_eq!(document["content"][0]["input"]["city"], "London");
        assert_eq!(document["stop_reason"], "tool_use");
    }

    #[test]
    fn test_empty_content_becomes_empty_text_block() {
        let body = r#"{
            "id": "chatcmpl-3",
            "choices": [{"message": {"role": "assistant", "content": ""}, "finish_reason": "stop"}]
        }"#;

        let converted = convert_complete_response(body, "claude-x");
        let document: Value = serde_json::from_str(&converted).unwrap();

        assert_eq!(document["content"][0]["type"], "text");
        assert_eq!(document["content"][0]["text"], "");
        assert_eq!(document["stop_reason"], "end_turn");
    }

    #[test]
    fn test_unrecognized_body_passes_through() {
        let body = r#"{"status": "ok"}"#;
        assert_eq!(convert_complete_response(body, "claude-x"), body);

        let not_json = "plain text";
        assert_eq!(convert_complete_response(not_json, "claude-x"), not_json);
    }

    #[test]
    fn test_extract_usage() {
        let body = r#"{"choices": [], "usage": {"prompt_tokens": 7, "completion_tokens": 3}}"#;
        assert_eq!(extract_usage(body), (7, 3));
        assert_eq!(extract_usage("not json"), (0, 0));
    }

    #[test]
    fn test_unterminated_tool_region_kept_as_text() {
        let mut counter = 0;
        let (remaining, extracted) =
            extract_tool_calls("start <use_tool><tool_name>X</tool_name>", &mut counter);
        assert!(remaining.contains("<use_tool>"));
        assert!(extracted.is_empty());
    }
}
