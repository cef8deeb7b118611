//! Upstream chunk stream → Anthropic SSE event stream
//!
//! One `StreamConverter` per request. It consumes raw upstream chunks (SSE
//! lines or NDJSON objects, per flavor) and emits Anthropic-shaped SSE
//! events in the canonical order:
//!
//! ```text
//! message_start
//! content_block_start (text, index 0)
//! ping
//! content_block_delta (text_delta, first may be empty)
//! [content_block_start (tool_use, index 1) + content_block_delta (input_json_delta)]
//! content_block_stop (index 0)
//! [content_block_stop (index 1)]
//! message_delta (stop_reason)
//! message_stop
//! ```
//!
//! Each event is encoded as four lines terminated by a blank line:
//!
//! ```text
//! id:<monotonic event id>
//! event:<event type>
//! :HTTP_STATUS/200
//! data:<JSON>
//! ```
//!
//! # Inline tool-call extraction
//!
//! Upstreams answer the `<use_tool>` convention in free-form text, so the
//! converter scans the text channel with a small state machine: outside a
//! tool call it flushes plain text (keeping back only a trailing partial
//! `<use_tool>` prefix); once the opening tag is seen it buffers until the
//! closing tag, then parses `<tool_name>`/`<parameters>` and emits the
//! tool_use block events. The buffer never holds more than one tool call.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{normalize_message_id, ChunkFlavor};
use crate::tokens::estimate_tokens;
use crate::util::generate_message_id;

const OPEN_TAG: &str = "<use_tool>";
const CLOSE_TAG: &str = "</use_tool>";

// ─────────────────────────────────────────────────────────────────────────────
// Upstream Chunk Types (Deserialize)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UpstreamChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<UpstreamUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Usage block in either OpenAI or Claude spelling
#[derive(Debug, Deserialize)]
struct UpstreamUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Anthropic Event Types (Serialize)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct MessageStartEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
    message: MessageStartPayload,
}

#[derive(Serialize)]
struct MessageStartPayload {
    id: String,
    #[serde(rename = "type")]
    msg_type: &'static str,
    role: &'static str,
    content: Vec<Value>,
    model: String,
    usage: Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Serialize)]
struct ContentBlockStartEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
    content_block: ContentBlockPayload,
    index: u32,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ContentBlockPayload {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        id: String,
    },
}

#[derive(Serialize)]
struct ContentBlockDeltaEvent {
    delta: ContentDelta,
    #[serde(rename = "type")]
    event_type: &'static str,
    index: u32,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ContentDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Serialize)]
struct ContentBlockStopEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
    index: u32,
}

#[derive(Serialize)]
struct MessageDeltaEvent {
    delta: MessageDeltaPayload,
    #[serde(rename = "type")]
    event_type: &'static str,
    usage: MessageDeltaUsage,
}

#[derive(Serialize)]
struct MessageDeltaPayload {
    stop_reason: &'static str,
}

#[derive(Serialize)]
struct MessageDeltaUsage {
    input_tokens: u64,
    output_tokens: u64,
    cache_read_input_tokens: u64,
}

#[derive(Serialize)]
struct BareEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream Converter
// ─────────────────────────────────────────────────────────────────────────────

/// Stateful converter from one upstream chunk stream to one Anthropic SSE
/// event stream
pub struct StreamConverter {
    flavor: ChunkFlavor,
    /// Model name the client asked for; reported back verbatim
    original_model: String,
    event_id: u64,
    message_id: String,
    message_started: bool,
    content_block_started: bool,
    stream_ended: bool,
    /// Accumulated plain assistant text (tool-call regions excluded)
    current_content: String,
    /// Scanner buffer holding at most one suspect tool-call region
    tool_buffer: String,
    in_tool_call: bool,
    tool_call_count: u64,
    has_tool_call: bool,
    total_input_tokens: u64,
    total_output_tokens: u64,
    input_reported: bool,
    output_reported: bool,
}

impl StreamConverter {
    pub fn new(flavor: ChunkFlavor, original_model: &str) -> Self {
        Self {
            flavor,
            original_model: original_model.to_string(),
            event_id: 0,
            message_id: generate_message_id(),
            message_started: false,
            content_block_started: false,
            stream_ended: false,
            current_content: String::new(),
            tool_buffer: String::new(),
            in_tool_call: false,
            tool_call_count: 0,
            has_tool_call: false,
            total_input_tokens: 0,
            total_output_tokens: 0,
            input_reported: false,
            output_reported: false,
        }
    }

    /// Seed the input token counter with the pre-request estimate. A
    /// positive upstream-reported count overwrites it later.
    pub fn set_estimated_input_tokens(&mut self, tokens: u64) {
        if !self.input_reported {
            self.total_input_tokens = tokens;
        }
    }

    pub fn usage(&self) -> Usage {
        Usage {
            input_tokens: self.total_input_tokens,
            output_tokens: self.total_output_tokens,
        }
    }

    pub fn has_started(&self) -> bool {
        self.message_started
    }

    pub fn has_ended(&self) -> bool {
        self.stream_ended
    }

    /// Convert one raw upstream chunk into zero or more SSE events
    pub fn convert_chunk(&mut self, chunk: &str) -> String {
        if self.stream_ended {
            return String::new();
        }
        match self.flavor {
            ChunkFlavor::Ollama => self.convert_ollama_chunk(chunk),
            _ => self.convert_sse_chunk(chunk),
        }
    }

    /// Close the event grammar if the upstream ended without a terminator
    pub fn finish(&mut self) -> String {
        self.handle_stream_end()
    }

    /// The aggregated Anthropic message document for this stream
    #[allow(dead_code)] // Aggregation law checks
    pub fn complete_response(&self) -> Value {
        serde_json::json!({
            "id": self.message_id,
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": self.current_content}],
            "model": self.original_model,
            "stop_reason": if self.has_tool_call { "tool_use" } else { "end_turn" },
            "stop_sequence": null,
            "usage": {
                "input_tokens": self.total_input_tokens,
                "output_tokens": self.total_output_tokens,
            },
        })
    }

    // ─── Flavor-specific chunk parsing ───────────────────────────────────────

    fn convert_sse_chunk(&mut self, chunk: &str) -> String {
        let chunk = chunk.trim();
        if chunk.is_empty() {
            return String::new();
        }
        if self.flavor == ChunkFlavor::OpenRouter && chunk.starts_with(": OPENROUTER PROCESSING") {
            return String::new();
        }

        let json_str = match chunk.strip_prefix("data:") {
            Some(rest) => rest.trim(),
            None => chunk,
        };
        if json_str == "[DONE]" {
            return self.handle_stream_end();
        }

        let data: UpstreamChunk = match serde_json::from_str(json_str) {
            Ok(data) => data,
            Err(_) => return String::new(),
        };

        if !self.message_started {
            if let Some(id) = &data.id {
                self.message_id = normalize_message_id(id);
            }
        }
        if let Some(usage) = &data.usage {
            self.apply_usage(usage);
        }

        // Usage-only chunks update the counters without emitting anything
        let choice = match data.choices.first() {
            Some(choice) => choice,
            None => return String::new(),
        };

        let mut out = String::new();
        out.push_str(&self.ensure_started());

        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                out.push_str(&self.emit_content(content));
            }
        }

        if choice.finish_reason.as_deref() == Some("stop") {
            out.push_str(&self.handle_stream_end());
        }

        out
    }

    fn convert_ollama_chunk(&mut self, chunk: &str) -> String {
        let data: OllamaChunk = match serde_json::from_str(chunk.trim()) {
            Ok(data) => data,
            Err(_) => return String::new(),
        };

        let mut out = String::new();

        if let Some(message) = &data.message {
            out.push_str(&self.ensure_started());

            // Empty deltas are forwarded too: some clients rely on a steady
            // stream of events while the model warms up
            if let Some(content) = &message.content {
                if content.is_empty() {
                    if !self.in_tool_call {
                        out.push_str(&self.emit_text_delta(""));
                    }
                } else {
                    out.push_str(&self.emit_content(content));
                }
            }
        }

        if data.done {
            if let Some(prompt) = data.prompt_eval_count {
                if prompt > 0 {
                    self.total_input_tokens = prompt;
                    self.input_reported = true;
                }
            }
            if let Some(eval) = data.eval_count {
                self.total_output_tokens = eval;
                self.output_reported = true;
            }
            out.push_str(&self.handle_stream_end());
        }

        out
    }

    fn apply_usage(&mut self, usage: &UpstreamUsage) {
        if let Some(prompt) = usage.prompt_tokens.or(usage.input_tokens) {
            if prompt > 0 {
                self.total_input_tokens = prompt;
                self.input_reported = true;
            }
        }
        if let Some(completion) = usage.completion_tokens.or(usage.output_tokens) {
            self.total_output_tokens = completion;
            self.output_reported = true;
        }
    }

    // ─── Event group helpers ─────────────────────────────────────────────────

    /// Emit the initial event group on the first meaningful chunk
    fn ensure_started(&mut self) -> String {
        if self.message_started {
            return String::new();
        }
        self.message_started = true;
        self.content_block_started = true;

        let mut out = String::new();
        out.push_str(&self.next_event(
            "message_start",
            &MessageStartEvent {
                event_type: "message_start",
                message: MessageStartPayload {
                    id: self.message_id.clone(),
                    msg_type: "message",
                    role: "assistant",
                    content: Vec::new(),
                    model: self.original_model.clone(),
                    usage: Usage {
                        input_tokens: 0,
                        output_tokens: 0,
                    },
                },
            },
        ));
        out.push_str(&self.next_event(
            "content_block_start",
            &ContentBlockStartEvent {
                event_type: "content_block_start",
                content_block: ContentBlockPayload::Text {
                    text: String::new(),
                },
                index: 0,
            },
        ));
        out.push_str(&self.next_event("ping", &BareEvent { event_type: "ping" }));
        // Empty first delta: an Anthropic-format marker some clients expect
        out.push_str(&self.emit_text_delta(""));
        out
    }

    fn handle_stream_end(&mut self) -> String {
        if self.stream_ended {
            return String::new();
        }
        self.stream_ended = true;

        if !self.content_block_started {
            return String::new();
        }

        let mut out = String::new();
        out.push_str(&self.next_event(
            "content_block_stop",
            &ContentBlockStopEvent {
                event_type: "content_block_stop",
                index: 0,
            },
        ));

        let stop_reason = if self.has_tool_call {
            out.push_str(&self.next_event(
                "content_block_stop",
                &ContentBlockStopEvent {
                    event_type: "content_block_stop",
                    index: 1,
                },
            ));
            "tool_use"
        } else {
            "end_turn"
        };

        out.push_str(&self.next_event(
            "message_delta",
            &MessageDeltaEvent {
                delta: MessageDeltaPayload { stop_reason },
                event_type: "message_delta",
                usage: MessageDeltaUsage {
                    input_tokens: self.total_input_tokens,
                    output_tokens: self.total_output_tokens,
                    cache_read_input_tokens: 0,
                },
            },
        ));
        out.push_str(&self.next_event(
            "message_stop",
            &BareEvent {
                event_type: "message_stop",
            },
        ));
        out
    }

    // ─── Text channel and tool-call scanner ──────────────────────────────────

    /// Run new text through the tool-call scanner, emitting text deltas for
    /// plain regions and tool block events for complete `<use_tool>` pairs
    fn emit_content(&mut self, text: &str) -> String {
        let mut out = String::new();
        self.tool_buffer.push_str(text);

        loop {
            if self.in_tool_call {
                match self.tool_buffer.find(CLOSE_TAG) {
                    Some(end) => {
                        let close_end = end + CLOSE_TAG.len();
                        let inner = self.tool_buffer[OPEN_TAG.len()..end].to_string();
                        out.push_str(&self.emit_tool_call(&inner));
                        self.tool_buffer.drain(..close_end);
                        self.in_tool_call = false;
                    }
                    // Inside a tool call with no closing tag yet: hold text
                    None => break,
                }
            } else if let Some(start) = self.tool_buffer.find(OPEN_TAG) {
                if start > 0 {
                    let prefix = self.tool_buffer[..start].to_string();
                    out.push_str(&self.emit_plain_text(&prefix));
                    self.tool_buffer.drain(..start);
                }
                self.in_tool_call = true;
            } else {
                // Flush everything except a trailing partial open tag
                let keep = trailing_partial_open_tag(&self.tool_buffer);
                let flush_to = self.tool_buffer.len() - keep;
                if flush_to > 0 {
                    let plain = self.tool_buffer[..flush_to].to_string();
                    out.push_str(&self.emit_plain_text(&plain));
                    self.tool_buffer.drain(..flush_to);
                }
                break;
            }
        }

        out
    }

    fn emit_plain_text(&mut self, text: &str) -> String {
        self.current_content.push_str(text);
        if !self.output_reported {
            self.total_output_tokens = estimate_tokens(&self.current_content);
        }
        self.emit_text_delta(text)
    }

    fn emit_text_delta(&mut self, text: &str) -> String {
        self.next_event(
            "content_block_delta",
            &ContentBlockDeltaEvent {
                delta: ContentDelta::TextDelta {
                    text: text.to_string(),
                },
                event_type: "content_block_delta",
                index: 0,
            },
        )
    }

    /// Parse one complete tool-call region and emit its block events
    ///
    /// Malformed regions (missing tags, invalid parameter JSON) emit nothing;
    /// the surrounding text has already been flushed.
    fn emit_tool_call(&mut self, inner: &str) -> String {
        let tool_name = match extract_tag(inner, "tool_name") {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                tracing::warn!("Tool call without a tool_name tag, dropping");
                return String::new();
            }
        };
        let params_str = match extract_tag(inner, "parameters") {
            Some(params) => params,
            None => {
                tracing::warn!("Tool call without a parameters tag, dropping");
                return String::new();
            }
        };
        let params: Value = match serde_json::from_str(params_str) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!("Tool call parameters are not valid JSON: {}", e);
                return String::new();
            }
        };

        self.tool_call_count += 1;
        self.has_tool_call = true;
        let tool_use_id = format!("call_{:012}f", self.tool_call_count);

        // Tool calls always occupy content block index 1, however many there
        // are in one turn
        let mut out = String::new();
        out.push_str(&self.next_event(
            "content_block_start",
            &ContentBlockStartEvent {
                event_type: "content_block_start",
                content_block: ContentBlockPayload::ToolUse {
                    name: tool_name,
                    input: serde_json::json!({}),
                    id: tool_use_id,
                },
                index: 1,
            },
        ));

        if has_parameters(&params) {
            let partial_json = serde_json::to_string(&params).unwrap_or_default();
            out.push_str(&self.next_event(
                "content_block_delta",
                &ContentBlockDeltaEvent {
                    delta: ContentDelta::InputJsonDelta { partial_json },
                    event_type: "content_block_delta",
                    index: 1,
                },
            ));
        }

        out
    }

    /// Encode one SSE event with the next monotonic id
    fn next_event<T: Serialize>(&mut self, event_type: &str, data: &T) -> String {
        match serde_json::to_string(data) {
            Ok(json) => {
                self.event_id += 1;
                format!(
                    "id:{}\nevent:{}\n:HTTP_STATUS/200\ndata:{}\n\n",
                    self.event_id, event_type, json
                )
            }
            Err(e) => {
                tracing::error!("Failed to serialize SSE event {}: {}", event_type, e);
                String::new()
            }
        }
    }
}

/// Extract the trimmed inner text of `<tag>...</tag>`
fn extract_tag<'a>(content: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = content.find(&open)? + open.len();
    let end = content[start..].find(&close)? + start;
    Some(content[start..end].trim())
}

/// Length of the longest buffer suffix that could still grow into
/// `<use_tool>`
fn trailing_partial_open_tag(buffer: &str) -> usize {
    let max = (OPEN_TAG.len() - 1).min(buffer.len());
    for len in (1..=max).rev() {
        if buffer.ends_with(&OPEN_TAG[..len]) {
            return len;
        }
    }
    0
}

/// Non-empty parameter payloads get an input_json_delta; empty ones do not
fn has_parameters(params: &Value) -> bool {
    match params {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One parsed SSE event: (id, event type, data JSON)
    fn parse_events(raw: &str) -> Vec<(u64, String, Value)> {
        raw.split("\n\n")
            .filter(|block| !block.trim().is_empty())
            .map(|block| {
                let mut id = 0;
                let mut event_type = String::new();
                let mut data = Value::Null;
                let mut saw_status_comment = false;
                for line in block.lines() {
                    if let Some(rest) = line.strip_prefix("id:") {
                        id = rest.parse().unwrap();
                    } else if let Some(rest) = line.strip_prefix("event:") {
                        event_type = rest.to_string();
                    } else if line == ":HTTP_STATUS/200" {
                        saw_status_comment = true;
                    } else if let Some(rest) = line.strip_prefix("data:") {
                        data = serde_json::from_str(rest).unwrap();
                    }
                }
                assert!(saw_status_comment, "missing status comment in {:?}", block);
                (id, event_type, data)
            })
            .collect()
    }

    fn event_types(events: &[(u64, String, Value)]) -> Vec<&str> {
        events.iter().map(|(_, t, _)| t.as_str()).collect()
    }

    #[test]
    fn test_openrouter_streaming_sequence() {
        let mut converter = StreamConverter::new(ChunkFlavor::OpenRouter, "openai/gpt-4o-mini");
        converter.set_estimated_input_tokens(3);

        let mut raw = String::new();
        raw.push_str(&converter.convert_chunk(
            r#"data: {"id":"chatcmpl-x","model":"openai/gpt-4o-mini","choices":[{"delta":{"content":"Hello"}}]}"#,
        ));
        raw.push_str(&converter.convert_chunk(
            r#"data: {"choices":[{"delta":{"content":" world"},"finish_reason":"stop"}],"usage":{"prompt_tokens":5,"completion_tokens":2}}"#,
        ));
        raw.push_str(&converter.convert_chunk("data: [DONE]"));

        let events = parse_events(&raw);
        assert_eq!(
            event_types(&events),
            vec![
                "message_start",
                "content_block_start",
                "ping",
                "content_block_delta",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        // Event ids are strictly increasing from 1
        for (i, (id, _, _)) in events.iter().enumerate() {
            assert_eq!(*id, (i + 1) as u64);
        }

        // message_start carries the client's original model and the rewritten id
        assert_eq!(events[0].2["message"]["model"], "openai/gpt-4o-mini");
        assert_eq!(events[0].2["message"]["id"], "msg_x");

        // Deltas: marker, then content
        assert_eq!(events[3].2["delta"]["text"], "");
        assert_eq!(events[4].2["delta"]["text"], "Hello");
        assert_eq!(events[5].2["delta"]["text"], " world");

        // Usage from the upstream wins over the estimate
        let message_delta = &events[7].2;
        assert_eq!(message_delta["delta"]["stop_reason"], "end_turn");
        assert_eq!(message_delta["usage"]["input_tokens"], 5);
        assert_eq!(message_delta["usage"]["output_tokens"], 2);

        assert_eq!(converter.usage().input_tokens, 5);
        assert_eq!(converter.usage().output_tokens, 2);
    }

    #[test]
    fn test_done_after_stop_does_not_duplicate_end_events() {
        let mut converter = StreamConverter::new(ChunkFlavor::OpenAi, "m");
        let mut raw = String::new();
        raw.push_str(&converter.convert_chunk(
            r#"data: {"choices":[{"delta":{"content":"hi"},"finish_reason":"stop"}]}"#,
        ));
        raw.push_str(&converter.convert_chunk("data: [DONE]"));

        let events = parse_events(&raw);
        let stops = events.iter().filter(|(_, t, _)| t == "message_stop").count();
        assert_eq!(stops, 1);
        let deltas = events.iter().filter(|(_, t, _)| t == "message_delta").count();
        assert_eq!(deltas, 1);
    }

    #[test]
    fn test_openrouter_processing_lines_consumed() {
        let mut converter = StreamConverter::new(ChunkFlavor::OpenRouter, "m");
        assert_eq!(converter.convert_chunk(": OPENROUTER PROCESSING"), "");
        assert!(!converter.has_started());
    }

    #[test]
    fn test_inline_tool_call_extraction() {
        let mut converter = StreamConverter::new(ChunkFlavor::OpenAi, "m");
        let content = r#"Sure. <use_tool><tool_name>Bash</tool_name><parameters>{"command":"ls"}</parameters></use_tool> done."#;
        let chunk = serde_json::json!({
            "id": "chatcmpl-1",
            "choices": [{"delta": {"content": content}}]
        });
        let mut raw = converter.convert_chunk(&format!("data: {}", chunk));
        raw.push_str(&converter.convert_chunk("data: [DONE]"));

        let events = parse_events(&raw);
        assert_eq!(
            event_types(&events),
            vec![
                "message_start",
                "content_block_start", // text, index 0
                "ping",
                "content_block_delta", // ""
                "content_block_delta", // "Sure. "
                "content_block_start", // tool_use, index 1
                "content_block_delta", // input_json_delta
                "content_block_delta", // " done."
                "content_block_stop",  // index 0
                "content_block_stop",  // index 1
                "message_delta",
                "message_stop",
            ]
        );

        assert_eq!(events[4].2["delta"]["text"], "Sure. ");

        let tool_start = &events[5].2;
        assert_eq!(tool_start["index"], 1);
        assert_eq!(tool_start["content_block"]["type"], "tool_use");
        assert_eq!(tool_start["content_block"]["id"], "call_000000000001f");
        assert_eq!(tool_start["content_block"]["name"], "Bash");

        let json_delta = &events[6].2;
        assert_eq!(json_delta["index"], 1);
        assert_eq!(json_delta["delta"]["type"], "input_json_delta");
        assert_eq!(json_delta["delta"]["partial_json"], r#"{"command":"ls"}"#);

        assert_eq!(events[7].2["delta"]["text"], " done.");

        // Tool use flips the stop reason and closes block 1
        assert_eq!(events[9].2["index"], 1);
        assert_eq!(events[10].2["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn test_tool_call_split_across_chunks() {
        let mut converter = StreamConverter::new(ChunkFlavor::OpenAi, "m");
        let parts = [
            "before <use_",
            "tool><tool_name>Read</tool_name><parameters>{\"path\":",
            "\"/tmp/x\"}</parameters></use_tool> after",
        ];
        let mut raw = String::new();
        for part in parts {
            let chunk = serde_json::json!({"choices": [{"delta": {"content": part}}]});
            raw.push_str(&converter.convert_chunk(&format!("data: {}", chunk)));
        }
        raw.push_str(&converter.convert_chunk("data: [DONE]"));

        let events = parse_events(&raw);
        let texts: Vec<String> = events
            .iter()
            .filter(|(_, t, d)| t == "content_block_delta" && d["delta"]["type"] == "text_delta")
            .map(|(_, _, d)| d["delta"]["text"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(texts.join(""), "before  after");

        let tool_starts: Vec<&Value> = events
            .iter()
            .filter(|(_, t, d)| t == "content_block_start" && d["content_block"]["type"] == "tool_use")
            .map(|(_, _, d)| d)
            .collect();
        assert_eq!(tool_starts.len(), 1);
        assert_eq!(tool_starts[0]["content_block"]["name"], "Read");
    }

    #[test]
    fn test_multiple_tool_calls_increment_counter_same_index() {
        let mut converter = StreamConverter::new(ChunkFlavor::OpenAi, "m");
        let content = "<use_tool><tool_name>A</tool_name><parameters>{}</parameters></use_tool>\
                       <use_tool><tool_name>B</tool_name><parameters>{\"x\":1}</parameters></use_tool>";
        let chunk = serde_json::json!({"choices": [{"delta": {"content": content}}]});
        let raw = converter.convert_chunk(&format!("data: {}", chunk));

        let events = parse_events(&raw);
        let tool_starts: Vec<&Value> = events
            .iter()
            .filter(|(_, t, d)| t == "content_block_start" && d["content_block"]["type"] == "tool_use")
            .map(|(_, _, d)| d)
            .collect();
        assert_eq!(tool_starts.len(), 2);
        assert_eq!(tool_starts[0]["content_block"]["id"], "call_000000000001f");
        assert_eq!(tool_starts[1]["content_block"]["id"], "call_000000000002f");
        assert_eq!(tool_starts[0]["index"], 1);
        assert_eq!(tool_starts[1]["index"], 1);

        // Empty parameters suppress the input_json_delta for tool A
        let json_deltas = events
            .iter()
            .filter(|(_, t, d)| t == "content_block_delta" && d["delta"]["type"] == "input_json_delta")
            .count();
        assert_eq!(json_deltas, 1);
    }

    #[test]
    fn test_malformed_tool_call_emits_nothing() {
        let mut converter = StreamConverter::new(ChunkFlavor::OpenAi, "m");
        let content = "<use_tool><tool_name>Bash</tool_name><parameters>not json</parameters></use_tool>";
        let chunk = serde_json::json!({"choices": [{"delta": {"content": content}}]});
        let raw = converter.convert_chunk(&format!("data: {}", chunk));

        let events = parse_events(&raw);
        assert!(events
            .iter()
            .all(|(_, _, d)| d["content_block"]["type"] != "tool_use"));
        assert!(!converter.has_tool_call);
    }

    #[test]
    fn test_ollama_streaming_and_eval_counts() {
        let mut converter = StreamConverter::new(ChunkFlavor::Ollama, "llama3");
        let mut raw = String::new();
        raw.push_str(&converter.convert_chunk(r#"{"message":{"content":"hi"},"done":false}"#));
        raw.push_str(&converter.convert_chunk(
            r#"{"message":{"content":""},"done":true,"prompt_eval_count":3,"eval_count":1}"#,
        ));

        let events = parse_events(&raw);
        let message_delta = events
            .iter()
            .find(|(_, t, _)| t == "message_delta")
            .map(|(_, _, d)| d)
            .unwrap();
        assert_eq!(message_delta["usage"]["input_tokens"], 3);
        assert_eq!(message_delta["usage"]["output_tokens"], 1);
        assert!(converter.has_ended());
    }

    #[test]
    fn test_estimator_used_when_usage_absent() {
        let mut converter = StreamConverter::new(ChunkFlavor::OpenAi, "m");
        let chunk = serde_json::json!({"choices": [{"delta": {"content": "hello world again"}}]});
        converter.convert_chunk(&format!("data: {}", chunk));
        converter.convert_chunk("data: [DONE]");

        assert_eq!(converter.usage().output_tokens, estimate_tokens("hello world again"));
    }

    #[test]
    fn test_complete_response_round_trip() {
        let mut converter = StreamConverter::new(ChunkFlavor::OpenAi, "claude-x");
        let content = r#"A <use_tool><tool_name>T</tool_name><parameters>{"k":"v"}</parameters></use_tool>B"#;
        let chunk = serde_json::json!({"choices": [{"delta": {"content": content}}]});
        converter.convert_chunk(&format!("data: {}", chunk));
        converter.convert_chunk("data: [DONE]");

        let document = converter.complete_response();
        assert_eq!(document["model"], "claude-x");
        // Inline tool-call region removed from the aggregated text
        assert_eq!(document["content"][0]["text"], "A B");
        assert_eq!(document["stop_reason"], "tool_use");
    }

    #[test]
    fn test_usage_only_chunk_emits_nothing() {
        let mut converter = StreamConverter::new(ChunkFlavor::OpenRouter, "m");
        let out = converter.convert_chunk(r#"data: {"usage":{"prompt_tokens":9,"completion_tokens":4}}"#);
        assert!(out.is_empty());
        assert!(!converter.has_started());
        assert_eq!(converter.usage().input_tokens, 9);
        assert_eq!(converter.usage().output_tokens, 4);
    }

    #[test]
    fn test_claude_spelled_usage_accepted() {
        let mut converter = StreamConverter::new(ChunkFlavor::OpenAi, "m");
        converter.convert_chunk(r#"data: {"usage":{"input_tokens":11,"output_tokens":6}}"#);
        assert_eq!(converter.usage().input_tokens, 11);
        assert_eq!(converter.usage().output_tokens, 6);
    }

    #[test]
    fn test_zero_prompt_tokens_keeps_estimate() {
        let mut converter = StreamConverter::new(ChunkFlavor::OpenAi, "m");
        converter.set_estimated_input_tokens(42);
        converter.convert_chunk(r#"data: {"usage":{"prompt_tokens":0,"completion_tokens":4}}"#);
        assert_eq!(converter.usage().input_tokens, 42);
        assert_eq!(converter.usage().output_tokens, 4);
    }

    #[test]
    fn test_finish_closes_grammar_when_upstream_dies() {
        let mut converter = StreamConverter::new(ChunkFlavor::OpenAi, "m");
        let chunk = serde_json::json!({"choices": [{"delta": {"content": "partial"}}]});
        let mut raw = converter.convert_chunk(&format!("data: {}", chunk));
        // No [DONE] ever arrives
        raw.push_str(&converter.finish());

        let events = parse_events(&raw);
        assert_eq!(events.last().unwrap().1, "message_stop");
    }

    #[test]
    fn test_trailing_partial_open_tag() {
        assert_eq!(trailing_partial_open_tag("hello"), 0);
        assert_eq!(trailing_partial_open_tag("hello <"), 1);
        assert_eq!(trailing_partial_open_tag("hello <use_to"), 7);
        // A full tag is not "partial": the scanner has already consumed it
        assert_eq!(trailing_partial_open_tag("text <use_tool"), 9);
    }
}
