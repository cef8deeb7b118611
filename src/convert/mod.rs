//! Format conversion between the Anthropic client protocol and the
//! OpenAI-style upstream protocols
//!
//! Three converters cover both directions:
//!
//! - `request`: Anthropic messages + system + tools → OpenAI chat payload,
//!   including the tool-use compression contract (tool events flattened to
//!   prose, tool schemas re-expressed as a `<use_tool>` XML grammar in the
//!   system prompt)
//! - `stream`: stateful upstream chunk stream → Anthropic SSE event stream,
//!   with inline tool-call extraction and token accounting
//! - `response`: buffered upstream JSON → an aggregated Anthropic message
//!   document, for non-streaming calls
//!
//! One `StreamConverter` instance lives per request; nothing here is shared
//! across requests.

pub mod request;
pub mod response;
pub mod stream;

use crate::providers::PlatformType;
use crate::util::generate_message_id;

/// Wire-protocol family of an upstream chunk stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFlavor {
    /// Plain OpenAI SSE chunks
    OpenAi,
    /// DashScope's OpenAI-compatible mode
    Qwen,
    /// OpenAI SSE with `: OPENROUTER PROCESSING` comment lines interleaved
    OpenRouter,
    /// Newline-delimited JSON objects with `done`/eval counts
    Ollama,
    /// LMStudio's OpenAI-compatible server
    LmStudio,
}

impl ChunkFlavor {
    pub fn for_platform(platform: PlatformType) -> Self {
        match platform {
            PlatformType::DashScope => ChunkFlavor::Qwen,
            PlatformType::OpenRouter => ChunkFlavor::OpenRouter,
            PlatformType::Ollama => ChunkFlavor::Ollama,
            PlatformType::LmStudio => ChunkFlavor::LmStudio,
            PlatformType::SiliconFlow | PlatformType::OpenAiCompatible => ChunkFlavor::OpenAi,
        }
    }
}

/// Rewrite an upstream message id into the Anthropic `msg_` form
///
/// `msg_*` ids pass through; `chatcmpl-*` keeps its suffix; anything else
/// gets a fresh random id.
pub fn normalize_message_id(id: &str) -> String {
    if id.starts_with("msg_") {
        id.to_string()
    } else if let Some(suffix) = id.strip_prefix("chatcmpl-") {
        format!("msg_{}", suffix)
    } else {
        generate_message_id()
    }
}
