//! Token estimation for upstream responses that do not report usage
//!
//! This is an *estimator*, not an exact counter. Counts reported by the
//! upstream (OpenAI `usage`, Ollama eval counts) always take precedence;
//! these heuristics only fill the gap when nothing is reported.
//!
//! The rules, tuned against mixed Chinese/English chat traffic:
//! - CJK characters (U+4E00..U+9FFF) count one token each
//! - the non-CJK remainder counts one token per whitespace-delimited word
//! - structured text (code, JSON, markup) is denser: one token per ~3.5
//!   characters of the non-CJK remainder

/// Markers that flag a text as "structured" (code/JSON/markup)
const STRUCTURED_MARKERS: [&str; 5] = ["{", "[", "<", "def ", "function"];

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

/// Estimate the token count of a piece of assistant or user text
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }

    let cjk_chars = text.chars().filter(|c| is_cjk(*c)).count() as u64;
    let remainder: String = text.chars().filter(|c| !is_cjk(*c)).collect();

    let other_tokens = if STRUCTURED_MARKERS.iter().any(|m| text.contains(m)) {
        // Structured text packs more tokens per character
        ((remainder.len() as f64) / 3.5).floor().max(1.0) as u64
    } else {
        remainder.split_whitespace().count() as u64
    };

    cjk_chars + other_tokens
}

/// Estimate the input token count of an outgoing OpenAI-shaped messages array
///
/// Only string contents and `text` items of array contents are counted; the
/// result seeds the stream converter and is overwritten if the upstream
/// reports a positive prompt token count.
pub fn estimate_input_tokens(messages: &[serde_json::Value]) -> u64 {
    let mut total = 0;
    for message in messages {
        match message.get("content") {
            Some(serde_json::Value::String(text)) => total += estimate_tokens(text),
            Some(serde_json::Value::Array(items)) => {
                for item in items {
                    if item.get("type").and_then(|t| t.as_str()) == Some("text") {
                        if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                            total += estimate_tokens(text);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_text() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_plain_english_counts_words() {
        assert_eq!(estimate_tokens("hello world again"), 3);
    }

    #[test]
    fn test_cjk_counts_characters() {
        // 4 CJK chars, no remaining words
        assert_eq!(estimate_tokens("你好世界"), 4);
    }

    #[test]
    fn test_mixed_cjk_and_english() {
        // 2 CJK chars + 2 English words
        assert_eq!(estimate_tokens("你好 hello world"), 4);
    }

    #[test]
    fn test_structured_text_uses_character_density() {
        let code = r#"{"command": "ls -la"}"#;
        // 21 chars / 3.5 = 6
        assert_eq!(estimate_tokens(code), 6);
    }

    #[test]
    fn test_structured_marker_minimum_one() {
        assert_eq!(estimate_tokens("{}"), 1);
    }

    #[test]
    fn test_input_estimate_over_messages() {
        let messages = vec![
            json!({"role": "system", "content": "be brief"}),
            json!({"role": "user", "content": [{"type": "text", "text": "hello world"}]}),
        ];
        assert_eq!(estimate_input_tokens(&messages), 4);
    }

    #[test]
    fn test_input_estimate_skips_non_text() {
        let messages = vec![json!({"role": "user", "content": [{"type": "image_url"}]})];
        assert_eq!(estimate_input_tokens(&messages), 0);
    }
}
