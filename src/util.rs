//! Shared utility functions: identifier generation and string helpers

use rand::Rng;
use sha2::{Digest, Sha256};

/// URL-safe alphabet used for generated API keys (base64url without padding)
const URL_SAFE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Base62 alphabet used for Anthropic-style message ids
const BASE62_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate an Anthropic-style message id: `msg_` + 20 base62 characters
///
/// Example: `msg_013Zva2CMHLNnXjNJJKq`
pub fn generate_message_id() -> String {
    let mut rng = rand::rng();
    let random_part: String = (0..20)
        .map(|_| BASE62_CHARS[rng.random_range(0..BASE62_CHARS.len())] as char)
        .collect();
    format!("msg_{}", random_part)
}

/// Generate a user API key: `lxs_` + 32 URL-safe characters
pub fn generate_api_key() -> String {
    let mut rng = rand::rng();
    let random_part: String = (0..32)
        .map(|_| URL_SAFE_CHARS[rng.random_range(0..URL_SAFE_CHARS.len())] as char)
        .collect();
    format!("lxs_{}", random_part)
}

/// Check that a presented key matches the accepted format:
/// `lxs_` followed by at least 24 URL-safe characters
pub fn is_valid_key_format(key: &str) -> bool {
    match key.strip_prefix("lxs_") {
        Some(rest) => {
            rest.len() >= 24
                && rest
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        }
        None => false,
    }
}

/// Hash an API key for log output (never log the actual key!)
///
/// Returns the first 16 hex characters of the SHA-256 digest.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();
    format!("{:x}", hash)[..16].to_string()
}

/// Safely truncate a string to at most `max_bytes` while respecting UTF-8 boundaries.
///
/// If the string is already shorter than `max_bytes`, returns it unchanged.
/// Otherwise, finds the last valid UTF-8 character boundary at or before `max_bytes`
/// and returns a slice up to that point.
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
