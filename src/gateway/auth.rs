//! API key extraction and admission
//!
//! Keys arrive in `Authorization: Bearer <key>` or `api-key: <key>`. The
//! admission decision itself lives in the store (active, unexpired, under
//! budget); this module only bridges headers to that check. Keys are never
//! logged in the clear.

use axum::http::HeaderMap;

use super::error::GatewayError;
use crate::store::{KeyAdmission, Store, UserKey};
use crate::util::{hash_api_key, is_valid_key_format};

/// Pull the presented API key out of the request headers
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(key) = auth.strip_prefix("Bearer ") {
            return Some(key.trim().to_string());
        }
    }
    headers
        .get("api-key")
        .and_then(|v| v.to_str().ok())
        .map(|key| key.trim().to_string())
}

/// Resolve and admit the key for this request
///
/// Runs the store lookup on the blocking pool. Returns the admitted key or
/// the 401 the client should see.
pub async fn admit(store: &Store, headers: &HeaderMap) -> Result<UserKey, GatewayError> {
    let Some(api_key) = extract_api_key(headers) else {
        return Err(GatewayError::Authentication(
            "Missing API key: use 'Authorization: Bearer <key>' or 'api-key: <key>'".to_string(),
        ));
    };

    if !is_valid_key_format(&api_key) {
        tracing::debug!("Rejected malformed API key (hash {})", hash_api_key(&api_key));
        return Err(GatewayError::Authentication("Invalid API key".to_string()));
    }

    let store = store.clone();
    let key_for_task = api_key.clone();
    let admission = tokio::task::spawn_blocking(move || store.check_key(&key_for_task))
        .await
        .map_err(|e| GatewayError::Internal(format!("Admission task failed: {}", e)))?
        .map_err(|e| GatewayError::Internal(format!("Admission lookup failed: {}", e)))?;

    match admission {
        KeyAdmission::Admitted(key) => {
            tracing::debug!(
                "Admitted key '{}' (hash {})",
                key.name,
                hash_api_key(&api_key)
            );
            Ok(key)
        }
        KeyAdmission::Denied(reason) => {
            tracing::info!(
                "Denied key (hash {}): {}",
                hash_api_key(&api_key),
                reason
            );
            Err(GatewayError::Authentication(reason.to_string()))
        }
        KeyAdmission::NotFound => {
            tracing::info!("Unknown API key (hash {})", hash_api_key(&api_key));
            Err(GatewayError::Authentication("Invalid API key".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer lxs_TEST0000000000000000000000"),
        );
        assert_eq!(
            extract_api_key(&headers).as_deref(),
            Some("lxs_TEST0000000000000000000000")
        );
    }

    #[test]
    fn test_extract_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "api-key",
            HeaderValue::from_static("lxs_TEST0000000000000000000000"),
        );
        assert_eq!(
            extract_api_key(&headers).as_deref(),
            Some("lxs_TEST0000000000000000000000")
        );
    }

    #[test]
    fn test_bearer_wins_over_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer lxs_AAAA"));
        headers.insert("api-key", HeaderValue::from_static("lxs_BBBB"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("lxs_AAAA"));
    }

    #[test]
    fn test_missing_key() {
        assert_eq!(extract_api_key(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn test_admit_missing_key_is_authentication_error() {
        let store = Store::open_in_memory().unwrap();
        let err = admit(&store, &HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_admit_happy_path() {
        let store = Store::open_in_memory().unwrap();
        let key = store.create_key("ci", 1000, None).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", key.api_key)).unwrap(),
        );

        let admitted = admit(&store, &headers).await.unwrap();
        assert_eq!(admitted.id, key.id);
    }

    #[tokio::test]
    async fn test_admit_exhausted_key_denied() {
        let store = Store::open_in_memory().unwrap();
        let key = store.create_key("small", 100, None).unwrap();
        store
            .record_usage(key.id, 1, "qwen-plus", "dashscope", 50, 50)
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", key.api_key)).unwrap(),
        );

        let err = admit(&store, &headers).await.unwrap_err();
        match err {
            GatewayError::Authentication(message) => assert!(message.contains("exhausted")),
            other => panic!("expected authentication error, got {:?}", other),
        }
    }
}
