//! Legacy claude_code passthrough
//!
//! In claude_code mode the gateway is a dumb proxy: the exact method,
//! headers, query and body go to the configured legacy endpoint, and the
//! response comes back unchanged. Hop-by-hop headers are stripped in both
//! directions; everything else passes through.

use std::time::Duration;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;

use super::error::GatewayError;
use crate::routing::PassthroughTarget;

/// Headers that describe the connection, not the payload
const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "keep-alive",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

/// Result of one proxied legacy call
pub struct PassthroughOutcome {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Forward one request to the legacy endpoint and buffer the reply
pub async fn forward(
    client: &reqwest::Client,
    target: &PassthroughTarget,
    method: &Method,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<PassthroughOutcome, GatewayError> {
    let url = match query {
        Some(query) if !query.is_empty() => format!("{}?{}", target.url, query),
        _ => target.url.clone(),
    };

    let forward_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| GatewayError::BadRequest(format!("Invalid HTTP method: {}", e)))?;

    let mut request = client
        .request(forward_method, &url)
        .timeout(Duration::from_secs(target.timeout_sec))
        .body(body.to_vec());

    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        request = request.header(name.as_str(), value.as_bytes().to_vec());
    }

    tracing::debug!("Passthrough {} -> {}", method, url);

    let response = request.send().await.map_err(|e| GatewayError::Upstream {
        status: None,
        body: e.to_string(),
    })?;

    let status = response.status().as_u16();
    let response_headers = response
        .headers()
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect();

    let body = response.bytes().await.map_err(|e| GatewayError::Upstream {
        status: Some(status),
        body: e.to_string(),
    })?;

    Ok(PassthroughOutcome {
        status,
        headers: response_headers,
        body,
    })
}
