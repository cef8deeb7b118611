//! Gateway error types and client-facing error responses
//!
//! Every terminal error produces both a client-visible JSON response and an
//! interaction record; the record write happens at the call site, this type
//! only shapes the response.

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use serde_json::json;

/// Errors surfaced to the client, in Anthropic error-document shape
#[derive(Debug)]
pub enum GatewayError {
    /// Missing, invalid, expired or exhausted API key (401)
    Authentication(String),
    /// No adapter available for any candidate model (502-class)
    Routing(String),
    /// Non-2xx from the upstream; its status and body are embedded
    Upstream { status: Option<u16>, body: String },
    /// Unparseable body or unsupported method (400)
    BadRequest(String),
    /// Converter or adapter failure (500)
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Routing(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Upstream { status, .. } => status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Authentication(_) => "authentication_error",
            GatewayError::Routing(_) => "routing_error",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    fn message(&self) -> String {
        match self {
            GatewayError::Authentication(msg)
            | GatewayError::Routing(msg)
            | GatewayError::BadRequest(msg)
            | GatewayError::Internal(msg) => msg.clone(),
            GatewayError::Upstream { status, body } => match status {
                Some(status) => format!("API error: {} - {}", status, body),
                None => format!("Request failed: {}", body),
            },
        }
    }

    /// The Anthropic-shaped error document for this error
    pub fn body_json(&self) -> serde_json::Value {
        json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.message(),
            }
        })
    }

    /// The same document encoded as a mid-stream SSE error event
    pub fn sse_event(&self) -> String {
        format!("event: error\ndata: {}\n\n", self.body_json())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response<Body> {
        let status = self.status();
        let body = self.body_json().to_string();

        tracing::error!("Gateway error: {} - {}", status, self.message());

        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| {
                Response::new(Body::from("Internal error building error response"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::Authentication("no key".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::BadRequest("not json".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Routing("no adapter".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Upstream {
                status: Some(429),
                body: "slow down".into()
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::Upstream {
                status: None,
                body: "refused".into()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_body_shape() {
        let err = GatewayError::Authentication("API key has expired".into());
        let body = err.body_json();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "authentication_error");
        assert_eq!(body["error"]["message"], "API key has expired");
    }

    #[test]
    fn test_sse_event_shape() {
        let err = GatewayError::Upstream {
            status: Some(500),
            body: "boom".into(),
        };
        let event = err.sse_event();
        assert!(event.starts_with("event: error\ndata: "));
        assert!(event.ends_with("\n\n"));
        assert!(event.contains("upstream_error"));
    }
}
