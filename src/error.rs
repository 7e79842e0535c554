use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.message,
                error_type: self.error_type,
                param: self.param,
                code: self.code,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failure of one relay attempt.
///
/// Everything except `Upstream` renders as an [`AppError`] envelope. Upstream
/// failures carry the provider's status, headers and body and are relayed
/// untouched.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{message}")]
    Validation { code: &'static str, message: String },
    #[error("user quota is not enough")]
    InsufficientQuota,
    #[error("{0}")]
    InsufficientCredentialQuota(String),
    #[error("upstream returned status {status}")]
    Upstream {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    #[error("sensitive words detected: {}", words.join(", "))]
    SensitiveContent { words: Vec<String> },
    #[error("invalid api type")]
    InvalidApiType,
    #[error("no available channel for model {model} under group {group}")]
    NoChannel { group: String, model: String },
    #[error("{message}")]
    Internal { code: &'static str, message: String },
}

pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn internal(code: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Internal {
            code,
            message: message.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } | Self::SensitiveContent { .. } | Self::InvalidApiType => {
                StatusCode::BAD_REQUEST
            }
            Self::InsufficientQuota | Self::InsufficientCredentialQuota(_) => StatusCode::FORBIDDEN,
            Self::Upstream { status, .. } => *status,
            Self::NoChannel { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Validation { code, .. } | Self::Internal { code, .. } => code,
            Self::InsufficientQuota => "insufficient_user_quota",
            Self::InsufficientCredentialQuota(_) => "pre_consume_token_quota_failed",
            Self::Upstream { .. } => "upstream_error",
            Self::SensitiveContent { .. } => "sensitive_words_detected",
            Self::InvalidApiType => "invalid_api_type",
            Self::NoChannel { .. } => "model_not_available",
        }
    }

    /// Whether another channel may succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { status, .. } => {
                if *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    return true;
                }
                !(*status == StatusCode::BAD_REQUEST || status.is_success())
            }
            Self::Internal { code, .. } => *code == "do_request_failed",
            _ => false,
        }
    }

    /// Renders the error for the client, tagging generated messages with the
    /// request id. Upstream bodies are never rewritten.
    pub fn into_response_with_request_id(self, request_id: &str) -> Response {
        if let Self::Upstream {
            status,
            headers,
            body,
        } = self
        {
            return upstream_passthrough(status, &headers, body);
        }
        let status = self.status();
        let error_type = match &self {
            Self::Internal { .. } => "server_error",
            Self::InsufficientQuota | Self::InsufficientCredentialQuota(_) => "insufficient_quota",
            _ => "invalid_request_error",
        };
        let code = self.code().to_string();
        let message = format!("{} (request id: {})", self, request_id);
        AppError::new(status, code, message)
            .with_type(error_type)
            .into_response()
    }
}

fn upstream_passthrough(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Response {
    let mut response = Response::builder().status(status);
    if let Some(target) = response.headers_mut() {
        copy_response_headers(headers, target);
    }
    response
        .body(axum::body::Body::from(body))
        .unwrap_or_else(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "response_build_failed",
                err.to_string(),
            )
            .into_response()
        })
}

/// Copies upstream response headers, leaving out the ones that describe the
/// original transfer rather than the payload.
pub fn copy_response_headers(source: &HeaderMap, target: &mut HeaderMap) {
    for (name, value) in source {
        if name == header::CONTENT_LENGTH
            || name == header::TRANSFER_ENCODING
            || name == header::CONNECTION
        {
            continue;
        }
        target.append(name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generated_messages_carry_request_id() {
        let err = RelayError::validation("model_required", "model is required");
        let response = err.into_response_with_request_id("req-1");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            value["error"]["message"],
            "model is required (request id: req-1)"
        );
        assert_eq!(value["error"]["code"], "model_required");
    }

    #[tokio::test]
    async fn upstream_bodies_are_passed_through_untouched() {
        let raw = br#"{"error":{"message":"upstream exploded","type":"server_error"}}"#;
        let err = RelayError::Upstream {
            status: StatusCode::BAD_GATEWAY,
            headers: HeaderMap::new(),
            body: Bytes::from_static(raw),
        };
        let response = err.into_response_with_request_id("req-2");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.as_ref(), raw);
    }

    #[test]
    fn retry_policy_follows_status_class() {
        let upstream = |status| RelayError::Upstream {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        assert!(upstream(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(upstream(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(upstream(StatusCode::UNAUTHORIZED).is_retryable());
        assert!(!upstream(StatusCode::BAD_REQUEST).is_retryable());
        assert!(!RelayError::InsufficientQuota.is_retryable());
        assert!(!RelayError::SensitiveContent { words: vec![] }.is_retryable());
    }

    #[test]
    fn quota_errors_are_forbidden() {
        assert_eq!(RelayError::InsufficientQuota.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            RelayError::InsufficientCredentialQuota("token quota is not enough".into()).code(),
            "pre_consume_token_quota_failed"
        );
    }
}
