use crate::error::RelayError;
use axum::http::{HeaderValue, StatusCode, header};
use bytes::Bytes;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Timeout,
    Body,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            message,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            UpstreamErrorKind::Timeout
        } else {
            UpstreamErrorKind::Network
        };
        Self::new(kind, err.status(), err.to_string())
    }
}

impl From<UpstreamCallError> for RelayError {
    fn from(err: UpstreamCallError) -> Self {
        match err.kind {
            UpstreamErrorKind::Network | UpstreamErrorKind::Timeout => {
                RelayError::internal("do_request_failed", err.message)
            }
            UpstreamErrorKind::Body => RelayError::internal("read_response_body_failed", err.message),
        }
    }
}

/// Request body handed to an adaptor for dispatch.
#[derive(Debug, Clone)]
pub struct UpstreamBody {
    pub content_type: HeaderValue,
    pub bytes: Bytes,
}

impl UpstreamBody {
    pub fn json(bytes: impl Into<Bytes>) -> Self {
        Self {
            content_type: HeaderValue::from_static("application/json"),
            bytes: bytes.into(),
        }
    }

    pub fn with_content_type(content_type: HeaderValue, bytes: Bytes) -> Self {
        Self {
            content_type,
            bytes,
        }
    }
}

/// Sends `body`. A buffered call gets `timeout` for the whole exchange. A
/// streamed call only until the response head arrives; after that the
/// stream producer enforces an idle limit instead, so long completions are
/// not cut off.
pub async fn send(
    builder: reqwest::RequestBuilder,
    body: UpstreamBody,
    timeout: Duration,
    streaming: bool,
) -> Result<reqwest::Response, UpstreamCallError> {
    let builder = builder
        .header(header::CONTENT_TYPE, body.content_type)
        .body(body.bytes);
    if !streaming {
        return builder
            .timeout(timeout)
            .send()
            .await
            .map_err(UpstreamCallError::from_reqwest);
    }
    match tokio::time::timeout(timeout, builder.send()).await {
        Ok(result) => result.map_err(UpstreamCallError::from_reqwest),
        Err(_) => Err(UpstreamCallError::new(
            UpstreamErrorKind::Timeout,
            None,
            format!("no response from upstream within {}s", timeout.as_secs()),
        )),
    }
}

/// Buffers a non-2xx response so it can be relayed byte-for-byte.
pub async fn into_upstream_error(resp: reqwest::Response) -> RelayError {
    let status = resp.status();
    let headers = resp.headers().clone();
    match resp.bytes().await {
        Ok(body) => RelayError::Upstream {
            status,
            headers,
            body,
        },
        Err(err) => RelayError::internal("read_response_body_failed", err),
    }
}

pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_avoids_double_version() {
        assert_eq!(
            join_url("https://api.example.com/v1/", "/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            join_url("https://api.example.com", "/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn network_failures_are_retryable_internal_errors() {
        let err: RelayError =
            UpstreamCallError::new(UpstreamErrorKind::Network, None, "refused".into()).into();
        assert!(err.is_retryable());
        assert_eq!(err.code(), "do_request_failed");
    }

    #[tokio::test]
    async fn streamed_call_waits_only_for_the_response_head() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = reqwest::Client::new();
        let err = send(
            client.post(format!("http://{addr}/v1/chat/completions")),
            UpstreamBody::json("{}"),
            Duration::from_millis(100),
            true,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, UpstreamErrorKind::Timeout);
    }
}
