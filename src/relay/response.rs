//! Buffered relay for non-stream responses.

use crate::adaptor::claude;
use crate::config::RelayMode;
use crate::error::{RelayError, RelayResult, copy_response_headers};
use crate::relay::dto::Usage;
use crate::relay::{Handled, RelayContext, SensitivePolicy};
use crate::tokenizer;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferedDialect {
    OpenAi,
    Claude,
}

/// Result of inspecting a buffered body. `body` is `None` when it must not
/// reach the client.
#[derive(Debug, Clone)]
pub struct BufferedOutcome {
    pub body: Option<Bytes>,
    pub usage: Usage,
    pub sensitive_words: Vec<String>,
}

pub async fn relay_buffered(
    upstream: reqwest::Response,
    ctx: &RelayContext,
    policy: &SensitivePolicy,
    dialect: BufferedDialect,
) -> RelayResult<Handled> {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let body = upstream
        .bytes()
        .await
        .map_err(|e| RelayError::internal("read_response_body_failed", e))?;
    let outcome = process_buffered(
        status,
        &headers,
        body,
        ctx.relay_mode,
        &ctx.upstream_model,
        ctx.prompt_tokens,
        policy,
        dialect,
    )?;
    let rewritten = dialect != BufferedDialect::OpenAi;
    let response = outcome
        .body
        .map(|body| build_response(status, &headers, body, rewritten));
    Ok(Handled::Buffered {
        response,
        usage: outcome.usage,
        sensitive_words: outcome.sensitive_words,
    })
}

/// Relays a 2xx body unchanged unless it carries an `error` object, which is
/// surfaced as an upstream failure instead.
pub async fn relay_passthrough(upstream: reqwest::Response) -> RelayResult<Response> {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let body = upstream
        .bytes()
        .await
        .map_err(|e| RelayError::internal("read_response_body_failed", e))?;
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if is_json && crate::relay::dto::parse_error_body(&body).is_some() {
        return Err(RelayError::Upstream {
            status,
            headers,
            body,
        });
    }
    Ok(build_response(status, &headers, body, false))
}

/// Inspects a 2xx body: relays provider errors, recounts usage when it is
/// missing or a completion check is on, and redacts generated text.
#[allow(clippy::too_many_arguments)]
pub fn process_buffered(
    status: StatusCode,
    headers: &HeaderMap,
    body: Bytes,
    mode: RelayMode,
    model: &str,
    prompt_tokens: i64,
    policy: &SensitivePolicy,
    dialect: BufferedDialect,
) -> RelayResult<BufferedOutcome> {
    let mut value: Value = serde_json::from_slice(&body)
        .map_err(|e| RelayError::internal("unmarshal_response_body_failed", e))?;
    if carries_error(&value, dialect) {
        return Err(RelayError::Upstream {
            status,
            headers: headers.clone(),
            body,
        });
    }

    let mut modified = false;
    if dialect == BufferedDialect::Claude {
        value = claude::response_to_openai(&value, model);
        modified = true;
    }

    let mut usage: Usage = value
        .get("usage")
        .and_then(|u| serde_json::from_value(u.clone()).ok())
        .unwrap_or_default();
    let mut sensitive_words: Vec<String> = Vec::new();

    if usage.total_tokens == 0 || policy.check_completion {
        let mut completion_tokens = 0;
        if let Some(choices) = value.get_mut("choices").and_then(Value::as_array_mut) {
            for choice in choices {
                let Some(text) = choice_text_mut(choice, mode) else {
                    continue;
                };
                completion_tokens += tokenizer::count_text_tokens(model, text);
                if !policy.check_completion {
                    continue;
                }
                let redaction = policy.filter.redact(text);
                if redaction.matched {
                    *text = redaction.text;
                    modified = true;
                    for word in redaction.words {
                        if !sensitive_words.contains(&word) {
                            sensitive_words.push(word);
                        }
                    }
                }
            }
        }
        usage = Usage::new(prompt_tokens, completion_tokens);
        if let Some(obj) = value.as_object_mut() {
            let encoded = serde_json::to_value(usage)
                .map_err(|e| RelayError::internal("marshal_response_body_failed", e))?;
            obj.insert("usage".to_string(), encoded);
            modified = true;
        }
    }

    let body = if policy.stop_on_sensitive && !sensitive_words.is_empty() {
        None
    } else if modified {
        let encoded = serde_json::to_vec(&value)
            .map_err(|e| RelayError::internal("marshal_response_body_failed", e))?;
        Some(Bytes::from(encoded))
    } else {
        Some(body)
    };

    Ok(BufferedOutcome {
        body,
        usage,
        sensitive_words,
    })
}

fn carries_error(value: &Value, dialect: BufferedDialect) -> bool {
    let has_error_field = value.get("error").is_some_and(|e| !e.is_null());
    match dialect {
        BufferedDialect::OpenAi => has_error_field,
        BufferedDialect::Claude => {
            has_error_field || value.get("type").and_then(Value::as_str) == Some("error")
        }
    }
}

fn choice_text_mut(choice: &mut Value, mode: RelayMode) -> Option<&mut String> {
    let slot = if choice.get("message").is_some() {
        choice.get_mut("message")?.get_mut("content")?
    } else if mode == RelayMode::Completions || choice.get("text").is_some() {
        choice.get_mut("text")?
    } else {
        return None;
    };
    match slot {
        Value::String(text) => Some(text),
        _ => None,
    }
}

fn build_response(status: StatusCode, upstream: &HeaderMap, body: Bytes, rewritten: bool) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    copy_response_headers(upstream, response.headers_mut());
    if rewritten {
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    response
}
