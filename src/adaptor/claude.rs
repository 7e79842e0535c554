use super::Adaptor;
use crate::config::RelayMode;
use crate::error::{RelayError, RelayResult};
use crate::relay::dto::{GeneralOpenAiRequest, Usage};
use crate::relay::response::{self, BufferedDialect};
use crate::relay::stream::{self, StreamDialect};
use crate::relay::{Handled, RelayContext, SensitivePolicy};
use crate::upstream::join_url;
use async_trait::async_trait;
use serde_json::{Map, Value, json};

pub const CHANNEL_NAME: &str = "claude";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: i64 = 4096;

pub const MODEL_LIST: &[&str] = &[
    "claude-instant-1.2",
    "claude-2.0",
    "claude-2.1",
    "claude-3-haiku-20240307",
    "claude-3-sonnet-20240229",
    "claude-3-opus-20240229",
    "claude-3-5-sonnet-20240620",
];

/// Anthropic Messages API.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeAdaptor;

#[async_trait]
impl Adaptor for ClaudeAdaptor {
    fn init(&mut self, _ctx: &RelayContext) {}

    fn request_url(&self, ctx: &RelayContext) -> RelayResult<String> {
        if ctx.relay_mode != RelayMode::ChatCompletions {
            return Err(unsupported_mode(ctx.relay_mode));
        }
        Ok(join_url(ctx.channel.base_url_or_default(), "/v1/messages"))
    }

    fn setup_headers(
        &self,
        ctx: &RelayContext,
        builder: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &ctx.channel.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    fn convert_request(
        &self,
        mode: RelayMode,
        request: &GeneralOpenAiRequest,
    ) -> RelayResult<Value> {
        if mode != RelayMode::ChatCompletions {
            return Err(unsupported_mode(mode));
        }
        Ok(convert_chat_request(request))
    }

    async fn handle_response(
        &self,
        ctx: &RelayContext,
        policy: &SensitivePolicy,
        response: reqwest::Response,
    ) -> RelayResult<Handled> {
        if ctx.is_stream {
            let dialect = StreamDialect::Claude(ClaudeStreamState::new(&ctx.upstream_model));
            return Ok(stream::relay_stream(response, ctx, policy, dialect));
        }
        response::relay_buffered(response, ctx, policy, BufferedDialect::Claude).await
    }

    fn model_list(&self) -> &'static [&'static str] {
        MODEL_LIST
    }

    fn channel_name(&self) -> &'static str {
        CHANNEL_NAME
    }
}

fn unsupported_mode(mode: RelayMode) -> RelayError {
    RelayError::validation(
        "convert_request_failed",
        format!("{} is not supported by anthropic channels", mode.as_str()),
    )
}

/// Builds a Messages API body from an OpenAI chat request.
pub fn convert_chat_request(req: &GeneralOpenAiRequest) -> Value {
    let mut system = Vec::new();
    let mut messages = Vec::new();
    for message in req.messages.as_deref().unwrap_or_default() {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let content = message.get("content").unwrap_or(&Value::Null);
        match role {
            "system" | "developer" => {
                let text = crate::tokenizer::input_text(content);
                if !text.is_empty() {
                    system.push(text);
                }
            }
            "assistant" => messages.push(json!({
                "role": "assistant",
                "content": encode_content(content),
            })),
            _ => messages.push(json!({
                "role": "user",
                "content": encode_content(content),
            })),
        }
    }

    let mut body = Map::new();
    body.insert("model".into(), Value::String(req.model.clone()));
    body.insert("messages".into(), Value::Array(messages));
    body.insert(
        "max_tokens".into(),
        Value::from(req.max_tokens.filter(|n| *n > 0).unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    if !system.is_empty() {
        body.insert("system".into(), Value::String(system.join("\n")));
    }
    if let Some(stream) = req.stream {
        body.insert("stream".into(), Value::Bool(stream));
    }
    for key in ["temperature", "top_p", "top_k"] {
        if let Some(v) = req.extra.get(key) {
            body.insert(key.into(), v.clone());
        }
    }
    match req.extra.get("stop") {
        Some(Value::String(s)) => {
            body.insert("stop_sequences".into(), json!([s]));
        }
        Some(Value::Array(items)) => {
            body.insert("stop_sequences".into(), Value::Array(items.clone()));
        }
        _ => {}
    }
    Value::Object(body)
}

fn encode_content(content: &Value) -> Value {
    let Some(parts) = content.as_array() else {
        return Value::String(content.as_str().unwrap_or_default().to_string());
    };
    let blocks: Vec<Value> = parts
        .iter()
        .filter_map(|part| match part.get("type").and_then(Value::as_str) {
            Some("text") => Some(json!({
                "type": "text",
                "text": part.get("text").and_then(Value::as_str).unwrap_or_default(),
            })),
            Some("image_url") => {
                let url = part
                    .get("image_url")
                    .and_then(|v| v.get("url").or(Some(v)))
                    .and_then(Value::as_str)?;
                Some(encode_image(url))
            }
            _ => None,
        })
        .collect();
    Value::Array(blocks)
}

fn encode_image(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return json!({
                "type": "image",
                "source": { "type": "base64", "media_type": media_type, "data": data }
            });
        }
    }
    json!({
        "type": "image",
        "source": { "type": "url", "url": url }
    })
}

pub fn stop_reason_to_finish_reason(reason: &str) -> &'static str {
    match reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

/// Converts a Messages API response into an OpenAI chat completion.
pub fn response_to_openai(value: &Value, model: &str) -> Value {
    let text: String = value
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    let finish_reason = value
        .get("stop_reason")
        .and_then(Value::as_str)
        .map(stop_reason_to_finish_reason);
    let usage = value.get("usage");
    let prompt = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let completion = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    json!({
        "id": value.get("id").cloned().unwrap_or(Value::Null),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": value.get("model").and_then(Value::as_str).unwrap_or(model),
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": finish_reason,
        }],
        "usage": Usage::new(prompt, completion),
    })
}

/// Per-stream state for turning Messages API events into chat chunk frames.
#[derive(Debug, Clone)]
pub struct ClaudeStreamState {
    id: String,
    model: String,
    created: i64,
    prompt_tokens: i64,
    completion_tokens: i64,
}

impl ClaudeStreamState {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }

    /// Usage reported by the upstream, if it sent any output count.
    pub fn usage(&self) -> Option<Usage> {
        (self.completion_tokens > 0).then(|| Usage::new(self.prompt_tokens, self.completion_tokens))
    }

    /// Translates one `data: ` line. Returns `None` for events with no chat
    /// counterpart.
    pub fn translate(&mut self, line: &str) -> Option<String> {
        let payload = line.strip_prefix("data: ")?;
        let event: Value = serde_json::from_str(payload).ok()?;
        match event.get("type").and_then(Value::as_str).unwrap_or_default() {
            "message_start" => {
                let message = event.get("message");
                if let Some(id) = message.and_then(|m| m.get("id")).and_then(Value::as_str) {
                    self.id = id.to_string();
                }
                if let Some(tokens) = message
                    .and_then(|m| m.get("usage"))
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(Value::as_i64)
                {
                    self.prompt_tokens = tokens;
                }
                Some(self.chunk(json!({ "role": "assistant", "content": "" }), None))
            }
            "content_block_delta" => {
                let delta = event.get("delta")?;
                if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
                    return None;
                }
                let text = delta.get("text").and_then(Value::as_str)?;
                Some(self.chunk(json!({ "content": text }), None))
            }
            "message_delta" => {
                if let Some(tokens) = event
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_i64)
                {
                    self.completion_tokens = tokens;
                }
                let reason = event
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)?;
                Some(self.chunk(json!({}), Some(stop_reason_to_finish_reason(reason))))
            }
            "message_stop" => Some("data: [DONE]".to_string()),
            "error" => Some(format!(
                "data: {}",
                json!({ "error": event.get("error").cloned().unwrap_or(Value::Null) })
            )),
            _ => None,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> String {
        let chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
        });
        format!("data: {chunk}")
    }
}
