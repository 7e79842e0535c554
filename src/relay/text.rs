use super::dto::GeneralOpenAiRequest;
use super::{RelayContext, SensitivePolicy};
use crate::adaptor::{Adaptor, RelayAdaptor};
use crate::app::AppState;
use crate::config::{ApiType, RelayMode};
use crate::error::{RelayError, RelayResult};
use crate::pricing::Pricing;
use crate::tokenizer;
use crate::upstream::UpstreamBody;
use axum::response::Response;
use bytes::Bytes;
use serde_json::Value;

const DEFAULT_MODERATION_MODEL: &str = "text-moderation-latest";
const MAX_TOKENS_LIMIT: i64 = (i32::MAX / 2) as i64;

pub fn parse_text_request(
    mode: RelayMode,
    path: &str,
    raw: &[u8],
) -> RelayResult<GeneralOpenAiRequest> {
    let mut request: GeneralOpenAiRequest = serde_json::from_slice(raw)
        .map_err(|e| RelayError::validation("invalid_text_request", e.to_string()))?;
    if request.model.is_empty() {
        match mode {
            RelayMode::Moderations => request.model = DEFAULT_MODERATION_MODEL.to_string(),
            RelayMode::Embeddings => {
                if let Some(model) = engine_model(path) {
                    request.model = model.to_string();
                }
            }
            _ => {}
        }
    }
    validate_text_request(&request, mode)?;
    Ok(request)
}

/// Model segment of `/v1/engines/{model}/embeddings`.
fn engine_model(path: &str) -> Option<&str> {
    path.strip_prefix("/v1/engines/")?
        .strip_suffix("/embeddings")
        .filter(|m| !m.is_empty())
}

pub fn validate_text_request(request: &GeneralOpenAiRequest, mode: RelayMode) -> RelayResult<()> {
    let invalid = |message: &str| Err(RelayError::validation("invalid_text_request", message));
    if let Some(max_tokens) = request.max_tokens {
        if !(0..=MAX_TOKENS_LIMIT).contains(&max_tokens) {
            return invalid("max_tokens is invalid");
        }
    }
    if request.model.is_empty() {
        return invalid("model is required");
    }
    match mode {
        RelayMode::Completions if is_blank(request.prompt.as_ref()) => {
            invalid("field prompt is required")
        }
        RelayMode::ChatCompletions
            if request.messages.as_ref().is_none_or(|m| m.is_empty()) =>
        {
            invalid("field messages is required")
        }
        RelayMode::Moderations if is_blank(request.input.as_ref()) => {
            invalid("field input is required")
        }
        RelayMode::Edits if request.instruction.as_deref().unwrap_or_default().is_empty() => {
            invalid("field instruction is required")
        }
        _ => Ok(()),
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

/// Text the prompt-side content check scans.
pub fn prompt_text(request: &GeneralOpenAiRequest, mode: RelayMode) -> String {
    match mode {
        RelayMode::ChatCompletions => {
            tokenizer::messages_text(request.messages.as_deref().unwrap_or_default())
        }
        RelayMode::Completions => request
            .prompt
            .as_ref()
            .map(tokenizer::input_text)
            .unwrap_or_default(),
        RelayMode::Moderations | RelayMode::Embeddings => request
            .input
            .as_ref()
            .map(tokenizer::input_text)
            .unwrap_or_default(),
        RelayMode::Edits => request.instruction.clone().unwrap_or_default(),
        _ => String::new(),
    }
}

pub fn count_prompt_tokens(request: &GeneralOpenAiRequest, mode: RelayMode, model: &str) -> i64 {
    match mode {
        RelayMode::ChatCompletions => {
            tokenizer::count_message_tokens(model, request.messages.as_deref().unwrap_or_default())
        }
        RelayMode::Completions => request
            .prompt
            .as_ref()
            .map(|p| tokenizer::count_input_tokens(model, p))
            .unwrap_or(0),
        RelayMode::Moderations | RelayMode::Embeddings => request
            .input
            .as_ref()
            .map(|i| tokenizer::count_input_tokens(model, i))
            .unwrap_or(0),
        RelayMode::Edits => {
            tokenizer::count_text_tokens(model, request.instruction.as_deref().unwrap_or_default())
        }
        _ => 0,
    }
}

pub async fn relay_text(
    state: &AppState,
    mut ctx: RelayContext,
    request: &GeneralOpenAiRequest,
    raw: &Bytes,
) -> RelayResult<Response> {
    let settings = state.settings.load_full();
    let mapped = ctx.apply_model_mapping();
    let model = ctx.upstream_model.clone();

    if settings.check_prompt() {
        let filter = state.sensitive.load();
        let (hit, words) = filter.contains(&prompt_text(request, ctx.relay_mode));
        if hit {
            tracing::info!(
                request_id = %ctx.request_id,
                words = ?words,
                "prompt rejected by content check"
            );
            return Err(RelayError::SensitiveContent { words });
        }
    }
    ctx.prompt_tokens = count_prompt_tokens(request, ctx.relay_mode, &model);

    let pricing = Pricing::resolve(&settings, &model, &ctx.group);
    let estimated_tokens = match request.max_tokens {
        Some(max_tokens) if max_tokens != 0 => ctx.prompt_tokens + max_tokens,
        _ => settings.pre_consumed_quota,
    };
    let reservation = state
        .ledger
        .reserve(&ctx.payer, pricing.reservation(estimated_tokens))
        .await?;

    let policy = SensitivePolicy::new(&settings, state.sensitive.load());
    match forward_text(state, &mut ctx, request, raw, mapped, &policy).await {
        Ok(handled) => super::complete(state, ctx, pricing, reservation, handled).await,
        Err(err) => {
            super::refund(state, &ctx, &reservation).await;
            Err(err)
        }
    }
}

async fn forward_text(
    state: &AppState,
    ctx: &mut RelayContext,
    request: &GeneralOpenAiRequest,
    raw: &Bytes,
    mapped: bool,
    policy: &SensitivePolicy,
) -> RelayResult<super::Handled> {
    let adaptor = RelayAdaptor::for_context(ctx)?;
    let body = if ctx.api_type == Some(ApiType::OpenAi) && !mapped {
        UpstreamBody::json(raw.clone())
    } else {
        let mut converted = request.clone();
        converted.model = ctx.upstream_model.clone();
        let value = adaptor.convert_request(ctx.relay_mode, &converted)?;
        let encoded = serde_json::to_vec(&value)
            .map_err(|e| RelayError::internal("marshal_text_request_failed", e))?;
        UpstreamBody::json(encoded)
    };
    let response = super::forward(state, ctx, &adaptor, body).await?;
    adaptor.handle_response(ctx, policy, response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(mode: RelayMode, path: &str, body: Value) -> RelayResult<GeneralOpenAiRequest> {
        parse_text_request(mode, path, &serde_json::to_vec(&body).unwrap())
    }

    #[test]
    fn moderation_model_defaults() {
        let req = parse(RelayMode::Moderations, "/v1/moderations", json!({"input": "x"})).unwrap();
        assert_eq!(req.model, "text-moderation-latest");
    }

    #[test]
    fn engine_path_supplies_embedding_model() {
        let req = parse(
            RelayMode::Embeddings,
            "/v1/engines/text-embedding-ada-002/embeddings",
            json!({"input": "x"}),
        )
        .unwrap();
        assert_eq!(req.model, "text-embedding-ada-002");
    }

    #[test]
    fn validation_messages_follow_mode() {
        let err = parse(RelayMode::ChatCompletions, "/v1/chat/completions", json!({"model": "gpt-4", "messages": []}))
            .unwrap_err();
        assert_eq!(err.to_string(), "field messages is required");
        let err = parse(RelayMode::Completions, "/v1/completions", json!({"model": "gpt-4"})).unwrap_err();
        assert_eq!(err.to_string(), "field prompt is required");
        let err = parse(RelayMode::Edits, "/v1/edits", json!({"model": "x"})).unwrap_err();
        assert_eq!(err.to_string(), "field instruction is required");
        let err = parse(RelayMode::ChatCompletions, "/v1/chat/completions", json!({"messages": [{"role": "user", "content": "hi"}]}))
            .unwrap_err();
        assert_eq!(err.to_string(), "model is required");
        assert_eq!(err.code(), "invalid_text_request");
    }

    #[test]
    fn max_tokens_must_be_in_range() {
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": -1
        });
        let err = parse(RelayMode::ChatCompletions, "/v1/chat/completions", body).unwrap_err();
        assert_eq!(err.to_string(), "max_tokens is invalid");
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": i64::from(i32::MAX)
        });
        assert!(parse(RelayMode::ChatCompletions, "/v1/chat/completions", body).is_err());
    }

    #[test]
    fn prompt_text_covers_each_mode() {
        let req = parse(
            RelayMode::Completions,
            "/v1/completions",
            json!({"model": "gpt-3.5-turbo-instruct", "prompt": ["a", "b"]}),
        )
        .unwrap();
        assert_eq!(prompt_text(&req, RelayMode::Completions), "a\nb");
        assert!(count_prompt_tokens(&req, RelayMode::Completions, &req.model) >= 2);
    }
}
