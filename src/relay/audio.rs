use super::dto::{SpeechRequest, Usage};
use super::{Handled, RelayContext, RelayPayload};
use crate::adaptor::RelayAdaptor;
use crate::app::AppState;
use crate::error::{RelayError, RelayResult};
use crate::pricing::Pricing;
use crate::tokenizer;
use crate::upstream::UpstreamBody;
use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::{HeaderValue, header};
use axum::response::Response;
use bytes::Bytes;
use serde_json::Value;

pub fn parse_speech_request(raw: &[u8]) -> RelayResult<SpeechRequest> {
    let request: SpeechRequest = serde_json::from_slice(raw)
        .map_err(|e| RelayError::validation("invalid_audio_request", e.to_string()))?;
    if request.model.is_empty() {
        return Err(RelayError::validation(
            "invalid_audio_request",
            "model is required",
        ));
    }
    if request.input.is_empty() {
        return Err(RelayError::validation(
            "invalid_audio_request",
            "input is required",
        ));
    }
    Ok(request)
}

fn invalid_upload(message: String) -> RelayError {
    RelayError::validation("invalid_audio_request", message)
}

async fn replay_multipart(content_type: &HeaderValue, raw: &Bytes) -> RelayResult<Multipart> {
    let replay = Request::builder()
        .header(header::CONTENT_TYPE, content_type.clone())
        .body(Body::from(raw.clone()))
        .map_err(|e| invalid_upload(e.to_string()))?;
    Multipart::from_request(replay, &())
        .await
        .map_err(|e| invalid_upload(e.body_text()))
}

/// Reads a multipart transcription upload, keeping the raw body for
/// forwarding and pulling out the fields the relay needs.
pub async fn read_transcription(request: Request) -> RelayResult<RelayPayload> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .ok_or_else(|| invalid_upload("multipart/form-data body is required".into()))?;
    let raw = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| invalid_upload(e.to_string()))?;
    let mut multipart = replay_multipart(&content_type, &raw).await?;

    let mut model = String::new();
    let mut response_format = String::new();
    let mut has_file = false;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| invalid_upload(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "model" => model = field.text().await.map_err(|e| invalid_upload(e.body_text()))?,
            "response_format" => {
                response_format = field.text().await.map_err(|e| invalid_upload(e.body_text()))?
            }
            "file" => has_file = true,
            _ => {}
        }
    }
    if model.is_empty() {
        return Err(invalid_upload("model is required".into()));
    }
    if !has_file {
        return Err(invalid_upload("file is required".into()));
    }
    Ok(RelayPayload::Transcription {
        model,
        response_format,
        content_type,
        raw,
    })
}

fn multipart_boundary(content_type: &HeaderValue) -> Option<&str> {
    content_type
        .to_str()
        .ok()?
        .split(';')
        .find_map(|param| param.trim().strip_prefix("boundary="))
        .map(|boundary| boundary.trim_matches('"'))
}

/// Re-encodes a multipart upload with its `model` field replaced. Every
/// other part, file contents included, is carried over unchanged under the
/// original boundary.
pub async fn rewrite_multipart_model(
    content_type: &HeaderValue,
    raw: &Bytes,
    model: &str,
) -> RelayResult<Bytes> {
    let boundary = multipart_boundary(content_type)
        .ok_or_else(|| invalid_upload("multipart boundary is missing".into()))?;
    let mut multipart = replay_multipart(content_type, raw).await?;

    let mut out = Vec::with_capacity(raw.len() + model.len());
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| invalid_upload(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let part_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| invalid_upload(e.body_text()))?;

        out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        let mut disposition = format!("Content-Disposition: form-data; name=\"{name}\"");
        if let Some(file_name) = file_name {
            disposition.push_str(&format!("; filename=\"{file_name}\""));
        }
        out.extend_from_slice(disposition.as_bytes());
        out.extend_from_slice(b"\r\n");
        if let Some(part_type) = part_type {
            out.extend_from_slice(format!("Content-Type: {part_type}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        if name == "model" {
            out.extend_from_slice(model.as_bytes());
        } else {
            out.extend_from_slice(&data);
        }
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Ok(Bytes::from(out))
}

pub async fn relay_speech(
    state: &AppState,
    mut ctx: RelayContext,
    request: &SpeechRequest,
    raw: &Bytes,
) -> RelayResult<Response> {
    let settings = state.settings.load_full();
    let mapped = ctx.apply_model_mapping();
    let model = ctx.upstream_model.clone();

    if settings.check_prompt() {
        let (hit, words) = state.sensitive.load().contains(&request.input);
        if hit {
            return Err(RelayError::SensitiveContent { words });
        }
    }
    ctx.prompt_tokens = request.input.chars().count() as i64;

    let pricing = Pricing::resolve(&settings, &model, &ctx.group);
    let reservation = state
        .ledger
        .reserve(&ctx.payer, pricing.reservation(ctx.prompt_tokens))
        .await?;

    let result = async {
        let adaptor = RelayAdaptor::for_context(&ctx)?;
        let body = if mapped {
            let mut converted = request.clone();
            converted.model = model.clone();
            let encoded = serde_json::to_vec(&converted)
                .map_err(|e| RelayError::internal("marshal_audio_request_failed", e))?;
            UpstreamBody::json(encoded)
        } else {
            UpstreamBody::json(raw.clone())
        };
        let response = super::forward(state, &mut ctx, &adaptor, body).await?;
        super::response::relay_passthrough(response).await
    }
    .await;

    match result {
        Ok(response) => {
            let handled = Handled::Buffered {
                response: Some(response),
                usage: Usage::new(ctx.prompt_tokens, 0),
                sensitive_words: Vec::new(),
            };
            super::complete(state, ctx, pricing, reservation, handled).await
        }
        Err(err) => {
            super::refund(state, &ctx, &reservation).await;
            Err(err)
        }
    }
}

/// Transcription and translation. The multipart body is forwarded as-is
/// unless the channel maps the model; the charge is the token count of the
/// returned text.
pub async fn relay_transcription(
    state: &AppState,
    mut ctx: RelayContext,
    response_format: &str,
    content_type: &HeaderValue,
    raw: &Bytes,
) -> RelayResult<Response> {
    let settings = state.settings.load_full();
    let mapped = ctx.apply_model_mapping();
    let model = ctx.upstream_model.clone();

    let pricing = Pricing::resolve(&settings, &model, &ctx.group);
    let reservation = state
        .ledger
        .reserve(&ctx.payer, pricing.reservation(settings.pre_consumed_quota))
        .await?;

    let result = async {
        let adaptor = RelayAdaptor::for_context(&ctx)?;
        let forwarded = if mapped {
            rewrite_multipart_model(content_type, raw, &model).await?
        } else {
            raw.clone()
        };
        let body = UpstreamBody::with_content_type(content_type.clone(), forwarded);
        let response = super::forward(state, &mut ctx, &adaptor, body).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RelayError::internal("read_response_body_failed", e))?;
        if crate::relay::dto::parse_error_body(&bytes).is_some() {
            return Err(RelayError::Upstream {
                status,
                headers,
                body: bytes,
            });
        }
        let text = transcription_text(response_format, &bytes);
        let mut out = Response::new(Body::from(bytes));
        *out.status_mut() = status;
        crate::error::copy_response_headers(&headers, out.headers_mut());
        Ok((out, text))
    }
    .await;

    match result {
        Ok((response, text)) => {
            let completion_tokens = tokenizer::count_text_tokens(&model, &text);
            let handled = Handled::Buffered {
                response: Some(response),
                usage: Usage::new(0, completion_tokens),
                sensitive_words: Vec::new(),
            };
            super::complete(state, ctx, pricing, reservation, handled).await
        }
        Err(err) => {
            super::refund(state, &ctx, &reservation).await;
            Err(err)
        }
    }
}

/// The transcribed text. JSON formats carry it in `text`; the others
/// (`text`, `srt`, `vtt`) are the text itself.
pub fn transcription_text(response_format: &str, body: &[u8]) -> String {
    match response_format {
        "" | "json" | "verbose_json" => serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| v.get("text").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default(),
        _ => String::from_utf8_lossy(body).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speech_requires_input() {
        let err = parse_speech_request(br#"{"model":"tts-1"}"#).unwrap_err();
        assert_eq!(err.to_string(), "input is required");
        assert!(parse_speech_request(br#"{"model":"tts-1","input":"hello","voice":"alloy"}"#).is_ok());
    }

    #[test]
    fn transcription_text_follows_format() {
        assert_eq!(transcription_text("json", br#"{"text":"hello there"}"#), "hello there");
        assert_eq!(transcription_text("", br#"{"text":"hi"}"#), "hi");
        assert_eq!(transcription_text("srt", b"1\n00:00 --> 00:01\nhi"), "1\n00:00 --> 00:01\nhi");
    }

    #[tokio::test]
    async fn multipart_fields_are_extracted() {
        let boundary = "XBOUNDARY";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nwhisper-1\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"response_format\"\r\n\r\ntext\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.mp3\"\r\nContent-Type: audio/mpeg\r\n\r\nID3\r\n\
             --{b}--\r\n",
            b = boundary
        );
        let request = Request::builder()
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body.clone()))
            .unwrap();
        match read_transcription(request).await.unwrap() {
            RelayPayload::Transcription {
                model,
                response_format,
                raw,
                ..
            } => {
                assert_eq!(model, "whisper-1");
                assert_eq!(response_format, "text");
                assert_eq!(raw.as_ref(), body.as_bytes());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn mapped_model_is_written_into_the_upload() {
        let boundary = "XBOUNDARY";
        let content_type =
            HeaderValue::from_str(&format!("multipart/form-data; boundary={boundary}")).unwrap();
        let raw = Bytes::from(format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.mp3\"\r\nContent-Type: audio/mpeg\r\n\r\nID3\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nwhisper-alias\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"language\"\r\n\r\nfr\r\n\
             --{b}--\r\n",
            b = boundary
        ));

        let rewritten = rewrite_multipart_model(&content_type, &raw, "whisper-1")
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&rewritten);
        assert!(text.contains("name=\"model\"\r\n\r\nwhisper-1\r\n"), "{text}");
        assert!(!text.contains("whisper-alias"));
        assert!(text.contains("filename=\"a.mp3\"\r\nContent-Type: audio/mpeg\r\n\r\nID3\r\n"));
        assert!(text.contains("name=\"language\"\r\n\r\nfr\r\n"));

        let request = Request::builder()
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(rewritten))
            .unwrap();
        match read_transcription(request).await.unwrap() {
            RelayPayload::Transcription { model, .. } => assert_eq!(model, "whisper-1"),
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
