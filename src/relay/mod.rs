//! Request orchestration: authenticate, parse once, then run the modality
//! pipeline against one channel at a time until an attempt succeeds or the
//! retry budget runs out.

pub mod audio;
pub mod dto;
pub mod image;
pub mod response;
pub mod stream;
pub mod text;

use crate::app::AppState;
use crate::channels::Channel;
use crate::config::{ApiType, Modality, RelayMode};
use crate::error::{AppError, RelayError, RelayResult};
use crate::ledger::{Payer, Reservation, SettleRequest};
use crate::pricing::Pricing;
use crate::sensitive::SensitiveFilter;
use crate::settings::RelaySettings;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use dto::{GeneralOpenAiRequest, ImageRequest, SpeechRequest, Usage};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream::StreamOutcome;
use tokio::sync::oneshot;

/// Per-attempt request state shared by every pipeline stage.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub request_id: String,
    pub payer: Payer,
    pub group: String,
    pub channel: Arc<Channel>,
    pub api_type: Option<ApiType>,
    pub relay_mode: RelayMode,
    /// Client path including any query string.
    pub request_path: String,
    pub origin_model: String,
    pub upstream_model: String,
    pub prompt_tokens: i64,
    pub is_stream: bool,
    pub started_at: Instant,
    pub started_at_utc: chrono::DateTime<chrono::Utc>,
    pub timeout: Duration,
}

impl RelayContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_id: &str,
        payer: Payer,
        group: &str,
        channel: Arc<Channel>,
        relay_mode: RelayMode,
        request_path: &str,
        model: &str,
        is_stream: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            payer,
            group: group.to_string(),
            api_type: channel.channel_type.api_type(),
            channel,
            relay_mode,
            request_path: request_path.to_string(),
            origin_model: model.to_string(),
            upstream_model: model.to_string(),
            prompt_tokens: 0,
            is_stream,
            started_at: Instant::now(),
            started_at_utc: chrono::Utc::now(),
            timeout,
        }
    }

    /// Applies the channel's model mapping. Returns whether the model changed.
    pub fn apply_model_mapping(&mut self) -> bool {
        match self.channel.model_mapping.get(&self.origin_model) {
            Some(mapped) if !mapped.trim().is_empty() => {
                self.upstream_model = mapped.clone();
                true
            }
            _ => false,
        }
    }

    pub fn model_mapped(&self) -> bool {
        self.upstream_model != self.origin_model
    }

    /// Upstreams may answer with an event stream even when the client did
    /// not ask for one.
    pub fn detect_stream(&mut self, headers: &HeaderMap) {
        let is_event_stream = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));
        if is_event_stream {
            self.is_stream = true;
        }
    }

    pub fn use_time_seconds(&self) -> i64 {
        self.started_at.elapsed().as_secs() as i64
    }
}

/// Completion-side content rules for one request.
#[derive(Clone)]
pub struct SensitivePolicy {
    pub filter: Arc<SensitiveFilter>,
    pub check_completion: bool,
    pub stop_on_sensitive: bool,
}

impl SensitivePolicy {
    pub fn new(settings: &RelaySettings, filter: Arc<SensitiveFilter>) -> Self {
        Self {
            filter,
            check_completion: settings.check_completion(),
            stop_on_sensitive: settings.stop_on_sensitive_enabled,
        }
    }
}

/// How an adaptor delivered a successful upstream response.
pub enum Handled {
    /// The body was read in full. `response` is `None` when it was withheld
    /// for sensitive content.
    Buffered {
        response: Option<Response>,
        usage: Usage,
        sensitive_words: Vec<String>,
    },
    /// Frames are still flowing; `outcome` resolves when the stream ends.
    Streaming {
        response: Response,
        outcome: oneshot::Receiver<StreamOutcome>,
    },
}

/// A request body parsed once and replayed on every attempt.
#[derive(Debug, Clone)]
pub enum RelayPayload {
    Text {
        request: GeneralOpenAiRequest,
        raw: Bytes,
    },
    Image {
        request: ImageRequest,
        raw: Bytes,
    },
    Speech {
        request: SpeechRequest,
        raw: Bytes,
    },
    Transcription {
        model: String,
        response_format: String,
        content_type: HeaderValue,
        raw: Bytes,
    },
}

impl RelayPayload {
    pub fn model(&self) -> &str {
        match self {
            Self::Text { request, .. } => &request.model,
            Self::Image { request, .. } => &request.model,
            Self::Speech { request, .. } => &request.model,
            Self::Transcription { model, .. } => model,
        }
    }

    pub fn is_stream(&self) -> bool {
        match self {
            Self::Text { request, .. } => request.is_stream(),
            _ => false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RelayQuery {
    retry: Option<u32>,
}

/// Entry point for every relayed endpoint.
pub async fn relay(State(state): State<AppState>, request: Request) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let request_path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let retry_override = Query::<RelayQuery>::try_from_uri(request.uri())
        .map(|q| q.0.retry)
        .unwrap_or_default();

    let caller = match state
        .auth
        .authenticate_headers(request.headers(), &state.user_store)
        .await
    {
        Ok(caller) => caller,
        Err(err) => return err.into_response(),
    };

    let Some(mode) = RelayMode::from_path(request.uri().path()) else {
        return AppError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Invalid URL ({} {})", request.method(), request.uri().path()),
        )
        .with_type("invalid_request_error")
        .into_response();
    };
    metrics::counter!("relay_requests_total", "mode" => mode.as_str()).increment(1);

    let path = request.uri().path().to_string();
    let payload = match read_payload(mode, &path, request).await {
        Ok(payload) => payload,
        Err(err) => {
            tracing::info!(request_id = %request_id, code = err.code(), "invalid relay request: {err}");
            return err.into_response_with_request_id(&request_id);
        }
    };

    let settings = state.settings.load_full();
    let attempts = retry_override.unwrap_or(settings.retry_times) as usize + 1;
    let payer = caller.payer();
    let group = caller.group().to_string();
    let mut tried: HashSet<String> = HashSet::new();
    let mut last_error: Option<RelayError> = None;

    for attempt in 0..attempts {
        let Some(channel) = select_channel(&state, &group, payload.model(), &tried) else {
            break;
        };
        tried.insert(channel.id.clone());
        let ctx = RelayContext::new(
            &request_id,
            payer.clone(),
            &group,
            channel.clone(),
            mode,
            &request_path,
            payload.model(),
            payload.is_stream(),
            state.runtime.relay_timeout,
        );

        let result = match &payload {
            RelayPayload::Text { request, raw } => text::relay_text(&state, ctx, request, raw).await,
            RelayPayload::Image { request, raw } => {
                image::relay_image(&state, ctx, request, raw).await
            }
            RelayPayload::Speech { request, raw } => {
                audio::relay_speech(&state, ctx, request, raw).await
            }
            RelayPayload::Transcription {
                response_format,
                content_type,
                raw,
                ..
            } => {
                audio::relay_transcription(&state, ctx, response_format, content_type, raw).await
            }
        };

        match result {
            Ok(response) => return response,
            Err(err) => {
                state.health.observe(&channel, &err).await;
                let retry = err.is_retryable() && attempt + 1 < attempts;
                tracing::warn!(
                    request_id = %request_id,
                    channel_id = %channel.id,
                    channel_name = %channel.name,
                    attempt,
                    status = err.status().as_u16(),
                    code = err.code(),
                    retry,
                    "relay attempt failed: {err}"
                );
                if !retry {
                    return err.into_response_with_request_id(&request_id);
                }
                last_error = Some(err);
            }
        }
    }

    last_error
        .unwrap_or_else(|| RelayError::NoChannel {
            group: group.clone(),
            model: payload.model().to_string(),
        })
        .into_response_with_request_id(&request_id)
}

/// Picks a channel, folding GPTs model names onto their wildcard entry.
fn select_channel(
    state: &AppState,
    group: &str,
    model: &str,
    tried: &HashSet<String>,
) -> Option<Arc<Channel>> {
    state.channel_pool.select(group, model, tried).or_else(|| {
        let billing = crate::pricing::billing_model_name(model);
        if billing == model {
            return None;
        }
        state.channel_pool.select(group, &billing, tried)
    })
}

async fn read_payload(mode: RelayMode, path: &str, request: Request) -> RelayResult<RelayPayload> {
    if matches!(
        mode,
        RelayMode::AudioTranscription | RelayMode::AudioTranslation
    ) {
        return audio::read_transcription(request).await;
    }
    let raw = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| RelayError::validation("read_request_body_failed", e.to_string()))?;
    match mode.modality() {
        Modality::Text => {
            let request = text::parse_text_request(mode, path, &raw)?;
            Ok(RelayPayload::Text { request, raw })
        }
        Modality::Image => {
            let request = image::parse_image_request(&raw)?;
            Ok(RelayPayload::Image { request, raw })
        }
        Modality::Audio => {
            let request = audio::parse_speech_request(&raw)?;
            Ok(RelayPayload::Speech { request, raw })
        }
    }
}

/// Sends the request body through the channel's adaptor and hands a 2xx
/// response to it. Non-2xx responses come back as [`RelayError::Upstream`].
pub(crate) async fn forward(
    state: &AppState,
    ctx: &mut RelayContext,
    adaptor: &crate::adaptor::RelayAdaptor,
    body: crate::upstream::UpstreamBody,
) -> RelayResult<reqwest::Response> {
    use crate::adaptor::Adaptor;
    let response = adaptor.dispatch(ctx, &state.http, body).await?;
    if !response.status().is_success() {
        return Err(crate::upstream::into_upstream_error(response).await);
    }
    ctx.detect_stream(response.headers());
    Ok(response)
}

/// Gives a reservation back after a failed attempt.
pub(crate) async fn refund(state: &AppState, ctx: &RelayContext, reservation: &Reservation) {
    if let Err(err) = state.ledger.refund(&ctx.payer, reservation.reserved).await {
        tracing::error!(
            request_id = %ctx.request_id,
            user_id = %ctx.payer.user_id,
            reserved = reservation.reserved,
            "failed to return pre-consumed quota: {err}"
        );
    }
}

/// Bills a finished request. The client response is already decided.
pub(crate) async fn settle(
    state: &AppState,
    ctx: &RelayContext,
    pricing: &Pricing,
    reservation: Reservation,
    usage: Usage,
    sensitive_words: &[String],
) {
    let log_consume = state.settings.load().log_consume_enabled;
    let req = SettleRequest {
        payer: &ctx.payer,
        channel_id: &ctx.channel.id,
        model: &ctx.upstream_model,
        pricing,
        usage,
        reservation,
        sensitive_words,
        use_time_seconds: ctx.use_time_seconds(),
        is_stream: ctx.is_stream,
        log_consume,
    };
    let settlement = state.ledger.settle(req).await;
    tracing::debug!(
        request_id = %ctx.request_id,
        quota = settlement.quota,
        quota_delta = settlement.quota_delta,
        "billed request"
    );
}

/// Turns a handled response into the client response, billing it either
/// now (buffered) or when the stream ends.
pub(crate) async fn complete(
    state: &AppState,
    ctx: RelayContext,
    pricing: Pricing,
    reservation: Reservation,
    handled: Handled,
) -> RelayResult<Response> {
    match handled {
        Handled::Buffered {
            response,
            usage,
            sensitive_words,
        } => {
            settle(state, &ctx, &pricing, reservation, usage, &sensitive_words).await;
            match response {
                Some(response) => Ok(response),
                None => Err(RelayError::SensitiveContent {
                    words: sensitive_words,
                }),
            }
        }
        Handled::Streaming { response, outcome } => {
            let state = state.clone();
            let tasks = state.tasks.clone();
            tasks.spawn(async move {
                match outcome.await {
                    Ok(outcome) => {
                        settle(
                            &state,
                            &ctx,
                            &pricing,
                            reservation,
                            outcome.usage,
                            &outcome.sensitive_words,
                        )
                        .await;
                    }
                    Err(_) => {
                        tracing::warn!(
                            request_id = %ctx.request_id,
                            "stream ended without an outcome, returning reservation"
                        );
                        state.ledger.spawn_refund(&ctx.payer, reservation.reserved);
                    }
                }
            });
            Ok(response)
        }
    }
}
