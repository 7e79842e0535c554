//! Channel health: classifies failed attempts, takes impaired channels out of
//! rotation and runs the periodic channel test.

use crate::adaptor::{Adaptor, RelayAdaptor};
use crate::channels::{Channel, ChannelPool, ChannelStatus, ChannelStore};
use crate::config::RelayMode;
use crate::error::{RelayError, RelayResult};
use crate::ledger::Payer;
use crate::relay::RelayContext;
use crate::relay::dto::{GeneralOpenAiRequest, OpenAiError, parse_error_body};
use crate::settings::RelaySettings;
use crate::upstream::{self, UpstreamBody};
use arc_swap::ArcSwap;
use axum::http::StatusCode;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TEST_MODEL: &str = "gpt-3.5-turbo";
const TEST_TIMEOUT: Duration = Duration::from_secs(30);
const SYSTEM_PAYER: &str = "_relaygate_channel_test";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The channel itself is unusable until someone fixes it.
    ChannelImpairing,
    Transient,
}

pub fn classify_failure(status: StatusCode, error: Option<&OpenAiError>) -> FailureClass {
    if status == StatusCode::UNAUTHORIZED {
        return FailureClass::ChannelImpairing;
    }
    let Some(error) = error else {
        return FailureClass::Transient;
    };
    let impaired_type = matches!(
        error.error_type.as_str(),
        "insufficient_quota" | "authentication_error" | "permission_error" | "forbidden"
    );
    let impaired_code = matches!(
        error.code_str(),
        Some("invalid_api_key" | "account_deactivated" | "model_not_found")
    );
    let impaired_message = error.message.starts_with("Your credit balance is too low")
        || error.message.starts_with("This organization has been disabled.");
    if impaired_type || impaired_code || impaired_message {
        FailureClass::ChannelImpairing
    } else {
        FailureClass::Transient
    }
}

/// Human-readable cause of a failed attempt: the provider's own error
/// message when the body carries one.
pub fn failure_reason(err: &RelayError) -> String {
    match err {
        RelayError::Upstream { body, .. } => match parse_error_body(body) {
            Some(error) if !error.message.is_empty() => error.message,
            _ => err.to_string(),
        },
        _ => err.to_string(),
    }
}

/// Classifies a relay error. Only upstream answers can impair a channel;
/// local failures never do.
pub fn classify_relay_error(err: &RelayError) -> FailureClass {
    match err {
        RelayError::Upstream { status, body, .. } => {
            classify_failure(*status, parse_error_body(body).as_ref())
        }
        _ => FailureClass::Transient,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelTestReport {
    pub channel_id: String,
    pub channel_name: String,
    pub elapsed: Duration,
    pub error: Option<String>,
    pub status: ChannelStatus,
}

#[derive(Clone)]
pub struct ChannelHealth {
    store: ChannelStore,
    pool: Arc<ChannelPool>,
    settings: Arc<ArcSwap<RelaySettings>>,
}

impl ChannelHealth {
    pub fn new(
        store: ChannelStore,
        pool: Arc<ChannelPool>,
        settings: Arc<ArcSwap<RelaySettings>>,
    ) -> Self {
        Self {
            store,
            pool,
            settings,
        }
    }

    fn can_disable(&self, channel: &Channel) -> bool {
        channel.auto_ban && self.settings.load().automatic_disable_channel_enabled
    }

    /// Reacts to a failed relay attempt on `channel`.
    pub async fn observe(&self, channel: &Channel, err: &RelayError) {
        if classify_relay_error(err) != FailureClass::ChannelImpairing {
            return;
        }
        if !self.can_disable(channel) {
            tracing::debug!(
                channel_id = %channel.id,
                channel_name = %channel.name,
                "channel failure would disable it but automatic disabling is off"
            );
            return;
        }
        self.disable(channel, &failure_reason(err)).await;
    }

    pub async fn disable(&self, channel: &Channel, reason: &str) {
        self.pool.remove(&channel.id);
        if let Err(err) = self
            .store
            .update_status(&channel.id, ChannelStatus::AutoDisabled)
            .await
        {
            tracing::error!(channel_id = %channel.id, "failed to disable channel: {err}");
            return;
        }
        metrics::counter!("channel_disabled_total").increment(1);
        tracing::warn!(
            channel_id = %channel.id,
            channel_name = %channel.name,
            reason,
            "channel has been disabled"
        );
    }

    pub async fn enable(&self, channel: &Channel) {
        if let Err(err) = self
            .store
            .update_status(&channel.id, ChannelStatus::Enabled)
            .await
        {
            tracing::error!(channel_id = %channel.id, "failed to enable channel: {err}");
            return;
        }
        if let Err(err) = self.pool.refresh(&self.store).await {
            tracing::error!("failed to refresh channel pool: {err}");
        }
        tracing::info!(
            channel_id = %channel.id,
            channel_name = %channel.name,
            "channel has been enabled"
        );
    }

    /// Sends a one-token chat completion through the channel's adaptor.
    pub async fn test_channel(
        &self,
        http: &reqwest::Client,
        channel: Arc<Channel>,
    ) -> (Duration, RelayResult<()>) {
        let started = Instant::now();
        let result = send_test_request(http, channel).await;
        (started.elapsed(), result)
    }

    /// Tests every channel that is not manually disabled, disabling impaired
    /// ones and re-enabling automatically disabled ones that pass.
    pub async fn test_all(&self, http: &reqwest::Client) -> Result<Vec<ChannelTestReport>, String> {
        let channels = self.store.list_channels().await?;
        let mut reports = Vec::with_capacity(channels.len());
        for channel in channels {
            if channel.status == ChannelStatus::ManuallyDisabled {
                continue;
            }
            let channel = Arc::new(channel);
            let (elapsed, result) = self.test_channel(http, channel.clone()).await;
            if let Err(err) = self
                .store
                .record_test(&channel.id, elapsed.as_millis() as i64)
                .await
            {
                tracing::warn!(channel_id = %channel.id, "failed to record channel test: {err}");
            }

            let settings = self.settings.load_full();
            let too_slow = elapsed.as_secs_f64() > settings.channel_disable_threshold_seconds;
            let mut status = channel.status;
            let error = match &result {
                Ok(()) if too_slow => Some(format!(
                    "response time {:.2}s exceeds threshold {:.2}s",
                    elapsed.as_secs_f64(),
                    settings.channel_disable_threshold_seconds
                )),
                Ok(()) => None,
                Err(err) => Some(err.to_string()),
            };
            let impaired = match &result {
                Ok(()) => too_slow,
                Err(err) => classify_relay_error(err) == FailureClass::ChannelImpairing,
            };

            if status == ChannelStatus::Enabled && impaired && self.can_disable(&channel) {
                self.disable(&channel, error.as_deref().unwrap_or_default())
                    .await;
                status = ChannelStatus::AutoDisabled;
            } else if status == ChannelStatus::AutoDisabled
                && error.is_none()
                && settings.automatic_enable_channel_enabled
            {
                self.enable(&channel).await;
                status = ChannelStatus::Enabled;
            }

            tracing::debug!(
                channel_id = %channel.id,
                channel_name = %channel.name,
                elapsed_ms = elapsed.as_millis() as u64,
                success = error.is_none(),
                "channel test result"
            );
            reports.push(ChannelTestReport {
                channel_id: channel.id.clone(),
                channel_name: channel.name.clone(),
                elapsed,
                error,
                status,
            });
        }
        Ok(reports)
    }
}

fn test_model(channel: &Channel) -> String {
    channel
        .models
        .iter()
        .find(|m| !m.is_empty() && m.as_str() != "*")
        .cloned()
        .unwrap_or_else(|| TEST_MODEL.to_string())
}

async fn send_test_request(http: &reqwest::Client, channel: Arc<Channel>) -> RelayResult<()> {
    let model = test_model(&channel);
    let payer = Payer {
        user_id: SYSTEM_PAYER.to_string(),
        token_id: SYSTEM_PAYER.to_string(),
        token_name: SYSTEM_PAYER.to_string(),
        token_remain_quota: 0,
        token_unlimited: true,
    };
    let group = channel.groups.first().cloned().unwrap_or_default();
    let mut ctx = RelayContext::new(
        &uuid::Uuid::new_v4().to_string(),
        payer,
        &group,
        channel,
        RelayMode::ChatCompletions,
        "/v1/chat/completions",
        &model,
        false,
        TEST_TIMEOUT,
    );
    ctx.apply_model_mapping();

    let adaptor = RelayAdaptor::for_context(&ctx)?;
    let request = GeneralOpenAiRequest {
        model: ctx.upstream_model.clone(),
        messages: Some(vec![json!({"role": "user", "content": "hi"})]),
        max_tokens: Some(1),
        ..Default::default()
    };
    let value = adaptor.convert_request(ctx.relay_mode, &request)?;
    let body = serde_json::to_vec(&value)
        .map_err(|e| RelayError::internal("marshal_text_request_failed", e))?;
    let response = adaptor
        .dispatch(&ctx, http, UpstreamBody::json(body))
        .await?;
    if !response.status().is_success() {
        return Err(upstream::into_upstream_error(response).await);
    }
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| RelayError::internal("read_response_body_failed", e))?;
    if parse_error_body(&bytes).is_some() {
        return Err(RelayError::Upstream {
            status,
            headers,
            body: bytes,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use bytes::Bytes;

    fn error(error_type: &str, code: Option<&str>, message: &str) -> OpenAiError {
        OpenAiError {
            message: message.into(),
            error_type: error_type.into(),
            param: None,
            code: code.map(|c| json!(c)),
        }
    }

    #[test]
    fn unauthorized_always_impairs() {
        assert_eq!(
            classify_failure(StatusCode::UNAUTHORIZED, None),
            FailureClass::ChannelImpairing
        );
    }

    #[test]
    fn account_problems_impair() {
        let cases = [
            error("insufficient_quota", None, "quota"),
            error("permission_error", None, "nope"),
            error("invalid_request_error", Some("invalid_api_key"), "bad key"),
            error("invalid_request_error", Some("model_not_found"), "no model"),
            error("", None, "Your credit balance is too low to access the API"),
            error("", None, "This organization has been disabled."),
        ];
        for case in cases {
            assert_eq!(
                classify_failure(StatusCode::BAD_REQUEST, Some(&case)),
                FailureClass::ChannelImpairing,
                "{case:?}"
            );
        }
    }

    #[test]
    fn overload_is_transient() {
        let err = error("server_error", None, "The server is overloaded");
        assert_eq!(
            classify_failure(StatusCode::SERVICE_UNAVAILABLE, Some(&err)),
            FailureClass::Transient
        );
        assert_eq!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, None),
            FailureClass::Transient
        );
    }

    #[test]
    fn relay_errors_are_classified_from_the_body() {
        let err = RelayError::Upstream {
            status: StatusCode::FORBIDDEN,
            headers: HeaderMap::new(),
            body: Bytes::from_static(
                br#"{"error":{"message":"deactivated","type":"invalid_request_error","code":"account_deactivated"}}"#,
            ),
        };
        assert_eq!(classify_relay_error(&err), FailureClass::ChannelImpairing);
        assert_eq!(
            classify_relay_error(&RelayError::InsufficientQuota),
            FailureClass::Transient
        );
    }

    #[test]
    fn disable_reason_is_the_provider_message() {
        let err = RelayError::Upstream {
            status: StatusCode::UNAUTHORIZED,
            headers: HeaderMap::new(),
            body: Bytes::from_static(
                br#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error","code":"invalid_api_key"}}"#,
            ),
        };
        assert_eq!(failure_reason(&err), "Incorrect API key provided");

        let opaque = RelayError::Upstream {
            status: StatusCode::UNAUTHORIZED,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"<html>denied</html>"),
        };
        assert!(failure_reason(&opaque).starts_with("upstream returned status 401"));
    }
}
