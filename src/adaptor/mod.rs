//! Provider adaptors. Each protocol family knows how to address, authenticate
//! and translate for its upstream; the relay pipelines only talk to
//! [`RelayAdaptor`].

pub mod claude;
pub mod openai;

use crate::config::{ApiType, RelayMode};
use crate::error::{RelayError, RelayResult};
use crate::relay::dto::GeneralOpenAiRequest;
use crate::relay::{Handled, RelayContext, SensitivePolicy};
use crate::upstream::{self, UpstreamBody};
use async_trait::async_trait;
use axum::http::header;
use serde_json::Value;

pub use claude::ClaudeAdaptor;
pub use openai::OpenAiAdaptor;

#[async_trait]
pub trait Adaptor: Send + Sync {
    /// Captures per-request details before any other call.
    fn init(&mut self, ctx: &RelayContext);

    fn request_url(&self, ctx: &RelayContext) -> RelayResult<String>;

    fn setup_headers(
        &self,
        ctx: &RelayContext,
        builder: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder;

    fn convert_request(
        &self,
        mode: RelayMode,
        request: &GeneralOpenAiRequest,
    ) -> RelayResult<Value>;

    async fn dispatch(
        &self,
        ctx: &RelayContext,
        http: &reqwest::Client,
        body: UpstreamBody,
    ) -> RelayResult<reqwest::Response> {
        let url = self.request_url(ctx)?;
        let mut builder = self.setup_headers(ctx, http.post(&url));
        if ctx.is_stream {
            builder = builder.header(header::ACCEPT, mime::TEXT_EVENT_STREAM.as_ref());
        }
        tracing::debug!(
            request_id = %ctx.request_id,
            channel_id = %ctx.channel.id,
            url = %url,
            stream = ctx.is_stream,
            "dispatching upstream request"
        );
        Ok(upstream::send(builder, body, ctx.timeout, ctx.is_stream).await?)
    }

    /// Consumes a 2xx upstream response and relays it to the client.
    async fn handle_response(
        &self,
        ctx: &RelayContext,
        policy: &SensitivePolicy,
        response: reqwest::Response,
    ) -> RelayResult<Handled>;

    fn model_list(&self) -> &'static [&'static str];

    fn channel_name(&self) -> &'static str;
}

/// The closed set of protocol families this relay speaks.
pub enum RelayAdaptor {
    OpenAi(OpenAiAdaptor),
    Claude(ClaudeAdaptor),
}

impl RelayAdaptor {
    pub fn for_api_type(api_type: Option<ApiType>) -> RelayResult<Self> {
        match api_type {
            Some(ApiType::OpenAi) => Ok(Self::OpenAi(OpenAiAdaptor::default())),
            Some(ApiType::Anthropic) => Ok(Self::Claude(ClaudeAdaptor::default())),
            None => Err(RelayError::InvalidApiType),
        }
    }

    /// Selects and initializes the adaptor for the channel in `ctx`.
    pub fn for_context(ctx: &RelayContext) -> RelayResult<Self> {
        let mut adaptor = Self::for_api_type(ctx.api_type)?;
        adaptor.init(ctx);
        Ok(adaptor)
    }

    fn inner(&self) -> &dyn Adaptor {
        match self {
            Self::OpenAi(a) => a,
            Self::Claude(a) => a,
        }
    }
}

#[async_trait]
impl Adaptor for RelayAdaptor {
    fn init(&mut self, ctx: &RelayContext) {
        match self {
            Self::OpenAi(a) => a.init(ctx),
            Self::Claude(a) => a.init(ctx),
        }
    }

    fn request_url(&self, ctx: &RelayContext) -> RelayResult<String> {
        self.inner().request_url(ctx)
    }

    fn setup_headers(
        &self,
        ctx: &RelayContext,
        builder: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        self.inner().setup_headers(ctx, builder)
    }

    fn convert_request(
        &self,
        mode: RelayMode,
        request: &GeneralOpenAiRequest,
    ) -> RelayResult<Value> {
        self.inner().convert_request(mode, request)
    }

    async fn dispatch(
        &self,
        ctx: &RelayContext,
        http: &reqwest::Client,
        body: UpstreamBody,
    ) -> RelayResult<reqwest::Response> {
        self.inner().dispatch(ctx, http, body).await
    }

    async fn handle_response(
        &self,
        ctx: &RelayContext,
        policy: &SensitivePolicy,
        response: reqwest::Response,
    ) -> RelayResult<Handled> {
        self.inner().handle_response(ctx, policy, response).await
    }

    fn model_list(&self) -> &'static [&'static str] {
        self.inner().model_list()
    }

    fn channel_name(&self) -> &'static str {
        self.inner().channel_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_api_type_is_rejected() {
        let err = RelayAdaptor::for_api_type(None).err().unwrap();
        assert_eq!(err.code(), "invalid_api_type");
        assert!(matches!(
            RelayAdaptor::for_api_type(Some(ApiType::Anthropic)),
            Ok(RelayAdaptor::Claude(_))
        ));
    }
}
