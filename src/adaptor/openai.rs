use super::Adaptor;
use crate::config::{ChannelType, RelayMode};
use crate::error::RelayResult;
use crate::relay::dto::GeneralOpenAiRequest;
use crate::relay::response::{self, BufferedDialect};
use crate::relay::stream::{self, StreamDialect};
use crate::relay::{Handled, RelayContext, SensitivePolicy};
use crate::upstream::join_url;
use async_trait::async_trait;
use serde_json::Value;

pub const CHANNEL_NAME: &str = "openai";
pub const DEFAULT_AZURE_API_VERSION: &str = "2023-05-15";

pub const MODEL_LIST: &[&str] = &[
    "gpt-3.5-turbo",
    "gpt-3.5-turbo-0613",
    "gpt-3.5-turbo-1106",
    "gpt-3.5-turbo-0125",
    "gpt-3.5-turbo-16k",
    "gpt-3.5-turbo-instruct",
    "gpt-4",
    "gpt-4-0613",
    "gpt-4-32k",
    "gpt-4-32k-0613",
    "gpt-4-1106-preview",
    "gpt-4-0125-preview",
    "gpt-4-turbo-preview",
    "gpt-4-vision-preview",
    "text-embedding-ada-002",
    "text-embedding-3-small",
    "text-embedding-3-large",
    "text-moderation-latest",
    "text-moderation-stable",
    "text-davinci-edit-001",
    "davinci-002",
    "babbage-002",
    "dall-e-2",
    "dall-e-3",
    "whisper-1",
    "tts-1",
    "tts-1-1106",
    "tts-1-hd",
    "tts-1-hd-1106",
];

pub const AI360_MODEL_LIST: &[&str] = &[
    "360GPT_S2_V9",
    "embedding-bert-512-v1",
    "embedding_s1_v1",
    "semantic_similarity_s1_v1",
];

pub const MOONSHOT_MODEL_LIST: &[&str] = &["moonshot-v1-8k", "moonshot-v1-32k", "moonshot-v1-128k"];

/// OpenAI and every channel type that speaks its wire format.
#[derive(Debug, Clone, Copy)]
pub struct OpenAiAdaptor {
    channel_type: ChannelType,
}

impl Default for OpenAiAdaptor {
    fn default() -> Self {
        Self {
            channel_type: ChannelType::OpenAi,
        }
    }
}

impl OpenAiAdaptor {
    pub fn new(channel_type: ChannelType) -> Self {
        Self { channel_type }
    }
}

/// Azure deployment names cannot contain dots or the dated snapshot suffixes.
pub fn azure_deployment_name(model: &str) -> String {
    let name = model.replace('.', "");
    let name = name.strip_suffix("-0301").unwrap_or(&name);
    let name = name.strip_suffix("-0314").unwrap_or(name);
    let name = name.strip_suffix("-0613").unwrap_or(name);
    name.to_string()
}

pub fn azure_request_url(base: &str, request_path: &str, model: &str, api_version: &str) -> String {
    let path = request_path.split('?').next().unwrap_or(request_path);
    let task = path.strip_prefix("/v1/").unwrap_or(path);
    let deployment = azure_deployment_name(model);
    format!(
        "{}/openai/deployments/{}/{}?api-version={}",
        base.trim_end_matches('/'),
        deployment,
        task,
        api_version
    )
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn init(&mut self, ctx: &RelayContext) {
        self.channel_type = ctx.channel.channel_type;
    }

    fn request_url(&self, ctx: &RelayContext) -> RelayResult<String> {
        let base = ctx.channel.base_url_or_default();
        if self.channel_type == ChannelType::Azure {
            let api_version = ctx
                .channel
                .api_version
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(DEFAULT_AZURE_API_VERSION);
            return Ok(azure_request_url(
                base,
                &ctx.request_path,
                &ctx.upstream_model,
                api_version,
            ));
        }
        let path = ctx
            .request_path
            .split('?')
            .next()
            .unwrap_or(&ctx.request_path);
        Ok(join_url(base, path))
    }

    fn setup_headers(
        &self,
        ctx: &RelayContext,
        builder: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        let channel = &ctx.channel;
        if self.channel_type == ChannelType::Azure {
            return builder.header("api-key", &channel.api_key);
        }
        let mut builder = builder.bearer_auth(&channel.api_key);
        if self.channel_type == ChannelType::OpenAi {
            if let Some(org) = channel.organization.as_deref().filter(|o| !o.is_empty()) {
                builder = builder.header("OpenAI-Organization", org);
            }
        }
        builder
    }

    fn convert_request(
        &self,
        _mode: RelayMode,
        request: &GeneralOpenAiRequest,
    ) -> RelayResult<Value> {
        serde_json::to_value(request)
            .map_err(|e| crate::error::RelayError::internal("convert_request_failed", e))
    }

    async fn handle_response(
        &self,
        ctx: &RelayContext,
        policy: &SensitivePolicy,
        response: reqwest::Response,
    ) -> RelayResult<Handled> {
        if ctx.is_stream {
            return Ok(stream::relay_stream(response, ctx, policy, StreamDialect::OpenAi));
        }
        response::relay_buffered(response, ctx, policy, BufferedDialect::OpenAi).await
    }

    fn model_list(&self) -> &'static [&'static str] {
        match self.channel_type {
            ChannelType::Ai360 => AI360_MODEL_LIST,
            ChannelType::Moonshot => MOONSHOT_MODEL_LIST,
            _ => MODEL_LIST,
        }
    }

    fn channel_name(&self) -> &'static str {
        CHANNEL_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn azure_url_strips_dots_and_snapshot_suffix() {
        assert_eq!(
            azure_request_url(
                "https://res.openai.azure.com/",
                "/v1/chat/completions",
                "gpt-4-32k-0613",
                "2024-02-01"
            ),
            "https://res.openai.azure.com/openai/deployments/gpt-4-32k/chat/completions?api-version=2024-02-01"
        );
        assert_eq!(azure_deployment_name("gpt-3.5-turbo-0301"), "gpt-35-turbo");
    }

    #[test]
    fn azure_url_drops_client_query() {
        let url = azure_request_url(
            "https://res.openai.azure.com",
            "/v1/embeddings?foo=bar",
            "text-embedding-ada-002",
            "2023-05-15",
        );
        assert_eq!(
            url,
            "https://res.openai.azure.com/openai/deployments/text-embedding-ada-002/embeddings?api-version=2023-05-15"
        );
    }

    #[test]
    fn model_list_follows_channel_type() {
        assert_eq!(
            OpenAiAdaptor::new(ChannelType::Moonshot).model_list(),
            MOONSHOT_MODEL_LIST
        );
        assert!(OpenAiAdaptor::default().model_list().contains(&"gpt-4"));
    }
}
