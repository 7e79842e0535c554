use serde::{Deserialize, Serialize};

/// Kind of upstream account a channel points at.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    OpenAi,
    Azure,
    Custom,
    OpenRouter,
    Moonshot,
    Ai360,
    DeepSeek,
    Anthropic,
    /// Stored type this build does not recognize.
    Unknown,
}

impl ChannelType {
    pub fn parse(s: &str) -> Self {
        match s {
            "openai" => Self::OpenAi,
            "azure" => Self::Azure,
            "custom" => Self::Custom,
            "open_router" => Self::OpenRouter,
            "moonshot" => Self::Moonshot,
            "ai360" => Self::Ai360,
            "deep_seek" => Self::DeepSeek,
            "anthropic" => Self::Anthropic,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Azure => "azure",
            Self::Custom => "custom",
            Self::OpenRouter => "open_router",
            Self::Moonshot => "moonshot",
            Self::Ai360 => "ai360",
            Self::DeepSeek => "deep_seek",
            Self::Anthropic => "anthropic",
            Self::Unknown => "unknown",
        }
    }

    /// Wire protocol family, `None` when no adaptor handles this type.
    pub fn api_type(&self) -> Option<ApiType> {
        match self {
            Self::OpenAi
            | Self::Azure
            | Self::Custom
            | Self::OpenRouter
            | Self::Moonshot
            | Self::Ai360
            | Self::DeepSeek => Some(ApiType::OpenAi),
            Self::Anthropic => Some(ApiType::Anthropic),
            Self::Unknown => None,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi | Self::Custom | Self::Unknown => "https://api.openai.com",
            Self::Azure => "",
            Self::OpenRouter => "https://openrouter.ai/api",
            Self::Moonshot => "https://api.moonshot.cn",
            Self::Ai360 => "https://ai.360.cn",
            Self::DeepSeek => "https://api.deepseek.com",
            Self::Anthropic => "https://api.anthropic.com",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiType {
    OpenAi,
    Anthropic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Text,
    Image,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    Edits,
    ImagesGenerations,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
}

impl RelayMode {
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or(path);
        if path.starts_with("/v1/engines/") && path.ends_with("/embeddings") {
            return Some(Self::Embeddings);
        }
        match path {
            "/v1/chat/completions" => Some(Self::ChatCompletions),
            "/v1/completions" => Some(Self::Completions),
            "/v1/embeddings" => Some(Self::Embeddings),
            "/v1/moderations" => Some(Self::Moderations),
            "/v1/edits" => Some(Self::Edits),
            "/v1/images/generations" => Some(Self::ImagesGenerations),
            "/v1/audio/speech" => Some(Self::AudioSpeech),
            "/v1/audio/transcriptions" => Some(Self::AudioTranscription),
            "/v1/audio/translations" => Some(Self::AudioTranslation),
            _ => None,
        }
    }

    pub fn modality(&self) -> Modality {
        match self {
            Self::ImagesGenerations => Modality::Image,
            Self::AudioSpeech | Self::AudioTranscription | Self::AudioTranslation => {
                Modality::Audio
            }
            _ => Modality::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat_completions",
            Self::Completions => "completions",
            Self::Embeddings => "embeddings",
            Self::Moderations => "moderations",
            Self::Edits => "edits",
            Self::ImagesGenerations => "images_generations",
            Self::AudioSpeech => "audio_speech",
            Self::AudioTranscription => "audio_transcription",
            Self::AudioTranslation => "audio_translation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_mode_from_path() {
        assert_eq!(
            RelayMode::from_path("/v1/chat/completions?retry=2"),
            Some(RelayMode::ChatCompletions)
        );
        assert_eq!(
            RelayMode::from_path("/v1/engines/text-embedding-ada-002/embeddings"),
            Some(RelayMode::Embeddings)
        );
        assert_eq!(
            RelayMode::from_path("/v1/audio/translations"),
            Some(RelayMode::AudioTranslation)
        );
        assert_eq!(RelayMode::from_path("/v1/files"), None);
    }

    #[test]
    fn channel_type_round_trips_through_storage_names() {
        for ty in [
            ChannelType::OpenAi,
            ChannelType::Azure,
            ChannelType::Moonshot,
            ChannelType::Anthropic,
        ] {
            assert_eq!(ChannelType::parse(ty.as_str()), ty);
        }
        assert_eq!(ChannelType::parse("palm"), ChannelType::Unknown);
        assert_eq!(ChannelType::Unknown.api_type(), None);
        assert_eq!(ChannelType::Azure.api_type(), Some(ApiType::OpenAi));
    }
}
