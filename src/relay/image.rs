use super::dto::{ImageRequest, Usage};
use super::{Handled, RelayContext};
use crate::adaptor::RelayAdaptor;
use crate::app::AppState;
use crate::error::{RelayError, RelayResult};
use crate::pricing::{self, Pricing, PricingMode};
use crate::settings::RelaySettings;
use crate::tokenizer;
use crate::upstream::UpstreamBody;
use axum::response::Response;
use bytes::Bytes;

const DEFAULT_IMAGE_MODEL: &str = "dall-e-2";
const DEFAULT_IMAGE_SIZE: &str = "1024x1024";
/// USD per image at ratio 1 when no fixed price is configured.
const RATIO_IMAGE_UNIT_PRICE: f64 = 0.0025;

pub fn parse_image_request(raw: &[u8]) -> RelayResult<ImageRequest> {
    let mut request: ImageRequest = serde_json::from_slice(raw)
        .map_err(|e| RelayError::validation("invalid_image_request", e.to_string()))?;
    if request.model.is_empty() {
        request.model = DEFAULT_IMAGE_MODEL.to_string();
    }
    if request.size.as_deref().unwrap_or_default().is_empty() {
        request.size = Some(DEFAULT_IMAGE_SIZE.to_string());
    }
    if request.n.unwrap_or(0) == 0 {
        request.n = Some(1);
    }
    validate_image_request(&request)?;
    Ok(request)
}

pub fn validate_image_request(request: &ImageRequest) -> RelayResult<()> {
    let invalid = |message: &str| Err(RelayError::validation("invalid_image_request", message));
    if request.prompt.is_empty() {
        return invalid("prompt is required");
    }
    let size = request.size.as_deref().unwrap_or(DEFAULT_IMAGE_SIZE);
    if size_ratio(&request.model, size).is_none() {
        return invalid("size not supported for this image model");
    }
    let n = request.n.unwrap_or(1);
    match request.model.as_str() {
        "dall-e-3" if n != 1 => invalid("n must be 1 for dall-e-3"),
        "dall-e-2" if !(1..=10).contains(&n) => invalid("n must be between 1 and 10"),
        _ if n < 1 => invalid("n must be at least 1"),
        _ => Ok(()),
    }
}

/// Price multiplier for an output size. `None` for sizes the model does not
/// produce. Models without a size table accept any size at ratio 1.
pub fn size_ratio(model: &str, size: &str) -> Option<f64> {
    match model {
        "dall-e-2" => match size {
            "256x256" => Some(1.0),
            "512x512" => Some(1.125),
            "1024x1024" => Some(1.25),
            _ => None,
        },
        "dall-e-3" => match size {
            "1024x1024" => Some(1.0),
            "1024x1792" | "1792x1024" => Some(2.0),
            _ => None,
        },
        _ => Some(1.0),
    }
}

pub fn quality_ratio(model: &str, size: &str, quality: Option<&str>) -> f64 {
    if model == "dall-e-3" && quality == Some("hd") {
        if size == "1024x1024" { 2.0 } else { 1.5 }
    } else {
        1.0
    }
}

/// Fixed price of the whole request in USD before the group ratio.
pub fn image_price(settings: &RelaySettings, request: &ImageRequest, model: &str) -> f64 {
    let unit = pricing::model_price(settings, model)
        .unwrap_or_else(|| RATIO_IMAGE_UNIT_PRICE * pricing::model_ratio(settings, model));
    let size = request.size.as_deref().unwrap_or(DEFAULT_IMAGE_SIZE);
    let n = request.n.unwrap_or(1).max(1) as f64;
    unit * size_ratio(model, size).unwrap_or(1.0)
        * quality_ratio(model, size, request.quality.as_deref())
        * n
}

pub async fn relay_image(
    state: &AppState,
    mut ctx: RelayContext,
    request: &ImageRequest,
    raw: &Bytes,
) -> RelayResult<Response> {
    let settings = state.settings.load_full();
    let mapped = ctx.apply_model_mapping();
    let model = ctx.upstream_model.clone();

    if settings.check_prompt() {
        let (hit, words) = state.sensitive.load().contains(&request.prompt);
        if hit {
            return Err(RelayError::SensitiveContent { words });
        }
    }
    ctx.prompt_tokens = tokenizer::count_text_tokens(&model, &request.prompt);

    let pricing = Pricing {
        mode: PricingMode::Fixed {
            price: image_price(&settings, request, &model),
        },
        group_ratio: pricing::group_ratio(&settings, &ctx.group),
        quota_per_unit: settings.quota_per_unit,
    };
    let reservation = state
        .ledger
        .reserve(&ctx.payer, pricing.reservation(0))
        .await?;

    let result = async {
        let adaptor = RelayAdaptor::for_context(&ctx)?;
        let body = if mapped {
            let mut converted = request.clone();
            converted.model = model.clone();
            let encoded = serde_json::to_vec(&converted)
                .map_err(|e| RelayError::internal("marshal_image_request_failed", e))?;
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
