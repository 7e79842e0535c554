use crate::relay::dto::Usage;
use crate::settings::RelaySettings;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Ratio for models missing from every table.
pub const UNKNOWN_MODEL_RATIO: f64 = 30.0;

const GIZMO_PREFIX: &str = "gpt-4-gizmo";

/// Built-in ratios; ratio 1 is $0.002 per 1K tokens.
static DEFAULT_MODEL_RATIO: LazyLock<HashMap<&'static str, f64>> = LazyLock::new(|| {
    HashMap::from([
        ("gpt-4", 15.0),
        ("gpt-4-0613", 15.0),
        ("gpt-4-32k", 30.0),
        ("gpt-4-32k-0613", 30.0),
        ("gpt-4-turbo", 5.0),
        ("gpt-4-1106-preview", 5.0),
        ("gpt-4-0125-preview", 5.0),
        ("gpt-4-vision-preview", 5.0),
        ("gpt-4o", 2.5),
        ("gpt-4o-mini", 0.075),
        ("gpt-3.5-turbo", 0.25),
        ("gpt-3.5-turbo-0613", 0.75),
        ("gpt-3.5-turbo-16k", 1.5),
        ("gpt-3.5-turbo-1106", 0.5),
        ("gpt-3.5-turbo-0125", 0.25),
        ("gpt-3.5-turbo-instruct", 0.75),
        ("text-davinci-003", 10.0),
        ("text-davinci-edit-001", 10.0),
        ("text-embedding-ada-002", 0.05),
        ("text-embedding-3-small", 0.01),
        ("text-embedding-3-large", 0.065),
        ("text-moderation-latest", 0.1),
        ("text-moderation-stable", 0.1),
        ("dall-e-2", 8.0),
        ("dall-e-3", 20.0),
        ("whisper-1", 15.0),
        ("tts-1", 7.5),
        ("tts-1-hd", 15.0),
        ("claude-instant-1", 0.4),
        ("claude-2.1", 4.0),
        ("claude-3-haiku-20240307", 0.125),
        ("claude-3-sonnet-20240229", 1.5),
        ("claude-3-opus-20240229", 7.5),
        ("claude-3-5-sonnet-20240620", 1.5),
        ("moonshot-v1-8k", 0.6),
        ("moonshot-v1-32k", 1.2),
        ("moonshot-v1-128k", 3.0),
        ("360GPT_S2_V9", 0.8571),
        ("deepseek-chat", 0.07),
        ("deepseek-coder", 0.07),
    ])
});

static DEFAULT_MODEL_PRICE: LazyLock<HashMap<&'static str, f64>> =
    LazyLock::new(|| HashMap::from([("gpt-4-gizmo-*", 0.1), ("mj_imagine", 0.1)]));

static DEFAULT_GROUP_RATIO: LazyLock<HashMap<&'static str, f64>> =
    LazyLock::new(|| HashMap::from([("default", 1.0), ("vip", 1.0), ("svip", 1.0)]));

/// Built-in completion ratio by model family, before overrides.
fn builtin_completion_ratio(model: &str) -> f64 {
    if model.starts_with("gpt-3.5") {
        if model == "gpt-3.5-turbo" || model.ends_with("0125") {
            return 3.0;
        }
        if model.ends_with("1106") {
            return 2.0;
        }
        return 4.0 / 3.0;
    }
    if model.starts_with("gpt-4o") {
        return 4.0;
    }
    if model.starts_with("gpt-4") {
        if model.starts_with("gpt-4-turbo") || model.ends_with("preview") {
            return 3.0;
        }
        return 2.0;
    }
    if model.starts_with("claude-instant-1") || model.starts_with("claude-2") {
        return 3.0;
    }
    if model.starts_with("claude-3") {
        return 5.0;
    }
    if model.starts_with("deepseek") {
        return 2.0;
    }
    1.0
}

/// Name used for price lookup and consume logs.
pub fn billing_model_name(model: &str) -> String {
    if model.starts_with(GIZMO_PREFIX) {
        format!("{GIZMO_PREFIX}-*")
    } else {
        model.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PricingMode {
    Ratio {
        model_ratio: f64,
        completion_ratio: f64,
    },
    Fixed {
        price: f64,
    },
}

/// Resolved price of one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub mode: PricingMode,
    pub group_ratio: f64,
    pub quota_per_unit: f64,
}

impl Pricing {
    pub fn resolve(settings: &RelaySettings, model: &str, group: &str) -> Self {
        let group_ratio = group_ratio(settings, group);
        let mode = match model_price(settings, model) {
            Some(price) => PricingMode::Fixed { price },
            None => PricingMode::Ratio {
                model_ratio: model_ratio(settings, model),
                completion_ratio: completion_ratio(settings, model),
            },
        };
        Self {
            mode,
            group_ratio,
            quota_per_unit: settings.quota_per_unit,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.mode, PricingMode::Fixed { .. })
    }

    /// Amount to reserve given an estimate of tokens the request will use.
    pub fn reservation(&self, estimated_tokens: i64) -> i64 {
        match self.mode {
            PricingMode::Fixed { price } => self.fixed_quota(price),
            PricingMode::Ratio { model_ratio, .. } => {
                (estimated_tokens as f64 * model_ratio * self.group_ratio) as i64
            }
        }
    }

    /// Final charge for reported usage, ignoring the zero-usage rule which
    /// belongs to settlement.
    pub fn charge(&self, usage: &Usage) -> i64 {
        match self.mode {
            PricingMode::Fixed { price } => self.fixed_quota(price),
            PricingMode::Ratio {
                model_ratio,
                completion_ratio,
            } => {
                let ratio = model_ratio * self.group_ratio;
                let weighted =
                    usage.prompt_tokens as f64 + usage.completion_tokens as f64 * completion_ratio;
                let quota = (weighted * ratio).round() as i64;
                if ratio != 0.0 && quota <= 0 { 1 } else { quota }
            }
        }
    }

    /// Human-readable explanation stored on the consume log.
    pub fn describe(&self) -> String {
        match self.mode {
            PricingMode::Fixed { price } => format!(
                "model price {:.2}, group ratio {:.2}",
                price, self.group_ratio
            ),
            PricingMode::Ratio {
                model_ratio,
                completion_ratio,
            } => format!(
                "model ratio {:.2}, completion ratio {:.2}, group ratio {:.2}",
                model_ratio, completion_ratio, self.group_ratio
            ),
        }
    }

    fn fixed_quota(&self, price: f64) -> i64 {
        (price * self.quota_per_unit * self.group_ratio) as i64
    }
}

pub fn model_ratio(settings: &RelaySettings, model: &str) -> f64 {
    let model = billing_model_name(model);
    if let Some(ratio) = settings.model_ratio.get(&model) {
        return *ratio;
    }
    match DEFAULT_MODEL_RATIO.get(model.as_str()) {
        Some(ratio) => *ratio,
        None => {
            tracing::warn!(model = %model, "model ratio not found, using default");
            UNKNOWN_MODEL_RATIO
        }
    }
}

pub fn model_price(settings: &RelaySettings, model: &str) -> Option<f64> {
    let model = billing_model_name(model);
    settings
        .model_price
        .get(&model)
        .copied()
        .or_else(|| DEFAULT_MODEL_PRICE.get(model.as_str()).copied())
}

pub fn completion_ratio(settings: &RelaySettings, model: &str) -> f64 {
    settings
        .completion_ratio
        .get(model)
        .copied()
        .unwrap_or_else(|| builtin_completion_ratio(model))
}

pub fn group_ratio(settings: &RelaySettings, group: &str) -> f64 {
    settings
        .group_ratio
        .get(group)
        .copied()
        .or_else(|| DEFAULT_GROUP_RATIO.get(group).copied())
        .unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(prompt: i64, completion: i64) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    #[test]
    fn ratio_pricing_weights_completion() {
        let settings = RelaySettings::default();
        let pricing = Pricing::resolve(&settings, "gpt-4", "default");
        assert_eq!(
            pricing.mode,
            PricingMode::Ratio {
                model_ratio: 15.0,
                completion_ratio: 2.0
            }
        );
        assert_eq!(pricing.charge(&usage(10, 5)), 300);
        assert_eq!(pricing.reservation(100), 1500);
    }

    #[test]
    fn tiny_charges_round_up_to_one() {
        let mut settings = RelaySettings::default();
        settings.model_ratio.insert("cheap".into(), 0.001);
        settings.completion_ratio.insert("cheap".into(), 1.0);
        let pricing = Pricing::resolve(&settings, "cheap", "default");
        assert_eq!(pricing.charge(&usage(1, 0)), 1);
    }

    #[test]
    fn zero_ratio_charges_nothing() {
        let mut settings = RelaySettings::default();
        settings.model_ratio.insert("free".into(), 0.0);
        let pricing = Pricing::resolve(&settings, "free", "default");
        assert_eq!(pricing.charge(&usage(100, 100)), 0);
    }

    #[test]
    fn fixed_price_ignores_tokens() {
        let mut settings = RelaySettings::default();
        settings.group_ratio.insert("vip".into(), 2.0);
        let pricing = Pricing::resolve(&settings, "gpt-4-gizmo-g-abc", "vip");
        assert!(pricing.is_fixed());
        assert_eq!(pricing.reservation(0), 100_000);
        assert_eq!(pricing.charge(&usage(1, 1)), 100_000);
        assert_eq!(pricing.charge(&usage(5000, 5000)), 100_000);
    }

    #[test]
    fn unknown_models_fall_back() {
        let settings = RelaySettings::default();
        assert_eq!(model_ratio(&settings, "mystery-model"), UNKNOWN_MODEL_RATIO);
        assert_eq!(group_ratio(&settings, "nonexistent"), 1.0);
    }

    #[test]
    fn overrides_take_precedence() {
        let mut settings = RelaySettings::default();
        settings.model_ratio.insert("gpt-4".into(), 1.0);
        assert_eq!(model_ratio(&settings, "gpt-4"), 1.0);
    }

    #[test]
    fn builtin_tables_back_empty_settings() {
        let settings = RelaySettings::default();
        assert_eq!(model_ratio(&settings, "whisper-1"), 15.0);
        assert_eq!(model_price(&settings, "mj_imagine"), Some(0.1));
        assert_eq!(model_price(&settings, "gpt-4"), None);
        assert_eq!(group_ratio(&settings, "svip"), 1.0);
    }
}
