use serde_json::Value;
use tiktoken_rs::CoreBPE;
use tiktoken_rs::tokenizer::{Tokenizer, get_tokenizer};

/// Flat estimate for an image part of a chat message.
const IMAGE_PART_TOKENS: i64 = 85;

/// Loads the encoders outside the request path.
pub fn preload() {
    let _ = tiktoken_rs::cl100k_base_singleton();
    let _ = tiktoken_rs::o200k_base_singleton();
}

fn encoder_for(model: &str) -> &'static CoreBPE {
    match get_tokenizer(model) {
        Some(Tokenizer::O200kBase) => tiktoken_rs::o200k_base_singleton(),
        _ => tiktoken_rs::cl100k_base_singleton(),
    }
}

pub fn count_text_tokens(model: &str, text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    encoder_for(model).encode_with_special_tokens(text).len() as i64
}

/// Counts a chat message list the way chat models bill it: a fixed overhead
/// per message and per name, plus three tokens priming the reply.
pub fn count_message_tokens(model: &str, messages: &[Value]) -> i64 {
    let (per_message, per_name) = if model == "gpt-3.5-turbo-0301" {
        (4, -1)
    } else {
        (3, 1)
    };
    let mut total = 0i64;
    for message in messages {
        total += per_message;
        if let Some(role) = message.get("role").and_then(|v| v.as_str()) {
            total += count_text_tokens(model, role);
        }
        if let Some(name) = message.get("name").and_then(|v| v.as_str()) {
            total += per_name + count_text_tokens(model, name);
        }
        match message.get("content") {
            Some(Value::String(text)) => total += count_text_tokens(model, text),
            Some(Value::Array(parts)) => {
                for part in parts {
                    match part.get("type").and_then(|v| v.as_str()) {
                        Some("text") => {
                            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                                total += count_text_tokens(model, text);
                            }
                        }
                        Some("image_url") => total += IMAGE_PART_TOKENS,
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    total + 3
}

/// Counts a `prompt`/`input` field that is either a string or a list of
/// strings.
pub fn count_input_tokens(model: &str, input: &Value) -> i64 {
    match input {
        Value::String(text) => count_text_tokens(model, text),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(|text| count_text_tokens(model, text))
            .sum(),
        _ => 0,
    }
}

/// Plain text of a `prompt`/`input` field, used for content checks.
pub fn input_text(input: &Value) -> String {
    match input {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Plain text of every message's content, used for content checks.
pub fn messages_text(messages: &[Value]) -> String {
    let mut out = Vec::new();
    for message in messages {
        match message.get("content") {
            Some(Value::String(text)) => out.push(text.as_str()),
            Some(Value::Array(parts)) => out.extend(
                parts
                    .iter()
                    .filter(|p| p.get("type").and_then(|v| v.as_str()) == Some("text"))
                    .filter_map(|p| p.get("text").and_then(|v| v.as_str())),
            ),
            _ => {}
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_text_has_no_tokens() {
        assert_eq!(count_text_tokens("gpt-3.5-turbo", ""), 0);
    }

    #[test]
    fn text_tokens_are_counted() {
        assert!(count_text_tokens("gpt-4", "Hello, world!") > 0);
        assert!(count_text_tokens("unknown-model", "Hello there") > 0);
    }

    #[test]
    fn message_overhead_is_applied() {
        let messages = vec![json!({"role": "user", "content": ""})];
        let role = count_text_tokens("gpt-4", "user");
        assert_eq!(count_message_tokens("gpt-4", &messages), 3 + role + 3);
    }

    #[test]
    fn array_input_sums_items() {
        let single = count_input_tokens("gpt-3.5-turbo", &json!("alpha beta"));
        let double = count_input_tokens("gpt-3.5-turbo", &json!(["alpha beta", "alpha beta"]));
        assert_eq!(double, single * 2);
    }

    #[test]
    fn message_text_joins_text_parts() {
        let messages = vec![
            json!({"role": "system", "content": "be nice"}),
            json!({"role": "user", "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": {"url": "http://x"}}
            ]}),
        ];
        assert_eq!(messages_text(&messages), "be nice\nlook");
    }
}
