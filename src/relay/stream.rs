//! Event-stream relay. A producer task reads the upstream body line by line,
//! filters and rewrites each frame, and hands it to the response body over a
//! small bounded channel. When the producer finishes it reports what was
//! streamed so the request can be billed.

use crate::adaptor::claude::ClaudeStreamState;
use crate::config::RelayMode;
use crate::relay::dto::Usage;
use crate::relay::{Handled, RelayContext, SensitivePolicy};
use crate::tokenizer;
use axum::body::Body;
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::convert::Infallible;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

/// Frames buffered between the producer and the client writer.
pub const HANDOFF_CAPACITY: usize = 5;
const DONE_FRAME: &str = "data: [DONE]";

/// What the producer saw, reported once the stream has ended.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub text: String,
    pub usage: Usage,
    pub sensitive_words: Vec<String>,
    pub stopped_on_sensitive: bool,
    pub client_gone: bool,
}

/// Per-family line translation.
pub enum StreamDialect {
    OpenAi,
    Claude(ClaudeStreamState),
}

impl StreamDialect {
    fn translate(&mut self, line: &str) -> Option<String> {
        match self {
            Self::OpenAi => Some(line.to_string()),
            Self::Claude(state) => state.translate(line),
        }
    }

    fn reported_usage(&self) -> Option<Usage> {
        match self {
            Self::OpenAi => None,
            Self::Claude(state) => state.usage(),
        }
    }
}

/// Inputs the producer needs besides the byte stream.
pub struct StreamSettings {
    pub mode: RelayMode,
    pub model: String,
    pub prompt_tokens: i64,
    pub policy: SensitivePolicy,
    pub dialect: StreamDialect,
    /// Longest gap between upstream chunks before the stream is abandoned.
    pub idle_timeout: Duration,
}

pub fn relay_stream(
    upstream: reqwest::Response,
    ctx: &RelayContext,
    policy: &SensitivePolicy,
    dialect: StreamDialect,
) -> Handled {
    let settings = StreamSettings {
        mode: ctx.relay_mode,
        model: ctx.upstream_model.clone(),
        prompt_tokens: ctx.prompt_tokens,
        policy: policy.clone(),
        dialect,
        idle_timeout: ctx.timeout,
    };
    let (response, outcome) = relay_byte_stream(upstream.bytes_stream(), settings);
    Handled::Streaming { response, outcome }
}

/// Starts the producer over `body` and returns the client response plus a
/// receiver that resolves when the producer is done.
pub fn relay_byte_stream<S, E>(
    body: S,
    settings: StreamSettings,
) -> (Response, oneshot::Receiver<StreamOutcome>)
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<String>(HANDOFF_CAPACITY);
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let outcome = pump_upstream(body, tx, settings).await;
        let _ = done_tx.send(outcome);
    });
    (event_stream_response(rx), done_rx)
}

async fn pump_upstream<S, E>(
    body: S,
    tx: mpsc::Sender<String>,
    settings: StreamSettings,
) -> StreamOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let StreamSettings {
        mode,
        model,
        prompt_tokens,
        policy,
        dialect,
        idle_timeout,
    } = settings;
    let mut pump = LinePump {
        policy,
        dialect,
        items: Vec::new(),
        sensitive_words: Vec::new(),
        stopped_on_sensitive: false,
        client_gone: false,
    };

    {
        let mut body = std::pin::pin!(body);
        let mut splitter = LineSplitter::default();
        'read: loop {
            let next = tokio::select! {
                _ = tx.closed() => None,
                next = tokio::time::timeout(idle_timeout, body.next()) => Some(next),
            };
            let Some(next) = next else {
                pump.client_gone = true;
                break;
            };
            let Ok(next) = next else {
                tracing::warn!(
                    model = %model,
                    idle_secs = idle_timeout.as_secs(),
                    "upstream stream went idle, closing it"
                );
                break;
            };
            match next {
                Some(Ok(chunk)) => {
                    for line in splitter.push(&chunk) {
                        if pump.accept(&tx, &line).await.is_break() {
                            break 'read;
                        }
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(model = %model, "upstream stream read failed: {err}");
                    break;
                }
                None => {
                    if let Some(line) = splitter.finish() {
                        let _ = pump.accept(&tx, &line).await;
                    }
                    break;
                }
            }
        }
    }
    drop(tx);

    if pump.client_gone {
        tracing::info!(model = %model, "client disconnected, stream relay stopped");
    }
    pump.finish(mode, &model, prompt_tokens)
}

struct LinePump {
    policy: SensitivePolicy,
    dialect: StreamDialect,
    items: Vec<String>,
    sensitive_words: Vec<String>,
    stopped_on_sensitive: bool,
    client_gone: bool,
}

impl LinePump {
    async fn accept(&mut self, tx: &mpsc::Sender<String>, raw: &str) -> ControlFlow<()> {
        if raw.len() < 6 || !(raw.starts_with("data: ") || raw.starts_with("[DONE]")) {
            return ControlFlow::Continue(());
        }
        let Some(mut line) = self.dialect.translate(raw) else {
            return ControlFlow::Continue(());
        };

        let mut hit = false;
        if self.policy.check_completion {
            let redaction = self.policy.filter.redact(&line);
            if redaction.matched {
                hit = true;
                for word in redaction.words {
                    if !self.sensitive_words.contains(&word) {
                        self.sensitive_words.push(word);
                    }
                }
                line = redaction.text;
            }
        }
        let line = line.replace(r#""role":null"#, r#""role":"assistant""#);

        if let Some(payload) = line.strip_prefix("data: ") {
            if !payload.starts_with("[DONE]") {
                self.items.push(payload.to_string());
            }
        }
        if tx.send(line).await.is_err() {
            self.client_gone = true;
            return ControlFlow::Break(());
        }
        if hit && self.policy.stop_on_sensitive {
            let _ = tx.send(DONE_FRAME.to_string()).await;
            self.stopped_on_sensitive = true;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn finish(self, mode: RelayMode, model: &str, prompt_tokens: i64) -> StreamOutcome {
        let text = aggregate_text(mode, &self.items);
        let usage = match self.dialect.reported_usage() {
            Some(reported) if reported.prompt_tokens > 0 => reported,
            Some(reported) => Usage::new(prompt_tokens, reported.completion_tokens),
            None => Usage::new(prompt_tokens, tokenizer::count_text_tokens(model, &text)),
        };
        StreamOutcome {
            text,
            usage,
            sensitive_words: self.sensitive_words,
            stopped_on_sensitive: self.stopped_on_sensitive,
            client_gone: self.client_gone,
        }
    }
}

/// Concatenates the generated text carried by the relayed chunks.
pub fn aggregate_text(mode: RelayMode, items: &[String]) -> String {
    let mut text = String::new();
    for item in items {
        let Ok(chunk) = serde_json::from_str::<Value>(item) else {
            tracing::debug!("skipping unparsable stream chunk");
            continue;
        };
        let Some(choices) = chunk.get("choices").and_then(Value::as_array) else {
            continue;
        };
        for choice in choices {
            let piece = match mode {
                RelayMode::ChatCompletions => choice
                    .get("delta")
                    .and_then(|d| d.get("content"))
                    .and_then(Value::as_str),
                RelayMode::Completions => choice.get("text").and_then(Value::as_str),
                _ => None,
            };
            if let Some(piece) = piece {
                text.push_str(piece);
            }
        }
    }
    text
}

fn event_stream_response(rx: mpsc::Receiver<String>) -> Response {
    let frames = ReceiverStream::new(rx).map(|line| {
        let line = if line.starts_with(DONE_FRAME) {
            DONE_FRAME
        } else {
            line.as_str()
        };
        Ok::<_, Infallible>(Bytes::from(format!("{line}\n\n")))
    });
    let mut response = Body::from_stream(frames).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// Splits a byte stream on `\n`, dropping a trailing `\r`. A final line with
/// no terminator is returned by [`LineSplitter::finish`].
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            let line = &self.pending[start..end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.strip_suffix(b"\r").unwrap_or(&rest);
        Some(String::from_utf8_lossy(rest).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensitive::SensitiveFilter;
    use std::sync::Arc;
    use std::time::Duration;

    fn settings(mode: RelayMode, policy: SensitivePolicy) -> StreamSettings {
        StreamSettings {
            mode,
            model: "gpt-3.5-turbo".into(),
            prompt_tokens: 7,
            policy,
            dialect: StreamDialect::OpenAi,
            idle_timeout: Duration::from_secs(5),
        }
    }

    fn lenient() -> SensitivePolicy {
        SensitivePolicy {
            filter: Arc::new(SensitiveFilter::new(Vec::<String>::new())),
            check_completion: false,
            stop_on_sensitive: false,
        }
    }

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        let owned: Vec<Result<Bytes, Infallible>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        futures_util::stream::iter(owned)
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn relays_frames_and_aggregates_text() {
        let upstream = chunks(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\nda",
            "ta: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\r\n\n",
            ": keep-alive\n",
            "data: [DONE]\n",
        ]);
        let (response, outcome) = relay_byte_stream(upstream, settings(RelayMode::ChatCompletions, lenient()));
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        let body = body_text(response).await;
        assert_eq!(
            body,
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n\
             data: [DONE]\n\n"
        );
        let outcome = outcome.await.unwrap();
        assert_eq!(outcome.text, "Hi there");
        assert_eq!(outcome.usage.prompt_tokens, 7);
        assert!(outcome.usage.completion_tokens > 0);
        assert!(!outcome.client_gone);
    }

    #[tokio::test]
    async fn trailing_line_without_newline_is_kept() {
        let upstream = chunks(&["data: {\"choices\":[{\"text\":\"ok\"}]}"]);
        let (response, outcome) = relay_byte_stream(upstream, settings(RelayMode::Completions, lenient()));
        let body = body_text(response).await;
        assert_eq!(body, "data: {\"choices\":[{\"text\":\"ok\"}]}\n\n");
        assert_eq!(outcome.await.unwrap().text, "ok");
    }

    #[tokio::test]
    async fn null_role_becomes_assistant() {
        let upstream = chunks(&["data: {\"choices\":[{\"delta\":{\"role\":null,\"content\":\"x\"}}]}\n"]);
        let (response, _outcome) = relay_byte_stream(upstream, settings(RelayMode::ChatCompletions, lenient()));
        let body = body_text(response).await;
        assert!(body.contains(r#""role":"assistant""#));
    }

    #[tokio::test]
    async fn sensitive_frame_is_redacted_and_stream_stops() {
        let policy = SensitivePolicy {
            filter: Arc::new(SensitiveFilter::new(["secret"])),
            check_completion: true,
            stop_on_sensitive: true,
        };
        let upstream = chunks(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"a secret\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"more\"}}]}\n",
            "data: [DONE]\n",
        ]);
        let (response, outcome) = relay_byte_stream(upstream, settings(RelayMode::ChatCompletions, policy));
        let body = body_text(response).await;
        assert_eq!(
            body,
            "data: {\"choices\":[{\"delta\":{\"content\":\"a *###*\"}}]}\n\ndata: [DONE]\n\n"
        );
        let outcome = outcome.await.unwrap();
        assert!(outcome.stopped_on_sensitive);
        assert_eq!(outcome.sensitive_words, vec!["secret".to_string()]);
        assert_eq!(outcome.text, "a *###*");
    }

    #[tokio::test]
    async fn dropped_client_stops_the_producer() {
        let head = chunks(&["data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n"]);
        let upstream = head.chain(futures_util::stream::pending());
        let (response, outcome) = relay_byte_stream(upstream, settings(RelayMode::ChatCompletions, lenient()));
        drop(response);
        let outcome = tokio::time::timeout(Duration::from_secs(5), outcome)
            .await
            .expect("producer should stop")
            .unwrap();
        assert!(outcome.client_gone);
    }

    #[tokio::test]
    async fn stalled_upstream_is_closed_after_idle_limit() {
        let head = chunks(&["data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n"]);
        let upstream = head.chain(futures_util::stream::pending());
        let mut settings = settings(RelayMode::ChatCompletions, lenient());
        settings.idle_timeout = Duration::from_millis(50);
        let (response, outcome) = relay_byte_stream(upstream, settings);
        let body = tokio::time::timeout(Duration::from_secs(5), body_text(response))
            .await
            .expect("stream should end");
        assert!(body.contains("\"content\":\"x\""));
        let outcome = outcome.await.unwrap();
        assert!(!outcome.client_gone);
        assert_eq!(outcome.text, "x");
    }

    #[tokio::test]
    async fn slow_but_steady_stream_is_not_cut() {
        let frames = ["a", "b", "c", "d"].map(|piece| {
            Ok::<_, Infallible>(Bytes::from(format!(
                "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{piece}\"}}}}]}}\n"
            )))
        });
        let upstream = futures_util::stream::iter(frames).then(|frame| async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            frame
        });
        let mut settings = settings(RelayMode::ChatCompletions, lenient());
        // Total duration exceeds the limit; each gap stays under it.
        settings.idle_timeout = Duration::from_millis(80);
        let (response, outcome) = relay_byte_stream(upstream, settings);
        let _ = body_text(response).await;
        assert_eq!(outcome.await.unwrap().text, "abcd");
    }

    #[test]
    fn splitter_handles_split_crlf() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"data: a\r").is_empty());
        assert_eq!(splitter.push(b"\ndata: b\n"), vec!["data: a", "data: b"]);
        assert_eq!(splitter.finish(), None);
    }
}
