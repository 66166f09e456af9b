use std::collections::VecDeque;
use std::time::Duration;

use futures::{Stream, StreamExt, stream};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::gateway::{
    LlmGateway, LlmGatewayError, LlmGatewayRequest, LlmStreamFuture, LlmTokenStream,
};
use crate::config::ModelSettings;

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone)]
pub struct ChatCompletionsGatewayConfig {
    pub chat_completions_url: String,
    pub api_key: Option<String>,
    pub model_id: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_backoff_ms: u64,
}

impl From<&ModelSettings> for ChatCompletionsGatewayConfig {
    fn from(settings: &ModelSettings) -> Self {
        Self {
            chat_completions_url: settings.chat_completions_url.clone(),
            api_key: settings.api_key.clone(),
            model_id: settings.model_id().to_string(),
            timeout_ms: settings.timeout_ms,
            max_retries: settings.max_retries,
            retry_base_backoff_ms: settings.retry_base_backoff_ms,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChatCompletionsConfigError {
    #[error("failed to build chat completions http client: {0}")]
    HttpClient(String),
}

/// Streaming client for an OpenAI-compatible `/chat/completions` endpoint.
///
/// Retries with exponential backoff apply only until the provider accepts the
/// request; once deltas start flowing a failure ends the stream. The timeout
/// bounds connecting, waiting for the response head, and every gap between
/// body chunks, never the total length of an answer.
#[derive(Clone)]
pub struct ChatCompletionsGateway {
    client: reqwest::Client,
    config: ChatCompletionsGatewayConfig,
}

impl ChatCompletionsGateway {
    pub fn new(config: ChatCompletionsGatewayConfig) -> Result<Self, ChatCompletionsConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| ChatCompletionsConfigError::HttpClient(err.to_string()))?;

        Ok(Self { client, config })
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    async fn open_stream(
        &self,
        request: &LlmGatewayRequest,
    ) -> Result<reqwest::Response, LlmGatewayError> {
        let mut attempt = 0_u32;

        loop {
            let outcome = match timeout(self.request_timeout(), self.send_once(request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(SendAttemptError::retryable(LlmGatewayError::Timeout)),
            };
            match outcome {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if err.retryable && attempt < self.config.max_retries {
                        let backoff_multiplier = 2_u64.saturating_pow(attempt);
                        let backoff_ms = self
                            .config
                            .retry_base_backoff_ms
                            .saturating_mul(backoff_multiplier);
                        debug!(
                            attempt,
                            backoff_ms,
                            error = %err.error,
                            "retrying chat completions request"
                        );
                        sleep(Duration::from_millis(backoff_ms)).await;
                        attempt = attempt.saturating_add(1);
                        continue;
                    }

                    return Err(err.error);
                }
            }
        }
    }

    async fn send_once(
        &self,
        request: &LlmGatewayRequest,
    ) -> Result<reqwest::Response, SendAttemptError> {
        let request_body = json!({
            "model": self.config.model_id,
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt }
            ],
            "stream": true
        });

        let mut http_request = self
            .client
            .post(&self.config.chat_completions_url)
            .json(&request_body);
        if let Some(api_key) = self.config.api_key.as_deref() {
            http_request = http_request.bearer_auth(api_key);
        }

        let response = http_request
            .send()
            .await
            .map_err(|err| SendAttemptError::retryable(transport_error(&err)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let provider_code = parse_provider_error_code(&body);
        Err(SendAttemptError {
            error: LlmGatewayError::ProviderFailure(format!(
                "status={} code={provider_code}",
                status.as_u16()
            )),
            retryable: is_retryable_status(status),
        })
    }
}

impl LlmGateway for ChatCompletionsGateway {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn stream<'a>(&'a self, request: LlmGatewayRequest) -> LlmStreamFuture<'a> {
        Box::pin(async move {
            let response = self.open_stream(&request).await?;
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|err| transport_error(&err)));
            Ok(delta_stream(body, self.request_timeout()))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Done,
}

/// Incremental decoder for `data:` lines of a server-sent event stream.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<SseEvent>, LlmGatewayError> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(newline_index) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=newline_index).collect::<Vec<_>>();
            let line = std::str::from_utf8(&line).map_err(|_| {
                LlmGatewayError::InvalidProviderPayload("stream_not_utf8".to_string())
            })?;

            if let Some(event) = parse_sse_line(line.trim_end_matches(['\r', '\n']))? {
                let is_done = event == SseEvent::Done;
                events.push(event);
                if is_done {
                    self.buffer.clear();
                    break;
                }
            }
        }

        Ok(events)
    }
}

fn parse_sse_line(line: &str) -> Result<Option<SseEvent>, LlmGatewayError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    if data == DONE_SENTINEL {
        return Ok(Some(SseEvent::Done));
    }

    let chunk: StreamChunk = serde_json::from_str(data).map_err(|_| {
        LlmGatewayError::InvalidProviderPayload("stream_chunk_parse_failed".to_string())
    })?;

    if let Some(error) = chunk.error {
        return Err(LlmGatewayError::ProviderFailure(format!(
            "stream_error code={}",
            provider_code_label(error.code)
        )));
    }

    let content = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .filter(|content| !content.is_empty());

    Ok(content.map(SseEvent::Delta))
}

struct DeltaStreamState<S> {
    body: std::pin::Pin<Box<S>>,
    idle_timeout: Duration,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    finished: bool,
}

/// Decodes deltas from a response body. Fails with `Timeout` when no chunk
/// arrives within `idle_timeout`.
pub(crate) fn delta_stream<S, B>(body: S, idle_timeout: Duration) -> LlmTokenStream
where
    S: Stream<Item = Result<B, LlmGatewayError>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = DeltaStreamState {
        body: Box::pin(body),
        idle_timeout,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(delta) = state.pending.pop_front() {
                return Some((Ok(delta), state));
            }
            if state.finished {
                return None;
            }

            let next_chunk = match timeout(state.idle_timeout, state.body.next()).await {
                Ok(next_chunk) => next_chunk,
                Err(_) => {
                    warn!(
                        idle_ms = state.idle_timeout.as_millis() as u64,
                        "chat completions stream stalled"
                    );
                    state.finished = true;
                    state.pending.clear();
                    return Some((Err(LlmGatewayError::Timeout), state));
                }
            };

            match next_chunk {
                Some(Ok(bytes)) => match state.decoder.push(bytes.as_ref()) {
                    Ok(events) => {
                        for event in events {
                            match event {
                                SseEvent::Delta(delta) => state.pending.push_back(delta),
                                SseEvent::Done => state.finished = true,
                            }
                        }
                    }
                    Err(err) => {
                        state.finished = true;
                        state.pending.clear();
                        return Some((Err(err), state));
                    }
                },
                Some(Err(err)) => {
                    state.finished = true;
                    state.pending.clear();
                    return Some((Err(err), state));
                }
                None => {
                    warn!("chat completions stream closed before completion signal");
                    state.finished = true;
                    state.pending.clear();
                    return Some((
                        Err(LlmGatewayError::ProviderFailure(
                            "stream_ended_without_done".to_string(),
                        )),
                        state,
                    ));
                }
            }
        }
    }))
}

#[derive(Debug)]
struct SendAttemptError {
    error: LlmGatewayError,
    retryable: bool,
}

impl SendAttemptError {
    fn retryable(error: LlmGatewayError) -> Self {
        Self {
            error,
            retryable: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ProviderErrorDetails>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorDetails {
    #[serde(default)]
    code: Option<Value>,
}

fn transport_error(err: &reqwest::Error) -> LlmGatewayError {
    if err.is_timeout() {
        LlmGatewayError::Timeout
    } else {
        LlmGatewayError::ProviderFailure("request_unavailable".to_string())
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn parse_provider_error_code(body: &str) -> String {
    #[derive(Deserialize)]
    struct ProviderErrorEnvelope {
        error: Option<ProviderErrorDetails>,
    }

    let code = serde_json::from_str::<ProviderErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.error)
        .and_then(|details| details.code);
    provider_code_label(code)
}

fn provider_code_label(code: Option<Value>) -> String {
    match code {
        Some(Value::String(code)) => code,
        Some(Value::Number(code)) => code.to_string(),
        _ => "unknown".to_string(),
    }
}
