//! Streaming chat-completions client for LiteLLM-compatible gateways.
//!
//! Requests are sent with `stream: true` and the response body is read as
//! server-sent events. Each `data:` event carries one completion chunk; the
//! `delta.content` of every chunk becomes one fragment.

use std::env;
use std::time::Duration;

use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::engine::{FragmentStream, GenerationEngine, GenerationRequest};
use crate::error::EngineError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamingRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    /// Lets the gateway attribute usage per conversation.
    user: &'a str,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// One decoded server-sent event.
#[derive(Debug, PartialEq)]
enum StreamEvent {
    Delta(String),
    Done,
    Error(String),
}

/// Parses the payload of a `data:` line. Returns `None` for chunks that
/// carry no text (role announcements, usage blocks).
fn parse_event(data: &str) -> Result<Option<StreamEvent>, EngineError> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(Some(StreamEvent::Done));
    }

    if let Ok(err) = serde_json::from_str::<ApiErrorResponse>(data) {
        return Ok(Some(StreamEvent::Error(err.error.message)));
    }

    let chunk: StreamChunk =
        serde_json::from_str(data).map_err(|e| EngineError::Stream(e.to_string()))?;
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.content)
        .collect();

    if text.is_empty() {
        Ok(None)
    } else {
        Ok(Some(StreamEvent::Delta(text)))
    }
}

/// Splits a byte stream into lines, holding partial lines across chunks.
#[derive(Debug, Default)]
struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).trim_end().to_string())
    }
}

fn data_of(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

async fn error_from_response(response: reqwest::Response) -> EngineError {
    let status_code = response.status().as_u16();
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error response".to_string());

    match serde_json::from_str::<ApiErrorResponse>(&error_text) {
        Ok(parsed) if status_code == 429 => EngineError::RateLimited(parsed.error.message),
        Ok(parsed) => EngineError::ApiError {
            code: status_code,
            message: parsed.error.message,
        },
        Err(_) if status_code == 429 => EngineError::RateLimited(error_text),
        Err(_) => EngineError::ApiError {
            code: status_code,
            message: error_text,
        },
    }
}

fn completion_fragments(
    http_request: reqwest::RequestBuilder,
    request: GenerationRequest,
) -> impl Stream<Item = Result<String, EngineError>> + Send + 'static {
    async_stream::try_stream! {
        let body = StreamingRequest {
            model: request.model.upstream_model(),
            messages: vec![ChatMessage { role: "user", content: &request.message }],
            stream: true,
            user: &request.conversation_id,
        };

        let response = http_request
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::RequestFailed(e.to_string()))?;

        let response = if response.status().is_success() {
            response
        } else {
            Err::<reqwest::Response, EngineError>(error_from_response(response).await)?
        };

        let mut bytes = response.bytes_stream();
        let mut lines = SseLines::default();
        let mut done = false;

        'read: while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| EngineError::Stream(e.to_string()))?;
            for line in lines.push(&chunk) {
                let Some(data) = data_of(&line) else { continue };
                match parse_event(data)? {
                    Some(StreamEvent::Delta(text)) => yield text,
                    Some(StreamEvent::Error(message)) => {
                        Err::<(), EngineError>(EngineError::Failed(message))?;
                    }
                    Some(StreamEvent::Done) => {
                        done = true;
                        break 'read;
                    }
                    None => {}
                }
            }
        }

        if !done {
            if let Some(data) = lines.finish().as_deref().and_then(data_of) {
                if let Some(StreamEvent::Delta(text)) = parse_event(data)? {
                    yield text;
                }
            }
            debug!(conversation_id = %request.conversation_id, "Stream ended without [DONE]");
        }
    }
}

/// Engine backed by a LiteLLM (OpenAI-compatible) gateway.
#[derive(Debug, Clone)]
pub struct LiteLlmEngine {
    api_base: String,
    api_key: Option<String>,
    http_client: Client,
}

impl LiteLlmEngine {
    /// Creates an engine for `api_base` (e.g. `http://localhost:4000`).
    ///
    /// No overall request timeout is set because streams may legitimately
    /// run for minutes; the worker applies the job deadline.
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Result<Self, EngineError> {
        let http_client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            http_client,
        })
    }

    /// Reads `LITELLM_API_BASE` (required) and `LITELLM_API_KEY`.
    pub fn from_env() -> Result<Self, EngineError> {
        let api_base = env::var("LITELLM_API_BASE").map_err(|_| EngineError::MissingApiBase)?;
        Self::new(api_base, env::var("LITELLM_API_KEY").ok())
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }
}

impl GenerationEngine for LiteLlmEngine {
    fn name(&self) -> &str {
        "litellm"
    }

    fn generate(&self, request: GenerationRequest) -> FragmentStream {
        let url = format!("{}/chat/completions", self.api_base);
        let mut http_request = self
            .http_client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");
        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        completion_fragments(http_request, request).boxed()
    }
}
