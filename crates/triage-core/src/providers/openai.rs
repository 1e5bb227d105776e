//! OpenAI adapter (chat completions, with SSE streaming)

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::error::ProviderError;
use super::types::{
    ChatMessage, ChunkSink, CompletionOptions, CompletionResult, LlmProvider, ProviderKind,
    TokenUsage,
};
use super::{DEFAULT_MAX_TOKENS, read_error, retry_after};

/// OpenAI provider
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(client: Client, api_key: String, model: String, base_url: String) -> Self {
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }

    /// OpenAI accepts the message array as-is
    fn to_openai_messages(messages: &[ChatMessage]) -> Vec<OpenAiMessage> {
        messages
            .iter()
            .map(|m| OpenAiMessage {
                role: m.role.to_string(),
                content: m.content.clone(),
            })
            .collect()
    }

    fn from_openai_response(
        &self,
        resp: OpenAiApiResponse,
        raw: Value,
    ) -> Result<CompletionResult, ProviderError> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Decode {
                provider: ProviderKind::OpenAi,
                message: "response had no choices".to_string(),
            })?;

        Ok(CompletionResult {
            content: choice.message.content.unwrap_or_default(),
            usage: resp.usage.map(|u| u.into()),
            model: resp.model.unwrap_or_else(|| self.model.clone()),
            provider: ProviderKind::OpenAi,
            raw,
        })
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(ProviderKind::OpenAi, e))?;

        if !response.status().is_success() {
            let retry = retry_after(&response);
            let (status, text) = read_error(response).await;
            return Err(ProviderError::from_status(
                ProviderKind::OpenAi,
                status,
                &text,
                retry,
            ));
        }
        Ok(response)
    }
}

/// One parsed server-sent-events line
#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta(String),
    Usage(TokenUsage),
    Done,
}

fn sse_data(line: &str) -> Option<&str> {
    line.trim().strip_prefix("data:").map(str::trim)
}

/// Parse a single `data:` line of an OpenAI stream; other lines are ignored
fn parse_sse_line(line: &str) -> Vec<SseEvent> {
    let Some(data) = sse_data(line) else {
        return Vec::new();
    };
    if data == "[DONE]" {
        return vec![SseEvent::Done];
    }
    let Ok(chunk) = serde_json::from_str::<OpenAiStreamChunk>(data) else {
        return Vec::new();
    };

    let mut events = Vec::new();
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            events.push(SseEvent::Delta(text));
        }
    }
    if let Some(usage) = chunk.usage {
        events.push(SseEvent::Usage(usage.into()));
    }
    events
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": Self::to_openai_messages(messages),
            "max_tokens": options.max_tokens_or(DEFAULT_MAX_TOKENS),
        });
        if let Some(t) = options.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = options.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        if !options.stop.is_empty() {
            body["stop"] = serde_json::json!(options.stop);
        }
        body
    }

    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResult, ProviderError> {
        let body = self.build_request(messages, options);
        debug!(
            "OpenAI request: model={}, messages={}",
            self.model,
            messages.len()
        );

        let raw: Value = self
            .post(&body)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::from_transport(ProviderKind::OpenAi, e))?;
        let parsed: OpenAiApiResponse =
            serde_json::from_value(raw.clone()).map_err(|e| ProviderError::Decode {
                provider: ProviderKind::OpenAi,
                message: e.to_string(),
            })?;

        self.from_openai_response(parsed, raw)
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn stream_chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        sink: ChunkSink<'_>,
    ) -> Result<CompletionResult, ProviderError> {
        let mut body = self.build_request(messages, options);
        body["stream"] = Value::Bool(true);
        body["stream_options"] = serde_json::json!({"include_usage": true});

        debug!("OpenAI streaming request: model={}", self.model);

        let response = self.post(&body).await?;
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut content = String::new();
        let mut usage = None;
        let mut chunks: Vec<Value> = Vec::new();

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ProviderError::from_transport(ProviderKind::OpenAi, e))?;
            buffer.extend_from_slice(&chunk);

            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);
                if let Some(payload) = sse_data(&line).and_then(|d| serde_json::from_str::<Value>(d).ok()) {
                    chunks.push(payload);
                }
                for event in parse_sse_line(&line) {
                    match event {
                        SseEvent::Delta(text) => {
                            sink(&text);
                            content.push_str(&text);
                        }
                        SseEvent::Usage(u) => usage = Some(u),
                        SseEvent::Done => break 'outer,
                    }
                }
            }
        }

        Ok(CompletionResult {
            content,
            usage,
            model: self.model.clone(),
            provider: ProviderKind::OpenAi,
            raw: serde_json::json!({ "stream": true, "chunks": chunks }),
        })
    }
}

// ── OpenAI wire types ──

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: Option<u32>,
}

impl From<OpenAiUsage> for TokenUsage {
    fn from(u: OpenAiUsage) -> Self {
        TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u
                .total_tokens
                .unwrap_or(u.prompt_tokens + u.completion_tokens),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}
