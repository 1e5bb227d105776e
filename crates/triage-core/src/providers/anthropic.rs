//! Anthropic Claude adapter

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::error::ProviderError;
use super::types::{
    ChatMessage, ChatRole, CompletionOptions, CompletionResult, LlmProvider, ProviderKind,
    TokenUsage,
};
use super::{DEFAULT_MAX_TOKENS, read_error, retry_after};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Claude provider (messages API)
pub struct ClaudeProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl std::fmt::Debug for ClaudeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl ClaudeProvider {
    pub fn new(client: Client, api_key: String, model: String, base_url: String) -> Self {
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }

    /// Claude wants strictly alternating user/assistant turns, a leading user
    /// turn, and system text in a separate top-level field.
    fn ensure_alternating_roles(messages: &[ChatMessage]) -> (Option<String>, Vec<ClaudeMessage>) {
        let system_parts: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
            .collect();
        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };

        let mut turns: Vec<ClaudeMessage> = Vec::new();
        for msg in messages.iter().filter(|m| m.role != ChatRole::System) {
            let role = if msg.role == ChatRole::Assistant {
                "assistant"
            } else {
                "user"
            };
            match turns.last_mut() {
                Some(last) if last.role == role => {
                    last.content.push_str("\n\n");
                    last.content.push_str(&msg.content);
                }
                _ => turns.push(ClaudeMessage {
                    role: role.to_string(),
                    content: msg.content.clone(),
                }),
            }
        }

        if turns.first().is_some_and(|t| t.role != "user") {
            turns.insert(
                0,
                ClaudeMessage {
                    role: "user".to_string(),
                    content: "Hello".to_string(),
                },
            );
        }

        (system, turns)
    }

    fn from_claude_response(&self, resp: ClaudeApiResponse, raw: Value) -> CompletionResult {
        let content = resp
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        CompletionResult {
            content,
            usage: resp
                .usage
                .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
            model: resp.model.unwrap_or_else(|| self.model.clone()),
            provider: ProviderKind::Claude,
            raw,
        }
    }
}

#[async_trait]
impl LlmProvider for ClaudeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Value {
        let (system, turns) = Self::ensure_alternating_roles(messages);

        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": options.max_tokens_or(DEFAULT_MAX_TOKENS),
            "messages": turns,
        });
        if let Some(system) = system {
            body["system"] = Value::String(system);
        }
        if let Some(t) = options.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = options.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        if let Some(k) = options.top_k {
            body["top_k"] = serde_json::json!(k);
        }
        if !options.stop.is_empty() {
            body["stop_sequences"] = serde_json::json!(options.stop);
        }
        body
    }

    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResult, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request(messages, options);

        debug!(
            "Claude request: model={}, messages={}",
            self.model,
            messages.len()
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(ProviderKind::Claude, e))?;

        if !response.status().is_success() {
            let retry = retry_after(&response);
            let (status, text) = read_error(response).await;
            return Err(ProviderError::from_status(
                ProviderKind::Claude,
                status,
                &text,
                retry,
            ));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::from_transport(ProviderKind::Claude, e))?;
        let parsed: ClaudeApiResponse =
            serde_json::from_value(raw.clone()).map_err(|e| ProviderError::Decode {
                provider: ProviderKind::Claude,
                message: e.to_string(),
            })?;

        debug!(
            "Claude response: blocks={}, stop_reason={:?}",
            parsed.content.len(),
            parsed.stop_reason
        );

        Ok(self.from_claude_response(parsed, raw))
    }
}

// ── Claude wire types ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ClaudeMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ClaudeApiResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<ClaudeBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<ClaudeUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClaudeBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClaudeUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ClaudeProvider {
        ClaudeProvider::new(
            Client::new(),
            "sk-ant-secret".to_string(),
            "claude-3-5-sonnet-20241022".to_string(),
            "https://api.anthropic.com/".to_string(),
        )
    }

    #[test]
    fn test_system_moves_to_top_level() {
        let msgs = vec![
            ChatMessage::system("Be brief."),
            ChatMessage::user("hello"),
        ];
        let (system, turns) = ClaudeProvider::ensure_alternating_roles(&msgs);
        assert_eq!(system.as_deref(), Some("Be brief."));
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, "user");
    }

    #[test]
    fn test_consecutive_same_role_turns_merge() {
        let msgs = vec![
            ChatMessage::user("first"),
            ChatMessage::user("second"),
            ChatMessage::assistant("reply"),
            ChatMessage::assistant("more"),
            ChatMessage::user("third"),
        ];
        let (_, turns) = ClaudeProvider::ensure_alternating_roles(&msgs);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].content, "first\n\nsecond");
        assert_eq!(turns[1].content, "reply\n\nmore");
        assert_eq!(turns[2].role, "user");
    }

    #[test]
    fn test_leading_assistant_gets_synthetic_user_turn() {
        let msgs = vec![ChatMessage::assistant("Hi, how can I help?"), ChatMessage::user("help")];
        let (_, turns) = ClaudeProvider::ensure_alternating_roles(&msgs);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].role, "user");
        assert_eq!(turns[0].content, "Hello");
        assert_eq!(turns[1].role, "assistant");
    }

    #[test]
    fn test_empty_history_stays_empty() {
        let (system, turns) = ClaudeProvider::ensure_alternating_roles(&[]);
        assert!(system.is_none());
        assert!(turns.is_empty());
    }

    #[test]
    fn test_build_request_shape() {
        let p = provider();
        let opts = CompletionOptions::default().with_temperature(0.2);
        let body = p.build_request(
            &[ChatMessage::system("sys"), ChatMessage::user("hi")],
            &opts,
        );
        assert_eq!(body["model"], "claude-3-5-sonnet-20241022");
        assert_eq!(body["system"], "sys");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("top_k").is_none());
    }

    #[test]
    fn test_from_claude_response_joins_text_blocks() {
        let raw = serde_json::json!({
            "id": "msg_1",
            "model": "claude-3-5-sonnet-20241022",
            "content": [
                {"type": "text", "text": "Hello "},
                {"type": "text", "text": "there"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        });
        let parsed: ClaudeApiResponse = serde_json::from_value(raw.clone()).unwrap();
        let result = provider().from_claude_response(parsed, raw);
        assert_eq!(result.content, "Hello there");
        assert_eq!(result.usage, Some(TokenUsage::new(10, 5)));
        assert_eq!(result.provider, ProviderKind::Claude);
    }

    #[test]
    fn test_debug_hides_key() {
        let debug = format!("{:?}", provider());
        assert!(!debug.contains("sk-ant-secret"));
        assert!(debug.contains("api.anthropic.com"));
    }
}
