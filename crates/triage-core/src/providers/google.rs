//! Google Gemini adapter

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

/// Gemini provider (generateContent API)
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl GeminiProvider {
    pub fn new(client: Client, api_key: String, model: String, base_url: String) -> Self {
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }

    /// Gemini only knows "user" and "model"; assistant and system text both
    /// become "model", adjacent turns merge, and the first turn must be "user".
    fn to_gemini_contents(messages: &[ChatMessage]) -> Vec<GeminiContent> {
        let mut contents: Vec<GeminiContent> = Vec::new();
        for msg in messages {
            let role = match msg.role {
                ChatRole::User => "user",
                ChatRole::Assistant | ChatRole::System => "model",
            };
            match contents.last_mut() {
                Some(last) if last.role == role => last.parts.push(GeminiPart {
                    text: msg.content.clone(),
                }),
                _ => contents.push(GeminiContent {
                    role: role.to_string(),
                    parts: vec![GeminiPart {
                        text: msg.content.clone(),
                    }],
                }),
            }
        }

        if contents.first().is_some_and(|c| c.role != "user") {
            contents.insert(
                0,
                GeminiContent {
                    role: "user".to_string(),
                    parts: vec![GeminiPart {
                        text: "Hello".to_string(),
                    }],
                },
            );
        }
        contents
    }

    fn from_gemini_response(
        &self,
        resp: GeminiApiResponse,
        raw: Value,
    ) -> Result<CompletionResult, ProviderError> {
        let candidate = resp
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Decode {
                provider: ProviderKind::Gemini,
                message: "response had no candidates".to_string(),
            })?;

        let content = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let usage = resp.usage_metadata.map(|u| {
            let prompt = u.prompt_token_count.unwrap_or(0);
            let completion = u.candidates_token_count.unwrap_or(0);
            TokenUsage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: u.total_token_count.unwrap_or(prompt + completion),
            }
        });

        Ok(CompletionResult {
            content,
            usage,
            model: self.model.clone(),
            provider: ProviderKind::Gemini,
            raw,
        })
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Value {
        let mut generation = serde_json::json!({
            "maxOutputTokens": options.max_tokens_or(DEFAULT_MAX_TOKENS),
        });
        if let Some(t) = options.temperature {
            generation["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = options.top_p {
            generation["topP"] = serde_json::json!(p);
        }
        if let Some(k) = options.top_k {
            generation["topK"] = serde_json::json!(k);
        }
        if !options.stop.is_empty() {
            generation["stopSequences"] = serde_json::json!(options.stop);
        }

        serde_json::json!({
            "contents": Self::to_gemini_contents(messages),
            "generationConfig": generation,
        })
    }

    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResult, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let body = self.build_request(messages, options);

        debug!(
            "Gemini request: model={}, messages={}",
            self.model,
            messages.len()
        );

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(ProviderKind::Gemini, e))?;

        if !response.status().is_success() {
            let retry = retry_after(&response);
            let (status, text) = read_error(response).await;
            return Err(ProviderError::from_status(
                ProviderKind::Gemini,
                status,
                &text,
                retry,
            ));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::from_transport(ProviderKind::Gemini, e))?;
        let parsed: GeminiApiResponse =
            serde_json::from_value(raw.clone()).map_err(|e| ProviderError::Decode {
                provider: ProviderKind::Gemini,
                message: e.to_string(),
            })?;

        self.from_gemini_response(parsed, raw)
    }
}

// ── Gemini wire types ──

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiApiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiCandidateContent>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    total_token_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GeminiProvider {
        GeminiProvider::new(
            Client::new(),
            "AIza-secret-key".to_string(),
            "gemini-1.5-flash".to_string(),
            "https://generativelanguage.googleapis.com".to_string(),
        )
    }

    #[test]
    fn test_assistant_and_system_become_model() {
        let msgs = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
            ChatMessage::system("note"),
            ChatMessage::user("thanks"),
        ];
        let contents = GeminiProvider::to_gemini_contents(&msgs);
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1].role, "model");
        assert_eq!(contents[1].parts.len(), 2);
        assert_eq!(contents[2].role, "user");
    }

    #[test]
    fn test_leading_system_gets_user_turn_first() {
        let msgs = vec![ChatMessage::system("You are helpful"), ChatMessage::user("hi")];
        let contents = GeminiProvider::to_gemini_contents(&msgs);
        assert_eq!(contents[0].role, "user");
        assert_eq!(contents[0].parts[0].text, "Hello");
        assert_eq!(contents[1].role, "model");
        assert_eq!(contents[2].role, "user");
    }

    #[test]
    fn test_build_request_generation_config() {
        let opts = CompletionOptions {
            temperature: Some(0.5),
            max_tokens: Some(256),
            top_k: Some(40),
            ..Default::default()
        };
        let body = provider().build_request(&[ChatMessage::user("hi")], &opts);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(body["generationConfig"]["topK"], 40);
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn test_from_gemini_response_usage() {
        let raw = serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Hola"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
        });
        let parsed: GeminiApiResponse = serde_json::from_value(raw.clone()).unwrap();
        let result = provider().from_gemini_response(parsed, raw).unwrap();
        assert_eq!(result.content, "Hola");
        assert_eq!(result.usage, Some(TokenUsage::new(4, 2)));
    }

    #[test]
    fn test_from_gemini_response_without_candidates() {
        let raw = serde_json::json!({"candidates": []});
        let parsed: GeminiApiResponse = serde_json::from_value(raw.clone()).unwrap();
        let err = provider().from_gemini_response(parsed, raw).unwrap_err();
        assert!(matches!(err, ProviderError::Decode { .. }));
    }

    #[test]
    fn test_debug_hides_key() {
        assert!(!format!("{:?}", provider()).contains("AIza-secret-key"));
    }
}
