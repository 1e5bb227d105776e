//! Provider-agnostic types for multi-vendor completions

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ProviderError;

/// Supported model vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "claude")]
    Claude,
    #[serde(rename = "gemini")]
    Gemini,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::OpenAi, Self::Claude, Self::Gemini];

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "claude" | "anthropic" => Some(Self::Claude),
            "gemini" | "google" => Some(Self::Gemini),
            _ => None,
        }
    }

    /// Upper-case stem used for config-store keys (`AI_OPENAI_API_KEY`)
    pub fn config_key(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI",
            Self::Claude => "CLAUDE",
            Self::Gemini => "GEMINI",
        }
    }

    /// Process environment fallback for the API key
    pub fn env_var(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Claude => "ANTHROPIC_API_KEY",
            Self::Gemini => "GOOGLE_AI_API_KEY",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Claude => "claude-3-5-sonnet-20241022",
            Self::Gemini => "gemini-1.5-flash",
        }
    }

    pub fn models(&self) -> &'static [ModelInfo] {
        match self {
            Self::OpenAi => &OPENAI_MODELS,
            Self::Claude => &CLAUDE_MODELS,
            Self::Gemini => &GEMINI_MODELS,
        }
    }

    pub fn model_info(&self, model: &str) -> Option<&'static ModelInfo> {
        self.models().iter().find(|m| m.id == model)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAi => write!(f, "openai"),
            Self::Claude => write!(f, "claude"),
            Self::Gemini => write!(f, "gemini"),
        }
    }
}

/// Declared capabilities of a vendor model
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub context_length: u32,
    pub supports_tools: bool,
    pub supports_vision: bool,
}

const fn model(
    id: &'static str,
    name: &'static str,
    context_length: u32,
    supports_tools: bool,
    supports_vision: bool,
) -> ModelInfo {
    ModelInfo {
        id,
        name,
        context_length,
        supports_tools,
        supports_vision,
    }
}

static OPENAI_MODELS: [ModelInfo; 5] = [
    model("gpt-4o", "GPT-4o", 128_000, true, true),
    model("gpt-4o-mini", "GPT-4o mini", 128_000, true, true),
    model("gpt-4-turbo", "GPT-4 Turbo", 128_000, true, true),
    model("gpt-4", "GPT-4", 8_192, true, false),
    model("gpt-3.5-turbo", "GPT-3.5 Turbo", 16_385, true, false),
];

static CLAUDE_MODELS: [ModelInfo; 4] = [
    model("claude-3-5-sonnet-20241022", "Claude 3.5 Sonnet", 200_000, true, true),
    model("claude-3-5-haiku-20241022", "Claude 3.5 Haiku", 200_000, true, false),
    model("claude-3-opus-20240229", "Claude 3 Opus", 200_000, true, true),
    model("claude-3-haiku-20240307", "Claude 3 Haiku", 200_000, true, true),
];

static GEMINI_MODELS: [ModelInfo; 3] = [
    model("gemini-1.5-pro", "Gemini 1.5 Pro", 2_000_000, true, true),
    model("gemini-1.5-flash", "Gemini 1.5 Flash", 1_000_000, true, true),
    model("gemini-1.0-pro", "Gemini 1.0 Pro", 32_760, true, false),
];

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Provider-agnostic chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }
}

/// Generation knobs shared by every vendor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionOptions {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Ignored by vendors without top-k sampling
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl CompletionOptions {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn max_tokens_or(&self, default: u32) -> u32 {
        self.max_tokens.unwrap_or(default)
    }
}

/// Token usage from a single call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Normalized result returned by every adapter
#[derive(Debug, Clone, Serialize)]
pub struct CompletionResult {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub model: String,
    pub provider: ProviderKind,
    /// Vendor payload, kept for diagnostics
    #[serde(skip_serializing)]
    pub raw: Value,
}

/// Receives streamed text fragments as they arrive
pub type ChunkSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Trait that all vendor adapters implement
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Model identifier this adapter is bound to
    fn model(&self) -> &str;

    fn available_models(&self) -> &'static [ModelInfo] {
        self.kind().models()
    }

    /// Build the vendor request body for these messages
    fn build_request(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Value;

    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionResult, ProviderError>;

    async fn text_completion(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<CompletionResult, ProviderError> {
        self.chat_completion(&[ChatMessage::user(prompt)], options)
            .await
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Stream a completion into `sink`; adapters without streaming deliver the
    /// whole response as a single fragment
    async fn stream_chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        sink: ChunkSink<'_>,
    ) -> Result<CompletionResult, ProviderError> {
        let result = self.chat_completion(messages, options).await?;
        sink(&result.content);
        Ok(result)
    }
}
