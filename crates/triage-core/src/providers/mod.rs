//! Multi-vendor LLM abstraction layer
//!
//! Supports OpenAI, Anthropic Claude and Google Gemini. Adapters implement the
//! [`LlmProvider`] trait and are selected per request by [`ProviderGateway`],
//! which resolves credentials from the config store and retries transient
//! vendor failures.

pub mod anthropic;
pub mod error;
pub mod gateway;
pub mod google;
pub mod openai;
pub mod types;

use std::time::Duration;

pub use error::ProviderError;
pub use gateway::{
    BaseUrls, ConnectionTest, GatewaySettings, HttpProviderFactory, ProviderFactory,
    ProviderGateway, ProviderStatus, ResolvedProvider,
};
pub use types::{
    ChatMessage, ChatRole, CompletionOptions, CompletionResult, LlmProvider, ModelInfo,
    ProviderKind, TokenUsage,
};

/// Used when the caller does not cap output length
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

/// Seconds from a `Retry-After` header, when the vendor sends one
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Drain an error response into (status, body text)
async fn read_error(response: reqwest::Response) -> (u16, String) {
    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    (status, text)
}
