//! Common error taxonomy for vendor calls

use std::time::Duration;

use thiserror::Error;

use super::types::ProviderKind;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} authentication failed: {message}")]
    Authentication {
        provider: ProviderKind,
        message: String,
    },

    #[error("{provider} rate limit exceeded: {message}")]
    RateLimited {
        provider: ProviderKind,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("{provider} rejected the request: {message}")]
    BadRequest {
        provider: ProviderKind,
        message: String,
    },

    /// Everything else, including timeouts and connection failures
    #[error("{provider} API error: {message}")]
    Api {
        provider: ProviderKind,
        status: Option<u16>,
        message: String,
        retryable: bool,
    },

    #[error("failed to decode {provider} response: {message}")]
    Decode {
        provider: ProviderKind,
        message: String,
    },

    #[error("provider {0} is not configured (missing API key)")]
    NotConfigured(ProviderKind),

    #[error("no AI provider is configured")]
    NoProviderConfigured,

    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("model {model} is not available for {provider}")]
    InvalidModel {
        provider: ProviderKind,
        model: String,
    },
}

impl ProviderError {
    /// Classify a non-success HTTP response
    pub fn from_status(
        provider: ProviderKind,
        status: u16,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        let message = extract_error_message(body);
        match status {
            401 => Self::Authentication { provider, message },
            429 => Self::RateLimited {
                provider,
                message,
                retry_after,
            },
            400 => Self::BadRequest { provider, message },
            _ => Self::Api {
                provider,
                status: Some(status),
                message,
                retryable: (500..600).contains(&status),
            },
        }
    }

    /// Classify a transport failure (no HTTP status available)
    pub fn from_transport(provider: ProviderKind, err: reqwest::Error) -> Self {
        // urls may carry query-string keys
        let err = err.without_url();
        let retryable = err.is_timeout() || err.is_connect();
        let message = if err.is_timeout() {
            format!("request timed out: {}", err)
        } else {
            err.to_string()
        };
        Self::Api {
            provider,
            status: err.status().map(|s| s.as_u16()),
            message,
            retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Api { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Configuration problems are surfaced and never retried
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NotConfigured(_)
                | Self::NoProviderConfigured
                | Self::UnsupportedProvider(_)
                | Self::InvalidModel { .. }
        )
    }

    pub fn provider(&self) -> Option<ProviderKind> {
        match self {
            Self::Authentication { provider, .. }
            | Self::RateLimited { provider, .. }
            | Self::BadRequest { provider, .. }
            | Self::Api { provider, .. }
            | Self::Decode { provider, .. }
            | Self::InvalidModel { provider, .. } => Some(*provider),
            Self::NotConfigured(provider) => Some(*provider),
            Self::NoProviderConfigured | Self::UnsupportedProvider(_) => None,
        }
    }
}

/// Pull `error.message` out of a vendor error body, falling back to the raw text
fn extract_error_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|v| {
        v.get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(|m| m.as_str())
            .map(str::to_string)
    });
    match message {
        Some(m) => m,
        None if body.trim().is_empty() => "Unknown error".to_string(),
        None => body.chars().take(500).collect(),
    }
}
