//! Provider gateway: credential resolution, provider/model selection and retries

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::ConfigStore;

use super::anthropic::ClaudeProvider;
use super::error::ProviderError;
use super::google::GeminiProvider;
use super::openai::OpenAiProvider;
use super::types::{
    ChatMessage, ChunkSink, CompletionOptions, CompletionResult, LlmProvider, ProviderKind,
};

pub const DEFAULT_PROVIDER_KEY: &str = "AI_DEFAULT_PROVIDER";

/// Upper bound on any single wait between retries
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Exponential delay for a zero-based attempt, saturating at `MAX_BACKOFF`
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms)
        .checked_mul(2u32.saturating_pow(attempt))
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

pub fn api_key_setting(kind: ProviderKind) -> String {
    format!("AI_{}_API_KEY", kind.config_key())
}

pub fn model_setting(kind: ProviderKind) -> String {
    format!("AI_{}_MODEL", kind.config_key())
}

/// Vendor endpoints; overridable for proxies and tests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseUrls {
    #[serde(default = "default_openai_url")]
    pub openai: String,
    #[serde(default = "default_claude_url")]
    pub claude: String,
    #[serde(default = "default_gemini_url")]
    pub gemini: String,
}

fn default_openai_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_claude_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_gemini_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

impl Default for BaseUrls {
    fn default() -> Self {
        Self {
            openai: default_openai_url(),
            claude: default_claude_url(),
            gemini: default_gemini_url(),
        }
    }
}

impl BaseUrls {
    pub fn for_kind(&self, kind: ProviderKind) -> &str {
        match kind {
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Claude => &self.claude,
            ProviderKind::Gemini => &self.gemini,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Selection order among configured providers
    #[serde(default = "default_preference")]
    pub preference: Vec<ProviderKind>,
    /// Extra attempts after a retryable failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
    /// Fall back to OPENAI_API_KEY and friends when the config store has no key
    #[serde(default = "default_env_fallback")]
    pub env_fallback: bool,
    #[serde(default)]
    pub base_urls: BaseUrls,
}

fn default_timeout_secs() -> u64 {
    60
}
fn default_preference() -> Vec<ProviderKind> {
    ProviderKind::ALL.to_vec()
}
fn default_max_retries() -> u32 {
    2
}
fn default_base_retry_delay_ms() -> u64 {
    500
}
fn default_env_fallback() -> bool {
    true
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            preference: default_preference(),
            max_retries: default_max_retries(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            env_fallback: default_env_fallback(),
            base_urls: BaseUrls::default(),
        }
    }
}

/// Builds adapters for a resolved provider
pub trait ProviderFactory: Send + Sync {
    fn create(&self, kind: ProviderKind, api_key: String, model: String) -> Box<dyn LlmProvider>;
}

/// Real HTTP adapters sharing one client
pub struct HttpProviderFactory {
    client: Client,
    base_urls: BaseUrls,
}

impl HttpProviderFactory {
    pub fn new(settings: &GatewaySettings) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Api {
                provider: ProviderKind::OpenAi,
                status: None,
                message: format!("failed to build HTTP client: {}", e),
                retryable: false,
            })?;
        Ok(Self {
            client,
            base_urls: settings.base_urls.clone(),
        })
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn create(&self, kind: ProviderKind, api_key: String, model: String) -> Box<dyn LlmProvider> {
        let base_url = self.base_urls.for_kind(kind).to_string();
        let client = self.client.clone();
        match kind {
            ProviderKind::OpenAi => Box::new(OpenAiProvider::new(client, api_key, model, base_url)),
            ProviderKind::Claude => Box::new(ClaudeProvider::new(client, api_key, model, base_url)),
            ProviderKind::Gemini => Box::new(GeminiProvider::new(client, api_key, model, base_url)),
        }
    }
}

/// Outcome of provider/model selection
#[derive(Clone)]
pub struct ResolvedProvider {
    pub kind: ProviderKind,
    pub model: String,
    api_key: String,
}

impl std::fmt::Debug for ResolvedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedProvider")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub configured: bool,
    /// Key stored in the config store, as opposed to only in the environment
    pub api_key_present: bool,
    pub model: String,
    pub available_models: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTest {
    pub provider: ProviderKind,
    pub success: bool,
    pub model: Option<String>,
    pub latency_ms: u64,
    pub message: String,
}

/// Uniform completion entry point over every configured vendor
pub struct ProviderGateway {
    config: Arc<dyn ConfigStore>,
    settings: GatewaySettings,
    factory: Arc<dyn ProviderFactory>,
}

impl ProviderGateway {
    pub fn new(config: Arc<dyn ConfigStore>, settings: GatewaySettings) -> Result<Self, ProviderError> {
        let factory = Arc::new(HttpProviderFactory::new(&settings)?);
        Ok(Self::with_factory(config, settings, factory))
    }

    pub fn with_factory(
        config: Arc<dyn ConfigStore>,
        settings: GatewaySettings,
        factory: Arc<dyn ProviderFactory>,
    ) -> Self {
        Self {
            config,
            settings,
            factory,
        }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Config-store key first, then the process environment
    fn api_key(&self, kind: ProviderKind) -> Option<String> {
        self.config
            .get(&api_key_setting(kind))
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                if self.settings.env_fallback {
                    std::env::var(kind.env_var()).ok().filter(|k| !k.trim().is_empty())
                } else {
                    None
                }
            })
    }

    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        self.api_key(kind).is_some()
    }

    pub fn available_providers(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|k| self.is_configured(*k))
            .collect()
    }

    /// Configured default, then preference order, then any configured provider
    pub fn default_provider(&self) -> Option<ProviderKind> {
        if let Some(kind) = self
            .config
            .get(DEFAULT_PROVIDER_KEY)
            .and_then(|v| ProviderKind::from_str(&v))
            .filter(|k| self.is_configured(*k))
        {
            return Some(kind);
        }
        if let Some(kind) = self
            .settings
            .preference
            .iter()
            .copied()
            .find(|k| self.is_configured(*k))
        {
            return Some(kind);
        }
        self.available_providers().into_iter().next()
    }

    fn configured_model(&self, kind: ProviderKind) -> String {
        self.config
            .get(&model_setting(kind))
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| kind.default_model().to_string())
    }

    /// Pick provider and model: explicit argument, then account configuration,
    /// then preference order, then the first configured provider.
    pub fn resolve(
        &self,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Result<ResolvedProvider, ProviderError> {
        let explicit_model = model.map(str::trim).filter(|m| !m.is_empty());

        let kind = match provider.map(str::trim).filter(|p| !p.is_empty()) {
            Some(name) => {
                ProviderKind::from_str(name).ok_or_else(|| ProviderError::UnsupportedProvider(name.to_string()))?
            }
            None => {
                // a model id alone is enough to pin its vendor
                let by_model = explicit_model.and_then(|m| {
                    ProviderKind::ALL
                        .into_iter()
                        .find(|k| k.model_info(m).is_some())
                });
                match by_model {
                    Some(kind) => kind,
                    None => self
                        .default_provider()
                        .ok_or(ProviderError::NoProviderConfigured)?,
                }
            }
        };

        let api_key = self.api_key(kind).ok_or(ProviderError::NotConfigured(kind))?;

        let model = match explicit_model {
            Some(m) => m.to_string(),
            None => self.configured_model(kind),
        };
        if kind.model_info(&model).is_none() {
            return Err(ProviderError::InvalidModel {
                provider: kind,
                model,
            });
        }

        debug!("Resolved provider {} with model {}", kind, model);
        Ok(ResolvedProvider {
            kind,
            model,
            api_key,
        })
    }

    pub fn provider(
        &self,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Result<Box<dyn LlmProvider>, ProviderError> {
        let resolved = self.resolve(provider, model)?;
        Ok(self
            .factory
            .create(resolved.kind, resolved.api_key, resolved.model))
    }

    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        provider: Option<&str>,
        model: Option<&str>,
        options: &CompletionOptions,
    ) -> Result<CompletionResult, ProviderError> {
        let adapter = self.provider(provider, model)?;
        let mut attempt = 0u32;

        loop {
            match adapter.chat_completion(messages, options).await {
                Ok(result) => {
                    if attempt > 0 {
                        info!(
                            "Request to {} ({}) succeeded after {} retries",
                            adapter.kind(),
                            adapter.model(),
                            attempt
                        );
                    }
                    return Ok(result);
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    warn!(
                        "Provider {} ({}) failed (attempt {}, retryable={}): {}",
                        adapter.kind(),
                        adapter.model(),
                        attempt + 1,
                        retryable,
                        e
                    );
                    if !retryable || attempt >= self.settings.max_retries {
                        return Err(e);
                    }

                    let delay = match &e {
                        ProviderError::RateLimited {
                            retry_after: Some(d),
                            ..
                        } => (*d).min(MAX_BACKOFF),
                        _ => backoff_delay(self.settings.base_retry_delay_ms, attempt),
                    };
                    debug!("Backing off for {:?} before retry", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub async fn text_completion(
        &self,
        prompt: &str,
        provider: Option<&str>,
        model: Option<&str>,
        options: &CompletionOptions,
    ) -> Result<CompletionResult, ProviderError> {
        self.chat_completion(&[ChatMessage::user(prompt)], provider, model, options)
            .await
    }

    /// Streams through the adapter; vendors without streaming deliver one chunk
    pub async fn stream_chat_completion(
        &self,
        messages: &[ChatMessage],
        provider: Option<&str>,
        model: Option<&str>,
        options: &CompletionOptions,
        sink: ChunkSink<'_>,
    ) -> Result<CompletionResult, ProviderError> {
        let adapter = self.provider(provider, model)?;
        if !adapter.supports_streaming() {
            debug!("{} does not stream, falling back to a single response", adapter.kind());
        }
        adapter.stream_chat_completion(messages, options, sink).await
    }

    pub fn provider_status(&self) -> BTreeMap<ProviderKind, ProviderStatus> {
        ProviderKind::ALL
            .into_iter()
            .map(|kind| {
                let status = ProviderStatus {
                    configured: self.is_configured(kind),
                    api_key_present: self
                        .config
                        .get(&api_key_setting(kind))
                        .is_some_and(|k| !k.trim().is_empty()),
                    model: self.configured_model(kind),
                    available_models: kind.models().iter().map(|m| m.id.to_string()).collect(),
                };
                (kind, status)
            })
            .collect()
    }

    /// Store credentials (and optionally a model) for a provider
    pub fn configure_provider(
        &self,
        kind: ProviderKind,
        api_key: &str,
        model: Option<&str>,
    ) -> anyhow::Result<()> {
        if let Some(model) = model {
            if kind.model_info(model).is_none() {
                return Err(ProviderError::InvalidModel {
                    provider: kind,
                    model: model.to_string(),
                }
                .into());
            }
            self.config.set(&model_setting(kind), model)?;
        }
        self.config.set(&api_key_setting(kind), api_key.trim())?;
        info!("Configured provider {}", kind);
        Ok(())
    }

    pub fn set_default_provider(&self, kind: ProviderKind) -> anyhow::Result<()> {
        self.config.set(DEFAULT_PROVIDER_KEY, &kind.to_string())
    }

    /// Minimal round trip ("Hello", 5 tokens) against a provider
    pub async fn test_connection(&self, kind: ProviderKind) -> ConnectionTest {
        let started = Instant::now();
        let options = CompletionOptions::default().with_max_tokens(5);
        let provider_name = kind.to_string();
        let outcome = match self.provider(Some(&provider_name), None) {
            Ok(adapter) => adapter.text_completion("Hello", &options).await,
            Err(e) => Err(e),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => ConnectionTest {
                provider: kind,
                success: true,
                model: Some(result.model),
                latency_ms,
                message: "Connection successful".to_string(),
            },
            Err(e) => ConnectionTest {
                provider: kind,
                success: false,
                model: None,
                latency_ms,
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::testing::{ScriptedFactory, scripted_ok};

    fn settings() -> GatewaySettings {
        GatewaySettings {
            env_fallback: false,
            base_retry_delay_ms: 1,
            ..Default::default()
        }
    }

    fn gateway_with(keys: &[(&str, &str)], factory: Arc<ScriptedFactory>) -> ProviderGateway {
        let store = Arc::new(InMemoryStore::new());
        for (k, v) in keys {
            store.set(k, v).unwrap();
        }
        ProviderGateway::with_factory(store, settings(), factory)
    }

    #[test]
    fn test_backoff_doubles_then_saturates() {
        assert_eq!(backoff_delay(500, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(500, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(500, 3), Duration::from_millis(4000));
        assert_eq!(backoff_delay(500, 40), MAX_BACKOFF);
        assert_eq!(backoff_delay(500, u32::MAX), MAX_BACKOFF);
        assert_eq!(backoff_delay(u64::MAX, 1), MAX_BACKOFF);
        assert_eq!(backoff_delay(0, u32::MAX), Duration::ZERO);
    }

    #[test]
    fn test_no_provider_configured() {
        let gw = gateway_with(&[], Arc::new(ScriptedFactory::default()));
        assert!(matches!(
            gw.resolve(None, None),
            Err(ProviderError::NoProviderConfigured)
        ));
        assert!(gw.default_provider().is_none());
    }

    #[test]
    fn test_explicit_provider_wins() {
        let gw = gateway_with(
            &[
                ("AI_OPENAI_API_KEY", "sk-o"),
                ("AI_CLAUDE_API_KEY", "sk-c"),
                (DEFAULT_PROVIDER_KEY, "openai"),
            ],
            Arc::new(ScriptedFactory::default()),
        );
        let r = gw.resolve(Some("claude"), None).unwrap();
        assert_eq!(r.kind, ProviderKind::Claude);
        assert_eq!(r.model, "claude-3-5-sonnet-20241022");
    }

    #[test]
    fn test_account_default_beats_preference() {
        let gw = gateway_with(
            &[
                ("AI_OPENAI_API_KEY", "sk-o"),
                ("AI_GEMINI_API_KEY", "g"),
                (DEFAULT_PROVIDER_KEY, "gemini"),
            ],
            Arc::new(ScriptedFactory::default()),
        );
        assert_eq!(gw.resolve(None, None).unwrap().kind, ProviderKind::Gemini);
    }

    #[test]
    fn test_preference_order_among_configured() {
        let gw = gateway_with(
            &[("AI_GEMINI_API_KEY", "g"), ("AI_CLAUDE_API_KEY", "c")],
            Arc::new(ScriptedFactory::default()),
        );
        // openai > claude > gemini
        assert_eq!(gw.resolve(None, None).unwrap().kind, ProviderKind::Claude);
    }

    #[test]
    fn test_unconfigured_default_is_skipped() {
        let gw = gateway_with(
            &[("AI_GEMINI_API_KEY", "g"), (DEFAULT_PROVIDER_KEY, "openai")],
            Arc::new(ScriptedFactory::default()),
        );
        assert_eq!(gw.resolve(None, None).unwrap().kind, ProviderKind::Gemini);
    }

    #[test]
    fn test_model_selection_and_validation() {
        let gw = gateway_with(
            &[("AI_OPENAI_API_KEY", "sk-o"), ("AI_OPENAI_MODEL", "gpt-4o")],
            Arc::new(ScriptedFactory::default()),
        );
        assert_eq!(gw.resolve(None, None).unwrap().model, "gpt-4o");
        assert_eq!(
            gw.resolve(None, Some("gpt-3.5-turbo")).unwrap().model,
            "gpt-3.5-turbo"
        );
        assert!(matches!(
            gw.resolve(None, Some("gpt-9")),
            Err(ProviderError::InvalidModel { .. })
        ));
        assert!(matches!(
            gw.resolve(Some("openai"), Some("gpt-9")),
            Err(ProviderError::InvalidModel { .. })
        ));
    }

    #[test]
    fn test_model_pins_provider() {
        let gw = gateway_with(
            &[("AI_OPENAI_API_KEY", "sk-o"), ("AI_CLAUDE_API_KEY", "c")],
            Arc::new(ScriptedFactory::default()),
        );
        let r = gw.resolve(None, Some("claude-3-haiku-20240307")).unwrap();
        assert_eq!(r.kind, ProviderKind::Claude);
    }

    #[test]
    fn test_explicit_unconfigured_or_unknown_provider() {
        let gw = gateway_with(&[("AI_OPENAI_API_KEY", "sk-o")], Arc::new(ScriptedFactory::default()));
        assert!(matches!(
            gw.resolve(Some("gemini"), None),
            Err(ProviderError::NotConfigured(ProviderKind::Gemini))
        ));
        assert!(matches!(
            gw.resolve(Some("mistral"), None),
            Err(ProviderError::UnsupportedProvider(_))
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let factory = Arc::new(ScriptedFactory::with_script(vec![
            Err(ProviderError::from_status(ProviderKind::OpenAi, 429, "slow down", None)),
            scripted_ok("second time lucky"),
        ]));
        let gw = gateway_with(&[("AI_OPENAI_API_KEY", "sk-o")], factory.clone());
        let result = gw
            .chat_completion(&[ChatMessage::user("hi")], None, None, &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(result.content, "second time lucky");
        assert_eq!(factory.calls(), 2);
    }

    #[tokio::test]
    async fn test_authentication_error_is_not_retried() {
        let factory = Arc::new(ScriptedFactory::with_script(vec![
            Err(ProviderError::from_status(ProviderKind::OpenAi, 401, "nope", None)),
            scripted_ok("unreachable"),
        ]));
        let gw = gateway_with(&[("AI_OPENAI_API_KEY", "sk-o")], factory.clone());
        let err = gw
            .chat_completion(&[ChatMessage::user("hi")], None, None, &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Authentication { .. }));
        assert_eq!(factory.calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let factory = Arc::new(ScriptedFactory::with_script(vec![
            Err(ProviderError::from_status(ProviderKind::OpenAi, 503, "", None)),
            Err(ProviderError::from_status(ProviderKind::OpenAi, 503, "", None)),
            Err(ProviderError::from_status(ProviderKind::OpenAi, 503, "", None)),
            scripted_ok("too late"),
        ]));
        let gw = gateway_with(&[("AI_OPENAI_API_KEY", "sk-o")], factory.clone());
        let result = gw
            .chat_completion(&[ChatMessage::user("hi")], None, None, &CompletionOptions::default())
            .await;
        assert!(result.is_err());
        assert_eq!(factory.calls(), 3);
    }

    #[tokio::test]
    async fn test_streaming_falls_back_to_single_chunk() {
        let factory = Arc::new(ScriptedFactory::with_script(vec![scripted_ok("whole answer")]));
        let gw = gateway_with(&[("AI_CLAUDE_API_KEY", "c")], factory);
        let mut chunks = Vec::new();
        let mut sink = |s: &str| chunks.push(s.to_string());
        let result = gw
            .stream_chat_completion(
                &[ChatMessage::user("hi")],
                None,
                None,
                &CompletionOptions::default(),
                &mut sink,
            )
            .await
            .unwrap();
        assert_eq!(result.content, "whole answer");
        assert_eq!(chunks, vec!["whole answer".to_string()]);
    }

    #[test]
    fn test_provider_status_and_configure() {
        let gw = gateway_with(&[], Arc::new(ScriptedFactory::default()));
        gw.configure_provider(ProviderKind::Gemini, "g-key", Some("gemini-1.5-pro"))
            .unwrap();
        assert!(gw
            .configure_provider(ProviderKind::Gemini, "g-key", Some("gpt-4o"))
            .is_err());

        let status = gw.provider_status();
        let gemini = &status[&ProviderKind::Gemini];
        assert!(gemini.configured);
        assert!(gemini.api_key_present);
        assert_eq!(gemini.model, "gemini-1.5-pro");
        assert_eq!(gemini.available_models.len(), 3);
        assert!(!status[&ProviderKind::OpenAi].configured);
        assert_eq!(status[&ProviderKind::OpenAi].model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_connection_reports_failure_without_key() {
        let gw = gateway_with(&[], Arc::new(ScriptedFactory::default()));
        let test = gw.test_connection(ProviderKind::Claude).await;
        assert!(!test.success);
        assert!(test.message.contains("not configured"));
    }

    #[tokio::test]
    async fn test_connection_success() {
        let factory = Arc::new(ScriptedFactory::with_script(vec![scripted_ok("Hi")]));
        let gw = gateway_with(&[("AI_OPENAI_API_KEY", "sk-o")], factory);
        let test = gw.test_connection(ProviderKind::OpenAi).await;
        assert!(test.success);
        assert_eq!(test.model.as_deref(), Some("gpt-4o-mini"));
    }
}
