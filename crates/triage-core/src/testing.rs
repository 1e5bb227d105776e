//! Test doubles shared by unit tests across modules

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{Map, Value};

use crate::providers::gateway::{GatewaySettings, ProviderFactory, ProviderGateway};
use crate::providers::{
    ChatMessage, CompletionOptions, CompletionResult, LlmProvider, ProviderError, ProviderKind,
    TokenUsage,
};
use crate::registry;
use crate::store::memory::InMemoryStore;
use crate::store::{AgentRepository, ConfigStore, ConversationStore};
use crate::types::{AccountId, Agent, AgentStatus, Conversation, ConversationStatus, MessageDirection};

type Script = Arc<Mutex<VecDeque<Result<CompletionResult, ProviderError>>>>;

pub fn scripted_ok(content: &str) -> Result<CompletionResult, ProviderError> {
    Ok(CompletionResult {
        content: content.to_string(),
        usage: Some(TokenUsage::new(10, 5)),
        model: String::new(),
        provider: ProviderKind::OpenAi,
        raw: Value::Null,
    })
}

/// Hands out providers that replay a shared script of results
#[derive(Default)]
pub struct ScriptedFactory {
    script: Script,
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ScriptedFactory {
    pub fn with_script(results: Vec<Result<CompletionResult, ProviderError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(results.into())),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Message lists received by providers, in call order
    pub fn seen(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }
}

impl ProviderFactory for ScriptedFactory {
    fn create(&self, kind: ProviderKind, _api_key: String, model: String) -> Box<dyn LlmProvider> {
        Box::new(ScriptedProvider {
            kind,
            model,
            script: Arc::clone(&self.script),
            calls: Arc::clone(&self.calls),
            seen: Arc::clone(&self.seen),
        })
    }
}

struct ScriptedProvider {
    kind: ProviderKind,
    model: String,
    script: Script,
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, messages: &[ChatMessage], _options: &CompletionOptions) -> Value {
        serde_json::to_value(messages).unwrap_or(Value::Null)
    }

    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> Result<CompletionResult, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages.to_vec());
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| scripted_ok("ok"));
        next.map(|mut r| {
            r.provider = self.kind;
            r.model = self.model.clone();
            r
        })
    }
}

/// Gateway over the in-memory config store with the given factory and keys
pub fn gateway(store: Arc<InMemoryStore>, factory: Arc<ScriptedFactory>) -> ProviderGateway {
    let settings = GatewaySettings {
        env_fallback: false,
        base_retry_delay_ms: 1,
        ..Default::default()
    };
    for kind in ProviderKind::ALL {
        store
            .set(&crate::providers::gateway::api_key_setting(kind), "test-key")
            .unwrap();
    }
    ProviderGateway::with_factory(store, settings, factory)
}

/// Install a registry template as an active agent
pub async fn install(store: &InMemoryStore, account_id: AccountId, template_id: &str) -> Agent {
    let template = registry::get(template_id).unwrap();
    let now = Utc::now();
    store
        .insert_agent(Agent {
            id: 0,
            account_id,
            template_id: template.id.to_string(),
            name: template.name.to_string(),
            category: template.category,
            status: AgentStatus::Active,
            provider: template.default_provider(),
            model: None,
            temperature: 0.7,
            max_tokens: 2000,
            custom_prompt: None,
            auto_respond: false,
            trigger_conditions: Map::new(),
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap()
}

pub async fn install_all(store: &InMemoryStore, account_id: AccountId) -> Vec<Agent> {
    let mut agents = Vec::new();
    for t in registry::all() {
        agents.push(install(store, account_id, t.id).await);
    }
    agents
}

/// A fresh open conversation with the given inbound messages
pub async fn conversation(store: &InMemoryStore, account_id: AccountId, texts: &[&str]) -> Conversation {
    conversation_aged(store, account_id, texts, Duration::minutes(5)).await
}

pub async fn conversation_aged(
    store: &InMemoryStore,
    account_id: AccountId,
    texts: &[&str],
    age: Duration,
) -> Conversation {
    let conv = store
        .create_conversation(account_id, ConversationStatus::Pending, Utc::now() - age)
        .await;
    for text in texts {
        store
            .append_message(conv.id, MessageDirection::Incoming, text)
            .await
            .unwrap();
    }
    conv
}
