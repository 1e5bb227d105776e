//! Operator assist helpers: thin prompts over the provider gateway

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::analyzer::Sentiment;
use crate::error::{Result, RoutingError};
use crate::providers::{ChatMessage, CompletionOptions, ProviderGateway};
use crate::store::Stores;
use crate::types::{ConversationId, MessageDirection};

/// Messages included when a whole conversation is sent to a model
const TRANSCRIPT_LIMIT: usize = 100;

pub const DEFAULT_CATEGORIES: [&str; 5] = [
    "technical_support",
    "billing",
    "general_inquiry",
    "complaint",
    "feature_request",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RephraseStyle {
    #[default]
    Professional,
    Friendly,
    Formal,
    Casual,
    Concise,
    Detailed,
}

impl RephraseStyle {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "professional" => Some(Self::Professional),
            "friendly" => Some(Self::Friendly),
            "formal" => Some(Self::Formal),
            "casual" => Some(Self::Casual),
            "concise" | "shorten" => Some(Self::Concise),
            "detailed" | "expand" => Some(Self::Detailed),
            _ => None,
        }
    }

    fn instruction(&self) -> &'static str {
        match self {
            Self::Professional => "in a professional and courteous tone",
            Self::Friendly => "in a warm and friendly tone",
            Self::Formal => "in a formal business tone",
            Self::Casual => "in a casual and conversational tone",
            Self::Concise => "more concisely while keeping the key points",
            Self::Detailed => "with more detail and explanation",
        }
    }
}

impl std::fmt::Display for RephraseStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Professional => write!(f, "professional"),
            Self::Friendly => write!(f, "friendly"),
            Self::Formal => write!(f, "formal"),
            Self::Casual => write!(f, "casual"),
            Self::Concise => write!(f, "concise"),
            Self::Detailed => write!(f, "detailed"),
        }
    }
}

/// Provider selection for assist calls; `None` uses the gateway default
#[derive(Debug, Clone, Default)]
pub struct AssistTarget {
    pub provider: Option<String>,
    pub model: Option<String>,
}

pub struct Assistant {
    stores: Stores,
    gateway: Arc<ProviderGateway>,
}

impl Assistant {
    pub fn new(stores: Stores, gateway: Arc<ProviderGateway>) -> Self {
        Self { stores, gateway }
    }

    pub async fn rephrase(
        &self,
        text: &str,
        style: RephraseStyle,
        target: &AssistTarget,
    ) -> Result<String> {
        let prompt = format!(
            "Please rephrase the following text {}. Return only the rephrased text without any additional commentary:\n\n{}",
            style.instruction(),
            text
        );
        self.complete(vec![ChatMessage::user(prompt)], target).await
    }

    /// Two or three sentences on the issue and its resolution
    pub async fn summarize(
        &self,
        conversation_id: ConversationId,
        target: &AssistTarget,
    ) -> Result<String> {
        let transcript = self.transcript(conversation_id).await?;
        let messages = vec![
            ChatMessage::system(
                "Summarize this customer support conversation in 2-3 sentences, focusing on the main issue and resolution.",
            ),
            ChatMessage::user(transcript),
        ];
        self.complete(messages, target).await
    }

    pub async fn suggest_reply(
        &self,
        conversation_id: ConversationId,
        context: Option<&str>,
        target: &AssistTarget,
    ) -> Result<String> {
        let transcript = self.transcript(conversation_id).await?;
        let mut system = String::from(
            "You are a helpful customer support assistant. Based on the conversation history, suggest a professional and helpful reply that addresses the customer's needs.",
        );
        if let Some(context) = context.map(str::trim).filter(|c| !c.is_empty()) {
            system.push_str("\n\nAdditional context: ");
            system.push_str(context);
        }
        system.push_str("\n\nProvide only the suggested reply text, without any prefixes or explanations.");

        let messages = vec![
            ChatMessage::system(system),
            ChatMessage::user(format!(
                "Based on this conversation, suggest a helpful reply:\n\n{}",
                transcript
            )),
        ];
        self.complete(messages, target).await
    }

    /// Model-judged sentiment; an unparseable answer counts as neutral
    pub async fn extract_sentiment(&self, text: &str, target: &AssistTarget) -> Result<Sentiment> {
        let prompt = format!(
            "Analyze the sentiment of this text and return only one word: positive, negative, or neutral.\n\nText: {}",
            text
        );
        let answer = self.complete(vec![ChatMessage::user(prompt)], target).await?;
        Ok(Sentiment::from_str(&answer).unwrap_or_else(|| {
            warn!("Unrecognized sentiment label from model: {:?}", answer);
            Sentiment::Neutral
        }))
    }

    /// One of `categories` (or [`DEFAULT_CATEGORIES`]), None when the model
    /// answers with anything else
    pub async fn categorize(
        &self,
        conversation_id: ConversationId,
        categories: Option<&[String]>,
        target: &AssistTarget,
    ) -> Result<Option<String>> {
        let categories: Vec<String> = match categories {
            Some(c) if !c.is_empty() => c.iter().map(|s| s.trim().to_lowercase()).collect(),
            _ => DEFAULT_CATEGORIES.iter().map(|s| s.to_string()).collect(),
        };
        let transcript = self.transcript(conversation_id).await?;
        let prompt = format!(
            "Categorize this conversation into one of these categories: {}. Return only the category name.\n\nConversation:\n{}",
            categories.join(", "),
            transcript
        );
        let answer = self
            .complete(vec![ChatMessage::user(prompt)], target)
            .await?
            .to_lowercase();
        let answer = answer.trim_matches(|c: char| !c.is_alphanumeric() && c != '_');
        Ok(categories.into_iter().find(|c| c == answer))
    }

    async fn transcript(&self, conversation_id: ConversationId) -> Result<String> {
        if self
            .stores
            .conversations
            .conversation(conversation_id)
            .await?
            .is_none()
        {
            return Err(RoutingError::conversation_not_found(conversation_id));
        }
        let messages = self
            .stores
            .conversations
            .messages(conversation_id, TRANSCRIPT_LIMIT)
            .await?;
        Ok(messages
            .iter()
            .map(|m| {
                let sender = match m.direction {
                    MessageDirection::Outgoing => "Agent",
                    MessageDirection::Incoming => "Customer",
                };
                format!("{}: {}", sender, m.content)
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn complete(&self, messages: Vec<ChatMessage>, target: &AssistTarget) -> Result<String> {
        let result = self
            .gateway
            .chat_completion(
                &messages,
                target.provider.as_deref(),
                target.model.as_deref(),
                &CompletionOptions::default(),
            )
            .await?;
        debug!(
            "Assist completion from {} ({}): {} chars",
            result.provider,
            result.model,
            result.content.len()
        );
        Ok(result.content.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatRole;
    use crate::store::memory::InMemoryStore;
    use crate::store::ConversationStore;
    use crate::testing::{self, ScriptedFactory, scripted_ok};

    fn assistant(
        store: &Arc<InMemoryStore>,
        script: Vec<&str>,
    ) -> (Assistant, Arc<ScriptedFactory>) {
        let factory = Arc::new(ScriptedFactory::with_script(
            script.into_iter().map(scripted_ok).collect(),
        ));
        let gateway = Arc::new(testing::gateway(store.clone(), factory.clone()));
        (
            Assistant::new(Stores::from_shared(store.clone()), gateway),
            factory,
        )
    }

    #[test]
    fn test_style_parsing() {
        assert_eq!(RephraseStyle::from_str("Friendly"), Some(RephraseStyle::Friendly));
        assert_eq!(RephraseStyle::from_str("shorten"), Some(RephraseStyle::Concise));
        assert_eq!(RephraseStyle::from_str("pirate"), None);
        assert_eq!(RephraseStyle::default().to_string(), "professional");
    }

    #[tokio::test]
    async fn test_rephrase_prompt_carries_style() {
        let store = Arc::new(InMemoryStore::new());
        let (assistant, factory) = assistant(&store, vec!["Hello there!\n"]);
        let out = assistant
            .rephrase("hi", RephraseStyle::Friendly, &AssistTarget::default())
            .await
            .unwrap();
        assert_eq!(out, "Hello there!");
        let sent = &factory.seen()[0];
        assert!(sent[0].content.contains("warm and friendly"));
        assert!(sent[0].content.ends_with("hi"));
    }

    #[tokio::test]
    async fn test_summarize_uses_labelled_transcript() {
        let store = Arc::new(InMemoryStore::new());
        let conv = testing::conversation(&store, 1, &["My invoice is wrong"]).await;
        store
            .append_message(conv.id, MessageDirection::Outgoing, "Let me check that")
            .await
            .unwrap();
        let (assistant, factory) = assistant(&store, vec!["Invoice dispute."]);

        let summary = assistant
            .summarize(conv.id, &AssistTarget::default())
            .await
            .unwrap();
        assert_eq!(summary, "Invoice dispute.");
        let sent = &factory.seen()[0];
        assert_eq!(sent[0].role, ChatRole::System);
        assert_eq!(
            sent[1].content,
            "Customer: My invoice is wrong\nAgent: Let me check that"
        );
    }

    #[tokio::test]
    async fn test_suggest_reply_includes_context() {
        let store = Arc::new(InMemoryStore::new());
        let conv = testing::conversation(&store, 1, &["Can I get a refund?"]).await;
        let (assistant, factory) = assistant(&store, vec!["Sure, refunds take 5 days."]);
        assistant
            .suggest_reply(conv.id, Some("Refunds take 5 business days"), &AssistTarget::default())
            .await
            .unwrap();
        assert!(factory.seen()[0][0]
            .content
            .contains("Additional context: Refunds take 5 business days"));
    }

    #[tokio::test]
    async fn test_sentiment_parsing_is_lenient() {
        let store = Arc::new(InMemoryStore::new());
        let (assistant, _) = assistant(&store, vec!["Negative.", "who knows"]);
        let target = AssistTarget::default();
        assert_eq!(
            assistant.extract_sentiment("awful", &target).await.unwrap(),
            Sentiment::Negative
        );
        assert_eq!(
            assistant.extract_sentiment("hmm", &target).await.unwrap(),
            Sentiment::Neutral
        );
    }

    #[tokio::test]
    async fn test_categorize_accepts_only_known_categories() {
        let store = Arc::new(InMemoryStore::new());
        let conv = testing::conversation(&store, 1, &["I was double charged"]).await;
        let (assistant, _) = assistant(&store, vec!["Billing", "weather"]);
        let target = AssistTarget::default();
        assert_eq!(
            assistant.categorize(conv.id, None, &target).await.unwrap(),
            Some("billing".to_string())
        );
        assert_eq!(assistant.categorize(conv.id, None, &target).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_conversation() {
        let store = Arc::new(InMemoryStore::new());
        let (assistant, _) = assistant(&store, vec![]);
        let err = assistant
            .summarize(404, &AssistTarget::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
