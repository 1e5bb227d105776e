//! Generates agent replies through the provider gateway
//!
//! Generation failures never reach the customer as errors: the failed turn is
//! recorded and an apology is posted instead.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, json};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{Result, RoutingError};
use crate::metrics::{Metric, MetricRecorder, MetricType};
use crate::providers::{ChatMessage, CompletionOptions, ProviderGateway, TokenUsage};
use crate::store::Stores;
use crate::types::{
    Agent, AgentId, Conversation, ConversationId, ConversationTurn, Message, MessageDirection,
};

pub const FALLBACK_MESSAGE: &str = "I apologize, but I'm experiencing technical difficulties. Please try again or contact a human agent.";

/// Conversation messages sent as context with each request
pub const CONTEXT_MESSAGES: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct AgentReply {
    pub turn_id: String,
    pub content: String,
    pub success: bool,
    pub model: Option<String>,
    pub usage: TokenUsage,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FitReport {
    pub agent_id: AgentId,
    /// Share of the agent's terms found in the conversation, 0-100
    pub score: f64,
    pub matched_terms: Vec<String>,
}

pub struct AgentResponder {
    stores: Stores,
    gateway: Arc<ProviderGateway>,
    metrics: MetricRecorder,
}

impl AgentResponder {
    pub fn new(stores: Stores, gateway: Arc<ProviderGateway>) -> Self {
        let metrics = MetricRecorder::new(Arc::clone(&stores.metrics));
        Self {
            stores,
            gateway,
            metrics,
        }
    }

    /// Answer the latest inbound message of the conversation as `agent_id`
    pub async fn process_message(
        &self,
        agent_id: AgentId,
        conversation_id: ConversationId,
    ) -> Result<AgentReply> {
        let (agent, _conversation) = self.load(agent_id, conversation_id).await?;
        if !agent.is_active() {
            return Err(RoutingError::InvalidRequest(format!(
                "agent {} is inactive",
                agent.name
            )));
        }
        let history = self
            .stores
            .conversations
            .messages(conversation_id, CONTEXT_MESSAGES)
            .await?;
        let inbound = history
            .iter()
            .rev()
            .find(|m| m.direction == MessageDirection::Incoming)
            .map(|m| m.content.clone())
            .ok_or_else(|| {
                RoutingError::InvalidRequest(format!(
                    "conversation {} has no inbound message",
                    conversation_id
                ))
            })?;

        let messages = build_context(&agent, &history);
        let options = options_for(&agent);
        let provider = agent.provider.to_string();

        let started = Instant::now();
        let outcome = self
            .gateway
            .chat_completion(&messages, Some(&provider), agent.model.as_deref(), &options)
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let mut turn = ConversationTurn {
            id: Uuid::new_v4().to_string(),
            agent_id,
            conversation_id,
            inbound,
            response: None,
            provider: agent.provider,
            model: agent.model.clone(),
            usage: TokenUsage::default(),
            latency_ms,
            success: false,
            error: None,
            helpful: None,
            feedback: None,
            created_at: Utc::now(),
        };

        let reply = match outcome {
            Ok(result) => {
                let usage = result.usage.unwrap_or_default();
                turn.response = Some(result.content.clone());
                turn.model = Some(result.model.clone());
                turn.usage = usage;
                turn.success = true;
                self.stores.agents.insert_turn(&turn).await?;
                self.post(conversation_id, &result.content).await?;

                self.record(agent_id, conversation_id, MetricType::MessageProcessed, 1.0)
                    .await;
                self.record(agent_id, conversation_id, MetricType::ResponseTime, latency_ms as f64)
                    .await;
                self.record(
                    agent_id,
                    conversation_id,
                    MetricType::TokenUsage,
                    usage.total_tokens as f64,
                )
                .await;

                info!(
                    "Agent {} answered conversation {} in {}ms ({} tokens)",
                    agent_id, conversation_id, latency_ms, usage.total_tokens
                );
                AgentReply {
                    turn_id: turn.id,
                    content: result.content,
                    success: true,
                    model: Some(result.model),
                    usage,
                    latency_ms,
                    error: None,
                }
            }
            Err(e) => {
                error!(
                    "Agent {} failed to answer conversation {}: {}",
                    agent_id, conversation_id, e
                );
                turn.error = Some(e.to_string());
                turn.response = Some(FALLBACK_MESSAGE.to_string());
                self.stores.agents.insert_turn(&turn).await?;
                self.post(conversation_id, FALLBACK_MESSAGE).await?;
                self.record(agent_id, conversation_id, MetricType::ErrorCount, 1.0)
                    .await;

                AgentReply {
                    turn_id: turn.id,
                    content: FALLBACK_MESSAGE.to_string(),
                    success: false,
                    model: turn.model,
                    usage: TokenUsage::default(),
                    latency_ms,
                    error: turn.error,
                }
            }
        };
        Ok(reply)
    }

    /// A suggested reply for a human operator; nothing is posted
    pub async fn suggest_response(
        &self,
        agent_id: AgentId,
        conversation_id: ConversationId,
    ) -> Result<String> {
        let (agent, _) = self.load(agent_id, conversation_id).await?;
        let history = self
            .stores
            .conversations
            .messages(conversation_id, CONTEXT_MESSAGES)
            .await?;
        let mut messages = build_context(&agent, &history);
        messages.push(ChatMessage::user(
            "Suggest the next reply to the customer. Respond with the reply text only.",
        ));
        let provider = agent.provider.to_string();
        let result = self
            .gateway
            .chat_completion(
                &messages,
                Some(&provider),
                agent.model.as_deref(),
                &options_for(&agent),
            )
            .await?;
        Ok(result.content.trim().to_string())
    }

    /// Mark a turn helpful or not; feeds the agent's success rate
    pub async fn record_feedback(
        &self,
        turn_id: &str,
        helpful: bool,
        feedback: Option<&str>,
    ) -> Result<ConversationTurn> {
        let turn = self
            .stores
            .agents
            .set_turn_feedback(turn_id, helpful, feedback)
            .await?
            .ok_or_else(|| RoutingError::NotFound {
                kind: "turn",
                id: turn_id.to_string(),
            })?;
        let value = if helpful { 100.0 } else { 0.0 };
        self.record(turn.agent_id, turn.conversation_id, MetricType::SuccessRate, value)
            .await;
        debug!("Recorded feedback on turn {} (helpful={})", turn_id, helpful);
        Ok(turn)
    }

    /// How much of the conversation touches the agent's capabilities
    pub async fn analyze_fit(
        &self,
        agent_id: AgentId,
        conversation_id: ConversationId,
    ) -> Result<FitReport> {
        let (agent, _) = self.load(agent_id, conversation_id).await?;
        let text = self
            .stores
            .conversations
            .messages(conversation_id, CONTEXT_MESSAGES)
            .await?
            .into_iter()
            .filter(|m| m.direction == MessageDirection::Incoming)
            .map(|m| m.content.to_lowercase())
            .collect::<Vec<_>>()
            .join("\n");

        let mut terms: Vec<String> = agent
            .capabilities()
            .iter()
            .flat_map(|c| c.split('_'))
            .map(str::to_string)
            .collect();
        terms.push(agent.category.to_string());
        terms.sort();
        terms.dedup();

        let matched_terms: Vec<String> = terms
            .iter()
            .filter(|t| text.contains(t.as_str()))
            .cloned()
            .collect();
        let score = if terms.is_empty() {
            0.0
        } else {
            matched_terms.len() as f64 * 100.0 / terms.len() as f64
        };
        Ok(FitReport {
            agent_id,
            score,
            matched_terms,
        })
    }

    pub async fn turns(&self, agent_id: AgentId, limit: usize) -> Result<Vec<ConversationTurn>> {
        Ok(self.stores.agents.turns_for_agent(agent_id, limit).await?)
    }

    async fn load(
        &self,
        agent_id: AgentId,
        conversation_id: ConversationId,
    ) -> Result<(Agent, Conversation)> {
        let agent = self
            .stores
            .agents
            .agent(agent_id)
            .await?
            .ok_or_else(|| RoutingError::agent_not_found(agent_id))?;
        let conversation = self
            .stores
            .conversations
            .conversation(conversation_id)
            .await?
            .ok_or_else(|| RoutingError::conversation_not_found(conversation_id))?;
        if agent.account_id != conversation.account_id {
            return Err(RoutingError::InvalidRequest(format!(
                "agent {} does not belong to account {}",
                agent_id, conversation.account_id
            )));
        }
        Ok((agent, conversation))
    }

    async fn post(&self, conversation_id: ConversationId, content: &str) -> Result<Message> {
        Ok(self
            .stores
            .conversations
            .append_message(conversation_id, MessageDirection::Outgoing, content)
            .await?)
    }

    async fn record(
        &self,
        agent_id: AgentId,
        conversation_id: ConversationId,
        metric_type: MetricType,
        value: f64,
    ) {
        let mut metadata = Map::new();
        metadata.insert("conversation_id".into(), json!(conversation_id));
        self.metrics
            .record(Metric::new(agent_id, metric_type, value).with_metadata(metadata))
            .await;
    }
}

/// System prompt followed by the conversation, customer turns as user
fn build_context(agent: &Agent, history: &[Message]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage::system(agent.system_prompt()));
    for m in history {
        messages.push(match m.direction {
            MessageDirection::Incoming => ChatMessage::user(m.content.clone()),
            MessageDirection::Outgoing => ChatMessage::assistant(m.content.clone()),
        });
    }
    messages
}

fn options_for(agent: &Agent) -> CompletionOptions {
    CompletionOptions::default()
        .with_temperature(agent.temperature)
        .with_max_tokens(agent.max_tokens)
}
