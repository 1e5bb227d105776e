//! Collaborator interfaces the router depends on
//!
//! The conversation store, config store and metrics store are owned by the
//! surrounding application; agents, assignments and turns are owned by the
//! router. `memory` holds an in-process implementation of all of them.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::metrics::{Metric, MetricQuery};
use crate::types::{
    AccountId, Agent, AgentId, Assignment, Conversation, ConversationId, ConversationStatus,
    ConversationTurn, Message, MessageDirection,
};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>>;

    /// The most recent `limit` messages, oldest first
    async fn messages(&self, id: ConversationId, limit: usize) -> Result<Vec<Message>>;

    /// Newest first
    async fn conversations_by_status(
        &self,
        account_id: AccountId,
        statuses: &[ConversationStatus],
        limit: usize,
    ) -> Result<Vec<Conversation>>;

    /// Moving to `Resolved` stamps `resolved_at`; any other status clears it
    async fn set_status(&self, id: ConversationId, status: ConversationStatus) -> Result<()>;

    async fn merge_custom_attributes(
        &self,
        id: ConversationId,
        attributes: Map<String, Value>,
    ) -> Result<()>;

    async fn append_message(
        &self,
        id: ConversationId,
        direction: MessageDirection,
        content: &str,
    ) -> Result<Message>;
}

/// String settings by name
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Append-only metric log
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn record(&self, metric: Metric) -> Result<()>;
    async fn query(&self, query: &MetricQuery) -> Result<Vec<Metric>>;
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn agents_for_account(&self, account_id: AccountId) -> Result<Vec<Agent>>;
    async fn agent(&self, id: AgentId) -> Result<Option<Agent>>;
    /// Stores a new agent; the `id` field of the argument is ignored
    async fn insert_agent(&self, agent: Agent) -> Result<Agent>;
    async fn update_agent(&self, agent: &Agent) -> Result<()>;
    /// Removes the agent with its assignments, turns and metrics
    async fn delete_agent(&self, id: AgentId) -> Result<bool>;

    async fn insert_turn(&self, turn: &ConversationTurn) -> Result<()>;
    /// Newest first
    async fn turns_for_agent(&self, id: AgentId, limit: usize) -> Result<Vec<ConversationTurn>>;
    async fn set_turn_feedback(
        &self,
        turn_id: &str,
        helpful: bool,
        feedback: Option<&str>,
    ) -> Result<Option<ConversationTurn>>;
}

#[async_trait]
pub trait AssignmentRepository: Send + Sync {
    /// Deactivate every active assignment of the conversation and insert
    /// `assignment` as a single unit of work; returns the superseded records
    async fn replace_active(
        &self,
        assignment: Assignment,
        deactivation_reason: &str,
    ) -> Result<Vec<Assignment>>;

    async fn deactivate_active(
        &self,
        conversation_id: ConversationId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Assignment>>;

    async fn active_assignment(&self, conversation_id: ConversationId) -> Result<Option<Assignment>>;

    /// Oldest first
    async fn assignments_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Assignment>>;

    /// Assignments created at or after `since`, oldest first
    async fn assignments_for_agents(
        &self,
        agent_ids: &[AgentId],
        since: DateTime<Utc>,
    ) -> Result<Vec<Assignment>>;

    async fn active_for_agents(&self, agent_ids: &[AgentId]) -> Result<Vec<Assignment>>;
}

/// Handles to every collaborator, cloned into each service
#[derive(Clone)]
pub struct Stores {
    pub conversations: Arc<dyn ConversationStore>,
    pub agents: Arc<dyn AgentRepository>,
    pub assignments: Arc<dyn AssignmentRepository>,
    pub metrics: Arc<dyn MetricsStore>,
    pub config: Arc<dyn ConfigStore>,
}

impl Stores {
    /// One backend implementing every collaborator
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: ConversationStore
            + AgentRepository
            + AssignmentRepository
            + MetricsStore
            + ConfigStore
            + 'static,
    {
        Self {
            conversations: store.clone(),
            agents: store.clone(),
            assignments: store.clone(),
            metrics: store.clone(),
            config: store,
        }
    }
}
