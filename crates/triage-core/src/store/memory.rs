//! In-process implementation of every store trait

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use super::{AgentRepository, AssignmentRepository, ConfigStore, ConversationStore, MetricsStore};
use crate::metrics::{Metric, MetricQuery};
use crate::types::{
    AccountId, Agent, AgentId, Assignment, Conversation, ConversationId, ConversationStatus,
    ConversationTurn, Message, MessageDirection,
};

#[derive(Default)]
struct State {
    conversations: BTreeMap<ConversationId, Conversation>,
    messages: Vec<Message>,
    agents: BTreeMap<AgentId, Agent>,
    assignments: Vec<Assignment>,
    turns: Vec<ConversationTurn>,
    metrics: Vec<Metric>,
    config: HashMap<String, String>,
    next_conversation_id: i64,
    next_message_id: i64,
    next_agent_id: i64,
}

/// Thread-safe in-memory store, used by tests and embedders without a database
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    fail_metric_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("In-memory store mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Make every metric write fail, to exercise error-swallowing paths
    pub fn set_fail_metric_writes(&self, fail: bool) {
        self.fail_metric_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn create_conversation(
        &self,
        account_id: AccountId,
        status: ConversationStatus,
        created_at: DateTime<Utc>,
    ) -> Conversation {
        let mut state = self.state();
        state.next_conversation_id += 1;
        let conversation = Conversation {
            id: state.next_conversation_id,
            account_id,
            status,
            custom_attributes: Map::new(),
            created_at,
            resolved_at: None,
        };
        state
            .conversations
            .insert(conversation.id, conversation.clone());
        conversation
    }

    pub fn all_metrics(&self) -> Vec<Metric> {
        self.state().metrics.clone()
    }

    pub fn all_assignments(&self) -> Vec<Assignment> {
        self.state().assignments.clone()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        Ok(self.state().conversations.get(&id).cloned())
    }

    async fn messages(&self, id: ConversationId, limit: usize) -> Result<Vec<Message>> {
        let state = self.state();
        let all: Vec<&Message> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == id)
            .collect();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).cloned().collect())
    }

    async fn conversations_by_status(
        &self,
        account_id: AccountId,
        statuses: &[ConversationStatus],
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        let state = self.state();
        let mut found: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.account_id == account_id && statuses.contains(&c.status))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        found.truncate(limit);
        Ok(found)
    }

    async fn set_status(&self, id: ConversationId, status: ConversationStatus) -> Result<()> {
        let mut state = self.state();
        let conversation = state
            .conversations
            .get_mut(&id)
            .ok_or_else(|| anyhow!("conversation {} not found", id))?;
        conversation.status = status;
        conversation.resolved_at = if status == ConversationStatus::Resolved {
            Some(Utc::now())
        } else {
            None
        };
        Ok(())
    }

    async fn merge_custom_attributes(
        &self,
        id: ConversationId,
        attributes: Map<String, Value>,
    ) -> Result<()> {
        let mut state = self.state();
        let conversation = state
            .conversations
            .get_mut(&id)
            .ok_or_else(|| anyhow!("conversation {} not found", id))?;
        conversation.custom_attributes.extend(attributes);
        Ok(())
    }

    async fn append_message(
        &self,
        id: ConversationId,
        direction: MessageDirection,
        content: &str,
    ) -> Result<Message> {
        let mut state = self.state();
        if !state.conversations.contains_key(&id) {
            bail!("conversation {} not found", id);
        }
        state.next_message_id += 1;
        let message = Message {
            id: state.next_message_id,
            conversation_id: id,
            direction,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        state.messages.push(message.clone());
        Ok(message)
    }
}

impl ConfigStore for InMemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.state().config.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.state()
            .config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for InMemoryStore {
    async fn record(&self, metric: Metric) -> Result<()> {
        if self.fail_metric_writes.load(Ordering::SeqCst) {
            bail!("metric store unavailable");
        }
        self.state().metrics.push(metric);
        Ok(())
    }

    async fn query(&self, query: &MetricQuery) -> Result<Vec<Metric>> {
        Ok(self
            .state()
            .metrics
            .iter()
            .filter(|m| query.matches(m))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AgentRepository for InMemoryStore {
    async fn agents_for_account(&self, account_id: AccountId) -> Result<Vec<Agent>> {
        Ok(self
            .state()
            .agents
            .values()
            .filter(|a| a.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn agent(&self, id: AgentId) -> Result<Option<Agent>> {
        Ok(self.state().agents.get(&id).cloned())
    }

    async fn insert_agent(&self, mut agent: Agent) -> Result<Agent> {
        let mut state = self.state();
        state.next_agent_id += 1;
        agent.id = state.next_agent_id;
        state.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn update_agent(&self, agent: &Agent) -> Result<()> {
        let mut state = self.state();
        match state.agents.get_mut(&agent.id) {
            Some(existing) => {
                *existing = agent.clone();
                Ok(())
            }
            None => bail!("agent {} not found", agent.id),
        }
    }

    async fn delete_agent(&self, id: AgentId) -> Result<bool> {
        let mut state = self.state();
        if state.agents.remove(&id).is_none() {
            return Ok(false);
        }
        state.assignments.retain(|a| a.agent_id != id);
        state.turns.retain(|t| t.agent_id != id);
        state.metrics.retain(|m| m.agent_id != id);
        Ok(true)
    }

    async fn insert_turn(&self, turn: &ConversationTurn) -> Result<()> {
        self.state().turns.push(turn.clone());
        Ok(())
    }

    async fn turns_for_agent(&self, id: AgentId, limit: usize) -> Result<Vec<ConversationTurn>> {
        Ok(self
            .state()
            .turns
            .iter()
            .rev()
            .filter(|t| t.agent_id == id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn set_turn_feedback(
        &self,
        turn_id: &str,
        helpful: bool,
        feedback: Option<&str>,
    ) -> Result<Option<ConversationTurn>> {
        let mut state = self.state();
        Ok(state.turns.iter_mut().find(|t| t.id == turn_id).map(|t| {
            t.helpful = Some(helpful);
            t.feedback = feedback.map(str::to_string);
            t.clone()
        }))
    }
}

fn deactivate(assignment: &mut Assignment, reason: &str, at: DateTime<Utc>) {
    assignment.active = false;
    assignment.unassigned_at = Some(at);
    assignment.unassignment_reason = Some(reason.to_string());
}

#[async_trait]
impl AssignmentRepository for InMemoryStore {
    async fn replace_active(
        &self,
        assignment: Assignment,
        deactivation_reason: &str,
    ) -> Result<Vec<Assignment>> {
        let mut state = self.state();
        let at = assignment.assigned_at;
        let mut superseded = Vec::new();
        for existing in state
            .assignments
            .iter_mut()
            .filter(|a| a.conversation_id == assignment.conversation_id && a.active)
        {
            deactivate(existing, deactivation_reason, at);
            superseded.push(existing.clone());
        }
        state.assignments.push(assignment);
        Ok(superseded)
    }

    async fn deactivate_active(
        &self,
        conversation_id: ConversationId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Assignment>> {
        let mut state = self.state();
        let mut deactivated = Vec::new();
        for existing in state
            .assignments
            .iter_mut()
            .filter(|a| a.conversation_id == conversation_id && a.active)
        {
            deactivate(existing, reason, at);
            deactivated.push(existing.clone());
        }
        Ok(deactivated)
    }

    async fn active_assignment(&self, conversation_id: ConversationId) -> Result<Option<Assignment>> {
        Ok(self
            .state()
            .assignments
            .iter()
            .find(|a| a.conversation_id == conversation_id && a.active)
            .cloned())
    }

    async fn assignments_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Assignment>> {
        Ok(self
            .state()
            .assignments
            .iter()
            .filter(|a| a.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn assignments_for_agents(
        &self,
        agent_ids: &[AgentId],
        since: DateTime<Utc>,
    ) -> Result<Vec<Assignment>> {
        Ok(self
            .state()
            .assignments
            .iter()
            .filter(|a| agent_ids.contains(&a.agent_id) && a.assigned_at >= since)
            .cloned()
            .collect())
    }

    async fn active_for_agents(&self, agent_ids: &[AgentId]) -> Result<Vec<Assignment>> {
        Ok(self
            .state()
            .assignments
            .iter()
            .filter(|a| a.active && agent_ids.contains(&a.agent_id))
            .cloned()
            .collect())
    }
}
