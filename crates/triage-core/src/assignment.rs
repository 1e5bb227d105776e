//! Assignment lifecycle: unassigned -> active -> inactive
//!
//! Every mutation for a conversation runs under that conversation's lock, and
//! the deactivate-then-create step is a single `replace_active` call on the
//! repository, so a conversation never has more than one active assignment.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, RoutingError};
use crate::metrics::{Metric, MetricRecorder, MetricType};
use crate::store::{AgentRepository, AssignmentRepository, ConversationStore, Stores};
use crate::types::{
    Actor, Agent, AgentId, Assignment, ConfidenceBand, ConversationId, ConversationStatus,
    format_duration,
};

pub const SUPERSEDED_REASON: &str = "Superseded by new assignment";

type LockTable = Arc<DashMap<ConversationId, Arc<Mutex<()>>>>;

/// Proof that the holder owns the per-conversation critical section.
/// Dropping the last holder removes the conversation's entry from the table.
pub struct ConversationLock {
    conversation_id: ConversationId,
    guard: Option<OwnedMutexGuard<()>>,
    table: LockTable,
}

impl ConversationLock {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }
}

impl Drop for ConversationLock {
    fn drop(&mut self) {
        self.guard.take();
        // waiters hold a clone, so a count of one means only the table refers to it
        self.table
            .remove_if(&self.conversation_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[derive(Debug, Clone)]
pub struct AssignRequest {
    pub conversation_id: ConversationId,
    pub agent_id: AgentId,
    pub actor: Actor,
    /// Defaults depend on the actor when absent
    pub reason: Option<String>,
    pub confidence: f64,
    pub auto_assigned: bool,
    pub metadata: Map<String, Value>,
}

impl AssignRequest {
    /// Operator-initiated assignment at full confidence
    pub fn manual(conversation_id: ConversationId, agent_id: AgentId, actor: Actor) -> Self {
        Self {
            conversation_id,
            agent_id,
            actor,
            reason: None,
            confidence: 100.0,
            auto_assigned: false,
            metadata: Map::new(),
        }
    }

    /// Routing decision by the system
    pub fn automatic(
        conversation_id: ConversationId,
        agent_id: AgentId,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            agent_id,
            actor: Actor::System,
            reason: Some(reason.into()),
            confidence,
            auto_assigned: true,
            metadata: Map::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Display form of an assignment for reports
#[derive(Debug, Clone, Serialize)]
pub struct AssignmentSummary {
    pub assignment: Assignment,
    pub agent_name: Option<String>,
    pub duration: String,
    pub confidence_band: ConfidenceBand,
}

pub struct AssignmentManager {
    conversations: Arc<dyn ConversationStore>,
    agents: Arc<dyn AgentRepository>,
    assignments: Arc<dyn AssignmentRepository>,
    metrics: MetricRecorder,
    locks: LockTable,
}

impl AssignmentManager {
    pub fn new(stores: &Stores) -> Self {
        Self {
            conversations: Arc::clone(&stores.conversations),
            agents: Arc::clone(&stores.agents),
            assignments: Arc::clone(&stores.assignments),
            metrics: MetricRecorder::new(Arc::clone(&stores.metrics)),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Wait for exclusive access to one conversation's assignments
    pub async fn lock_conversation(&self, conversation_id: ConversationId) -> ConversationLock {
        let mutex = self
            .locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        ConversationLock {
            conversation_id,
            guard: Some(mutex.lock_owned().await),
            table: Arc::clone(&self.locks),
        }
    }

    pub async fn assign(&self, request: AssignRequest) -> Result<Assignment> {
        let lock = self.lock_conversation(request.conversation_id).await;
        self.assign_with(&lock, request).await
    }

    /// Assign while already holding the conversation lock
    pub async fn assign_with(
        &self,
        lock: &ConversationLock,
        request: AssignRequest,
    ) -> Result<Assignment> {
        self.replace_locked(lock, request, SUPERSEDED_REASON).await
    }

    pub async fn reassign(
        &self,
        conversation_id: ConversationId,
        new_agent_id: AgentId,
        reason: &str,
        actor: Actor,
    ) -> Result<Assignment> {
        let lock = self.lock_conversation(conversation_id).await;
        let current = self.assignments.active_assignment(conversation_id).await?;
        let agent = self.require_agent(new_agent_id).await?;

        let mut metadata = Map::new();
        metadata.insert("assignment_type".into(), json!("reassignment"));
        metadata.insert("assigned_by".into(), json!(actor.to_string()));
        if let Some(current) = &current {
            if current.agent_id == new_agent_id {
                return Err(RoutingError::InvalidRequest(format!(
                    "conversation {} is already assigned to {}",
                    conversation_id, agent.name
                )));
            }
            metadata.insert("reassigned_from".into(), json!(current.agent_id));
        }

        let request = AssignRequest {
            conversation_id,
            agent_id: new_agent_id,
            actor,
            reason: Some(format!("Reassigned: {}", reason)),
            confidence: 100.0,
            auto_assigned: false,
            metadata,
        };
        let deactivation = format!("Reassigned to {}: {}", agent.name, reason);
        self.replace_locked(&lock, request, &deactivation).await
    }

    /// Deactivate the conversation's assignment and hand it to a human.
    /// Without an active assignment this only logs.
    pub async fn unassign(
        &self,
        conversation_id: ConversationId,
        reason: &str,
        actor: Actor,
    ) -> Result<()> {
        let _lock = self.lock_conversation(conversation_id).await;
        let conversation = self
            .conversations
            .conversation(conversation_id)
            .await?
            .ok_or_else(|| RoutingError::conversation_not_found(conversation_id))?;

        let now = Utc::now();
        let deactivated = self
            .assignments
            .deactivate_active(conversation_id, reason, now)
            .await?;
        if deactivated.is_empty() {
            info!(
                "Conversation {} has no active assignment, nothing to unassign",
                conversation_id
            );
            return Ok(());
        }

        let mut attributes = Map::new();
        attributes.insert("requires_human_agent".into(), json!(true));
        attributes.insert("ai_agent_unassigned_at".into(), json!(now.to_rfc3339()));
        self.conversations
            .merge_custom_attributes(conversation_id, attributes)
            .await?;
        if conversation.status != ConversationStatus::Open {
            self.conversations
                .set_status(conversation_id, ConversationStatus::Open)
                .await?;
        }

        info!(
            "Unassigned conversation {} by {}: {}",
            conversation_id, actor, reason
        );

        let agents = self
            .agents
            .agents_for_account(conversation.account_id)
            .await?;
        for agent in agents {
            let mut metadata = Map::new();
            metadata.insert("conversation_id".into(), json!(conversation_id));
            metadata.insert("reason".into(), json!(reason));
            metadata.insert("unassigned_by".into(), json!(actor.to_string()));
            metadata.insert(
                "was_assigned".into(),
                json!(deactivated.iter().any(|a| a.agent_id == agent.id)),
            );
            self.metrics
                .record(Metric::new(agent.id, MetricType::UnassignmentEvent, 1.0).with_metadata(metadata))
                .await;
        }
        Ok(())
    }

    pub async fn active_assignment(&self, conversation_id: ConversationId) -> Result<Option<Assignment>> {
        Ok(self.assignments.active_assignment(conversation_id).await?)
    }

    /// Every assignment record for the conversation, oldest first
    pub async fn history(&self, conversation_id: ConversationId) -> Result<Vec<Assignment>> {
        Ok(self
            .assignments
            .assignments_for_conversation(conversation_id)
            .await?)
    }

    pub async fn summarize(&self, assignment: Assignment, now: DateTime<Utc>) -> Result<AssignmentSummary> {
        let agent_name = self.agents.agent(assignment.agent_id).await?.map(|a| a.name);
        Ok(AssignmentSummary {
            duration: format_duration(assignment.duration(now)),
            confidence_band: assignment.confidence_band(),
            agent_name,
            assignment,
        })
    }

    async fn require_agent(&self, agent_id: AgentId) -> Result<Agent> {
        self.agents
            .agent(agent_id)
            .await?
            .ok_or_else(|| RoutingError::agent_not_found(agent_id))
    }

    async fn replace_locked(
        &self,
        lock: &ConversationLock,
        request: AssignRequest,
        deactivation_reason: &str,
    ) -> Result<Assignment> {
        if lock.conversation_id != request.conversation_id {
            return Err(RoutingError::InvariantViolation(format!(
                "lock for conversation {} used to assign conversation {}",
                lock.conversation_id, request.conversation_id
            )));
        }

        let conversation = self
            .conversations
            .conversation(request.conversation_id)
            .await?
            .ok_or_else(|| RoutingError::conversation_not_found(request.conversation_id))?;
        let agent = self.require_agent(request.agent_id).await?;
        if agent.account_id != conversation.account_id {
            return Err(RoutingError::InvalidRequest(format!(
                "agent {} does not belong to account {}",
                agent.id, conversation.account_id
            )));
        }
        if !agent.is_active() {
            return Err(RoutingError::InvalidRequest(format!(
                "agent {} is inactive",
                agent.name
            )));
        }

        let mut metadata = request.metadata;
        let reason = match (&request.actor, request.reason) {
            (_, Some(reason)) => reason,
            (Actor::Operator(name), None) => format!("Manually assigned by {}", name),
            (Actor::System, None) => "Automatically assigned".to_string(),
        };
        if let Actor::Operator(name) = &request.actor {
            metadata.entry("assigned_by").or_insert_with(|| json!(name));
            metadata
                .entry("assignment_type")
                .or_insert_with(|| json!("manual"));
        }

        let assignment = Assignment {
            id: Uuid::new_v4().to_string(),
            conversation_id: request.conversation_id,
            agent_id: agent.id,
            confidence: request.confidence.clamp(0.0, 100.0),
            reason,
            auto_assigned: request.auto_assigned,
            active: true,
            assigned_at: Utc::now(),
            unassigned_at: None,
            unassignment_reason: None,
            metadata,
        };

        let superseded = self
            .assignments
            .replace_active(assignment.clone(), deactivation_reason)
            .await?;
        if !superseded.is_empty() {
            debug!(
                "Deactivated {} assignment(s) on conversation {}",
                superseded.len(),
                request.conversation_id
            );
        }

        if conversation.status == ConversationStatus::Pending {
            self.conversations
                .set_status(request.conversation_id, ConversationStatus::Open)
                .await?;
        }

        info!(
            "Assigned conversation {} to agent {} ({}) with confidence {:.0}",
            request.conversation_id, agent.id, agent.name, assignment.confidence
        );
        Ok(assignment)
    }
}
