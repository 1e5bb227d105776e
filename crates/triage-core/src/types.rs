//! Shared types for triage-core

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::providers::types::{ProviderKind, TokenUsage};
use crate::registry::{self, AgentTemplate, PricingTier};

pub type AccountId = i64;
pub type ConversationId = i64;
pub type AgentId = i64;

/// Support category shared by the analyzer, the registry and installed agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Technical,
    Billing,
    Sales,
    Onboarding,
    /// Escalations; installed escalation agents carry this category
    Management,
    Multilingual,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Self::Technical,
        Self::Billing,
        Self::Sales,
        Self::Onboarding,
        Self::Management,
        Self::Multilingual,
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "technical" => Some(Self::Technical),
            "billing" => Some(Self::Billing),
            "sales" => Some(Self::Sales),
            "onboarding" => Some(Self::Onboarding),
            "management" | "escalation" => Some(Self::Management),
            "multilingual" | "language" => Some(Self::Multilingual),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Technical => write!(f, "technical"),
            Self::Billing => write!(f, "billing"),
            Self::Sales => write!(f, "sales"),
            Self::Onboarding => write!(f, "onboarding"),
            Self::Management => write!(f, "management"),
            Self::Multilingual => write!(f, "multilingual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Open,
    Pending,
    Snoozed,
    Resolved,
}

impl ConversationStatus {
    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "snoozed" => Self::Snoozed,
            "resolved" => Self::Resolved,
            _ => Self::Open,
        }
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Pending => write!(f, "pending"),
            Self::Snoozed => write!(f, "snoozed"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// A customer conversation as seen by the router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub account_id: AccountId,
    pub status: ConversationStatus,
    #[serde(default)]
    pub custom_attributes: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    pub fn is_resolved(&self) -> bool {
        self.status == ConversationStatus::Resolved
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    /// From the customer
    Incoming,
    /// From an agent (human or automated)
    Outgoing,
}

impl std::fmt::Display for MessageDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Incoming => write!(f, "incoming"),
            Self::Outgoing => write!(f, "outgoing"),
        }
    }
}

impl MessageDirection {
    pub fn from_str(s: &str) -> Self {
        match s {
            "outgoing" => Self::Outgoing,
            _ => Self::Incoming,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: ConversationId,
    pub direction: MessageDirection,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Inactive,
}

impl AgentStatus {
    pub fn from_str(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            _ => Self::Inactive,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

/// An automated handler installed for an account from a registry template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub account_id: AccountId,
    pub template_id: String,
    pub name: String,
    pub category: Category,
    pub status: AgentStatus,
    pub provider: ProviderKind,
    /// None means the provider's configured or default model
    #[serde(default)]
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(default)]
    pub custom_prompt: Option<String>,
    #[serde(default)]
    pub auto_respond: bool,
    #[serde(default)]
    pub trigger_conditions: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    pub fn template(&self) -> Option<&'static AgentTemplate> {
        registry::get(&self.template_id)
    }

    pub fn capabilities(&self) -> &'static [&'static str] {
        self.template().map(|t| t.capabilities).unwrap_or(&[])
    }

    pub fn icon(&self) -> &'static str {
        self.template().map(|t| t.icon).unwrap_or("🤖")
    }

    pub fn pricing(&self) -> PricingTier {
        self.template().map(|t| t.pricing).unwrap_or(PricingTier::Free)
    }

    pub fn recommended_providers(&self) -> &'static [ProviderKind] {
        self.template().map(|t| t.recommended_providers).unwrap_or(&[])
    }

    /// Categories this agent serves: its own plus any the template declares as related
    pub fn served_categories(&self) -> Vec<Category> {
        let mut served = vec![self.category];
        if let Some(template) = self.template() {
            for c in template.related_categories {
                if !served.contains(c) {
                    served.push(*c);
                }
            }
        }
        served
    }

    pub fn system_prompt(&self) -> String {
        if let Some(prompt) = self.custom_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            return prompt.to_string();
        }
        match self.template() {
            Some(t) => t.system_prompt.to_string(),
            None => format!("You are {}, a helpful customer support assistant.", self.name),
        }
    }
}

/// Who initiated an assignment change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum Actor {
    System,
    Operator(String),
}

impl Actor {
    pub fn operator(name: impl Into<String>) -> Self {
        Self::Operator(name.into())
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Operator(name) => write!(f, "{}", name),
        }
    }
}

/// Links one conversation to one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub conversation_id: ConversationId,
    pub agent_id: AgentId,
    /// 0-100
    pub confidence: f64,
    pub reason: String,
    pub auto_assigned: bool,
    pub active: bool,
    pub assigned_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unassigned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unassignment_reason: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Assignment {
    /// Elapsed time until unassignment, or until `now` while still active
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        self.unassigned_at.unwrap_or(now) - self.assigned_at
    }

    pub fn confidence_band(&self) -> ConfidenceBand {
        ConfidenceBand::from_score(self.confidence)
    }
}

/// Reporting bucket for assignment confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

impl ConfidenceBand {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Self::High
        } else if score >= 50.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl std::fmt::Display for ConfidenceBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Format a duration as "Xh Ym", or "Ym" under an hour
pub fn format_duration(d: Duration) -> String {
    let total_minutes = d.num_minutes().max(0);
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

/// One request/response exchange between an agent and a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: String,
    pub agent_id: AgentId,
    pub conversation_id: ConversationId,
    pub inbound: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub provider: ProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
    pub latency_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub helpful: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
}
