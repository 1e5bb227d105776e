//! Routing orchestrator
//!
//! Applies the auto-route gate, runs analysis and matching, hands the top
//! candidate to the assignment manager, then records the decision. Also serves
//! the analytics and "needs attention" reports.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, json};
use tracing::{debug, info, warn};

use crate::analyzer::{AnalysisResult, ContentAnalyzer};
use crate::assignment::{AssignRequest, AssignmentManager};
use crate::config::RoutingConfig;
use crate::error::{Result, RoutingError};
use crate::matching::{AgentMatch, MatchingEngine, load_candidates};
use crate::metrics::{Metric, MetricRecorder, MetricType};
use crate::store::Stores;
use crate::types::{
    AccountId, Actor, Agent, AgentId, Assignment, Category, ConfidenceBand, Conversation,
    ConversationId, ConversationStatus, MessageDirection, format_duration,
};

/// Messages fetched per conversation before filtering to inbound
const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicy {
    #[serde(default = "default_true")]
    pub auto_routing_enabled: bool,
    /// Conversations older than this are not auto-routed
    #[serde(default = "default_recency_window_minutes")]
    pub recency_window_minutes: i64,
    /// Lowercase phrases that mean the customer wants a person
    #[serde(default = "default_human_request_phrases")]
    pub human_request_phrases: Vec<String>,
    #[serde(default = "default_low_confidence_ceiling")]
    pub low_confidence_ceiling: f64,
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: i64,
    #[serde(default = "default_unassigned_limit")]
    pub unassigned_limit: usize,
    #[serde(default = "default_low_confidence_limit")]
    pub low_confidence_limit: usize,
    #[serde(default = "default_long_unresolved_limit")]
    pub long_unresolved_limit: usize,
    /// Open conversations examined per attention query
    #[serde(default = "default_attention_scan_limit")]
    pub attention_scan_limit: usize,
    #[serde(default = "default_bulk_concurrency")]
    pub bulk_concurrency: usize,
    #[serde(default = "default_top_agents")]
    pub top_agents: usize,
}

fn default_true() -> bool {
    true
}
fn default_recency_window_minutes() -> i64 {
    60
}
fn default_human_request_phrases() -> Vec<String> {
    [
        "speak to a human",
        "talk to a human",
        "human agent",
        "real person",
        "real agent",
        "live agent",
        "speak to someone",
        "talk to someone",
        "not a bot",
        "representative",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_low_confidence_ceiling() -> f64 {
    40.0
}
fn default_stale_after_hours() -> i64 {
    24
}
fn default_unassigned_limit() -> usize {
    50
}
fn default_low_confidence_limit() -> usize {
    20
}
fn default_long_unresolved_limit() -> usize {
    20
}
fn default_attention_scan_limit() -> usize {
    500
}
fn default_bulk_concurrency() -> usize {
    4
}
fn default_top_agents() -> usize {
    10
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            auto_routing_enabled: true,
            recency_window_minutes: default_recency_window_minutes(),
            human_request_phrases: default_human_request_phrases(),
            low_confidence_ceiling: default_low_confidence_ceiling(),
            stale_after_hours: default_stale_after_hours(),
            unassigned_limit: default_unassigned_limit(),
            low_confidence_limit: default_low_confidence_limit(),
            long_unresolved_limit: default_long_unresolved_limit(),
            attention_scan_limit: default_attention_scan_limit(),
            bulk_concurrency: default_bulk_concurrency(),
            top_agents: default_top_agents(),
        }
    }
}

/// Why the auto-route gate declined a conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    AutoRoutingDisabled,
    AlreadyAssigned { agent_id: AgentId },
    TooOld { age_minutes: i64 },
    HumanRequested { phrase: String },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AutoRoutingDisabled => write!(f, "Auto-routing is disabled"),
            Self::AlreadyAssigned { agent_id } => {
                write!(f, "Already assigned to agent {}", agent_id)
            }
            Self::TooOld { age_minutes } => {
                write!(f, "Conversation is {} minutes old", age_minutes)
            }
            Self::HumanRequested { phrase } => {
                write!(f, "Customer asked for a human (\"{}\")", phrase)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FallbackOption {
    pub action: &'static str,
    pub description: &'static str,
}

pub fn fallback_options() -> Vec<FallbackOption> {
    vec![
        FallbackOption {
            action: "human_agent",
            description: "Route to an available human agent",
        },
        FallbackOption {
            action: "general_support",
            description: "Place in the general support queue",
        },
        FallbackOption {
            action: "escalation",
            description: "Escalate to a supervisor",
        },
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentRef {
    pub id: AgentId,
    pub name: String,
    pub category: Category,
}

impl From<&Agent> for AgentRef {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id,
            name: agent.name.clone(),
            category: agent.category,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateSummary {
    pub agent: AgentRef,
    pub score: f64,
    pub reasons: Vec<String>,
}

impl From<&AgentMatch> for CandidateSummary {
    fn from(m: &AgentMatch) -> Self {
        Self {
            agent: AgentRef::from(&m.agent),
            score: m.score,
            reasons: m.reasons.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingResult {
    pub conversation_id: ConversationId,
    pub routed: bool,
    /// Recommendation only; nothing was assigned
    pub dry_run: bool,
    pub agent: Option<AgentRef>,
    pub assignment_id: Option<String>,
    pub confidence: Option<f64>,
    pub reasons: Vec<String>,
    pub analysis: Option<AnalysisResult>,
    pub candidates: Vec<CandidateSummary>,
    /// Suggestions for the caller when nothing was routed
    pub fallback: Vec<FallbackOption>,
    pub skipped: Option<SkipReason>,
}

impl RoutingResult {
    fn empty(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            routed: false,
            dry_run: false,
            agent: None,
            assignment_id: None,
            confidence: None,
            reasons: Vec::new(),
            analysis: None,
            candidates: Vec::new(),
            fallback: Vec::new(),
            skipped: None,
        }
    }

    fn skipped(conversation_id: ConversationId, reason: SkipReason) -> Self {
        Self {
            reasons: vec![reason.to_string()],
            skipped: Some(reason),
            ..Self::empty(conversation_id)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkRouteItem {
    pub conversation_id: ConversationId,
    pub routed: bool,
    pub agent_id: Option<AgentId>,
    pub agent_name: Option<String>,
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutingOverview {
    pub total_assignments: usize,
    pub auto_assignments: usize,
    pub manual_assignments: usize,
    pub active_assignments: usize,
    pub average_confidence: f64,
    /// Share of assignments at high confidence, percent
    pub high_confidence_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentPerformance {
    pub agent: AgentRef,
    pub assignments: usize,
    pub active: usize,
    pub auto_assigned: usize,
    pub manual: usize,
    pub average_confidence: f64,
    pub average_duration: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub assignments: usize,
    pub auto_assignments: usize,
    pub average_confidence: f64,
}

/// Outcome figures. Resolution is a weak proxy: a conversation can be
/// resolved without the agent's help.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SuccessMetrics {
    /// Percent of assignments whose conversation reached resolved
    pub resolution_rate: f64,
    pub average_resolution_minutes: Option<f64>,
    /// Resolution rate among high-confidence assignments
    pub high_confidence_success_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfidenceDistribution {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MostAssigned {
    pub agent: AgentRef,
    pub assignments: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingAnalytics {
    pub since: DateTime<Utc>,
    pub overview: RoutingOverview,
    pub per_agent: Vec<AgentPerformance>,
    pub trend: Vec<TrendPoint>,
    pub success_metrics: SuccessMetrics,
    pub most_assigned: Option<MostAssigned>,
    pub confidence_distribution: ConfidenceDistribution,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttentionItem {
    pub conversation: Conversation,
    pub assignment: Assignment,
    pub assigned_for: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NeedsAttention {
    pub unassigned: Vec<Conversation>,
    pub low_confidence: Vec<AttentionItem>,
    pub long_unresolved: Vec<AttentionItem>,
}

pub struct Router {
    stores: Stores,
    analyzer: ContentAnalyzer,
    engine: MatchingEngine,
    assignments: Arc<AssignmentManager>,
    metrics: MetricRecorder,
    policy: RoutingPolicy,
}

impl Router {
    pub fn new(stores: Stores, config: &RoutingConfig) -> Self {
        let assignments = Arc::new(AssignmentManager::new(&stores));
        let metrics = MetricRecorder::new(Arc::clone(&stores.metrics));
        Self {
            analyzer: ContentAnalyzer::new(config.analyzer.clone()),
            engine: MatchingEngine::new(config.scoring.clone()),
            policy: config.policy.clone(),
            assignments,
            metrics,
            stores,
        }
    }

    pub fn assignments(&self) -> &Arc<AssignmentManager> {
        &self.assignments
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    pub async fn assign(
        &self,
        conversation_id: ConversationId,
        agent_id: AgentId,
        actor: Actor,
    ) -> Result<Assignment> {
        self.assignments
            .assign(AssignRequest::manual(conversation_id, agent_id, actor))
            .await
    }

    pub async fn reassign(
        &self,
        conversation_id: ConversationId,
        agent_id: AgentId,
        reason: &str,
        actor: Actor,
    ) -> Result<Assignment> {
        self.assignments
            .reassign(conversation_id, agent_id, reason, actor)
            .await
    }

    pub async fn unassign(
        &self,
        conversation_id: ConversationId,
        reason: &str,
        actor: Actor,
    ) -> Result<()> {
        self.assignments
            .unassign(conversation_id, reason, actor)
            .await
    }

    /// Route one conversation. Without `force`, the auto-route gate applies.
    pub async fn route(&self, conversation_id: ConversationId, force: bool) -> Result<RoutingResult> {
        let conversation = self.require_conversation(conversation_id).await?;
        let texts = self.inbound_texts(conversation_id).await?;

        let lock = self.assignments.lock_conversation(conversation_id).await;
        if !force {
            if let Some(reason) = self.gate(&conversation, &texts).await? {
                debug!("Skipping auto-route of conversation {}: {}", conversation_id, reason);
                return Ok(RoutingResult::skipped(conversation_id, reason));
            }
        }

        let now = Utc::now();
        let analysis = self.analyzer.analyze(&texts, Some(conversation.age(now)));
        let ranked = self.rank(conversation.account_id, &analysis).await?;

        if ranked.is_empty() {
            let mut result = self.unrouted(conversation_id, analysis, ranked);
            result.fallback = fallback_options();
            info!(
                "Conversation {} not routed: {}",
                conversation_id,
                result.reasons.join("; ")
            );
            return Ok(result);
        }
        let top = &ranked[0];

        let mut metadata = Map::new();
        metadata.insert("score".into(), json!(top.score));
        metadata.insert("breakdown".into(), json!(top.breakdown));
        metadata.insert("categories".into(), json!(analysis.categories));
        metadata.insert("urgency".into(), json!(analysis.urgency));
        metadata.insert("language".into(), json!(analysis.language));
        metadata.insert("forced".into(), json!(force));
        let reason = if top.reasons.is_empty() {
            "Best available match".to_string()
        } else {
            top.reasons.join("; ")
        };
        let request = AssignRequest::automatic(conversation_id, top.agent.id, top.confidence(), reason)
            .with_metadata(metadata);
        let assignment = self.assignments.assign_with(&lock, request).await?;
        drop(lock);

        info!(
            "Routed conversation {} to {} (confidence {:.0}): {}",
            conversation_id,
            top.agent.name,
            assignment.confidence,
            top.reasons.join("; ")
        );

        let mut decision = Map::new();
        decision.insert("conversation_id".into(), json!(conversation_id));
        decision.insert("assignment_id".into(), json!(assignment.id));
        decision.insert("score".into(), json!(top.score));
        decision.insert("categories".into(), json!(analysis.categories));
        decision.insert("urgency".into(), json!(analysis.urgency));
        decision.insert("forced".into(), json!(force));
        self.metrics
            .record(
                Metric::new(top.agent.id, MetricType::RoutingDecision, assignment.confidence)
                    .with_metadata(decision),
            )
            .await;

        if top.agent.auto_respond {
            self.post_greeting(conversation_id, &top.agent).await;
        }

        Ok(RoutingResult {
            conversation_id,
            routed: true,
            dry_run: false,
            agent: Some(AgentRef::from(&top.agent)),
            assignment_id: Some(assignment.id),
            confidence: Some(assignment.confidence),
            reasons: top.reasons.clone(),
            candidates: ranked.iter().map(CandidateSummary::from).collect(),
            analysis: Some(analysis),
            fallback: Vec::new(),
            skipped: None,
        })
    }

    /// Analysis and recommendation without assigning anything
    pub async fn analyze_and_route(&self, conversation_id: ConversationId) -> Result<RoutingResult> {
        let conversation = self.require_conversation(conversation_id).await?;
        let texts = self.inbound_texts(conversation_id).await?;
        let analysis = self.analyzer.analyze(&texts, Some(conversation.age(Utc::now())));
        let ranked = self.rank(conversation.account_id, &analysis).await?;

        if ranked.is_empty() {
            let mut result = self.unrouted(conversation_id, analysis, ranked);
            result.dry_run = true;
            result.fallback = fallback_options();
            return Ok(result);
        }
        let top = &ranked[0];
        Ok(RoutingResult {
            conversation_id,
            routed: false,
            dry_run: true,
            agent: Some(AgentRef::from(&top.agent)),
            assignment_id: None,
            confidence: Some(top.confidence()),
            reasons: top.reasons.clone(),
            candidates: ranked.iter().map(CandidateSummary::from).collect(),
            analysis: Some(analysis),
            fallback: Vec::new(),
            skipped: None,
        })
    }

    /// Route each conversation independently; one failure does not stop the rest.
    /// The auto-route gate applies to every conversation unless `force` is set.
    pub async fn bulk_route(
        &self,
        conversation_ids: &[ConversationId],
        force: bool,
    ) -> Vec<BulkRouteItem> {
        let concurrency = self.policy.bulk_concurrency.max(1);
        let items: Vec<BulkRouteItem> = stream::iter(conversation_ids.iter().copied())
            .map(|id| async move {
                match self.route(id, force).await {
                    Ok(result) => BulkRouteItem {
                        conversation_id: id,
                        routed: result.routed,
                        agent_id: result.agent.as_ref().map(|a| a.id),
                        agent_name: result.agent.map(|a| a.name),
                        confidence: result.confidence,
                        skipped: result.skipped,
                        error: None,
                    },
                    Err(e) => {
                        warn!("Bulk routing failed for conversation {}: {}", id, e);
                        BulkRouteItem {
                            conversation_id: id,
                            routed: false,
                            agent_id: None,
                            agent_name: None,
                            confidence: None,
                            skipped: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            })
            .buffered(concurrency)
            .collect()
            .await;

        let routed = items.iter().filter(|i| i.routed).count();
        info!("Bulk routed {}/{} conversations", routed, items.len());
        items
    }

    pub async fn routing_analytics(
        &self,
        account_id: AccountId,
        window: Duration,
    ) -> Result<RoutingAnalytics> {
        let now = Utc::now();
        let since = now - window;
        let agents = self.stores.agents.agents_for_account(account_id).await?;
        let ids: Vec<AgentId> = agents.iter().map(|a| a.id).collect();
        let assignments = self
            .stores
            .assignments
            .assignments_for_agents(&ids, since)
            .await?;

        let total = assignments.len();
        let auto = assignments.iter().filter(|a| a.auto_assigned).count();
        let mut distribution = ConfidenceDistribution::default();
        for a in &assignments {
            match a.confidence_band() {
                ConfidenceBand::High => distribution.high += 1,
                ConfidenceBand::Medium => distribution.medium += 1,
                ConfidenceBand::Low => distribution.low += 1,
            }
        }
        let overview = RoutingOverview {
            total_assignments: total,
            auto_assignments: auto,
            manual_assignments: total - auto,
            active_assignments: assignments.iter().filter(|a| a.active).count(),
            average_confidence: mean(assignments.iter().map(|a| a.confidence)).unwrap_or(0.0),
            high_confidence_rate: percent(distribution.high, total),
        };

        let mut per_agent: Vec<AgentPerformance> = agents
            .iter()
            .map(|agent| {
                let mine: Vec<&Assignment> =
                    assignments.iter().filter(|a| a.agent_id == agent.id).collect();
                let auto = mine.iter().filter(|a| a.auto_assigned).count();
                let average_minutes =
                    mean(mine.iter().map(|a| a.duration(now).num_minutes() as f64)).unwrap_or(0.0);
                AgentPerformance {
                    agent: AgentRef::from(agent),
                    assignments: mine.len(),
                    active: mine.iter().filter(|a| a.active).count(),
                    auto_assigned: auto,
                    manual: mine.len() - auto,
                    average_confidence: mean(mine.iter().map(|a| a.confidence)).unwrap_or(0.0),
                    average_duration: format_duration(Duration::minutes(average_minutes as i64)),
                }
            })
            .collect();
        per_agent.sort_by(|a, b| b.assignments.cmp(&a.assignments).then(a.agent.id.cmp(&b.agent.id)));

        let most_assigned = per_agent
            .first()
            .filter(|p| p.assignments > 0)
            .map(|p| MostAssigned {
                agent: p.agent.clone(),
                assignments: p.assignments,
            });
        per_agent.truncate(self.policy.top_agents);

        let mut days: BTreeMap<NaiveDate, Vec<&Assignment>> = BTreeMap::new();
        for a in &assignments {
            days.entry(a.assigned_at.date_naive()).or_default().push(a);
        }
        let trend = days
            .into_iter()
            .map(|(date, day)| TrendPoint {
                date,
                assignments: day.len(),
                auto_assignments: day.iter().filter(|a| a.auto_assigned).count(),
                average_confidence: mean(day.iter().map(|a| a.confidence)).unwrap_or(0.0),
            })
            .collect();

        let success_metrics = self.success_metrics(&assignments).await?;

        Ok(RoutingAnalytics {
            since,
            overview,
            per_agent,
            trend,
            success_metrics,
            most_assigned,
            confidence_distribution: distribution,
        })
    }

    pub async fn needs_attention(&self, account_id: AccountId) -> Result<NeedsAttention> {
        let now = Utc::now();
        let conversations = self
            .stores
            .conversations
            .conversations_by_status(
                account_id,
                &[
                    ConversationStatus::Open,
                    ConversationStatus::Pending,
                    ConversationStatus::Snoozed,
                ],
                self.policy.attention_scan_limit,
            )
            .await?;

        let stale = Duration::hours(self.policy.stale_after_hours);
        let mut report = NeedsAttention::default();
        for conversation in conversations {
            let history = self
                .stores
                .assignments
                .assignments_for_conversation(conversation.id)
                .await?;
            if history.is_empty() {
                if report.unassigned.len() < self.policy.unassigned_limit {
                    report.unassigned.push(conversation);
                }
                continue;
            }
            let Some(active) = history.into_iter().find(|a| a.active) else {
                continue;
            };

            let low = active.confidence < self.policy.low_confidence_ceiling;
            let long = !conversation.is_resolved() && now - active.assigned_at > stale;
            let item = AttentionItem {
                assigned_for: format_duration(active.duration(now)),
                conversation,
                assignment: active,
            };
            if low && long {
                if report.low_confidence.len() < self.policy.low_confidence_limit {
                    report.low_confidence.push(item.clone());
                }
                if report.long_unresolved.len() < self.policy.long_unresolved_limit {
                    report.long_unresolved.push(item);
                }
            } else if low {
                if report.low_confidence.len() < self.policy.low_confidence_limit {
                    report.low_confidence.push(item);
                }
            } else if long && report.long_unresolved.len() < self.policy.long_unresolved_limit {
                report.long_unresolved.push(item);
            }
        }
        Ok(report)
    }

    async fn gate(&self, conversation: &Conversation, texts: &[String]) -> Result<Option<SkipReason>> {
        if !self.policy.auto_routing_enabled {
            return Ok(Some(SkipReason::AutoRoutingDisabled));
        }
        if let Some(active) = self
            .stores
            .assignments
            .active_assignment(conversation.id)
            .await?
        {
            return Ok(Some(SkipReason::AlreadyAssigned {
                agent_id: active.agent_id,
            }));
        }
        let age = conversation.age(Utc::now());
        if age > Duration::minutes(self.policy.recency_window_minutes) {
            return Ok(Some(SkipReason::TooOld {
                age_minutes: age.num_minutes(),
            }));
        }
        if let Some(phrase) = self.human_request(texts) {
            return Ok(Some(SkipReason::HumanRequested { phrase }));
        }
        Ok(None)
    }

    fn human_request(&self, texts: &[String]) -> Option<String> {
        let text = texts.join("\n").to_lowercase();
        self.policy
            .human_request_phrases
            .iter()
            .find(|p| text.contains(p.to_lowercase().as_str()))
            .cloned()
    }

    async fn require_conversation(&self, conversation_id: ConversationId) -> Result<Conversation> {
        self.stores
            .conversations
            .conversation(conversation_id)
            .await?
            .ok_or_else(|| RoutingError::conversation_not_found(conversation_id))
    }

    async fn inbound_texts(&self, conversation_id: ConversationId) -> Result<Vec<String>> {
        Ok(self
            .stores
            .conversations
            .messages(conversation_id, HISTORY_LIMIT)
            .await?
            .into_iter()
            .filter(|m| m.direction == MessageDirection::Incoming)
            .map(|m| m.content)
            .collect())
    }

    async fn rank(&self, account_id: AccountId, analysis: &AnalysisResult) -> Result<Vec<AgentMatch>> {
        let agents: Vec<Agent> = self
            .stores
            .agents
            .agents_for_account(account_id)
            .await?
            .into_iter()
            .filter(|a| a.is_active())
            .collect();
        if agents.is_empty() {
            return Ok(Vec::new());
        }
        let candidates = load_candidates(
            agents,
            self.stores.assignments.as_ref(),
            &self.metrics,
            self.engine.config().performance_window_days,
        )
        .await?;
        Ok(self.engine.rank(analysis, &candidates))
    }

    fn unrouted(
        &self,
        conversation_id: ConversationId,
        analysis: AnalysisResult,
        ranked: Vec<AgentMatch>,
    ) -> RoutingResult {
        let threshold = self.engine.config().min_threshold;
        let reasons = if ranked.is_empty() {
            vec![format!("No agent scored at or above the threshold of {:.0}", threshold)]
        } else {
            Vec::new()
        };
        RoutingResult {
            reasons,
            candidates: ranked.iter().map(CandidateSummary::from).collect(),
            analysis: Some(analysis),
            ..RoutingResult::empty(conversation_id)
        }
    }

    async fn post_greeting(&self, conversation_id: ConversationId, agent: &Agent) {
        let greeting = agent
            .template()
            .and_then(|t| t.greeting())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!("Hello! I'm {}. How can I help you today?", agent.name)
            });
        if let Err(e) = self
            .stores
            .conversations
            .append_message(conversation_id, MessageDirection::Outgoing, &greeting)
            .await
        {
            warn!(
                "Failed to post greeting from agent {} on conversation {}: {}",
                agent.id, conversation_id, e
            );
        }
    }

    async fn success_metrics(&self, assignments: &[Assignment]) -> Result<SuccessMetrics> {
        let conversation_ids: HashSet<ConversationId> =
            assignments.iter().map(|a| a.conversation_id).collect();
        let mut conversations: HashMap<ConversationId, Conversation> = HashMap::new();
        for id in conversation_ids {
            if let Some(c) = self.stores.conversations.conversation(id).await? {
                conversations.insert(id, c);
            }
        }

        let resolved_at = |a: &Assignment| {
            conversations
                .get(&a.conversation_id)
                .filter(|c| c.is_resolved())
                .and_then(|c| c.resolved_at)
        };
        let resolved: Vec<(&Assignment, DateTime<Utc>)> = assignments
            .iter()
            .filter_map(|a| resolved_at(a).map(|at| (a, at)))
            .collect();
        let high: Vec<&Assignment> = assignments
            .iter()
            .filter(|a| a.confidence_band() == ConfidenceBand::High)
            .collect();
        let high_resolved = high.iter().filter(|a| resolved_at(**a).is_some()).count();

        Ok(SuccessMetrics {
            resolution_rate: percent(resolved.len(), assignments.len()),
            average_resolution_minutes: mean(
                resolved
                    .iter()
                    .map(|(a, at)| (*at - a.assigned_at).num_minutes().max(0) as f64),
            ),
            high_confidence_success_rate: percent(high_resolved, high.len()),
        })
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 { None } else { Some(sum / count as f64) }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}
