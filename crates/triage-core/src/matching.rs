//! Agent matching engine
//!
//! Additive, bounded sub-scores per agent, a minimum-threshold gate and a
//! deterministic ranking. Scoring is pure; `load_candidates` gathers the load
//! and performance figures it needs from the stores.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analyzer::{AnalysisResult, Urgency};
use crate::metrics::MetricRecorder;
use crate::store::AssignmentRepository;
use crate::types::{Agent, AgentId, Category};

/// Weights and limits for every sub-score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Reward when every category the agent serves was detected
    #[serde(default = "default_category_weight")]
    pub category_weight: f64,
    /// Bonus per matched category beyond the first
    #[serde(default = "default_extra_category_bonus")]
    pub extra_category_bonus: f64,
    #[serde(default = "default_capability_weight")]
    pub capability_weight: f64,

    #[serde(default = "default_urgency_critical_escalation")]
    pub urgency_critical_escalation: f64,
    #[serde(default = "default_urgency_critical_other")]
    pub urgency_critical_other: f64,
    #[serde(default = "default_urgency_high_priority")]
    pub urgency_high_priority: f64,
    #[serde(default = "default_urgency_high_other")]
    pub urgency_high_other: f64,
    #[serde(default = "default_urgency_medium")]
    pub urgency_medium: f64,
    #[serde(default = "default_urgency_low")]
    pub urgency_low: f64,

    #[serde(default = "default_language_base")]
    pub language_base: f64,
    #[serde(default = "default_language_dedicated")]
    pub language_dedicated: f64,
    #[serde(default = "default_language_translation")]
    pub language_translation: f64,
    #[serde(default = "default_language_other")]
    pub language_other: f64,

    /// Assumed success rate for agents without feedback history
    #[serde(default = "default_success_rate")]
    pub default_success_rate: f64,
    #[serde(default = "default_performance_window_days")]
    pub performance_window_days: i64,
    /// Success-rate cutoffs (percent) for the performance tiers, best first
    #[serde(default = "default_performance_high_rate")]
    pub performance_high_rate: f64,
    #[serde(default = "default_performance_good_rate")]
    pub performance_good_rate: f64,
    #[serde(default = "default_performance_fair_rate")]
    pub performance_fair_rate: f64,
    #[serde(default = "default_performance_high")]
    pub performance_high: f64,
    #[serde(default = "default_performance_good")]
    pub performance_good: f64,
    #[serde(default = "default_performance_fair")]
    pub performance_fair: f64,

    /// Highest active load still counted as idle
    #[serde(default = "default_availability_idle_max")]
    pub availability_idle_max: usize,
    /// Highest active load still counted as busy; anything above scores zero
    #[serde(default = "default_availability_busy_max")]
    pub availability_busy_max: usize,
    #[serde(default = "default_availability_idle")]
    pub availability_idle: f64,
    #[serde(default = "default_availability_busy")]
    pub availability_busy: f64,

    /// Active conversations at which an agent stops receiving work
    #[serde(default = "default_concurrency_ceiling")]
    pub concurrency_ceiling: usize,

    #[serde(default = "default_min_threshold")]
    pub min_threshold: f64,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

fn default_category_weight() -> f64 {
    40.0
}
fn default_extra_category_bonus() -> f64 {
    5.0
}
fn default_capability_weight() -> f64 {
    25.0
}
fn default_urgency_critical_escalation() -> f64 {
    30.0
}
fn default_urgency_critical_other() -> f64 {
    10.0
}
fn default_urgency_high_priority() -> f64 {
    20.0
}
fn default_urgency_high_other() -> f64 {
    15.0
}
fn default_urgency_medium() -> f64 {
    15.0
}
fn default_urgency_low() -> f64 {
    10.0
}
fn default_language_base() -> f64 {
    15.0
}
fn default_language_dedicated() -> f64 {
    25.0
}
fn default_language_translation() -> f64 {
    15.0
}
fn default_language_other() -> f64 {
    5.0
}
fn default_success_rate() -> f64 {
    70.0
}
fn default_performance_window_days() -> i64 {
    30
}
fn default_performance_high_rate() -> f64 {
    90.0
}
fn default_performance_good_rate() -> f64 {
    80.0
}
fn default_performance_fair_rate() -> f64 {
    70.0
}
fn default_performance_high() -> f64 {
    15.0
}
fn default_performance_good() -> f64 {
    10.0
}
fn default_performance_fair() -> f64 {
    5.0
}
fn default_availability_idle_max() -> usize {
    2
}
fn default_availability_busy_max() -> usize {
    5
}
fn default_availability_idle() -> f64 {
    10.0
}
fn default_availability_busy() -> f64 {
    5.0
}
fn default_concurrency_ceiling() -> usize {
    10
}
fn default_min_threshold() -> f64 {
    50.0
}
fn default_top_n() -> usize {
    3
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            category_weight: default_category_weight(),
            extra_category_bonus: default_extra_category_bonus(),
            capability_weight: default_capability_weight(),
            urgency_critical_escalation: default_urgency_critical_escalation(),
            urgency_critical_other: default_urgency_critical_other(),
            urgency_high_priority: default_urgency_high_priority(),
            urgency_high_other: default_urgency_high_other(),
            urgency_medium: default_urgency_medium(),
            urgency_low: default_urgency_low(),
            language_base: default_language_base(),
            language_dedicated: default_language_dedicated(),
            language_translation: default_language_translation(),
            language_other: default_language_other(),
            default_success_rate: default_success_rate(),
            performance_window_days: default_performance_window_days(),
            performance_high_rate: default_performance_high_rate(),
            performance_good_rate: default_performance_good_rate(),
            performance_fair_rate: default_performance_fair_rate(),
            performance_high: default_performance_high(),
            performance_good: default_performance_good(),
            performance_fair: default_performance_fair(),
            availability_idle_max: default_availability_idle_max(),
            availability_busy_max: default_availability_busy_max(),
            availability_idle: default_availability_idle(),
            availability_busy: default_availability_busy(),
            concurrency_ceiling: default_concurrency_ceiling(),
            min_threshold: default_min_threshold(),
            top_n: default_top_n(),
        }
    }
}

impl ScoringConfig {
    pub fn performance_score(&self, success_rate: f64) -> f64 {
        if success_rate >= self.performance_high_rate {
            self.performance_high
        } else if success_rate >= self.performance_good_rate {
            self.performance_good
        } else if success_rate >= self.performance_fair_rate {
            self.performance_fair
        } else {
            0.0
        }
    }

    pub fn availability_score(&self, active_load: usize) -> f64 {
        if active_load <= self.availability_idle_max {
            self.availability_idle
        } else if active_load <= self.availability_busy_max {
            self.availability_busy
        } else {
            0.0
        }
    }
}

/// An agent together with the live figures scoring depends on
#[derive(Debug, Clone)]
pub struct CandidateAgent {
    pub agent: Agent,
    /// Average helpfulness over the performance window, 0-100
    pub success_rate: Option<f64>,
    /// Conversations currently assigned to the agent
    pub active_load: usize,
}

impl CandidateAgent {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent,
            success_rate: None,
            active_load: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub category: f64,
    pub capability: f64,
    pub urgency: f64,
    pub language: f64,
    pub performance: f64,
    pub availability: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.category
            + self.capability
            + self.urgency
            + self.language
            + self.performance
            + self.availability
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentMatch {
    pub agent: Agent,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    pub reasons: Vec<String>,
}

impl AgentMatch {
    /// Score clamped into the 0-100 confidence range
    pub fn confidence(&self) -> f64 {
        self.score.clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatchingEngine {
    config: ScoringConfig,
}

impl MatchingEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Candidates clearing the threshold, best first, at most `top_n`
    pub fn rank(&self, analysis: &AnalysisResult, candidates: &[CandidateAgent]) -> Vec<AgentMatch> {
        let mut ranked: Vec<AgentMatch> = self
            .score_all(analysis, candidates)
            .into_iter()
            .filter(|m| m.score >= self.config.min_threshold)
            .collect();
        ranked.truncate(self.config.top_n);
        ranked
    }

    /// Every eligible candidate, best first, threshold not applied.
    /// Inactive agents and agents at the concurrency ceiling are left out.
    pub fn score_all(
        &self,
        analysis: &AnalysisResult,
        candidates: &[CandidateAgent],
    ) -> Vec<AgentMatch> {
        let mut scored: Vec<AgentMatch> = candidates
            .iter()
            .filter(|c| c.agent.is_active())
            .filter(|c| {
                let eligible = c.active_load < self.config.concurrency_ceiling;
                if !eligible {
                    debug!(
                        "Agent {} excluded at capacity ({} active)",
                        c.agent.id, c.active_load
                    );
                }
                eligible
            })
            .map(|c| self.score(analysis, c))
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.agent.id.cmp(&b.agent.id))
        });
        scored
    }

    pub fn score(&self, analysis: &AnalysisResult, candidate: &CandidateAgent) -> AgentMatch {
        let agent = &candidate.agent;
        let mut reasons = Vec::new();

        let (category, matched) = self.category_score(analysis, agent);
        if !matched.is_empty() {
            let names: Vec<String> = matched.iter().map(|c| c.to_string()).collect();
            reasons.push(format!("Category match: {}", names.join(", ")));
        }

        let (capability, overlapping) = self.capability_score(analysis, agent);
        if overlapping > 0 {
            reasons.push(format!(
                "Keyword match: {} of {} keywords",
                overlapping,
                analysis.keywords.len()
            ));
        }

        let urgency = self.urgency_score(analysis.urgency, agent.category);
        if analysis.urgency >= Urgency::High && urgency > self.config.urgency_high_other {
            reasons.push(format!("Suited to {} urgency", analysis.urgency));
        }

        let language = self.language_score(analysis, agent);
        if analysis.has_category(Category::Multilingual) && language > self.config.language_other {
            reasons.push(format!("Handles language: {}", analysis.language));
        }

        let rate = candidate
            .success_rate
            .unwrap_or(self.config.default_success_rate);
        let performance = self.config.performance_score(rate);
        if rate >= self.config.performance_good_rate {
            reasons.push(format!("Strong performance ({:.0}% success)", rate));
        }

        let availability = self.config.availability_score(candidate.active_load);
        if candidate.active_load <= self.config.availability_idle_max {
            reasons.push("Available for new conversations".to_string());
        }

        let breakdown = ScoreBreakdown {
            category,
            capability,
            urgency,
            language,
            performance,
            availability,
        };
        AgentMatch {
            agent: agent.clone(),
            score: breakdown.total(),
            breakdown,
            reasons,
        }
    }

    /// Proportional to the share of the agent's served categories that were
    /// detected; non-decreasing as detected categories are added
    fn category_score(&self, analysis: &AnalysisResult, agent: &Agent) -> (f64, Vec<Category>) {
        let served = agent.served_categories();
        let matched: Vec<Category> = served
            .iter()
            .copied()
            .filter(|c| analysis.has_category(*c))
            .collect();
        if matched.is_empty() {
            return (0.0, matched);
        }
        let share = matched.len() as f64 / served.len() as f64;
        let extra = (matched.len() - 1) as f64 * self.config.extra_category_bonus;
        (self.config.category_weight * share + extra, matched)
    }

    fn capability_score(&self, analysis: &AnalysisResult, agent: &Agent) -> (f64, usize) {
        if analysis.keywords.is_empty() {
            return (0.0, 0);
        }
        let terms = capability_terms(agent);
        let overlapping = analysis
            .keyword_terms()
            .filter(|k| terms.iter().any(|t| terms_overlap(k, t)))
            .count();
        let score =
            self.config.capability_weight * overlapping as f64 / analysis.keywords.len() as f64;
        (score, overlapping)
    }

    fn urgency_score(&self, urgency: Urgency, category: Category) -> f64 {
        match urgency {
            Urgency::Critical if category == Category::Management => {
                self.config.urgency_critical_escalation
            }
            Urgency::Critical => self.config.urgency_critical_other,
            Urgency::High if matches!(category, Category::Management | Category::Technical) => {
                self.config.urgency_high_priority
            }
            Urgency::High => self.config.urgency_high_other,
            Urgency::Medium => self.config.urgency_medium,
            Urgency::Low => self.config.urgency_low,
        }
    }

    fn language_score(&self, analysis: &AnalysisResult, agent: &Agent) -> f64 {
        if !analysis.has_category(Category::Multilingual) {
            self.config.language_base
        } else if agent.category == Category::Multilingual {
            self.config.language_dedicated
        } else if agent.capabilities().contains(&"translation") {
            self.config.language_translation
        } else {
            self.config.language_other
        }
    }
}


/// Capability words ("refund_handling" -> "refund", "handling") plus name tokens
fn capability_terms(agent: &Agent) -> Vec<String> {
    let mut terms: Vec<String> = agent
        .capabilities()
        .iter()
        .flat_map(|c| c.split('_'))
        .map(str::to_string)
        .collect();
    terms.extend(
        agent
            .name
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string),
    );
    terms
}

/// Equal, or one a prefix of the other with at least four shared characters
fn terms_overlap(keyword: &str, term: &str) -> bool {
    if keyword == term {
        return true;
    }
    let (shorter, longer) = if keyword.len() <= term.len() {
        (keyword, term)
    } else {
        (term, keyword)
    };
    shorter.len() >= 4 && longer.starts_with(shorter)
}

/// Attach current load and recent success rate to each agent
pub async fn load_candidates(
    agents: Vec<Agent>,
    assignments: &dyn AssignmentRepository,
    metrics: &MetricRecorder,
    performance_window_days: i64,
) -> Result<Vec<CandidateAgent>> {
    let ids: Vec<AgentId> = agents.iter().map(|a| a.id).collect();
    let mut load: HashMap<AgentId, usize> = HashMap::new();
    for assignment in assignments.active_for_agents(&ids).await? {
        *load.entry(assignment.agent_id).or_default() += 1;
    }

    let mut candidates = Vec::with_capacity(agents.len());
    for agent in agents {
        let success_rate = metrics.success_rate(agent.id, performance_window_days).await;
        let active_load = load.get(&agent.id).copied().unwrap_or(0);
        candidates.push(CandidateAgent {
            agent,
            success_rate,
            active_load,
        });
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::ContentAnalyzer;
    use crate::registry;
    use crate::types::AgentStatus;
    use chrono::Utc;
    use serde_json::Map;

    fn agent(id: AgentId, template_id: &str) -> Agent {
        let t = registry::get(template_id).unwrap();
        Agent {
            id,
            account_id: 1,
            template_id: t.id.to_string(),
            name: t.name.to_string(),
            category: t.category,
            status: AgentStatus::Active,
            provider: t.default_provider(),
            model: None,
            temperature: 0.7,
            max_tokens: 2000,
            custom_prompt: None,
            auto_respond: false,
            trigger_conditions: Map::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn pool() -> Vec<CandidateAgent> {
        registry::all()
            .iter()
            .enumerate()
            .map(|(i, t)| CandidateAgent::new(agent(i as AgentId + 1, t.id)))
            .collect()
    }

    fn analyze(text: &str) -> AnalysisResult {
        ContentAnalyzer::default().analyze(&[text], None)
    }

    #[test]
    fn test_outage_routes_to_escalation_then_technical() {
        let engine = MatchingEngine::default();
        let analysis = analyze("URGENT: our production server is down, customers can't log in");
        let ranked = engine.rank(&analysis, &pool());

        assert_eq!(ranked[0].agent.template_id, "escalation_manager");
        assert_eq!(ranked[0].confidence(), 100.0);
        assert_eq!(ranked[1].agent.template_id, "technical_support");
        assert_eq!(ranked[1].score, 80.0);
        assert!(ranked.len() <= 3);
    }

    #[test]
    fn test_spanish_prefers_multilingual_agent() {
        let engine = MatchingEngine::default();
        let analysis = analyze("Hola, necesito ayuda con mi cuenta");
        let ranked = engine.rank(&analysis, &pool());

        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].agent.template_id, "multilingual_support");
        assert_eq!(ranked[0].breakdown.language, 25.0);
        assert_eq!(ranked[0].score, 90.0);
    }

    #[test]
    fn test_below_threshold_returns_nothing() {
        let engine = MatchingEngine::default();
        let analysis = analyze("Just wondering about your opening hours");
        assert!(engine.rank(&analysis, &pool()).is_empty());

        let all = engine.score_all(&analysis, &pool());
        assert_eq!(all.len(), 6);
        assert!(all.iter().all(|m| m.score == 40.0));
        // ties broken by id
        let ids: Vec<AgentId> = all.iter().map(|m| m.agent.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_billing_refund_scores_keyword_overlap() {
        let engine = MatchingEngine::default();
        let analysis = analyze("I was charged twice and need a refund for my subscription");
        let ranked = engine.rank(&analysis, &pool());
        let top = &ranked[0];
        assert_eq!(top.agent.template_id, "billing_support");
        assert!(top.breakdown.capability > 0.0);
        assert!(top.reasons.iter().any(|r| r.starts_with("Keyword match")));
    }

    #[test]
    fn test_category_score_is_monotonic() {
        let engine = MatchingEngine::default();
        let escalation = agent(1, "escalation_manager");
        let mut analysis = analyze("this is unacceptable");
        assert_eq!(analysis.categories, vec![Category::Management]);
        let (single, _) = engine.category_score(&analysis, &escalation);

        analysis.categories.insert(0, Category::Technical);
        let (double, _) = engine.category_score(&analysis, &escalation);
        assert!(double >= single);
        assert_eq!(double, 45.0);

        analysis.categories.push(Category::Billing);
        let (triple, _) = engine.category_score(&analysis, &escalation);
        assert!(triple >= double);
    }

    #[test]
    fn test_no_categories_no_category_score() {
        let engine = MatchingEngine::default();
        let analysis = analyze("hello there");
        let m = engine.score(&analysis, &CandidateAgent::new(agent(1, "technical_support")));
        assert_eq!(m.breakdown.category, 0.0);
        assert_eq!(m.breakdown.capability, 0.0);
    }

    #[test]
    fn test_agents_at_ceiling_are_excluded() {
        let engine = MatchingEngine::default();
        let analysis = analyze("URGENT: our production server is down, customers can't log in");
        let mut candidates = pool();
        for c in candidates.iter_mut() {
            if c.agent.template_id == "escalation_manager" {
                c.active_load = 10;
            }
        }
        let ranked = engine.rank(&analysis, &candidates);
        assert!(ranked.iter().all(|m| m.agent.template_id != "escalation_manager"));
        assert_eq!(ranked[0].agent.template_id, "technical_support");
    }

    #[test]
    fn test_inactive_agents_are_skipped() {
        let engine = MatchingEngine::default();
        let mut candidates = pool();
        for c in candidates.iter_mut() {
            c.agent.status = AgentStatus::Inactive;
        }
        let analysis = analyze("our server is down");
        assert!(engine.score_all(&analysis, &candidates).is_empty());
    }

    #[test]
    fn test_load_and_performance_tiers() {
        let config = ScoringConfig::default();
        assert_eq!(config.availability_score(0), 10.0);
        assert_eq!(config.availability_score(3), 5.0);
        assert_eq!(config.availability_score(9), 0.0);
        assert_eq!(config.performance_score(95.0), 15.0);
        assert_eq!(config.performance_score(85.0), 10.0);
        assert_eq!(config.performance_score(70.0), 5.0);
        assert_eq!(config.performance_score(40.0), 0.0);
    }

    #[test]
    fn test_configured_tiers_drive_the_breakdown() {
        let config: ScoringConfig = toml::from_str(
            r#"
            performance_high_rate = 60.0
            performance_high = 30.0
            availability_idle_max = 0
            availability_busy_max = 1
            availability_idle = 20.0
            availability_busy = 2.0
            "#,
        )
        .unwrap();
        assert_eq!(config.performance_score(65.0), 30.0);
        assert_eq!(config.performance_score(50.0), 0.0);
        assert_eq!(config.availability_score(0), 20.0);
        assert_eq!(config.availability_score(1), 2.0);
        assert_eq!(config.availability_score(2), 0.0);
        assert_eq!(config.top_n, 3);

        let engine = MatchingEngine::new(config);
        let analysis = analyze("I was charged twice and need a refund for my payment");
        let mut candidate = CandidateAgent::new(agent(1, "billing_support"));
        candidate.success_rate = Some(65.0);
        candidate.active_load = 1;
        let scored = engine.score(&analysis, &candidate);
        assert_eq!(scored.breakdown.performance, 30.0);
        assert_eq!(scored.breakdown.availability, 2.0);
    }

    #[test]
    fn test_injected_threshold() {
        let engine = MatchingEngine::new(ScoringConfig {
            min_threshold: 30.0,
            top_n: 2,
            ..Default::default()
        });
        let analysis = analyze("Just wondering about your opening hours");
        assert_eq!(engine.rank(&analysis, &pool()).len(), 2);
    }

    #[test]
    fn test_terms_overlap() {
        assert!(terms_overlap("refund", "refund"));
        assert!(terms_overlap("refunds", "refund"));
        assert!(terms_overlap("troubleshoot", "troubleshooting"));
        assert!(!terms_overlap("log", "logging"));
        assert!(!terms_overlap("production", "product_recommendations"));
    }

    #[tokio::test]
    async fn test_load_candidates_counts_active_assignments() {
        use crate::store::memory::InMemoryStore;
        use crate::types::Assignment;
        use std::sync::Arc;

        let store = Arc::new(InMemoryStore::new());
        for conversation_id in 1..=3 {
            store
                .replace_active(
                    Assignment {
                        id: format!("a{}", conversation_id),
                        conversation_id,
                        agent_id: 1,
                        confidence: 80.0,
                        reason: "test".to_string(),
                        auto_assigned: true,
                        active: true,
                        assigned_at: Utc::now(),
                        unassigned_at: None,
                        unassignment_reason: None,
                        metadata: Map::new(),
                    },
                    "superseded",
                )
                .await
                .unwrap();
        }
        let recorder = MetricRecorder::new(store.clone());
        let candidates = load_candidates(
            vec![agent(1, "technical_support"), agent(2, "billing_support")],
            store.as_ref(),
            &recorder,
            30,
        )
        .await
        .unwrap();
        assert_eq!(candidates[0].active_load, 3);
        assert_eq!(candidates[1].active_load, 0);
        assert_eq!(candidates[0].success_rate, None);
    }
}
