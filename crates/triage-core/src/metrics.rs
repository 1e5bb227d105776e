//! Typed per-agent metrics and their aggregation

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::MetricsStore;
use crate::types::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    MessageProcessed,
    ResponseTime,
    TokenUsage,
    RoutingDecision,
    UnassignmentEvent,
    /// 0-100 helpfulness signal from turn feedback
    SuccessRate,
    CustomerSatisfaction,
    ErrorCount,
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageProcessed => write!(f, "message_processed"),
            Self::ResponseTime => write!(f, "response_time"),
            Self::TokenUsage => write!(f, "token_usage"),
            Self::RoutingDecision => write!(f, "routing_decision"),
            Self::UnassignmentEvent => write!(f, "unassignment_event"),
            Self::SuccessRate => write!(f, "success_rate"),
            Self::CustomerSatisfaction => write!(f, "customer_satisfaction"),
            Self::ErrorCount => write!(f, "error_count"),
        }
    }
}

impl MetricType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "message_processed" => Some(Self::MessageProcessed),
            "response_time" => Some(Self::ResponseTime),
            "token_usage" => Some(Self::TokenUsage),
            "routing_decision" => Some(Self::RoutingDecision),
            "unassignment_event" => Some(Self::UnassignmentEvent),
            "success_rate" => Some(Self::SuccessRate),
            "customer_satisfaction" => Some(Self::CustomerSatisfaction),
            "error_count" => Some(Self::ErrorCount),
            _ => None,
        }
    }

    /// Human-readable rendering of a value of this type
    pub fn format_value(&self, value: f64) -> String {
        match self {
            Self::ResponseTime => format!("{:.0}ms", value),
            Self::SuccessRate | Self::CustomerSatisfaction => format!("{:.1}%", value),
            Self::TokenUsage => format!("{:.0} tokens", value),
            _ => format!("{:.0}", value),
        }
    }
}

/// A dated measurement scoped to one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    pub agent_id: AgentId,
    pub metric_type: MetricType,
    pub value: f64,
    pub date: NaiveDate,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Metric {
    pub fn new(agent_id: AgentId, metric_type: MetricType, value: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id,
            metric_type,
            value,
            date: now.date_naive(),
            metadata: Map::new(),
            created_at: now,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Inclusive date-range filter
#[derive(Debug, Clone)]
pub struct MetricQuery {
    pub agent_id: Option<AgentId>,
    pub metric_type: Option<MetricType>,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl MetricQuery {
    pub fn for_agent(agent_id: AgentId, from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            agent_id: Some(agent_id),
            metric_type: None,
            from,
            to,
        }
    }

    pub fn of_type(mut self, metric_type: MetricType) -> Self {
        self.metric_type = Some(metric_type);
        self
    }

    pub fn matches(&self, metric: &Metric) -> bool {
        self.agent_id.is_none_or(|id| id == metric.agent_id)
            && self.metric_type.is_none_or(|t| t == metric.metric_type)
            && metric.date >= self.from
            && metric.date <= self.to
    }
}

/// One agent's activity for a single day
#[derive(Debug, Clone, Default, Serialize)]
pub struct DailySummary {
    pub date: Option<NaiveDate>,
    pub messages_processed: f64,
    pub average_response_time_ms: Option<f64>,
    pub tokens_used: f64,
    pub routing_decisions: f64,
    pub errors: f64,
    pub success_rate: Option<f64>,
}

pub fn sum(metrics: &[Metric], metric_type: MetricType) -> f64 {
    metrics
        .iter()
        .filter(|m| m.metric_type == metric_type)
        .map(|m| m.value)
        .sum()
}

pub fn average(metrics: &[Metric], metric_type: MetricType) -> Option<f64> {
    let values: Vec<f64> = metrics
        .iter()
        .filter(|m| m.metric_type == metric_type)
        .map(|m| m.value)
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Writes metrics on behalf of routing and response paths. Write failures are
/// logged and dropped so they never fail the caller.
#[derive(Clone)]
pub struct MetricRecorder {
    store: Arc<dyn MetricsStore>,
}

impl MetricRecorder {
    pub fn new(store: Arc<dyn MetricsStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MetricsStore> {
        &self.store
    }

    pub async fn record(&self, metric: Metric) {
        let (agent_id, metric_type) = (metric.agent_id, metric.metric_type);
        match self.store.record(metric).await {
            Ok(()) => debug!("Recorded {} metric for agent {}", metric_type, agent_id),
            Err(e) => warn!(
                "Failed to record {} metric for agent {}: {}",
                metric_type, agent_id, e
            ),
        }
    }

    /// Average success rate over the trailing window, None without data
    pub async fn success_rate(&self, agent_id: AgentId, days: i64) -> Option<f64> {
        let to = Utc::now().date_naive();
        let from = to - Duration::days(days);
        let query = MetricQuery::for_agent(agent_id, from, to).of_type(MetricType::SuccessRate);
        match self.store.query(&query).await {
            Ok(metrics) => average(&metrics, MetricType::SuccessRate),
            Err(e) => {
                warn!("Failed to load success rate for agent {}: {}", agent_id, e);
                None
            }
        }
    }

    pub async fn daily_summary(&self, agent_id: AgentId, date: NaiveDate) -> Result<DailySummary> {
        let metrics = self
            .store
            .query(&MetricQuery::for_agent(agent_id, date, date))
            .await?;
        Ok(DailySummary {
            date: Some(date),
            messages_processed: sum(&metrics, MetricType::MessageProcessed),
            average_response_time_ms: average(&metrics, MetricType::ResponseTime),
            tokens_used: sum(&metrics, MetricType::TokenUsage),
            routing_decisions: sum(&metrics, MetricType::RoutingDecision),
            errors: sum(&metrics, MetricType::ErrorCount),
            success_rate: average(&metrics, MetricType::SuccessRate),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    #[test]
    fn test_metric_type_names_round_trip() {
        for t in [
            MetricType::MessageProcessed,
            MetricType::ResponseTime,
            MetricType::TokenUsage,
            MetricType::RoutingDecision,
            MetricType::UnassignmentEvent,
            MetricType::SuccessRate,
            MetricType::CustomerSatisfaction,
            MetricType::ErrorCount,
        ] {
            assert_eq!(MetricType::from_str(&t.to_string()), Some(t));
        }
        assert_eq!(MetricType::from_str("bogus"), None);
    }

    #[test]
    fn test_format_value() {
        assert_eq!(MetricType::ResponseTime.format_value(1234.4), "1234ms");
        assert_eq!(MetricType::SuccessRate.format_value(87.25), "87.2%");
        assert_eq!(MetricType::TokenUsage.format_value(300.0), "300 tokens");
    }

    #[test]
    fn test_sum_and_average() {
        let metrics = vec![
            Metric::new(1, MetricType::ResponseTime, 100.0),
            Metric::new(1, MetricType::ResponseTime, 300.0),
            Metric::new(1, MetricType::TokenUsage, 50.0),
        ];
        assert_eq!(sum(&metrics, MetricType::TokenUsage), 50.0);
        assert_eq!(average(&metrics, MetricType::ResponseTime), Some(200.0));
        assert_eq!(average(&metrics, MetricType::SuccessRate), None);
    }

    #[tokio::test]
    async fn test_daily_summary_and_success_rate() {
        let store = Arc::new(InMemoryStore::new());
        let recorder = MetricRecorder::new(store.clone());
        recorder.record(Metric::new(7, MetricType::MessageProcessed, 1.0)).await;
        recorder.record(Metric::new(7, MetricType::MessageProcessed, 1.0)).await;
        recorder.record(Metric::new(7, MetricType::ResponseTime, 400.0)).await;
        recorder.record(Metric::new(7, MetricType::SuccessRate, 100.0)).await;
        recorder.record(Metric::new(7, MetricType::SuccessRate, 0.0)).await;
        recorder.record(Metric::new(8, MetricType::MessageProcessed, 1.0)).await;

        let summary = recorder
            .daily_summary(7, Utc::now().date_naive())
            .await
            .unwrap();
        assert_eq!(summary.messages_processed, 2.0);
        assert_eq!(summary.average_response_time_ms, Some(400.0));
        assert_eq!(summary.success_rate, Some(50.0));

        assert_eq!(recorder.success_rate(7, 30).await, Some(50.0));
        assert_eq!(recorder.success_rate(8, 30).await, None);
    }
}
