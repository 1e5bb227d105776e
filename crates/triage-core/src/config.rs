//! Tunables for analysis, scoring, routing policy and the provider gateway

use serde::{Deserialize, Serialize};

use crate::analyzer::AnalyzerConfig;
use crate::matching::ScoringConfig;
use crate::providers::gateway::GatewaySettings;
use crate::routing::RoutingPolicy;

/// Every section defaults, so a partial `[routing]` table is valid
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub policy: RoutingPolicy,
    #[serde(default)]
    pub gateway: GatewaySettings,
}
