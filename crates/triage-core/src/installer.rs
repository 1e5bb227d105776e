//! Installing, configuring and removing agents for an account

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{Result, RoutingError};
use crate::providers::{ProviderError, ProviderGateway, ProviderKind};
use crate::registry;
use crate::store::Stores;
use crate::types::{AccountId, Agent, AgentId, AgentStatus};

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 2000;
const MAX_TEMPERATURE: f32 = 2.0;

/// Overrides applied on top of the template defaults at install time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallOptions {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub custom_prompt: Option<String>,
    #[serde(default)]
    pub auto_respond: bool,
}

/// Partial update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<AgentStatus>,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// An empty string clears the custom prompt
    #[serde(default)]
    pub custom_prompt: Option<String>,
    #[serde(default)]
    pub auto_respond: Option<bool>,
    #[serde(default)]
    pub trigger_conditions: Option<Map<String, Value>>,
}

pub struct AgentInstaller {
    stores: Stores,
    gateway: Arc<ProviderGateway>,
}

impl AgentInstaller {
    pub fn new(stores: Stores, gateway: Arc<ProviderGateway>) -> Self {
        Self { stores, gateway }
    }

    pub async fn installed(&self, account_id: AccountId) -> Result<Vec<Agent>> {
        Ok(self.stores.agents.agents_for_account(account_id).await?)
    }

    pub async fn install(
        &self,
        account_id: AccountId,
        template_id: &str,
        options: InstallOptions,
    ) -> Result<Agent> {
        let template = registry::get(template_id).ok_or_else(|| RoutingError::NotFound {
            kind: "template",
            id: template_id.to_string(),
        })?;

        let existing = self.stores.agents.agents_for_account(account_id).await?;
        if existing.iter().any(|a| a.template_id == template.id) {
            return Err(RoutingError::InvalidRequest(format!(
                "{} is already installed for account {}",
                template.name, account_id
            )));
        }

        let provider = options.provider.unwrap_or_else(|| template.default_provider());
        let model = normalize(options.model);
        self.check_provider(provider, model.as_deref())?;
        let temperature = options.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        let max_tokens = options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        check_generation(temperature, max_tokens)?;

        let now = Utc::now();
        let agent = self
            .stores
            .agents
            .insert_agent(Agent {
                id: 0,
                account_id,
                template_id: template.id.to_string(),
                name: normalize(options.name).unwrap_or_else(|| template.name.to_string()),
                category: template.category,
                status: AgentStatus::Active,
                provider,
                model,
                temperature,
                max_tokens,
                custom_prompt: normalize(options.custom_prompt),
                auto_respond: options.auto_respond,
                trigger_conditions: Map::new(),
                created_at: now,
                updated_at: now,
            })
            .await?;

        info!(
            "Installed {} as agent {} for account {} ({})",
            template.id, agent.id, account_id, provider
        );
        Ok(agent)
    }

    pub async fn configure(&self, agent_id: AgentId, update: AgentUpdate) -> Result<Agent> {
        let mut agent = self
            .stores
            .agents
            .agent(agent_id)
            .await?
            .ok_or_else(|| RoutingError::agent_not_found(agent_id))?;

        if let Some(name) = normalize(update.name) {
            agent.name = name;
        }
        if let Some(status) = update.status {
            agent.status = status;
        }
        if let Some(provider) = update.provider {
            if provider != agent.provider {
                // a model pinned for the old vendor no longer applies
                agent.model = None;
            }
            agent.provider = provider;
        }
        if let Some(model) = update.model {
            agent.model = normalize(Some(model));
        }
        if let Some(temperature) = update.temperature {
            agent.temperature = temperature;
        }
        if let Some(max_tokens) = update.max_tokens {
            agent.max_tokens = max_tokens;
        }
        if let Some(prompt) = update.custom_prompt {
            agent.custom_prompt = normalize(Some(prompt));
        }
        if let Some(auto_respond) = update.auto_respond {
            agent.auto_respond = auto_respond;
        }
        if let Some(conditions) = update.trigger_conditions {
            agent.trigger_conditions = conditions;
        }

        self.check_provider(agent.provider, agent.model.as_deref())?;
        check_generation(agent.temperature, agent.max_tokens)?;
        agent.updated_at = Utc::now();
        self.stores.agents.update_agent(&agent).await?;
        info!("Updated configuration of agent {}", agent_id);
        Ok(agent)
    }

    /// Removes the agent together with its assignments, turns and metrics
    pub async fn uninstall(&self, agent_id: AgentId) -> Result<Agent> {
        let agent = self
            .stores
            .agents
            .agent(agent_id)
            .await?
            .ok_or_else(|| RoutingError::agent_not_found(agent_id))?;
        self.stores.agents.delete_agent(agent_id).await?;
        info!("Uninstalled agent {} ({})", agent_id, agent.template_id);
        Ok(agent)
    }

    fn check_provider(&self, provider: ProviderKind, model: Option<&str>) -> Result<()> {
        if !self.gateway.is_configured(provider) {
            return Err(ProviderError::NotConfigured(provider).into());
        }
        if let Some(model) = model {
            if provider.model_info(model).is_none() {
                return Err(ProviderError::InvalidModel {
                    provider,
                    model: model.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

fn check_generation(temperature: f32, max_tokens: u32) -> Result<()> {
    if !(0.0..=MAX_TEMPERATURE).contains(&temperature) {
        return Err(RoutingError::InvalidRequest(format!(
            "temperature must be between 0 and {}, got {}",
            MAX_TEMPERATURE, temperature
        )));
    }
    if max_tokens == 0 {
        return Err(RoutingError::InvalidRequest(
            "max_tokens must be positive".to_string(),
        ));
    }
    Ok(())
}

fn normalize(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::{AssignRequest, AssignmentManager};
    use crate::providers::gateway::{GatewaySettings, api_key_setting};
    use crate::store::memory::InMemoryStore;
    use crate::store::{AssignmentRepository, ConfigStore};
    use crate::testing::{self, ScriptedFactory};

    fn installer(store: &Arc<InMemoryStore>) -> AgentInstaller {
        let gateway = Arc::new(testing::gateway(
            store.clone(),
            Arc::new(ScriptedFactory::default()),
        ));
        AgentInstaller::new(Stores::from_shared(store.clone()), gateway)
    }

    #[tokio::test]
    async fn test_install_uses_template_defaults() {
        let store = Arc::new(InMemoryStore::new());
        let agent = installer(&store)
            .install(1, "sales_assistant", InstallOptions::default())
            .await
            .unwrap();
        assert_eq!(agent.name, "Sales Assistant Pro");
        assert_eq!(agent.provider, ProviderKind::Claude);
        assert_eq!(agent.temperature, 0.7);
        assert_eq!(agent.max_tokens, 2000);
        assert!(agent.is_active());
        assert!(agent.id > 0);
    }

    #[tokio::test]
    async fn test_duplicate_install_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let installer = installer(&store);
        installer
            .install(1, "billing_support", InstallOptions::default())
            .await
            .unwrap();
        let err = installer
            .install(1, "billing_support", InstallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::InvalidRequest(_)));

        // another account may install the same template
        installer
            .install(2, "billing_support", InstallOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_template() {
        let store = Arc::new(InMemoryStore::new());
        let err = installer(&store)
            .install(1, "weather_bot", InstallOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(crate::providers::ProviderGateway::with_factory(
            store.clone(),
            GatewaySettings {
                env_fallback: false,
                ..Default::default()
            },
            Arc::new(ScriptedFactory::default()),
        ));
        store
            .set(&api_key_setting(ProviderKind::OpenAi), "sk-test")
            .unwrap();
        let installer = AgentInstaller::new(Stores::from_shared(store.clone()), gateway);

        let err = installer
            .install(1, "multilingual_support", InstallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RoutingError::Provider(ProviderError::NotConfigured(ProviderKind::Claude))
        ));

        let agent = installer
            .install(
                1,
                "multilingual_support",
                InstallOptions {
                    provider: Some(ProviderKind::OpenAi),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(agent.provider, ProviderKind::OpenAi);
    }

    #[tokio::test]
    async fn test_configure_validates_model_and_temperature() {
        let store = Arc::new(InMemoryStore::new());
        let installer = installer(&store);
        let agent = installer
            .install(1, "technical_support", InstallOptions::default())
            .await
            .unwrap();

        let updated = installer
            .configure(
                agent.id,
                AgentUpdate {
                    model: Some("gpt-4o".to_string()),
                    custom_prompt: Some("Be brief.".to_string()),
                    auto_respond: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.model.as_deref(), Some("gpt-4o"));
        assert_eq!(updated.system_prompt(), "Be brief.");
        assert!(updated.auto_respond);

        let err = installer
            .configure(
                agent.id,
                AgentUpdate {
                    model: Some("gemini-1.5-pro".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RoutingError::Provider(ProviderError::InvalidModel { .. })
        ));

        let err = installer
            .configure(
                agent.id,
                AgentUpdate {
                    temperature: Some(3.5),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::InvalidRequest(_)));

        // switching vendor drops the pinned model
        let switched = installer
            .configure(
                agent.id,
                AgentUpdate {
                    provider: Some(ProviderKind::Claude),
                    custom_prompt: Some(String::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(switched.model, None);
        assert_eq!(switched.custom_prompt, None);
    }

    #[tokio::test]
    async fn test_uninstall_cascades_assignments() {
        let store = Arc::new(InMemoryStore::new());
        let installer = installer(&store);
        let agent = installer
            .install(1, "billing_support", InstallOptions::default())
            .await
            .unwrap();
        let conv = testing::conversation(&store, 1, &["refund please"]).await;
        let manager = AssignmentManager::new(&Stores::from_shared(store.clone()));
        manager
            .assign(AssignRequest::automatic(conv.id, agent.id, 90.0, "test"))
            .await
            .unwrap();

        installer.uninstall(agent.id).await.unwrap();
        assert!(installer.installed(1).await.unwrap().is_empty());
        assert!(store.active_assignment(conv.id).await.unwrap().is_none());
        assert!(installer.uninstall(agent.id).await.unwrap_err().is_not_found());
    }
}
