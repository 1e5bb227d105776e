use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

use triage_core::providers::gateway::{DEFAULT_PROVIDER_KEY, api_key_setting, model_setting};
use triage_core::store::ConfigStore;
use triage_core::{ProviderKind, RoutingConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "~/.triage/triage.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Account used when a command does not pass `--account`
    #[serde(default = "default_account_id")]
    pub id: i64,
}

fn default_account_id() -> i64 {
    1
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            id: default_account_id(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// "openai", "claude" or "gemini"
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub openai: Option<ProviderKeyConfig>,
    #[serde(default)]
    pub claude: Option<ProviderKeyConfig>,
    #[serde(default)]
    pub gemini: Option<ProviderKeyConfig>,
}

impl ProvidersConfig {
    pub fn entries(&self) -> [(ProviderKind, Option<&ProviderKeyConfig>); 3] {
        [
            (ProviderKind::OpenAi, self.openai.as_ref()),
            (ProviderKind::Claude, self.claude.as_ref()),
            (ProviderKind::Gemini, self.gemini.as_ref()),
        ]
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderKeyConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: Option<String>,
}

impl std::fmt::Debug for ProviderKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderKeyConfig")
            .field("api_key", &mask_secret(&self.api_key))
            .field("model", &self.model)
            .finish()
    }
}

/// Mask a secret string for safe display in Debug output / logs.
/// Shows first 3 and last 4 chars for keys longer than 7 chars, otherwise "***".
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".triage")
}

/// Expand a leading `~/` against the home directory
pub fn shellexpand(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

impl TriageConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(anyhow::anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain API keys. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `triage init` first.",
                path.display()
            )
        })?;
        Self::parse(&content).with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;

        for (kind, entry) in config.providers.entries() {
            if let Some(entry) = entry {
                if looks_hardcoded(&entry.api_key) {
                    warn!(
                        "{} API key is hardcoded in config file. For security, use environment variables: api_key = \"${{{}}}\"",
                        kind,
                        kind.env_var()
                    );
                }
            }
        }
        if let Some(name) = config.providers.default.as_deref() {
            if ProviderKind::from_str(name).is_none() {
                anyhow::bail!("Unknown default provider '{}'", name);
            }
        }
        Ok(config)
    }

    /// Copy configured keys, models and the default provider into the
    /// config store the gateway reads. Empty keys are skipped so a stored
    /// key survives an unset environment variable.
    pub fn seed_settings(&self, store: &dyn ConfigStore) -> Result<()> {
        for (kind, entry) in self.providers.entries() {
            let Some(entry) = entry else { continue };
            let key = entry.api_key.trim();
            if !key.is_empty() {
                store.set(&api_key_setting(kind), key)?;
                debug!("Seeded API key for {} ({})", kind, mask_secret(key));
            }
            if let Some(model) = entry.model.as_deref().filter(|m| !m.is_empty()) {
                if kind.model_info(model).is_none() {
                    anyhow::bail!("Model '{}' is not offered by {}", model, kind);
                }
                store.set(&model_setting(kind), model)?;
            }
        }
        if let Some(kind) = self
            .providers
            .default
            .as_deref()
            .and_then(ProviderKind::from_str)
        {
            store.set(DEFAULT_PROVIDER_KEY, &kind.to_string())?;
        }
        Ok(())
    }
}

fn looks_hardcoded(key: &str) -> bool {
    !key.is_empty() && !key.contains("${")
}

/// Allowlist of environment variable names that may be expanded in config files.
/// This prevents an attacker who can modify the config from reading arbitrary env vars.
const ALLOWED_ENV_VARS: &[&str] = &[
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GOOGLE_AI_API_KEY",
    "TRIAGE_DB_PATH",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MapStore(Mutex<HashMap<String, String>>);

    impl ConfigStore for MapStore {
        fn get(&self, key: &str) -> Option<String> {
            self.0.lock().unwrap().get(key).cloned()
        }
        fn set(&self, key: &str, value: &str) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "(empty)");
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret("sk-abcdefghijkl"), "sk-...ijkl");
    }

    #[test]
    fn test_debug_masks_key() {
        let entry = ProviderKeyConfig {
            api_key: "sk-proj-1234567890".to_string(),
            model: None,
        };
        let printed = format!("{:?}", entry);
        assert!(!printed.contains("1234567890"));
        assert!(printed.contains("sk-...7890"));
    }

    #[test]
    fn test_unlisted_env_var_is_left_alone() {
        let out = expand_env_vars("key = \"${SOME_RANDOM_SECRET}\"");
        assert_eq!(out, "key = \"${SOME_RANDOM_SECRET}\"");
    }

    #[test]
    fn test_listed_env_var_expands() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(expand_env_vars("${HOME}/x"), format!("{}/x", home));
    }

    #[test]
    fn test_empty_config_defaults() {
        let config = TriageConfig::parse("").unwrap();
        assert_eq!(config.store.db_path, "~/.triage/triage.db");
        assert_eq!(config.account.id, 1);
        assert!(config.providers.openai.is_none());
        assert_eq!(config.routing.scoring.min_threshold, 50.0);
    }

    #[test]
    fn test_default_config_parses() {
        let config = TriageConfig::parse(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(config.providers.default.as_deref(), Some("openai"));
        assert!(config.routing.policy.auto_routing_enabled);
    }

    #[test]
    fn test_unknown_default_provider_rejected() {
        let err = TriageConfig::parse("[providers]\ndefault = \"mistral\"").unwrap_err();
        assert!(err.to_string().contains("mistral"));
    }

    #[test]
    fn test_seed_settings() {
        let config = TriageConfig::parse(
            r#"
            [providers]
            default = "claude"

            [providers.claude]
            api_key = "claude-key"
            model = "claude-3-5-haiku-20241022"

            [providers.openai]
            api_key = ""
            "#,
        )
        .unwrap();
        let store = MapStore::default();
        config.seed_settings(&store).unwrap();

        assert_eq!(
            store.get(&api_key_setting(ProviderKind::Claude)).as_deref(),
            Some("claude-key")
        );
        assert_eq!(
            store.get(&model_setting(ProviderKind::Claude)).as_deref(),
            Some("claude-3-5-haiku-20241022")
        );
        assert!(store.get(&api_key_setting(ProviderKind::OpenAi)).is_none());
        assert_eq!(store.get(DEFAULT_PROVIDER_KEY).as_deref(), Some("claude"));
    }

    #[test]
    fn test_seed_rejects_unknown_model() {
        let config = TriageConfig::parse(
            "[providers.gemini]\napi_key = \"g\"\nmodel = \"gpt-4o\"",
        )
        .unwrap();
        assert!(config.seed_settings(&MapStore::default()).is_err());
    }

    #[test]
    fn test_shellexpand() {
        assert_eq!(shellexpand("/tmp/x.db"), PathBuf::from("/tmp/x.db"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(shellexpand("~/a.db"), home.join("a.db"));
        }
    }
}
