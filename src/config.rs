use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::budget::{BudgetConfig, BudgetDefaults};
use crate::complexity::ComplexityConfig;
use crate::providers::{ProviderConfig, ProviderStatus, WireFormat};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub cache: CacheSettings,
    pub budget: BudgetSettings,
    pub complexity: ComplexityConfig,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            cors_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Static bearer tokens accepted at the edge.
    pub api_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub l1_capacity: usize,
    pub l1_ttl_seconds: u64,
    /// Shared cache server URL (redis://...). In-memory tier when absent.
    pub l2_url: Option<String>,
    pub l2_ttl_seconds: u64,
    /// Persistent store URL (postgres://...). In-memory tier when absent.
    pub l3_url: Option<String>,
    pub l3_ttl_seconds: u64,
    /// The cache key is the md5 of the canonical prompt only: requests
    /// that differ solely in model, temperature or max_tokens share an
    /// entry. Kept false until keying on sampling parameters ships.
    pub key_includes_params: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            l1_capacity: 1000,
            l1_ttl_seconds: 300,
            l2_url: None,
            l2_ttl_seconds: 3600,
            l3_url: None,
            l3_ttl_seconds: 86_400,
            key_includes_params: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    /// Fixed UTC offset (hours) budget windows are aligned to.
    pub timezone_offset_hours: i32,
    pub defaults: BudgetDefaults,
    /// Explicit per-entity budgets loaded at startup.
    pub scopes: Vec<BudgetConfig>,
    /// Provider family multipliers for the pre-call cost estimate.
    pub cost_multipliers: HashMap<String, f64>,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        let mut cost_multipliers = HashMap::new();
        cost_multipliers.insert("groq".to_string(), 0.7);
        cost_multipliers.insert("anthropic".to_string(), 1.5);
        Self {
            timezone_offset_hours: 0,
            defaults: BudgetDefaults::default(),
            scopes: Vec::new(),
            cost_multipliers,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            cache: CacheSettings::default(),
            budget: BudgetSettings::default(),
            complexity: ComplexityConfig::default(),
            providers: default_providers(),
        }
    }
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            provider_id: "openai".to_string(),
            name: "OpenAI".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            api_version: None,
            wire: WireFormat::OpenAiChat,
            status: ProviderStatus::Active,
            is_enabled: true,
            timeout_seconds: 30.0,
            cost_per_1k_tokens_input: 0.0015,
            cost_per_1k_tokens_output: 0.002,
            supported_models: vec![
                "gpt-4".to_string(),
                "gpt-3.5-turbo".to_string(),
                "gpt-4-turbo".to_string(),
            ],
            tags: Vec::new(),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_seconds: 60,
            rate_limit_rpm: None,
            rate_limit_tpm: None,
        },
        ProviderConfig {
            provider_id: "anthropic".to_string(),
            name: "Anthropic".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
            api_version: Some("2023-06-01".to_string()),
            wire: WireFormat::AnthropicMessages,
            status: ProviderStatus::Active,
            is_enabled: true,
            timeout_seconds: 60.0,
            cost_per_1k_tokens_input: 0.003,
            cost_per_1k_tokens_output: 0.015,
            supported_models: vec![
                "claude-3-opus".to_string(),
                "claude-3-sonnet".to_string(),
                "claude-3-haiku".to_string(),
            ],
            tags: vec!["capable".to_string()],
            circuit_breaker_threshold: 3,
            circuit_breaker_timeout_seconds: 120,
            rate_limit_rpm: None,
            rate_limit_tpm: None,
        },
        ProviderConfig {
            provider_id: "groq".to_string(),
            name: "Groq".to_string(),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key_env: Some("GROQ_API_KEY".to_string()),
            api_version: None,
            wire: WireFormat::OpenAiChat,
            status: ProviderStatus::Active,
            is_enabled: true,
            timeout_seconds: 15.0,
            cost_per_1k_tokens_input: 0.0005,
            cost_per_1k_tokens_output: 0.001,
            supported_models: vec![
                "llama3-8b".to_string(),
                "llama3-70b".to_string(),
                "mixtral-8x7b".to_string(),
            ],
            tags: vec!["fast".to_string()],
            circuit_breaker_threshold: 10,
            circuit_breaker_timeout_seconds: 30,
            rate_limit_rpm: None,
            rate_limit_tpm: None,
        },
    ]
}

impl Config {
    /// Loads the TOML config file (creating it with defaults on first
    /// run), then applies environment overrides.
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("SENTINEL_CONFIG").unwrap_or_else(|_| "./gateway.toml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {config_path}"))?;
            toml::from_str(&content).with_context(|| format!("failed to parse {config_path}"))?
        } else {
            let default_config = Config::default();
            let content = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_path, content)
                .with_context(|| format!("failed to write {config_path}"))?;
            default_config
        };

        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("SENTINEL_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("SENTINEL_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(token) = std::env::var("SENTINEL_API_TOKEN") {
            if !self.auth.api_tokens.contains(&token) {
                self.auth.api_tokens.push(token);
            }
        }
        if let Ok(url) = std::env::var("SENTINEL_L2_URL") {
            self.cache.l2_url = Some(url);
        }
        if let Ok(url) = std::env::var("SENTINEL_L3_URL") {
            self.cache.l3_url = Some(url);
        }
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.providers.len(), 3);
        assert_eq!(parsed.cache.l1_capacity, 1000);
        assert_eq!(parsed.budget.timezone_offset_hours, 0);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [server]
            port = 9090

            [auth]
            api_tokens = ["secret"]
            "#,
        )
        .unwrap();
        assert_eq!(parsed.server.port, 9090);
        assert_eq!(parsed.server.host, "127.0.0.1");
        assert_eq!(parsed.auth.api_tokens, vec!["secret".to_string()]);
        assert_eq!(parsed.providers.len(), 3);
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        let config = Config::default();
        config.save(path.to_str().unwrap()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: Config = toml::from_str(&content).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
    }
}
