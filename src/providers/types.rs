use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Active,
    Inactive,
    Maintenance,
    Error,
    RateLimited,
}

/// Which completion wire format the provider speaks. Adding a provider of
/// an already-supported family is a config change, not a code change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    OpenAiChat,
    AnthropicMessages,
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> f64 {
    30.0
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_timeout() -> u64 {
    60
}

fn default_status() -> ProviderStatus {
    ProviderStatus::Active
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub name: String,

    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    pub wire: WireFormat,

    #[serde(default = "default_status")]
    pub status: ProviderStatus,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: f64,

    pub cost_per_1k_tokens_input: f64,
    pub cost_per_1k_tokens_output: f64,

    pub supported_models: Vec<String>,
    /// Capability tags the scorer keys on: "fast", "capable".
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_timeout")]
    pub circuit_breaker_timeout_seconds: u64,

    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
    #[serde(default)]
    pub rate_limit_tpm: Option<u32>,
}

impl ProviderConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.timeout_seconds.max(0.001))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Actual cost for a completed call from provider-reported usage.
    pub fn cost_for(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        prompt_tokens as f64 / 1000.0 * self.cost_per_1k_tokens_input
            + completion_tokens as f64 / 1000.0 * self.cost_per_1k_tokens_output
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderMetrics {
    pub provider_id: String,

    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,

    pub avg_response_time_ms: f64,
    pub min_response_time_ms: f64,
    pub max_response_time_ms: f64,

    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,

    pub error_counts: HashMap<String, u64>,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,

    pub circuit_breaker_trips: u64,
    pub last_request_time: Option<DateTime<Utc>>,
    pub last_successful_request: Option<DateTime<Utc>>,
}

impl ProviderMetrics {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            success_rate: 0.0,
            avg_response_time_ms: 0.0,
            min_response_time_ms: 0.0,
            max_response_time_ms: 0.0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cost_usd: 0.0,
            error_counts: HashMap::new(),
            last_error: None,
            last_error_time: None,
            circuit_breaker_trips: 0,
            last_request_time: None,
            last_successful_request: None,
        }
    }

    pub(crate) fn observe_response_time(&mut self, response_time_ms: f64) {
        if self.total_requests == 1 {
            self.min_response_time_ms = response_time_ms;
            self.max_response_time_ms = response_time_ms;
            self.avg_response_time_ms = response_time_ms;
        } else {
            self.min_response_time_ms = self.min_response_time_ms.min(response_time_ms);
            self.max_response_time_ms = self.max_response_time_ms.max(response_time_ms);
            self.avg_response_time_ms += (response_time_ms - self.avg_response_time_ms)
                / self.total_requests as f64;
        }
    }
}

/// A completed (or failed) upstream call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    pub model_used: String,
    pub provider_id: String,

    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,

    pub cost_usd: f64,
    pub cost_currency: String,

    pub response_time_ms: f64,
    pub finish_reason: Option<String>,
    pub success: bool,
}

/// The routing decision for one request: the primary pick plus the ordered
/// fallback chain the executor walks on failure.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSelection {
    pub selected_provider: String,
    pub selected_model: String,

    pub complexity_score: f64,
    pub cost_estimate: f64,
    pub performance_score: f64,

    pub alternatives: Vec<String>,
    pub fallbacks: Vec<String>,
    pub selection_reason: String,
    pub breaker_states: HashMap<String, String>,
}
