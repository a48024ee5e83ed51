use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Scheduling priority attached by the caller. The gateway currently uses
/// it for diagnostics only; admission and selection are priority-blind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

fn default_temperature() -> f64 {
    0.2
}

/// An inbound completion request together with the identity triple the
/// budget hierarchy is keyed on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Preferred provider id. Feeds the pre-call cost estimate; selection
    /// itself stays score-driven.
    #[serde(default)]
    pub provider: Option<String>,

    pub user_id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub company_id: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub requirements: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl GatewayRequest {
    pub fn new(prompt: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            provider: None,
            user_id: user_id.into(),
            team_id: None,
            company_id: None,
            temperature: default_temperature(),
            max_tokens: None,
            priority: Priority::Normal,
            requirements: HashMap::new(),
            request_id: None,
            session_id: None,
            trace_id: None,
        }
    }

    pub fn with_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    pub fn with_company(mut self, company_id: impl Into<String>) -> Self {
        self.company_id = Some(company_id.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Assigns a request id if the caller did not supply one and returns it.
    pub fn ensure_request_id(&mut self) -> String {
        if self.request_id.is_none() {
            self.request_id = Some(Uuid::new_v4().to_string());
        }
        self.request_id.clone().unwrap_or_default()
    }
}

/// The outward response of the routing pipeline. Unsuccessful outcomes are
/// carried here too (`success = false` plus a prefixed `error`); transport
/// errors are reserved for the authentication edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub content: String,
    pub model_used: String,
    pub provider_used: String,

    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,

    pub cost_usd: f64,
    pub cost_currency: String,

    pub latency_ms: f64,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_level: Option<String>,

    pub request_id: String,
    pub user_id: String,

    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl GatewayResponse {
    /// An unsuccessful response carrying the measured latency so far.
    pub fn failure(request: &GatewayRequest, error: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            content: String::new(),
            model_used: String::new(),
            provider_used: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            cost_usd: 0.0,
            cost_currency: "USD".to_string(),
            latency_ms,
            cache_hit: false,
            cache_level: None,
            request_id: request.request_id.clone().unwrap_or_default(),
            user_id: request.user_id.clone(),
            success: false,
            error: Some(error.into()),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}
