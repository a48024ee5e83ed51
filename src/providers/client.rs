use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

use super::types::{ProviderConfig, ProviderResponse, WireFormat};
use crate::request::GatewayRequest;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed provider reply: {0}")]
    Parse(String),
    #[error("circuit breaker open for {0}")]
    BreakerOpen(String),
    #[error("no available providers")]
    NoProviders,
    #[error("fallback chain exhausted, last error: {0}")]
    Exhausted(String),
}

impl ProviderError {
    /// Stable kind label for the per-error metrics counters.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Http { .. } => "http_error",
            ProviderError::Auth(_) => "auth_error",
            ProviderError::RateLimit(_) => "rate_limited",
            ProviderError::Network(_) => "network_error",
            ProviderError::Parse(_) => "parse_error",
            ProviderError::BreakerOpen(_) => "breaker_open",
            ProviderError::NoProviders => "no_providers",
            ProviderError::Exhausted(_) => "exhausted",
        }
    }

    fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => ProviderError::Auth(message),
            429 => ProviderError::RateLimit(message),
            _ => ProviderError::Http { status, message },
        }
    }
}

/// One provider's completion endpoint. The registry owns one client per
/// provider; tests swap in scripted implementations.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        request: &GatewayRequest,
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Builds the default HTTP client for a provider's wire format.
pub fn client_for(config: &ProviderConfig) -> Result<Box<dyn CompletionClient>, ProviderError> {
    let api_key = config
        .api_key_env
        .as_deref()
        .and_then(|name| std::env::var(name).ok());
    Ok(match config.wire {
        WireFormat::OpenAiChat => Box::new(OpenAiChatClient::new(config.clone(), api_key)?),
        WireFormat::AnthropicMessages => {
            Box::new(AnthropicMessagesClient::new(config.clone(), api_key)?)
        }
    })
}

fn build_http(config: &ProviderConfig) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(config.timeout())
        .build()
        .map_err(|e| ProviderError::Network(e.to_string()))
}

fn map_reqwest(config: &ProviderConfig, error: reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout(config.timeout())
    } else {
        ProviderError::Network(error.to_string())
    }
}

/// OpenAI-compatible `/chat/completions` client; also covers the fast
/// inference providers that speak the same wire format.
pub struct OpenAiChatClient {
    client: Client,
    config: ProviderConfig,
    api_key: Option<String>,
}

impl OpenAiChatClient {
    pub fn new(config: ProviderConfig, api_key: Option<String>) -> Result<Self, ProviderError> {
        let client = build_http(&config)?;
        Ok(Self {
            client,
            config,
            api_key,
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiChatClient {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        request: &GatewayRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            ProviderError::Auth(format!("{} API key not configured", self.config.provider_id))
        })?;
        let started = Instant::now();

        let mut payload = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }

        debug!(provider = %self.config.provider_id, model, "dispatching chat completion");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| map_reqwest(&self.config, e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, message));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let content = body["choices"]
            .as_array()
            .and_then(|choices| choices.first())
            .and_then(|choice| choice["message"]["content"].as_str())
            .ok_or_else(|| ProviderError::Parse("no choices in response".to_string()))?
            .to_string();
        let finish_reason = body["choices"][0]["finish_reason"]
            .as_str()
            .map(|s| s.to_string());

        let prompt_tokens = body["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let completion_tokens = body["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;

        Ok(ProviderResponse {
            content,
            model_used: model.to_string(),
            provider_id: self.config.provider_id.clone(),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost_usd: self.config.cost_for(prompt_tokens, completion_tokens),
            cost_currency: "USD".to_string(),
            response_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            finish_reason,
            success: true,
        })
    }
}

/// Anthropic `/v1/messages` client.
pub struct AnthropicMessagesClient {
    client: Client,
    config: ProviderConfig,
    api_key: Option<String>,
}

impl AnthropicMessagesClient {
    pub fn new(config: ProviderConfig, api_key: Option<String>) -> Result<Self, ProviderError> {
        let client = build_http(&config)?;
        Ok(Self {
            client,
            config,
            api_key,
        })
    }
}

#[async_trait]
impl CompletionClient for AnthropicMessagesClient {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        request: &GatewayRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            ProviderError::Auth(format!("{} API key not configured", self.config.provider_id))
        })?;
        let started = Instant::now();

        let payload = json!({
            "model": model,
            "max_tokens": request.max_tokens.unwrap_or(1024),
            "temperature": request.temperature,
            "messages": [{"role": "user", "content": prompt}],
        });

        debug!(provider = %self.config.provider_id, model, "dispatching messages completion");
        let response = self
            .client
            .post(format!("{}/v1/messages", self.config.base_url))
            .header("x-api-key", api_key)
            .header("Content-Type", "application/json")
            .header(
                "anthropic-version",
                self.config.api_version.as_deref().unwrap_or("2023-06-01"),
            )
            .json(&payload)
            .send()
            .await
            .map_err(|e| map_reqwest(&self.config, e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, message));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let content = body["content"]
            .as_array()
            .and_then(|blocks| blocks.first())
            .and_then(|block| block["text"].as_str())
            .ok_or_else(|| ProviderError::Parse("no content blocks in response".to_string()))?
            .to_string();

        let prompt_tokens = body["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
        let completion_tokens = body["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;

        Ok(ProviderResponse {
            content,
            model_used: model.to_string(),
            provider_id: self.config.provider_id.clone(),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost_usd: self.config.cost_for(prompt_tokens, completion_tokens),
            cost_currency: "USD".to_string(),
            response_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            finish_reason: body["stop_reason"].as_str().map(|s| s.to_string()),
            success: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(
            ProviderError::Timeout(std::time::Duration::from_secs(1)).kind(),
            "timeout"
        );
        assert_eq!(
            ProviderError::from_status(401, String::new()).kind(),
            "auth_error"
        );
        assert_eq!(
            ProviderError::from_status(429, String::new()).kind(),
            "rate_limited"
        );
        assert_eq!(
            ProviderError::from_status(500, String::new()).kind(),
            "http_error"
        );
    }
}
