use chrono::{FixedOffset, Offset};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::budget::{BudgetAlert, BudgetController, BudgetSummary};
use crate::cache::{CacheLevel, CacheManager, CacheTier, MemoryTier, PostgresTier, RedisTier};
use crate::complexity::ComplexityAnalyzer;
use crate::config::Config;
use crate::optimizer::PromptOptimizer;
use crate::providers::ProviderRegistry;
use crate::request::{GatewayRequest, GatewayResponse};

/// Orchestrates the fixed routing pipeline:
/// optimize -> analyze -> estimate -> admit -> cache lookup -> select ->
/// execute with fallbacks -> debit -> cache store -> respond.
///
/// The router owns no business logic of its own; it holds handles to the
/// components and sequences them. Every failure path returns a structured
/// unsuccessful response carrying the latency measured so far.
pub struct Router {
    optimizer: PromptOptimizer,
    analyzer: ComplexityAnalyzer,
    budget: BudgetController,
    cache: CacheManager,
    registry: ProviderRegistry,
}

impl Router {
    pub fn new(
        optimizer: PromptOptimizer,
        analyzer: ComplexityAnalyzer,
        budget: BudgetController,
        cache: CacheManager,
        registry: ProviderRegistry,
    ) -> Self {
        Self {
            optimizer,
            analyzer,
            budget,
            cache,
            registry,
        }
    }

    /// Wires every component from configuration, connecting the shared
    /// cache tiers when URLs are present and falling back to in-process
    /// tiers otherwise.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let l2_ttl = Duration::from_secs(config.cache.l2_ttl_seconds);
        let l2: Arc<dyn CacheTier> = match &config.cache.l2_url {
            Some(url) => Arc::new(RedisTier::connect(url, l2_ttl).await?),
            None => Arc::new(MemoryTier::new(CacheLevel::L2, l2_ttl)),
        };
        let l3_ttl = Duration::from_secs(config.cache.l3_ttl_seconds);
        let l3: Arc<dyn CacheTier> = match &config.cache.l3_url {
            Some(url) => Arc::new(PostgresTier::connect(url, l3_ttl).await?),
            None => Arc::new(MemoryTier::new(CacheLevel::L3, l3_ttl)),
        };
        let cache = CacheManager::new(
            config.cache.l1_capacity,
            Duration::from_secs(config.cache.l1_ttl_seconds),
            l2,
            l3,
        );

        let offset = FixedOffset::east_opt(config.budget.timezone_offset_hours * 3600)
            .unwrap_or_else(|| chrono::Utc.fix());
        let budget = BudgetController::new(config.budget.defaults.clone(), offset)
            .with_cost_multipliers(config.budget.cost_multipliers.clone());
        for scope in &config.budget.scopes {
            budget.add_config(scope.clone()).await?;
        }

        let registry = ProviderRegistry::from_configs(config.providers.clone())?;

        Ok(Self::new(
            PromptOptimizer::new(),
            ComplexityAnalyzer::new(config.complexity.clone()),
            budget,
            cache,
            registry,
        ))
    }

    pub async fn route(&self, mut request: GatewayRequest) -> GatewayResponse {
        let started = Instant::now();
        let request_id = request.ensure_request_id();
        debug!(request_id = %request_id, user = %request.user_id, "routing request");

        // 1-2. Canonicalize; an empty canonical prompt has nothing to route.
        let canonical = self.optimizer.optimize(&request.prompt);
        if canonical.trim().is_empty() {
            return GatewayResponse::failure(
                &request,
                "internal: empty prompt",
                elapsed_ms(started),
            );
        }
        let optimization = self.optimizer.stats(&request.prompt, &canonical);

        // 3. Complexity.
        let complexity = self.analyzer.analyze(&request.prompt);

        // 4-5. Budget admission. Denial short-circuits before cache and
        // providers.
        let estimated_cost = self
            .budget
            .estimate_request_cost(&request, complexity.overall_score);
        let admission = self.budget.check_authorization(&request, estimated_cost).await;
        if !admission.approved {
            info!(
                request_id = %request_id,
                scope = admission.level.as_str(),
                entity = %admission.entity_id,
                "request denied by budget admission"
            );
            let mut response = GatewayResponse::failure(
                &request,
                format!("budget exceeded: {}", admission.message),
                elapsed_ms(started),
            );
            response.metadata.insert(
                "budget_status".to_string(),
                json!(admission.status),
            );
            response
                .metadata
                .insert("budget_scope".to_string(), json!(admission.level.as_str()));
            response.metadata.insert(
                "remaining_budget_usd".to_string(),
                json!(admission.remaining_budget),
            );
            return response;
        }

        // 6. Cache lookup; a hit skips debit and providers entirely.
        let lookup = self.cache.lookup(&canonical).await;
        if let Some(entry) = lookup.entry.clone().filter(|_| lookup.hit) {
            debug!(
                request_id = %request_id,
                level = ?lookup.level,
                "served from cache"
            );
            let mut response = GatewayResponse {
                content: entry.value,
                model_used: entry.model_used,
                provider_used: entry.provider_used,
                prompt_tokens: entry.prompt_tokens,
                completion_tokens: entry.completion_tokens,
                total_tokens: entry.total_tokens,
                cost_usd: entry.cost_usd,
                cost_currency: "USD".to_string(),
                latency_ms: elapsed_ms(started),
                cache_hit: true,
                cache_level: lookup.level.map(|l| l.as_str().to_string()),
                request_id: request_id.clone(),
                user_id: request.user_id.clone(),
                success: true,
                error: None,
                created_at: chrono::Utc::now(),
                metadata: Default::default(),
            };
            response
                .metadata
                .insert("complexity_level".to_string(), json!(complexity.level));
            response
                .metadata
                .insert("budget_status".to_string(), json!(admission.status));
            response.metadata.insert(
                "cache_lookup_time_ms".to_string(),
                json!(lookup.lookup_time_ms),
            );
            response.metadata.insert(
                "cache_levels_checked".to_string(),
                json!(lookup.levels_checked),
            );
            return response;
        }

        // 7. Select and execute with fallbacks.
        let selection = match self.registry.select(&complexity).await {
            Ok(selection) => selection,
            Err(error) => {
                return GatewayResponse::failure(
                    &request,
                    format!("all providers failed: {error}"),
                    elapsed_ms(started),
                );
            }
        };

        let provider_response = match self
            .registry
            .execute_chain(&canonical, &selection, &request)
            .await
        {
            Ok(response) => response,
            Err(error) => {
                // Provider exhaustion never debits the budget.
                return GatewayResponse::failure(
                    &request,
                    format!("all providers failed: {error}"),
                    elapsed_ms(started),
                );
            }
        };

        // 8. Debit actual cost, then store. Neither failure reaches the
        // caller.
        if let Err(error) = self
            .budget
            .record_usage(&request, provider_response.cost_usd)
            .await
        {
            warn!(request_id = %request_id, %error, "budget debit rejected");
        }
        let store = self.cache.store(&canonical, &provider_response).await;
        if !store.success {
            warn!(request_id = %request_id, "cache store failed on every tier");
        }

        // 9. Respond.
        let mut response = GatewayResponse {
            content: provider_response.content,
            model_used: provider_response.model_used,
            provider_used: provider_response.provider_id,
            prompt_tokens: provider_response.prompt_tokens,
            completion_tokens: provider_response.completion_tokens,
            total_tokens: provider_response.total_tokens,
            cost_usd: provider_response.cost_usd,
            cost_currency: provider_response.cost_currency,
            latency_ms: elapsed_ms(started),
            cache_hit: false,
            cache_level: None,
            request_id,
            user_id: request.user_id.clone(),
            success: true,
            error: None,
            created_at: chrono::Utc::now(),
            metadata: Default::default(),
        };
        response
            .metadata
            .insert("complexity_level".to_string(), json!(complexity.level));
        response.metadata.insert(
            "complexity_score".to_string(),
            json!(complexity.overall_score),
        );
        response.metadata.insert(
            "optimization_reduction".to_string(),
            json!(optimization.reduction_percentage),
        );
        response.metadata.insert(
            "provider_selection".to_string(),
            json!(selection.selection_reason),
        );
        response
            .metadata
            .insert("budget_status".to_string(), json!(admission.status));
        response.metadata.insert(
            "estimated_cost_usd".to_string(),
            json!(estimated_cost),
        );
        response.metadata.insert(
            "cache_lookup_time_ms".to_string(),
            json!(lookup.lookup_time_ms),
        );
        response
    }

    /// System-wide snapshot: cache tiers, provider metrics, analyzer cache.
    pub async fn system_stats(&self) -> serde_json::Value {
        let cache_stats = self.cache.stats().await;
        let provider_metrics = self.registry.metrics_snapshot().await;
        json!({
            "cache_stats": cache_stats,
            "overall_cache_hit_rate": self.cache.overall_hit_rate().await,
            "provider_metrics": provider_metrics,
            "complexity_cache_entries": self.analyzer.cache_len(),
            "timestamp": chrono::Utc::now(),
        })
    }

    pub async fn budget_summary(&self, request: &GatewayRequest) -> Vec<BudgetSummary> {
        self.budget.hierarchy_summary(request).await
    }

    /// Warning and exceeded alerts across every scope on the request.
    pub async fn budget_alerts(&self, request: &GatewayRequest) -> Vec<BudgetAlert> {
        let mut alerts = Vec::new();
        for summary in self.budget.hierarchy_summary(request).await {
            alerts.extend(self.budget.alerts(summary.level, &summary.entity_id).await);
        }
        alerts
    }

    pub async fn clear_caches(&self) {
        self.cache.clear().await;
        self.analyzer.clear_cache();
        info!("all caches cleared");
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
