use chrono::{DateTime, Datelike, Duration, FixedOffset, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::request::GatewayRequest;

/// Floor for the pre-call cost estimate.
const MINIMUM_ESTIMATED_COST: f64 = 0.001;
/// Baseline price per 1k estimated tokens.
const BASE_COST_PER_1K_TOKENS: f64 = 0.002;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetLevel {
    User,
    Team,
    Company,
}

impl BudgetLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetLevel::User => "user",
            BudgetLevel::Team => "team",
            BudgetLevel::Company => "company",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatus {
    Approved,
    Warning,
    Exceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub level: BudgetLevel,
    pub entity_id: String,
    pub period: BudgetPeriod,
    pub limit_usd: f64,
    pub warning_threshold: f64,
    #[serde(default)]
    pub rollover: bool,
    #[serde(default)]
    pub emergency_limit: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<(), BudgetError> {
        if self.limit_usd <= 0.0 {
            return Err(BudgetError::InvalidConfig(format!(
                "limit_usd must be positive, got {}",
                self.limit_usd
            )));
        }
        if !(0.0..=1.0).contains(&self.warning_threshold) {
            return Err(BudgetError::InvalidConfig(format!(
                "warning_threshold must be in [0, 1], got {}",
                self.warning_threshold
            )));
        }
        if let Some(emergency) = self.emergency_limit {
            if emergency < self.limit_usd {
                return Err(BudgetError::InvalidConfig(
                    "emergency_limit must be at least limit_usd".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetUsage {
    pub level: BudgetLevel,
    pub entity_id: String,
    pub period: BudgetPeriod,

    pub used_usd: f64,
    pub remaining_usd: f64,
    pub usage_percentage: f64,

    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,

    pub status: BudgetStatus,
    pub is_warning: bool,
    pub is_exceeded: bool,

    pub last_updated: DateTime<Utc>,
    pub request_count: u64,
}

/// Outcome of the admission check for one request.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetAuthorization {
    pub approved: bool,
    pub status: BudgetStatus,

    pub level: BudgetLevel,
    pub entity_id: String,

    pub current_usage: f64,
    pub budget_limit: f64,
    pub remaining_budget: f64,

    pub estimated_cost: f64,
    pub would_exceed: bool,

    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetSummary {
    pub level: BudgetLevel,
    pub entity_id: String,
    pub period: BudgetPeriod,
    pub limit_usd: f64,
    pub used_usd: f64,
    pub remaining_usd: f64,
    pub usage_percentage: f64,
    pub status: BudgetStatus,
    pub is_warning: bool,
    pub is_exceeded: bool,
    pub request_count: u64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetAlert {
    pub level: BudgetLevel,
    pub entity_id: String,
    pub alert_type: String,
    pub message: String,
    pub threshold: f64,
    pub current_usage: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("negative cost {0} rejected")]
    NegativeCost(f64),
    #[error("invalid budget config: {0}")]
    InvalidConfig(String),
}

/// Per-level fallback limits applied to entities without an explicit config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultBudget {
    pub period: BudgetPeriod,
    pub limit_usd: f64,
    pub warning_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetDefaults {
    pub user: DefaultBudget,
    pub team: DefaultBudget,
    pub company: DefaultBudget,
}

impl Default for BudgetDefaults {
    fn default() -> Self {
        Self {
            user: DefaultBudget {
                period: BudgetPeriod::Monthly,
                limit_usd: 100.0,
                warning_threshold: 0.8,
            },
            team: DefaultBudget {
                period: BudgetPeriod::Monthly,
                limit_usd: 1_000.0,
                warning_threshold: 0.8,
            },
            company: DefaultBudget {
                period: BudgetPeriod::Monthly,
                limit_usd: 10_000.0,
                warning_threshold: 0.8,
            },
        }
    }
}

/// The current [start, end) window for a period, aligned to the configured
/// fixed UTC offset: calendar day, Monday week, first-of-month, first-of-year.
pub fn window_bounds(
    period: BudgetPeriod,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let local = now.with_timezone(&offset);
    let today = local.date_naive();

    let start_date = match period {
        BudgetPeriod::Daily => today,
        BudgetPeriod::Weekly => {
            today - Duration::days(today.weekday().num_days_from_monday() as i64)
        }
        BudgetPeriod::Monthly => first_of_month(today),
        BudgetPeriod::Yearly => {
            NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today)
        }
    };
    let end_date = match period {
        BudgetPeriod::Daily => start_date + Duration::days(1),
        BudgetPeriod::Weekly => start_date + Duration::weeks(1),
        BudgetPeriod::Monthly => start_date
            .checked_add_months(Months::new(1))
            .unwrap_or(start_date + Duration::days(31)),
        BudgetPeriod::Yearly => start_date
            .checked_add_months(Months::new(12))
            .unwrap_or(start_date + Duration::days(365)),
    };

    (local_midnight_utc(start_date, offset), local_midnight_utc(end_date, offset))
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn local_midnight_utc(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    let shifted = naive - Duration::seconds(offset.local_minus_utc() as i64);
    DateTime::<Utc>::from_naive_utc_and_offset(shifted, Utc)
}

/// Admits or denies requests against the user -> team -> company spending
/// hierarchy and records actual spend after successful completions.
///
/// Admission and debit are not transactionally atomic: the warning threshold
/// gives slack before the hard limit, and the next admission observes any
/// burst overrun and denies.
pub struct BudgetController {
    configs: RwLock<HashMap<String, BudgetConfig>>,
    usage: RwLock<HashMap<String, BudgetUsage>>,
    defaults: BudgetDefaults,
    offset: FixedOffset,
    cost_multipliers: HashMap<String, f64>,
}

impl BudgetController {
    pub fn new(defaults: BudgetDefaults, offset: FixedOffset) -> Self {
        let mut cost_multipliers = HashMap::new();
        cost_multipliers.insert("groq".to_string(), 0.7);
        cost_multipliers.insert("anthropic".to_string(), 1.5);
        Self {
            configs: RwLock::new(HashMap::new()),
            usage: RwLock::new(HashMap::new()),
            defaults,
            offset,
            cost_multipliers,
        }
    }

    pub fn with_cost_multipliers(mut self, multipliers: HashMap<String, f64>) -> Self {
        self.cost_multipliers = multipliers;
        self
    }

    pub async fn add_config(&self, config: BudgetConfig) -> Result<(), BudgetError> {
        config.validate()?;
        let key = scope_key(config.level, &config.entity_id);
        self.configs.write().await.insert(key, config);
        Ok(())
    }

    /// Pre-call cost estimate: base price scaled by complexity, provider
    /// family and temperature, floored at $0.001.
    pub fn estimate_request_cost(&self, request: &GatewayRequest, complexity_score: f64) -> f64 {
        let estimated_tokens = (request.prompt.chars().count() / 4) as f64;
        let complexity_multiplier = 1.0 + complexity_score * 2.0;
        let provider_multiplier = request
            .provider
            .as_deref()
            .and_then(|p| self.cost_multipliers.get(p))
            .copied()
            .unwrap_or(1.0);
        let temperature_multiplier = 1.0 + request.temperature * 0.5;

        let estimated = BASE_COST_PER_1K_TOKENS
            * (estimated_tokens / 1000.0)
            * complexity_multiplier
            * provider_multiplier
            * temperature_multiplier;
        estimated.max(MINIMUM_ESTIMATED_COST)
    }

    pub async fn check_authorization(
        &self,
        request: &GatewayRequest,
        estimated_cost: f64,
    ) -> BudgetAuthorization {
        self.check_authorization_at(request, estimated_cost, Utc::now())
            .await
    }

    /// Walks every applicable scope. A scope whose projected spend strictly
    /// exceeds its limit denies immediately; a scope at or past its warning
    /// threshold marks the authorization but deeper scopes are still checked.
    pub async fn check_authorization_at(
        &self,
        request: &GatewayRequest,
        estimated_cost: f64,
        now: DateTime<Utc>,
    ) -> BudgetAuthorization {
        let mut warning: Option<BudgetAuthorization> = None;
        let mut last_scope: Option<(BudgetConfig, BudgetUsage)> = None;

        for (level, entity_id) in scopes(request) {
            let config = self.config_for(level, &entity_id).await;
            let usage = self.current_usage(&config, &entity_id, now).await;

            let projected = usage.used_usd + estimated_cost;
            if projected > config.limit_usd {
                debug!(
                    scope = level.as_str(),
                    entity = %entity_id,
                    used = usage.used_usd,
                    limit = config.limit_usd,
                    estimated_cost,
                    "budget admission denied"
                );
                return BudgetAuthorization {
                    approved: false,
                    status: BudgetStatus::Exceeded,
                    level,
                    entity_id,
                    current_usage: usage.used_usd,
                    budget_limit: config.limit_usd,
                    remaining_budget: usage.remaining_usd,
                    estimated_cost,
                    would_exceed: true,
                    message: format!(
                        "request would exceed the {} budget limit",
                        level.as_str()
                    ),
                    warning_message: None,
                };
            }

            let projected_percentage = projected / config.limit_usd;
            if projected_percentage >= config.warning_threshold && warning.is_none() {
                warning = Some(BudgetAuthorization {
                    approved: true,
                    status: BudgetStatus::Warning,
                    level,
                    entity_id: entity_id.clone(),
                    current_usage: usage.used_usd,
                    budget_limit: config.limit_usd,
                    remaining_budget: config.limit_usd - projected,
                    estimated_cost,
                    would_exceed: false,
                    message: format!(
                        "approved, {} budget at {:.1}%",
                        level.as_str(),
                        projected_percentage * 100.0
                    ),
                    warning_message: Some(format!(
                        "approaching the {} budget limit",
                        level.as_str()
                    )),
                });
            }

            last_scope = Some((config, usage));
        }

        if let Some(warning) = warning {
            return warning;
        }

        match last_scope {
            Some((config, usage)) => BudgetAuthorization {
                approved: true,
                status: BudgetStatus::Approved,
                level: config.level,
                entity_id: usage.entity_id.clone(),
                current_usage: usage.used_usd,
                budget_limit: config.limit_usd,
                remaining_budget: usage.remaining_usd,
                estimated_cost,
                would_exceed: false,
                message: "request approved".to_string(),
                warning_message: None,
            },
            // Unreachable in practice: user_id is mandatory.
            None => BudgetAuthorization {
                approved: true,
                status: BudgetStatus::Approved,
                level: BudgetLevel::User,
                entity_id: request.user_id.clone(),
                current_usage: 0.0,
                budget_limit: 0.0,
                remaining_budget: 0.0,
                estimated_cost,
                would_exceed: false,
                message: "request approved".to_string(),
                warning_message: None,
            },
        }
    }

    pub async fn record_usage(
        &self,
        request: &GatewayRequest,
        actual_cost: f64,
    ) -> Result<(), BudgetError> {
        self.record_usage_at(request, actual_cost, Utc::now()).await
    }

    /// Debits every applicable scope. Called only after a successful
    /// provider completion; cache hits never reach this.
    pub async fn record_usage_at(
        &self,
        request: &GatewayRequest,
        actual_cost: f64,
        now: DateTime<Utc>,
    ) -> Result<(), BudgetError> {
        if actual_cost < 0.0 {
            return Err(BudgetError::NegativeCost(actual_cost));
        }

        for (level, entity_id) in scopes(request) {
            let config = self.config_for(level, &entity_id).await;
            let key = scope_key(level, &entity_id);

            let mut usage_map = self.usage.write().await;
            let usage = usage_map
                .entry(key)
                .and_modify(|u| roll_if_stale(u, &config, now, self.offset))
                .or_insert_with(|| fresh_usage(&config, &entity_id, now, self.offset));

            usage.used_usd += actual_cost;
            usage.request_count += 1;
            usage.last_updated = now;
            recompute(usage, &config);

            if usage.is_exceeded {
                warn!(
                    scope = level.as_str(),
                    entity = %entity_id,
                    used = usage.used_usd,
                    limit = config.limit_usd,
                    "budget exceeded after debit"
                );
            }
        }
        Ok(())
    }

    pub async fn summary(&self, level: BudgetLevel, entity_id: &str) -> BudgetSummary {
        self.summary_at(level, entity_id, Utc::now()).await
    }

    pub async fn summary_at(
        &self,
        level: BudgetLevel,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> BudgetSummary {
        let config = self.config_for(level, entity_id).await;
        let usage = self.current_usage(&config, entity_id, now).await;
        BudgetSummary {
            level,
            entity_id: entity_id.to_string(),
            period: config.period,
            limit_usd: config.limit_usd,
            used_usd: usage.used_usd,
            remaining_usd: usage.remaining_usd,
            usage_percentage: usage.usage_percentage,
            status: usage.status,
            is_warning: usage.is_warning,
            is_exceeded: usage.is_exceeded,
            request_count: usage.request_count,
            period_start: usage.period_start,
            period_end: usage.period_end,
            last_updated: usage.last_updated,
        }
    }

    /// One summary per scope present on the request, user first.
    pub async fn hierarchy_summary(&self, request: &GatewayRequest) -> Vec<BudgetSummary> {
        let mut summaries = Vec::new();
        for (level, entity_id) in scopes(request) {
            summaries.push(self.summary(level, &entity_id).await);
        }
        summaries
    }

    pub async fn alerts(&self, level: BudgetLevel, entity_id: &str) -> Vec<BudgetAlert> {
        let config = self.config_for(level, entity_id).await;
        let usage = self.current_usage(&config, entity_id, Utc::now()).await;
        let mut alerts = Vec::new();

        if usage.is_warning && !usage.is_exceeded {
            alerts.push(BudgetAlert {
                level,
                entity_id: entity_id.to_string(),
                alert_type: "warning".to_string(),
                message: format!(
                    "{} budget at {:.1}%",
                    level.as_str(),
                    usage.usage_percentage * 100.0
                ),
                threshold: config.warning_threshold,
                current_usage: usage.used_usd,
                created_at: Utc::now(),
            });
        }
        if usage.is_exceeded {
            alerts.push(BudgetAlert {
                level,
                entity_id: entity_id.to_string(),
                alert_type: "exceeded".to_string(),
                message: format!("{} budget has been exceeded", level.as_str()),
                threshold: 1.0,
                current_usage: usage.used_usd,
                created_at: Utc::now(),
            });
        }
        alerts
    }

    async fn config_for(&self, level: BudgetLevel, entity_id: &str) -> BudgetConfig {
        let key = scope_key(level, entity_id);
        if let Some(config) = self.configs.read().await.get(&key) {
            return config.clone();
        }
        let default = match level {
            BudgetLevel::User => &self.defaults.user,
            BudgetLevel::Team => &self.defaults.team,
            BudgetLevel::Company => &self.defaults.company,
        };
        BudgetConfig {
            level,
            entity_id: entity_id.to_string(),
            period: default.period,
            limit_usd: default.limit_usd,
            warning_threshold: default.warning_threshold,
            rollover: false,
            emergency_limit: None,
            description: None,
        }
    }

    /// The usage row for the current window, rolling a stale one first.
    async fn current_usage(
        &self,
        config: &BudgetConfig,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> BudgetUsage {
        let key = scope_key(config.level, entity_id);
        let mut usage_map = self.usage.write().await;
        let usage = usage_map
            .entry(key)
            .and_modify(|u| roll_if_stale(u, config, now, self.offset))
            .or_insert_with(|| fresh_usage(config, entity_id, now, self.offset));
        usage.clone()
    }
}

fn scope_key(level: BudgetLevel, entity_id: &str) -> String {
    format!("{}:{}", level.as_str(), entity_id)
}

fn scopes(request: &GatewayRequest) -> Vec<(BudgetLevel, String)> {
    let mut scopes = vec![(BudgetLevel::User, request.user_id.clone())];
    if let Some(team_id) = &request.team_id {
        scopes.push((BudgetLevel::Team, team_id.clone()));
    }
    if let Some(company_id) = &request.company_id {
        scopes.push((BudgetLevel::Company, company_id.clone()));
    }
    scopes
}

fn fresh_usage(
    config: &BudgetConfig,
    entity_id: &str,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> BudgetUsage {
    let (period_start, period_end) = window_bounds(config.period, now, offset);
    BudgetUsage {
        level: config.level,
        entity_id: entity_id.to_string(),
        period: config.period,
        used_usd: 0.0,
        remaining_usd: config.limit_usd,
        usage_percentage: 0.0,
        period_start,
        period_end,
        status: BudgetStatus::Approved,
        is_warning: false,
        is_exceeded: false,
        last_updated: now,
        request_count: 0,
    }
}

/// Rolls a usage row whose stored window no longer matches the clock.
/// Accumulated spend carries into the new window iff rollover is set.
fn roll_if_stale(
    usage: &mut BudgetUsage,
    config: &BudgetConfig,
    now: DateTime<Utc>,
    offset: FixedOffset,
) {
    let (period_start, period_end) = window_bounds(config.period, now, offset);
    if usage.period_start == period_start && usage.period == config.period {
        return;
    }
    let carried = if config.rollover { usage.used_usd } else { 0.0 };
    usage.period = config.period;
    usage.period_start = period_start;
    usage.period_end = period_end;
    usage.used_usd = carried;
    usage.request_count = 0;
    usage.last_updated = now;
    recompute(usage, config);
}

fn recompute(usage: &mut BudgetUsage, config: &BudgetConfig) {
    usage.remaining_usd = (config.limit_usd - usage.used_usd).max(0.0);
    usage.usage_percentage = if config.limit_usd > 0.0 {
        usage.used_usd / config.limit_usd
    } else {
        0.0
    };
    if usage.usage_percentage >= 1.0 {
        usage.status = BudgetStatus::Exceeded;
        usage.is_exceeded = true;
        usage.is_warning = false;
    } else if usage.usage_percentage >= config.warning_threshold {
        usage.status = BudgetStatus::Warning;
        usage.is_warning = true;
        usage.is_exceeded = false;
    } else {
        usage.status = BudgetStatus::Approved;
        usage.is_warning = false;
        usage.is_exceeded = false;
    }
}
