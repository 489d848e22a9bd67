//! Env-driven configuration for the routing core.
//!
//! Every knob has a default matching production behavior; `from_env()`
//! overrides from the enumerated environment keys. The config is read once
//! at startup and threaded through the dependency container.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// Strategy enums
// ---------------------------------------------------------------------------

/// Primary selection strategy. Each variant is a pure function over
/// `(candidates, preferences, context)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    CostAwareBandit,
    PureCost,
    PureQuality,
    Balanced,
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cost_aware_bandit" => Ok(SelectionStrategy::CostAwareBandit),
            "pure_cost" => Ok(SelectionStrategy::PureCost),
            "pure_quality" => Ok(SelectionStrategy::PureQuality),
            "balanced" => Ok(SelectionStrategy::Balanced),
            other => Err(format!("unknown selection strategy: {other}")),
        }
    }
}

/// Strategy invoked when the primary strategy raises internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    CheapestViable,
    BestQuality,
}

impl FromStr for FallbackStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cheapest_viable" => Ok(FallbackStrategy::CheapestViable),
            "best_quality" => Ok(FallbackStrategy::BestQuality),
            other => Err(format!("unknown fallback strategy: {other}")),
        }
    }
}

/// What the alert channel does when full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Producer blocks until the consumer drains.
    Block,
    /// Newest event is dropped and a counter incremented.
    DropNewest,
}

// ---------------------------------------------------------------------------
// Per-tenant / per-project weight overrides
// ---------------------------------------------------------------------------

/// Partial preference-vector override, merged over the base weights and
/// renormalized afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightOverride {
    #[serde(default)]
    pub cost_weight: Option<f64>,
    #[serde(default)]
    pub quality_weight: Option<f64>,
    #[serde(default)]
    pub latency_weight: Option<f64>,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionSettings {
    pub strategy: SelectionStrategy,
    pub fallback_strategy: FallbackStrategy,
    pub cost_weight: f64,
    pub quality_weight: f64,
    pub latency_weight: f64,
    pub min_quality_threshold: f64,
    pub local_model_preference: bool,
    pub local_model_cost_multiplier: f64,
    pub local_model_quality_bonus: f64,
    pub local_model_latency_penalty: f64,
    pub exploration_rate: f64,
    pub min_exploration_requests: u64,
    pub fallback_to_static_pricing: bool,
    pub tenant_preferences: HashMap<String, WeightOverride>,
    pub project_preferences: HashMap<String, WeightOverride>,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::CostAwareBandit,
            fallback_strategy: FallbackStrategy::CheapestViable,
            cost_weight: 0.4,
            quality_weight: 0.4,
            latency_weight: 0.2,
            min_quality_threshold: 0.7,
            local_model_preference: true,
            local_model_cost_multiplier: 0.0,
            local_model_quality_bonus: 0.05,
            local_model_latency_penalty: 1.2,
            exploration_rate: 0.05,
            min_exploration_requests: 10,
            fallback_to_static_pricing: true,
            tenant_preferences: HashMap::new(),
            project_preferences: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingSettings {
    pub update_interval_seconds: u64,
    pub staleness_tolerance_seconds: u64,
    pub cache_ttl_seconds: u64,
    /// Percent change per token type that emits a `PricingChange`.
    pub change_threshold_percent: f64,
    /// Percent change that escalates the alert to high severity.
    pub significant_change_percent: f64,
    pub api_timeout_seconds: u64,
    pub retry_attempts: u32,
    pub retry_delay_seconds: u64,
    pub validation_tolerance_percent: f64,
    /// Capacity of the pricing-change ring; newest wins on overflow.
    pub change_log_capacity: usize,
}

impl Default for PricingSettings {
    fn default() -> Self {
        Self {
            update_interval_seconds: 300,
            staleness_tolerance_seconds: 3600,
            cache_ttl_seconds: 300,
            change_threshold_percent: 5.0,
            significant_change_percent: 20.0,
            api_timeout_seconds: 10,
            retry_attempts: 3,
            retry_delay_seconds: 1,
            validation_tolerance_percent: 10.0,
            change_log_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSettings {
    pub warning_threshold_percent: f64,
    pub critical_threshold_percent: f64,
    pub enforcement_enabled: bool,
    /// How long a critical block stays cached.
    pub block_duration_seconds: u64,
    pub alert_cooldown_seconds: u64,
    /// Monthly budgets in USD, keyed by tenant id.
    pub tenant_budgets: HashMap<String, f64>,
    /// Monthly budgets in USD, keyed by project id.
    pub project_budgets: HashMap<String, f64>,
    /// Hourly request caps, keyed by tenant id.
    pub tenant_rate_limits: HashMap<String, u64>,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            warning_threshold_percent: 80.0,
            critical_threshold_percent: 95.0,
            enforcement_enabled: true,
            block_duration_seconds: 3600,
            alert_cooldown_seconds: 3600,
            tenant_budgets: HashMap::new(),
            project_budgets: HashMap::new(),
            tenant_rate_limits: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalySettings {
    pub threshold_std: f64,
    pub window_hours: u64,
    pub min_requests: usize,
    pub baseline_update_interval_seconds: u64,
    /// Ring capacity of retained data points.
    pub max_points: usize,
    /// Number of most-recent points used for baseline statistics.
    pub baseline_window: usize,
}

impl Default for AnomalySettings {
    fn default() -> Self {
        Self {
            threshold_std: 2.5,
            window_hours: 24,
            min_requests: 10,
            baseline_update_interval_seconds: 3600,
            max_points: 1000,
            baseline_window: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarbonSettings {
    pub enabled: bool,
    /// Region -> grid carbon intensity in gCO2e/kWh.
    pub region_intensity: HashMap<String, f64>,
}

impl Default for CarbonSettings {
    fn default() -> Self {
        let mut region_intensity = HashMap::new();
        region_intensity.insert("us-west".to_string(), 250.0);
        region_intensity.insert("us-east".to_string(), 380.0);
        region_intensity.insert("eu-west".to_string(), 190.0);
        region_intensity.insert("asia-east".to_string(), 540.0);
        Self {
            enabled: true,
            region_intensity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSettings {
    pub channel_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub cooldown_seconds: u64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            overflow_policy: OverflowPolicy::DropNewest,
            cooldown_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentSettings {
    pub max_executions_per_hour: u32,
}

impl Default for IncidentSettings {
    fn default() -> Self {
        Self {
            max_executions_per_hour: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// RouterConfig
// ---------------------------------------------------------------------------

/// Top-level configuration, built once at process start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub selection: SelectionSettings,
    #[serde(default)]
    pub pricing: PricingSettings,
    #[serde(default)]
    pub budget: BudgetSettings,
    #[serde(default)]
    pub anomaly: AnomalySettings,
    #[serde(default)]
    pub carbon: CarbonSettings,
    #[serde(default)]
    pub alerts: AlertSettings,
    #[serde(default)]
    pub incidents: IncidentSettings,
}

impl RouterConfig {
    /// Build configuration from the environment, falling back to defaults
    /// for any unset or unparsable key (unparsable values are logged).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        // Selection
        if let Some(s) = env_parsed::<SelectionStrategy>("SELECTION_STRATEGY") {
            cfg.selection.strategy = s;
        }
        if let Some(s) = env_parsed::<FallbackStrategy>("FALLBACK_STRATEGY") {
            cfg.selection.fallback_strategy = s;
        }
        env_f64("SELECTION_COST_WEIGHT", &mut cfg.selection.cost_weight);
        env_f64("SELECTION_QUALITY_WEIGHT", &mut cfg.selection.quality_weight);
        env_f64("SELECTION_LATENCY_WEIGHT", &mut cfg.selection.latency_weight);
        env_f64("MIN_QUALITY_THRESHOLD", &mut cfg.selection.min_quality_threshold);
        env_bool("LOCAL_MODEL_PREFERENCE", &mut cfg.selection.local_model_preference);
        env_f64(
            "LOCAL_MODEL_COST_MULTIPLIER",
            &mut cfg.selection.local_model_cost_multiplier,
        );
        env_f64(
            "LOCAL_MODEL_QUALITY_BONUS",
            &mut cfg.selection.local_model_quality_bonus,
        );
        env_f64(
            "LOCAL_MODEL_LATENCY_PENALTY",
            &mut cfg.selection.local_model_latency_penalty,
        );
        env_f64("ROUTER_EXPLORE_P", &mut cfg.selection.exploration_rate);
        env_u64(
            "MIN_EXPLORATION_REQUESTS",
            &mut cfg.selection.min_exploration_requests,
        );
        env_bool(
            "FALLBACK_TO_STATIC_PRICING",
            &mut cfg.selection.fallback_to_static_pricing,
        );
        if let Some(map) = env_json_map::<WeightOverride>("TENANT_PREFERENCES") {
            cfg.selection.tenant_preferences = map;
        }
        if let Some(map) = env_json_map::<WeightOverride>("PROJECT_PREFERENCES") {
            cfg.selection.project_preferences = map;
        }

        // Pricing
        env_u64(
            "PRICING_UPDATE_INTERVAL",
            &mut cfg.pricing.update_interval_seconds,
        );
        env_u64(
            "PRICING_STALENESS_TOLERANCE",
            &mut cfg.pricing.staleness_tolerance_seconds,
        );
        env_u64("PRICING_CACHE_TTL", &mut cfg.pricing.cache_ttl_seconds);
        env_f64(
            "PRICING_CHANGE_THRESHOLD",
            &mut cfg.pricing.change_threshold_percent,
        );
        env_f64(
            "SIGNIFICANT_CHANGE_PERCENT",
            &mut cfg.pricing.significant_change_percent,
        );
        env_u64("PRICING_API_TIMEOUT", &mut cfg.pricing.api_timeout_seconds);
        env_u32("PRICING_RETRY_ATTEMPTS", &mut cfg.pricing.retry_attempts);
        env_u64("PRICING_RETRY_DELAY", &mut cfg.pricing.retry_delay_seconds);
        env_f64(
            "VALIDATION_TOLERANCE_PERCENT",
            &mut cfg.pricing.validation_tolerance_percent,
        );

        // Budget
        env_f64(
            "BUDGET_WARNING_THRESHOLD_PERCENT",
            &mut cfg.budget.warning_threshold_percent,
        );
        env_f64(
            "BUDGET_CRITICAL_THRESHOLD_PERCENT",
            &mut cfg.budget.critical_threshold_percent,
        );
        env_bool("BUDGET_ENFORCEMENT_ENABLED", &mut cfg.budget.enforcement_enabled);
        if let Some(map) = env_json_map::<f64>("TENANT_BUDGETS") {
            cfg.budget.tenant_budgets = map;
        }
        if let Some(map) = env_json_map::<f64>("PROJECT_BUDGETS") {
            cfg.budget.project_budgets = map;
        }
        if let Some(map) = env_json_map::<u64>("TENANT_RATE_LIMITS") {
            cfg.budget.tenant_rate_limits = map;
        }

        // Anomaly
        env_f64("ANOMALY_THRESHOLD_STD", &mut cfg.anomaly.threshold_std);
        env_u64("ANOMALY_WINDOW_HOURS", &mut cfg.anomaly.window_hours);

        // Carbon
        env_bool("CARBON_AWARE", &mut cfg.carbon.enabled);

        // Incidents
        env_u32(
            "MAX_EXECUTIONS_PER_HOUR",
            &mut cfg.incidents.max_executions_per_hour,
        );

        cfg
    }
}

// ---------------------------------------------------------------------------
// Env parsing helpers
// ---------------------------------------------------------------------------

fn env_raw(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_raw(key)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "unparsable config value ignored");
            None
        }
    }
}

fn env_f64(key: &str, slot: &mut f64) {
    if let Some(v) = env_parsed::<f64>(key) {
        *slot = v;
    }
}

fn env_u64(key: &str, slot: &mut u64) {
    if let Some(v) = env_parsed::<u64>(key) {
        *slot = v;
    }
}

fn env_u32(key: &str, slot: &mut u32) {
    if let Some(v) = env_parsed::<u32>(key) {
        *slot = v;
    }
}

fn env_bool(key: &str, slot: &mut bool) {
    if let Some(raw) = env_raw(key) {
        *slot = matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes");
    }
}

fn env_json_map<T: serde::de::DeserializeOwned>(key: &str) -> Option<HashMap<String, T>> {
    let raw = env_raw(key)?;
    match serde_json::from_str(&raw) {
        Ok(map) => Some(map),
        Err(err) => {
            warn!(key, %err, "unparsable JSON config value ignored");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
