//! Multi-dimensional cost aggregation.
//!
//! Sums are fixed-point micro-USD atomics keyed per dimension, so writers
//! never block readers and every per-key total is monotonic non-decreasing.
//! When the orchestrator supplies a live-pricing projection alongside an
//! actual cost, the delta is validated against the configured tolerance.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use atp_core::{CostRecord, RouterError};
use atp_observability::{Alert, AlertEmitter, AlertSeverity};

fn to_micro(usd: f64) -> u64 {
    (usd * 1_000_000.0).round() as u64
}

fn from_micro(micro: u64) -> f64 {
    micro as f64 / 1_000_000.0
}

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationStats {
    pub total_validations: u64,
    pub validation_errors: u64,
    pub error_rate: f64,
}

/// Point-in-time view of every aggregation dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub usd_by_qos: BTreeMap<String, f64>,
    pub usd_by_provider: BTreeMap<String, f64>,
    pub usd_by_model: BTreeMap<String, f64>,
    pub usd_by_tenant: BTreeMap<String, f64>,
    pub usd_by_project: BTreeMap<String, f64>,
    pub tokens_by_provider: BTreeMap<String, TokenUsage>,
    pub tokens_by_model: BTreeMap<String, TokenUsage>,
    pub requests_by_provider: BTreeMap<String, u64>,
    pub requests_by_model: BTreeMap<String, u64>,
    pub total_cost_usd: f64,
    pub total_requests: u64,
    pub pricing_validation: ValidationStats,
}

// ---------------------------------------------------------------------------
// CostAggregator
// ---------------------------------------------------------------------------

struct TokenCounters {
    input: AtomicU64,
    output: AtomicU64,
}

pub struct CostAggregator {
    usd_by_qos: DashMap<String, AtomicU64>,
    usd_by_provider: DashMap<String, AtomicU64>,
    usd_by_model: DashMap<String, AtomicU64>,
    usd_by_tenant: DashMap<String, AtomicU64>,
    usd_by_project: DashMap<String, AtomicU64>,
    tokens_by_provider: DashMap<String, TokenCounters>,
    tokens_by_model: DashMap<String, TokenCounters>,
    requests_by_provider: DashMap<String, AtomicU64>,
    requests_by_model: DashMap<String, AtomicU64>,
    total_micro: AtomicU64,
    total_requests: AtomicU64,
    validation_total: AtomicU64,
    validation_errors: AtomicU64,
    validation_tolerance_percent: f64,
    emitter: Arc<AlertEmitter>,
}

impl CostAggregator {
    pub fn new(validation_tolerance_percent: f64, emitter: Arc<AlertEmitter>) -> Self {
        Self {
            usd_by_qos: DashMap::new(),
            usd_by_provider: DashMap::new(),
            usd_by_model: DashMap::new(),
            usd_by_tenant: DashMap::new(),
            usd_by_project: DashMap::new(),
            tokens_by_provider: DashMap::new(),
            tokens_by_model: DashMap::new(),
            requests_by_provider: DashMap::new(),
            requests_by_model: DashMap::new(),
            total_micro: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            validation_total: AtomicU64::new(0),
            validation_errors: AtomicU64::new(0),
            validation_tolerance_percent,
            emitter,
        }
    }

    /// Record one completed request. Negative costs are a bug upstream and
    /// fail the record without touching any counter.
    pub fn record(&self, record: &CostRecord) -> Result<(), RouterError> {
        if record.cost_usd < 0.0 {
            return Err(RouterError::Internal(format!(
                "negative cost {} for decision {}",
                record.cost_usd, record.decision_id
            )));
        }
        let micro = to_micro(record.cost_usd);

        add(&self.usd_by_qos, &record.qos.to_string(), micro);
        add(&self.usd_by_provider, &record.provider, micro);
        add(&self.usd_by_model, &record.model, micro);
        if let Some(tenant) = &record.tenant_id {
            add(&self.usd_by_tenant, tenant, micro);
        }
        if let Some(project) = &record.project_id {
            add(&self.usd_by_project, project, micro);
        }

        for (map, key) in [
            (&self.tokens_by_provider, &record.provider),
            (&self.tokens_by_model, &record.model),
        ] {
            let counters = map.entry(key.clone()).or_insert_with(|| TokenCounters {
                input: AtomicU64::new(0),
                output: AtomicU64::new(0),
            });
            counters.input.fetch_add(record.input_tokens, Ordering::Relaxed);
            counters.output.fetch_add(record.output_tokens, Ordering::Relaxed);
        }

        add(&self.requests_by_provider, &record.provider, 1);
        add(&self.requests_by_model, &record.model, 1);
        self.total_micro.fetch_add(micro, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Validate an observed cost against the live-pricing projection.
    /// Returns whether the observation stayed within tolerance.
    pub fn validate_cost(&self, record: &CostRecord, expected_cost: f64) -> bool {
        self.validation_total.fetch_add(1, Ordering::Relaxed);
        if expected_cost <= 0.0 {
            return true;
        }
        let delta_pct = (record.cost_usd - expected_cost).abs() / expected_cost * 100.0;
        let within = delta_pct <= self.validation_tolerance_percent;
        if !within {
            self.validation_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                model = %record.model,
                expected = expected_cost,
                actual = record.cost_usd,
                delta_pct,
                "cost deviates from pricing projection"
            );
            self.emitter.emit(
                Alert::new(
                    "pricing_validation",
                    AlertSeverity::Medium,
                    format!("pricing_validation::{}:{}", record.provider, record.model),
                    serde_json::json!({
                        "provider": record.provider,
                        "model": record.model,
                        "expected_cost": expected_cost,
                        "actual_cost": record.cost_usd,
                        "delta_percent": delta_pct,
                    }),
                )
                .with_label("provider", record.provider.clone())
                .with_label("model", record.model.clone()),
            );
        }
        within
    }

    pub fn total_cost_usd(&self) -> f64 {
        from_micro(self.total_micro.load(Ordering::Relaxed))
    }

    pub fn tenant_cost_usd(&self, tenant: &str) -> f64 {
        self.usd_by_tenant
            .get(tenant)
            .map(|c| from_micro(c.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }

    /// Consistent snapshot of all dimensions. Concurrent writers may land
    /// between map reads; every individual key is still a monotonic total.
    pub fn snapshot(&self) -> CostSnapshot {
        CostSnapshot {
            usd_by_qos: usd_map(&self.usd_by_qos),
            usd_by_provider: usd_map(&self.usd_by_provider),
            usd_by_model: usd_map(&self.usd_by_model),
            usd_by_tenant: usd_map(&self.usd_by_tenant),
            usd_by_project: usd_map(&self.usd_by_project),
            tokens_by_provider: token_map(&self.tokens_by_provider),
            tokens_by_model: token_map(&self.tokens_by_model),
            requests_by_provider: count_map(&self.requests_by_provider),
            requests_by_model: count_map(&self.requests_by_model),
            total_cost_usd: self.total_cost_usd(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            pricing_validation: self.validation_stats(),
        }
    }

    pub fn validation_stats(&self) -> ValidationStats {
        let total = self.validation_total.load(Ordering::Relaxed);
        let errors = self.validation_errors.load(Ordering::Relaxed);
        ValidationStats {
            total_validations: total,
            validation_errors: errors,
            error_rate: if total > 0 {
                errors as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

fn add(map: &DashMap<String, AtomicU64>, key: &str, amount: u64) {
    if let Some(counter) = map.get(key) {
        counter.fetch_add(amount, Ordering::Relaxed);
        return;
    }
    map.entry(key.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(amount, Ordering::Relaxed);
}

fn usd_map(map: &DashMap<String, AtomicU64>) -> BTreeMap<String, f64> {
    map.iter()
        .map(|e| (e.key().clone(), from_micro(e.load(Ordering::Relaxed))))
        .collect()
}

fn count_map(map: &DashMap<String, AtomicU64>) -> BTreeMap<String, u64> {
    map.iter()
        .map(|e| (e.key().clone(), e.load(Ordering::Relaxed)))
        .collect()
}

fn token_map(map: &DashMap<String, TokenCounters>) -> BTreeMap<String, TokenUsage> {
    map.iter()
        .map(|e| {
            (
                e.key().clone(),
                TokenUsage {
                    input_tokens: e.input.load(Ordering::Relaxed),
                    output_tokens: e.output.load(Ordering::Relaxed),
                },
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
