//! Per-decision regret: the retrospective excess cost of the chosen
//! candidate versus the cheapest candidate that was viable at decision time.
//!
//! The viable set is recomputed here with the request's own safety grade and
//! the same quality/latency/shadow filters the selection engine applies.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use atp_core::registry::RegistrySnapshot;
use atp_core::{Candidate, ModelStatus, QualityTier, SafetyGrade};
use atp_observability::RouterMetrics;

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegretAnalysis {
    pub chosen_model: String,
    pub chosen_cost: f64,
    pub optimal_model: String,
    pub optimal_cost: f64,
    pub regret_amount: f64,
    pub regret_pct: f64,
    pub quality_requirement: QualityTier,
    pub latency_requirement_ms: u64,
    pub total_tokens: u64,
    pub viable_candidates: usize,
}

/// Aggregate view over a batch of analyses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegretSummary {
    pub total_analyses: usize,
    pub avg_regret_pct: f64,
    pub max_regret_pct: f64,
    pub regret_above_1pct_count: usize,
    pub regret_above_5pct_count: usize,
    pub perfect_decisions_pct: f64,
}

// ---------------------------------------------------------------------------
// RegretCalculator
// ---------------------------------------------------------------------------

pub struct RegretCalculator {
    metrics: Arc<RouterMetrics>,
}

impl RegretCalculator {
    pub fn new(metrics: Arc<RouterMetrics>) -> Self {
        Self { metrics }
    }

    /// Compute regret for a routing decision.
    ///
    /// An empty viable set yields a zero-regret analysis with
    /// `optimal_model = "none"`.
    pub fn calculate(
        &self,
        chosen: &Candidate,
        all_candidates: &[Candidate],
        snapshot: &RegistrySnapshot,
        quality: QualityTier,
        latency_slo_ms: u64,
        safety_required: SafetyGrade,
        total_tokens: u64,
    ) -> RegretAnalysis {
        let q_min = quality.min_quality();

        let viable: Vec<&Candidate> = all_candidates
            .iter()
            .filter(|c| match snapshot.get(&c.name) {
                Some(rec) => {
                    rec.status != ModelStatus::Shadow
                        && rec.safety_grade.permits(safety_required)
                }
                None => false,
            })
            .filter(|c| c.quality_pred >= q_min && c.latency_p95_ms <= latency_slo_ms)
            .collect();

        if viable.is_empty() {
            return RegretAnalysis {
                chosen_model: chosen.name.clone(),
                chosen_cost: 0.0,
                optimal_model: "none".to_string(),
                optimal_cost: 0.0,
                regret_amount: 0.0,
                regret_pct: 0.0,
                quality_requirement: quality,
                latency_requirement_ms: latency_slo_ms,
                total_tokens,
                viable_candidates: 0,
            };
        }

        let optimal = viable
            .iter()
            .min_by(|a, b| {
                a.cost_per_1k_tokens
                    .partial_cmp(&b.cost_per_1k_tokens)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("viable set is non-empty");

        let chosen_cost = chosen.cost_per_1k_tokens / 1000.0 * total_tokens as f64;
        let optimal_cost = optimal.cost_per_1k_tokens / 1000.0 * total_tokens as f64;
        let regret_amount = chosen_cost - optimal_cost;
        let regret_pct = if optimal_cost > 0.0 {
            regret_amount / optimal_cost * 100.0
        } else {
            0.0
        };

        self.metrics.regret_pct.observe(regret_pct);

        RegretAnalysis {
            chosen_model: chosen.name.clone(),
            chosen_cost,
            optimal_model: optimal.name.clone(),
            optimal_cost,
            regret_amount,
            regret_pct,
            quality_requirement: quality,
            latency_requirement_ms: latency_slo_ms,
            total_tokens,
            viable_candidates: viable.len(),
        }
    }

    /// Summarize a batch of analyses.
    pub fn summarize(analyses: &[RegretAnalysis]) -> RegretSummary {
        if analyses.is_empty() {
            return RegretSummary {
                total_analyses: 0,
                avg_regret_pct: 0.0,
                max_regret_pct: 0.0,
                regret_above_1pct_count: 0,
                regret_above_5pct_count: 0,
                perfect_decisions_pct: 0.0,
            };
        }

        let total: f64 = analyses.iter().map(|a| a.regret_pct).sum();
        let max = analyses
            .iter()
            .map(|a| a.regret_pct)
            .fold(f64::NEG_INFINITY, f64::max);
        let above_1 = analyses.iter().filter(|a| a.regret_pct > 1.0).count();
        let above_5 = analyses.iter().filter(|a| a.regret_pct > 5.0).count();
        let perfect = analyses.iter().filter(|a| a.regret_pct == 0.0).count();

        RegretSummary {
            total_analyses: analyses.len(),
            avg_regret_pct: total / analyses.len() as f64,
            max_regret_pct: max,
            regret_above_1pct_count: above_1,
            regret_above_5pct_count: above_5,
            perfect_decisions_pct: perfect as f64 / analyses.len() as f64 * 100.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
