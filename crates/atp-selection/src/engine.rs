//! Selection engine: viability filtering, carbon-aware ordering, live-pricing
//! enhancement, the budget pre-gate, strategy dispatch, exploration, local
//! preference, and the premium escalation slot.
//!
//! Per-candidate failures (scoring, stale pricing) skip the candidate and
//! bump a labeled counter; failures that invalidate the whole decision
//! surface as `NoViableCandidate` or `BudgetBlocked`.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use atp_core::config::{
    FallbackStrategy, PricingSettings, SelectionSettings, SelectionStrategy,
};
use atp_core::registry::RegistrySnapshot;
use atp_core::{
    BudgetGate, Candidate, Clock, ModelStatus, PlanRole, PlannedCandidate, RouteRequest,
    RouterError, SelectionPlan,
};
use atp_observability::RouterMetrics;
use atp_pricing::PricingCache;

use crate::carbon::CarbonTracker;
use crate::evaluator::{is_local_model, CandidateEvaluator, PerformanceTracker, PreferenceWeights};

/// Share of estimated tokens assumed to be input when projecting cost from
/// live per-token-type prices.
const INPUT_TOKEN_SHARE: f64 = 0.7;

/// Exploration only samples candidates scoring above this floor.
const EXPLORATION_SCORE_FLOOR: f64 = 0.5;

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateScore {
    pub name: String,
    pub score: f64,
    pub expected_cost_usd: f64,
}

/// Everything a caller or auditor wants to know about how a plan was built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionMetadata {
    pub strategy: SelectionStrategy,
    pub weights: PreferenceWeights,
    pub candidates_evaluated: usize,
    pub viable_count: usize,
    pub latency_widened: bool,
    pub throttle_factor: f64,
    pub exploration_applied: bool,
    pub local_preference_applied: bool,
    pub fallback_strategy_used: bool,
    pub carbon_aware: bool,
    pub scores: Vec<CandidateScore>,
}

// ---------------------------------------------------------------------------
// Internal scored candidate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Enhanced {
    candidate: Candidate,
    expected_cost_usd: f64,
}

#[derive(Debug, Clone)]
struct Scored {
    candidate: Candidate,
    expected_cost_usd: f64,
    score: f64,
}

/// Descending score; ties prefer lower cost, then lower latency, then name.
fn rank_cmp(a: &Scored, b: &Scored) -> Ordering {
    match b.score.partial_cmp(&a.score) {
        Some(Ordering::Equal) | None => {}
        Some(ord) => return ord,
    }
    match a
        .candidate
        .cost_per_1k_tokens
        .partial_cmp(&b.candidate.cost_per_1k_tokens)
    {
        Some(Ordering::Equal) | None => {}
        Some(ord) => return ord,
    }
    match a.candidate.latency_p95_ms.cmp(&b.candidate.latency_p95_ms) {
        Ordering::Equal => {}
        ord => return ord,
    }
    a.candidate.name.cmp(&b.candidate.name)
}

// ---------------------------------------------------------------------------
// SelectionEngine
// ---------------------------------------------------------------------------

pub struct SelectionEngine {
    settings: SelectionSettings,
    staleness_tolerance: Duration,
    evaluator: CandidateEvaluator,
    tracker: Arc<PerformanceTracker>,
    carbon: Arc<CarbonTracker>,
    pricing: Arc<PricingCache>,
    gate: Arc<dyn BudgetGate>,
    metrics: Arc<RouterMetrics>,
    clock: Arc<dyn Clock>,
}

impl SelectionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: SelectionSettings,
        pricing_settings: &PricingSettings,
        tracker: Arc<PerformanceTracker>,
        carbon: Arc<CarbonTracker>,
        pricing: Arc<PricingCache>,
        gate: Arc<dyn BudgetGate>,
        metrics: Arc<RouterMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            evaluator: CandidateEvaluator::new(settings.clone()),
            settings,
            staleness_tolerance: Duration::seconds(
                pricing_settings.staleness_tolerance_seconds as i64,
            ),
            tracker,
            carbon,
            pricing,
            gate,
            metrics,
            clock,
        }
    }

    pub fn performance_tracker(&self) -> &Arc<PerformanceTracker> {
        &self.tracker
    }

    /// Choose a plan for `request` against the current registry snapshot.
    pub async fn select(
        &self,
        snapshot: &RegistrySnapshot,
        request: &RouteRequest,
    ) -> Result<(SelectionPlan, SelectionMetadata), RouterError> {
        let weights =
            PreferenceWeights::resolve(&self.settings, request.tenant_id.as_deref(), request.project_id.as_deref())?;

        // Initial ordering: cost ascending, carbon-weighted when enabled.
        let mut ordered: Vec<Candidate> = snapshot.candidates().to_vec();
        ordered.sort_by(|a, b| {
            let wa = self.carbon.routing_weight(&a.region, a.cost_per_1k_tokens);
            let wb = self.carbon.routing_weight(&b.region, b.cost_per_1k_tokens);
            wa.partial_cmp(&wb).unwrap_or(Ordering::Equal)
        });

        // Eligibility: registered, not shadow, safety-compliant.
        let eligible: Vec<Candidate> = ordered
            .into_iter()
            .filter(|c| match snapshot.get(&c.name) {
                Some(rec) => {
                    rec.status != ModelStatus::Shadow
                        && rec.safety_grade.permits(request.safety_required)
                }
                None => {
                    self.metrics.candidates_skipped.bump("unregistered");
                    false
                }
            })
            .collect();
        if eligible.is_empty() {
            return Err(RouterError::NoViableCandidate);
        }

        // Enhance with projected costs (live pricing when fresh).
        let enhanced: Vec<Enhanced> = eligible
            .iter()
            .filter_map(|c| {
                self.estimate_cost(c, request.estimated_tokens).map(|cost| Enhanced {
                    candidate: c.clone(),
                    expected_cost_usd: cost,
                })
            })
            .collect();
        if enhanced.is_empty() {
            return Err(RouterError::NoViableCandidate);
        }

        let q_min = request.quality.min_quality();
        let latency_viable: Vec<Enhanced> = enhanced
            .iter()
            .filter(|e| e.candidate.latency_p95_ms <= request.latency_slo_ms)
            .cloned()
            .collect();
        let viable: Vec<Enhanced> = latency_viable
            .iter()
            .filter(|e| e.candidate.quality_pred >= q_min)
            .cloned()
            .collect();

        // Strategy pool, widening when the full filter leaves nothing.
        let (pool, latency_widened) = match self.settings.strategy {
            SelectionStrategy::PureCost | SelectionStrategy::PureQuality => {
                if latency_viable.is_empty() {
                    (enhanced.clone(), true)
                } else {
                    (latency_viable.clone(), false)
                }
            }
            _ => {
                if viable.is_empty() {
                    (enhanced.clone(), true)
                } else {
                    (viable.clone(), false)
                }
            }
        };

        // Budget gate on the cheapest projected cost in the pool.
        let cheapest_cost = pool
            .iter()
            .map(|e| e.expected_cost_usd)
            .fold(f64::INFINITY, f64::min);
        let admission = self
            .gate
            .check_request(
                request.tenant_id.as_deref(),
                request.project_id.as_deref(),
                Some(cheapest_cost),
            )
            .await;
        if !admission.allowed {
            return Err(RouterError::BudgetBlocked {
                reasons: admission.reasons,
            });
        }

        // Strategy dispatch with fallback on internal failure.
        let mut fallback_strategy_used = false;
        let strategy_result = self.run_strategy(self.settings.strategy, &pool, &weights);
        let (mut entries, scores, exploration_applied) = match strategy_result {
            Ok(ok) => ok,
            Err(err) => {
                warn!(%err, strategy = ?self.settings.strategy, "primary strategy failed, invoking fallback");
                self.metrics
                    .strategy_errors
                    .bump(strategy_name(self.settings.strategy));
                fallback_strategy_used = true;
                let entries = self.run_fallback(&pool)?;
                (entries, Vec::new(), false)
            }
        };

        // Local preference: a viable local model above the quality floor is
        // promoted to position 0.
        let mut local_preference_applied = false;
        if self.settings.local_model_preference {
            let best_local = viable
                .iter()
                .filter(|e| is_local_model(&e.candidate.name))
                .max_by(|a, b| {
                    a.candidate
                        .quality_pred
                        .partial_cmp(&b.candidate.quality_pred)
                        .unwrap_or(Ordering::Equal)
                });
            if let Some(local) = best_local {
                if local.candidate.quality_pred >= self.settings.min_quality_threshold
                    && entries.first().map(|e| e.candidate.name != local.candidate.name) == Some(true)
                {
                    entries.retain(|e| e.candidate.name != local.candidate.name);
                    entries.insert(
                        0,
                        PlannedCandidate {
                            candidate: local.candidate.clone(),
                            role: PlanRole::LocalPreference,
                            expected_cost_usd: local.expected_cost_usd,
                        },
                    );
                    local_preference_applied = true;
                }
            }
        }

        // Premium escalation: the most (carbon-weighted) expensive eligible
        // candidate closes the plan as a last resort.
        if let Some(premium) = enhanced.iter().max_by(|a, b| {
            let wa = self
                .carbon
                .routing_weight(&a.candidate.region, a.candidate.cost_per_1k_tokens);
            let wb = self
                .carbon
                .routing_weight(&b.candidate.region, b.candidate.cost_per_1k_tokens);
            wa.partial_cmp(&wb).unwrap_or(Ordering::Equal)
        }) {
            if !entries.iter().any(|e| e.candidate.name == premium.candidate.name) {
                entries.push(PlannedCandidate {
                    candidate: premium.candidate.clone(),
                    role: PlanRole::PremiumFallback,
                    expected_cost_usd: premium.expected_cost_usd,
                });
            }
        }

        if entries.is_empty() {
            return Err(RouterError::NoViableCandidate);
        }

        debug!(
            primary = %entries[0].candidate.name,
            plan_len = entries.len(),
            latency_widened,
            "selection completed"
        );

        let metadata = SelectionMetadata {
            strategy: self.settings.strategy,
            weights,
            candidates_evaluated: snapshot.candidates().len(),
            viable_count: viable.len(),
            latency_widened,
            throttle_factor: admission.throttle_factor,
            exploration_applied,
            local_preference_applied,
            fallback_strategy_used,
            carbon_aware: self.carbon.is_enabled(),
            scores,
        };

        Ok((SelectionPlan { entries }, metadata))
    }

    /// Projected request cost. Live pricing wins when the cache entry is
    /// fresh within the staleness tolerance; a stale entry falls back to the
    /// static price unless configured to skip the candidate.
    fn estimate_cost(&self, candidate: &Candidate, estimated_tokens: u64) -> Option<f64> {
        if let Some(entry) = self.pricing.get(&candidate.provider, &candidate.name) {
            if !entry.is_stale(self.clock.now(), self.staleness_tolerance) {
                let input =
                    estimated_tokens as f64 * INPUT_TOKEN_SHARE / 1000.0 * entry.input_per_1k;
                let output = estimated_tokens as f64 * (1.0 - INPUT_TOKEN_SHARE) / 1000.0
                    * entry.output_per_1k;
                return Some(input + output);
            }
            if !self.settings.fallback_to_static_pricing {
                self.metrics.candidates_skipped.bump("stale_pricing");
                return None;
            }
        }
        Some(candidate.static_cost(estimated_tokens))
    }

    #[allow(clippy::type_complexity)]
    fn run_strategy(
        &self,
        strategy: SelectionStrategy,
        pool: &[Enhanced],
        weights: &PreferenceWeights,
    ) -> Result<(Vec<PlannedCandidate>, Vec<CandidateScore>, bool), RouterError> {
        match strategy {
            SelectionStrategy::CostAwareBandit => self.scored_selection(pool, weights, true),
            SelectionStrategy::Balanced => self.scored_selection(pool, weights, false),
            SelectionStrategy::PureCost => {
                let best = pool
                    .iter()
                    .min_by(|a, b| {
                        a.expected_cost_usd
                            .partial_cmp(&b.expected_cost_usd)
                            .unwrap_or(Ordering::Equal)
                    })
                    .ok_or(RouterError::NoViableCandidate)?;
                Ok((
                    vec![PlannedCandidate {
                        candidate: best.candidate.clone(),
                        role: PlanRole::Primary,
                        expected_cost_usd: best.expected_cost_usd,
                    }],
                    Vec::new(),
                    false,
                ))
            }
            SelectionStrategy::PureQuality => {
                let best = pool
                    .iter()
                    .max_by(|a, b| {
                        a.candidate
                            .quality_pred
                            .partial_cmp(&b.candidate.quality_pred)
                            .unwrap_or(Ordering::Equal)
                    })
                    .ok_or(RouterError::NoViableCandidate)?;
                Ok((
                    vec![PlannedCandidate {
                        candidate: best.candidate.clone(),
                        role: PlanRole::Primary,
                        expected_cost_usd: best.expected_cost_usd,
                    }],
                    Vec::new(),
                    false,
                ))
            }
        }
    }

    /// Weighted scoring shared by the bandit and balanced strategies. The
    /// bandit additionally samples an exploration candidate.
    #[allow(clippy::type_complexity)]
    fn scored_selection(
        &self,
        pool: &[Enhanced],
        weights: &PreferenceWeights,
        explore: bool,
    ) -> Result<(Vec<PlannedCandidate>, Vec<CandidateScore>, bool), RouterError> {
        let mut scored: Vec<Scored> = Vec::with_capacity(pool.len());
        for enhanced in pool {
            let multiplier = self.tracker.multiplier(&enhanced.candidate.name);
            match self.evaluator.score(
                &enhanced.candidate,
                weights,
                enhanced.expected_cost_usd,
                multiplier,
            ) {
                Ok(score) => scored.push(Scored {
                    candidate: enhanced.candidate.clone(),
                    expected_cost_usd: enhanced.expected_cost_usd,
                    score,
                }),
                Err(err) => {
                    warn!(model = %enhanced.candidate.name, %err, "scoring failed, candidate skipped");
                    self.metrics.candidates_skipped.bump("scoring_error");
                }
            }
        }
        if scored.is_empty() {
            return Err(RouterError::Internal(
                "all candidates failed scoring".into(),
            ));
        }

        scored.sort_by(rank_cmp);

        let score_records: Vec<CandidateScore> = scored
            .iter()
            .map(|s| CandidateScore {
                name: s.candidate.name.clone(),
                score: s.score,
                expected_cost_usd: s.expected_cost_usd,
            })
            .collect();

        let mut entries = vec![PlannedCandidate {
            candidate: scored[0].candidate.clone(),
            role: PlanRole::Primary,
            expected_cost_usd: scored[0].expected_cost_usd,
        }];

        let mut exploration_applied = false;
        if explore
            && scored.len() > 1
            && self.tracker.total_observations() >= self.settings.min_exploration_requests
        {
            let mut rng = rand::thread_rng();
            if rng.gen::<f64>() < self.settings.exploration_rate {
                let explorable: Vec<&Scored> = scored[1..]
                    .iter()
                    .filter(|s| s.score > EXPLORATION_SCORE_FLOOR)
                    .collect();
                if !explorable.is_empty() {
                    let pick = explorable[rng.gen_range(0..explorable.len())];
                    entries.push(PlannedCandidate {
                        candidate: pick.candidate.clone(),
                        role: PlanRole::Exploration,
                        expected_cost_usd: pick.expected_cost_usd,
                    });
                    exploration_applied = true;
                }
            }
        }

        Ok((entries, score_records, exploration_applied))
    }

    fn run_fallback(&self, pool: &[Enhanced]) -> Result<Vec<PlannedCandidate>, RouterError> {
        let best = match self.settings.fallback_strategy {
            FallbackStrategy::CheapestViable => pool.iter().min_by(|a, b| {
                a.expected_cost_usd
                    .partial_cmp(&b.expected_cost_usd)
                    .unwrap_or(Ordering::Equal)
            }),
            FallbackStrategy::BestQuality => pool.iter().max_by(|a, b| {
                a.candidate
                    .quality_pred
                    .partial_cmp(&b.candidate.quality_pred)
                    .unwrap_or(Ordering::Equal)
            }),
        };
        let best = best.ok_or(RouterError::NoViableCandidate)?;
        Ok(vec![PlannedCandidate {
            candidate: best.candidate.clone(),
            role: PlanRole::Primary,
            expected_cost_usd: best.expected_cost_usd,
        }])
    }
}

fn strategy_name(strategy: SelectionStrategy) -> &'static str {
    match strategy {
        SelectionStrategy::CostAwareBandit => "cost_aware_bandit",
        SelectionStrategy::PureCost => "pure_cost",
        SelectionStrategy::PureQuality => "pure_quality",
        SelectionStrategy::Balanced => "balanced",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
