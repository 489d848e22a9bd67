//! Candidate evaluation: preference vectors, composite scoring, and the
//! rolling performance multiplier.
//!
//! Scoring is deterministic for fixed inputs. Local models get configurable
//! cost/quality bonuses and a latency penalty when local preference is on.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use atp_core::config::{SelectionSettings, WeightOverride};
use atp_core::{Candidate, RouterError};

/// Name fragments that mark a model as locally hosted.
pub const LOCAL_MODEL_INDICATORS: &[&str] = &[
    "llama", "mistral", "vicuna", "alpaca", "falcon", "mpt", "dolly", "stablelm", "redpajama",
    "openchat", "wizard", "orca", "phi",
];

pub fn is_local_model(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    LOCAL_MODEL_INDICATORS.iter().any(|ind| lower.contains(ind))
}

// ---------------------------------------------------------------------------
// Preference weights
// ---------------------------------------------------------------------------

/// Resolved preference vector. Always sums to 1 after [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreferenceWeights {
    pub cost: f64,
    pub quality: f64,
    pub latency: f64,
}

impl PreferenceWeights {
    /// Base weights -> tenant override -> project override, renormalized.
    ///
    /// A vector summing to zero after merging is a configuration bug and
    /// fails the decision.
    pub fn resolve(
        settings: &SelectionSettings,
        tenant_id: Option<&str>,
        project_id: Option<&str>,
    ) -> Result<Self, RouterError> {
        let mut cost = settings.cost_weight;
        let mut quality = settings.quality_weight;
        let mut latency = settings.latency_weight;

        let mut apply = |ovr: &WeightOverride| {
            if let Some(c) = ovr.cost_weight {
                cost = c;
            }
            if let Some(q) = ovr.quality_weight {
                quality = q;
            }
            if let Some(l) = ovr.latency_weight {
                latency = l;
            }
        };

        if let Some(tenant) = tenant_id {
            if let Some(ovr) = settings.tenant_preferences.get(tenant) {
                apply(ovr);
            }
        }
        if let Some(project) = project_id {
            if let Some(ovr) = settings.project_preferences.get(project) {
                apply(ovr);
            }
        }

        let total = cost + quality + latency;
        if total <= 0.0 {
            return Err(RouterError::Internal(
                "preference weights sum to zero".into(),
            ));
        }
        Ok(Self {
            cost: cost / total,
            quality: quality / total,
            latency: latency / total,
        })
    }

    pub fn sum(&self) -> f64 {
        self.cost + self.quality + self.latency
    }
}

// ---------------------------------------------------------------------------
// Performance tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct PerfSample {
    success: bool,
    quality: f64,
    /// actual latency / expected latency.
    latency_ratio: f64,
}

/// Rolling per-model performance observations feeding the score multiplier.
pub struct PerformanceTracker {
    window: usize,
    samples: Mutex<HashMap<String, VecDeque<PerfSample>>>,
}

impl PerformanceTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            samples: Mutex::new(HashMap::new()),
        }
    }

    /// Record a completed request against `model`.
    pub fn record(&self, model: &str, success: bool, quality: f64, latency_ratio: f64) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let window = samples.entry(model.to_string()).or_default();
        window.push_back(PerfSample {
            success,
            quality,
            latency_ratio,
        });
        while window.len() > self.window {
            window.pop_front();
        }
    }

    /// Observations recorded for one model.
    pub fn observation_count(&self, model: &str) -> u64 {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(model)
            .map(|w| w.len() as u64)
            .unwrap_or(0)
    }

    /// Observations across the whole pool.
    pub fn total_observations(&self) -> u64 {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|w| w.len() as u64)
            .sum()
    }

    /// Performance multiplier in `[0.5, 1.5]`. Models without history sit at
    /// the neutral 1.0.
    pub fn multiplier(&self, model: &str) -> f64 {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let window = match samples.get(model) {
            Some(w) if !w.is_empty() => w,
            _ => return 1.0,
        };

        let n = window.len() as f64;
        let success_rate = window.iter().filter(|s| s.success).count() as f64 / n;
        let avg_quality = window.iter().map(|s| s.quality).sum::<f64>() / n;
        let avg_latency_ratio = window.iter().map(|s| s.latency_ratio).sum::<f64>() / n;

        let multiplier =
            success_rate * 0.4 + avg_quality * 0.4 + (1.0 / avg_latency_ratio.max(0.1)) * 0.2;
        multiplier.clamp(0.5, 1.5)
    }
}

// ---------------------------------------------------------------------------
// CandidateEvaluator
// ---------------------------------------------------------------------------

/// Computes the composite score for one candidate under a preference vector.
pub struct CandidateEvaluator {
    settings: SelectionSettings,
}

impl CandidateEvaluator {
    pub fn new(settings: SelectionSettings) -> Self {
        Self { settings }
    }

    /// Composite score in `[0, 1]`.
    ///
    /// `estimated_cost_usd` is the projected request cost (live pricing when
    /// fresh, static otherwise). `performance_multiplier` comes from the
    /// rolling tracker and lands in `[0.5, 1.5]`.
    pub fn score(
        &self,
        candidate: &Candidate,
        weights: &PreferenceWeights,
        estimated_cost_usd: f64,
        performance_multiplier: f64,
    ) -> Result<f64, RouterError> {
        if estimated_cost_usd < 0.0 {
            return Err(RouterError::Internal(format!(
                "negative cost projection for {}",
                candidate.name
            )));
        }

        let mut cost_score = 1.0 / (1.0 + estimated_cost_usd * 10.0);
        let mut quality_score = candidate.quality_pred;
        let mut latency_score = 1.0 / (1.0 + candidate.latency_p95_ms as f64 / 1000.0);

        if self.settings.local_model_preference && is_local_model(&candidate.name) {
            cost_score *= 1.0 + self.settings.local_model_cost_multiplier;
            quality_score += self.settings.local_model_quality_bonus;
            latency_score /= self.settings.local_model_latency_penalty;
        }

        let composite = weights.cost * cost_score
            + weights.quality * quality_score
            + weights.latency * latency_score;

        Ok((composite * performance_multiplier).clamp(0.0, 1.0))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
