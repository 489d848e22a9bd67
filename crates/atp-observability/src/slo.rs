//! Rolling-window SLO tracking.
//!
//! Four targets ship by default: availability, latency_p95, error_rate, and
//! cost_efficiency. Each observation feeds every target's window; a 60-second
//! recomputation pass derives the current percentage, error-budget
//! consumption, and status. A transition into `Critical` emits an
//! `slo_violation` alert keyed `slo_violation::<name>`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use atp_core::Clock;

use crate::alerts::{Alert, AlertEmitter, AlertSeverity};

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloTarget {
    pub name: String,
    pub description: String,
    /// e.g. 99.9 for 99.9 %.
    pub target_pct: f64,
    pub measurement_window_s: u64,
    pub error_budget_window_s: u64,
    /// Percentage below which the status becomes `Warning`.
    pub alert_threshold_pct: f64,
}

/// Default SLO targets for the routing core.
pub fn default_slo_targets() -> Vec<SloTarget> {
    vec![
        SloTarget {
            name: "availability".into(),
            description: "System availability".into(),
            target_pct: 99.9,
            measurement_window_s: 3600,
            error_budget_window_s: 86_400,
            alert_threshold_pct: 99.5,
        },
        SloTarget {
            name: "latency_p95".into(),
            description: "95th percentile response latency".into(),
            target_pct: 95.0,
            measurement_window_s: 300,
            error_budget_window_s: 3600,
            alert_threshold_pct: 90.0,
        },
        SloTarget {
            name: "error_rate".into(),
            description: "Request success rate".into(),
            target_pct: 99.0,
            measurement_window_s: 300,
            error_budget_window_s: 3600,
            alert_threshold_pct: 95.0,
        },
        SloTarget {
            name: "cost_efficiency".into(),
            description: "Cost per successful request within budget".into(),
            target_pct: 95.0,
            measurement_window_s: 3600,
            error_budget_window_s: 86_400,
            alert_threshold_pct: 90.0,
        },
    ]
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SloStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloState {
    pub current_pct: f64,
    /// Share of the error budget consumed over the budget window, 0–100.
    pub error_budget_consumed: f64,
    pub status: SloStatus,
    pub last_updated: DateTime<Utc>,
    pub violations_count: u64,
}

/// One routed request's contribution to the SLO windows.
#[derive(Debug, Clone, Copy)]
pub struct SloObservation {
    /// The dispatch completed without an infrastructure error.
    pub available: bool,
    /// The request succeeded end to end.
    pub success: bool,
    /// Observed latency met the request's SLO.
    pub within_latency: bool,
    /// Actual cost stayed within the per-request budget projection.
    pub within_cost_budget: bool,
}

// ---------------------------------------------------------------------------
// SloTracker
// ---------------------------------------------------------------------------

pub struct SloTracker {
    targets: Vec<SloTarget>,
    windows: Mutex<HashMap<String, VecDeque<(DateTime<Utc>, bool)>>>,
    states: RwLock<HashMap<String, SloState>>,
    emitter: Arc<AlertEmitter>,
    clock: Arc<dyn Clock>,
}

impl SloTracker {
    pub fn new(targets: Vec<SloTarget>, emitter: Arc<AlertEmitter>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let states = targets
            .iter()
            .map(|t| {
                (
                    t.name.clone(),
                    SloState {
                        current_pct: 100.0,
                        error_budget_consumed: 0.0,
                        status: SloStatus::Healthy,
                        last_updated: now,
                        violations_count: 0,
                    },
                )
            })
            .collect();
        let windows = targets
            .iter()
            .map(|t| (t.name.clone(), VecDeque::new()))
            .collect();
        Self {
            targets,
            windows: Mutex::new(windows),
            states: RwLock::new(states),
            emitter,
            clock,
        }
    }

    pub fn with_defaults(emitter: Arc<AlertEmitter>, clock: Arc<dyn Clock>) -> Self {
        Self::new(default_slo_targets(), emitter, clock)
    }

    /// Record one request's outcome into every target window.
    pub fn record(&self, obs: SloObservation) {
        let now = self.clock.now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        for target in &self.targets {
            let ok = match target.name.as_str() {
                "availability" => obs.available,
                "latency_p95" => obs.within_latency,
                "error_rate" => obs.success,
                "cost_efficiency" => obs.within_cost_budget,
                other => {
                    warn!(target = other, "unknown SLO target, skipping observation");
                    continue;
                }
            };
            let window = windows.entry(target.name.clone()).or_default();
            window.push_back((now, ok));
            // Trim beyond the error-budget window; recompute re-filters for
            // the shorter measurement window.
            let horizon = now - Duration::seconds(target.error_budget_window_s as i64);
            while window.front().map_or(false, |(ts, _)| *ts < horizon) {
                window.pop_front();
            }
        }
    }

    /// Recompute every target's state. Runs on a 60-second cadence.
    pub fn recompute(&self) {
        let now = self.clock.now();
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());

        for target in &self.targets {
            let window = match windows.get(&target.name) {
                Some(w) => w,
                None => continue,
            };

            let measurement_horizon = now - Duration::seconds(target.measurement_window_s as i64);
            let current_pct = pct_ok(window.iter().filter(|(ts, _)| *ts >= measurement_horizon));
            let budget_pct = pct_ok(window.iter());

            let allowed_failure = 100.0 - target.target_pct;
            let actual_failure = 100.0 - budget_pct;
            let error_budget_consumed = if allowed_failure <= 0.0 {
                if actual_failure > 0.0 {
                    100.0
                } else {
                    0.0
                }
            } else {
                (actual_failure / allowed_failure * 100.0).clamp(0.0, 100.0)
            };

            let status = if current_pct >= target.target_pct {
                SloStatus::Healthy
            } else if current_pct >= target.alert_threshold_pct {
                SloStatus::Warning
            } else {
                SloStatus::Critical
            };

            let state = match states.get_mut(&target.name) {
                Some(state) => state,
                None => continue,
            };
            let entered_critical =
                status == SloStatus::Critical && state.status != SloStatus::Critical;

            state.current_pct = current_pct;
            state.error_budget_consumed = error_budget_consumed;
            state.last_updated = now;
            if entered_critical {
                state.violations_count += 1;
                self.emitter.emit(
                    Alert::new(
                        "slo_violation",
                        AlertSeverity::Critical,
                        format!("slo_violation::{}", target.name),
                        serde_json::json!({
                            "slo": target.name,
                            "current_pct": current_pct,
                            "target_pct": target.target_pct,
                            "error_budget_consumed": error_budget_consumed,
                        }),
                    )
                    .with_label("slo", target.name.clone()),
                );
            }
            state.status = status;
        }
    }

    pub fn state(&self, name: &str) -> Option<SloState> {
        self.states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn states(&self) -> HashMap<String, SloState> {
        self.states.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Worst status across all targets.
    pub fn overall_status(&self) -> SloStatus {
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        if states.values().any(|s| s.status == SloStatus::Critical) {
            SloStatus::Critical
        } else if states.values().any(|s| s.status == SloStatus::Warning) {
            SloStatus::Warning
        } else {
            SloStatus::Healthy
        }
    }

    pub fn targets(&self) -> &[SloTarget] {
        &self.targets
    }
}

fn pct_ok<'a>(iter: impl Iterator<Item = &'a (DateTime<Utc>, bool)>) -> f64 {
    let mut total = 0u64;
    let mut ok = 0u64;
    for (_, success) in iter {
        total += 1;
        if *success {
            ok += 1;
        }
    }
    if total == 0 {
        100.0
    } else {
        ok as f64 / total as f64 * 100.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use atp_core::config::AlertSettings;
    use atp_core::ManualClock;
    use chrono::TimeZone;

    fn tracker() -> (SloTracker, flume::Receiver<Alert>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
        ));
        let (emitter, rx) = AlertEmitter::new(&AlertSettings::default(), clock.clone());
        (
            SloTracker::with_defaults(emitter, clock.clone()),
            rx,
            clock,
        )
    }

    fn ok_obs() -> SloObservation {
        SloObservation {
            available: true,
            success: true,
            within_latency: true,
            within_cost_budget: true,
        }
    }

    fn failed_obs() -> SloObservation {
        SloObservation {
            available: false,
            success: false,
            within_latency: false,
            within_cost_budget: false,
        }
    }

    #[test]
    fn starts_healthy_at_100_percent() {
        let (tracker, _rx, _clock) = tracker();
        tracker.recompute();
        let state = tracker.state("availability").unwrap();
        assert_eq!(state.current_pct, 100.0);
        assert_eq!(state.status, SloStatus::Healthy);
        assert_eq!(tracker.overall_status(), SloStatus::Healthy);
    }

    #[test]
    fn all_success_stays_healthy() {
        let (tracker, rx, _clock) = tracker();
        for _ in 0..50 {
            tracker.record(ok_obs());
        }
        tracker.recompute();
        assert_eq!(tracker.overall_status(), SloStatus::Healthy);
        assert_eq!(rx.drain().count(), 0);
    }

    #[test]
    fn heavy_failures_go_critical_and_alert_once() {
        let (tracker, rx, _clock) = tracker();
        for _ in 0..10 {
            tracker.record(ok_obs());
        }
        for _ in 0..10 {
            tracker.record(failed_obs());
        }
        tracker.recompute();

        let state = tracker.state("error_rate").unwrap();
        assert_eq!(state.status, SloStatus::Critical);
        assert_eq!(state.violations_count, 1);
        assert!((state.current_pct - 50.0).abs() < 1e-9);
        assert_eq!(tracker.overall_status(), SloStatus::Critical);

        // Re-running recompute while still critical does not re-alert.
        tracker.recompute();
        let alerts: Vec<Alert> = rx.drain().collect();
        let violation_kinds = alerts.iter().filter(|a| a.kind == "slo_violation").count();
        // One alert per target that went critical, once each.
        assert!(violation_kinds >= 1);
        assert_eq!(
            tracker.state("error_rate").unwrap().violations_count,
            1,
            "no double counting while staying critical"
        );
    }

    #[test]
    fn warning_band_between_alert_threshold_and_target() {
        let (tracker, _rx, _clock) = tracker();
        // error_rate target 99.0, alert threshold 95.0. 97% success sits in
        // the warning band.
        for _ in 0..97 {
            tracker.record(ok_obs());
        }
        for _ in 0..3 {
            tracker.record(failed_obs());
        }
        tracker.recompute();
        let state = tracker.state("error_rate").unwrap();
        assert_eq!(state.status, SloStatus::Warning);
    }

    #[test]
    fn recovery_returns_to_healthy_and_can_realert() {
        let (tracker, rx, clock) = tracker();
        for _ in 0..10 {
            tracker.record(failed_obs());
        }
        tracker.recompute();
        assert_eq!(tracker.state("error_rate").unwrap().status, SloStatus::Critical);

        // Push the failures out of the measurement window (300 s for
        // error_rate) and refill with successes.
        clock.advance(Duration::seconds(400));
        for _ in 0..20 {
            tracker.record(ok_obs());
        }
        tracker.recompute();
        assert_eq!(tracker.state("error_rate").unwrap().status, SloStatus::Healthy);

        // Cooldown is 5 min; advance past it so the next violation alerts.
        clock.advance(Duration::seconds(400));
        for _ in 0..10 {
            tracker.record(failed_obs());
        }
        tracker.recompute();
        assert_eq!(tracker.state("error_rate").unwrap().violations_count, 2);
        assert!(rx.drain().any(|a| a.kind == "slo_violation"));
    }

    #[test]
    fn error_budget_consumption_tracks_budget_window() {
        let (tracker, _rx, _clock) = tracker();
        // error_rate allows 1% failure. 2% failures over the budget window
        // means the budget is fully consumed.
        for _ in 0..98 {
            tracker.record(ok_obs());
        }
        for _ in 0..2 {
            tracker.record(failed_obs());
        }
        tracker.recompute();
        let state = tracker.state("error_rate").unwrap();
        assert!((state.error_budget_consumed - 100.0).abs() < 1e-6);
    }

    #[test]
    fn latency_target_tracks_latency_flag_only() {
        let (tracker, _rx, _clock) = tracker();
        for _ in 0..20 {
            tracker.record(SloObservation {
                available: true,
                success: true,
                within_latency: false,
                within_cost_budget: true,
            });
        }
        tracker.recompute();
        assert_eq!(tracker.state("latency_p95").unwrap().status, SloStatus::Critical);
        assert_eq!(tracker.state("error_rate").unwrap().status, SloStatus::Healthy);
    }
}
