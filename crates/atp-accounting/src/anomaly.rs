//! Statistical cost-anomaly detection.
//!
//! Keeps a bounded ring of recent cost points, refreshes baseline statistics
//! at most once per interval, and flags four outlier families: request cost,
//! cost-per-token, token usage, and hour-of-day temporal deviations. A zero
//! standard deviation never produces an anomaly.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use atp_core::config::AnomalySettings;
use atp_core::Clock;
use atp_observability::{Alert, AlertEmitter, AlertSeverity};

// ---------------------------------------------------------------------------
// Data points and baseline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct DataPoint {
    timestamp: DateTime<Utc>,
    cost_usd: f64,
    tokens: u64,
    cost_per_token: f64,
    provider: String,
    model: String,
    tenant_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatBlock {
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineStats {
    pub cost: StatBlock,
    pub tokens: StatBlock,
    pub cost_per_token: StatBlock,
    pub updated_at: DateTime<Utc>,
    pub data_points: usize,
}

// ---------------------------------------------------------------------------
// Anomalies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    CostOutlier,
    CostPerTokenOutlier,
    UsageOutlier,
    TemporalOutlier,
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnomalyKind::CostOutlier => write!(f, "cost_outlier"),
            AnomalyKind::CostPerTokenOutlier => write!(f, "cost_per_token_outlier"),
            AnomalyKind::UsageOutlier => write!(f, "usage_outlier"),
            AnomalyKind::TemporalOutlier => write!(f, "temporal_outlier"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: AlertSeverity,
    pub z_score: f64,
    pub detected_at: DateTime<Utc>,
    pub observed: f64,
    pub expected: f64,
    pub provider: String,
    pub model: String,
    pub tenant_id: Option<String>,
}

/// Pre-request indicator from [`AnomalyDetector::is_anomalous_request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyIndicator {
    pub kind: AnomalyKind,
    pub z_score: f64,
    pub expected: f64,
    pub actual: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreRequestCheck {
    pub is_anomalous: bool,
    pub indicators: Vec<AnomalyIndicator>,
    /// Max z-score across indicators; 0 when clean.
    pub confidence: f64,
}

impl PreRequestCheck {
    fn clean() -> Self {
        Self {
            is_anomalous: false,
            indicators: Vec::new(),
            confidence: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// AnomalyDetector
// ---------------------------------------------------------------------------

pub struct AnomalyDetector {
    settings: AnomalySettings,
    points: Mutex<VecDeque<DataPoint>>,
    baseline: RwLock<Option<BaselineStats>>,
    last_baseline_update: Mutex<Option<DateTime<Utc>>>,
    detected: Mutex<Vec<Anomaly>>,
    emitter: Arc<AlertEmitter>,
    clock: Arc<dyn Clock>,
}

impl AnomalyDetector {
    pub fn new(settings: AnomalySettings, emitter: Arc<AlertEmitter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            points: Mutex::new(VecDeque::new()),
            baseline: RwLock::new(None),
            last_baseline_update: Mutex::new(None),
            detected: Mutex::new(Vec::new()),
            emitter,
            clock,
        }
    }

    /// Add one completed request's cost data. Baseline statistics refresh at
    /// most once per update interval.
    pub fn add_point(
        &self,
        cost_usd: f64,
        tokens: u64,
        provider: &str,
        model: &str,
        tenant_id: Option<&str>,
    ) {
        let now = self.clock.now();
        {
            let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
            points.push_back(DataPoint {
                timestamp: now,
                cost_usd,
                tokens,
                cost_per_token: cost_usd / tokens.max(1) as f64,
                provider: provider.to_string(),
                model: model.to_string(),
                tenant_id: tenant_id.map(str::to_string),
            });
            while points.len() > self.settings.max_points {
                points.pop_front();
            }
        }

        let due = {
            let last = self.last_baseline_update.lock().unwrap_or_else(|e| e.into_inner());
            match *last {
                Some(ts) => {
                    now - ts
                        >= Duration::seconds(self.settings.baseline_update_interval_seconds as i64)
                }
                None => true,
            }
        };
        if due {
            self.update_baseline();
        }
    }

    /// Recompute baseline statistics from the most recent points. Needs at
    /// least 50 points to be meaningful; otherwise the existing baseline is
    /// kept.
    pub fn update_baseline(&self) {
        let now = self.clock.now();
        *self.last_baseline_update.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);

        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        if points.len() < 50 {
            return;
        }
        let recent: Vec<&DataPoint> = points
            .iter()
            .rev()
            .take(self.settings.baseline_window)
            .collect();

        let costs: Vec<f64> = recent.iter().map(|p| p.cost_usd).collect();
        let tokens: Vec<f64> = recent.iter().map(|p| p.tokens as f64).collect();
        let cpt: Vec<f64> = recent.iter().map(|p| p.cost_per_token).collect();

        let baseline = BaselineStats {
            cost: stat_block(&costs),
            tokens: stat_block(&tokens),
            cost_per_token: stat_block(&cpt),
            updated_at: now,
            data_points: recent.len(),
        };
        *self.baseline.write().unwrap_or_else(|e| e.into_inner()) = Some(baseline);
    }

    pub fn baseline(&self) -> Option<BaselineStats> {
        self.baseline.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Detect anomalies over the configured window, optionally scoped.
    pub fn detect_anomalies(
        &self,
        tenant_id: Option<&str>,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Vec<Anomaly> {
        let now = self.clock.now();
        let window_start = now - Duration::hours(self.settings.window_hours as i64);

        let filtered: Vec<DataPoint> = {
            let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
            points
                .iter()
                .filter(|p| p.timestamp >= window_start)
                .filter(|p| tenant_id.map_or(true, |t| p.tenant_id.as_deref() == Some(t)))
                .filter(|p| provider.map_or(true, |pr| p.provider == pr))
                .filter(|p| model.map_or(true, |m| p.model == m))
                .cloned()
                .collect()
        };
        if filtered.len() < self.settings.min_requests {
            return Vec::new();
        }

        let mut anomalies = Vec::new();
        self.detect_field_outliers(
            &filtered,
            AnomalyKind::CostOutlier,
            |p| p.cost_usd,
            now,
            &mut anomalies,
        );
        self.detect_field_outliers(
            &filtered,
            AnomalyKind::CostPerTokenOutlier,
            |p| p.cost_per_token,
            now,
            &mut anomalies,
        );
        self.detect_field_outliers(
            &filtered,
            AnomalyKind::UsageOutlier,
            |p| p.tokens as f64,
            now,
            &mut anomalies,
        );
        self.detect_temporal(&filtered, now, &mut anomalies);

        for anomaly in &anomalies {
            self.emit(anomaly);
        }

        // Retain a week of detections.
        let mut detected = self.detected.lock().unwrap_or_else(|e| e.into_inner());
        detected.extend(anomalies.iter().cloned());
        let week_ago = now - Duration::days(7);
        detected.retain(|a| a.detected_at > week_ago);

        anomalies
    }

    fn detect_field_outliers(
        &self,
        data: &[DataPoint],
        kind: AnomalyKind,
        field: impl Fn(&DataPoint) -> f64,
        now: DateTime<Utc>,
        out: &mut Vec<Anomaly>,
    ) {
        let values: Vec<f64> = data.iter().map(&field).collect();
        let mean = mean(&values);
        let std = stdev(&values, mean);
        if std == 0.0 {
            return;
        }

        for point in data {
            let value = field(point);
            let z = (value - mean).abs() / std;
            if z > self.settings.threshold_std {
                out.push(Anomaly {
                    kind,
                    severity: severity_for(kind, z),
                    z_score: z,
                    detected_at: now,
                    observed: value,
                    expected: mean,
                    provider: point.provider.clone(),
                    model: point.model.clone(),
                    tenant_id: point.tenant_id.clone(),
                });
            }
        }
    }

    /// Hour-of-day grouping; an hour bucket needs at least 3 prior samples
    /// before it can flag anything. Only the 10 most recent points are
    /// checked against the buckets.
    fn detect_temporal(&self, data: &[DataPoint], now: DateTime<Utc>, out: &mut Vec<Anomaly>) {
        if data.len() < 20 {
            return;
        }

        let mut hourly: HashMap<u32, Vec<f64>> = HashMap::new();
        for point in data {
            hourly.entry(point.timestamp.hour()).or_default().push(point.cost_usd);
        }

        let mut hour_stats: HashMap<u32, (f64, f64)> = HashMap::new();
        for (hour, costs) in &hourly {
            if costs.len() >= 3 {
                let m = mean(costs);
                hour_stats.insert(*hour, (m, stdev(costs, m)));
            }
        }

        for point in data.iter().rev().take(10) {
            let hour = point.timestamp.hour();
            if let Some((expected, std)) = hour_stats.get(&hour) {
                if *std > 0.0 {
                    let z = (point.cost_usd - expected).abs() / std;
                    if z > self.settings.threshold_std {
                        out.push(Anomaly {
                            kind: AnomalyKind::TemporalOutlier,
                            severity: AlertSeverity::Medium,
                            z_score: z,
                            detected_at: now,
                            observed: point.cost_usd,
                            expected: *expected,
                            provider: point.provider.clone(),
                            model: point.model.clone(),
                            tenant_id: point.tenant_id.clone(),
                        });
                    }
                }
            }
        }
    }

    fn emit(&self, anomaly: &Anomaly) {
        let scope = anomaly
            .tenant_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", anomaly.provider, anomaly.model));
        self.emitter.emit(
            Alert::new(
                "cost_anomaly",
                anomaly.severity,
                format!("anomaly::{}::{}", anomaly.kind, scope),
                serde_json::to_value(anomaly).unwrap_or_default(),
            )
            .with_label("kind", anomaly.kind.to_string())
            .with_label("model", anomaly.model.clone()),
        );
    }

    /// Evaluate a request before dispatch. Returns no anomaly until a
    /// baseline exists, and never flags a dimension whose deviation is zero.
    pub fn is_anomalous_request(
        &self,
        estimated_cost: f64,
        tokens: u64,
        _provider: &str,
        _model: &str,
        _tenant_id: Option<&str>,
    ) -> PreRequestCheck {
        let baseline = match self.baseline() {
            Some(b) => b,
            None => return PreRequestCheck::clean(),
        };

        let cost_per_token = estimated_cost / tokens.max(1) as f64;
        let mut indicators = Vec::new();

        for (kind, stats, actual) in [
            (AnomalyKind::CostOutlier, &baseline.cost, estimated_cost),
            (AnomalyKind::UsageOutlier, &baseline.tokens, tokens as f64),
            (
                AnomalyKind::CostPerTokenOutlier,
                &baseline.cost_per_token,
                cost_per_token,
            ),
        ] {
            if stats.std > 0.0 {
                let z = (actual - stats.mean).abs() / stats.std;
                if z > self.settings.threshold_std {
                    indicators.push(AnomalyIndicator {
                        kind,
                        z_score: z,
                        expected: stats.mean,
                        actual,
                    });
                }
            }
        }

        let confidence = indicators.iter().map(|i| i.z_score).fold(0.0, f64::max);
        PreRequestCheck {
            is_anomalous: !indicators.is_empty(),
            indicators,
            confidence,
        }
    }

    /// Anomalies detected in the last `hours`, optionally per tenant.
    pub fn recent_anomalies(&self, hours: u64, tenant_id: Option<&str>) -> Vec<Anomaly> {
        let cutoff = self.clock.now() - Duration::hours(hours as i64);
        self.detected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|a| a.detected_at >= cutoff)
            .filter(|a| tenant_id.map_or(true, |t| a.tenant_id.as_deref() == Some(t)))
            .cloned()
            .collect()
    }
}

fn severity_for(kind: AnomalyKind, z: f64) -> AlertSeverity {
    match kind {
        AnomalyKind::UsageOutlier => {
            if z > 3.0 {
                AlertSeverity::Medium
            } else {
                AlertSeverity::Low
            }
        }
        _ => {
            if z > 3.0 {
                AlertSeverity::High
            } else {
                AlertSeverity::Medium
            }
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation.
fn stdev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

fn stat_block(values: &[f64]) -> StatBlock {
    let m = mean(values);
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = if sorted.is_empty() {
        0.0
    } else if sorted.len() % 2 == 0 {
        (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0
    } else {
        sorted[sorted.len() / 2]
    };
    StatBlock {
        mean: m,
        std: stdev(values, m),
        median,
        min: sorted.first().copied().unwrap_or(0.0),
        max: sorted.last().copied().unwrap_or(0.0),
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

    fn detector() -> (AnomalyDetector, flume::Receiver<Alert>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 10, 9, 0, 0).unwrap(),
        ));
        let (emitter, rx) = AlertEmitter::new(&AlertSettings::default(), clock.clone());
        (
            AnomalyDetector::new(AnomalySettings::default(), emitter, clock.clone()),
            rx,
            clock,
        )
    }

    fn seed_uniform(det: &AnomalyDetector, clock: &ManualClock, n: usize, cost: f64, tokens: u64) {
        for _ in 0..n {
            det.add_point(cost, tokens, "openai", "gpt-4o", Some("t1"));
            clock.advance(Duration::seconds(10));
        }
    }

    fn seed_varied(det: &AnomalyDetector, clock: &ManualClock, n: usize) {
        // Alternating around a stable mean so std is non-zero but modest.
        for i in 0..n {
            let cost = if i % 2 == 0 { 0.010 } else { 0.012 };
            det.add_point(cost, 1000, "openai", "gpt-4o", Some("t1"));
            clock.advance(Duration::seconds(10));
        }
    }

    #[test]
    fn no_baseline_means_no_pre_request_anomaly() {
        let (det, _rx, _clock) = detector();
        let check = det.is_anomalous_request(1000.0, 1_000_000, "openai", "gpt-4o", None);
        assert!(!check.is_anomalous);
        assert_eq!(check.confidence, 0.0);
    }

    #[test]
    fn baseline_needs_fifty_points() {
        let (det, _rx, clock) = detector();
        seed_varied(&det, &clock, 40);
        det.update_baseline();
        assert!(det.baseline().is_none());

        seed_varied(&det, &clock, 20);
        det.update_baseline();
        let baseline = det.baseline().unwrap();
        assert!(baseline.data_points >= 50);
        assert!(baseline.cost.std > 0.0);
    }

    #[test]
    fn zero_sigma_baseline_never_flags() {
        let (det, _rx, clock) = detector();
        // Identical costs and tokens: every std is exactly zero.
        seed_uniform(&det, &clock, 60, 0.01, 1000);
        det.update_baseline();
        let baseline = det.baseline().unwrap();
        assert_eq!(baseline.cost.std, 0.0);

        let check = det.is_anomalous_request(500.0, 9_000_000, "openai", "gpt-4o", None);
        assert!(!check.is_anomalous);
    }

    #[test]
    fn outlandish_request_is_flagged() {
        let (det, _rx, clock) = detector();
        seed_varied(&det, &clock, 60);
        det.update_baseline();

        let check = det.is_anomalous_request(5.0, 1000, "openai", "gpt-4o", None);
        assert!(check.is_anomalous);
        assert!(check.confidence > 2.5);
        assert!(check
            .indicators
            .iter()
            .any(|i| i.kind == AnomalyKind::CostOutlier));
    }

    #[test]
    fn detect_finds_cost_outlier_in_window() {
        let (det, rx, clock) = detector();
        seed_varied(&det, &clock, 30);
        // One wild point.
        det.add_point(1.0, 1000, "openai", "gpt-4o", Some("t1"));

        let anomalies = det.detect_anomalies(None, None, None);
        assert!(anomalies
            .iter()
            .any(|a| a.kind == AnomalyKind::CostOutlier && a.observed == 1.0));
        let flagged = anomalies
            .iter()
            .find(|a| a.kind == AnomalyKind::CostOutlier)
            .unwrap();
        assert_eq!(flagged.severity, AlertSeverity::High);
        assert!(rx.drain().any(|a| a.kind == "cost_anomaly"));
    }

    #[test]
    fn usage_outlier_caps_at_medium_severity() {
        let (det, _rx, clock) = detector();
        for i in 0..30 {
            let tokens = if i % 2 == 0 { 1000 } else { 1100 };
            det.add_point(0.01, tokens, "openai", "gpt-4o", None);
            clock.advance(Duration::seconds(5));
        }
        det.add_point(0.01, 500_000, "openai", "gpt-4o", None);

        let anomalies = det.detect_anomalies(None, None, None);
        let usage = anomalies
            .iter()
            .find(|a| a.kind == AnomalyKind::UsageOutlier)
            .unwrap();
        assert!(usage.severity <= AlertSeverity::Medium);
    }

    #[test]
    fn detection_requires_min_requests() {
        let (det, _rx, clock) = detector();
        seed_varied(&det, &clock, 5);
        det.add_point(100.0, 1000, "openai", "gpt-4o", None);
        assert!(det.detect_anomalies(None, None, None).is_empty());
    }

    #[test]
    fn detection_scopes_by_tenant() {
        let (det, _rx, clock) = detector();
        for i in 0..30 {
            let cost = if i % 2 == 0 { 0.010 } else { 0.012 };
            det.add_point(cost, 1000, "openai", "gpt-4o", Some("quiet"));
            clock.advance(Duration::seconds(5));
        }
        det.add_point(2.0, 1000, "openai", "gpt-4o", Some("noisy"));

        // Scoped to the quiet tenant, the spike is invisible; the remaining
        // points are too uniform to flag.
        assert!(det
            .detect_anomalies(Some("quiet"), None, None)
            .iter()
            .all(|a| a.observed != 2.0));
    }

    #[test]
    fn old_points_age_out_of_the_window() {
        let (det, _rx, clock) = detector();
        seed_varied(&det, &clock, 30);
        det.add_point(5.0, 1000, "openai", "gpt-4o", None);

        // Jump past the 24h window: nothing left to analyze.
        clock.advance(Duration::hours(25));
        assert!(det.detect_anomalies(None, None, None).is_empty());
    }

    #[test]
    fn baseline_refresh_is_rate_limited() {
        let (det, _rx, clock) = detector();
        seed_varied(&det, &clock, 60);
        det.update_baseline();
        let first = det.baseline().map(|b| b.updated_at);
        assert!(first.is_some());

        // More points arrive within the hour; the baseline timestamp holds.
        seed_varied(&det, &clock, 10);
        assert_eq!(det.baseline().map(|b| b.updated_at), first);

        clock.advance(Duration::seconds(3601));
        det.add_point(0.011, 1000, "openai", "gpt-4o", None);
        assert!(det.baseline().map(|b| b.updated_at) > first);
    }

    #[test]
    fn recent_anomalies_retained_and_filtered() {
        let (det, _rx, clock) = detector();
        seed_varied(&det, &clock, 30);
        det.add_point(3.0, 1000, "openai", "gpt-4o", Some("t1"));
        det.detect_anomalies(None, None, None);

        assert!(!det.recent_anomalies(24, Some("t1")).is_empty());
        assert!(det.recent_anomalies(24, Some("other")).is_empty());
    }

    #[test]
    fn stat_helpers() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let block = stat_block(&values);
        assert!((block.mean - 2.5).abs() < 1e-9);
        assert!((block.median - 2.5).abs() < 1e-9);
        assert_eq!(block.min, 1.0);
        assert_eq!(block.max, 4.0);
        // Sample stdev of 1..4 is ~1.29.
        assert!((block.std - 1.2909944).abs() < 1e-6);

        assert_eq!(stdev(&[5.0], 5.0), 0.0);
        assert_eq!(mean(&[]), 0.0);
    }
}
