//! Revenue-share reporting for provider payouts.
//!
//! Each provider is assigned a QoS class; its accumulated cost from the
//! aggregator snapshot earns the class's revenue-share rate. Shares under
//! the minimum payout threshold are held back (carried into the next
//! period by the payout processor). Reports export as JSON or CSV.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use atp_core::{QosClass, RouterError};

use crate::aggregator::CostSnapshot;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevenueShareConfig {
    /// Provider share of revenue per QoS class.
    pub gold_revenue_share: f64,
    pub silver_revenue_share: f64,
    pub bronze_revenue_share: f64,
    /// Shares below this stay unpaid for the period.
    pub minimum_payout_usd: f64,
    pub reporting_period_days: u32,
}

impl Default for RevenueShareConfig {
    fn default() -> Self {
        Self {
            gold_revenue_share: 0.70,
            silver_revenue_share: 0.65,
            bronze_revenue_share: 0.60,
            minimum_payout_usd: 10.0,
            reporting_period_days: 30,
        }
    }
}

impl RevenueShareConfig {
    fn rate(&self, qos: QosClass) -> f64 {
        match qos {
            QosClass::Gold => self.gold_revenue_share,
            QosClass::Silver => self.silver_revenue_share,
            QosClass::Bronze => self.bronze_revenue_share,
        }
    }
}

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRevenue {
    pub provider: String,
    pub qos: QosClass,
    pub total_cost_usd: f64,
    pub revenue_share_usd: f64,
    /// Zero when the share falls under the minimum payout threshold.
    pub payout_usd: f64,
    pub request_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevenueShareReport {
    pub generated_at: DateTime<Utc>,
    pub period_days: u32,
    pub total_cost_usd: f64,
    pub total_payout_usd: f64,
    pub held_back_usd: f64,
    pub entries: Vec<ProviderRevenue>,
}

// ---------------------------------------------------------------------------
// RevenueShareReporter
// ---------------------------------------------------------------------------

pub struct RevenueShareReporter {
    config: RevenueShareConfig,
}

impl RevenueShareReporter {
    pub fn new(config: RevenueShareConfig) -> Self {
        Self { config }
    }

    /// Compute per-provider revenue shares from an aggregator snapshot.
    /// `assignments` maps each provider to its billed QoS class; unassigned
    /// providers default to bronze.
    pub fn calculate(
        &self,
        snapshot: &CostSnapshot,
        assignments: &HashMap<String, QosClass>,
        generated_at: DateTime<Utc>,
    ) -> RevenueShareReport {
        let mut entries: Vec<ProviderRevenue> = snapshot
            .usd_by_provider
            .iter()
            .map(|(provider, cost)| {
                let qos = assignments
                    .get(provider)
                    .copied()
                    .unwrap_or(QosClass::Bronze);
                let share = cost * self.config.rate(qos);
                let payout = if share >= self.config.minimum_payout_usd {
                    share
                } else {
                    0.0
                };
                ProviderRevenue {
                    provider: provider.clone(),
                    qos,
                    total_cost_usd: *cost,
                    revenue_share_usd: share,
                    payout_usd: payout,
                    request_count: snapshot
                        .requests_by_provider
                        .get(provider)
                        .copied()
                        .unwrap_or(0),
                }
            })
            .collect();
        entries.sort_by(|a, b| {
            b.revenue_share_usd
                .partial_cmp(&a.revenue_share_usd)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let total_payout: f64 = entries.iter().map(|e| e.payout_usd).sum();
        let total_share: f64 = entries.iter().map(|e| e.revenue_share_usd).sum();
        RevenueShareReport {
            generated_at,
            period_days: self.config.reporting_period_days,
            total_cost_usd: snapshot.total_cost_usd,
            total_payout_usd: total_payout,
            held_back_usd: total_share - total_payout,
            entries,
        }
    }

    /// Write the report as pretty JSON.
    pub fn export_json(&self, report: &RevenueShareReport, path: &Path) -> Result<(), RouterError> {
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| RouterError::Internal(format!("report serialization: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| RouterError::RepositoryUnavailable(format!("report write: {e}")))?;
        Ok(())
    }

    /// Write the report as CSV for payout processing.
    pub fn export_csv(&self, report: &RevenueShareReport, path: &Path) -> Result<(), RouterError> {
        let mut file = std::fs::File::create(path)
            .map_err(|e| RouterError::RepositoryUnavailable(format!("report create: {e}")))?;
        writeln!(
            file,
            "provider,qos,total_cost_usd,revenue_share_usd,payout_usd,request_count"
        )
        .map_err(|e| RouterError::RepositoryUnavailable(format!("report write: {e}")))?;
        for entry in &report.entries {
            writeln!(
                file,
                "{},{},{:.6},{:.6},{:.6},{}",
                entry.provider,
                entry.qos,
                entry.total_cost_usd,
                entry.revenue_share_usd,
                entry.payout_usd,
                entry.request_count
            )
            .map_err(|e| RouterError::RepositoryUnavailable(format!("report write: {e}")))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::CostAggregator;
    use atp_core::config::AlertSettings;
    use atp_core::{CostRecord, SystemClock};
    use atp_observability::AlertEmitter;
    use std::sync::Arc;

    fn snapshot_with(costs: &[(&str, f64, u64)]) -> CostSnapshot {
        let (emitter, _rx) = AlertEmitter::new(&AlertSettings::default(), Arc::new(SystemClock));
        let agg = CostAggregator::new(10.0, emitter);
        for (provider, cost, requests) in costs {
            for _ in 0..*requests {
                agg.record(&CostRecord {
                    decision_id: format!("d-{provider}"),
                    provider: provider.to_string(),
                    model: format!("{provider}-model"),
                    tenant_id: None,
                    project_id: None,
                    qos: QosClass::Silver,
                    input_tokens: 100,
                    output_tokens: 50,
                    cost_usd: cost / *requests as f64,
                    recorded_at: Utc::now(),
                })
                .unwrap();
            }
        }
        agg.snapshot()
    }

    fn assignments() -> HashMap<String, QosClass> {
        HashMap::from([
            ("openai".to_string(), QosClass::Gold),
            ("anthropic".to_string(), QosClass::Gold),
            ("google".to_string(), QosClass::Silver),
        ])
    }

    #[test]
    fn shares_follow_qos_rates() {
        let reporter = RevenueShareReporter::new(RevenueShareConfig::default());
        let snapshot = snapshot_with(&[("openai", 100.0, 10), ("google", 40.0, 4)]);
        let report = reporter.calculate(&snapshot, &assignments(), Utc::now());

        let openai = report.entries.iter().find(|e| e.provider == "openai").unwrap();
        assert_eq!(openai.qos, QosClass::Gold);
        assert!((openai.revenue_share_usd - 70.0).abs() < 1e-6);
        assert!((openai.payout_usd - 70.0).abs() < 1e-6);
        assert_eq!(openai.request_count, 10);

        let google = report.entries.iter().find(|e| e.provider == "google").unwrap();
        assert!((google.revenue_share_usd - 26.0).abs() < 1e-6);
    }

    #[test]
    fn unassigned_provider_defaults_to_bronze() {
        let reporter = RevenueShareReporter::new(RevenueShareConfig::default());
        let snapshot = snapshot_with(&[("mystery", 100.0, 2)]);
        let report = reporter.calculate(&snapshot, &assignments(), Utc::now());
        let entry = &report.entries[0];
        assert_eq!(entry.qos, QosClass::Bronze);
        assert!((entry.revenue_share_usd - 60.0).abs() < 1e-6);
    }

    #[test]
    fn sub_threshold_shares_are_held_back() {
        let reporter = RevenueShareReporter::new(RevenueShareConfig::default());
        // $10 of gold traffic earns a $7 share, under the $10 minimum.
        let snapshot = snapshot_with(&[("openai", 10.0, 2)]);
        let report = reporter.calculate(&snapshot, &assignments(), Utc::now());

        let entry = &report.entries[0];
        assert!((entry.revenue_share_usd - 7.0).abs() < 1e-6);
        assert_eq!(entry.payout_usd, 0.0);
        assert!((report.held_back_usd - 7.0).abs() < 1e-6);
        assert_eq!(report.total_payout_usd, 0.0);
    }

    #[test]
    fn entries_sort_by_share_descending() {
        let reporter = RevenueShareReporter::new(RevenueShareConfig::default());
        let snapshot = snapshot_with(&[
            ("google", 500.0, 5),
            ("openai", 100.0, 5),
            ("anthropic", 300.0, 5),
        ]);
        let report = reporter.calculate(&snapshot, &assignments(), Utc::now());
        let shares: Vec<f64> = report.entries.iter().map(|e| e.revenue_share_usd).collect();
        assert!(shares.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(report.entries[0].provider, "google");
    }

    #[test]
    fn json_export_round_trips() {
        let reporter = RevenueShareReporter::new(RevenueShareConfig::default());
        let snapshot = snapshot_with(&[("openai", 100.0, 3)]);
        let report = reporter.calculate(&snapshot, &assignments(), Utc::now());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("revenue.json");
        reporter.export_json(&report, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: RevenueShareReport = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert!((parsed.total_payout_usd - report.total_payout_usd).abs() < 1e-9);
    }

    #[test]
    fn csv_export_has_header_and_rows() {
        let reporter = RevenueShareReporter::new(RevenueShareConfig::default());
        let snapshot = snapshot_with(&[("openai", 100.0, 3), ("google", 50.0, 2)]);
        let report = reporter.calculate(&snapshot, &assignments(), Utc::now());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("revenue.csv");
        reporter.export_csv(&report, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("provider,qos,"));
        assert!(lines.iter().any(|l| l.starts_with("openai,gold,")));
    }
}
