//! Pricing monitor: concurrent refresh over all configured sources, change
//! alerting, read-through lookups, and pricing-accuracy validation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use atp_core::config::PricingSettings;
use atp_core::Clock;
use atp_observability::{Alert, AlertEmitter, AlertSeverity};

use crate::cache::{PricingCache, PricingChange, PricingEntry, TokenType};
use crate::source::{fetch_all_with_retries, PricingSource};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub models_updated: usize,
    pub provider_errors: usize,
    pub changes_detected: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleItem {
    pub provider: String,
    pub model: String,
    pub age_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleReport {
    pub stale_count: usize,
    pub staleness_threshold_seconds: u64,
    pub items: Vec<StaleItem>,
}

/// Outcome of checking an observed cost against the cached price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingValidation {
    pub provider: String,
    pub model: String,
    pub token_type: TokenType,
    pub tokens_used: u64,
    pub expected_cost: f64,
    pub actual_cost: f64,
    pub variance_percent: f64,
    pub within_tolerance: bool,
    pub tolerance_percent: f64,
    pub validated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStatistics {
    pub providers_configured: usize,
    pub update_count: u64,
    pub error_count: u64,
    pub change_count: u64,
}

// ---------------------------------------------------------------------------
// PricingMonitor
// ---------------------------------------------------------------------------

pub struct PricingMonitor {
    sources: Vec<Arc<dyn PricingSource>>,
    cache: Arc<PricingCache>,
    emitter: Arc<AlertEmitter>,
    settings: PricingSettings,
    clock: Arc<dyn Clock>,
    update_count: AtomicU64,
    error_count: AtomicU64,
    change_count: AtomicU64,
}

impl PricingMonitor {
    pub fn new(
        sources: Vec<Arc<dyn PricingSource>>,
        cache: Arc<PricingCache>,
        emitter: Arc<AlertEmitter>,
        settings: PricingSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sources,
            cache,
            emitter,
            settings,
            clock,
            update_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            change_count: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<PricingCache> {
        &self.cache
    }

    /// Refresh every provider concurrently. A failing provider is logged and
    /// counted; the rest proceed.
    pub async fn refresh_all(&self) -> RefreshSummary {
        let retry_delay = std::time::Duration::from_secs(self.settings.retry_delay_seconds);
        let fetches = self.sources.iter().map(|source| {
            let source = source.clone();
            async move {
                let pricing =
                    fetch_all_with_retries(source.as_ref(), self.settings.retry_attempts, retry_delay)
                        .await;
                (source.provider_name().to_string(), pricing)
            }
        });

        let mut summary = RefreshSummary {
            models_updated: 0,
            provider_errors: 0,
            changes_detected: 0,
        };

        for (provider, result) in join_all(fetches).await {
            match result {
                Ok(pricing) => {
                    for (model, price) in pricing {
                        match self.cache.set(&provider, &model, price, "api") {
                            Ok(changes) => {
                                summary.models_updated += 1;
                                summary.changes_detected += changes.len();
                                for change in changes {
                                    self.alert_change(&change);
                                }
                            }
                            Err(err) => {
                                warn!(provider, model, %err, "rejected pricing update");
                                summary.provider_errors += 1;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(provider, %err, "pricing provider refresh failed");
                    summary.provider_errors += 1;
                }
            }
        }

        self.update_count
            .fetch_add(summary.models_updated as u64, Ordering::Relaxed);
        self.error_count
            .fetch_add(summary.provider_errors as u64, Ordering::Relaxed);
        self.change_count
            .fetch_add(summary.changes_detected as u64, Ordering::Relaxed);

        debug!(
            updated = summary.models_updated,
            errors = summary.provider_errors,
            changes = summary.changes_detected,
            "pricing refresh completed"
        );
        summary
    }

    fn alert_change(&self, change: &PricingChange) {
        let magnitude = change.change_percent.abs();
        let severity = if magnitude >= self.settings.significant_change_percent {
            AlertSeverity::High
        } else {
            AlertSeverity::Medium
        };
        self.emitter.emit(
            Alert::new(
                "pricing_change",
                severity,
                format!(
                    "pricing_change::{}:{}:{}",
                    change.provider, change.model, change.token_type
                ),
                serde_json::json!({
                    "provider": change.provider,
                    "model": change.model,
                    "token_type": change.token_type,
                    "previous_price": change.previous_price,
                    "current_price": change.current_price,
                    "change_percent": change.change_percent,
                }),
            )
            .with_label("provider", change.provider.clone())
            .with_label("model", change.model.clone()),
        );
    }

    /// Cached pricing for a model, fetching through on miss or when forced.
    pub async fn current_pricing(
        &self,
        provider: &str,
        model: &str,
        force_refresh: bool,
    ) -> Option<PricingEntry> {
        if !force_refresh {
            if let Some(entry) = self.cache.get(provider, model) {
                return Some(entry);
            }
        }

        let source = self.sources.iter().find(|s| s.provider_name() == provider)?;
        match source.fetch_model_pricing(model).await {
            Ok(pricing) => match self.cache.set(provider, model, pricing, "api") {
                Ok(changes) => {
                    for change in changes {
                        self.alert_change(&change);
                    }
                    self.cache.get(provider, model)
                }
                Err(err) => {
                    warn!(provider, model, %err, "rejected fetched pricing");
                    None
                }
            },
            Err(err) => {
                warn!(provider, model, %err, "pricing lookup failed");
                self.error_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Compare an observed cost against the cached price for the model.
    /// Breaches of the tolerance emit a `pricing_validation` alert.
    pub fn validate_pricing_accuracy(
        &self,
        provider: &str,
        model: &str,
        actual_cost: f64,
        tokens_used: u64,
        token_type: TokenType,
    ) -> Option<PricingValidation> {
        let entry = self.cache.get(provider, model)?;
        let per_1k = match token_type {
            TokenType::Input => entry.input_per_1k,
            TokenType::Output => entry.output_per_1k,
        };
        let expected_cost = per_1k / 1000.0 * tokens_used as f64;
        let variance_percent = if expected_cost > 0.0 {
            (actual_cost - expected_cost) / expected_cost * 100.0
        } else {
            0.0
        };
        let tolerance_percent = self.settings.validation_tolerance_percent;
        let within_tolerance = variance_percent.abs() <= tolerance_percent;

        let validation = PricingValidation {
            provider: provider.to_string(),
            model: model.to_string(),
            token_type,
            tokens_used,
            expected_cost,
            actual_cost,
            variance_percent,
            within_tolerance,
            tolerance_percent,
            validated_at: self.clock.now(),
        };

        if !within_tolerance {
            self.emitter.emit(
                Alert::new(
                    "pricing_validation",
                    AlertSeverity::Medium,
                    format!("pricing_validation::{provider}:{model}"),
                    serde_json::to_value(&validation).unwrap_or_default(),
                )
                .with_label("provider", provider.to_string())
                .with_label("model", model.to_string()),
            );
        }

        Some(validation)
    }

    /// Entries older than the staleness tolerance.
    pub fn stale_report(&self) -> StaleReport {
        let threshold = Duration::seconds(self.settings.staleness_tolerance_seconds as i64);
        let items: Vec<StaleItem> = self
            .cache
            .get_stale(threshold)
            .into_iter()
            .map(|(provider, model, age_seconds)| StaleItem {
                provider,
                model,
                age_seconds,
            })
            .collect();
        StaleReport {
            stale_count: items.len(),
            staleness_threshold_seconds: self.settings.staleness_tolerance_seconds,
            items,
        }
    }

    pub fn statistics(&self) -> MonitorStatistics {
        MonitorStatistics {
            providers_configured: self.sources.len(),
            update_count: self.update_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            change_count: self.change_count.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
