//! TTL'd pricing cache with change detection.
//!
//! Keyed by `provider:model`. Writes compare against the prior entry and
//! record a [`PricingChange`] per token type when the relative move crosses
//! the configured threshold. The change log is a bounded ring behind its own
//! lock, so change writes never block pricing readers. `captured_at` is
//! monotonic per key; a write carrying an older timestamp is ignored.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use atp_core::{Clock, RouterError};

use crate::source::ProviderPricing;

// ---------------------------------------------------------------------------
// Entries and changes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingEntry {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    pub captured_at: DateTime<Utc>,
    pub source_version: String,
}

impl PricingEntry {
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.captured_at > threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Input,
    Output,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenType::Input => write!(f, "input"),
            TokenType::Output => write!(f, "output"),
        }
    }
}

/// Emitted when a token price moves by at least the change threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingChange {
    pub provider: String,
    pub model: String,
    pub token_type: TokenType,
    pub previous_price: f64,
    pub current_price: f64,
    pub change_percent: f64,
    pub detected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// PricingCache
// ---------------------------------------------------------------------------

pub struct PricingCache {
    entries: DashMap<String, PricingEntry>,
    ttl: Duration,
    change_threshold_percent: f64,
    changes: Mutex<VecDeque<PricingChange>>,
    change_capacity: usize,
    clock: Arc<dyn Clock>,
}

impl PricingCache {
    pub fn new(
        ttl_seconds: u64,
        change_threshold_percent: f64,
        change_capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::seconds(ttl_seconds as i64),
            change_threshold_percent,
            changes: Mutex::new(VecDeque::new()),
            change_capacity,
            clock,
        }
    }

    fn key(provider: &str, model: &str) -> String {
        format!("{provider}:{model}")
    }

    /// Store pricing for `provider:model`, returning any detected changes.
    ///
    /// Prices must be strictly positive. Re-setting an identical value
    /// records nothing.
    pub fn set(
        &self,
        provider: &str,
        model: &str,
        pricing: ProviderPricing,
        source_version: &str,
    ) -> Result<Vec<PricingChange>, RouterError> {
        if pricing.input_per_1k <= 0.0 || pricing.output_per_1k <= 0.0 {
            return Err(RouterError::Internal(format!(
                "non-positive price for {provider}:{model}"
            )));
        }

        let now = self.clock.now();
        let key = Self::key(provider, model);
        let mut detected = Vec::new();

        {
            let prior = self.entries.get(&key).map(|e| e.clone());
            if let Some(prior) = &prior {
                // Monotonic captured_at per key.
                if prior.captured_at > now {
                    return Ok(Vec::new());
                }
                for (token_type, prev, curr) in [
                    (TokenType::Input, prior.input_per_1k, pricing.input_per_1k),
                    (TokenType::Output, prior.output_per_1k, pricing.output_per_1k),
                ] {
                    let change_percent = (curr - prev) / prev * 100.0;
                    if change_percent.abs() >= self.change_threshold_percent {
                        detected.push(PricingChange {
                            provider: provider.to_string(),
                            model: model.to_string(),
                            token_type,
                            previous_price: prev,
                            current_price: curr,
                            change_percent,
                            detected_at: now,
                        });
                    }
                }
            }

            self.entries.insert(
                key,
                PricingEntry {
                    input_per_1k: pricing.input_per_1k,
                    output_per_1k: pricing.output_per_1k,
                    captured_at: now,
                    source_version: source_version.to_string(),
                },
            );
        }

        if !detected.is_empty() {
            let mut ring = self.changes.lock().unwrap_or_else(|e| e.into_inner());
            for change in &detected {
                if ring.len() >= self.change_capacity {
                    ring.pop_front(); // newest wins on overflow
                }
                ring.push_back(change.clone());
            }
        }

        Ok(detected)
    }

    /// Fetch an entry. Returns `None` on miss or TTL expiry.
    pub fn get(&self, provider: &str, model: &str) -> Option<PricingEntry> {
        let now = self.clock.now();
        let entry = self.entries.get(&Self::key(provider, model))?;
        if now - entry.captured_at > self.ttl {
            return None;
        }
        Some(entry.clone())
    }

    /// Entries older than `threshold`, with their age in seconds.
    pub fn get_stale(&self, threshold: Duration) -> Vec<(String, String, i64)> {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|e| now - e.captured_at > threshold)
            .map(|e| {
                let (provider, model) = e
                    .key()
                    .split_once(':')
                    .map(|(p, m)| (p.to_string(), m.to_string()))
                    .unwrap_or_else(|| (e.key().clone(), String::new()));
                (provider, model, (now - e.captured_at).num_seconds())
            })
            .collect()
    }

    /// Changes newer than `since`, optionally filtered.
    pub fn changes_since(
        &self,
        since: DateTime<Utc>,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Vec<PricingChange> {
        let ring = self.changes.lock().unwrap_or_else(|e| e.into_inner());
        ring.iter()
            .filter(|c| c.detected_at >= since)
            .filter(|c| provider.map_or(true, |p| c.provider == p))
            .filter(|c| model.map_or(true, |m| c.model == m))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use atp_core::ManualClock;
    use chrono::TimeZone;

    fn cache() -> (PricingCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
        ));
        (PricingCache::new(300, 5.0, 16, clock.clone()), clock)
    }

    fn pricing(input: f64, output: f64) -> ProviderPricing {
        ProviderPricing {
            input_per_1k: input,
            output_per_1k: output,
        }
    }

    #[test]
    fn first_set_records_no_change() {
        let (cache, _clock) = cache();
        let changes = cache.set("openai", "gpt-4", pricing(0.01, 0.03), "v1").unwrap();
        assert!(changes.is_empty());
        assert!(cache.get("openai", "gpt-4").is_some());
    }

    #[test]
    fn large_jump_emits_one_change_per_token_type() {
        let (cache, _clock) = cache();
        cache.set("openai", "gpt-4", pricing(0.01, 0.03), "v1").unwrap();

        // 50% input jump, output unchanged.
        let changes = cache.set("openai", "gpt-4", pricing(0.015, 0.03), "v2").unwrap();
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.token_type, TokenType::Input);
        assert!((change.change_percent - 50.0).abs() < 1e-9);
        assert!((change.previous_price - 0.01).abs() < 1e-12);
        assert!((change.current_price - 0.015).abs() < 1e-12);
    }

    #[test]
    fn identical_rewrite_is_idempotent() {
        let (cache, _clock) = cache();
        cache.set("openai", "gpt-4", pricing(0.01, 0.03), "v1").unwrap();
        let first = cache.set("openai", "gpt-4", pricing(0.015, 0.03), "v2").unwrap();
        assert_eq!(first.len(), 1);
        // Same value again: zero changes.
        let second = cache.set("openai", "gpt-4", pricing(0.015, 0.03), "v2").unwrap();
        assert!(second.is_empty());
        assert_eq!(
            cache
                .changes_since(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(), None, None)
                .len(),
            1
        );
    }

    #[test]
    fn below_threshold_moves_are_silent() {
        let (cache, _clock) = cache();
        cache.set("openai", "gpt-4", pricing(0.0100, 0.03), "v1").unwrap();
        // 4% < 5% threshold.
        let changes = cache.set("openai", "gpt-4", pricing(0.0104, 0.03), "v2").unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn drop_in_price_is_negative_change() {
        let (cache, _clock) = cache();
        cache.set("anthropic", "claude", pricing(0.010, 0.05), "v1").unwrap();
        let changes = cache.set("anthropic", "claude", pricing(0.005, 0.05), "v2").unwrap();
        assert_eq!(changes.len(), 1);
        assert!((changes[0].change_percent + 50.0).abs() < 1e-9);
    }

    #[test]
    fn non_positive_price_rejected() {
        let (cache, _clock) = cache();
        let err = cache.set("openai", "gpt-4", pricing(0.0, 0.03), "v1").unwrap_err();
        assert!(matches!(err, RouterError::Internal(_)));
        assert!(cache.get("openai", "gpt-4").is_none());
    }

    #[test]
    fn get_expires_after_ttl() {
        let (cache, clock) = cache();
        cache.set("openai", "gpt-4", pricing(0.01, 0.03), "v1").unwrap();
        clock.advance(Duration::seconds(299));
        assert!(cache.get("openai", "gpt-4").is_some());
        clock.advance(Duration::seconds(2));
        assert!(cache.get("openai", "gpt-4").is_none());
    }

    #[test]
    fn stale_scan_reports_ages() {
        let (cache, clock) = cache();
        cache.set("openai", "gpt-4", pricing(0.01, 0.03), "v1").unwrap();
        clock.advance(Duration::seconds(120));
        cache.set("anthropic", "claude", pricing(0.003, 0.015), "v1").unwrap();

        let stale = cache.get_stale(Duration::seconds(60));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, "openai");
        assert_eq!(stale[0].1, "gpt-4");
        assert_eq!(stale[0].2, 120);
    }

    #[test]
    fn change_ring_drops_oldest_on_overflow() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
        ));
        let cache = PricingCache::new(300, 5.0, 2, clock.clone());
        cache.set("m", "a", pricing(0.010, 0.010), "v1").unwrap();

        // Three successive doublings -> three changes, ring keeps last two.
        for (i, price) in [0.020, 0.040, 0.080].iter().enumerate() {
            clock.advance(Duration::seconds(1));
            cache
                .set("m", "a", pricing(*price, 0.010), &format!("v{}", i + 2))
                .unwrap();
        }

        let all = cache.changes_since(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(), None, None);
        assert_eq!(all.len(), 2);
        assert!((all[0].previous_price - 0.020).abs() < 1e-12);
        assert!((all[1].previous_price - 0.040).abs() < 1e-12);
    }

    #[test]
    fn changes_filter_by_provider_and_model() {
        let (cache, clock) = cache();
        cache.set("openai", "gpt-4", pricing(0.010, 0.03), "v1").unwrap();
        cache.set("anthropic", "claude", pricing(0.003, 0.015), "v1").unwrap();
        clock.advance(Duration::seconds(1));
        cache.set("openai", "gpt-4", pricing(0.020, 0.03), "v2").unwrap();
        cache.set("anthropic", "claude", pricing(0.006, 0.015), "v2").unwrap();

        let since = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(cache.changes_since(since, Some("openai"), None).len(), 1);
        assert_eq!(cache.changes_since(since, None, Some("claude")).len(), 1);
        assert_eq!(cache.changes_since(since, None, None).len(), 2);
    }
}
