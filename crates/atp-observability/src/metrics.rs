//! Routing-core metrics.
//!
//! Rather than a general-purpose registry keyed by metric-name strings,
//! every counter family the core actually emits is a named field on
//! [`RouterMetrics`]. Each family carries one label dimension (reason,
//! strategy, qos, entity) backed by per-label atomics, so nothing on the
//! request path takes a lock once a label slot exists. Regret percentages
//! land in a fixed-bucket histogram whose running sum uses the same
//! micro fixed-point representation as the cost aggregator.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Bucket upper bounds for regret-percentage observations.
pub const REGRET_PCT_BUCKETS: [f64; 11] =
    [0.0, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0];

// ---------------------------------------------------------------------------
// LabeledCounter
// ---------------------------------------------------------------------------

/// A counter family with a single label dimension.
///
/// `bump("stale_pricing")` creates the slot on first use; subsequent bumps
/// are a lock-free atomic add. Totals per label never decrease.
pub struct LabeledCounter {
    name: &'static str,
    label_key: &'static str,
    slots: DashMap<String, AtomicU64>,
}

impl LabeledCounter {
    fn new(name: &'static str, label_key: &'static str) -> Self {
        Self {
            name,
            label_key,
            slots: DashMap::new(),
        }
    }

    pub fn bump(&self, label: &str) {
        self.add(label, 1);
    }

    pub fn add(&self, label: &str, amount: u64) {
        if let Some(slot) = self.slots.get(label) {
            slot.fetch_add(amount, Ordering::Relaxed);
            return;
        }
        self.slots
            .entry(label.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self, label: &str) -> u64 {
        self.slots
            .get(label)
            .map(|slot| slot.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum across every label.
    pub fn total(&self) -> u64 {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .sum()
    }

    fn render(&self, out: &mut String) {
        out.push_str(&format!("# TYPE {} counter\n", self.name));
        let mut rows: Vec<(String, u64)> = self
            .slots
            .iter()
            .map(|slot| (slot.key().clone(), slot.load(Ordering::Relaxed)))
            .collect();
        rows.sort();
        for (label, value) in rows {
            out.push_str(&format!(
                "{}{{{}=\"{}\"}} {}\n",
                self.name, self.label_key, label, value
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// RegretHistogram
// ---------------------------------------------------------------------------

/// Fixed-bucket histogram for regret percentages.
///
/// Each observation lands in the first bucket whose bound covers it (or the
/// overflow slot past 100 %); cumulative counts are derived on read. The
/// running sum is stored as micro-percent so the atomic add stays integral.
pub struct RegretHistogram {
    counts: [AtomicU64; REGRET_PCT_BUCKETS.len()],
    overflow: AtomicU64,
    sum_micro_pct: AtomicU64,
    total: AtomicU64,
}

impl RegretHistogram {
    fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            overflow: AtomicU64::new(0),
            sum_micro_pct: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, pct: f64) {
        let pct = pct.max(0.0);
        self.total.fetch_add(1, Ordering::Relaxed);
        self.sum_micro_pct
            .fetch_add((pct * 1_000_000.0).round() as u64, Ordering::Relaxed);
        match REGRET_PCT_BUCKETS.iter().position(|bound| pct <= *bound) {
            Some(idx) => self.counts[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn sum_pct(&self) -> f64 {
        self.sum_micro_pct.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    /// Cumulative count at or below each bucket bound.
    pub fn cumulative_counts(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        REGRET_PCT_BUCKETS
            .iter()
            .zip(&self.counts)
            .map(|(bound, count)| {
                running += count.load(Ordering::Relaxed);
                (*bound, running)
            })
            .collect()
    }

    fn render(&self, out: &mut String) {
        out.push_str("# TYPE regret_pct histogram\n");
        for (bound, cumulative) in self.cumulative_counts() {
            out.push_str(&format!("regret_pct_bucket{{le=\"{bound}\"}} {cumulative}\n"));
        }
        out.push_str(&format!("regret_pct_bucket{{le=\"+Inf\"}} {}\n", self.count()));
        out.push_str(&format!("regret_pct_sum {}\n", self.sum_pct()));
        out.push_str(&format!("regret_pct_count {}\n", self.count()));
    }
}

// ---------------------------------------------------------------------------
// RouterMetrics
// ---------------------------------------------------------------------------

/// Every metric family the routing core emits. Swallowed errors always bump
/// one of these counters, so nothing is silently dropped.
pub struct RouterMetrics {
    /// Routed requests by QoS class.
    pub requests_routed: LabeledCounter,
    /// Candidates skipped inside selection, by reason.
    pub candidates_skipped: LabeledCounter,
    /// Primary-strategy failures, by strategy.
    pub strategy_errors: LabeledCounter,
    /// Cost records dropped by the retry buffer, by reason.
    pub cost_records_dropped: LabeledCounter,
    /// Failed repository writes, by entity.
    pub repository_write_errors: LabeledCounter,
    /// Per-decision regret percentages.
    pub regret_pct: RegretHistogram,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self {
            requests_routed: LabeledCounter::new("requests_routed_total", "qos"),
            candidates_skipped: LabeledCounter::new("candidates_skipped_total", "reason"),
            strategy_errors: LabeledCounter::new("selection_strategy_errors_total", "strategy"),
            cost_records_dropped: LabeledCounter::new("cost_records_dropped_total", "reason"),
            repository_write_errors: LabeledCounter::new(
                "repository_write_errors_total",
                "entity",
            ),
            regret_pct: RegretHistogram::new(),
        }
    }

    /// Text exposition of every family.
    pub fn export(&self) -> String {
        let mut out = String::new();
        for counter in [
            &self.requests_routed,
            &self.candidates_skipped,
            &self.strategy_errors,
            &self.cost_records_dropped,
            &self.repository_write_errors,
        ] {
            counter.render(&mut out);
        }
        self.regret_pct.render(&mut out);
        out
    }
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
