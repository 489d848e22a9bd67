//! Budget management and enforcement.
//!
//! Each configured tenant and project carries a monthly [`BudgetState`].
//! Crossing the warning threshold throttles, crossing the critical threshold
//! blocks for a bounded period, and the monthly roll clears spend and
//! enforcement together. The manager also applies the per-tenant hourly
//! rate limit and implements the [`BudgetGate`] capability the selection
//! engine consults before committing a plan.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use atp_core::config::BudgetSettings;
use atp_core::{AdmissionDecision, BudgetGate, Clock};
use atp_observability::{Alert, AlertEmitter, AlertSeverity};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "factor")]
pub enum Enforcement {
    None,
    Throttle(f64),
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub monthly_limit_usd: f64,
    pub current_spend_usd: f64,
    pub window_start: DateTime<Utc>,
    pub enforcement: Enforcement,
    enforcement_expires: Option<DateTime<Utc>>,
    #[serde(skip)]
    last_alert: HashMap<String, DateTime<Utc>>,
}

impl BudgetState {
    fn new(monthly_limit_usd: f64, now: DateTime<Utc>) -> Self {
        Self {
            monthly_limit_usd,
            current_spend_usd: 0.0,
            window_start: now,
            enforcement: Enforcement::None,
            enforcement_expires: None,
            last_alert: HashMap::new(),
        }
    }

    pub fn usage_pct(&self) -> f64 {
        if self.monthly_limit_usd <= 0.0 {
            return 0.0;
        }
        self.current_spend_usd / self.monthly_limit_usd * 100.0
    }

    fn clear_expired_block(&mut self, now: DateTime<Utc>) {
        if self.enforcement == Enforcement::Block {
            if let Some(expires) = self.enforcement_expires {
                if now >= expires {
                    self.enforcement = Enforcement::None;
                    self.enforcement_expires = None;
                }
            }
        }
    }
}

/// Per-entity budget view for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetEntityStatus {
    pub limit_usd: f64,
    pub spend_usd: f64,
    pub remaining_usd: f64,
    pub usage_pct: f64,
    pub enforcement: Enforcement,
    pub health: String,
}

/// What happened when spending was recorded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpendingOutcome {
    pub within_budget: bool,
    pub warnings: Vec<String>,
    pub critical: Vec<String>,
}

// ---------------------------------------------------------------------------
// BudgetManager
// ---------------------------------------------------------------------------

pub struct BudgetManager {
    settings: BudgetSettings,
    tenants: DashMap<String, BudgetState>,
    projects: DashMap<String, BudgetState>,
    rate_windows: DashMap<String, VecDeque<DateTime<Utc>>>,
    emitter: Arc<AlertEmitter>,
    clock: Arc<dyn Clock>,
}

impl BudgetManager {
    pub fn new(settings: BudgetSettings, emitter: Arc<AlertEmitter>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let tenants = DashMap::new();
        for (tenant, limit) in &settings.tenant_budgets {
            tenants.insert(tenant.clone(), BudgetState::new(*limit, now));
        }
        let projects = DashMap::new();
        for (project, limit) in &settings.project_budgets {
            projects.insert(project.clone(), BudgetState::new(*limit, now));
        }
        Self {
            settings,
            tenants,
            projects,
            rate_windows: DashMap::new(),
            emitter,
            clock,
        }
    }

    pub fn set_tenant_budget(&self, tenant_id: &str, monthly_limit_usd: f64) {
        let now = self.clock.now();
        self.tenants
            .entry(tenant_id.to_string())
            .and_modify(|s| s.monthly_limit_usd = monthly_limit_usd)
            .or_insert_with(|| BudgetState::new(monthly_limit_usd, now));
        info!(tenant_id, monthly_limit_usd, "tenant budget set");
    }

    pub fn set_project_budget(&self, project_id: &str, monthly_limit_usd: f64) {
        let now = self.clock.now();
        self.projects
            .entry(project_id.to_string())
            .and_modify(|s| s.monthly_limit_usd = monthly_limit_usd)
            .or_insert_with(|| BudgetState::new(monthly_limit_usd, now));
        info!(project_id, monthly_limit_usd, "project budget set");
    }

    /// Record spending against the configured budgets and re-evaluate
    /// enforcement. Entities without a configured budget are unconstrained.
    pub fn record_spending(
        &self,
        cost_usd: f64,
        tenant_id: Option<&str>,
        project_id: Option<&str>,
    ) -> SpendingOutcome {
        let now = self.clock.now();
        let mut outcome = SpendingOutcome {
            within_budget: true,
            warnings: Vec::new(),
            critical: Vec::new(),
        };

        if let Some(tenant) = tenant_id {
            if let Some(mut state) = self.tenants.get_mut(tenant) {
                state.current_spend_usd += cost_usd;
                self.enforce(&mut state, "tenant", tenant, now, &mut outcome);
            }
        }
        if let Some(project) = project_id {
            if let Some(mut state) = self.projects.get_mut(project) {
                state.current_spend_usd += cost_usd;
                self.enforce(&mut state, "project", project, now, &mut outcome);
            }
        }

        outcome
    }

    fn enforce(
        &self,
        state: &mut BudgetState,
        kind: &str,
        entity: &str,
        now: DateTime<Utc>,
        outcome: &mut SpendingOutcome,
    ) {
        let pct = state.usage_pct();
        if pct >= self.settings.critical_threshold_percent {
            outcome.within_budget = false;
            outcome.critical.push(format!("{kind}_budget_critical"));
            if self.settings.enforcement_enabled {
                state.enforcement = Enforcement::Block;
                state.enforcement_expires =
                    Some(now + Duration::seconds(self.settings.block_duration_seconds as i64));
            }
            self.alert(state, kind, entity, "budget_critical", AlertSeverity::Critical, pct, now);
            warn!(kind, entity, usage_pct = pct, "budget critical, requests blocked");
        } else if pct >= self.settings.warning_threshold_percent {
            outcome.warnings.push(format!("{kind}_budget_warning"));
            if self.settings.enforcement_enabled {
                let factor = ((100.0 - pct) / 100.0).max(0.1);
                state.enforcement = Enforcement::Throttle(factor);
                state.enforcement_expires = None;
            }
            self.alert(state, kind, entity, "budget_warning", AlertSeverity::High, pct, now);
        } else if state.enforcement != Enforcement::Block {
            state.enforcement = Enforcement::None;
        }
    }

    fn alert(
        &self,
        state: &mut BudgetState,
        kind: &str,
        entity: &str,
        alert_kind: &str,
        severity: AlertSeverity,
        usage_pct: f64,
        now: DateTime<Utc>,
    ) {
        let cooldown = Duration::seconds(self.settings.alert_cooldown_seconds as i64);
        if let Some(last) = state.last_alert.get(alert_kind) {
            if now - *last < cooldown {
                return;
            }
        }
        state.last_alert.insert(alert_kind.to_string(), now);
        self.emitter.emit(
            Alert::new(
                alert_kind,
                severity,
                format!("{alert_kind}::{kind}:{entity}"),
                serde_json::json!({
                    "entity_kind": kind,
                    "entity_id": entity,
                    "usage_percent": usage_pct,
                    "limit_usd": state.monthly_limit_usd,
                    "spend_usd": state.current_spend_usd,
                }),
            )
            .with_label(kind, entity.to_string()),
        );
    }

    /// Pre-request admission check: active blocks, projected-cost impact,
    /// throttling, and the hourly tenant rate limit.
    pub fn check_request_allowed(
        &self,
        tenant_id: Option<&str>,
        project_id: Option<&str>,
        estimated_cost: Option<f64>,
    ) -> AdmissionDecision {
        let now = self.clock.now();
        let mut decision = AdmissionDecision::allow();

        let check_entity =
            |state: &mut BudgetState, kind: &str, decision: &mut AdmissionDecision| {
                state.clear_expired_block(now);
                match state.enforcement {
                    Enforcement::Block => {
                        decision.allowed = false;
                        decision.reasons.push(format!("{kind}_budget_exceeded"));
                    }
                    Enforcement::Throttle(factor) => {
                        decision.throttle_factor = decision.throttle_factor.min(factor);
                    }
                    Enforcement::None => {}
                }
                if let Some(est) = estimated_cost {
                    let projected_pct = if state.monthly_limit_usd > 0.0 {
                        (state.current_spend_usd + est) / state.monthly_limit_usd * 100.0
                    } else {
                        0.0
                    };
                    if projected_pct > self.settings.critical_threshold_percent {
                        decision.allowed = false;
                        decision.reasons.push(format!("{kind}_budget_would_exceed"));
                    }
                }
            };

        if let Some(tenant) = tenant_id {
            if let Some(mut state) = self.tenants.get_mut(tenant) {
                check_entity(&mut state, "tenant", &mut decision);
            }
        }
        if let Some(project) = project_id {
            if let Some(mut state) = self.projects.get_mut(project) {
                check_entity(&mut state, "project", &mut decision);
            }
        }

        if let Some(tenant) = tenant_id {
            if let Some(&limit) = self.settings.tenant_rate_limits.get(tenant) {
                if !self.within_rate_limit(tenant, limit, now) {
                    decision.allowed = false;
                    decision.reasons.push("tenant_rate_limit_exceeded".to_string());
                }
            }
        }

        decision
    }

    fn within_rate_limit(&self, tenant: &str, limit: u64, now: DateTime<Utc>) -> bool {
        let mut window = self.rate_windows.entry(tenant.to_string()).or_default();
        let hour_ago = now - Duration::hours(1);
        while window.front().map_or(false, |ts| *ts <= hour_ago) {
            window.pop_front();
        }
        if window.len() as u64 >= limit {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Reset any budget whose monthly window has rolled over. Spend and
    /// enforcement clear together, per key.
    pub fn roll_if_needed(&self) -> usize {
        let now = self.clock.now();
        let mut rolled = 0usize;
        for map in [&self.tenants, &self.projects] {
            for mut entry in map.iter_mut() {
                let ws = entry.window_start;
                if (ws.year(), ws.month()) != (now.year(), now.month()) {
                    entry.current_spend_usd = 0.0;
                    entry.enforcement = Enforcement::None;
                    entry.enforcement_expires = None;
                    entry.window_start = now;
                    rolled += 1;
                }
            }
        }
        if rolled > 0 {
            info!(rolled, "monthly budget windows reset");
        }
        rolled
    }

    pub fn tenant_status(&self, tenant_id: &str) -> Option<BudgetEntityStatus> {
        self.tenants.get(tenant_id).map(|s| self.entity_status(&s))
    }

    pub fn project_status(&self, project_id: &str) -> Option<BudgetEntityStatus> {
        self.projects.get(project_id).map(|s| self.entity_status(&s))
    }

    fn entity_status(&self, state: &BudgetState) -> BudgetEntityStatus {
        let pct = state.usage_pct();
        let health = if pct >= self.settings.critical_threshold_percent {
            "critical"
        } else if pct >= self.settings.warning_threshold_percent {
            "warning"
        } else {
            "healthy"
        };
        BudgetEntityStatus {
            limit_usd: state.monthly_limit_usd,
            spend_usd: state.current_spend_usd,
            remaining_usd: state.monthly_limit_usd - state.current_spend_usd,
            usage_pct: pct,
            enforcement: state.enforcement,
            health: health.to_string(),
        }
    }
}

#[async_trait]
impl BudgetGate for BudgetManager {
    async fn check_request(
        &self,
        tenant_id: Option<&str>,
        project_id: Option<&str>,
        estimated_cost: Option<f64>,
    ) -> AdmissionDecision {
        self.check_request_allowed(tenant_id, project_id, estimated_cost)
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

    fn manager_with(settings: BudgetSettings) -> (BudgetManager, flume::Receiver<Alert>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 10, 9, 0, 0).unwrap(),
        ));
        let (emitter, rx) = AlertEmitter::new(&AlertSettings::default(), clock.clone());
        (BudgetManager::new(settings, emitter, clock.clone()), rx, clock)
    }

    fn manager() -> (BudgetManager, flume::Receiver<Alert>, Arc<ManualClock>) {
        let mut settings = BudgetSettings::default();
        settings.tenant_budgets.insert("t1".into(), 10.0);
        settings.project_budgets.insert("p1".into(), 100.0);
        manager_with(settings)
    }

    #[test]
    fn unconstrained_tenant_is_always_allowed() {
        let (mgr, _rx, _clock) = manager();
        let decision = mgr.check_request_allowed(Some("unknown"), None, Some(1_000_000.0));
        assert!(decision.allowed);
        assert_eq!(decision.throttle_factor, 1.0);
    }

    #[test]
    fn spend_accumulates_monotonically_within_window() {
        let (mgr, _rx, _clock) = manager();
        let mut last = 0.0;
        for _ in 0..10 {
            mgr.record_spending(0.5, Some("t1"), None);
            let spend = mgr.tenant_status("t1").unwrap().spend_usd;
            assert!(spend >= last);
            last = spend;
        }
        assert!((last - 5.0).abs() < 1e-9);
    }

    #[test]
    fn warning_threshold_throttles_proportionally() {
        let (mgr, rx, _clock) = manager();
        // 8.5 / 10 = 85% usage.
        mgr.record_spending(8.5, Some("t1"), None);

        let status = mgr.tenant_status("t1").unwrap();
        assert_eq!(status.health, "warning");
        match status.enforcement {
            Enforcement::Throttle(f) => assert!((f - 0.15).abs() < 1e-9),
            other => panic!("expected Throttle, got {other:?}"),
        }

        let decision = mgr.check_request_allowed(Some("t1"), None, None);
        assert!(decision.allowed);
        assert!((decision.throttle_factor - 0.15).abs() < 1e-9);
        assert!(rx.drain().any(|a| a.kind == "budget_warning"));
    }

    #[test]
    fn throttle_floor_is_ten_percent() {
        let (mgr, _rx, _clock) = manager();
        // 9.4 / 10 = 94%: still below critical, factor would be 0.06 -> 0.1.
        mgr.record_spending(9.4, Some("t1"), None);
        match mgr.tenant_status("t1").unwrap().enforcement {
            Enforcement::Throttle(f) => assert!((f - 0.1).abs() < 1e-9),
            other => panic!("expected Throttle, got {other:?}"),
        }
    }

    #[test]
    fn critical_threshold_blocks_and_alerts() {
        let (mgr, rx, _clock) = manager();
        let outcome = mgr.record_spending(9.6, Some("t1"), None);
        assert!(!outcome.within_budget);
        assert!(outcome.critical.contains(&"tenant_budget_critical".to_string()));

        let decision = mgr.check_request_allowed(Some("t1"), None, None);
        assert!(!decision.allowed);
        assert!(decision.reasons.contains(&"tenant_budget_exceeded".to_string()));
        assert!(rx.drain().any(|a| a.kind == "budget_critical"));
    }

    #[test]
    fn projected_cost_denies_before_spending() {
        let (mgr, _rx, _clock) = manager();
        // Spend 9.0 of 10: below critical, nothing blocked yet.
        mgr.record_spending(9.0, Some("t1"), None);
        // 9.0 + 1.0 = 100% > 95% critical threshold.
        let decision = mgr.check_request_allowed(Some("t1"), None, Some(1.0));
        assert!(!decision.allowed);
        assert!(decision
            .reasons
            .contains(&"tenant_budget_would_exceed".to_string()));

        // A small request still fits.
        let decision = mgr.check_request_allowed(Some("t1"), None, Some(0.1));
        assert!(decision.allowed);
    }

    #[test]
    fn block_expires_after_configured_duration() {
        let (mgr, _rx, clock) = manager();
        mgr.record_spending(9.8, Some("t1"), None);
        assert!(!mgr.check_request_allowed(Some("t1"), None, None).allowed);

        clock.advance(Duration::seconds(3601));
        let decision = mgr.check_request_allowed(Some("t1"), None, None);
        assert!(decision.allowed);
    }

    #[test]
    fn project_budgets_enforced_independently() {
        let (mgr, _rx, _clock) = manager();
        mgr.record_spending(96.0, None, Some("p1"));
        let decision = mgr.check_request_allowed(None, Some("p1"), None);
        assert!(!decision.allowed);
        assert!(decision.reasons.contains(&"project_budget_exceeded".to_string()));

        // The tenant dimension is unaffected.
        assert!(mgr.check_request_allowed(Some("t1"), None, None).allowed);
    }

    #[test]
    fn rate_limit_caps_hourly_requests() {
        let mut settings = BudgetSettings::default();
        settings.tenant_rate_limits.insert("t1".into(), 2);
        let (mgr, _rx, clock) = manager_with(settings);

        assert!(mgr.check_request_allowed(Some("t1"), None, None).allowed);
        assert!(mgr.check_request_allowed(Some("t1"), None, None).allowed);
        let third = mgr.check_request_allowed(Some("t1"), None, None);
        assert!(!third.allowed);
        assert!(third.reasons.contains(&"tenant_rate_limit_exceeded".to_string()));

        // Window slides after an hour.
        clock.advance(Duration::seconds(3601));
        assert!(mgr.check_request_allowed(Some("t1"), None, None).allowed);
    }

    #[test]
    fn monthly_roll_resets_spend_and_enforcement() {
        let (mgr, _rx, clock) = manager();
        mgr.record_spending(9.8, Some("t1"), None);
        assert_eq!(mgr.tenant_status("t1").unwrap().health, "critical");

        // Same month: no roll.
        assert_eq!(mgr.roll_if_needed(), 0);

        clock.set(Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 5).unwrap());
        assert_eq!(mgr.roll_if_needed(), 1);

        let status = mgr.tenant_status("t1").unwrap();
        assert_eq!(status.spend_usd, 0.0);
        assert_eq!(status.enforcement, Enforcement::None);
        assert!(mgr.check_request_allowed(Some("t1"), None, None).allowed);
    }

    #[test]
    fn budget_alerts_respect_their_cooldown() {
        let (mgr, rx, _clock) = manager();
        mgr.record_spending(8.1, Some("t1"), None);
        mgr.record_spending(0.1, Some("t1"), None);
        mgr.record_spending(0.1, Some("t1"), None);
        // Three warning-band records, one alert.
        assert_eq!(rx.drain().filter(|a| a.kind == "budget_warning").count(), 1);
    }

    #[test]
    fn enforcement_disabled_still_reports() {
        let mut settings = BudgetSettings::default();
        settings.enforcement_enabled = false;
        settings.tenant_budgets.insert("t1".into(), 10.0);
        let (mgr, _rx, _clock) = manager_with(settings);

        let outcome = mgr.record_spending(9.9, Some("t1"), None);
        assert!(!outcome.within_budget);
        // No block is installed.
        let decision = mgr.check_request_allowed(Some("t1"), None, None);
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn budget_gate_capability_delegates() {
        let (mgr, _rx, _clock) = manager();
        mgr.record_spending(9.8, Some("t1"), None);
        let decision = BudgetGate::check_request(&mgr, Some("t1"), None, None).await;
        assert!(!decision.allowed);
    }

    #[test]
    fn set_budget_at_runtime() {
        let (mgr, _rx, _clock) = manager();
        mgr.set_tenant_budget("t2", 50.0);
        mgr.record_spending(49.0, Some("t2"), None);
        let status = mgr.tenant_status("t2").unwrap();
        assert_eq!(status.health, "critical");
    }
}
