//! End-to-end request flow: gate, select, account.
//!
//! `route` validates, takes a registry snapshot, runs the anomaly pre-check,
//! and invokes selection (which applies the budget gate). `complete` ingests
//! the dispatch result: cost record, budget, anomaly, SLO, regret, and the
//! completion audit event. A cancelled request records nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use atp_core::registry::RegistrySnapshot;
use atp_core::{
    Candidate, CostRecord, DecisionOutcome, RouteDecision, RouteRequest, RouterError,
};
use atp_accounting::{BudgetEntityStatus, PreRequestCheck};
use atp_observability::SloObservation;
use atp_selection::{RegretAnalysis, SelectionMetadata};

use crate::context::RouterContext;
use crate::remediation::remediate_condition;

/// Share of estimated tokens attributed to input in cost projections.
const INPUT_TOKEN_SHARE: f64 = 0.7;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Per-request cancellation flag, checked at every suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Flow types
// ---------------------------------------------------------------------------

/// A routed request waiting for its dispatch result.
#[derive(Debug)]
pub struct RoutedRequest {
    pub decision: RouteDecision,
    pub metadata: SelectionMetadata,
    pub anomaly_precheck: PreRequestCheck,
    /// Budget view for the request's tenant, when one is configured.
    pub budget_status: Option<BudgetEntityStatus>,
    /// Registry view at decision time; regret is computed against it.
    pub snapshot: Arc<RegistrySnapshot>,
}

/// Result of `route`: a plan, or confirmation the request was cancelled
/// before a decision was committed.
#[derive(Debug)]
pub enum RouteOutcome {
    Routed(Box<RoutedRequest>),
    Cancelled,
}

/// What the (external) dispatch reported back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub outcome: DecisionOutcome,
    /// Set when the failure was the provider being unreachable, which
    /// counts against availability rather than just the error rate.
    #[serde(default)]
    pub provider_unavailable: bool,
    /// Observed quality signal, when the caller measured one.
    #[serde(default)]
    pub quality_observed: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub outcome: DecisionOutcome,
    pub cost_record: Option<CostRecord>,
    pub regret: Option<RegretAnalysis>,
    pub cost_within_projection: bool,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    ctx: Arc<RouterContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<RouterContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<RouterContext> {
        &self.ctx
    }

    /// Steps 1–4 of the request flow. Budget blocks and empty viable sets
    /// surface as errors; cancellation short-circuits without state change.
    pub async fn route(
        &self,
        request: RouteRequest,
        cancel: &CancellationToken,
    ) -> Result<RouteOutcome, RouterError> {
        request.validate()?;
        if cancel.is_cancelled() {
            return Ok(RouteOutcome::Cancelled);
        }

        let snapshot = self.ctx.registry.snapshot();

        // Advisory anomaly pre-check against the cheapest possible cost.
        let cheapest = snapshot
            .candidates()
            .iter()
            .map(|c| c.static_cost(request.estimated_tokens))
            .fold(f64::INFINITY, f64::min);
        let anomaly_precheck = if cheapest.is_finite() {
            self.ctx.anomaly.is_anomalous_request(
                cheapest,
                request.estimated_tokens,
                "",
                "",
                request.tenant_id.as_deref(),
            )
        } else {
            PreRequestCheck {
                is_anomalous: false,
                indicators: Vec::new(),
                confidence: 0.0,
            }
        };
        if anomaly_precheck.is_anomalous {
            debug!(
                correlation_id = %request.correlation_id,
                confidence = anomaly_precheck.confidence,
                "pre-request anomaly indicators present"
            );
        }

        let (plan, metadata) = self.ctx.engine.select(&snapshot, &request).await?;
        if cancel.is_cancelled() {
            return Ok(RouteOutcome::Cancelled);
        }

        let decision = RouteDecision {
            correlation_id: request.correlation_id.clone(),
            tenant_id: request.tenant_id.clone(),
            project_id: request.project_id.clone(),
            quality: request.quality,
            latency_slo_ms: request.latency_slo_ms,
            safety_required: request.safety_required,
            estimated_tokens: request.estimated_tokens,
            qos: request.qos,
            plan,
            decided_at: self.ctx.clock.now(),
        };

        if let Err(err) = self.ctx.repository.save_decision(&decision).await {
            warn!(correlation_id = %decision.correlation_id, %err, "decision persist failed");
            self.ctx.metrics.repository_write_errors.bump("decision");
        }
        self.ctx
            .metrics
            .requests_routed
            .bump(&request.qos.to_string());

        let budget_status = request
            .tenant_id
            .as_deref()
            .and_then(|t| self.ctx.budget.tenant_status(t));

        Ok(RouteOutcome::Routed(Box::new(RoutedRequest {
            decision,
            metadata,
            anomaly_precheck,
            budget_status,
            snapshot,
        })))
    }

    /// Steps 5–8: account the dispatch result. A failed dispatch still
    /// records the failure-cost model (zero tokens, zero cost) so SLO
    /// figures stay honest; a cancelled one records nothing.
    pub async fn complete(
        &self,
        routed: &RoutedRequest,
        dispatch: DispatchResult,
        cancel: &CancellationToken,
    ) -> Result<CompletionSummary, RouterError> {
        if dispatch.outcome == DecisionOutcome::Cancelled || cancel.is_cancelled() {
            debug!(
                correlation_id = %routed.decision.correlation_id,
                "request cancelled, skipping accounting"
            );
            return Ok(CompletionSummary {
                outcome: DecisionOutcome::Cancelled,
                cost_record: None,
                regret: None,
                cost_within_projection: true,
            });
        }

        let decision = &routed.decision;
        let failed = dispatch.outcome == DecisionOutcome::Error;
        let (input_tokens, output_tokens, cost_usd) = if failed {
            (0, 0, 0.0)
        } else {
            (dispatch.input_tokens, dispatch.output_tokens, dispatch.cost_usd)
        };

        let record = CostRecord {
            decision_id: decision.correlation_id.clone(),
            provider: dispatch.provider.clone(),
            model: dispatch.model.clone(),
            tenant_id: decision.tenant_id.clone(),
            project_id: decision.project_id.clone(),
            qos: decision.qos,
            input_tokens,
            output_tokens,
            cost_usd,
            recorded_at: self.ctx.clock.now(),
        };

        // Aggregation first: an invariant violation here fails the decision
        // before any budget or SLO state moves.
        self.ctx.aggregator.record(&record)?;

        let expected_cost = self.projected_cost(&dispatch.model, &dispatch.provider, &record, routed);
        let cost_within_projection = match expected_cost {
            Some(expected) if !failed && cost_usd > 0.0 => {
                self.ctx.aggregator.validate_cost(&record, expected)
            }
            _ => true,
        };

        let spending = self.ctx.budget.record_spending(
            cost_usd,
            decision.tenant_id.as_deref(),
            decision.project_id.as_deref(),
        );
        if !spending.critical.is_empty() {
            remediate_condition(&self.ctx.incidents, &self.ctx.dispatcher, "budget_exceeded").await;
        }

        if !failed && record.total_tokens() > 0 {
            self.ctx.anomaly.add_point(
                cost_usd,
                record.total_tokens(),
                &record.provider,
                &record.model,
                record.tenant_id.as_deref(),
            );
            self.ctx.forecaster.add_point(cost_usd, record.total_tokens());
        }

        self.ctx.slo.record(SloObservation {
            available: !dispatch.provider_unavailable,
            success: !failed,
            within_latency: dispatch.latency_ms <= decision.latency_slo_ms,
            within_cost_budget: cost_within_projection,
        });

        // Regret against the decision-time snapshot.
        let chosen = self.served_candidate(routed, &dispatch.model);
        let regret = chosen.map(|chosen| {
            self.ctx.regret.calculate(
                &chosen,
                routed.snapshot.candidates(),
                &routed.snapshot,
                decision.quality,
                decision.latency_slo_ms,
                decision.safety_required,
                record.total_tokens(),
            )
        });

        if let Some(chosen) = self.served_candidate(routed, &dispatch.model) {
            let latency_ratio = if chosen.latency_p95_ms > 0 {
                dispatch.latency_ms as f64 / chosen.latency_p95_ms as f64
            } else {
                1.0
            };
            self.ctx.tracker.record(
                &chosen.name,
                !failed,
                dispatch.quality_observed.unwrap_or(chosen.quality_pred),
                latency_ratio,
            );
        }

        if let Err(err) = self.ctx.repository.save_cost_record(&record).await {
            warn!(decision_id = %record.decision_id, %err, "cost record persist failed, buffering");
            self.ctx.metrics.repository_write_errors.bump("cost_record");
            self.ctx.retry_buffer.enqueue(record.clone()).await;
        }

        let completion_event = serde_json::json!({
            "correlation_id": decision.correlation_id,
            "model": dispatch.model,
            "outcome": dispatch.outcome,
            "cost_usd": cost_usd,
            "regret_pct": regret.as_ref().map(|r| r.regret_pct),
            "throttle_factor": routed.metadata.throttle_factor,
        });
        if let Err(err) = self
            .ctx
            .repository
            .append_audit(
                &format!("completion::{}", decision.correlation_id),
                completion_event,
            )
            .await
        {
            warn!(%err, "completion audit append failed");
            self.ctx.metrics.repository_write_errors.bump("audit");
        }

        Ok(CompletionSummary {
            outcome: dispatch.outcome,
            cost_record: Some(record),
            regret,
            cost_within_projection,
        })
    }

    /// Raise incident conditions for any SLO target currently critical.
    /// Driven by the background recompute task.
    pub async fn raise_slo_conditions(&self) -> usize {
        let mut raised = 0usize;
        for (name, state) in self.ctx.slo.states() {
            if state.status == atp_observability::SloStatus::Critical {
                let condition = format!("slo_violation_{name}");
                raised +=
                    remediate_condition(&self.ctx.incidents, &self.ctx.dispatcher, &condition)
                        .await;
            }
        }
        raised
    }

    fn projected_cost(
        &self,
        model: &str,
        provider: &str,
        record: &CostRecord,
        routed: &RoutedRequest,
    ) -> Option<f64> {
        // Fresh live pricing wins; otherwise the plan's own projection.
        if let Some(entry) = self.ctx.pricing_cache.get(provider, model) {
            let tokens = record.total_tokens() as f64;
            return Some(
                tokens * INPUT_TOKEN_SHARE / 1000.0 * entry.input_per_1k
                    + tokens * (1.0 - INPUT_TOKEN_SHARE) / 1000.0 * entry.output_per_1k,
            );
        }
        routed
            .decision
            .plan
            .entries
            .iter()
            .find(|e| e.candidate.name == model)
            .map(|e| e.expected_cost_usd)
    }

    fn served_candidate(&self, routed: &RoutedRequest, model: &str) -> Option<Candidate> {
        routed
            .snapshot
            .candidates()
            .iter()
            .find(|c| c.name == model)
            .cloned()
            .or_else(|| routed.decision.plan.primary().map(|p| p.candidate.clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RouterContext;
    use crate::repository::InMemoryRepository;
    use atp_core::config::RouterConfig;
    use atp_core::registry::RegistryRecord;
    use atp_core::{
        ManualClock, ModelRegistry, ModelStatus, QosClass, QualityTier, SafetyGrade,
    };
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;

    fn record(
        name: &str,
        cost_per_1k: f64,
        quality: f64,
        latency: u64,
        grade: SafetyGrade,
        status: ModelStatus,
    ) -> RegistryRecord {
        let per_token = cost_per_1k / 1000.0;
        RegistryRecord {
            name: name.to_string(),
            provider: "test".to_string(),
            status,
            safety_grade: grade,
            tags: BTreeSet::new(),
            latency_p50_ms: latency / 2,
            latency_p95_ms: latency,
            quality_score: quality,
            cost_per_input_token: per_token,
            cost_per_output_token: per_token,
            region: "us-west".to_string(),
            manifest_hash: None,
        }
    }

    fn catalog() -> Vec<RegistryRecord> {
        vec![
            record("cheap-model", 0.4, 0.70, 900, SafetyGrade::A, ModelStatus::Active),
            record("mid-model", 1.0, 0.80, 1100, SafetyGrade::A, ModelStatus::Active),
            record("premium-model", 2.0, 0.90, 1400, SafetyGrade::A, ModelStatus::Active),
        ]
    }

    struct TestBed {
        orchestrator: Orchestrator,
        repo: Arc<InMemoryRepository>,
    }

    fn testbed(mut config: RouterConfig) -> TestBed {
        // Deterministic plans in orchestration tests.
        config.selection.exploration_rate = 0.0;
        config.carbon.enabled = false;
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 10, 9, 0, 0).unwrap(),
        ));
        let registry = ModelRegistry::from_records(catalog(), clock.clone()).unwrap();
        let repo = Arc::new(InMemoryRepository::new());
        let (ctx, _alert_rx) = RouterContext::builder(config)
            .clock(clock)
            .registry(registry)
            .repository(repo.clone())
            .build()
            .unwrap();
        TestBed {
            orchestrator: Orchestrator::new(ctx),
            repo,
        }
    }

    fn request(quality: QualityTier, latency_slo_ms: u64) -> RouteRequest {
        RouteRequest {
            correlation_id: "req-1".into(),
            tenant_id: Some("t1".into()),
            project_id: None,
            quality,
            latency_slo_ms,
            safety_required: SafetyGrade::A,
            estimated_tokens: 1000,
            qos: QosClass::Silver,
        }
    }

    fn success_dispatch(model: &str, cost: f64, latency_ms: u64) -> DispatchResult {
        DispatchResult {
            provider: "test".into(),
            model: model.into(),
            input_tokens: 700,
            output_tokens: 300,
            cost_usd: cost,
            latency_ms,
            outcome: DecisionOutcome::Success,
            provider_unavailable: false,
            quality_observed: None,
        }
    }

    async fn must_route(bed: &TestBed, req: RouteRequest) -> RoutedRequest {
        match bed
            .orchestrator
            .route(req, &CancellationToken::new())
            .await
            .unwrap()
        {
            RouteOutcome::Routed(routed) => *routed,
            RouteOutcome::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn happy_path_accounts_everything() {
        let bed = testbed(RouterConfig::default());
        let routed = must_route(&bed, request(QualityTier::Balanced, 1200)).await;
        assert_eq!(routed.decision.plan.primary().unwrap().candidate.name, "mid-model");

        let summary = bed
            .orchestrator
            .complete(
                &routed,
                success_dispatch("mid-model", 1.0, 1000),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.outcome, DecisionOutcome::Success);
        let regret = summary.regret.unwrap();
        assert_eq!(regret.regret_pct, 0.0);
        assert_eq!(regret.optimal_model, "mid-model");

        let ctx = bed.orchestrator.context();
        assert!((ctx.aggregator.total_cost_usd() - 1.0).abs() < 1e-9);
        assert_eq!(bed.repo.decision_count().await, 1);
        assert_eq!(bed.repo.cost_record_count().await, 1);
        assert!(bed
            .repo
            .audit_events()
            .await
            .contains(&"completion::req-1".to_string()));
    }

    #[tokio::test]
    async fn invalid_request_is_rejected_up_front() {
        let bed = testbed(RouterConfig::default());
        let mut req = request(QualityTier::Balanced, 1200);
        req.latency_slo_ms = 0;
        let err = bed
            .orchestrator
            .route(req, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidRequest(_)));
        assert_eq!(bed.repo.decision_count().await, 0);
    }

    #[tokio::test]
    async fn budget_block_skips_all_accounting() {
        let mut config = RouterConfig::default();
        config.budget.tenant_budgets.insert("t1".into(), 10.0);
        let bed = testbed(config);
        let ctx = bed.orchestrator.context();
        ctx.budget.record_spending(9.6, Some("t1"), None);

        // Estimated cost of the cheapest candidate (0.4/1k * 2500) = 1.0.
        let mut req = request(QualityTier::Balanced, 1200);
        req.estimated_tokens = 2500;
        let err = bed
            .orchestrator
            .route(req, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            RouterError::BudgetBlocked { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("tenant_budget")));
            }
            other => panic!("expected BudgetBlocked, got {other:?}"),
        }
        assert_eq!(ctx.aggregator.snapshot().total_requests, 0);
        assert_eq!(ctx.metrics.regret_pct.count(), 0);
        assert_eq!(bed.repo.cost_record_count().await, 0);
    }

    #[tokio::test]
    async fn failed_dispatch_records_zero_cost_for_slo() {
        let bed = testbed(RouterConfig::default());
        let routed = must_route(&bed, request(QualityTier::Balanced, 1200)).await;

        let mut dispatch = success_dispatch("mid-model", 1.0, 5000);
        dispatch.outcome = DecisionOutcome::Error;
        dispatch.provider_unavailable = true;

        let summary = bed
            .orchestrator
            .complete(&routed, dispatch, &CancellationToken::new())
            .await
            .unwrap();

        let record = summary.cost_record.unwrap();
        assert_eq!(record.cost_usd, 0.0);
        assert_eq!(record.total_tokens(), 0);

        let ctx = bed.orchestrator.context();
        assert_eq!(ctx.aggregator.snapshot().total_requests, 1);
        assert_eq!(ctx.aggregator.total_cost_usd(), 0.0);

        ctx.slo.recompute();
        let avail = ctx.slo.state("availability").unwrap();
        assert!(avail.current_pct < 100.0);
    }

    #[tokio::test]
    async fn cancellation_skips_every_side_effect() {
        let bed = testbed(RouterConfig::default());
        let routed = must_route(&bed, request(QualityTier::Balanced, 1200)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = bed
            .orchestrator
            .complete(&routed, success_dispatch("mid-model", 1.0, 900), &cancel)
            .await
            .unwrap();

        assert_eq!(summary.outcome, DecisionOutcome::Cancelled);
        assert!(summary.cost_record.is_none());
        assert!(summary.regret.is_none());

        let ctx = bed.orchestrator.context();
        assert_eq!(ctx.aggregator.snapshot().total_requests, 0);
        assert_eq!(bed.repo.cost_record_count().await, 0);
        assert_eq!(ctx.metrics.regret_pct.count(), 0);
    }

    #[tokio::test]
    async fn route_phase_cancellation_returns_cancelled() {
        let bed = testbed(RouterConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        match bed
            .orchestrator
            .route(request(QualityTier::Balanced, 1200), &cancel)
            .await
            .unwrap()
        {
            RouteOutcome::Cancelled => {}
            RouteOutcome::Routed(_) => panic!("expected cancellation"),
        }
        assert_eq!(bed.repo.decision_count().await, 0);
    }

    #[tokio::test]
    async fn repository_failure_buffers_cost_records() {
        let bed = testbed(RouterConfig::default());
        let routed = must_route(&bed, request(QualityTier::Balanced, 1200)).await;

        bed.repo.set_fail_writes(true);
        bed.orchestrator
            .complete(
                &routed,
                success_dispatch("mid-model", 1.0, 900),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let ctx = bed.orchestrator.context();
        assert_eq!(ctx.retry_buffer.len().await, 1);
        assert_eq!(bed.repo.cost_record_count().await, 0);

        bed.repo.set_fail_writes(false);
        ctx.retry_buffer.flush(bed.repo.as_ref()).await;
        assert_eq!(bed.repo.cost_record_count().await, 1);
    }

    #[tokio::test]
    async fn cost_overrun_counts_against_cost_slo() {
        let bed = testbed(RouterConfig::default());
        let routed = must_route(&bed, request(QualityTier::Balanced, 1200)).await;

        // Plan projected mid-model at 1.0; actual triples it.
        let summary = bed
            .orchestrator
            .complete(
                &routed,
                success_dispatch("mid-model", 3.0, 900),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!summary.cost_within_projection);

        let ctx = bed.orchestrator.context();
        assert_eq!(ctx.aggregator.validation_stats().validation_errors, 1);
    }

    #[tokio::test]
    async fn performance_tracker_learns_from_completion() {
        let bed = testbed(RouterConfig::default());
        let routed = must_route(&bed, request(QualityTier::Balanced, 1200)).await;
        bed.orchestrator
            .complete(
                &routed,
                success_dispatch("mid-model", 1.0, 550),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let ctx = bed.orchestrator.context();
        assert_eq!(ctx.tracker.observation_count("mid-model"), 1);
        // Fast, successful completions earn a boost over the neutral 1.0.
        assert!(ctx.tracker.multiplier("mid-model") >= 1.0);
    }
}
