//! Incident trigger: maps observed conditions to remediation intents.
//!
//! The core never executes remediation itself. A condition selects intents
//! from the catalog; each intent either dispatches immediately or queues for
//! approval. Execution side effects live behind the dispatcher collaborator,
//! which reports completions back here for history and rate-limit counters.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use atp_core::config::IncidentSettings;
use atp_core::Clock;

// ---------------------------------------------------------------------------
// Intents
// ---------------------------------------------------------------------------

/// A remediation the core wants a collaborator to perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationIntent {
    pub id: Uuid,
    pub kind: String,
    pub config: serde_json::Value,
    pub requires_approval: bool,
}

/// Catalog entry describing when an intent fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentSpec {
    pub kind: String,
    pub description: String,
    pub trigger_conditions: Vec<String>,
    pub config: serde_json::Value,
    pub requires_approval: bool,
    pub enabled: bool,
}

/// Built-in catalog. Rollbacks and tenant suspension are gated on approval;
/// the rest dispatch automatically.
pub fn default_intent_catalog() -> Vec<IntentSpec> {
    vec![
        IntentSpec {
            kind: "restart_router_service".into(),
            description: "Restart the router service".into(),
            trigger_conditions: vec![
                "high_error_rate".into(),
                "service_unavailable".into(),
                "slo_violation_availability".into(),
            ],
            config: serde_json::json!({ "service": "atp-router", "graceful": true }),
            requires_approval: false,
            enabled: true,
        },
        IntentSpec {
            kind: "scale_up_router".into(),
            description: "Add router replicas".into(),
            trigger_conditions: vec![
                "slo_violation_latency_p95".into(),
                "high_latency".into(),
            ],
            config: serde_json::json!({ "service": "atp-router", "delta": 2, "max_replicas": 10 }),
            requires_approval: false,
            enabled: true,
        },
        IntentSpec {
            kind: "clear_pricing_cache".into(),
            description: "Flush the pricing cache".into(),
            trigger_conditions: vec!["cache_errors".into()],
            config: serde_json::json!({ "cache": "pricing" }),
            requires_approval: false,
            enabled: true,
        },
        IntentSpec {
            kind: "enable_circuit_breaker".into(),
            description: "Open the circuit to a failing provider".into(),
            trigger_conditions: vec!["external_service_errors".into()],
            config: serde_json::json!({ "duration_seconds": 300 }),
            requires_approval: false,
            enabled: true,
        },
        IntentSpec {
            kind: "rollback_deployment".into(),
            description: "Roll back the latest deployment".into(),
            trigger_conditions: vec!["deployment_errors".into()],
            config: serde_json::json!({ "service": "atp-router" }),
            requires_approval: true,
            enabled: true,
        },
        IntentSpec {
            kind: "suspend_tenant_traffic".into(),
            description: "Suspend traffic for an over-budget tenant".into(),
            trigger_conditions: vec!["budget_exceeded".into()],
            config: serde_json::json!({ "duration_seconds": 3600 }),
            requires_approval: true,
            enabled: true,
        },
        IntentSpec {
            kind: "lock_down_api".into(),
            description: "Restrict the API surface after a security violation".into(),
            trigger_conditions: vec!["security_violation".into()],
            config: serde_json::json!({ "mode": "read_only" }),
            requires_approval: true,
            enabled: true,
        },
    ]
}

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStatus {
    Dispatched,
    PendingApproval,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub intent_id: Uuid,
    pub kind: String,
    pub condition: String,
    pub status: RemediationStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
}

// ---------------------------------------------------------------------------
// IncidentTrigger
// ---------------------------------------------------------------------------

pub struct IncidentTrigger {
    catalog: Vec<IntentSpec>,
    max_executions_per_hour: u32,
    /// Sliding window of dispatch timestamps per intent kind.
    executions: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    pending: Mutex<Vec<(RemediationIntent, String)>>,
    history: Mutex<Vec<ExecutionRecord>>,
    clock: Arc<dyn Clock>,
}

impl IncidentTrigger {
    pub fn new(settings: &IncidentSettings, catalog: Vec<IntentSpec>, clock: Arc<dyn Clock>) -> Self {
        Self {
            catalog,
            max_executions_per_hour: settings.max_executions_per_hour,
            executions: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            clock,
        }
    }

    pub fn with_defaults(settings: &IncidentSettings, clock: Arc<dyn Clock>) -> Self {
        Self::new(settings, default_intent_catalog(), clock)
    }

    /// React to a condition. Returns the intents ready for dispatch;
    /// approval-required intents are queued instead.
    pub fn handle_condition(&self, condition: &str) -> Vec<RemediationIntent> {
        let now = self.clock.now();
        let mut dispatched = Vec::new();

        for spec in self.catalog.iter().filter(|s| s.enabled) {
            if !spec.trigger_conditions.iter().any(|c| c == condition) {
                continue;
            }
            if self.is_rate_limited(&spec.kind, now) {
                warn!(kind = %spec.kind, condition, "remediation rate-limited");
                continue;
            }

            let intent = RemediationIntent {
                id: Uuid::new_v4(),
                kind: spec.kind.clone(),
                config: spec.config.clone(),
                requires_approval: spec.requires_approval,
            };

            if spec.requires_approval {
                info!(kind = %spec.kind, condition, "remediation queued for approval");
                self.record(ExecutionRecord {
                    intent_id: intent.id,
                    kind: intent.kind.clone(),
                    condition: condition.to_string(),
                    status: RemediationStatus::PendingApproval,
                    started_at: now,
                    completed_at: None,
                    output: None,
                });
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((intent, condition.to_string()));
            } else {
                debug!(kind = %spec.kind, condition, "remediation dispatched");
                self.count_execution(&spec.kind, now);
                self.record(ExecutionRecord {
                    intent_id: intent.id,
                    kind: intent.kind.clone(),
                    condition: condition.to_string(),
                    status: RemediationStatus::Dispatched,
                    started_at: now,
                    completed_at: None,
                    output: None,
                });
                dispatched.push(intent);
            }
        }

        dispatched
    }

    /// Intents waiting for an operator decision.
    pub fn pending_approvals(&self) -> Vec<RemediationIntent> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(i, _)| i.clone())
            .collect()
    }

    /// Approve a queued intent, making it ready for dispatch. Approval also
    /// consumes a rate-limit slot.
    pub fn approve(&self, id: Uuid) -> Option<RemediationIntent> {
        let now = self.clock.now();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let idx = pending.iter().position(|(i, _)| i.id == id)?;
        let (intent, _condition) = pending.remove(idx);
        drop(pending);

        self.count_execution(&intent.kind, now);
        self.update_status(intent.id, RemediationStatus::Dispatched, None);
        Some(intent)
    }

    /// Completion notification from the dispatcher collaborator.
    pub fn record_completion(&self, intent_id: Uuid, success: bool, output: Option<String>) {
        let status = if success {
            RemediationStatus::Succeeded
        } else {
            RemediationStatus::Failed
        };
        self.update_status(intent_id, status, output);
    }

    pub fn history(&self) -> Vec<ExecutionRecord> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn is_rate_limited(&self, kind: &str, now: DateTime<Utc>) -> bool {
        let mut executions = self.executions.lock().unwrap_or_else(|e| e.into_inner());
        let window = executions.entry(kind.to_string()).or_default();
        let hour_ago = now - Duration::hours(1);
        while window.front().map_or(false, |ts| *ts < hour_ago) {
            window.pop_front();
        }
        window.len() as u32 >= self.max_executions_per_hour
    }

    fn count_execution(&self, kind: &str, now: DateTime<Utc>) {
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind.to_string())
            .or_default()
            .push_back(now);
    }

    fn record(&self, record: ExecutionRecord) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    fn update_status(&self, intent_id: Uuid, status: RemediationStatus, output: Option<String>) {
        let now = self.clock.now();
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = history.iter_mut().rev().find(|r| r.intent_id == intent_id) {
            record.status = status;
            if matches!(status, RemediationStatus::Succeeded | RemediationStatus::Failed) {
                record.completed_at = Some(now);
            }
            record.output = output;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
