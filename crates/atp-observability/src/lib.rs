//! Observability layer for the routing core: metrics, structured alert
//! emission with cooldowns, SLO tracking, and the incident trigger that maps
//! conditions to remediation intents.

pub mod alerts;
pub mod incident;
pub mod logging;
pub mod metrics;
pub mod slo;

pub use alerts::{Alert, AlertEmitter, AlertSeverity};
pub use incident::{
    default_intent_catalog, ExecutionRecord, IncidentTrigger, IntentSpec, RemediationIntent,
    RemediationStatus,
};
pub use logging::LogFormat;
pub use metrics::{LabeledCounter, RegretHistogram, RouterMetrics, REGRET_PCT_BUCKETS};
pub use slo::{default_slo_targets, SloObservation, SloState, SloStatus, SloTarget, SloTracker};
