//! Core domain types shared across the routing core.
//!
//! A [`Candidate`] is a model that could fulfil a request; a
//! [`SelectionPlan`] is the ordered list of candidates the router will
//! attempt, primary first. Cost accounting flows through [`CostRecord`].

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RouterError;

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// A model that could fulfil a request. Immutable per registry load;
/// replaced wholesale on registry refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    pub provider: String,
    pub cost_per_1k_tokens: f64,
    /// Predicted quality in `[0, 1]`.
    pub quality_pred: f64,
    pub latency_p95_ms: u64,
    pub region: String,
}

impl Candidate {
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        cost_per_1k_tokens: f64,
        quality_pred: f64,
        latency_p95_ms: u64,
        region: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            cost_per_1k_tokens,
            quality_pred,
            latency_p95_ms,
            region: region.into(),
        }
    }

    /// Static cost projection for a request of `tokens` total tokens.
    pub fn static_cost(&self, tokens: u64) -> f64 {
        (self.cost_per_1k_tokens / 1000.0) * tokens as f64
    }
}

// ---------------------------------------------------------------------------
// Quality tiers
// ---------------------------------------------------------------------------

/// Caller-facing quality tier, mapped to a minimum predicted-quality
/// threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Fast,
    Balanced,
    High,
}

impl QualityTier {
    /// Minimum `quality_pred` a candidate must meet for this tier.
    pub fn min_quality(&self) -> f64 {
        match self {
            QualityTier::Fast => 0.60,
            QualityTier::Balanced => 0.75,
            QualityTier::High => 0.85,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityTier::Fast => write!(f, "fast"),
            QualityTier::Balanced => write!(f, "balanced"),
            QualityTier::High => write!(f, "high"),
        }
    }
}

impl FromStr for QualityTier {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(QualityTier::Fast),
            "balanced" => Ok(QualityTier::Balanced),
            "high" => Ok(QualityTier::High),
            other => Err(RouterError::UnknownQuality(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Safety grades
// ---------------------------------------------------------------------------

/// Ordinal compliance tier. `A` is strictest, `D` weakest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SafetyGrade {
    A,
    B,
    C,
    D,
}

impl SafetyGrade {
    fn rank(&self) -> u8 {
        match self {
            SafetyGrade::A => 4,
            SafetyGrade::B => 3,
            SafetyGrade::C => 2,
            SafetyGrade::D => 1,
        }
    }

    /// Whether a model holding this grade satisfies `required`.
    pub fn permits(&self, required: SafetyGrade) -> bool {
        self.rank() >= required.rank()
    }
}

impl fmt::Display for SafetyGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafetyGrade::A => write!(f, "A"),
            SafetyGrade::B => write!(f, "B"),
            SafetyGrade::C => write!(f, "C"),
            SafetyGrade::D => write!(f, "D"),
        }
    }
}

impl FromStr for SafetyGrade {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(SafetyGrade::A),
            "B" => Ok(SafetyGrade::B),
            "C" => Ok(SafetyGrade::C),
            "D" => Ok(SafetyGrade::D),
            other => Err(RouterError::BadSafetyGrade(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Model lifecycle status
// ---------------------------------------------------------------------------

/// Lifecycle status of a registered model. Shadow models carry comparative
/// traffic but never appear as primary in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Active,
    Shadow,
    Deprecated,
    Sunset,
}

// ---------------------------------------------------------------------------
// QoS
// ---------------------------------------------------------------------------

/// Service class for billing. Distinct from the quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QosClass {
    Gold,
    Silver,
    Bronze,
}

impl fmt::Display for QosClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QosClass::Gold => write!(f, "gold"),
            QosClass::Silver => write!(f, "silver"),
            QosClass::Bronze => write!(f, "bronze"),
        }
    }
}

// ---------------------------------------------------------------------------
// Route request
// ---------------------------------------------------------------------------

/// Inbound routing request, already authenticated and parsed by the outer
/// surface. The core validates the routing-relevant fields only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub correlation_id: String,
    pub tenant_id: Option<String>,
    pub project_id: Option<String>,
    pub quality: QualityTier,
    pub latency_slo_ms: u64,
    pub safety_required: SafetyGrade,
    pub estimated_tokens: u64,
    pub qos: QosClass,
}

impl RouteRequest {
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.correlation_id.is_empty() {
            return Err(RouterError::InvalidRequest(
                "correlation_id must not be empty".into(),
            ));
        }
        if self.latency_slo_ms == 0 {
            return Err(RouterError::InvalidRequest(
                "latency_slo_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Selection plan
// ---------------------------------------------------------------------------

/// Why a candidate occupies its slot in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanRole {
    Primary,
    Exploration,
    PremiumFallback,
    LocalPreference,
}

/// A candidate slotted into a plan with its projected cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedCandidate {
    pub candidate: Candidate,
    pub role: PlanRole,
    pub expected_cost_usd: f64,
}

/// Ordered list of candidates to attempt, primary first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionPlan {
    pub entries: Vec<PlannedCandidate>,
}

impl SelectionPlan {
    /// The candidate the router will attempt first.
    pub fn primary(&self) -> Option<&PlannedCandidate> {
        self.entries.first()
    }

    /// The exploration slot, if one was sampled.
    pub fn exploration(&self) -> Option<&PlannedCandidate> {
        self.entries.iter().find(|e| e.role == PlanRole::Exploration)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.candidate.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Decision + cost accounting
// ---------------------------------------------------------------------------

/// Terminal outcome of a routed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionOutcome {
    Success,
    Error,
    Cancelled,
}

/// A completed routing decision, persisted via the repository capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub correlation_id: String,
    pub tenant_id: Option<String>,
    pub project_id: Option<String>,
    pub quality: QualityTier,
    pub latency_slo_ms: u64,
    pub safety_required: SafetyGrade,
    pub estimated_tokens: u64,
    pub qos: QosClass,
    pub plan: SelectionPlan,
    pub decided_at: DateTime<Utc>,
}

/// Append-only cost record, one per completed dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub decision_id: String,
    pub provider: String,
    pub model: String,
    pub tenant_id: Option<String>,
    pub project_id: Option<String>,
    pub qos: QosClass,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub recorded_at: DateTime<Utc>,
}

impl CostRecord {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ---------------------------------------------------------------------------
// Budget gate capability
// ---------------------------------------------------------------------------

/// Admission verdict produced by the budget layer before selection commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    /// In `(0, 1]`; 1.0 means no throttling.
    pub throttle_factor: f64,
    pub reasons: Vec<String>,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            throttle_factor: 1.0,
            reasons: Vec::new(),
        }
    }
}

/// Capability the selection engine uses to pre-gate requests on budget.
/// Implemented by the budget manager; tests may substitute a stub.
#[async_trait]
pub trait BudgetGate: Send + Sync {
    async fn check_request(
        &self,
        tenant_id: Option<&str>,
        project_id: Option<&str>,
        estimated_cost: Option<f64>,
    ) -> AdmissionDecision;
}

/// Gate that admits everything. Used when budget enforcement is disabled.
#[derive(Debug, Default)]
pub struct OpenGate;

#[async_trait]
impl BudgetGate for OpenGate {
    async fn check_request(
        &self,
        _tenant_id: Option<&str>,
        _project_id: Option<&str>,
        _estimated_cost: Option<f64>,
    ) -> AdmissionDecision {
        AdmissionDecision::allow()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_tier_thresholds() {
        assert_eq!(QualityTier::Fast.min_quality(), 0.60);
        assert_eq!(QualityTier::Balanced.min_quality(), 0.75);
        assert_eq!(QualityTier::High.min_quality(), 0.85);
    }

    #[test]
    fn quality_tier_parses() {
        assert_eq!("balanced".parse::<QualityTier>().unwrap(), QualityTier::Balanced);
        assert_eq!("HIGH".parse::<QualityTier>().unwrap(), QualityTier::High);
        assert!(matches!(
            "ultra".parse::<QualityTier>(),
            Err(RouterError::UnknownQuality(_))
        ));
    }

    #[test]
    fn safety_grade_ordering() {
        assert!(SafetyGrade::A.permits(SafetyGrade::A));
        assert!(SafetyGrade::A.permits(SafetyGrade::D));
        assert!(!SafetyGrade::C.permits(SafetyGrade::A));
        assert!(SafetyGrade::B.permits(SafetyGrade::C));
        assert!(!SafetyGrade::D.permits(SafetyGrade::B));
    }

    #[test]
    fn safety_grade_parses() {
        assert_eq!("a".parse::<SafetyGrade>().unwrap(), SafetyGrade::A);
        assert!(matches!(
            "E".parse::<SafetyGrade>(),
            Err(RouterError::BadSafetyGrade(_))
        ));
    }

    #[test]
    fn candidate_static_cost() {
        let c = Candidate::new("mid-model", "openai", 1.0, 0.80, 1100, "us-west");
        assert!((c.static_cost(1000) - 1.0).abs() < 1e-9);
        assert!((c.static_cost(500) - 0.5).abs() < 1e-9);
        assert_eq!(c.static_cost(0), 0.0);
    }

    #[test]
    fn request_validation() {
        let mut req = RouteRequest {
            correlation_id: "req-1".into(),
            tenant_id: None,
            project_id: None,
            quality: QualityTier::Balanced,
            latency_slo_ms: 1200,
            safety_required: SafetyGrade::A,
            estimated_tokens: 1000,
            qos: QosClass::Silver,
        };
        assert!(req.validate().is_ok());

        req.latency_slo_ms = 0;
        assert!(matches!(req.validate(), Err(RouterError::InvalidRequest(_))));

        req.latency_slo_ms = 100;
        req.correlation_id.clear();
        assert!(matches!(req.validate(), Err(RouterError::InvalidRequest(_))));
    }

    #[test]
    fn plan_accessors() {
        let c = |name: &str| Candidate::new(name, "p", 1.0, 0.8, 900, "us-west");
        let plan = SelectionPlan {
            entries: vec![
                PlannedCandidate {
                    candidate: c("primary"),
                    role: PlanRole::Primary,
                    expected_cost_usd: 0.001,
                },
                PlannedCandidate {
                    candidate: c("explore"),
                    role: PlanRole::Exploration,
                    expected_cost_usd: 0.002,
                },
            ],
        };
        assert_eq!(plan.primary().unwrap().candidate.name, "primary");
        assert_eq!(plan.exploration().unwrap().candidate.name, "explore");
        assert!(plan.contains("explore"));
        assert!(!plan.contains("missing"));
        assert_eq!(plan.len(), 2);
    }

    #[tokio::test]
    async fn open_gate_admits_everything() {
        let gate = OpenGate;
        let decision = gate.check_request(Some("t"), None, Some(999.0)).await;
        assert!(decision.allowed);
        assert_eq!(decision.throttle_factor, 1.0);
        assert!(decision.reasons.is_empty());
    }

    #[test]
    fn cost_record_serde_roundtrip() {
        let record = CostRecord {
            decision_id: "d-1".into(),
            provider: "openai".into(),
            model: "gpt-4o".into(),
            tenant_id: Some("tenant-a".into()),
            project_id: None,
            qos: QosClass::Gold,
            input_tokens: 700,
            output_tokens: 300,
            cost_usd: 0.0123,
            recorded_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let deser: CostRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(deser.model, "gpt-4o");
        assert_eq!(deser.total_tokens(), 1000);
        assert_eq!(deser.qos, QosClass::Gold);
    }
}
