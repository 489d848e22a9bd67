//! Error taxonomy for the routing core.
//!
//! Input and selection errors surface to the caller unchanged. Dependency
//! errors degrade (static pricing, pass-through cache, buffered repository
//! writes). Integrity errors are fatal at startup and isolating at runtime.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    // -- input errors --------------------------------------------------------
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown quality tier: {0}")]
    UnknownQuality(String),

    #[error("unknown safety grade: {0}")]
    BadSafetyGrade(String),

    // -- selection errors ----------------------------------------------------
    #[error("no viable candidate for request")]
    NoViableCandidate,

    #[error("budget blocked: {}", reasons.join(", "))]
    BudgetBlocked { reasons: Vec<String> },

    // -- dependency errors ---------------------------------------------------
    #[error("pricing source unavailable: {0}")]
    PricingSourceUnavailable(String),

    #[error("repository unavailable: {0}")]
    RepositoryUnavailable(String),

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    // -- integrity errors ----------------------------------------------------
    #[error("registry corruption: {0}")]
    RegistryCorruption(String),

    #[error("custody log tampered at entry {entry}")]
    CustodyTampered { entry: usize },

    // -- internal invariants -------------------------------------------------
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl RouterError {
    /// Integrity errors halt startup; everything else degrades or surfaces.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            RouterError::RegistryCorruption(_) | RouterError::CustodyTampered { .. }
        )
    }

    /// Whether this error invalidates the whole decision (vs. a single
    /// candidate, which is skipped with a counter increment).
    pub fn is_decision_terminal(&self) -> bool {
        matches!(
            self,
            RouterError::InvalidRequest(_)
                | RouterError::UnknownQuality(_)
                | RouterError::BadSafetyGrade(_)
                | RouterError::NoViableCandidate
                | RouterError::BudgetBlocked { .. }
                | RouterError::Internal(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(RouterError::RegistryCorruption("bad hash".into()).is_fatal_at_startup());
        assert!(RouterError::CustodyTampered { entry: 3 }.is_fatal_at_startup());
        assert!(!RouterError::NoViableCandidate.is_fatal_at_startup());
        assert!(!RouterError::PricingSourceUnavailable("timeout".into()).is_fatal_at_startup());
    }

    #[test]
    fn terminal_classification() {
        assert!(RouterError::NoViableCandidate.is_decision_terminal());
        assert!(RouterError::BudgetBlocked {
            reasons: vec!["tenant_budget_would_exceed".into()]
        }
        .is_decision_terminal());
        assert!(!RouterError::PricingSourceUnavailable("503".into()).is_decision_terminal());
    }

    #[test]
    fn budget_blocked_display_joins_reasons() {
        let err = RouterError::BudgetBlocked {
            reasons: vec!["tenant_budget_exceeded".into(), "tenant_rate_limit_exceeded".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("tenant_budget_exceeded"));
        assert!(msg.contains("tenant_rate_limit_exceeded"));
    }
}
