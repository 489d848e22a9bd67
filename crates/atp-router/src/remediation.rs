//! Remediation dispatch capability.
//!
//! The incident trigger produces intents; a collaborator executes them and
//! reports completion. The core only records history and rate limits.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use atp_core::RouterError;
use atp_observability::{IncidentTrigger, RemediationIntent};

#[async_trait]
pub trait RemediationDispatcher: Send + Sync {
    /// Execute an intent, returning collaborator-defined output.
    async fn dispatch(&self, intent: &RemediationIntent) -> Result<String, RouterError>;
}

/// Dispatcher that does nothing. Default when no executor is wired.
#[derive(Debug, Default)]
pub struct NoopDispatcher;

#[async_trait]
impl RemediationDispatcher for NoopDispatcher {
    async fn dispatch(&self, intent: &RemediationIntent) -> Result<String, RouterError> {
        info!(kind = %intent.kind, "remediation intent emitted (no executor wired)");
        Ok("noop".to_string())
    }
}

/// Test dispatcher that records everything it is asked to execute.
#[derive(Default)]
pub struct RecordingDispatcher {
    dispatched: Mutex<Vec<RemediationIntent>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn dispatched(&self) -> Vec<RemediationIntent> {
        self.dispatched.lock().await.clone()
    }
}

#[async_trait]
impl RemediationDispatcher for RecordingDispatcher {
    async fn dispatch(&self, intent: &RemediationIntent) -> Result<String, RouterError> {
        self.dispatched.lock().await.push(intent.clone());
        Ok("recorded".to_string())
    }
}

/// React to a condition: collect intents from the trigger, dispatch each,
/// and feed completions back for history and rate-limit accounting.
pub async fn remediate_condition(
    trigger: &IncidentTrigger,
    dispatcher: &Arc<dyn RemediationDispatcher>,
    condition: &str,
) -> usize {
    let intents = trigger.handle_condition(condition);
    let mut executed = 0usize;
    for intent in intents {
        match dispatcher.dispatch(&intent).await {
            Ok(output) => {
                trigger.record_completion(intent.id, true, Some(output));
                executed += 1;
            }
            Err(err) => {
                trigger.record_completion(intent.id, false, Some(err.to_string()));
            }
        }
    }
    executed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use atp_core::config::IncidentSettings;
    use atp_core::SystemClock;
    use atp_observability::RemediationStatus;

    #[tokio::test]
    async fn condition_dispatches_and_records_completion() {
        let trigger =
            IncidentTrigger::with_defaults(&IncidentSettings::default(), Arc::new(SystemClock));
        let recording = Arc::new(RecordingDispatcher::new());
        let dispatcher: Arc<dyn RemediationDispatcher> = recording.clone();

        let executed = remediate_condition(&trigger, &dispatcher, "cache_errors").await;
        assert_eq!(executed, 1);
        assert_eq!(recording.dispatched().await.len(), 1);

        let history = trigger.history();
        assert!(history
            .iter()
            .any(|r| r.status == RemediationStatus::Succeeded));
    }

    #[tokio::test]
    async fn approval_gated_intents_do_not_dispatch() {
        let trigger =
            IncidentTrigger::with_defaults(&IncidentSettings::default(), Arc::new(SystemClock));
        let recording = Arc::new(RecordingDispatcher::new());
        let dispatcher: Arc<dyn RemediationDispatcher> = recording.clone();

        let executed = remediate_condition(&trigger, &dispatcher, "deployment_errors").await;
        assert_eq!(executed, 0);
        assert!(recording.dispatched().await.is_empty());
        assert_eq!(trigger.pending_approvals().len(), 1);
    }
}
