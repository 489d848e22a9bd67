//! Persistence capability.
//!
//! The core never constructs SQL; it depends on this async repository
//! abstraction, idempotent on correlation/event ids. Failed cost-record
//! writes land in a bounded retry buffer; once the buffer overflows or a
//! record exhausts its retries, the record is dropped with a counter bump
//! and a `cost_record_dropped` alert.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use atp_core::registry::RegistryRecord;
use atp_core::{CostRecord, RouteDecision, RouterError};
use atp_observability::{Alert, AlertEmitter, AlertSeverity, RouterMetrics};

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Repository: Send + Sync {
    /// Idempotent on `decision.correlation_id`.
    async fn save_decision(&self, decision: &RouteDecision) -> Result<(), RouterError>;

    /// Idempotent on `record.decision_id`.
    async fn save_cost_record(&self, record: &CostRecord) -> Result<(), RouterError>;

    async fn load_registry(&self) -> Result<Vec<RegistryRecord>, RouterError>;

    async fn save_registry(&self, records: &[RegistryRecord]) -> Result<(), RouterError>;

    /// Idempotent on `event_id`.
    async fn append_audit(&self, event_id: &str, event: serde_json::Value)
        -> Result<(), RouterError>;
}

// ---------------------------------------------------------------------------
// InMemoryRepository
// ---------------------------------------------------------------------------

/// Repository backed by in-process maps. Used in tests and for running the
/// core without a database; supports failure injection to exercise the
/// degradation paths.
#[derive(Default)]
pub struct InMemoryRepository {
    decisions: Mutex<HashMap<String, RouteDecision>>,
    cost_records: Mutex<HashMap<String, CostRecord>>,
    registry: Mutex<Vec<RegistryRecord>>,
    audit: Mutex<HashMap<String, serde_json::Value>>,
    fail_writes: AtomicBool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail with `RepositoryUnavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), RouterError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            Err(RouterError::RepositoryUnavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }

    pub async fn decision_count(&self) -> usize {
        self.decisions.lock().await.len()
    }

    pub async fn cost_record_count(&self) -> usize {
        self.cost_records.lock().await.len()
    }

    pub async fn audit_events(&self) -> Vec<String> {
        self.audit.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn save_decision(&self, decision: &RouteDecision) -> Result<(), RouterError> {
        self.check_available()?;
        self.decisions
            .lock()
            .await
            .insert(decision.correlation_id.clone(), decision.clone());
        Ok(())
    }

    async fn save_cost_record(&self, record: &CostRecord) -> Result<(), RouterError> {
        self.check_available()?;
        self.cost_records
            .lock()
            .await
            .insert(record.decision_id.clone(), record.clone());
        Ok(())
    }

    async fn load_registry(&self) -> Result<Vec<RegistryRecord>, RouterError> {
        Ok(self.registry.lock().await.clone())
    }

    async fn save_registry(&self, records: &[RegistryRecord]) -> Result<(), RouterError> {
        self.check_available()?;
        *self.registry.lock().await = records.to_vec();
        Ok(())
    }

    async fn append_audit(
        &self,
        event_id: &str,
        event: serde_json::Value,
    ) -> Result<(), RouterError> {
        self.check_available()?;
        self.audit.lock().await.insert(event_id.to_string(), event);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RetryBuffer
// ---------------------------------------------------------------------------

pub struct RetryBuffer {
    capacity: usize,
    max_retries: u32,
    queue: Mutex<VecDeque<(CostRecord, u32)>>,
    dropped: AtomicU64,
    emitter: Arc<AlertEmitter>,
    metrics: Arc<RouterMetrics>,
}

impl RetryBuffer {
    pub fn new(
        capacity: usize,
        max_retries: u32,
        emitter: Arc<AlertEmitter>,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            capacity,
            max_retries,
            queue: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            emitter,
            metrics,
        }
    }

    /// Queue a record whose write failed. Overflow drops the record.
    pub async fn enqueue(&self, record: CostRecord) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.capacity {
            drop(queue);
            self.drop_record(&record, "buffer_full");
            return;
        }
        debug!(decision_id = %record.decision_id, "cost record queued for retry");
        queue.push_back((record, 0));
    }

    /// Retry every queued record once. Records that exhaust their retry
    /// budget are dropped.
    pub async fn flush(&self, repo: &dyn Repository) -> usize {
        let drained: Vec<(CostRecord, u32)> = {
            let mut queue = self.queue.lock().await;
            queue.drain(..).collect()
        };
        let mut flushed = 0usize;

        for (record, attempts) in drained {
            match repo.save_cost_record(&record).await {
                Ok(()) => flushed += 1,
                Err(err) => {
                    let attempts = attempts + 1;
                    if attempts >= self.max_retries {
                        warn!(decision_id = %record.decision_id, %err, "cost record exhausted retries");
                        self.drop_record(&record, "retries_exhausted");
                    } else {
                        self.queue.lock().await.push_back((record, attempts));
                    }
                }
            }
        }
        flushed
    }

    fn drop_record(&self, record: &CostRecord, reason: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.metrics.cost_records_dropped.bump(reason);
        self.emitter.emit(
            Alert::new(
                "cost_record_dropped",
                AlertSeverity::High,
                format!("cost_record_dropped::{reason}"),
                serde_json::json!({
                    "decision_id": record.decision_id,
                    "cost_usd": record.cost_usd,
                    "reason": reason,
                }),
            )
            .with_label("reason", reason.to_string()),
        );
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
