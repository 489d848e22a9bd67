//! Structured alert emission with cooldown suppression.
//!
//! The core emits alert *events*; transport (webhook, email, chat) is a
//! collaborator consuming the receiver end of a bounded channel. Two alerts
//! sharing a `cooldown_key` within the cooldown window collapse into one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use atp_core::config::{AlertSettings, OverflowPolicy};
use atp_core::Clock;

// ---------------------------------------------------------------------------
// Alert
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// An emitted alert event. Delivery is out of scope for the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: String,
    pub severity: AlertSeverity,
    pub labels: HashMap<String, String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub cooldown_key: String,
}

impl Alert {
    pub fn new(
        kind: impl Into<String>,
        severity: AlertSeverity,
        cooldown_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            severity,
            labels: HashMap::new(),
            payload,
            created_at: Utc::now(),
            cooldown_key: cooldown_key.into(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// AlertEmitter
// ---------------------------------------------------------------------------

/// Bounded-channel alert pipeline with per-key cooldowns.
pub struct AlertEmitter {
    tx: flume::Sender<Alert>,
    cooldowns: DashMap<String, DateTime<Utc>>,
    cooldown: Duration,
    policy: OverflowPolicy,
    dropped: AtomicU64,
    suppressed: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl AlertEmitter {
    /// Build an emitter and the receiver the transport collaborator drains.
    pub fn new(settings: &AlertSettings, clock: Arc<dyn Clock>) -> (Arc<Self>, flume::Receiver<Alert>) {
        let (tx, rx) = flume::bounded(settings.channel_capacity);
        let emitter = Arc::new(Self {
            tx,
            cooldowns: DashMap::new(),
            cooldown: Duration::seconds(settings.cooldown_seconds as i64),
            policy: settings.overflow_policy,
            dropped: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            clock,
        });
        (emitter, rx)
    }

    /// Emit an alert. Returns `true` when the event entered the channel,
    /// `false` when suppressed by cooldown or dropped on overflow.
    pub fn emit(&self, mut alert: Alert) -> bool {
        let now = self.clock.now();
        alert.created_at = now;

        if let Some(last) = self.cooldowns.get(&alert.cooldown_key) {
            if now - *last < self.cooldown {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        self.cooldowns.insert(alert.cooldown_key.clone(), now);

        match self.policy {
            OverflowPolicy::Block => {
                if self.tx.send(alert).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                true
            }
            OverflowPolicy::DropNewest => match self.tx.try_send(alert) {
                Ok(()) => true,
                Err(err) => {
                    warn!(%err, "alert channel full, event dropped");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    false
                }
            },
        }
    }

    /// Drop cooldown entries whose window has elapsed. Driven by a
    /// background task so the map stays bounded.
    pub fn gc_cooldowns(&self) -> usize {
        let now = self.clock.now();
        let before = self.cooldowns.len();
        let cooldown = self.cooldown;
        self.cooldowns.retain(|_, last| now - *last < cooldown);
        before - self.cooldowns.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
