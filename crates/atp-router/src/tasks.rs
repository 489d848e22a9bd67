//! Background task supervision.
//!
//! Five periodic loops keep the core healthy: pricing refresh, SLO
//! recomputation, anomaly baseline refresh, budget monthly roll, and alert
//! cooldown GC (with retry-buffer flushing riding the same cadence). Each
//! iteration runs under a watchdog timeout of twice its period; an
//! iteration that overruns is aborted and the loop continues with the next
//! tick. All loops stop cooperatively on the shutdown signal.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::RouterContext;
use crate::orchestrator::Orchestrator;

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Broadcast-based shutdown coordinator. Components `select!` on a
/// subscribed receiver alongside their work loop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("shutdown signal triggered");
            let _ = self.trigger.send(());
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// TaskSupervisor
// ---------------------------------------------------------------------------

pub struct TaskSupervisor {
    shutdown: Shutdown,
    handles: Vec<JoinHandle<()>>,
}

impl TaskSupervisor {
    /// Spawn every background loop against the given context.
    pub fn spawn(ctx: Arc<RouterContext>) -> Self {
        let shutdown = Shutdown::new();
        let mut handles = Vec::new();

        let pricing_period = Duration::from_secs(ctx.config.pricing.update_interval_seconds);
        {
            let ctx = ctx.clone();
            handles.push(spawn_periodic(
                "pricing_refresh",
                pricing_period,
                shutdown.clone(),
                move || {
                    let ctx = ctx.clone();
                    async move {
                        ctx.pricing_monitor.refresh_all().await;
                    }
                },
            ));
        }

        {
            let ctx = ctx.clone();
            handles.push(spawn_periodic(
                "slo_recompute",
                Duration::from_secs(60),
                shutdown.clone(),
                move || {
                    let ctx = ctx.clone();
                    async move {
                        ctx.slo.recompute();
                        Orchestrator::new(ctx).raise_slo_conditions().await;
                    }
                },
            ));
        }

        {
            let ctx = ctx.clone();
            let period = Duration::from_secs(ctx.config.anomaly.baseline_update_interval_seconds);
            handles.push(spawn_periodic(
                "anomaly_baseline",
                period,
                shutdown.clone(),
                move || {
                    let ctx = ctx.clone();
                    async move {
                        ctx.anomaly.update_baseline();
                        ctx.anomaly.detect_anomalies(None, None, None);
                    }
                },
            ));
        }

        {
            let ctx = ctx.clone();
            handles.push(spawn_periodic(
                "budget_roll",
                Duration::from_secs(60),
                shutdown.clone(),
                move || {
                    let ctx = ctx.clone();
                    async move {
                        ctx.budget.roll_if_needed();
                    }
                },
            ));
        }

        {
            let ctx = ctx.clone();
            handles.push(spawn_periodic(
                "cooldown_gc",
                Duration::from_secs(60),
                shutdown.clone(),
                move || {
                    let ctx = ctx.clone();
                    async move {
                        ctx.alerts.gc_cooldowns();
                        ctx.retry_buffer.flush(ctx.repository.as_ref()).await;
                    }
                },
            ));
        }

        Self { shutdown, handles }
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Stop all loops and wait for them to drain.
    pub async fn stop(self) {
        self.shutdown.trigger();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Run `work` every `period`. Iterations exceeding twice the period are
/// aborted by the watchdog and the loop keeps going.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: Shutdown,
    work: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut rx = shutdown.subscribe();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so loops start one
        // period after boot.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = rx.recv() => {
                    debug!(task = name, "background task stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match tokio::time::timeout(period * 2, work()).await {
                        Ok(()) => {}
                        Err(_) => {
                            warn!(task = name, "iteration exceeded watchdog, aborted and restarted");
                        }
                    }
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use atp_core::config::RouterConfig;

    #[tokio::test]
    async fn supervisor_spawns_and_stops_cleanly() {
        let (ctx, _alert_rx) = RouterContext::builder(RouterConfig::default())
            .build()
            .unwrap();
        let supervisor = TaskSupervisor::spawn(ctx);
        let shutdown = supervisor.shutdown_handle();
        assert!(!shutdown.is_shutting_down());
        supervisor.stop().await;
        assert!(shutdown.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_runs_on_its_cadence() {
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let shutdown = Shutdown::new();
        let c = counter.clone();
        let handle = spawn_periodic(
            "test_tick",
            Duration::from_secs(10),
            shutdown.clone(),
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::Relaxed);
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(35)).await;
        shutdown.trigger();
        let _ = handle.await;
        // Ticks at t=10, 20, 30.
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_aborts_stuck_iterations() {
        let started = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let finished = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let shutdown = Shutdown::new();
        let (s, f) = (started.clone(), finished.clone());
        let handle = spawn_periodic(
            "stuck_task",
            Duration::from_secs(10),
            shutdown.clone(),
            move || {
                let (s, f) = (s.clone(), f.clone());
                async move {
                    s.fetch_add(1, Ordering::Relaxed);
                    // Hangs far past the 20s watchdog.
                    tokio::time::sleep(Duration::from_secs(300)).await;
                    f.fetch_add(1, Ordering::Relaxed);
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(65)).await;
        shutdown.trigger();
        let _ = handle.await;
        // Each hung iteration was aborted, and the loop kept restarting.
        assert!(started.load(Ordering::Relaxed) >= 2);
        assert_eq!(finished.load(Ordering::Relaxed), 0);
    }
}
