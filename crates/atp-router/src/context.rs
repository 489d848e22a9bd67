//! Dependency container for the routing core.
//!
//! Everything the orchestrator and background tasks touch is constructed
//! once here and threaded through `Arc`s; there is no module-level mutable
//! state. The builder lets tests substitute the clock, pricing sources,
//! repository, and dispatcher.

use std::sync::Arc;

use atp_core::{Clock, ModelRegistry, RouterConfig, RouterError, SystemClock};
use atp_accounting::{AnomalyDetector, BudgetManager, CostAggregator, CostForecaster};
use atp_observability::{
    logging, Alert, AlertEmitter, IncidentTrigger, LogFormat, RouterMetrics, SloTracker,
};
use atp_pricing::{MockPricingSource, PricingCache, PricingMonitor, PricingSource};
use atp_selection::{CarbonTracker, PerformanceTracker, RegretCalculator, SelectionEngine};

use crate::remediation::{NoopDispatcher, RemediationDispatcher};
use crate::repository::{InMemoryRepository, Repository, RetryBuffer};

/// Cost records the retry buffer will hold before dropping.
const RETRY_BUFFER_CAPACITY: usize = 1024;
const RETRY_BUFFER_MAX_RETRIES: u32 = 5;

// ---------------------------------------------------------------------------
// RouterContext
// ---------------------------------------------------------------------------

pub struct RouterContext {
    pub config: RouterConfig,
    pub clock: Arc<dyn Clock>,
    pub registry: ModelRegistry,
    pub metrics: Arc<RouterMetrics>,
    pub alerts: Arc<AlertEmitter>,
    pub pricing_cache: Arc<PricingCache>,
    pub pricing_monitor: Arc<PricingMonitor>,
    pub tracker: Arc<PerformanceTracker>,
    pub engine: Arc<SelectionEngine>,
    pub regret: Arc<RegretCalculator>,
    pub aggregator: Arc<CostAggregator>,
    pub budget: Arc<BudgetManager>,
    pub anomaly: Arc<AnomalyDetector>,
    pub forecaster: Arc<CostForecaster>,
    pub slo: Arc<SloTracker>,
    pub incidents: Arc<IncidentTrigger>,
    pub repository: Arc<dyn Repository>,
    pub dispatcher: Arc<dyn RemediationDispatcher>,
    pub retry_buffer: Arc<RetryBuffer>,
}

impl RouterContext {
    pub fn builder(config: RouterConfig) -> RouterContextBuilder {
        RouterContextBuilder::new(config)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct RouterContextBuilder {
    config: RouterConfig,
    clock: Arc<dyn Clock>,
    registry: Option<ModelRegistry>,
    pricing_sources: Option<Vec<Arc<dyn PricingSource>>>,
    repository: Option<Arc<dyn Repository>>,
    dispatcher: Option<Arc<dyn RemediationDispatcher>>,
    log_format: Option<LogFormat>,
}

impl RouterContextBuilder {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            registry: None,
            pricing_sources: None,
            repository: None,
            dispatcher: None,
            log_format: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn pricing_sources(mut self, sources: Vec<Arc<dyn PricingSource>>) -> Self {
        self.pricing_sources = Some(sources);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn RemediationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Install the process-wide tracing subscriber during `build`.
    /// Embedding binaries that manage their own subscriber skip this.
    pub fn logging(mut self, format: LogFormat) -> Self {
        self.log_format = Some(format);
        self
    }

    /// Assemble the container. Returns the context together with the alert
    /// receiver the transport collaborator drains.
    pub fn build(self) -> Result<(Arc<RouterContext>, flume::Receiver<Alert>), RouterError> {
        if let Some(format) = self.log_format {
            logging::init("atp-router", "info", format);
        }

        let clock = self.clock;
        let registry = match self.registry {
            Some(registry) => registry,
            None => ModelRegistry::from_records(Vec::new(), clock.clone())?,
        };

        let metrics = Arc::new(RouterMetrics::new());
        let (alerts, alert_rx) = AlertEmitter::new(&self.config.alerts, clock.clone());

        let pricing_cache = Arc::new(PricingCache::new(
            self.config.pricing.cache_ttl_seconds,
            self.config.pricing.change_threshold_percent,
            self.config.pricing.change_log_capacity,
            clock.clone(),
        ));
        let sources = self
            .pricing_sources
            .unwrap_or_else(|| vec![Arc::new(MockPricingSource::new("mock"))]);
        let pricing_monitor = Arc::new(PricingMonitor::new(
            sources,
            pricing_cache.clone(),
            alerts.clone(),
            self.config.pricing.clone(),
            clock.clone(),
        ));

        let budget = Arc::new(BudgetManager::new(
            self.config.budget.clone(),
            alerts.clone(),
            clock.clone(),
        ));
        let tracker = Arc::new(PerformanceTracker::new(100));
        let carbon = Arc::new(CarbonTracker::new(&self.config.carbon));
        let engine = Arc::new(SelectionEngine::new(
            self.config.selection.clone(),
            &self.config.pricing,
            tracker.clone(),
            carbon,
            pricing_cache.clone(),
            budget.clone(),
            metrics.clone(),
            clock.clone(),
        ));

        let regret = Arc::new(RegretCalculator::new(metrics.clone()));
        let aggregator = Arc::new(CostAggregator::new(
            self.config.pricing.validation_tolerance_percent,
            alerts.clone(),
        ));
        let anomaly = Arc::new(AnomalyDetector::new(
            self.config.anomaly.clone(),
            alerts.clone(),
            clock.clone(),
        ));
        let forecaster = Arc::new(CostForecaster::new(clock.clone()));
        let slo = Arc::new(SloTracker::with_defaults(alerts.clone(), clock.clone()));
        let incidents = Arc::new(IncidentTrigger::with_defaults(
            &self.config.incidents,
            clock.clone(),
        ));

        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryRepository::new()));
        let dispatcher = self.dispatcher.unwrap_or_else(|| Arc::new(NoopDispatcher));
        let retry_buffer = Arc::new(RetryBuffer::new(
            RETRY_BUFFER_CAPACITY,
            RETRY_BUFFER_MAX_RETRIES,
            alerts.clone(),
            metrics.clone(),
        ));

        Ok((
            Arc::new(RouterContext {
                config: self.config,
                clock,
                registry,
                metrics,
                alerts,
                pricing_cache,
                pricing_monitor,
                tracker,
                engine,
                regret,
                aggregator,
                budget,
                anomaly,
                forecaster,
                slo,
                incidents,
                repository,
                dispatcher,
                retry_buffer,
            }),
            alert_rx,
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assembles_with_defaults() {
        let (ctx, _alert_rx) = RouterContext::builder(RouterConfig::default())
            .logging(LogFormat::Text)
            .build()
            .unwrap();
        assert_eq!(ctx.registry.snapshot().len(), 0);
        assert!(ctx.config.carbon.enabled);
        assert_eq!(ctx.pricing_monitor.statistics().providers_configured, 1);
    }

    #[test]
    fn builder_accepts_custom_parts() {
        let repo = Arc::new(InMemoryRepository::new());
        let (ctx, _alert_rx) = RouterContext::builder(RouterConfig::default())
            .repository(repo.clone())
            .pricing_sources(vec![
                Arc::new(MockPricingSource::new("alpha")),
                Arc::new(MockPricingSource::new("beta")),
            ])
            .build()
            .unwrap();
        assert_eq!(ctx.pricing_monitor.statistics().providers_configured, 2);
    }
}
