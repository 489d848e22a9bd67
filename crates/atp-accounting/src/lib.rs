//! Cost accounting: multi-dimensional aggregation, budget enforcement,
//! statistical anomaly detection, spend forecasting, and revenue-share
//! reporting.

pub mod aggregator;
pub mod anomaly;
pub mod budget;
pub mod forecast;
pub mod revenue;

pub use aggregator::{CostAggregator, CostSnapshot, TokenUsage, ValidationStats};
pub use anomaly::{
    Anomaly, AnomalyDetector, AnomalyIndicator, AnomalyKind, BaselineStats, PreRequestCheck,
    StatBlock,
};
pub use budget::{BudgetEntityStatus, BudgetManager, BudgetState, Enforcement, SpendingOutcome};
pub use forecast::{
    CostForecast, CostForecaster, CostPerTokenTrend, ForecastModel, ForecastPoint, TrendDirection,
    UsageForecast,
};
pub use revenue::{
    ProviderRevenue, RevenueShareConfig, RevenueShareReport, RevenueShareReporter,
};
