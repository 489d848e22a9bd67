//! Real-time pricing pipeline: provider sources, TTL cache with change
//! detection, and the monitor that keeps the cache fresh and turns price
//! moves into alerts.

pub mod cache;
pub mod monitor;
pub mod source;

pub use cache::{PricingCache, PricingChange, PricingEntry, TokenType};
pub use monitor::{
    MonitorStatistics, PricingMonitor, PricingValidation, RefreshSummary, StaleReport,
};
pub use source::{
    fetch_all_with_retries, AnthropicPricingApi, GooglePricingApi, MockPricingSource,
    OpenAiPricingApi, PricingApiError, PricingSource, ProviderPricing,
};
