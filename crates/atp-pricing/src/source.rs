//! Provider pricing sources.
//!
//! Each provider exposes the same capability: fetch per-model token prices.
//! The upstream APIs publish model availability but not machine-readable
//! prices, so each client joins the live model list against its maintained
//! price table. A deterministic mock source is always available for tests
//! and for running without any provider configured.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Retry delays never exceed this cap, regardless of backoff growth or
/// provider retry-after hints.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PricingApiError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("request timed out")]
    Timeout,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for PricingApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PricingApiError::Timeout
        } else {
            PricingApiError::Http(err.to_string())
        }
    }
}

impl PricingApiError {
    /// Transient failures are retried with backoff; the rest surface
    /// immediately.
    fn is_transient(&self) -> bool {
        match self {
            PricingApiError::Http(_) | PricingApiError::Timeout => true,
            PricingApiError::RateLimited { .. } => true,
            PricingApiError::Api { status, .. } => *status >= 500,
            PricingApiError::Parse(_) | PricingApiError::Unavailable(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// Per-model token prices in USD per 1k tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProviderPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Outbound capability the pricing pipeline depends on.
#[async_trait]
pub trait PricingSource: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn fetch_model_pricing(&self, model: &str) -> Result<ProviderPricing, PricingApiError>;

    async fn fetch_all_pricing(&self) -> Result<HashMap<String, ProviderPricing>, PricingApiError>;
}

// ---------------------------------------------------------------------------
// Retry envelope
// ---------------------------------------------------------------------------

/// Fetch all pricing from `source` with bounded exponential backoff.
///
/// `delay = retry_delay * 2^attempt`, capped at 30 s. Rate-limit responses
/// honor the provider's retry-after hint (also capped). Exhausting
/// `retry_attempts` surfaces `Unavailable`.
pub async fn fetch_all_with_retries(
    source: &dyn PricingSource,
    retry_attempts: u32,
    retry_delay: Duration,
) -> Result<HashMap<String, ProviderPricing>, PricingApiError> {
    let mut last_err: Option<PricingApiError> = None;

    for attempt in 0..retry_attempts {
        match source.fetch_all_pricing().await {
            Ok(pricing) => return Ok(pricing),
            Err(err) if err.is_transient() => {
                let delay = match &err {
                    PricingApiError::RateLimited {
                        retry_after_secs: Some(secs),
                    } => Duration::from_secs(*secs).min(MAX_RETRY_DELAY),
                    _ => backoff_delay(retry_delay, attempt),
                };
                debug!(
                    provider = source.provider_name(),
                    attempt,
                    ?delay,
                    %err,
                    "pricing fetch failed, retrying"
                );
                last_err = Some(err);
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }

    warn!(
        provider = source.provider_name(),
        attempts = retry_attempts,
        "pricing source exhausted retries"
    );
    Err(PricingApiError::Unavailable(format!(
        "{} after {} attempts: {}",
        source.provider_name(),
        retry_attempts,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(MAX_RETRY_DELAY)
}

// ---------------------------------------------------------------------------
// HTTP helpers shared by the provider clients
// ---------------------------------------------------------------------------

fn retry_after_hint(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, PricingApiError> {
    let status = resp.status().as_u16();
    if status == 429 {
        let retry_after = retry_after_hint(&resp);
        return Err(PricingApiError::RateLimited {
            retry_after_secs: retry_after,
        });
    }
    if !resp.status().is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(PricingApiError::Api { status, message });
    }
    Ok(resp)
}

#[derive(Deserialize)]
struct ModelListResponse {
    data: Vec<ModelListEntry>,
}

#[derive(Deserialize)]
struct ModelListEntry {
    id: String,
}

// ---------------------------------------------------------------------------
// OpenAiPricingApi
// ---------------------------------------------------------------------------

/// Pricing client for OpenAI. Model availability comes from `/v1/models`;
/// prices come from the maintained table.
pub struct OpenAiPricingApi {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    table: HashMap<String, ProviderPricing>,
}

impl OpenAiPricingApi {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            api_key: api_key.into(),
            base_url: "https://api.openai.com".to_string(),
            table: Self::price_table(),
        }
    }

    /// Override the base URL (useful for testing with a mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn price_table() -> HashMap<String, ProviderPricing> {
        HashMap::from([
            (
                "gpt-4o".to_string(),
                ProviderPricing {
                    input_per_1k: 0.0025,
                    output_per_1k: 0.010,
                },
            ),
            (
                "gpt-4o-mini".to_string(),
                ProviderPricing {
                    input_per_1k: 0.000_15,
                    output_per_1k: 0.000_60,
                },
            ),
            (
                "o3-mini".to_string(),
                ProviderPricing {
                    input_per_1k: 0.0011,
                    output_per_1k: 0.0044,
                },
            ),
        ])
    }

    async fn live_models(&self) -> Result<Vec<String>, PricingApiError> {
        let url = format!("{}/v1/models", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let list: ModelListResponse = resp
            .json()
            .await
            .map_err(|e| PricingApiError::Parse(e.to_string()))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl PricingSource for OpenAiPricingApi {
    fn provider_name(&self) -> &str {
        "openai"
    }

    async fn fetch_model_pricing(&self, model: &str) -> Result<ProviderPricing, PricingApiError> {
        let live = self.live_models().await?;
        if !live.iter().any(|m| m == model) {
            return Err(PricingApiError::Api {
                status: 404,
                message: format!("model {model} not available"),
            });
        }
        self.table
            .get(model)
            .copied()
            .ok_or_else(|| PricingApiError::Unavailable(format!("no price entry for {model}")))
    }

    async fn fetch_all_pricing(&self) -> Result<HashMap<String, ProviderPricing>, PricingApiError> {
        let live = self.live_models().await?;
        Ok(self
            .table
            .iter()
            .filter(|(model, _)| live.iter().any(|m| m == *model))
            .map(|(model, price)| (model.clone(), *price))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// AnthropicPricingApi
// ---------------------------------------------------------------------------

pub struct AnthropicPricingApi {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    table: HashMap<String, ProviderPricing>,
}

impl AnthropicPricingApi {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
            table: Self::price_table(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn price_table() -> HashMap<String, ProviderPricing> {
        HashMap::from([
            (
                "claude-opus-4-20250514".to_string(),
                ProviderPricing {
                    input_per_1k: 0.015,
                    output_per_1k: 0.075,
                },
            ),
            (
                "claude-sonnet-4-20250514".to_string(),
                ProviderPricing {
                    input_per_1k: 0.003,
                    output_per_1k: 0.015,
                },
            ),
            (
                "claude-haiku-4-20250514".to_string(),
                ProviderPricing {
                    input_per_1k: 0.000_80,
                    output_per_1k: 0.004,
                },
            ),
        ])
    }

    async fn live_models(&self) -> Result<Vec<String>, PricingApiError> {
        let url = format!("{}/v1/models", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let list: ModelListResponse = resp
            .json()
            .await
            .map_err(|e| PricingApiError::Parse(e.to_string()))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl PricingSource for AnthropicPricingApi {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    async fn fetch_model_pricing(&self, model: &str) -> Result<ProviderPricing, PricingApiError> {
        let live = self.live_models().await?;
        if !live.iter().any(|m| m == model) {
            return Err(PricingApiError::Api {
                status: 404,
                message: format!("model {model} not available"),
            });
        }
        self.table
            .get(model)
            .copied()
            .ok_or_else(|| PricingApiError::Unavailable(format!("no price entry for {model}")))
    }

    async fn fetch_all_pricing(&self) -> Result<HashMap<String, ProviderPricing>, PricingApiError> {
        let live = self.live_models().await?;
        Ok(self
            .table
            .iter()
            .filter(|(model, _)| live.iter().any(|m| m == *model))
            .map(|(model, price)| (model.clone(), *price))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// GooglePricingApi
// ---------------------------------------------------------------------------

pub struct GooglePricingApi {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    table: HashMap<String, ProviderPricing>,
}

impl GooglePricingApi {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            api_key: api_key.into(),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            table: Self::price_table(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn price_table() -> HashMap<String, ProviderPricing> {
        HashMap::from([
            (
                "gemini-1.5-pro".to_string(),
                ProviderPricing {
                    input_per_1k: 0.001_25,
                    output_per_1k: 0.005,
                },
            ),
            (
                "gemini-1.5-flash".to_string(),
                ProviderPricing {
                    input_per_1k: 0.000_075,
                    output_per_1k: 0.000_30,
                },
            ),
        ])
    }

    async fn live_models(&self) -> Result<Vec<String>, PricingApiError> {
        #[derive(Deserialize)]
        struct GoogleModelList {
            models: Vec<GoogleModel>,
        }
        #[derive(Deserialize)]
        struct GoogleModel {
            name: String,
        }

        let url = format!("{}/v1beta/models?key={}", self.base_url, self.api_key);
        let resp = self.client.get(&url).send().await?;
        let resp = check_status(resp).await?;
        let list: GoogleModelList = resp
            .json()
            .await
            .map_err(|e| PricingApiError::Parse(e.to_string()))?;
        // Names come back as `models/<id>`.
        Ok(list
            .models
            .into_iter()
            .map(|m| m.name.rsplit('/').next().unwrap_or(&m.name).to_string())
            .collect())
    }
}

#[async_trait]
impl PricingSource for GooglePricingApi {
    fn provider_name(&self) -> &str {
        "google"
    }

    async fn fetch_model_pricing(&self, model: &str) -> Result<ProviderPricing, PricingApiError> {
        let live = self.live_models().await?;
        if !live.iter().any(|m| m == model) {
            return Err(PricingApiError::Api {
                status: 404,
                message: format!("model {model} not available"),
            });
        }
        self.table
            .get(model)
            .copied()
            .ok_or_else(|| PricingApiError::Unavailable(format!("no price entry for {model}")))
    }

    async fn fetch_all_pricing(&self) -> Result<HashMap<String, ProviderPricing>, PricingApiError> {
        let live = self.live_models().await?;
        Ok(self
            .table
            .iter()
            .filter(|(model, _)| live.iter().any(|m| m == *model))
            .map(|(model, price)| (model.clone(), *price))
            .collect())
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

// ---------------------------------------------------------------------------
// MockPricingSource
// ---------------------------------------------------------------------------

/// Deterministic pricing source for tests and unconfigured deployments.
///
/// Returns the configured table with a small seeded jitter so repeated runs
/// see stable-but-not-constant prices. Failures can be queued to exercise
/// the retry envelope.
pub struct MockPricingSource {
    name: String,
    table: Mutex<HashMap<String, ProviderPricing>>,
    jitter_pct: f64,
    seed: u64,
    /// Bumped when the table is replaced, so jitter shifts with new data.
    version: AtomicU64,
    queued_failures: Mutex<Vec<PricingApiError>>,
}

impl MockPricingSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: Mutex::new(HashMap::from([
                (
                    "test-model".to_string(),
                    ProviderPricing {
                        input_per_1k: 0.010,
                        output_per_1k: 0.030,
                    },
                ),
                (
                    "test-model-2".to_string(),
                    ProviderPricing {
                        input_per_1k: 0.005,
                        output_per_1k: 0.015,
                    },
                ),
            ])),
            jitter_pct: 0.02,
            seed: 42,
            version: AtomicU64::new(0),
            queued_failures: Mutex::new(Vec::new()),
        }
    }

    /// Disable jitter for byte-exact assertions.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_pct = 0.0;
        self
    }

    /// Replace the whole table.
    pub fn set_table(&self, table: HashMap<String, ProviderPricing>) {
        *self.table.lock().unwrap() = table;
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    /// Set one model's prices.
    pub fn set_pricing(&self, model: impl Into<String>, pricing: ProviderPricing) {
        self.table.lock().unwrap().insert(model.into(), pricing);
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue an error returned by the next fetch.
    pub fn fail_next(&self, err: PricingApiError) {
        self.queued_failures.lock().unwrap().push(err);
    }

    fn take_failure(&self) -> Option<PricingApiError> {
        self.queued_failures.lock().unwrap().pop()
    }

    fn jittered(&self, model: &str, pricing: ProviderPricing) -> ProviderPricing {
        if self.jitter_pct == 0.0 {
            return pricing;
        }
        let mut hash = self.seed ^ self.version.load(Ordering::Relaxed);
        for b in model.bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(b as u64);
        }
        let mut rng = StdRng::seed_from_u64(hash);
        let factor = 1.0 + rng.gen_range(-self.jitter_pct..=self.jitter_pct);
        ProviderPricing {
            input_per_1k: pricing.input_per_1k * factor,
            output_per_1k: pricing.output_per_1k * factor,
        }
    }
}

#[async_trait]
impl PricingSource for MockPricingSource {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn fetch_model_pricing(&self, model: &str) -> Result<ProviderPricing, PricingApiError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let table = self.table.lock().unwrap();
        table
            .get(model)
            .map(|p| self.jittered(model, *p))
            .ok_or_else(|| PricingApiError::Api {
                status: 404,
                message: format!("model {model} not in mock table"),
            })
    }

    async fn fetch_all_pricing(&self) -> Result<HashMap<String, ProviderPricing>, PricingApiError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let table = self.table.lock().unwrap();
        Ok(table
            .iter()
            .map(|(model, p)| (model.clone(), self.jittered(model, *p)))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_returns_table_entries() {
        let mock = MockPricingSource::new("mock").without_jitter();
        let p = mock.fetch_model_pricing("test-model").await.unwrap();
        assert!((p.input_per_1k - 0.010).abs() < 1e-12);
        assert!((p.output_per_1k - 0.030).abs() < 1e-12);

        let all = mock.fetch_all_pricing().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn mock_unknown_model_is_api_error() {
        let mock = MockPricingSource::new("mock");
        let err = mock.fetch_model_pricing("nope").await.unwrap_err();
        assert!(matches!(err, PricingApiError::Api { status: 404, .. }));
    }

    #[tokio::test]
    async fn mock_jitter_is_deterministic_and_small() {
        let mock = MockPricingSource::new("mock");
        let a = mock.fetch_model_pricing("test-model").await.unwrap();
        let b = mock.fetch_model_pricing("test-model").await.unwrap();
        assert_eq!(a, b);
        assert!((a.input_per_1k - 0.010).abs() / 0.010 <= 0.02 + 1e-9);
        assert!(a.input_per_1k > 0.0);
    }

    #[tokio::test]
    async fn mock_override_shifts_prices() {
        let mock = MockPricingSource::new("mock").without_jitter();
        mock.set_pricing(
            "test-model",
            ProviderPricing {
                input_per_1k: 0.015,
                output_per_1k: 0.030,
            },
        );
        let p = mock.fetch_model_pricing("test-model").await.unwrap();
        assert!((p.input_per_1k - 0.015).abs() < 1e-12);
    }

    #[tokio::test]
    async fn retries_recover_from_transient_failures() {
        tokio::time::pause();
        let mock = MockPricingSource::new("mock").without_jitter();
        mock.fail_next(PricingApiError::Timeout);
        mock.fail_next(PricingApiError::Http("connection reset".into()));

        let handle = tokio::spawn(async move {
            fetch_all_with_retries(&mock, 3, Duration::from_millis(10)).await
        });
        let result = handle.await.unwrap();
        assert_eq!(result.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn retries_exhaust_to_unavailable() {
        tokio::time::pause();
        let mock = MockPricingSource::new("mock");
        for _ in 0..3 {
            mock.fail_next(PricingApiError::Timeout);
        }
        let err = fetch_all_with_retries(&mock, 3, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PricingApiError::Unavailable(_)));
    }

    #[tokio::test]
    async fn non_transient_error_fails_fast() {
        let mock = MockPricingSource::new("mock");
        mock.fail_next(PricingApiError::Parse("bad json".into()));
        let err = fetch_all_with_retries(&mock, 5, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PricingApiError::Parse(_)));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, 10), MAX_RETRY_DELAY);
    }

    #[test]
    fn transient_classification() {
        assert!(PricingApiError::Timeout.is_transient());
        assert!(PricingApiError::Http("reset".into()).is_transient());
        assert!(PricingApiError::RateLimited {
            retry_after_secs: Some(5)
        }
        .is_transient());
        assert!(PricingApiError::Api {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!PricingApiError::Api {
            status: 404,
            message: String::new()
        }
        .is_transient());
        assert!(!PricingApiError::Parse("x".into()).is_transient());
    }

    #[test]
    fn provider_names() {
        assert_eq!(
            OpenAiPricingApi::new("k", Duration::from_secs(10)).provider_name(),
            "openai"
        );
        assert_eq!(
            AnthropicPricingApi::new("k", Duration::from_secs(10)).provider_name(),
            "anthropic"
        );
        assert_eq!(
            GooglePricingApi::new("k", Duration::from_secs(10)).provider_name(),
            "google"
        );
    }

    #[test]
    fn price_tables_are_positive() {
        for p in OpenAiPricingApi::price_table()
            .values()
            .chain(AnthropicPricingApi::price_table().values())
            .chain(GooglePricingApi::price_table().values())
        {
            assert!(p.input_per_1k > 0.0);
            assert!(p.output_per_1k > 0.0);
        }
    }
}
