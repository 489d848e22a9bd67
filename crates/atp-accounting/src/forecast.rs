//! Predictive cost forecasting over the recorded spend history.
//!
//! Two models: an ordinary least-squares linear trend with normal-theory
//! confidence bands, and Holt's double exponential smoothing for histories
//! where the recent trend matters more than the whole window. Token usage
//! gets a linear forecast, and cost-per-token a trend direction.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use atp_core::{Clock, RouterError};

/// Forecasts need at least this many observations.
const MIN_DATA_POINTS: usize = 10;

/// History older than this ages out.
const RETENTION_DAYS: i64 = 30;

/// z-value for the 95 % confidence band.
const Z_95: f64 = 1.96;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastModel {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub hour: u32,
    pub predicted_cost: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostForecast {
    pub model: ForecastModel,
    pub points: Vec<ForecastPoint>,
    pub total_forecast_cost: f64,
    /// Hourly growth in USD fitted over the history.
    pub growth_per_hour: f64,
    pub r_squared: f64,
    pub data_points_used: usize,
    pub horizon_hours: u32,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageForecast {
    pub total_forecast_tokens: u64,
    pub hourly_forecast_tokens: Vec<u64>,
    pub growth_rate_tokens_per_hour: f64,
    pub r_squared: f64,
    pub horizon_hours: u32,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostPerTokenTrend {
    pub current_cost_per_token: f64,
    /// Change in cost-per-token per hour.
    pub trend_slope: f64,
    pub direction: TrendDirection,
    pub r_squared: f64,
    pub data_points: usize,
}

// ---------------------------------------------------------------------------
// CostForecaster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct HistoryPoint {
    timestamp: DateTime<Utc>,
    cost_usd: f64,
    tokens: u64,
}

pub struct CostForecaster {
    history: Mutex<VecDeque<HistoryPoint>>,
    clock: Arc<dyn Clock>,
}

impl CostForecaster {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            history: Mutex::new(VecDeque::new()),
            clock,
        }
    }

    /// Add a data point and age out anything past the retention window.
    pub fn add_point(&self, cost_usd: f64, tokens: u64) {
        let now = self.clock.now();
        let cutoff = now - Duration::days(RETENTION_DAYS);
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(HistoryPoint {
            timestamp: now,
            cost_usd,
            tokens,
        });
        while history.front().map_or(false, |p| p.timestamp < cutoff) {
            history.pop_front();
        }
    }

    pub fn data_points(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Forecast hourly cost over `horizon_hours`.
    pub fn forecast_cost(
        &self,
        horizon_hours: u32,
        model: ForecastModel,
    ) -> Result<CostForecast, RouterError> {
        let now = self.clock.now();
        let (hours, costs) = self.series(now, |p| p.cost_usd)?;

        let forecast = match model {
            ForecastModel::Linear => linear_forecast(&hours, &costs, horizon_hours),
            ForecastModel::Exponential => holt_forecast(&costs, horizon_hours),
        };

        let total_forecast_cost = forecast.points.iter().map(|p| p.predicted_cost).sum();
        Ok(CostForecast {
            model,
            total_forecast_cost,
            data_points_used: costs.len(),
            horizon_hours,
            generated_at: now,
            ..forecast
        })
    }

    /// Forecast token usage over `horizon_hours` with a linear trend.
    pub fn usage_forecast(&self, horizon_hours: u32) -> Result<UsageForecast, RouterError> {
        let now = self.clock.now();
        let (hours, tokens) = self.series(now, |p| p.tokens as f64)?;

        let fit = linear_fit(&hours, &tokens);
        let hourly: Vec<u64> = (1..=horizon_hours)
            .map(|h| (fit.slope * h as f64 + fit.intercept).max(0.0) as u64)
            .collect();

        Ok(UsageForecast {
            total_forecast_tokens: hourly.iter().sum(),
            hourly_forecast_tokens: hourly,
            growth_rate_tokens_per_hour: fit.slope,
            r_squared: fit.r_squared,
            horizon_hours,
            generated_at: now,
        })
    }

    /// Direction and strength of the cost-per-token trend.
    pub fn cost_per_token_trend(&self) -> Result<CostPerTokenTrend, RouterError> {
        let now = self.clock.now();
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let aligned: Vec<(f64, f64)> = history
            .iter()
            .filter(|p| p.tokens > 0)
            .map(|p| {
                (
                    (p.timestamp - now).num_seconds() as f64 / 3600.0,
                    p.cost_usd / p.tokens as f64,
                )
            })
            .collect();
        drop(history);

        if aligned.len() < MIN_DATA_POINTS {
            return Err(RouterError::Internal(format!(
                "insufficient data for trend analysis: {} of {MIN_DATA_POINTS}",
                aligned.len()
            )));
        }

        let hours: Vec<f64> = aligned.iter().map(|(h, _)| *h).collect();
        let values: Vec<f64> = aligned.iter().map(|(_, v)| *v).collect();
        let fit = linear_fit(&hours, &values);

        let direction = if fit.slope > 1e-12 {
            TrendDirection::Increasing
        } else if fit.slope < -1e-12 {
            TrendDirection::Decreasing
        } else {
            TrendDirection::Stable
        };

        Ok(CostPerTokenTrend {
            current_cost_per_token: *values.last().unwrap_or(&0.0),
            trend_slope: fit.slope,
            direction,
            r_squared: fit.r_squared,
            data_points: aligned.len(),
        })
    }

    fn series(
        &self,
        now: DateTime<Utc>,
        field: impl Fn(&HistoryPoint) -> f64,
    ) -> Result<(Vec<f64>, Vec<f64>), RouterError> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() < MIN_DATA_POINTS {
            return Err(RouterError::Internal(format!(
                "insufficient data for forecasting: {} of {MIN_DATA_POINTS}",
                history.len()
            )));
        }
        let hours: Vec<f64> = history
            .iter()
            .map(|p| (p.timestamp - now).num_seconds() as f64 / 3600.0)
            .collect();
        let values: Vec<f64> = history.iter().map(field).collect();
        Ok((hours, values))
    }
}

// ---------------------------------------------------------------------------
// Fitting
// ---------------------------------------------------------------------------

struct LinearFit {
    slope: f64,
    intercept: f64,
    r_squared: f64,
    residual_std: f64,
}

fn linear_fit(xs: &[f64], ys: &[f64]) -> LinearFit {
    let n = xs.len() as f64;
    let x_mean = xs.iter().sum::<f64>() / n;
    let y_mean = ys.iter().sum::<f64>() / n;

    let mut ss_xy = 0.0;
    let mut ss_xx = 0.0;
    let mut ss_yy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        ss_xy += (x - x_mean) * (y - y_mean);
        ss_xx += (x - x_mean) * (x - x_mean);
        ss_yy += (y - y_mean) * (y - y_mean);
    }

    let slope = if ss_xx > 0.0 { ss_xy / ss_xx } else { 0.0 };
    let intercept = y_mean - slope * x_mean;
    let r_squared = if ss_xx > 0.0 && ss_yy > 0.0 {
        (ss_xy * ss_xy) / (ss_xx * ss_yy)
    } else {
        0.0
    };

    let residual_ss: f64 = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| {
            let predicted = slope * x + intercept;
            (y - predicted) * (y - predicted)
        })
        .sum();
    let residual_std = if xs.len() > 2 {
        (residual_ss / (n - 2.0)).sqrt()
    } else {
        0.0
    };

    LinearFit {
        slope,
        intercept,
        r_squared,
        residual_std,
    }
}

fn linear_forecast(hours: &[f64], costs: &[f64], horizon_hours: u32) -> CostForecast {
    let fit = linear_fit(hours, costs);
    let margin = Z_95 * fit.residual_std;

    let points: Vec<ForecastPoint> = (1..=horizon_hours)
        .map(|h| {
            let predicted = (fit.slope * h as f64 + fit.intercept).max(0.0);
            ForecastPoint {
                hour: h,
                predicted_cost: predicted,
                lower_bound: (predicted - margin).max(0.0),
                upper_bound: predicted + margin,
            }
        })
        .collect();

    CostForecast {
        model: ForecastModel::Linear,
        points,
        total_forecast_cost: 0.0,
        growth_per_hour: fit.slope,
        r_squared: fit.r_squared,
        data_points_used: 0,
        horizon_hours,
        generated_at: Utc::now(),
    }
}

/// Holt's double exponential smoothing: level + trend, flat extrapolation of
/// the smoothed trend.
fn holt_forecast(costs: &[f64], horizon_hours: u32) -> CostForecast {
    const ALPHA: f64 = 0.3;
    const BETA: f64 = 0.1;

    let mut level = costs[0];
    let mut trend = if costs.len() > 1 { costs[1] - costs[0] } else { 0.0 };
    for value in &costs[1..] {
        let prev_level = level;
        level = ALPHA * value + (1.0 - ALPHA) * (level + trend);
        trend = BETA * (level - prev_level) + (1.0 - BETA) * trend;
    }

    // Band width from the smoothing residuals.
    let mut l = costs[0];
    let mut t = if costs.len() > 1 { costs[1] - costs[0] } else { 0.0 };
    let mut residual_ss = 0.0;
    for value in &costs[1..] {
        let predicted = l + t;
        residual_ss += (value - predicted) * (value - predicted);
        let prev = l;
        l = ALPHA * value + (1.0 - ALPHA) * (l + t);
        t = BETA * (l - prev) + (1.0 - BETA) * t;
    }
    let residual_std = if costs.len() > 2 {
        (residual_ss / (costs.len() - 2) as f64).sqrt()
    } else {
        0.0
    };
    let margin = Z_95 * residual_std;

    let points: Vec<ForecastPoint> = (1..=horizon_hours)
        .map(|h| {
            let predicted = (level + trend * h as f64).max(0.0);
            ForecastPoint {
                hour: h,
                predicted_cost: predicted,
                lower_bound: (predicted - margin).max(0.0),
                upper_bound: predicted + margin,
            }
        })
        .collect();

    CostForecast {
        model: ForecastModel::Exponential,
        points,
        total_forecast_cost: 0.0,
        growth_per_hour: trend,
        r_squared: 0.0,
        data_points_used: 0,
        horizon_hours,
        generated_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
