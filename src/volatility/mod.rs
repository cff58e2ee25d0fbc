use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;
use tracing::debug;

use crate::api::types::{OptionContract, OptionType};

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;
pub const DEFAULT_RISK_FREE_RATE: f64 = 0.05;

const DEFAULT_HV_WINDOW: usize = 20;
const IV_INITIAL_GUESS: f64 = 0.20;
const IV_TOLERANCE: f64 = 1e-6;
const IV_MAX_ITERATIONS: usize = 100;
const IV_SIGMA_FLOOR: f64 = 0.01;
const VEGA_EPSILON: f64 = 1e-8;
const IV_UPPER_BOUND_PCT: f64 = 500.0;

#[derive(Debug, Error)]
pub enum VolatilityError {
    #[error("insufficient data: need at least {required} prices, got {actual}")]
    InsufficientData { required: usize, actual: usize },
}

/// Pure numerical engine: historical volatility, Black-Scholes pricing and the
/// Newton–Raphson implied-volatility inversion. No I/O, no interior state.
pub struct VolatilityEngine {
    hv_window: usize,
    norm: Normal,
}

impl VolatilityEngine {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_HV_WINDOW)
    }

    pub fn with_window(hv_window: usize) -> Self {
        Self {
            hv_window,
            norm: Normal::new(0.0, 1.0).expect("unit normal is a valid distribution"),
        }
    }

    /// Annualized standard deviation of log returns over the trailing window,
    /// as a percentage. Population variance, 252 trading days.
    pub fn historical_volatility(&self, prices: &[f64]) -> Result<f64, VolatilityError> {
        self.historical_volatility_with_window(prices, self.hv_window)
    }

    pub fn historical_volatility_with_window(
        &self,
        prices: &[f64],
        window: usize,
    ) -> Result<f64, VolatilityError> {
        if prices.len() < window + 1 {
            return Err(VolatilityError::InsufficientData {
                required: window + 1,
                actual: prices.len(),
            });
        }

        let log_returns: Vec<f64> = prices.windows(2).map(|pair| (pair[1] / pair[0]).ln()).collect();
        let recent = &log_returns[log_returns.len() - window..];

        let mean = recent.iter().sum::<f64>() / window as f64;
        let variance = recent.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / window as f64;

        Ok(variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt() * 100.0)
    }

    pub fn black_scholes_call(&self, s: f64, k: f64, t: f64, r: f64, sigma: f64) -> f64 {
        if t <= 0.0 || sigma <= 0.0 {
            return 0.0;
        }
        let d1 = d1(s, k, t, r, sigma);
        let d2 = d1 - sigma * t.sqrt();
        s * self.norm.cdf(d1) - k * (-r * t).exp() * self.norm.cdf(d2)
    }

    pub fn black_scholes_put(&self, s: f64, k: f64, t: f64, r: f64, sigma: f64) -> f64 {
        if t <= 0.0 || sigma <= 0.0 {
            return 0.0;
        }
        let d1 = d1(s, k, t, r, sigma);
        let d2 = d1 - sigma * t.sqrt();
        k * (-r * t).exp() * self.norm.cdf(-d2) - s * self.norm.cdf(-d1)
    }

    /// Sensitivity of the option price to volatility. Identical for calls and
    /// puts; zero in the degenerate no-time-value cases.
    pub fn vega(&self, s: f64, k: f64, t: f64, r: f64, sigma: f64) -> f64 {
        if t <= 0.0 || sigma <= 0.0 {
            return 0.0;
        }
        let d1 = d1(s, k, t, r, sigma);
        s * t.sqrt() * (-0.5 * d1 * d1).exp() / (2.0 * std::f64::consts::PI).sqrt()
    }

    /// Newton–Raphson inversion of Black-Scholes, returned as a percentage.
    /// Returns the last estimate even without convergence; callers bound the
    /// result (see [`average_implied_volatility`](Self::average_implied_volatility)).
    pub fn implied_volatility(
        &self,
        market_price: f64,
        s: f64,
        k: f64,
        t: f64,
        r: f64,
        is_call: bool,
    ) -> f64 {
        if t <= 0.0 {
            return 0.0;
        }

        let mut sigma = IV_INITIAL_GUESS;
        for _ in 0..IV_MAX_ITERATIONS {
            let price = if is_call {
                self.black_scholes_call(s, k, t, r, sigma)
            } else {
                self.black_scholes_put(s, k, t, r, sigma)
            };
            let vega = self.vega(s, k, t, r, sigma);

            // A vanishing vega would blow up the update step.
            if vega.abs() < VEGA_EPSILON {
                break;
            }

            let diff = price - market_price;
            if diff.abs() < IV_TOLERANCE {
                return sigma * 100.0;
            }

            sigma -= diff / vega;
            if sigma <= 0.0 {
                sigma = IV_SIGMA_FLOOR;
            }
        }

        sigma * 100.0
    }

    /// Mean implied volatility across a chain, discarding non-finite and
    /// out-of-bound solves. `None` when no option produced a usable value.
    pub fn average_implied_volatility(
        &self,
        options: &[OptionContract],
        spot_price: f64,
        risk_free_rate: f64,
    ) -> Option<f64> {
        let mut ivs = Vec::new();
        for option in options {
            let t = option.expiration_days / 365.0;
            let iv = self.implied_volatility(
                option.price,
                spot_price,
                option.strike,
                t,
                risk_free_rate,
                option.option_type == OptionType::Call,
            );
            if iv.is_finite() && iv > 0.0 && iv < IV_UPPER_BOUND_PCT {
                ivs.push(iv);
            } else {
                debug!(symbol = %option.symbol, iv, "discarding out-of-bound implied volatility");
            }
        }

        if ivs.is_empty() {
            return None;
        }
        Some(ivs.iter().sum::<f64>() / ivs.len() as f64)
    }
}

impl Default for VolatilityEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn d1(s: f64, k: f64, t: f64, r: f64, sigma: f64) -> f64 {
    ((s / k).ln() + (r + sigma * sigma / 2.0) * t) / (sigma * t.sqrt())
}
