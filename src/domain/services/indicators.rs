//! Technical Indicators
//!
//! Windowed indicators over chronological close prices. All price arithmetic
//! uses `Decimal`; `f64` appears only inside the RSI ratio and the standard
//! deviation square root and is never returned as a money value.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

/// Arithmetic mean of the last `period` prices. Zero when underfull.
pub fn sma(prices: &[Decimal], period: usize) -> Decimal {
    if period == 0 || prices.len() < period {
        return Decimal::ZERO;
    }

    let sum: Decimal = prices[prices.len() - period..].iter().sum();
    sum / Decimal::from(period as u64)
}

/// Exponential moving average seeded with the SMA of the first `period`
/// prices. Zero when underfull.
pub fn ema(prices: &[Decimal], period: usize) -> Decimal {
    if period == 0 || prices.len() < period {
        return Decimal::ZERO;
    }

    let mut value = sma(&prices[..period], period);
    let multiplier = Decimal::from(2) / Decimal::from(period as u64 + 1);

    for price in &prices[period..] {
        value = (*price - value) * multiplier + value;
    }

    value
}

/// Relative Strength Index over the last `period` intervals.
///
/// Returns a neutral 50 when fewer than `period + 1` prices are available and
/// 100 when there are no losses in the window.
pub fn rsi(prices: &[Decimal], period: usize) -> f64 {
    if period == 0 || prices.len() < period + 1 {
        return 50.0;
    }

    let mut gains = Decimal::ZERO;
    let mut losses = Decimal::ZERO;

    for i in prices.len() - period..prices.len() {
        let change = prices[i] - prices[i - 1];
        if change > Decimal::ZERO {
            gains += change;
        } else {
            losses += change.abs();
        }
    }

    if losses.is_zero() {
        return 100.0;
    }

    let avg_gain = gains / Decimal::from(period as u64);
    let avg_loss = losses / Decimal::from(period as u64);
    let rs = (avg_gain / avg_loss).to_f64().unwrap_or(0.0);

    100.0 - 100.0 / (1.0 + rs)
}

/// Bollinger bands: `(upper, middle, lower)` where the middle band is the
/// SMA and the envelope is `multiplier` population standard deviations wide.
pub fn bollinger_bands(
    prices: &[Decimal],
    period: usize,
    multiplier: f64,
) -> (Decimal, Decimal, Decimal) {
    if period == 0 || prices.len() < period {
        return (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO);
    }

    let middle = sma(prices, period);
    let band = Decimal::from_f64(std_dev(prices, period) * multiplier).unwrap_or(Decimal::ZERO);

    (middle + band, middle, middle - band)
}

/// Population standard deviation (divisor `period`) of the last `period`
/// prices
pub fn std_dev(prices: &[Decimal], period: usize) -> f64 {
    if period == 0 || prices.len() < period {
        return 0.0;
    }

    let window = &prices[prices.len() - period..];
    let mean = sma(window, period).to_f64().unwrap_or(0.0);

    let variance = window
        .iter()
        .map(|p| {
            let diff = p.to_f64().unwrap_or(0.0) - mean;
            diff * diff
        })
        .sum::<f64>()
        / period as f64;

    variance.sqrt()
}
