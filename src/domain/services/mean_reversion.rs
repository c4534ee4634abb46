//! Mean-Reversion Strategy
//!
//! Maintains a bounded buffer of recent close prices for one symbol and
//! evaluates the mean-reversion rule on every tick. The decision function is
//! pure: identical buffers and an identical current price always produce the
//! same decision, which keeps replay-based tests deterministic.

use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use crate::domain::services::indicators::{bollinger_bands, rsi, sma};

/// Strategy parameters. Defaults mirror the shipped configuration.
#[derive(Debug, Clone)]
pub struct MeanReversionParams {
    pub sma_period: usize,
    pub rsi_period: usize,
    pub bb_period: usize,
    pub bb_std_dev: f64,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    /// Target notional per entry, in quote currency
    pub max_position_size_usd: Decimal,
    /// Stop-loss distance below the entry, in percent
    pub stop_loss_percent: Decimal,
    pub max_history: usize,
}

impl Default for MeanReversionParams {
    fn default() -> Self {
        MeanReversionParams {
            sma_period: 20,
            rsi_period: 14,
            bb_period: 20,
            bb_std_dev: 2.0,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            max_position_size_usd: Decimal::from(100),
            stop_loss_percent: Decimal::new(2, 0),
            max_history: 100,
        }
    }
}

/// Indicator snapshot attached to every decision
#[derive(Debug, Clone)]
pub struct IndicatorSnapshot {
    pub price: Decimal,
    pub sma: Decimal,
    pub rsi: f64,
    pub upper_bb: Decimal,
    pub lower_bb: Decimal,
}

impl IndicatorSnapshot {
    /// Flatten into the wire form carried on signal payloads
    pub fn to_map(&self) -> HashMap<String, f64> {
        use rust_decimal::prelude::ToPrimitive;
        let mut map = HashMap::new();
        map.insert("price".to_string(), self.price.to_f64().unwrap_or(0.0));
        map.insert("sma".to_string(), self.sma.to_f64().unwrap_or(0.0));
        map.insert("rsi".to_string(), self.rsi);
        map.insert("upper_bb".to_string(), self.upper_bb.to_f64().unwrap_or(0.0));
        map.insert("lower_bb".to_string(), self.lower_bb.to_f64().unwrap_or(0.0));
        map.insert("volume".to_string(), 0.0);
        map
    }
}

/// A decision produced by the strategy for the current tick
#[derive(Debug, Clone)]
pub enum Decision {
    /// Open a LONG position at market
    EnterLong {
        quantity: Decimal,
        stop_loss_price: Decimal,
        reason: String,
        indicators: IndicatorSnapshot,
    },
    /// Close the open LONG position at market
    ExitLong {
        reason: String,
        indicators: IndicatorSnapshot,
    },
}

/// Per-symbol mean-reversion engine over a rolling close-price buffer
pub struct MeanReversionStrategy {
    params: MeanReversionParams,
    prices: VecDeque<Decimal>,
}

impl MeanReversionStrategy {
    pub fn new(params: MeanReversionParams) -> Self {
        let capacity = params.max_history;
        MeanReversionStrategy {
            params,
            prices: VecDeque::with_capacity(capacity),
        }
    }

    /// Replace the buffer with historical closes in chronological order
    pub fn preload(&mut self, prices: Vec<Decimal>) {
        self.prices = prices.into_iter().collect();
        while self.prices.len() > self.params.max_history {
            self.prices.pop_front();
        }
        info!(count = self.prices.len(), "Preloaded price history");
    }

    pub fn history_len(&self) -> usize {
        self.prices.len()
    }

    pub fn params(&self) -> &MeanReversionParams {
        &self.params
    }

    /// Feed one tick and evaluate the rule.
    ///
    /// `has_open_position` selects between the entry and exit branches; the
    /// caller owns position state.
    pub fn on_price(&mut self, price: Decimal, has_open_position: bool) -> Option<Decision> {
        self.prices.push_back(price);
        while self.prices.len() > self.params.max_history {
            self.prices.pop_front();
        }

        if self.prices.len() < self.params.bb_period {
            debug!(len = self.prices.len(), "Not enough price history yet");
            return None;
        }

        let prices = self.prices.make_contiguous();
        let sma_value = sma(prices, self.params.sma_period);
        let rsi_value = rsi(prices, self.params.rsi_period);
        let (upper_bb, _, lower_bb) =
            bollinger_bands(prices, self.params.bb_period, self.params.bb_std_dev);

        let indicators = IndicatorSnapshot {
            price,
            sma: sma_value,
            rsi: rsi_value,
            upper_bb,
            lower_bb,
        };

        if has_open_position {
            // Exit: price crossed back above the mean. Stop-loss and
            // max-hold exits belong to the risk gate.
            if price > sma_value {
                return Some(Decision::ExitLong {
                    reason: "Price crossed SMA".to_string(),
                    indicators,
                });
            }
            return None;
        }

        if rsi_value < self.params.rsi_oversold && price < lower_bb {
            // Quantity at 8 decimal places, truncated so the notional never
            // exceeds the configured cap
            let quantity = (self.params.max_position_size_usd / price)
                .round_dp_with_strategy(8, RoundingStrategy::ToZero);
            let stop_loss_price = price
                * (Decimal::ONE - self.params.stop_loss_percent / Decimal::from(100));
            let reason = format!(
                "Mean reversion LONG: RSI={:.2} (< {:.0}), Price={} < LowerBB={}",
                rsi_value, self.params.rsi_oversold, price, lower_bb
            );
            return Some(Decision::EnterLong {
                quantity,
                stop_loss_price,
                reason,
                indicators,
            });
        }

        if rsi_value > self.params.rsi_overbought && price > upper_bb {
            // Spot trading only: no SHORT entries
            info!(
                rsi = rsi_value,
                %price,
                %upper_bb,
                "SHORT signal detected (skipping - spot trading only)"
            );
        }

        None
    }
}
