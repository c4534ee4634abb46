use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::entities::order::OrderSide;
use crate::domain::errors::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Long,
    Short,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Long => "LONG",
            TradeSide::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "LONG" => Ok(TradeSide::Long),
            "SHORT" => Ok(TradeSide::Short),
            other => Err(ValidationError::InvalidTradeSide(other.to_string())),
        }
    }

    /// The order side that closes a position on this side
    pub fn closing_order_side(&self) -> OrderSide {
        match self {
            TradeSide::Long => OrderSide::Sell,
            TradeSide::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a trade was exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    MaxHoldTime,
    Manual,
    Signal,
    KillSwitch,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::MaxHoldTime => "MAX_HOLD_TIME",
            ExitReason::Manual => "MANUAL",
            ExitReason::Signal => "SIGNAL",
            ExitReason::KillSwitch => "KILL_SWITCH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STOP_LOSS" => Some(ExitReason::StopLoss),
            "TAKE_PROFIT" => Some(ExitReason::TakeProfit),
            "MAX_HOLD_TIME" => Some(ExitReason::MaxHoldTime),
            "MANUAL" => Some(ExitReason::Manual),
            "SIGNAL" => Some(ExitReason::Signal),
            "KILL_SWITCH" => Some(ExitReason::KillSwitch),
            _ => None,
        }
    }
}

/// A realised or open position
#[derive(Debug, Clone)]
pub struct Trade {
    pub id: String,
    pub entry_order_id: String,
    pub exit_order_id: Option<String>,
    pub strategy_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub pnl: Option<Decimal>,
    pub pnl_percent: Option<Decimal>,
    pub fees_total: Decimal,
    pub hold_duration_secs: Option<i64>,
    pub exit_reason: Option<ExitReason>,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        self.exit_time.is_none()
    }

    /// P&L against `price`: the exit price for closed trades, a mark price
    /// for open ones.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        match self.side {
            TradeSide::Long => (price - self.entry_price) * self.quantity - self.fees_total,
            TradeSide::Short => (self.entry_price - price) * self.quantity - self.fees_total,
        }
    }
}

/// P&L for a closed position. LONG profits when exit > entry; SHORT reversed.
pub fn realized_pnl(
    side: TradeSide,
    entry_price: Decimal,
    exit_price: Decimal,
    quantity: Decimal,
    total_fees: Decimal,
) -> (Decimal, Decimal) {
    let pnl = match side {
        TradeSide::Long => (exit_price - entry_price) * quantity - total_fees,
        TradeSide::Short => (entry_price - exit_price) * quantity - total_fees,
    };
    // entry_price * quantity is non-zero: entries pass the position-size gate
    let pnl_percent = pnl / (entry_price * quantity) * Decimal::from(100);
    (pnl, pnl_percent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_long_pnl() {
        let (pnl, pnl_percent) =
            realized_pnl(TradeSide::Long, dec!(100), dec!(110), dec!(2), dec!(1));
        assert_eq!(pnl, dec!(19));
        assert_eq!(pnl_percent, dec!(9.5));
    }

    #[test]
    fn test_short_pnl_reversed() {
        let (pnl, _) = realized_pnl(TradeSide::Short, dec!(100), dec!(110), dec!(2), dec!(0));
        assert_eq!(pnl, dec!(-20));
    }

    #[test]
    fn test_flat_exit_with_zero_fees_is_exactly_zero() {
        let (pnl, pnl_percent) = realized_pnl(
            TradeSide::Long,
            dec!(43000.12345678),
            dec!(43000.12345678),
            dec!(0.00232558),
            Decimal::ZERO,
        );
        assert_eq!(pnl, Decimal::ZERO);
        assert_eq!(pnl_percent, Decimal::ZERO);
    }

    #[test]
    fn test_closing_order_side() {
        assert_eq!(TradeSide::Long.closing_order_side(), OrderSide::Sell);
        assert_eq!(TradeSide::Short.closing_order_side(), OrderSide::Buy);
    }

    #[test]
    fn test_open_trade_mark_pnl() {
        let trade = Trade {
            id: "t-1".to_string(),
            entry_order_id: "o-1".to_string(),
            exit_order_id: None,
            strategy_id: "s-1".to_string(),
            symbol: "BTC-USD".to_string(),
            side: TradeSide::Long,
            entry_price: dec!(50000),
            quantity: dec!(0.1),
            entry_time: Utc::now(),
            exit_price: None,
            exit_time: None,
            pnl: None,
            pnl_percent: None,
            fees_total: dec!(5),
            hold_duration_secs: None,
            exit_reason: None,
        };
        assert!(trade.is_open());
        assert_eq!(trade.pnl_at(dec!(51000)), dec!(95));
    }

    #[test]
    fn test_exit_reason_round_trip() {
        assert_eq!(
            ExitReason::parse("MAX_HOLD_TIME"),
            Some(ExitReason::MaxHoldTime)
        );
        assert_eq!(ExitReason::parse("WHATEVER"), None);
        assert_eq!(ExitReason::Signal.as_str(), "SIGNAL");
    }
}
