//! Database Models
//!
//! Row records for every table. Decimal columns are stored as canonical
//! fixed-point strings; the typed accessors parse them back and surface a
//! `Corrupt` error instead of silently defaulting.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

use super::DatabaseError;
use crate::domain::entities::trade::{ExitReason, Trade, TradeSide};

pub(crate) fn parse_decimal(field: &str, value: &str) -> Result<Decimal, DatabaseError> {
    Decimal::from_str(value)
        .map_err(|e| DatabaseError::Corrupt(format!("{}='{}': {}", field, value, e)))
}

fn parse_decimal_opt(field: &str, value: &Option<String>) -> Result<Option<Decimal>, DatabaseError> {
    value.as_deref().map(|v| parse_decimal(field, v)).transpose()
}

/// Order row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderRecord {
    pub id: String,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub exchange_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub order_type: String,
    pub quantity: String,
    pub price: Option<String>,
    pub stop_loss_price: Option<String>,
    pub status: String,
    pub filled_quantity: String,
    pub average_fill_price: Option<String>,
    pub fees: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl OrderRecord {
    pub fn quantity(&self) -> Result<Decimal, DatabaseError> {
        parse_decimal("orders.quantity", &self.quantity)
    }

    pub fn price(&self) -> Result<Option<Decimal>, DatabaseError> {
        parse_decimal_opt("orders.price", &self.price)
    }

    pub fn stop_loss_price(&self) -> Result<Option<Decimal>, DatabaseError> {
        parse_decimal_opt("orders.stop_loss_price", &self.stop_loss_price)
    }

    pub fn filled_quantity(&self) -> Result<Decimal, DatabaseError> {
        parse_decimal("orders.filled_quantity", &self.filled_quantity)
    }

    pub fn average_fill_price(&self) -> Result<Option<Decimal>, DatabaseError> {
        parse_decimal_opt("orders.average_fill_price", &self.average_fill_price)
    }

    pub fn fees(&self) -> Result<Decimal, DatabaseError> {
        parse_decimal("orders.fees", &self.fees)
    }
}

/// Trade row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRecord {
    pub id: String,
    pub entry_order_id: String,
    pub exit_order_id: Option<String>,
    pub strategy_id: String,
    pub symbol: String,
    pub side: String,
    pub entry_price: String,
    pub quantity: String,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<String>,
    pub exit_time: Option<DateTime<Utc>>,
    pub pnl: Option<String>,
    pub pnl_percent: Option<String>,
    pub fees_total: String,
    pub hold_duration_secs: Option<i64>,
    pub exit_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TradeRecord {
    pub fn entry_price(&self) -> Result<Decimal, DatabaseError> {
        parse_decimal("trades.entry_price", &self.entry_price)
    }

    pub fn quantity(&self) -> Result<Decimal, DatabaseError> {
        parse_decimal("trades.quantity", &self.quantity)
    }

    pub fn pnl(&self) -> Result<Option<Decimal>, DatabaseError> {
        parse_decimal_opt("trades.pnl", &self.pnl)
    }

    pub fn fees_total(&self) -> Result<Decimal, DatabaseError> {
        parse_decimal("trades.fees_total", &self.fees_total)
    }

    /// Convert to the domain entity
    pub fn to_entity(&self) -> Result<Trade, DatabaseError> {
        Ok(Trade {
            id: self.id.clone(),
            entry_order_id: self.entry_order_id.clone(),
            exit_order_id: self.exit_order_id.clone(),
            strategy_id: self.strategy_id.clone(),
            symbol: self.symbol.clone(),
            side: TradeSide::parse(&self.side)
                .map_err(|e| DatabaseError::Corrupt(e.to_string()))?,
            entry_price: self.entry_price()?,
            quantity: self.quantity()?,
            entry_time: self.entry_time,
            exit_price: parse_decimal_opt("trades.exit_price", &self.exit_price)?,
            exit_time: self.exit_time,
            pnl: self.pnl()?,
            pnl_percent: parse_decimal_opt("trades.pnl_percent", &self.pnl_percent)?,
            fees_total: self.fees_total()?,
            hold_duration_secs: self.hold_duration_secs,
            exit_reason: self.exit_reason.as_deref().and_then(ExitReason::parse),
        })
    }
}

/// Candle row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CandleRecord {
    pub time: DateTime<Utc>,
    pub exchange: String,
    pub symbol: String,
    pub interval: String,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
}

impl CandleRecord {
    pub fn open(&self) -> Result<Decimal, DatabaseError> {
        parse_decimal("price_data.open", &self.open)
    }

    pub fn high(&self) -> Result<Decimal, DatabaseError> {
        parse_decimal("price_data.high", &self.high)
    }

    pub fn low(&self) -> Result<Decimal, DatabaseError> {
        parse_decimal("price_data.low", &self.low)
    }

    pub fn close(&self) -> Result<Decimal, DatabaseError> {
        parse_decimal("price_data.close", &self.close)
    }

    pub fn volume(&self) -> Result<Decimal, DatabaseError> {
        parse_decimal("price_data.volume", &self.volume)
    }
}

/// Balance row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BalanceRecord {
    pub exchange: String,
    pub currency: String,
    pub available: String,
    pub locked: String,
    pub total: String,
    pub updated_at: DateTime<Utc>,
}

impl BalanceRecord {
    pub fn available(&self) -> Result<Decimal, DatabaseError> {
        parse_decimal("balances.available", &self.available)
    }

    pub fn locked(&self) -> Result<Decimal, DatabaseError> {
        parse_decimal("balances.locked", &self.locked)
    }

    pub fn total(&self) -> Result<Decimal, DatabaseError> {
        parse_decimal("balances.total", &self.total)
    }
}

/// Risk event row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RiskEventRecord {
    pub id: i64,
    pub strategy_id: Option<String>,
    pub event_type: String,
    pub description: String,
    pub action_taken: String,
    pub metadata: String,
    pub timestamp: DateTime<Utc>,
}

/// System config row (keyed JSON blob)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SystemConfigRecord {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Canonical kill-switch record stored under `system_config.kill_switch`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KillSwitchRecord {
    pub enabled: bool,
    pub reason: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Default for KillSwitchRecord {
    fn default() -> Self {
        KillSwitchRecord {
            enabled: false,
            reason: None,
            timestamp: None,
        }
    }
}
