use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::errors::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(ValidationError::InvalidOrderSide(other.to_string())),
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "MARKET" => Ok(OrderType::Market),
            "LIMIT" => Ok(OrderType::Limit),
            other => Err(ValidationError::InvalidOrderType(other.to_string())),
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order status. Transitions are append-only: a terminal order never reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Open => "OPEN",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
        }
    }

    /// Map an exchange status string; unknown statuses map to FAILED
    pub fn from_exchange(s: &str) -> Self {
        match s {
            "PENDING" => OrderStatus::Pending,
            "OPEN" => OrderStatus::Open,
            "FILLED" => OrderStatus::Filled,
            "CANCELLED" => OrderStatus::Cancelled,
            "FAILED" => OrderStatus::Failed,
            _ => OrderStatus::Failed,
        }
    }

    /// Whether a transition from `self` to `next` is legal; FILLED,
    /// CANCELLED, and FAILED are terminal
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        match self {
            OrderStatus::Pending => matches!(
                next,
                OrderStatus::Open
                    | OrderStatus::Filled
                    | OrderStatus::Cancelled
                    | OrderStatus::Failed
            ),
            OrderStatus::Open => matches!(next, OrderStatus::Filled | OrderStatus::Cancelled),
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single intended or outstanding exchange action
#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub exchange_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub average_fill_price: Option<Decimal>,
    pub fees: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        client_order_id: String,
        exchange_id: String,
        strategy_id: String,
        symbol: String,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
        stop_loss_price: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if quantity <= Decimal::ZERO {
            return Err(ValidationError::InvalidQuantity(quantity.to_string()));
        }
        if order_type == OrderType::Limit && price.is_none() {
            return Err(ValidationError::LimitOrderWithoutPrice);
        }

        Ok(Order {
            id,
            client_order_id,
            exchange_order_id: None,
            exchange_id,
            strategy_id,
            symbol,
            side,
            order_type,
            quantity,
            price,
            stop_loss_price,
            status: OrderStatus::Pending,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            fees: Decimal::ZERO,
            created_at: now,
            updated_at: now,
            filled_at: None,
        })
    }
}
