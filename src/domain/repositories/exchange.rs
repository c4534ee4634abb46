//! Exchange Interface
//!
//! Common contract for every exchange connector. The engine core only ever
//! talks to this trait, so the simulated paper exchange and any live
//! connector are interchangeable, and tests substitute a mock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::entities::order::{OrderSide, OrderStatus, OrderType};

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[derive(Debug, Error, Clone)]
pub enum ExchangeError {
    #[error("Order placement failed: {0}")]
    OrderPlacementFailed(String),

    #[error("Order cancellation failed: {0}")]
    OrderCancellationFailed(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Balance query failed: {0}")]
    BalanceQueryFailed(String),

    #[error("No price available for symbol {0}")]
    NoPriceAvailable(String),

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
}

/// Request to place an order
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Limit price, for limit orders
    pub price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
}

/// Response from placing or querying an order
#[derive(Debug, Clone)]
pub struct OrderResponse {
    pub id: String,
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub average_fill_price: Option<Decimal>,
    pub fees: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Account balance for one currency
#[derive(Debug, Clone)]
pub struct Balance {
    pub currency: String,
    pub available: Decimal,
    pub locked: Decimal,
    pub total: Decimal,
}

/// A real-time price tick
#[derive(Debug, Clone)]
pub struct PriceUpdate {
    pub exchange: String,
    pub symbol: String,
    pub price: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Exchange connector contract
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Exchange name as recorded on candles and orders
    fn name(&self) -> &str;

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderResponse>;

    async fn cancel_order(&self, exchange_order_id: &str) -> ExchangeResult<()>;

    async fn get_order(&self, exchange_order_id: &str) -> ExchangeResult<OrderResponse>;

    async fn get_balances(&self) -> ExchangeResult<HashMap<String, Balance>>;

    async fn get_price(&self, symbol: &str) -> ExchangeResult<Decimal>;

    /// Subscribe to price ticks for `symbols`; updates are delivered through
    /// `tx`, one channel per subscriber, in arrival order.
    async fn subscribe_price_updates(
        &self,
        symbols: &[String],
        tx: mpsc::Sender<PriceUpdate>,
    ) -> ExchangeResult<()>;

    async fn close(&self) -> ExchangeResult<()>;
}
