//! Paper Exchange
//!
//! Simulated exchange for paper trading. Market orders fill immediately at
//! the cached price plus slippage against the taker; fees follow the
//! taker/maker schedule. Prices are injected by the market-data feed (or a
//! test) via `update_price`, which also fans the tick out to subscribers.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::entities::order::{OrderSide, OrderStatus, OrderType};
use crate::domain::repositories::exchange::{
    Balance, Exchange, ExchangeError, ExchangeResult, OrderRequest, OrderResponse, PriceUpdate,
};

struct PaperState {
    balances: HashMap<String, Balance>,
    orders: HashMap<String, OrderResponse>,
    prices: HashMap<String, Decimal>,
    subscribers: Vec<mpsc::Sender<PriceUpdate>>,
}

pub struct PaperExchange {
    name: String,
    slippage_percent: Decimal,
    taker_fee_percent: Decimal,
    maker_fee_percent: Decimal,
    state: RwLock<PaperState>,
}

impl PaperExchange {
    pub fn new(name: &str, initial_balance: Decimal) -> Self {
        let mut balances = HashMap::new();
        balances.insert(
            "USD".to_string(),
            Balance {
                currency: "USD".to_string(),
                available: initial_balance,
                locked: Decimal::ZERO,
                total: initial_balance,
            },
        );

        PaperExchange {
            name: name.to_string(),
            // 0.05% slippage, 0.4% taker fee, 0.25% maker fee
            slippage_percent: Decimal::new(5, 2),
            taker_fee_percent: Decimal::new(4, 1),
            maker_fee_percent: Decimal::new(25, 2),
            state: RwLock::new(PaperState {
                balances,
                orders: HashMap::new(),
                prices: HashMap::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Inject a price and fan the tick out to subscribers
    pub fn update_price(&self, symbol: &str, price: Decimal, volume: Decimal) {
        let subscribers = {
            let mut state = self.state.write().unwrap();
            state.prices.insert(symbol.to_string(), price);
            state.subscribers.clone()
        };

        let update = PriceUpdate {
            exchange: self.name.clone(),
            symbol: symbol.to_string(),
            price,
            volume,
            timestamp: Utc::now(),
        };

        for tx in subscribers {
            if let Err(e) = tx.try_send(update.clone()) {
                warn!(symbol, "Dropped price update: {}", e);
            }
        }
    }

    fn execution_price(&self, price: Decimal, side: OrderSide, order_type: OrderType) -> Decimal {
        if order_type == OrderType::Limit {
            return price;
        }

        let slippage = price * self.slippage_percent / Decimal::from(100);
        match side {
            OrderSide::Buy => price + slippage,
            OrderSide::Sell => price - slippage,
        }
    }

    fn base_currency(symbol: &str) -> &str {
        symbol
            .split(['-', '/'])
            .next()
            .unwrap_or(symbol)
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderResponse> {
        let mut state = self.state.write().unwrap();

        let current_price = *state
            .prices
            .get(&request.symbol)
            .ok_or_else(|| ExchangeError::NoPriceAvailable(request.symbol.clone()))?;

        let execution_price = self.execution_price(current_price, request.side, request.order_type);
        let total_cost = execution_price * request.quantity;

        let fee_percent = if request.order_type == OrderType::Limit {
            self.maker_fee_percent
        } else {
            self.taker_fee_percent
        };
        let fees = total_cost * fee_percent / Decimal::from(100);

        let base = Self::base_currency(&request.symbol).to_string();

        match request.side {
            OrderSide::Buy => {
                let required = total_cost + fees;
                let usd = state
                    .balances
                    .get_mut("USD")
                    .ok_or_else(|| ExchangeError::BalanceQueryFailed("no USD balance".into()))?;
                if usd.available < required {
                    return Err(ExchangeError::InsufficientBalance(format!(
                        "need {}, have {}",
                        required, usd.available
                    )));
                }
                usd.available -= required;
                usd.total = usd.available + usd.locked;

                let asset = state.balances.entry(base.clone()).or_insert_with(|| Balance {
                    currency: base.clone(),
                    available: Decimal::ZERO,
                    locked: Decimal::ZERO,
                    total: Decimal::ZERO,
                });
                asset.available += request.quantity;
                asset.total = asset.available + asset.locked;
            }
            OrderSide::Sell => {
                let asset = state
                    .balances
                    .get_mut(&base)
                    .filter(|b| b.available >= request.quantity)
                    .ok_or_else(|| {
                        ExchangeError::InsufficientBalance(format!(
                            "insufficient {} balance",
                            base
                        ))
                    })?;
                asset.available -= request.quantity;
                asset.total = asset.available + asset.locked;

                let received = total_cost - fees;
                let usd = state
                    .balances
                    .get_mut("USD")
                    .ok_or_else(|| ExchangeError::BalanceQueryFailed("no USD balance".into()))?;
                usd.available += received;
                usd.total = usd.available + usd.locked;
            }
        }

        let order_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let order = OrderResponse {
            id: order_id.clone(),
            exchange_order_id: order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            // Paper orders fill immediately
            status: OrderStatus::Filled,
            quantity: request.quantity,
            filled_quantity: request.quantity,
            average_fill_price: Some(execution_price),
            fees,
            created_at: now,
            updated_at: now,
        };

        state.orders.insert(order_id.clone(), order.clone());

        info!(
            order_id = %order_id,
            symbol = %request.symbol,
            side = %request.side,
            quantity = %request.quantity,
            execution_price = %execution_price,
            fees = %fees,
            "Paper order executed"
        );

        Ok(order)
    }

    async fn cancel_order(&self, exchange_order_id: &str) -> ExchangeResult<()> {
        let mut state = self.state.write().unwrap();
        let order = state
            .orders
            .get_mut(exchange_order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(exchange_order_id.to_string()))?;

        if order.status == OrderStatus::Filled {
            return Err(ExchangeError::OrderCancellationFailed(
                "cannot cancel filled order".to_string(),
            ));
        }

        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn get_order(&self, exchange_order_id: &str) -> ExchangeResult<OrderResponse> {
        let state = self.state.read().unwrap();
        state
            .orders
            .get(exchange_order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(exchange_order_id.to_string()))
    }

    async fn get_balances(&self) -> ExchangeResult<HashMap<String, Balance>> {
        let state = self.state.read().unwrap();
        Ok(state.balances.clone())
    }

    async fn get_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let state = self.state.read().unwrap();
        state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::NoPriceAvailable(symbol.to_string()))
    }

    async fn subscribe_price_updates(
        &self,
        symbols: &[String],
        tx: mpsc::Sender<PriceUpdate>,
    ) -> ExchangeResult<()> {
        let mut state = self.state.write().unwrap();
        state.subscribers.push(tx);
        info!(?symbols, "Subscribed to price updates");
        Ok(())
    }

    async fn close(&self) -> ExchangeResult<()> {
        info!("Paper exchange closed");
        Ok(())
    }
}
