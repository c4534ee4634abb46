//! Order Lifecycle Manager
//!
//! Owns every order and trade mutation: idempotent creation keyed on a
//! deterministic client order id, exchange dispatch after the durable
//! PENDING insert, state-machine updates, and trade open/close with decimal
//! P&L accounting.

use chrono::Utc;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::clock::Clock;
use crate::domain::entities::order::{Order, OrderSide, OrderStatus, OrderType};
use crate::domain::entities::trade::{realized_pnl, ExitReason, Trade, TradeSide};
use crate::domain::errors::OrderError;
use crate::domain::repositories::exchange::{Exchange, OrderRequest, OrderResponse};
use crate::events::{
    EventBus, EventType, OrderFilledEvent, OrderPlacedEvent, TradeClosedEvent, TradeOpenedEvent,
    TradeSignalEvent,
};
use crate::persistence::models::OrderRecord;
use crate::persistence::repository::{
    BalanceRepository, ExchangeRepository, OrderRepository, RiskEventRepository, TradeRepository,
};
use crate::persistence::DatabaseError;

pub struct OrderManager {
    exchange: Arc<dyn Exchange>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    orders: OrderRepository,
    trades: TradeRepository,
    exchanges: ExchangeRepository,
    balances: BalanceRepository,
    risk_events: RiskEventRepository,
}

impl OrderManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn Exchange>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        orders: OrderRepository,
        trades: TradeRepository,
        exchanges: ExchangeRepository,
        balances: BalanceRepository,
        risk_events: RiskEventRepository,
    ) -> Self {
        OrderManager {
            exchange,
            bus,
            clock,
            orders,
            trades,
            exchanges,
            balances,
            risk_events,
        }
    }

    /// Deterministic idempotency key: identical signals map to the same id,
    /// which the unique constraint turns into at-most-one order row.
    pub fn client_order_id(signal: &TradeSignalEvent) -> String {
        let price_hint = signal
            .indicators
            .get("price")
            .copied()
            .unwrap_or_default();
        let data = format!(
            "{}-{}-{}-{}-{}",
            signal.strategy_id, signal.symbol, signal.side, signal.quantity, price_hint
        );
        let digest = Sha256::digest(data.as_bytes());
        hex::encode(digest)[..32].to_string()
    }

    /// Place an order for a validated signal, idempotently. A duplicate
    /// submission returns the existing order id without touching the
    /// exchange.
    pub async fn place_order(&self, signal: &TradeSignalEvent) -> Result<String, OrderError> {
        let client_order_id = Self::client_order_id(signal);

        if let Some(existing) = self.orders.find_by_client_order_id(&client_order_id).await? {
            info!(
                client_order_id = %client_order_id,
                order_id = %existing.id,
                "Order already exists (idempotent)"
            );
            return Ok(existing.id);
        }

        let side = OrderSide::parse(&signal.side)?;
        let order_type = OrderType::parse(&signal.order_type)?;

        let exchange_id = self
            .exchanges
            .active_exchange_id()
            .await?
            .ok_or(OrderError::NoActiveExchange)?;

        let stop_loss_price = if signal.stop_loss_price.is_zero() {
            None
        } else {
            Some(signal.stop_loss_price)
        };

        let order = Order::new(
            Uuid::new_v4().to_string(),
            client_order_id.clone(),
            exchange_id,
            signal.strategy_id.clone(),
            signal.symbol.clone(),
            side,
            order_type,
            signal.quantity,
            signal.price,
            stop_loss_price,
            self.clock.now(),
        )?;

        match self.orders.create(&order).await {
            Ok(()) => {}
            Err(DatabaseError::Duplicate(_)) => {
                // Lost the insert race: same signal, same outcome
                info!(client_order_id = %client_order_id, "Order already exists (idempotent)");
                if let Some(existing) =
                    self.orders.find_by_client_order_id(&client_order_id).await?
                {
                    return Ok(existing.id);
                }
                return Ok(client_order_id);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            order_id = %order.id,
            client_order_id = %client_order_id,
            symbol = %order.symbol,
            side = %order.side,
            quantity = %order.quantity,
            "Order created with PENDING status"
        );

        self.execute_order(&order, signal).await;

        Ok(order.id)
    }

    /// Dispatch a PENDING order to the exchange and record the outcome.
    /// Exchange failures mark the order FAILED; they are not retried.
    async fn execute_order(&self, order: &Order, signal: &TradeSignalEvent) {
        let request = OrderRequest {
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            price: order.price,
            stop_loss_price: order.stop_loss_price,
        };

        let response = match self.exchange.place_order(&request).await {
            Ok(response) => response,
            Err(e) => {
                error!(order_id = %order.id, "Failed to place order on exchange: {}", e);
                if let Err(e) = self
                    .transition(&order.id, order.status, OrderStatus::Failed, None, None)
                    .await
                {
                    error!(order_id = %order.id, "Failed to mark order FAILED: {}", e);
                }
                self.publish_order_event(EventType::OrderFailed, order, "");
                return;
            }
        };

        if let Err(e) = self
            .transition(
                &order.id,
                order.status,
                response.status,
                Some(&response),
                None,
            )
            .await
        {
            error!(order_id = %order.id, "Failed to record exchange response: {}", e);
            return;
        }

        info!(
            order_id = %order.id,
            exchange_order_id = %response.exchange_order_id,
            status = %response.status,
            filled_quantity = %response.filled_quantity,
            "Order placed on exchange"
        );

        self.publish_order_event(EventType::OrderPlaced, order, &response.exchange_order_id);

        if response.status == OrderStatus::Filled {
            self.handle_filled_order(&order.id, signal, &response).await;
            self.sync_balances().await;
        }
    }

    /// Apply a status transition, rejecting illegal ones
    async fn transition(
        &self,
        order_id: &str,
        from: OrderStatus,
        to: OrderStatus,
        response: Option<&OrderResponse>,
        now_override: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), OrderError> {
        if !from.can_transition_to(to) {
            warn!(
                order_id,
                from = from.as_str(),
                to = to.as_str(),
                "Rejected illegal order status transition"
            );
            return Err(OrderError::IllegalTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        let now = now_override.unwrap_or_else(|| self.clock.now());
        match response {
            Some(response) => {
                self.orders
                    .update_execution(
                        order_id,
                        to,
                        Some(&response.exchange_order_id),
                        response.filled_quantity,
                        response.average_fill_price,
                        response.fees,
                        now,
                    )
                    .await?
            }
            None => self.orders.set_status(order_id, to, now).await?,
        }
        Ok(())
    }

    /// A filled BUY opens a LONG trade; a filled SELL closes the most recent
    /// open trade for the (strategy, symbol).
    async fn handle_filled_order(
        &self,
        order_id: &str,
        signal: &TradeSignalEvent,
        response: &OrderResponse,
    ) {
        let record = match self.orders.get(order_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                error!(order_id, "Filled order not found");
                return;
            }
            Err(e) => {
                error!(order_id, "Failed to load filled order: {}", e);
                return;
            }
        };

        match record.side.as_str() {
            "BUY" => self.open_trade(&record).await,
            _ => self.close_trade(&record, signal).await,
        }

        let filled_event = OrderFilledEvent {
            order_id: record.id.clone(),
            client_order_id: record.client_order_id.clone(),
            exchange_order_id: response.exchange_order_id.clone(),
            symbol: record.symbol.clone(),
            side: record.side.clone(),
            filled_quantity: response.filled_quantity,
            average_fill_price: response.average_fill_price.unwrap_or_default(),
            fees: response.fees,
            filled_at: self.clock.now(),
        };
        if let Err(e) = self.bus.publish(EventType::OrderFilled, &filled_event) {
            error!("Failed to publish order filled event: {}", e);
        }
    }

    async fn open_trade(&self, order: &OrderRecord) {
        let (entry_price, quantity, fees) = match (
            order.average_fill_price(),
            order.filled_quantity(),
            order.fees(),
        ) {
            (Ok(Some(price)), Ok(quantity), Ok(fees)) => (price, quantity, fees),
            _ => {
                error!(order_id = %order.id, "Filled order missing fill price");
                return;
            }
        };

        let trade = Trade {
            id: Uuid::new_v4().to_string(),
            entry_order_id: order.id.clone(),
            exit_order_id: None,
            strategy_id: order.strategy_id.clone(),
            symbol: order.symbol.clone(),
            side: TradeSide::Long,
            entry_price,
            quantity,
            entry_time: self.clock.now(),
            exit_price: None,
            exit_time: None,
            pnl: None,
            pnl_percent: None,
            fees_total: fees,
            hold_duration_secs: None,
            exit_reason: None,
        };

        if let Err(e) = self.trades.open_trade(&trade).await {
            error!(order_id = %order.id, "Failed to create trade: {}", e);
            return;
        }

        info!(
            trade_id = %trade.id,
            strategy_id = %trade.strategy_id,
            symbol = %trade.symbol,
            entry_price = %trade.entry_price,
            quantity = %trade.quantity,
            "Trade opened"
        );

        let event = TradeOpenedEvent {
            trade_id: trade.id.clone(),
            strategy_id: trade.strategy_id.clone(),
            symbol: trade.symbol.clone(),
            side: trade.side.as_str().to_string(),
            entry_price: trade.entry_price,
            quantity: trade.quantity,
            entry_time: trade.entry_time,
        };
        if let Err(e) = self.bus.publish(EventType::TradeOpened, &event) {
            error!("Failed to publish trade opened event: {}", e);
        }
    }

    async fn close_trade(&self, exit_order: &OrderRecord, signal: &TradeSignalEvent) {
        let open = match self
            .trades
            .latest_open_for(&exit_order.strategy_id, &exit_order.symbol)
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                // Constraint violation: a close with nothing to close. Audit
                // and keep running.
                error!(
                    strategy_id = %exit_order.strategy_id,
                    symbol = %exit_order.symbol,
                    "No open trade to close"
                );
                if let Err(e) = self
                    .risk_events
                    .create(
                        Some(&exit_order.strategy_id),
                        "TRADE_CLOSE_WITHOUT_POSITION",
                        &format!("SELL fill with no open trade for {}", exit_order.symbol),
                        "Fill recorded without trade closure",
                        &serde_json::json!({"order_id": exit_order.id}),
                        self.clock.now(),
                    )
                    .await
                {
                    error!("Failed to log risk event: {}", e);
                }
                return;
            }
            Err(e) => {
                error!("Failed to get open trade for closing: {}", e);
                return;
            }
        };

        let trade = match open.to_entity() {
            Ok(trade) => trade,
            Err(e) => {
                error!(trade_id = %open.id, "Corrupt trade row: {}", e);
                return;
            }
        };

        let exit_price = match exit_order.average_fill_price() {
            Ok(Some(price)) => price,
            _ => {
                error!(order_id = %exit_order.id, "Exit order missing fill price");
                return;
            }
        };
        let exit_fees = exit_order.fees().unwrap_or(Decimal::ZERO);

        let entry_fees = match self.orders.get(&trade.entry_order_id).await {
            Ok(Some(entry)) => entry.fees().unwrap_or(Decimal::ZERO),
            _ => Decimal::ZERO,
        };

        let total_fees = entry_fees + exit_fees;
        let (pnl, pnl_percent) = realized_pnl(
            trade.side,
            trade.entry_price,
            exit_price,
            trade.quantity,
            total_fees,
        );

        let now = self.clock.now();
        let hold_duration_secs = (now - trade.entry_time).num_seconds();
        let exit_reason = signal
            .exit_reason
            .as_deref()
            .and_then(ExitReason::parse)
            .unwrap_or(ExitReason::Signal);

        if let Err(e) = self
            .trades
            .close_trade(
                &trade.id,
                &exit_order.id,
                exit_price,
                now,
                pnl,
                pnl_percent,
                total_fees,
                hold_duration_secs,
                exit_reason,
            )
            .await
        {
            error!(trade_id = %trade.id, "Failed to update closed trade: {}", e);
            return;
        }

        info!(
            trade_id = %trade.id,
            entry_price = %trade.entry_price,
            exit_price = %exit_price,
            pnl = %pnl,
            pnl_percent = %pnl_percent,
            exit_reason = exit_reason.as_str(),
            "Trade closed"
        );

        let event = TradeClosedEvent {
            trade_id: trade.id.clone(),
            strategy_id: trade.strategy_id.clone(),
            symbol: trade.symbol.clone(),
            entry_price: trade.entry_price,
            exit_price,
            quantity: trade.quantity,
            pnl,
            pnl_percent,
            exit_reason: exit_reason.as_str().to_string(),
            exit_time: now,
            hold_duration_secs,
        };
        if let Err(e) = self.bus.publish(EventType::TradeClosed, &event) {
            error!("Failed to publish trade closed event: {}", e);
        }
    }

    /// Refresh the balances table from the exchange after a fill
    async fn sync_balances(&self) {
        let balances = match self.exchange.get_balances().await {
            Ok(balances) => balances,
            Err(e) => {
                warn!("Failed to fetch balances: {}", e);
                return;
            }
        };

        let now = self.clock.now();
        for balance in balances.values() {
            if let Err(e) = self
                .balances
                .upsert(
                    self.exchange.name(),
                    &balance.currency,
                    balance.available,
                    balance.locked,
                    now,
                )
                .await
            {
                error!(currency = %balance.currency, "Failed to persist balance: {}", e);
            }
        }
    }

    fn publish_order_event(&self, event_type: EventType, order: &Order, exchange_order_id: &str) {
        let event = OrderPlacedEvent {
            order_id: order.id.clone(),
            client_order_id: order.client_order_id.clone(),
            exchange_order_id: exchange_order_id.to_string(),
            strategy_id: order.strategy_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side.as_str().to_string(),
            order_type: order.order_type.as_str().to_string(),
            quantity: order.quantity,
            price: order.price,
            stop_loss_price: order.stop_loss_price.unwrap_or_default(),
        };
        if let Err(e) = self.bus.publish(event_type, &event) {
            error!("Failed to publish order event: {}", e);
        }
    }
}
