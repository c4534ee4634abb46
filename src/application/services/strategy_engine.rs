//! Strategy Engine
//!
//! Wires the pure mean-reversion strategy to the bus and the store: consumes
//! broadcast `market.price.update` events for the configured symbol, keeps
//! the rolling buffer, consults open-trade state, and publishes
//! `strategy.signal` events. One engine task per symbol, so the buffer has a
//! single writer.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::entities::order::{OrderSide, OrderType};
use crate::domain::entities::trade::ExitReason;
use crate::domain::services::mean_reversion::{Decision, MeanReversionStrategy};
use crate::events::{Event, EventBus, EventType, PriceUpdateEvent, TradeSignalEvent};
use crate::persistence::repository::{CandleRepository, TradeRepository};

pub struct StrategyEngine {
    strategy_id: String,
    symbol: String,
    strategy: MeanReversionStrategy,
    bus: Arc<EventBus>,
    trades: TradeRepository,
    candles: CandleRepository,
}

impl StrategyEngine {
    pub fn new(
        strategy_id: String,
        symbol: String,
        strategy: MeanReversionStrategy,
        bus: Arc<EventBus>,
        trades: TradeRepository,
        candles: CandleRepository,
    ) -> Self {
        StrategyEngine {
            strategy_id,
            symbol,
            strategy,
            bus,
            trades,
            candles,
        }
    }

    /// Load historical closes into the buffer, oldest first
    pub async fn preload_history(&mut self) {
        let limit = self.strategy.params().max_history as i64;
        match self.candles.recent_closes(&self.symbol, "1m", limit).await {
            Ok(closes) => self.strategy.preload(closes),
            Err(e) => {
                warn!(
                    symbol = %self.symbol,
                    "Failed to load price history, will build as prices arrive: {}", e
                );
            }
        }
    }

    /// Consume price updates until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self.bus.subscribe(EventType::PriceUpdate);
        info!(strategy_id = %self.strategy_id, symbol = %self.symbol, "Strategy engine started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(strategy_id = %self.strategy_id, "Strategy engine stopping");
                    return;
                }
                event = rx.recv() => {
                    match event {
                        Ok(event) => self.on_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Strategy engine lagged behind price updates");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("Price update channel closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn on_event(&mut self, event: Event) {
        let update: PriceUpdateEvent = match event.payload() {
            Ok(update) => update,
            Err(e) => {
                error!("Failed to decode price update: {}", e);
                return;
            }
        };
        self.on_price_update(&update).await;
    }

    /// Feed one tick through the strategy and publish any resulting signal
    pub async fn on_price_update(&mut self, update: &PriceUpdateEvent) {
        if update.symbol != self.symbol {
            return;
        }

        let has_open_position = match self
            .trades
            .count_open_for_strategy(&self.strategy_id)
            .await
        {
            Ok(count) => count > 0,
            Err(e) => {
                error!("Failed to check open position: {}", e);
                return;
            }
        };

        let Some(decision) = self.strategy.on_price(update.price, has_open_position) else {
            return;
        };

        let signal = match decision {
            Decision::EnterLong {
                quantity,
                stop_loss_price,
                reason,
                indicators,
            } => TradeSignalEvent {
                id: Uuid::new_v4().to_string(),
                strategy_id: self.strategy_id.clone(),
                symbol: self.symbol.clone(),
                side: OrderSide::Buy.as_str().to_string(),
                order_type: OrderType::Market.as_str().to_string(),
                quantity,
                price: None,
                stop_loss_price,
                reason,
                exit_reason: None,
                indicators: indicators.to_map(),
            },
            Decision::ExitLong { reason, indicators } => {
                let quantity = match self
                    .trades
                    .latest_open_for(&self.strategy_id, &self.symbol)
                    .await
                {
                    Ok(Some(trade)) => match trade.quantity() {
                        Ok(quantity) => quantity,
                        Err(e) => {
                            error!("Corrupt open trade quantity: {}", e);
                            return;
                        }
                    },
                    Ok(None) => {
                        warn!(strategy_id = %self.strategy_id, "Exit decision without open trade");
                        return;
                    }
                    Err(e) => {
                        error!("Failed to load open trade: {}", e);
                        return;
                    }
                };

                TradeSignalEvent {
                    id: Uuid::new_v4().to_string(),
                    strategy_id: self.strategy_id.clone(),
                    symbol: self.symbol.clone(),
                    side: OrderSide::Sell.as_str().to_string(),
                    order_type: OrderType::Market.as_str().to_string(),
                    quantity,
                    price: None,
                    stop_loss_price: rust_decimal::Decimal::ZERO,
                    reason,
                    exit_reason: Some(ExitReason::Signal.as_str().to_string()),
                    indicators: indicators.to_map(),
                }
            }
        };

        info!(
            signal_id = %signal.id,
            side = %signal.side,
            quantity = %signal.quantity,
            reason = %signal.reason,
            "Signal generated"
        );

        if let Err(e) = self.bus.publish(EventType::TradeSignal, &signal) {
            error!("Failed to publish signal: {}", e);
        }
    }
}
