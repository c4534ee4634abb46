//! Risk Gate
//!
//! Sole authority over "may this trade proceed?" and the emergency stop.
//! Every rejection is persisted as a risk event and published as a
//! `risk.violation`. The kill-switch record in `system_config` is the source
//! of truth; the in-process flag is a cache refreshed by read-through.

use chrono::Duration;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::RiskConfig;
use crate::domain::clock::Clock;
use crate::domain::entities::order::OrderType;
use crate::domain::errors::{RiskViolation, RiskViolationKind};
use crate::events::{EventBus, EventType, KillSwitchEvent, RiskViolationEvent, TradeSignalEvent};
use crate::persistence::models::KillSwitchRecord;
use crate::persistence::repository::{
    BalanceRepository, OrderRepository, RiskEventRepository, SystemConfigRepository,
    TradeRepository,
};
use crate::persistence::DatabaseError;

const KILL_SWITCH_KEY: &str = "kill_switch";

/// Portfolio value assumed when no balances have been recorded yet
const FALLBACK_PORTFOLIO_VALUE: i64 = 10_000;

pub struct RiskManager {
    config: RiskConfig,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    orders: OrderRepository,
    trades: TradeRepository,
    balances: BalanceRepository,
    risk_events: RiskEventRepository,
    system_config: SystemConfigRepository,
    kill_switch: Mutex<KillSwitchRecord>,
}

impl RiskManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RiskConfig,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        orders: OrderRepository,
        trades: TradeRepository,
        balances: BalanceRepository,
        risk_events: RiskEventRepository,
        system_config: SystemConfigRepository,
    ) -> Self {
        RiskManager {
            config,
            bus,
            clock,
            orders,
            trades,
            balances,
            risk_events,
            system_config,
            kill_switch: Mutex::new(KillSwitchRecord::default()),
        }
    }

    /// Validate a trade signal against every risk rule, in order. The first
    /// failing rule rejects the signal, records a risk event, and publishes a
    /// `risk.violation`.
    pub async fn validate_trade_signal(
        &self,
        signal: &TradeSignalEvent,
    ) -> Result<(), RiskViolation> {
        if let Err(violation) = self.run_validations(signal).await {
            self.record_violation(&signal.strategy_id, &violation).await;
            return Err(violation);
        }

        info!(
            strategy_id = %signal.strategy_id,
            symbol = %signal.symbol,
            quantity = %signal.quantity,
            stop_loss = %signal.stop_loss_price,
            "Trade signal validated"
        );
        Ok(())
    }

    async fn run_validations(&self, signal: &TradeSignalEvent) -> Result<(), RiskViolation> {
        // 1. Kill switch
        if self.is_kill_switch_enabled().await {
            warn!("Trade rejected: kill switch is enabled");
            return Err(RiskViolation::new(
                RiskViolationKind::KillSwitch,
                "kill switch is enabled",
            ));
        }

        // 2. Daily loss limit; breach trips the kill switch before rejecting
        self.check_daily_loss_limit(&signal.strategy_id).await?;

        // 3. Open position count
        let open = self
            .trades
            .count_open_for_strategy(&signal.strategy_id)
            .await
            .unwrap_or(0);
        if open >= self.config.max_open_positions {
            return Err(RiskViolation::new(
                RiskViolationKind::MaxPositions,
                format!(
                    "max open positions reached: {} (limit: {})",
                    open, self.config.max_open_positions
                ),
            ));
        }

        // 4. Position size
        let entry_price = signal
            .indicators
            .get("price")
            .and_then(|p| Decimal::from_f64(*p))
            .unwrap_or(Decimal::ZERO);
        let position_value = signal.quantity * entry_price;
        if position_value > self.config.max_position_size_usd {
            return Err(RiskViolation::new(
                RiskViolationKind::PositionSize,
                format!(
                    "position size {} exceeds limit {}",
                    position_value, self.config.max_position_size_usd
                ),
            ));
        }

        // 5. Stop-loss present
        if signal.stop_loss_price.is_zero() {
            return Err(RiskViolation::new(
                RiskViolationKind::StopLossMissing,
                "stop-loss price is required",
            ));
        }

        // 6. Stop-loss width, at most double the configured percent
        if !entry_price.is_zero() {
            let stop_loss_percent =
                (entry_price - signal.stop_loss_price).abs() / entry_price * Decimal::from(100);
            let max_percent = self.config.stop_loss_percent * Decimal::from(2);
            if stop_loss_percent > max_percent {
                return Err(RiskViolation::new(
                    RiskViolationKind::StopLossTooWide,
                    format!(
                        "stop-loss {:.2}% is too wide (max {:.2}%)",
                        stop_loss_percent, max_percent
                    ),
                ));
            }
        }

        Ok(())
    }

    async fn check_daily_loss_limit(&self, strategy_id: &str) -> Result<(), RiskViolation> {
        let start_of_day = self.clock.start_of_today();

        let daily_pnl = match self
            .trades
            .realized_pnl_since(strategy_id, start_of_day)
            .await
        {
            Ok(pnl) => pnl,
            Err(e) => {
                error!("Failed to get daily P&L: {}", e);
                return Ok(());
            }
        };

        let portfolio_value = match self.balances.portfolio_value().await {
            Ok(value) if !value.is_zero() => value,
            _ => Decimal::from(FALLBACK_PORTFOLIO_VALUE),
        };

        let loss_limit =
            portfolio_value * self.config.daily_loss_limit_percent / Decimal::from(100);

        if daily_pnl < -loss_limit {
            let reason = format!("Daily loss limit exceeded: {}", daily_pnl);
            if let Err(e) = self.enable_kill_switch(&reason).await {
                error!("Failed to enable kill switch: {}", e);
            }
            return Err(RiskViolation::new(
                RiskViolationKind::DailyLossLimit,
                format!(
                    "daily loss limit exceeded: {} (limit: {})",
                    daily_pnl, loss_limit
                ),
            ));
        }

        Ok(())
    }

    /// Scan open trades and emit close signals for positions held past the
    /// max hold time. Runs periodically (30 s recommended).
    pub async fn check_open_trades(&self) -> Result<(), String> {
        let open = self
            .trades
            .open_trades()
            .await
            .map_err(|e| format!("failed to get open trades: {}", e))?;

        let max_hold = Duration::hours(self.config.max_hold_time_hours);
        let now = self.clock.now();

        for record in open {
            let trade = match record.to_entity() {
                Ok(trade) => trade,
                Err(e) => {
                    error!(trade_id = %record.id, "Skipping corrupt trade row: {}", e);
                    continue;
                }
            };

            let held = now - trade.entry_time;
            if held <= max_hold {
                continue;
            }

            warn!(
                trade_id = %trade.id,
                held_secs = held.num_seconds(),
                max_secs = max_hold.num_seconds(),
                "Trade exceeded max hold time"
            );

            let close_signal = TradeSignalEvent {
                id: Uuid::new_v4().to_string(),
                strategy_id: trade.strategy_id.clone(),
                symbol: trade.symbol.clone(),
                side: trade.side.closing_order_side().as_str().to_string(),
                order_type: OrderType::Market.as_str().to_string(),
                quantity: trade.quantity,
                price: None,
                stop_loss_price: Decimal::ZERO,
                reason: "MAX_HOLD_TIME".to_string(),
                exit_reason: Some("MAX_HOLD_TIME".to_string()),
                indicators: std::collections::HashMap::new(),
            };

            if let Err(e) = self.bus.publish(EventType::TradeSignal, &close_signal) {
                error!("Failed to publish close signal: {}", e);
            }

            self.log_risk_event(
                Some(&trade.strategy_id),
                "MAX_HOLD_TIME",
                &format!("Trade held for {} seconds", held.num_seconds()),
                "Closing trade",
            )
            .await;
        }

        Ok(())
    }

    /// Enable the emergency stop: persist the record, cancel every PENDING
    /// and OPEN order in one statement, and broadcast the state change.
    /// Idempotent.
    pub async fn enable_kill_switch(&self, reason: &str) -> Result<(), DatabaseError> {
        let now = self.clock.now();
        let record = KillSwitchRecord {
            enabled: true,
            reason: Some(reason.to_string()),
            timestamp: Some(now),
        };

        *self.kill_switch.lock().unwrap() = record.clone();

        self.system_config
            .set(
                KILL_SWITCH_KEY,
                &serde_json::to_value(&record).unwrap_or_default(),
                now,
            )
            .await?;

        match self.orders.cancel_all_open(now).await {
            Ok(cancelled) => {
                if cancelled > 0 {
                    warn!(cancelled, "Cancelled outstanding orders");
                }
            }
            Err(e) => error!("Failed to cancel open orders: {}", e),
        }

        if let Err(e) = self.bus.publish(
            EventType::KillSwitch,
            &KillSwitchEvent {
                enabled: true,
                reason: reason.to_string(),
            },
        ) {
            error!("Failed to publish kill switch event: {}", e);
        }

        self.log_risk_event(None, "KILL_SWITCH", reason, "All trading halted")
            .await;

        warn!(reason, "KILL SWITCH ENABLED");
        Ok(())
    }

    /// Disable the kill switch. Idempotent; cancelled orders stay cancelled.
    pub async fn disable_kill_switch(&self) -> Result<(), DatabaseError> {
        let now = self.clock.now();
        let record = KillSwitchRecord {
            enabled: false,
            reason: None,
            timestamp: Some(now),
        };

        *self.kill_switch.lock().unwrap() = record.clone();

        self.system_config
            .set(
                KILL_SWITCH_KEY,
                &serde_json::to_value(&record).unwrap_or_default(),
                now,
            )
            .await?;

        if let Err(e) = self.bus.publish(
            EventType::KillSwitch,
            &KillSwitchEvent {
                enabled: false,
                reason: String::new(),
            },
        ) {
            error!("Failed to publish kill switch event: {}", e);
        }

        info!("Kill switch disabled");
        Ok(())
    }

    /// Read-through kill-switch status: the store wins, the in-process flag
    /// is refreshed from it.
    pub async fn kill_switch_status(&self) -> KillSwitchRecord {
        match self.system_config.get(KILL_SWITCH_KEY).await {
            Ok(Some(value)) => match serde_json::from_value::<KillSwitchRecord>(value) {
                Ok(record) => {
                    *self.kill_switch.lock().unwrap() = record.clone();
                    record
                }
                Err(e) => {
                    error!("Corrupt kill switch record: {}", e);
                    self.kill_switch.lock().unwrap().clone()
                }
            },
            Ok(None) => KillSwitchRecord::default(),
            Err(e) => {
                error!("Failed to read kill switch: {}", e);
                self.kill_switch.lock().unwrap().clone()
            }
        }
    }

    pub async fn is_kill_switch_enabled(&self) -> bool {
        self.kill_switch_status().await.enabled
    }

    async fn record_violation(&self, strategy_id: &str, violation: &RiskViolation) {
        self.log_risk_event(
            Some(strategy_id),
            violation.kind.as_str(),
            &violation.detail,
            "Trade rejected",
        )
        .await;
    }

    async fn log_risk_event(
        &self,
        strategy_id: Option<&str>,
        event_type: &str,
        description: &str,
        action_taken: &str,
    ) {
        let now = self.clock.now();
        if let Err(e) = self
            .risk_events
            .create(
                strategy_id,
                event_type,
                description,
                action_taken,
                &serde_json::json!({ "timestamp": now }),
                now,
            )
            .await
        {
            error!("Failed to log risk event: {}", e);
        }

        let event = RiskViolationEvent {
            strategy_id: strategy_id.unwrap_or_default().to_string(),
            event_type: event_type.to_string(),
            description: description.to_string(),
            action_taken: action_taken.to_string(),
        };
        if let Err(e) = self.bus.publish(EventType::RiskViolation, &event) {
            error!("Failed to publish risk event: {}", e);
        }
    }
}
