//! Database Repositories
//!
//! Data access layer for orders, trades, candles, balances, risk events,
//! system config, and the strategy/exchange registries. All mutations to
//! orders and trades flow through the order lifecycle manager.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error};
use uuid::Uuid;

use super::models::*;
use super::{DatabaseError, DbPool};
use crate::domain::entities::order::{Order, OrderStatus};
use crate::domain::entities::trade::{ExitReason, Trade};

fn query_error(context: &str, e: sqlx::Error) -> DatabaseError {
    if let sqlx::Error::Database(ref db) = e {
        if db.is_unique_violation() {
            return DatabaseError::Duplicate(format!("{}: {}", context, db.message()));
        }
    }
    error!("{}: {}", context, e);
    DatabaseError::QueryError(format!("{}: {}", context, e))
}

/// Order repository
#[derive(Clone)]
pub struct OrderRepository {
    pool: DbPool,
}

impl OrderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a new order row. A duplicate `client_order_id` surfaces as
    /// `DatabaseError::Duplicate`, the idempotency signal.
    pub async fn create(&self, order: &Order) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, client_order_id, exchange_order_id, exchange_id, strategy_id,
                symbol, side, type, quantity, price, stop_loss_price, status,
                filled_quantity, average_fill_price, fees, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)
            "#,
        )
        .bind(&order.id)
        .bind(&order.client_order_id)
        .bind(&order.exchange_order_id)
        .bind(&order.exchange_id)
        .bind(&order.strategy_id)
        .bind(&order.symbol)
        .bind(order.side.as_str())
        .bind(order.order_type.as_str())
        .bind(order.quantity.to_string())
        .bind(order.price.map(|p| p.to_string()))
        .bind(order.stop_loss_price.map(|p| p.to_string()))
        .bind(order.status.as_str())
        .bind(order.filled_quantity.to_string())
        .bind(order.average_fill_price.map(|p| p.to_string()))
        .bind(order.fees.to_string())
        .bind(order.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to create order", e))?;

        debug!(order_id = %order.id, client_order_id = %order.client_order_id, "Created order");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<OrderRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderRecord>("SELECT * FROM orders WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("Failed to get order", e))
    }

    pub async fn find_by_client_order_id(
        &self,
        client_order_id: &str,
    ) -> Result<Option<OrderRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderRecord>("SELECT * FROM orders WHERE client_order_id = ?1")
            .bind(client_order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("Failed to find order by client id", e))
    }

    /// Record the outcome of an exchange dispatch
    #[allow(clippy::too_many_arguments)]
    pub async fn update_execution(
        &self,
        id: &str,
        status: OrderStatus,
        exchange_order_id: Option<&str>,
        filled_quantity: Decimal,
        average_fill_price: Option<Decimal>,
        fees: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let filled_at = if status == OrderStatus::Filled {
            Some(now)
        } else {
            None
        };

        let rows = sqlx::query(
            r#"
            UPDATE orders
            SET status = ?2,
                exchange_order_id = COALESCE(?3, exchange_order_id),
                filled_quantity = ?4,
                average_fill_price = COALESCE(?5, average_fill_price),
                fees = ?6,
                filled_at = COALESCE(?7, filled_at),
                updated_at = ?8
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(exchange_order_id)
        .bind(filled_quantity.to_string())
        .bind(average_fill_price.map(|p| p.to_string()))
        .bind(fees.to_string())
        .bind(filled_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to update order execution", e))?
        .rows_affected();

        if rows == 0 {
            return Err(DatabaseError::QueryError(format!("Order not found: {}", id)));
        }

        debug!(order_id = %id, status = status.as_str(), "Updated order");
        Ok(())
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE orders SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(status.as_str())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| query_error("Failed to set order status", e))?;
        Ok(())
    }

    /// Cancel every PENDING and OPEN order in a single statement (kill switch)
    pub async fn cancel_all_open(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let rows = sqlx::query(
            "UPDATE orders SET status = 'CANCELLED', updated_at = ?1 \
             WHERE status IN ('PENDING', 'OPEN')",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to cancel open orders", e))?
        .rows_affected();

        Ok(rows)
    }

    pub async fn count_with_status(&self, status: OrderStatus) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders WHERE status = ?1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| query_error("Failed to count orders", e))?;
        Ok(row.0)
    }
}

/// Trade repository
#[derive(Clone)]
pub struct TradeRepository {
    pool: DbPool,
}

impl TradeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn open_trade(&self, trade: &Trade) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, entry_order_id, strategy_id, symbol, side,
                entry_price, quantity, entry_time, fees_total, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?8)
            "#,
        )
        .bind(&trade.id)
        .bind(&trade.entry_order_id)
        .bind(&trade.strategy_id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.entry_price.to_string())
        .bind(trade.quantity.to_string())
        .bind(trade.entry_time)
        .bind(trade.fees_total.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to open trade", e))?;

        debug!(trade_id = %trade.id, symbol = %trade.symbol, "Opened trade");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<TradeRecord>, DatabaseError> {
        sqlx::query_as::<_, TradeRecord>("SELECT * FROM trades WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("Failed to get trade", e))
    }

    /// The most recent open trade for (strategy, symbol)
    pub async fn latest_open_for(
        &self,
        strategy_id: &str,
        symbol: &str,
    ) -> Result<Option<TradeRecord>, DatabaseError> {
        sqlx::query_as::<_, TradeRecord>(
            r#"
            SELECT * FROM trades
            WHERE strategy_id = ?1 AND symbol = ?2 AND exit_time IS NULL
            ORDER BY entry_time DESC
            LIMIT 1
            "#,
        )
        .bind(strategy_id)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("Failed to get open trade", e))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn close_trade(
        &self,
        id: &str,
        exit_order_id: &str,
        exit_price: Decimal,
        exit_time: DateTime<Utc>,
        pnl: Decimal,
        pnl_percent: Decimal,
        fees_total: Decimal,
        hold_duration_secs: i64,
        exit_reason: ExitReason,
    ) -> Result<(), DatabaseError> {
        let rows = sqlx::query(
            r#"
            UPDATE trades
            SET exit_order_id = ?2,
                exit_price = ?3,
                exit_time = ?4,
                pnl = ?5,
                pnl_percent = ?6,
                fees_total = ?7,
                hold_duration_secs = ?8,
                exit_reason = ?9
            WHERE id = ?1 AND exit_time IS NULL
            "#,
        )
        .bind(id)
        .bind(exit_order_id)
        .bind(exit_price.to_string())
        .bind(exit_time)
        .bind(pnl.to_string())
        .bind(pnl_percent.to_string())
        .bind(fees_total.to_string())
        .bind(hold_duration_secs)
        .bind(exit_reason.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to close trade", e))?
        .rows_affected();

        if rows == 0 {
            return Err(DatabaseError::QueryError(format!(
                "Trade not found or already closed: {}",
                id
            )));
        }

        debug!(trade_id = %id, exit_reason = exit_reason.as_str(), "Closed trade");
        Ok(())
    }

    pub async fn open_trades(&self) -> Result<Vec<TradeRecord>, DatabaseError> {
        sqlx::query_as::<_, TradeRecord>(
            "SELECT * FROM trades WHERE exit_time IS NULL ORDER BY entry_time ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to get open trades", e))
    }

    pub async fn count_open_for_strategy(&self, strategy_id: &str) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM trades WHERE strategy_id = ?1 AND exit_time IS NULL",
        )
        .bind(strategy_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_error("Failed to count open trades", e))?;
        Ok(row.0)
    }

    /// Sum of realised P&L for trades entered at or after `since`.
    ///
    /// Summed in decimal on the way out; SQL SUM over text columns would
    /// round through floating point.
    pub async fn realized_pnl_since(
        &self,
        strategy_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT pnl FROM trades \
             WHERE strategy_id = ?1 AND entry_time >= ?2 AND pnl IS NOT NULL",
        )
        .bind(strategy_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to sum daily P&L", e))?;

        let mut total = Decimal::ZERO;
        for (pnl,) in rows {
            total += parse_decimal("trades.pnl", &pnl)?;
        }
        Ok(total)
    }
}

/// Candle data to persist
#[derive(Debug, Clone)]
pub struct CandleUpsert {
    pub time: DateTime<Utc>,
    pub exchange: String,
    pub symbol: String,
    pub interval: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Candle repository
#[derive(Clone)]
pub struct CandleRepository {
    pool: DbPool,
}

impl CandleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Upsert one candle keyed on (time, exchange, symbol, interval)
    pub async fn upsert(&self, candle: &CandleUpsert) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO price_data (time, exchange, symbol, interval, open, high, low, close, volume)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (time, exchange, symbol, interval) DO UPDATE
            SET open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume
            "#,
        )
        .bind(candle.time)
        .bind(&candle.exchange)
        .bind(&candle.symbol)
        .bind(&candle.interval)
        .bind(candle.open.to_string())
        .bind(candle.high.to_string())
        .bind(candle.low.to_string())
        .bind(candle.close.to_string())
        .bind(candle.volume.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to upsert candle", e))?;

        debug!(symbol = %candle.symbol, time = %candle.time, "Candle saved");
        Ok(())
    }

    /// Timestamp of the newest candle for a symbol, for gap detection
    pub async fn latest_time(
        &self,
        symbol: &str,
        interval: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let row: (Option<DateTime<Utc>>,) = sqlx::query_as(
            "SELECT MAX(time) FROM price_data WHERE symbol = ?1 AND interval = ?2",
        )
        .bind(symbol)
        .bind(interval)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_error("Failed to get latest candle time", e))?;
        Ok(row.0)
    }

    /// The last `limit` close prices in chronological order, for preloading
    /// the signal engine
    pub async fn recent_closes(
        &self,
        symbol: &str,
        interval: &str,
        limit: i64,
    ) -> Result<Vec<Decimal>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT close FROM price_data \
             WHERE symbol = ?1 AND interval = ?2 \
             ORDER BY time DESC LIMIT ?3",
        )
        .bind(symbol)
        .bind(interval)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to load price history", e))?;

        let mut closes = Vec::with_capacity(rows.len());
        for (close,) in rows.into_iter().rev() {
            closes.push(parse_decimal("price_data.close", &close)?);
        }
        Ok(closes)
    }

    pub async fn range(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CandleRecord>, DatabaseError> {
        sqlx::query_as::<_, CandleRecord>(
            "SELECT * FROM price_data \
             WHERE symbol = ?1 AND interval = ?2 AND time >= ?3 AND time <= ?4 \
             ORDER BY time ASC",
        )
        .bind(symbol)
        .bind(interval)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to get candles", e))
    }

    /// Delete candles older than the retention cutoff
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let rows = sqlx::query("DELETE FROM price_data WHERE time < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| query_error("Failed to cleanup old candles", e))?
            .rows_affected();
        Ok(rows)
    }
}

/// Balance repository
#[derive(Clone)]
pub struct BalanceRepository {
    pool: DbPool,
}

impl BalanceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Write one balance; `total` is always derived as available + locked
    pub async fn upsert(
        &self,
        exchange: &str,
        currency: &str,
        available: Decimal,
        locked: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let total = available + locked;
        sqlx::query(
            r#"
            INSERT INTO balances (exchange, currency, available, locked, total, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (exchange, currency) DO UPDATE
            SET available = excluded.available,
                locked = excluded.locked,
                total = excluded.total,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(exchange)
        .bind(currency)
        .bind(available.to_string())
        .bind(locked.to_string())
        .bind(total.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to upsert balance", e))?;
        Ok(())
    }

    pub async fn all(&self) -> Result<Vec<BalanceRecord>, DatabaseError> {
        sqlx::query_as::<_, BalanceRecord>("SELECT * FROM balances")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error("Failed to get balances", e))
    }

    /// Portfolio value as the decimal sum of all balance totals
    pub async fn portfolio_value(&self) -> Result<Decimal, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT total FROM balances")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error("Failed to sum balances", e))?;

        let mut total = Decimal::ZERO;
        for (value,) in rows {
            total += parse_decimal("balances.total", &value)?;
        }
        Ok(total)
    }
}

/// Risk event repository (append-only audit)
#[derive(Clone)]
pub struct RiskEventRepository {
    pool: DbPool,
}

impl RiskEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        strategy_id: Option<&str>,
        event_type: &str,
        description: &str,
        action_taken: &str,
        metadata: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let metadata_json = serde_json::to_string(metadata)
            .map_err(|e| DatabaseError::QueryError(format!("Failed to serialize metadata: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO risk_events (strategy_id, event_type, description, action_taken, metadata, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(strategy_id)
        .bind(event_type)
        .bind(description)
        .bind(action_taken)
        .bind(metadata_json)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to create risk event", e))?;

        debug!(event_type, "Logged risk event");
        Ok(())
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<RiskEventRecord>, DatabaseError> {
        sqlx::query_as::<_, RiskEventRecord>(
            "SELECT * FROM risk_events ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to get risk events", e))
    }

    pub async fn count_by_type(&self, event_type: &str) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM risk_events WHERE event_type = ?1")
            .bind(event_type)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| query_error("Failed to count risk events", e))?;
        Ok(row.0)
    }
}

/// System config repository (keyed JSON blobs)
#[derive(Clone)]
pub struct SystemConfigRepository {
    pool: DbPool,
}

impl SystemConfigRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn set(
        &self,
        key: &str,
        value: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let value_json = serde_json::to_string(value)
            .map_err(|e| DatabaseError::QueryError(format!("Failed to serialize config: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO system_config (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (key) DO UPDATE
            SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value_json)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to set system config", e))?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        let record =
            sqlx::query_as::<_, SystemConfigRecord>("SELECT * FROM system_config WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| query_error("Failed to get system config", e))?;

        record
            .map(|r| {
                serde_json::from_str(&r.value)
                    .map_err(|e| DatabaseError::Corrupt(format!("system_config.{}: {}", r.key, e)))
            })
            .transpose()
    }
}

/// Strategy registry repository
#[derive(Clone)]
pub struct StrategyRepository {
    pool: DbPool,
}

impl StrategyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Look up a strategy by name, creating it on first run
    pub async fn get_or_create(
        &self,
        name: &str,
        strategy_type: &str,
        config: &serde_json::Value,
        is_active: bool,
    ) -> Result<String, DatabaseError> {
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT id FROM strategies WHERE name = ?1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| query_error("Failed to look up strategy", e))?;

        if let Some((id,)) = existing {
            return Ok(id);
        }

        let id = Uuid::new_v4().to_string();
        let config_json = serde_json::to_string(config)
            .map_err(|e| DatabaseError::QueryError(format!("Failed to serialize config: {}", e)))?;

        sqlx::query(
            "INSERT INTO strategies (id, name, type, config, is_active, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&id)
        .bind(name)
        .bind(strategy_type)
        .bind(config_json)
        .bind(is_active)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to create strategy", e))?;

        debug!(strategy = name, id = %id, "Registered strategy");
        Ok(id)
    }
}

/// Exchange registry repository
#[derive(Clone)]
pub struct ExchangeRepository {
    pool: DbPool,
}

impl ExchangeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get_or_create(
        &self,
        name: &str,
        is_paper_trading: bool,
    ) -> Result<String, DatabaseError> {
        let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM exchanges WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("Failed to look up exchange", e))?;

        if let Some((id,)) = existing {
            return Ok(id);
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO exchanges (id, name, is_paper_trading, is_active, created_at) \
             VALUES (?1, ?2, ?3, 1, ?4)",
        )
        .bind(&id)
        .bind(name)
        .bind(is_paper_trading)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to create exchange", e))?;

        Ok(id)
    }

    /// The active exchange id orders are routed to
    pub async fn active_exchange_id(&self) -> Result<Option<String>, DatabaseError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT id FROM exchanges WHERE is_active = 1 LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| query_error("Failed to get active exchange", e))?;
        Ok(row.map(|(id,)| id))
    }
}
