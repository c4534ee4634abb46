//! Persistence Layer
//!
//! SQLite store shared by every component, accessed through sqlx with async
//! operations. Monetary and quantity columns hold canonical fixed-point
//! decimal strings; records expose typed accessors that parse them back.
//!
//! # Tables
//! - `orders` — every intended or outstanding exchange action, unique
//!   `client_order_id` (the idempotency signal)
//! - `trades` — open and realised positions; `exit_time IS NULL` means open
//! - `price_data` — 1m OHLCV candles, one row per (time, exchange, symbol,
//!   interval), upsert semantics
//! - `balances` — per-(exchange, currency); `total` is always written as
//!   `available + locked`
//! - `risk_events` — append-only audit of risk decisions
//! - `system_config` — keyed JSON blobs; `kill_switch` is the canonical
//!   kill-switch record
//! - `strategies`, `exchanges` — registries

pub mod models;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database errors
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Duplicate key: {0}")]
    Duplicate(String),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

/// Initialize the database connection pool and run migrations
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("Database initialized");

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    let statements: &[(&str, &str)] = &[
        (
            "exchanges",
            r#"
            CREATE TABLE IF NOT EXISTS exchanges (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                is_paper_trading INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at DATETIME NOT NULL
            )
            "#,
        ),
        (
            "strategies",
            r#"
            CREATE TABLE IF NOT EXISTS strategies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                type TEXT NOT NULL,
                config TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL
            )
            "#,
        ),
        (
            "orders",
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                client_order_id TEXT NOT NULL UNIQUE,
                exchange_order_id TEXT,
                exchange_id TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL CHECK(side IN ('BUY', 'SELL')),
                type TEXT NOT NULL CHECK(type IN ('MARKET', 'LIMIT')),
                quantity TEXT NOT NULL,
                price TEXT,
                stop_loss_price TEXT,
                status TEXT NOT NULL
                    CHECK(status IN ('PENDING', 'OPEN', 'FILLED', 'CANCELLED', 'FAILED')),
                filled_quantity TEXT NOT NULL DEFAULT '0',
                average_fill_price TEXT,
                fees TEXT NOT NULL DEFAULT '0',
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                filled_at DATETIME,
                FOREIGN KEY (exchange_id) REFERENCES exchanges(id)
            )
            "#,
        ),
        (
            "trades",
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                entry_order_id TEXT NOT NULL,
                exit_order_id TEXT,
                strategy_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL CHECK(side IN ('LONG', 'SHORT')),
                entry_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_time DATETIME NOT NULL,
                exit_price TEXT,
                exit_time DATETIME,
                pnl TEXT,
                pnl_percent TEXT,
                fees_total TEXT NOT NULL DEFAULT '0',
                hold_duration_secs INTEGER,
                exit_reason TEXT,
                created_at DATETIME NOT NULL,
                FOREIGN KEY (entry_order_id) REFERENCES orders(id),
                FOREIGN KEY (exit_order_id) REFERENCES orders(id)
            )
            "#,
        ),
        (
            "price_data",
            r#"
            CREATE TABLE IF NOT EXISTS price_data (
                time DATETIME NOT NULL,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                PRIMARY KEY (time, exchange, symbol, interval)
            )
            "#,
        ),
        (
            "balances",
            r#"
            CREATE TABLE IF NOT EXISTS balances (
                exchange TEXT NOT NULL,
                currency TEXT NOT NULL,
                available TEXT NOT NULL,
                locked TEXT NOT NULL,
                total TEXT NOT NULL,
                updated_at DATETIME NOT NULL,
                PRIMARY KEY (exchange, currency)
            )
            "#,
        ),
        (
            "risk_events",
            r#"
            CREATE TABLE IF NOT EXISTS risk_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_id TEXT,
                event_type TEXT NOT NULL,
                description TEXT NOT NULL,
                action_taken TEXT NOT NULL,
                metadata TEXT NOT NULL,
                timestamp DATETIME NOT NULL
            )
            "#,
        ),
        (
            "system_config",
            r#"
            CREATE TABLE IF NOT EXISTS system_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        ),
    ];

    for (table, ddl) in statements {
        sqlx::query(ddl).execute(pool).await.map_err(|e| {
            DatabaseError::MigrationError(format!("Failed to create {} table: {}", table, e))
        })?;
    }

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status)",
        "CREATE INDEX IF NOT EXISTS idx_orders_strategy ON orders(strategy_id)",
        "CREATE INDEX IF NOT EXISTS idx_trades_open ON trades(strategy_id, exit_time)",
        "CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)",
        "CREATE INDEX IF NOT EXISTS idx_risk_events_timestamp ON risk_events(timestamp)",
    ];

    for ddl in indexes {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;
    }

    info!("Database migrations completed");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_init() {
        let pool = init_database("sqlite::memory:").await;
        assert!(pool.is_ok());
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let pool = init_database("sqlite::memory:").await.unwrap();

        let result: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
             ('orders', 'trades', 'price_data', 'balances', 'risk_events', 'system_config')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(result.0, 6);
    }

    #[tokio::test]
    async fn test_client_order_id_unique() {
        let pool = init_database("sqlite::memory:").await.unwrap();

        sqlx::query(
            "INSERT INTO exchanges (id, name, is_paper_trading, is_active, created_at) \
             VALUES ('e1', 'paper', 1, 1, datetime('now'))",
        )
        .execute(&pool)
        .await
        .unwrap();

        let insert = "INSERT INTO orders (id, client_order_id, exchange_id, strategy_id, symbol, \
                      side, type, quantity, status, created_at, updated_at) \
                      VALUES (?1, 'dup', 'e1', 's1', 'BTC-USD', 'BUY', 'MARKET', '0.1', \
                      'PENDING', datetime('now'), datetime('now'))";

        sqlx::query(insert).bind("o1").execute(&pool).await.unwrap();
        let second = sqlx::query(insert).bind("o2").execute(&pool).await;
        assert!(second.is_err());
    }
}
