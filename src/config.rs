//! Application Configuration
//!
//! Loads configuration from environment variables with sensible defaults.
//! A `.env` file in the working directory is honored when present.

use rust_decimal::Decimal;
use std::str::FromStr;

/// Top-level configuration for the trading engine
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub trading: TradingConfig,
    pub risk: RiskConfig,
    pub strategy: StrategyConfig,
    pub market_data: MarketDataConfig,
    pub api: ApiConfig,
}

/// Database connection configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://data/senga.db")
    pub url: String,
    pub max_connections: u32,
}

/// Trading mode configuration
#[derive(Debug, Clone)]
pub struct TradingConfig {
    /// "paper" or "live"
    pub mode: String,
}

/// Risk management parameters
#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_position_size_usd: Decimal,
    pub max_open_positions: i64,
    pub daily_loss_limit_percent: Decimal,
    pub stop_loss_percent: Decimal,
    pub max_hold_time_hours: i64,
    pub min_balance_usd: Decimal,
}

/// Strategy configuration
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub enabled: bool,
    pub symbol: String,
    pub timeframe: String,
}

/// Market data configuration
#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    /// Candles older than this are deleted by the retention task
    pub retention_days: i64,
}

/// HTTP health surface configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();

        let config = Config {
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", "sqlite://data/senga.db"),
                max_connections: get_env_parsed("DATABASE_MAX_CONNECTIONS", 5),
            },
            trading: TradingConfig {
                mode: get_env("TRADING_MODE", "paper"),
            },
            risk: RiskConfig {
                max_position_size_usd: get_env_decimal("RISK_MAX_POSITION_SIZE_USD", "100"),
                max_open_positions: get_env_parsed("RISK_MAX_OPEN_POSITIONS", 1),
                daily_loss_limit_percent: get_env_decimal("RISK_DAILY_LOSS_LIMIT_PERCENT", "2.0"),
                stop_loss_percent: get_env_decimal("RISK_STOP_LOSS_PERCENT", "2.0"),
                max_hold_time_hours: get_env_parsed("RISK_MAX_HOLD_TIME_HOURS", 24),
                min_balance_usd: get_env_decimal("RISK_MIN_BALANCE_USD", "50"),
            },
            strategy: StrategyConfig {
                enabled: get_env_parsed("STRATEGY_ENABLED", false),
                symbol: get_env("STRATEGY_SYMBOL", "BTC-USD"),
                timeframe: get_env("STRATEGY_TIMEFRAME", "1m"),
            },
            market_data: MarketDataConfig {
                retention_days: get_env_parsed("MARKET_DATA_RETENTION_DAYS", 30),
            },
            api: ApiConfig {
                port: get_env_parsed("API_PORT", 8080),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.trading.mode != "paper" && self.trading.mode != "live" {
            return Err(format!(
                "invalid trading mode: {} (must be 'paper' or 'live')",
                self.trading.mode
            ));
        }
        if self.risk.max_position_size_usd <= Decimal::ZERO {
            return Err("max position size must be positive".to_string());
        }
        if self.risk.max_open_positions <= 0 {
            return Err("max open positions must be positive".to_string());
        }
        let hundred = Decimal::from(100);
        if self.risk.daily_loss_limit_percent <= Decimal::ZERO
            || self.risk.daily_loss_limit_percent > hundred
        {
            return Err("daily loss limit must be between 0 and 100".to_string());
        }
        if self.risk.stop_loss_percent <= Decimal::ZERO || self.risk.stop_loss_percent > hundred {
            return Err("stop loss percent must be between 0 and 100".to_string());
        }
        if self.market_data.retention_days <= 0 {
            return Err("market data retention must be positive".to_string());
        }
        if self.database.url.is_empty() {
            return Err("database URL is required".to_string());
        }
        Ok(())
    }

    /// Returns true if running against the simulated exchange
    pub fn is_paper_trading(&self) -> bool {
        self.trading.mode == "paper"
    }
}

fn get_env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_parsed<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_env_decimal(key: &str, default: &str) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str(&v).ok())
        .unwrap_or_else(|| Decimal::from_str(default).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
                max_connections: 5,
            },
            trading: TradingConfig {
                mode: "paper".to_string(),
            },
            risk: RiskConfig {
                max_position_size_usd: dec!(100),
                max_open_positions: 1,
                daily_loss_limit_percent: dec!(2.0),
                stop_loss_percent: dec!(2.0),
                max_hold_time_hours: 24,
                min_balance_usd: dec!(50),
            },
            strategy: StrategyConfig {
                enabled: true,
                symbol: "BTC-USD".to_string(),
                timeframe: "1m".to_string(),
            },
            market_data: MarketDataConfig { retention_days: 30 },
            api: ApiConfig { port: 8080 },
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_invalid_trading_mode() {
        let mut config = base_config();
        config.trading.mode = "yolo".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_position_size() {
        let mut config = base_config();
        config.risk.max_position_size_usd = Decimal::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_loss_limit() {
        let mut config = base_config();
        config.risk.daily_loss_limit_percent = dec!(150);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_retention() {
        let mut config = base_config();
        config.market_data.retention_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_is_paper_trading() {
        assert!(base_config().is_paper_trading());
    }
}
