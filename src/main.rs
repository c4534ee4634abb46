mod application;
mod config;
mod domain;
mod events;
mod infrastructure;
mod persistence;
mod task_runner;

use axum::{extract::State, routing::get, Json, Router};
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::application::services::market_data::MarketDataService;
use crate::application::services::order_manager::OrderManager;
use crate::application::services::risk_manager::RiskManager;
use crate::application::services::strategy_engine::StrategyEngine;
use crate::config::Config;
use crate::domain::clock::SystemClock;
use crate::domain::repositories::exchange::Exchange;
use crate::domain::services::mean_reversion::{MeanReversionParams, MeanReversionStrategy};
use crate::events::{EventBus, EventType, KillSwitchEvent, TradeSignalEvent};
use crate::infrastructure::paper_exchange::PaperExchange;
use crate::persistence::repository::{
    BalanceRepository, CandleRepository, ExchangeRepository, OrderRepository, RiskEventRepository,
    StrategyRepository, SystemConfigRepository, TradeRepository,
};
use crate::persistence::{init_database, DbPool};
use crate::task_runner::{run_periodic, CircuitBreakerConfig};

const SIGNAL_QUEUE_GROUP: &str = "trading-engine";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "senga=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(mode = %config.trading.mode, symbol = %config.strategy.symbol, "Starting trading engine");

    // Startup failures are fatal; nothing after this point terminates the
    // process.
    let pool = init_database(&config.database.url).await?;

    if !config.is_paper_trading() {
        return Err("live trading mode requires an exchange connector; set TRADING_MODE=paper".into());
    }

    let exchange = Arc::new(PaperExchange::new("paper", Decimal::from(10_000)));
    let bus = Arc::new(EventBus::new());
    let clock = Arc::new(SystemClock);

    seed_paper_state(&pool, &config).await?;

    let strategy_id = StrategyRepository::new(pool.clone())
        .get_or_create(
            "mean-reversion",
            "mean_reversion",
            &serde_json::json!({
                "sma_period": 20,
                "rsi_period": 14,
                "bb_period": 20,
                "bb_std_dev": 2.0,
                "rsi_oversold": 30.0,
                "rsi_overbought": 70.0,
            }),
            config.strategy.enabled,
        )
        .await?;
    info!(strategy_id = %strategy_id, "Strategy loaded");

    let risk_manager = Arc::new(RiskManager::new(
        config.risk.clone(),
        bus.clone(),
        clock.clone(),
        OrderRepository::new(pool.clone()),
        TradeRepository::new(pool.clone()),
        BalanceRepository::new(pool.clone()),
        RiskEventRepository::new(pool.clone()),
        SystemConfigRepository::new(pool.clone()),
    ));

    let order_manager = Arc::new(OrderManager::new(
        exchange.clone(),
        bus.clone(),
        clock.clone(),
        OrderRepository::new(pool.clone()),
        TradeRepository::new(pool.clone()),
        ExchangeRepository::new(pool.clone()),
        BalanceRepository::new(pool.clone()),
        RiskEventRepository::new(pool.clone()),
    ));

    let market_data = Arc::new(MarketDataService::new(
        exchange.clone(),
        bus.clone(),
        CandleRepository::new(pool.clone()),
        RiskEventRepository::new(pool.clone()),
        clock.clone(),
        vec![config.strategy.symbol.clone()],
    ));

    let params = MeanReversionParams {
        max_position_size_usd: config.risk.max_position_size_usd,
        stop_loss_percent: config.risk.stop_loss_percent,
        ..MeanReversionParams::default()
    };
    let mut strategy_engine = StrategyEngine::new(
        strategy_id,
        config.strategy.symbol.clone(),
        MeanReversionStrategy::new(params),
        bus.clone(),
        TradeRepository::new(pool.clone()),
        CandleRepository::new(pool.clone()),
    );
    strategy_engine.preload_history().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Market data intake
    {
        let market_data = market_data.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = market_data.run(shutdown).await {
                error!("Market data service stopped: {}", e);
            }
        });
    }

    // Paper mode has no live feed: drive the exchange with simulated ticks
    {
        let exchange = exchange.clone();
        let symbol = config.strategy.symbol.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            simulate_price_updates(exchange, symbol, shutdown).await;
        });
    }

    // Signal engine
    if config.strategy.enabled {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            strategy_engine.run(shutdown).await;
        });
    } else {
        warn!("Strategy is DISABLED; enable with STRATEGY_ENABLED=true");
    }

    // Candle flush, at least once per minute
    {
        let market_data = market_data.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let result = run_periodic(
                "candle_flush",
                Duration::from_secs(60),
                CircuitBreakerConfig::default(),
                shutdown,
                move || {
                    let market_data = market_data.clone();
                    async move { market_data.flush_candle_buffers().await }
                },
            )
            .await;
            if let Err(e) = result {
                error!("Candle flush loop gave up: {}", e);
            }
        });
    }

    // Gap detection every five minutes
    {
        let market_data = market_data.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let result = run_periodic(
                "gap_detection",
                Duration::from_secs(300),
                CircuitBreakerConfig::default(),
                shutdown,
                move || {
                    let market_data = market_data.clone();
                    async move { market_data.detect_gaps().await }
                },
            )
            .await;
            if let Err(e) = result {
                error!("Gap detection loop gave up: {}", e);
            }
        });
    }

    // Price-data retention, daily
    {
        let market_data = market_data.clone();
        let shutdown = shutdown_rx.clone();
        let retention_days = config.market_data.retention_days;
        tokio::spawn(async move {
            let result = run_periodic(
                "data_retention",
                Duration::from_secs(24 * 60 * 60),
                CircuitBreakerConfig::default(),
                shutdown,
                move || {
                    let market_data = market_data.clone();
                    async move { market_data.cleanup_old_data(retention_days).await }
                },
            )
            .await;
            if let Err(e) = result {
                error!("Data retention loop gave up: {}", e);
            }
        });
    }

    // Risk supervision every 30 seconds
    {
        let risk_manager = risk_manager.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let result = run_periodic(
                "risk_supervision",
                Duration::from_secs(30),
                CircuitBreakerConfig::default(),
                shutdown,
                move || {
                    let risk_manager = risk_manager.clone();
                    async move { risk_manager.check_open_trades().await }
                },
            )
            .await;
            if let Err(e) = result {
                error!("Risk supervision loop gave up: {}", e);
            }
        });
    }

    // Signal consumer: one queue group so each signal is processed exactly
    // once, gated by risk validation.
    {
        let mut rx = bus.queue_subscribe(EventType::TradeSignal, SIGNAL_QUEUE_GROUP)?;
        let risk_manager = risk_manager.clone();
        let order_manager = order_manager.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    event = rx.recv() => {
                        let Some(event) = event else { return };
                        let signal: TradeSignalEvent = match event.payload() {
                            Ok(signal) => signal,
                            Err(e) => {
                                error!("Failed to decode trade signal: {}", e);
                                continue;
                            }
                        };
                        handle_signal(&risk_manager, &order_manager, signal).await;
                    }
                }
            }
        });
    }

    // Kill-switch watcher, for operator visibility
    {
        let mut rx = bus.subscribe(EventType::KillSwitch);
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match event.payload::<KillSwitchEvent>() {
                    Ok(payload) if payload.enabled => {
                        warn!(reason = %payload.reason, "Kill switch activated!")
                    }
                    Ok(_) => info!("Kill switch deactivated"),
                    Err(e) => error!("Failed to decode kill switch event: {}", e),
                }
            }
        });
    }

    // Health surface
    let app = Router::new()
        .route("/", get(|| async { "SENGA trading engine is running" }))
        .route("/health", get(health_check))
        .with_state(pool.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], config.api.port));
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    let _ = shutdown_tx.send(true);
    if let Err(e) = exchange.close().await {
        error!("Failed to close exchange: {}", e);
    }
    info!("Shutdown complete");

    Ok(())
}

/// Route one signal through the risk gate and into the order manager.
/// Entry (BUY) signals run the full rule set; exit (SELL) signals only honor
/// the kill switch, so positions can still be closed under pressure.
async fn handle_signal(
    risk_manager: &Arc<RiskManager>,
    order_manager: &Arc<OrderManager>,
    signal: TradeSignalEvent,
) {
    info!(
        signal_id = %signal.id,
        symbol = %signal.symbol,
        side = %signal.side,
        reason = %signal.reason,
        "Received trade signal"
    );

    if signal.side == "BUY" {
        if let Err(violation) = risk_manager.validate_trade_signal(&signal).await {
            warn!("Trade signal rejected by risk gate: {}", violation);
            return;
        }
    } else if risk_manager.is_kill_switch_enabled().await {
        warn!(signal_id = %signal.id, "Dropping exit signal: kill switch is enabled");
        return;
    }

    if let Err(e) = order_manager.place_order(&signal).await {
        error!(signal_id = %signal.id, "Failed to place order: {}", e);
    }
}

/// Random-walk price feed for the paper exchange, one tick per second.
/// Each tick moves the price by up to +/- $25 and fans out through the
/// exchange's subscribed tick channels.
async fn simulate_price_updates(
    exchange: Arc<PaperExchange>,
    symbol: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let base_price = Decimal::from(45_000);
    let mut price = base_price;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    info!(symbol = %symbol, start_price = %price, "Price simulator started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("Price simulator stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        let (change, volume) = {
            let mut rng = rand::thread_rng();
            (
                Decimal::from_f64((rng.gen::<f64>() - 0.5) * 50.0).unwrap_or(Decimal::ZERO),
                Decimal::from_f64(rng.gen::<f64>()).unwrap_or(Decimal::ZERO),
            )
        };

        price += change;
        if price <= Decimal::ZERO {
            price = base_price;
        }

        exchange.update_price(&symbol, price, volume);
    }
}

/// Seed the paper exchange registry row and starting balance on first run
async fn seed_paper_state(pool: &DbPool, _config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    ExchangeRepository::new(pool.clone())
        .get_or_create("paper", true)
        .await?;

    let balances = BalanceRepository::new(pool.clone());
    if balances.portfolio_value().await?.is_zero() {
        balances
            .upsert(
                "paper",
                "USD",
                Decimal::from(10_000),
                Decimal::ZERO,
                chrono::Utc::now(),
            )
            .await?;
        info!("Paper trading balance initialized: $10,000 USD");
    }

    Ok(())
}

async fn health_check(State(pool): State<DbPool>) -> Json<HashMap<String, serde_json::Value>> {
    let db_ok = sqlx::query("SELECT 1").execute(&pool).await.is_ok();

    let mut response = HashMap::new();
    response.insert("status".to_string(), serde_json::json!("running"));
    response.insert("database".to_string(), serde_json::json!(db_ok));
    Json(response)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
