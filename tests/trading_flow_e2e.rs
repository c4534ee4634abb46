//! End-to-end trading flow scenarios over the in-process bus, an in-memory
//! store, and the paper exchange.

use chrono::{Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;

use senga::application::services::market_data::MarketDataService;
use senga::application::services::order_manager::OrderManager;
use senga::application::services::risk_manager::RiskManager;
use senga::application::services::strategy_engine::StrategyEngine;
use senga::config::RiskConfig;
use senga::domain::clock::{Clock, FixedClock, SystemClock};
use senga::domain::entities::order::{Order, OrderSide, OrderStatus, OrderType};
use senga::domain::entities::trade::{ExitReason, Trade, TradeSide};
use senga::domain::errors::RiskViolationKind;
use senga::domain::repositories::exchange::{Exchange, PriceUpdate};
use senga::domain::services::mean_reversion::{MeanReversionParams, MeanReversionStrategy};
use senga::events::{EventBus, EventType, TradeSignalEvent};
use senga::infrastructure::paper_exchange::PaperExchange;
use senga::persistence::repository::{
    BalanceRepository, CandleRepository, CandleUpsert, ExchangeRepository, OrderRepository,
    RiskEventRepository, StrategyRepository, SystemConfigRepository, TradeRepository,
};
use senga::persistence::{init_database, DbPool};

struct Harness {
    pool: DbPool,
    bus: Arc<EventBus>,
    exchange: Arc<PaperExchange>,
    risk_manager: Arc<RiskManager>,
    order_manager: Arc<OrderManager>,
    strategy_id: String,
}

fn risk_config() -> RiskConfig {
    RiskConfig {
        max_position_size_usd: dec!(100),
        max_open_positions: 1,
        daily_loss_limit_percent: dec!(2.0),
        stop_loss_percent: dec!(2.0),
        max_hold_time_hours: 24,
        min_balance_usd: dec!(50),
    }
}

async fn harness_with_clock(clock: Arc<dyn Clock>) -> Harness {
    let pool = init_database("sqlite::memory:").await.unwrap();
    let bus = Arc::new(EventBus::new());
    let exchange = Arc::new(PaperExchange::new("paper", dec!(10000)));

    ExchangeRepository::new(pool.clone())
        .get_or_create("paper", true)
        .await
        .unwrap();
    let strategy_id = StrategyRepository::new(pool.clone())
        .get_or_create("mean-reversion", "mean_reversion", &serde_json::json!({}), true)
        .await
        .unwrap();

    let risk_manager = Arc::new(RiskManager::new(
        risk_config(),
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
        clock,
        OrderRepository::new(pool.clone()),
        TradeRepository::new(pool.clone()),
        ExchangeRepository::new(pool.clone()),
        BalanceRepository::new(pool.clone()),
        RiskEventRepository::new(pool.clone()),
    ));

    Harness {
        pool,
        bus,
        exchange,
        risk_manager,
        order_manager,
        strategy_id,
    }
}

async fn harness() -> Harness {
    harness_with_clock(Arc::new(SystemClock)).await
}

fn entry_signal(strategy_id: &str, price: f64) -> TradeSignalEvent {
    let price_dec = Decimal::try_from(price).unwrap();
    let mut indicators = HashMap::new();
    indicators.insert("price".to_string(), price);
    TradeSignalEvent {
        id: "sig-entry".to_string(),
        strategy_id: strategy_id.to_string(),
        symbol: "BTC-USD".to_string(),
        side: "BUY".to_string(),
        order_type: "MARKET".to_string(),
        quantity: (dec!(100) / price_dec).round_dp(8),
        price: None,
        stop_loss_price: price_dec * dec!(0.98),
        reason: "Mean reversion LONG".to_string(),
        exit_reason: None,
        indicators,
    }
}

/// Scenario: happy-path LONG entry through signal engine, risk gate, and
/// order manager.
#[tokio::test]
async fn happy_path_long_entry() {
    let h = harness().await;
    h.exchange.update_price("BTC-USD", dec!(43000), dec!(1));

    // Preload an oversold buffer, then deliver one tick at 43 000
    let mut engine = StrategyEngine::new(
        h.strategy_id.clone(),
        "BTC-USD".to_string(),
        MeanReversionStrategy::new(MeanReversionParams::default()),
        h.bus.clone(),
        TradeRepository::new(h.pool.clone()),
        CandleRepository::new(h.pool.clone()),
    );

    let candles = CandleRepository::new(h.pool.clone());
    let base = Utc::now() - Duration::minutes(40);
    let mut closes: Vec<Decimal> = (0..30).map(|_| dec!(50000)).collect();
    closes.extend([dec!(49500), dec!(48500), dec!(47000), dec!(45000)]);
    for (i, close) in closes.iter().enumerate() {
        candles
            .upsert(&CandleUpsert {
                time: base + Duration::minutes(i as i64),
                exchange: "paper".to_string(),
                symbol: "BTC-USD".to_string(),
                interval: "1m".to_string(),
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: dec!(1),
            })
            .await
            .unwrap();
    }
    engine.preload_history().await;

    let mut signal_rx = h
        .bus
        .queue_subscribe(EventType::TradeSignal, "trading-engine")
        .unwrap();

    engine
        .on_price_update(&senga::events::PriceUpdateEvent {
            exchange: "paper".to_string(),
            symbol: "BTC-USD".to_string(),
            price: dec!(43000),
            volume: dec!(1),
            time: Utc::now(),
        })
        .await;

    let event = signal_rx.recv().await.unwrap();
    let signal: TradeSignalEvent = event.payload().unwrap();
    assert_eq!(signal.side, "BUY");
    assert_eq!(signal.quantity, dec!(0.00232558));
    assert_eq!(signal.stop_loss_price, dec!(42140.00));

    // Queue consumer: risk gate then order manager
    h.risk_manager.validate_trade_signal(&signal).await.unwrap();
    let order_id = h.order_manager.place_order(&signal).await.unwrap();

    let order = OrderRepository::new(h.pool.clone())
        .get(&order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, "FILLED");

    let trades = TradeRepository::new(h.pool.clone());
    let trade = trades
        .latest_open_for(&h.strategy_id, "BTC-USD")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(trade.side, "LONG");
    assert!(trade.exit_time.is_none());
}

/// Scenario: a stop-loss nearly 7% below entry is more than double the
/// configured 2% and is rejected with an audit row and no order.
#[tokio::test]
async fn risk_reject_stop_loss_too_wide() {
    let h = harness().await;
    h.exchange.update_price("BTC-USD", dec!(43000), dec!(1));

    let mut signal = entry_signal(&h.strategy_id, 43000.0);
    signal.stop_loss_price = dec!(40000);

    let violation = h
        .risk_manager
        .validate_trade_signal(&signal)
        .await
        .unwrap_err();
    assert_eq!(violation.kind, RiskViolationKind::StopLossTooWide);

    assert_eq!(
        RiskEventRepository::new(h.pool.clone())
            .count_by_type("STOP_LOSS_TOO_WIDE")
            .await
            .unwrap(),
        1
    );
    let orders: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(orders.0, 0);
}

/// Scenario: the identical signal submitted twice produces one order row and
/// one order.placed event.
#[tokio::test]
async fn idempotent_double_submission() {
    let h = harness().await;
    h.exchange.update_price("BTC-USD", dec!(43000), dec!(1));
    let mut placed_rx = h.bus.subscribe(EventType::OrderPlaced);

    let signal = entry_signal(&h.strategy_id, 43000.0);
    let first = h.order_manager.place_order(&signal).await.unwrap();
    let second = h.order_manager.place_order(&signal).await.unwrap();
    assert_eq!(first, second);

    let orders: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(orders.0, 1);

    assert!(placed_rx.recv().await.is_ok());
    assert!(placed_rx.try_recv().is_err());
}

/// Scenario: a -300 realised loss on a 10 000 portfolio breaches the 2%
/// daily limit; the next signal trips the kill switch, cancels outstanding
/// orders, and every later validation rejects.
#[tokio::test]
async fn kill_switch_trip_on_daily_loss() {
    let h = harness().await;

    BalanceRepository::new(h.pool.clone())
        .upsert("paper", "USD", dec!(10000), dec!(0), Utc::now())
        .await
        .unwrap();

    // Seed a closed losing trade entered today
    let orders = OrderRepository::new(h.pool.clone());
    let trades = TradeRepository::new(h.pool.clone());
    let exchange_id = ExchangeRepository::new(h.pool.clone())
        .get_or_create("paper", true)
        .await
        .unwrap();
    orders
        .create(
            &Order::new(
                "o-seed".to_string(),
                "c-seed".to_string(),
                exchange_id.clone(),
                h.strategy_id.clone(),
                "BTC-USD".to_string(),
                OrderSide::Buy,
                OrderType::Market,
                dec!(0.002),
                None,
                Some(dec!(42000)),
                Utc::now(),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    orders
        .update_execution(
            "o-seed",
            OrderStatus::Filled,
            Some("ex-seed"),
            dec!(0.002),
            Some(dec!(43000)),
            Decimal::ZERO,
            Utc::now(),
        )
        .await
        .unwrap();
    trades
        .open_trade(&Trade {
            id: "t-seed".to_string(),
            entry_order_id: "o-seed".to_string(),
            exit_order_id: None,
            strategy_id: h.strategy_id.clone(),
            symbol: "BTC-USD".to_string(),
            side: TradeSide::Long,
            entry_price: dec!(43000),
            quantity: dec!(0.002),
            entry_time: Utc::now(),
            exit_price: None,
            exit_time: None,
            pnl: None,
            pnl_percent: None,
            fees_total: Decimal::ZERO,
            hold_duration_secs: None,
            exit_reason: None,
        })
        .await
        .unwrap();
    trades
        .close_trade(
            "t-seed",
            "o-seed",
            dec!(42000),
            Utc::now(),
            dec!(-300),
            dec!(-3),
            Decimal::ZERO,
            60,
            ExitReason::Signal,
        )
        .await
        .unwrap();

    // A PENDING order that must be swept up by the kill switch
    orders
        .create(
            &Order::new(
                "o-pending".to_string(),
                "c-pending".to_string(),
                exchange_id,
                h.strategy_id.clone(),
                "BTC-USD".to_string(),
                OrderSide::Buy,
                OrderType::Market,
                dec!(0.001),
                None,
                Some(dec!(42000)),
                Utc::now(),
            )
            .unwrap(),
        )
        .await
        .unwrap();

    let mut kill_rx = h.bus.subscribe(EventType::KillSwitch);

    let violation = h
        .risk_manager
        .validate_trade_signal(&entry_signal(&h.strategy_id, 43000.0))
        .await
        .unwrap_err();
    assert_eq!(violation.kind, RiskViolationKind::DailyLossLimit);

    let status = h.risk_manager.kill_switch_status().await;
    assert!(status.enabled);
    assert!(status
        .reason
        .as_deref()
        .unwrap()
        .starts_with("Daily loss limit exceeded"));

    // Pending orders swept to CANCELLED in one statement
    assert_eq!(
        orders.count_with_status(OrderStatus::Pending).await.unwrap(),
        0
    );
    assert_eq!(
        orders.count_with_status(OrderStatus::Open).await.unwrap(),
        0
    );
    assert_eq!(
        orders
            .count_with_status(OrderStatus::Cancelled)
            .await
            .unwrap(),
        1
    );

    let event = kill_rx.recv().await.unwrap();
    let payload: senga::events::KillSwitchEvent = event.payload().unwrap();
    assert!(payload.enabled);

    // Every subsequent validation rejects until disabled
    let violation = h
        .risk_manager
        .validate_trade_signal(&entry_signal(&h.strategy_id, 43000.0))
        .await
        .unwrap_err();
    assert_eq!(violation.kind, RiskViolationKind::KillSwitch);
}

/// Scenario: ticks at 10:00:15, 10:00:45, and 10:01:02 roll exactly one
/// candle; a later flush persists the in-progress one.
#[tokio::test]
async fn candle_roll_and_flush() {
    let pool = init_database("sqlite::memory:").await.unwrap();
    let bus = Arc::new(EventBus::new());
    let exchange = Arc::new(PaperExchange::new("paper", dec!(10000)));
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 15).unwrap();

    let service = Arc::new(MarketDataService::new(
        exchange,
        bus,
        CandleRepository::new(pool.clone()),
        RiskEventRepository::new(pool.clone()),
        Arc::new(FixedClock(t0 + Duration::minutes(3))),
        vec!["BTC-USD".to_string()],
    ));

    let tick = |price: Decimal, volume: Decimal, at| PriceUpdate {
        exchange: "paper".to_string(),
        symbol: "BTC-USD".to_string(),
        price,
        volume,
        timestamp: at,
    };

    service.handle_tick(tick(dec!(100), dec!(2), t0)).await;
    service
        .handle_tick(tick(dec!(110), dec!(3), t0 + Duration::seconds(30)))
        .await;
    service
        .handle_tick(tick(dec!(105), dec!(1), t0 + Duration::seconds(47)))
        .await;

    let candles = CandleRepository::new(pool.clone());
    let bucket1 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
    let rows = candles
        .range("BTC-USD", "1m", bucket1, bucket1 + Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].open().unwrap(), dec!(100));
    assert_eq!(rows[0].high().unwrap(), dec!(110));
    assert_eq!(rows[0].low().unwrap(), dec!(100));
    assert_eq!(rows[0].close().unwrap(), dec!(110));
    assert_eq!(rows[0].volume().unwrap(), dec!(5));

    // The 10:01 bucket is still in memory until the periodic flush
    let bucket2 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 1, 0).unwrap();
    assert!(candles
        .range("BTC-USD", "1m", bucket2, bucket2 + Duration::seconds(30))
        .await
        .unwrap()
        .is_empty());

    service.flush_candle_buffers().await.unwrap();

    let rows = candles
        .range("BTC-USD", "1m", bucket2, bucket2 + Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].open().unwrap(), dec!(105));
}

/// Scenario: a trade held for 25 hours against a 24-hour bound gets an
/// opposite-side close signal and a risk event from the supervisor.
#[tokio::test]
async fn max_hold_closeout() {
    let h = harness().await;

    let exchange_id = ExchangeRepository::new(h.pool.clone())
        .get_or_create("paper", true)
        .await
        .unwrap();
    OrderRepository::new(h.pool.clone())
        .create(
            &Order::new(
                "o-old".to_string(),
                "c-old".to_string(),
                exchange_id,
                h.strategy_id.clone(),
                "BTC-USD".to_string(),
                OrderSide::Buy,
                OrderType::Market,
                dec!(0.002),
                None,
                Some(dec!(42000)),
                Utc::now(),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    TradeRepository::new(h.pool.clone())
        .open_trade(&Trade {
            id: "t-old".to_string(),
            entry_order_id: "o-old".to_string(),
            exit_order_id: None,
            strategy_id: h.strategy_id.clone(),
            symbol: "BTC-USD".to_string(),
            side: TradeSide::Long,
            entry_price: dec!(43000),
            quantity: dec!(0.002),
            entry_time: Utc::now() - Duration::hours(25),
            exit_price: None,
            exit_time: None,
            pnl: None,
            pnl_percent: None,
            fees_total: Decimal::ZERO,
            hold_duration_secs: None,
            exit_reason: None,
        })
        .await
        .unwrap();

    let mut signal_rx = h
        .bus
        .queue_subscribe(EventType::TradeSignal, "trading-engine")
        .unwrap();

    h.risk_manager.check_open_trades().await.unwrap();

    let event = signal_rx.recv().await.unwrap();
    let signal: TradeSignalEvent = event.payload().unwrap();
    assert_eq!(signal.side, "SELL");
    assert_eq!(signal.quantity, dec!(0.002));
    assert_eq!(signal.reason, "MAX_HOLD_TIME");
    assert_eq!(signal.exit_reason.as_deref(), Some("MAX_HOLD_TIME"));

    assert_eq!(
        RiskEventRepository::new(h.pool.clone())
            .count_by_type("MAX_HOLD_TIME")
            .await
            .unwrap(),
        1
    );

    // Feeding the close signal through the consumer path closes the trade
    // with the carried exit reason.
    h.exchange.update_price("BTC-USD", dec!(43500), dec!(1));
    h.exchange
        .place_order(&senga::domain::repositories::exchange::OrderRequest {
            symbol: "BTC-USD".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: dec!(0.002),
            price: None,
            stop_loss_price: None,
        })
        .await
        .unwrap();
    h.order_manager.place_order(&signal).await.unwrap();

    let closed = TradeRepository::new(h.pool.clone())
        .get("t-old")
        .await
        .unwrap()
        .unwrap();
    assert!(closed.exit_time.is_some());
    assert_eq!(closed.exit_reason.as_deref(), Some("MAX_HOLD_TIME"));
    assert!(closed.pnl().unwrap().is_some());
}

/// Law: a LONG round trip with zero fees at an unchanged price has exactly
/// zero P&L, end to end through the store.
#[tokio::test]
async fn pnl_round_trip_is_exact() {
    let h = harness().await;
    let trades = TradeRepository::new(h.pool.clone());
    let exchange_id = ExchangeRepository::new(h.pool.clone())
        .get_or_create("paper", true)
        .await
        .unwrap();

    for (order_id, client_id) in [("o-in", "c-in"), ("o-out", "c-out")] {
        OrderRepository::new(h.pool.clone())
            .create(
                &Order::new(
                    order_id.to_string(),
                    client_id.to_string(),
                    exchange_id.clone(),
                    h.strategy_id.clone(),
                    "BTC-USD".to_string(),
                    OrderSide::Buy,
                    OrderType::Market,
                    dec!(0.00232558),
                    None,
                    Some(dec!(42140)),
                    Utc::now(),
                )
                .unwrap(),
            )
            .await
            .unwrap();
    }

    trades
        .open_trade(&Trade {
            id: "t-flat".to_string(),
            entry_order_id: "o-in".to_string(),
            exit_order_id: None,
            strategy_id: h.strategy_id.clone(),
            symbol: "BTC-USD".to_string(),
            side: TradeSide::Long,
            entry_price: dec!(43000.12345678),
            quantity: dec!(0.00232558),
            entry_time: Utc::now(),
            exit_price: None,
            exit_time: None,
            pnl: None,
            pnl_percent: None,
            fees_total: Decimal::ZERO,
            hold_duration_secs: None,
            exit_reason: None,
        })
        .await
        .unwrap();

    let (pnl, pnl_percent) = senga::domain::entities::trade::realized_pnl(
        TradeSide::Long,
        dec!(43000.12345678),
        dec!(43000.12345678),
        dec!(0.00232558),
        Decimal::ZERO,
    );
    assert_eq!(pnl, Decimal::ZERO);

    trades
        .close_trade(
            "t-flat",
            "o-out",
            dec!(43000.12345678),
            Utc::now(),
            pnl,
            pnl_percent,
            Decimal::ZERO,
            1,
            ExitReason::Signal,
        )
        .await
        .unwrap();

    let closed = trades.get("t-flat").await.unwrap().unwrap();
    assert_eq!(closed.pnl().unwrap(), Some(Decimal::ZERO));
}
