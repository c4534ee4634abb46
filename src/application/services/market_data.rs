//! Market-Data Pipeline
//!
//! Turns the exchange tick stream into broadcast `market.price.update`
//! events and a persisted 1-minute OHLCV series with exactly one row per
//! (symbol, minute). A single intake task drains the tick channel, so every
//! candle buffer has one writer. Candle persistence never blocks the tick
//! path: failed saves are parked and retried by the periodic flush.

use chrono::{DateTime, Duration, DurationRound, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::domain::clock::Clock;
use crate::domain::repositories::exchange::{Exchange, PriceUpdate};
use crate::events::{EventBus, EventType, PriceUpdateEvent};
use crate::persistence::repository::{CandleRepository, CandleUpsert, RiskEventRepository};

const CANDLE_INTERVAL: &str = "1m";

/// Cached last tick per symbol
#[derive(Debug, Clone)]
pub struct PriceCacheEntry {
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    /// Older than one minute at read time
    pub stale: bool,
}

/// In-progress candle for one (symbol, minute)
#[derive(Debug, Clone)]
struct CandleBuffer {
    symbol: String,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    bucket_start: DateTime<Utc>,
}

impl CandleBuffer {
    fn to_upsert(&self, exchange: &str) -> CandleUpsert {
        CandleUpsert {
            time: self.bucket_start,
            exchange: exchange.to_string(),
            symbol: self.symbol.clone(),
            interval: CANDLE_INTERVAL.to_string(),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

#[derive(Default)]
struct AggregationState {
    buffers: HashMap<String, CandleBuffer>,
    /// Completed candles whose save failed, retried on the next flush
    pending: Vec<CandleBuffer>,
}

/// Market data service: tick ingress, candle aggregation, gap detection,
/// price cache
pub struct MarketDataService {
    exchange: Arc<dyn Exchange>,
    bus: Arc<EventBus>,
    candles: CandleRepository,
    risk_events: RiskEventRepository,
    clock: Arc<dyn Clock>,
    symbols: Vec<String>,
    price_cache: RwLock<HashMap<String, PriceCacheEntry>>,
    state: Mutex<AggregationState>,
}

impl MarketDataService {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        bus: Arc<EventBus>,
        candles: CandleRepository,
        risk_events: RiskEventRepository,
        clock: Arc<dyn Clock>,
        symbols: Vec<String>,
    ) -> Self {
        MarketDataService {
            exchange,
            bus,
            candles,
            risk_events,
            clock,
            symbols,
            price_cache: RwLock::new(HashMap::new()),
            state: Mutex::new(AggregationState::default()),
        }
    }

    /// Subscribe to the exchange feed and run the intake loop until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), String> {
        let (tx, mut rx) = mpsc::channel::<PriceUpdate>(1024);
        self.exchange
            .subscribe_price_updates(&self.symbols, tx)
            .await
            .map_err(|e| format!("failed to subscribe to price updates: {}", e))?;

        info!(symbols = ?self.symbols, "Market data service started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Market data service stopping");
                    return Ok(());
                }
                update = rx.recv() => {
                    match update {
                        Some(update) => self.handle_tick(update).await,
                        None => {
                            warn!("Price feed closed");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Process one tick: cache, candle buffer, price.update fan-out
    pub async fn handle_tick(&self, update: PriceUpdate) {
        {
            let mut cache = self.price_cache.write().unwrap();
            cache.insert(
                update.symbol.clone(),
                PriceCacheEntry {
                    price: update.price,
                    timestamp: update.timestamp,
                    stale: false,
                },
            );
        }

        if let Some(completed) = self.add_to_candle_buffer(&update) {
            self.persist_candle(completed).await;
        }

        let event = PriceUpdateEvent {
            exchange: update.exchange.clone(),
            symbol: update.symbol.clone(),
            price: update.price,
            volume: update.volume,
            time: update.timestamp,
        };
        if let Err(e) = self.bus.publish(EventType::PriceUpdate, &event) {
            error!("Failed to publish price update: {}", e);
        }

        debug!(symbol = %update.symbol, price = %update.price, "Price update processed");
    }

    /// Fold the tick into its minute bucket. Returns the previous buffer when
    /// the tick starts a new bucket.
    fn add_to_candle_buffer(&self, update: &PriceUpdate) -> Option<CandleBuffer> {
        let bucket_start = match update.timestamp.duration_trunc(Duration::minutes(1)) {
            Ok(t) => t,
            Err(e) => {
                error!(symbol = %update.symbol, "Failed to truncate tick timestamp: {}", e);
                return None;
            }
        };

        let mut state = self.state.lock().unwrap();

        if let Some(buffer) = state.buffers.get_mut(&update.symbol) {
            if buffer.bucket_start == bucket_start {
                if update.price > buffer.high {
                    buffer.high = update.price;
                }
                if update.price < buffer.low {
                    buffer.low = update.price;
                }
                buffer.close = update.price;
                buffer.volume += update.volume;
                return None;
            }
        }

        // New bucket: replace the buffer and hand back the completed one
        state.buffers.insert(
            update.symbol.clone(),
            CandleBuffer {
                symbol: update.symbol.clone(),
                open: update.price,
                high: update.price,
                low: update.price,
                close: update.price,
                volume: update.volume,
                bucket_start,
            },
        )
    }

    async fn persist_candle(&self, buffer: CandleBuffer) {
        let upsert = buffer.to_upsert(self.exchange.name());
        if let Err(e) = self.candles.upsert(&upsert).await {
            error!(symbol = %buffer.symbol, "Failed to save candle: {}", e);
            let mut state = self.state.lock().unwrap();
            state.pending.push(buffer);
        }
    }

    /// Persist every pending candle and every buffer at least one minute
    /// old, so no in-progress candle is lost when ticks stop arriving.
    /// Runs at least once per minute.
    pub async fn flush_candle_buffers(&self) -> Result<(), String> {
        let cutoff = self.clock.now() - Duration::minutes(1);

        let due: Vec<CandleBuffer> = {
            let mut state = self.state.lock().unwrap();
            let mut due: Vec<CandleBuffer> = state.pending.drain(..).collect();
            let expired: Vec<String> = state
                .buffers
                .iter()
                .filter(|(_, b)| b.bucket_start <= cutoff)
                .map(|(symbol, _)| symbol.clone())
                .collect();
            for symbol in expired {
                if let Some(buffer) = state.buffers.remove(&symbol) {
                    due.push(buffer);
                }
            }
            due
        };

        let mut first_error = None;
        for buffer in due {
            let upsert = buffer.to_upsert(self.exchange.name());
            if let Err(e) = self.candles.upsert(&upsert).await {
                error!(symbol = %buffer.symbol, "Flush failed, will retry: {}", e);
                if first_error.is_none() {
                    first_error = Some(e.to_string());
                }
                let mut state = self.state.lock().unwrap();
                state.pending.push(buffer);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Check each subscribed symbol for a stretch with no persisted candles
    /// and record a warning-level risk event. Backfill is out of scope.
    pub async fn detect_gaps(&self) -> Result<(), String> {
        for symbol in &self.symbols {
            let last = match self.candles.latest_time(symbol, CANDLE_INTERVAL).await {
                Ok(last) => last,
                Err(e) => {
                    error!(symbol, "Failed to get latest candle time: {}", e);
                    continue;
                }
            };

            let Some(last) = last else { continue };

            let gap = self.clock.now() - last;
            if gap > Duration::minutes(5) {
                warn!(symbol, last_time = %last, gap_secs = gap.num_seconds(), "Gap detected in price data");
                if let Err(e) = self
                    .risk_events
                    .create(
                        None,
                        "PRICE_DATA_GAP",
                        &format!(
                            "No price data for {} in {} seconds",
                            symbol,
                            gap.num_seconds()
                        ),
                        "Gap logged",
                        &serde_json::json!({"symbol": symbol}),
                        self.clock.now(),
                    )
                    .await
                {
                    error!("Failed to log gap risk event: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Delete candles older than the retention window. Runs daily.
    pub async fn cleanup_old_data(&self, retention_days: i64) -> Result<(), String> {
        let cutoff = self.clock.now() - Duration::days(retention_days);
        match self.candles.delete_older_than(cutoff).await {
            Ok(rows) => {
                info!(cutoff = %cutoff, rows, "Old price data cleaned up");
                Ok(())
            }
            Err(e) => Err(format!("failed to cleanup old data: {}", e)),
        }
    }

    /// Last tick for a symbol. Entries older than one minute are flagged
    /// stale but still returned.
    pub fn latest_price(&self, symbol: &str) -> Option<PriceCacheEntry> {
        let cache = self.price_cache.read().unwrap();
        cache.get(symbol).map(|entry| {
            let mut entry = entry.clone();
            if self.clock.now() - entry.timestamp > Duration::minutes(1) {
                warn!(symbol, "Price data is stale");
                entry.stale = true;
            }
            entry
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::FixedClock;
    use crate::infrastructure::paper_exchange::PaperExchange;
    use crate::persistence::init_database;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    async fn service(clock: Arc<dyn Clock>) -> Arc<MarketDataService> {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let exchange = Arc::new(PaperExchange::new("paper", dec!(10000)));
        let bus = Arc::new(EventBus::new());
        Arc::new(MarketDataService::new(
            exchange,
            bus,
            CandleRepository::new(pool.clone()),
            RiskEventRepository::new(pool),
            clock,
            vec!["BTC-USD".to_string()],
        ))
    }

    fn tick(price: Decimal, volume: Decimal, timestamp: DateTime<Utc>) -> PriceUpdate {
        PriceUpdate {
            exchange: "paper".to_string(),
            symbol: "BTC-USD".to_string(),
            price,
            volume,
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_candle_roll_persists_completed_bucket() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 15).unwrap();
        let clock = Arc::new(FixedClock(t0));
        let service = service(clock).await;

        service.handle_tick(tick(dec!(100), dec!(1), t0)).await;
        service
            .handle_tick(tick(dec!(110), dec!(2), t0 + Duration::seconds(30)))
            .await;
        // Crossing into 10:01 rolls the 10:00 bucket
        service
            .handle_tick(tick(dec!(105), dec!(1), t0 + Duration::seconds(47)))
            .await;

        let start = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let rows = service
            .candles
            .range("BTC-USD", "1m", start, start + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time, start);
        assert_eq!(rows[0].open().unwrap(), dec!(100));
        assert_eq!(rows[0].high().unwrap(), dec!(110));
        assert_eq!(rows[0].low().unwrap(), dec!(100));
        assert_eq!(rows[0].close().unwrap(), dec!(110));
        assert_eq!(rows[0].volume().unwrap(), dec!(3));
    }

    #[tokio::test]
    async fn test_flush_persists_stale_buffer() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 1, 2).unwrap();
        let service = service(Arc::new(FixedClock(
            t0 + Duration::minutes(2),
        )))
        .await;

        service.handle_tick(tick(dec!(105), dec!(1), t0)).await;

        // Nothing persisted yet: the bucket is still in memory
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 10, 1, 0).unwrap();
        let rows = service
            .candles
            .range("BTC-USD", "1m", start, start + Duration::minutes(1))
            .await
            .unwrap();
        assert!(rows.is_empty());

        service.flush_candle_buffers().await.unwrap();

        let rows = service
            .candles
            .range("BTC-USD", "1m", start, start + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].open().unwrap(), dec!(105));
    }

    #[tokio::test]
    async fn test_flush_keeps_fresh_buffer() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 1, 2).unwrap();
        let service = service(Arc::new(FixedClock(t0 + Duration::seconds(10)))).await;

        service.handle_tick(tick(dec!(105), dec!(1), t0)).await;
        service.flush_candle_buffers().await.unwrap();

        let start = Utc.with_ymd_and_hms(2025, 6, 1, 10, 1, 0).unwrap();
        let rows = service
            .candles
            .range("BTC-USD", "1m", start, start + Duration::minutes(1))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_price_update_event_published() {
        let t0 = Utc::now();
        let service = service(Arc::new(FixedClock(t0))).await;
        let mut rx = service.bus.subscribe(EventType::PriceUpdate);

        service.handle_tick(tick(dec!(43000), dec!(0.5), t0)).await;

        let event = rx.recv().await.unwrap();
        let payload: PriceUpdateEvent = event.payload().unwrap();
        assert_eq!(payload.symbol, "BTC-USD");
        assert_eq!(payload.price, dec!(43000));
    }

    #[tokio::test]
    async fn test_price_cache_staleness() {
        let t0 = Utc::now();
        let service = service(Arc::new(FixedClock(t0 + Duration::minutes(2)))).await;

        service.handle_tick(tick(dec!(43000), dec!(0.5), t0)).await;

        let entry = service.latest_price("BTC-USD").unwrap();
        assert_eq!(entry.price, dec!(43000));
        assert!(entry.stale);
        assert!(service.latest_price("ETH-USD").is_none());
    }

    #[tokio::test]
    async fn test_gap_detection_records_risk_event() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 15).unwrap();
        let service = service(Arc::new(FixedClock(t0 + Duration::minutes(10)))).await;

        // One persisted candle ten minutes in the past
        service.handle_tick(tick(dec!(100), dec!(1), t0)).await;
        service.flush_candle_buffers().await.unwrap();

        service.detect_gaps().await.unwrap();
        assert_eq!(
            service
                .risk_events
                .count_by_type("PRICE_DATA_GAP")
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_cleanup_old_data_respects_retention() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let service = service(Arc::new(FixedClock(now))).await;

        for age_days in [1, 40] {
            service
                .candles
                .upsert(&crate::persistence::repository::CandleUpsert {
                    time: now - Duration::days(age_days),
                    exchange: "paper".to_string(),
                    symbol: "BTC-USD".to_string(),
                    interval: "1m".to_string(),
                    open: dec!(100),
                    high: dec!(100),
                    low: dec!(100),
                    close: dec!(100),
                    volume: dec!(1),
                })
                .await
                .unwrap();
        }

        service.cleanup_old_data(30).await.unwrap();

        let remaining = service
            .candles
            .range("BTC-USD", "1m", now - Duration::days(60), now)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].time, now - Duration::days(1));
    }

    #[tokio::test]
    async fn test_no_gap_event_without_history() {
        let service = service(Arc::new(FixedClock(Utc::now()))).await;
        service.detect_gaps().await.unwrap();
        assert_eq!(
            service
                .risk_events
                .count_by_type("PRICE_DATA_GAP")
                .await
                .unwrap(),
            0
        );
    }
}
