//! Event Bus
//!
//! Subject-addressed publish/subscribe used by every component. Payloads are
//! JSON objects wrapped in an envelope `{id, type, timestamp, data}`.
//!
//! The engine runs as a single process, so the bus is in-process: one
//! broadcast channel per subject for fan-out subscribers, and one bounded
//! work queue per (subject, queue group) so that each published event is
//! processed by exactly one member of the group. Delivery is best-effort;
//! consumers rely on idempotency keys, not broker guarantees.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

/// Event types, doubling as bus subjects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    PriceUpdate,
    OrderPlaced,
    OrderFilled,
    OrderCancelled,
    OrderFailed,
    TradeSignal,
    TradeOpened,
    TradeClosed,
    RiskViolation,
    KillSwitch,
}

impl EventType {
    pub fn as_subject(&self) -> &'static str {
        match self {
            EventType::PriceUpdate => "market.price.update",
            EventType::OrderPlaced => "order.placed",
            EventType::OrderFilled => "order.filled",
            EventType::OrderCancelled => "order.cancelled",
            EventType::OrderFailed => "order.failed",
            EventType::TradeSignal => "strategy.signal",
            EventType::TradeOpened => "trade.opened",
            EventType::TradeClosed => "trade.closed",
            EventType::RiskViolation => "risk.violation",
            EventType::KillSwitch => "risk.kill_switch",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_subject())
    }
}

/// Base event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    /// Reply subject for request/response exchanges
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

impl Event {
    pub fn new<T: Serialize>(event_type: EventType, data: &T) -> Result<Self, BusError> {
        Ok(Event {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.as_subject().to_string(),
            timestamp: Utc::now(),
            data: serde_json::to_value(data)?,
            reply: None,
        })
    }

    /// Deserialize the payload into a concrete event type
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Bus errors
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Failed to encode event payload: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Queue group '{group}' already bound on subject '{subject}'")]
    QueueGroupBound { subject: String, group: String },

    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),
}

const BROADCAST_CAPACITY: usize = 256;
const QUEUE_CAPACITY: usize = 256;

struct BusInner {
    subjects: HashMap<String, broadcast::Sender<Event>>,
    queues: HashMap<String, Vec<mpsc::Sender<Event>>>,
    bound_groups: HashSet<(String, String)>,
}

/// In-process event bus
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            inner: Mutex::new(BusInner {
                subjects: HashMap::new(),
                queues: HashMap::new(),
                bound_groups: HashSet::new(),
            }),
        }
    }

    /// Publish an event to a subject
    pub fn publish<T: Serialize>(&self, event_type: EventType, data: &T) -> Result<Event, BusError> {
        let event = Event::new(event_type, data)?;
        self.publish_to(event_type.as_subject(), event.clone());
        Ok(event)
    }

    fn publish_to(&self, subject: &str, event: Event) {
        let inner = self.inner.lock().unwrap();

        if let Some(sender) = inner.subjects.get(subject) {
            // No receivers is fine; broadcast only fails when nobody listens.
            let _ = sender.send(event.clone());
        }

        if let Some(groups) = inner.queues.get(subject) {
            for tx in groups {
                if let Err(e) = tx.try_send(event.clone()) {
                    warn!(subject, "Dropped queued event: {}", e);
                }
            }
        }

        debug!(event_id = %event.id, subject, "Published event");
    }

    /// Subscribe to a subject; every subscriber sees every message
    pub fn subscribe(&self, event_type: EventType) -> broadcast::Receiver<Event> {
        self.subscribe_subject(event_type.as_subject())
    }

    fn subscribe_subject(&self, subject: &str) -> broadcast::Receiver<Event> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .subjects
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .subscribe()
    }

    /// Subscribe to a subject as part of a queue group
    ///
    /// Each published event on the subject is delivered to the group's work
    /// queue exactly once. The group is served by a single selector, so it may
    /// be bound only once per process.
    pub fn queue_subscribe(
        &self,
        event_type: EventType,
        group: &str,
    ) -> Result<mpsc::Receiver<Event>, BusError> {
        let subject = event_type.as_subject();
        let mut inner = self.inner.lock().unwrap();

        let key = (subject.to_string(), group.to_string());
        if inner.bound_groups.contains(&key) {
            return Err(BusError::QueueGroupBound {
                subject: subject.to_string(),
                group: group.to_string(),
            });
        }
        inner.bound_groups.insert(key);

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        inner.queues.entry(subject.to_string()).or_default().push(tx);
        Ok(rx)
    }

    /// Publish a request and await the first response on a private reply
    /// subject, bounded by the caller-supplied timeout.
    pub async fn request<T: Serialize>(
        &self,
        event_type: EventType,
        data: &T,
        timeout: Duration,
    ) -> Result<Event, BusError> {
        let reply_subject = format!("_reply.{}", Uuid::new_v4());
        let mut rx = self.subscribe_subject(&reply_subject);

        let mut event = Event::new(event_type, data)?;
        event.reply = Some(reply_subject);
        self.publish_to(event_type.as_subject(), event);

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Ok(response)) => Ok(response),
            _ => Err(BusError::RequestTimeout(timeout)),
        }
    }

    /// Respond to a request event on its reply subject
    pub fn respond<T: Serialize>(&self, request: &Event, data: &T) -> Result<(), BusError> {
        if let Some(reply) = &request.reply {
            let event = Event {
                id: Uuid::new_v4().to_string(),
                event_type: reply.clone(),
                timestamp: Utc::now(),
                data: serde_json::to_value(data)?,
                reply: None,
            };
            self.publish_to(reply, event);
        }
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// Event payloads

/// Price tick fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdateEvent {
    pub exchange: String,
    pub symbol: String,
    pub price: Decimal,
    pub volume: Decimal,
    pub time: DateTime<Utc>,
}

/// Entry or exit signal emitted by the signal engine or the risk gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignalEvent {
    pub id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    pub stop_loss_price: Decimal,
    pub reason: String,
    /// Semantic exit reason for close signals (SIGNAL, MAX_HOLD_TIME, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,
    pub indicators: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlacedEvent {
    pub order_id: String,
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    pub stop_loss_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFilledEvent {
    pub order_id: String,
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: String,
    pub filled_quantity: Decimal,
    pub average_fill_price: Decimal,
    pub fees: Decimal,
    pub filled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOpenedEvent {
    pub trade_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: String,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub entry_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeClosedEvent {
    pub trade_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
    pub exit_reason: String,
    pub exit_time: DateTime<Utc>,
    pub hold_duration_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskViolationEvent {
    pub strategy_id: String,
    pub event_type: String,
    pub description: String,
    pub action_taken: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchEvent {
    pub enabled: bool,
    pub reason: String,
}
