//! Feed wire codec
//!
//! Turns one raw text frame into at most one `OrderBookUpdate`, or a control
//! event for the connection manager. Decoding a frame never has side effects
//! beyond reading the local clock.
//!
//! Book frames look like:
//! `{"channel":"l2Book","data":{"coin":"BTC","time":1700000000000,"levels":[[{"px":"97000.0","sz":"1.2","n":3}],[...]]}}`

use std::collections::HashSet;

use lobrec_schema::{OrderBookUpdate, PriceLevel};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::LocalClock;
use crate::error::DecodeError;

pub const L2_BOOK_CHANNEL: &str = "l2Book";

/// Plain-text banner some servers send right after the handshake.
pub const GREETING: &str = "Websocket connection established.";

/// One (instrument, channel) feed subscription, in its wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(rename = "type")]
    pub channel: String,
    #[serde(rename = "coin")]
    pub instrument: String,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, instrument: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            instrument: instrument.into(),
        }
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel, self.instrument)
    }
}

/// `{"method":"subscribe","subscription":{"type":"l2Book","coin":"BTC"}}`
pub fn subscribe_request(subscription: &Subscription) -> String {
    serde_json::json!({
        "method": "subscribe",
        "subscription": subscription,
    })
    .to_string()
}

/// App-level keepalive, answered by `{"channel":"pong"}`.
pub fn ping_request() -> String {
    serde_json::json!({"method": "ping"}).to_string()
}

/// Non-data frames, routed back to the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Pong,
    Greeting,
    SubscribeAck(Subscription),
    FeedError(String),
    /// Any channel this recorder does not persist (trades, unsubscribe acks, ...).
    Other(String),
}

impl ControlEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlEvent::Pong => "pong",
            ControlEvent::Greeting => "greeting",
            ControlEvent::SubscribeAck(_) => "subscribe_ack",
            ControlEvent::FeedError(_) => "error",
            ControlEvent::Other(_) => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Update(OrderBookUpdate),
    Control(ControlEvent),
    /// Well-formed book for an instrument outside the configured set.
    Unconfigured { instrument: String },
}

pub struct WireCodec {
    instruments: HashSet<String>,
    channels: HashSet<String>,
}

impl WireCodec {
    pub fn new<I, C>(instruments: I, channels: C) -> Self
    where
        I: IntoIterator<Item = String>,
        C: IntoIterator<Item = String>,
    {
        Self {
            instruments: instruments.into_iter().collect(),
            channels: channels.into_iter().collect(),
        }
    }

    pub fn decode(&self, raw: &str, clock: &mut LocalClock) -> Result<Decoded, DecodeError> {
        if raw.trim() == GREETING {
            return Ok(Decoded::Control(ControlEvent::Greeting));
        }

        let json: Value = serde_json::from_str(raw)?;
        let channel = json
            .get("channel")
            .ok_or(DecodeError::MissingField("channel"))?
            .as_str()
            .ok_or_else(|| invalid("channel", "not a string"))?;

        match channel {
            "pong" => Ok(Decoded::Control(ControlEvent::Pong)),
            "subscriptionResponse" => decode_subscription_response(&json),
            "error" => {
                let text = match json.get("data") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                Ok(Decoded::Control(ControlEvent::FeedError(text)))
            }
            L2_BOOK_CHANNEL if self.channels.contains(L2_BOOK_CHANNEL) => {
                self.decode_book(&json, clock)
            }
            other => Ok(Decoded::Control(ControlEvent::Other(other.to_string()))),
        }
    }

    fn decode_book(&self, json: &Value, clock: &mut LocalClock) -> Result<Decoded, DecodeError> {
        let data = json.get("data").ok_or(DecodeError::MissingField("data"))?;

        let instrument = data
            .get("coin")
            .ok_or(DecodeError::MissingField("coin"))?
            .as_str()
            .ok_or_else(|| invalid("coin", "not a string"))?;

        let exchange_time = data
            .get("time")
            .ok_or(DecodeError::MissingField("time"))?
            .as_i64()
            .ok_or_else(|| invalid("time", "not an integer"))?;
        if exchange_time < 0 {
            return Err(invalid("time", "negative"));
        }

        let levels = data
            .get("levels")
            .ok_or(DecodeError::MissingField("levels"))?
            .as_array()
            .ok_or_else(|| invalid("levels", "not an array"))?;
        if levels.len() != 2 {
            return Err(invalid(
                "levels",
                format!("expected [bids, asks], got {} sides", levels.len()),
            ));
        }
        let bids = decode_side(&levels[0], "levels[0]")?;
        let asks = decode_side(&levels[1], "levels[1]")?;

        if !self.instruments.contains(instrument) {
            return Ok(Decoded::Unconfigured {
                instrument: instrument.to_string(),
            });
        }

        Ok(Decoded::Update(OrderBookUpdate::new(
            instrument,
            L2_BOOK_CHANNEL,
            exchange_time,
            clock.now_micros(),
            bids,
            asks,
        )))
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> DecodeError {
    DecodeError::InvalidField {
        field,
        reason: reason.into(),
    }
}

fn decode_subscription_response(json: &Value) -> Result<Decoded, DecodeError> {
    let data = json.get("data").ok_or(DecodeError::MissingField("data"))?;
    let method = data.get("method").and_then(Value::as_str).unwrap_or_default();
    if method != "subscribe" {
        return Ok(Decoded::Control(ControlEvent::Other(format!(
            "subscriptionResponse:{}",
            method
        ))));
    }
    let subscription = data
        .get("subscription")
        .ok_or(DecodeError::MissingField("subscription"))?;
    let subscription: Subscription = serde_json::from_value(subscription.clone())?;
    Ok(Decoded::Control(ControlEvent::SubscribeAck(subscription)))
}

fn decode_side(side: &Value, field: &'static str) -> Result<Vec<PriceLevel>, DecodeError> {
    let entries = side
        .as_array()
        .ok_or_else(|| invalid(field, "not an array"))?;
    entries.iter().map(|entry| decode_level(entry, field)).collect()
}

fn decode_level(entry: &Value, field: &'static str) -> Result<PriceLevel, DecodeError> {
    let price = decimal(entry.get("px"), "px")?;
    let size = decimal(entry.get("sz"), "sz")?;
    let order_count = entry
        .get("n")
        .ok_or(DecodeError::MissingField("n"))?
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| invalid("n", "not a non-negative 32-bit integer"))?;

    let level = PriceLevel::new(price, size, order_count);
    if !level.is_valid() {
        return Err(invalid(
            field,
            format!("invalid level px={} sz={}", price, size),
        ));
    }
    Ok(level)
}

/// Prices and sizes arrive as decimal strings; plain JSON numbers are accepted too.
fn decimal(value: Option<&Value>, field: &'static str) -> Result<f64, DecodeError> {
    match value {
        None => Err(DecodeError::MissingField(field)),
        Some(Value::String(s)) => s
            .parse::<f64>()
            .map_err(|e| invalid(field, format!("{}: {:?}", e, s))),
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| invalid(field, "not a float")),
        Some(other) => Err(invalid(field, format!("unexpected {}", other))),
    }
}
