//! Wire payloads. Everything the broker sends is parsed here, once, into
//! the typed domain shapes; nothing downstream touches raw JSON.

use crate::domain::ports::{BrokerOrder, DepthLevel, NetPosition, OrderStatusWire, Quote};
use crate::domain::trading::types::{OrderKind, Product, Side};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub status: String,
    pub data: Option<T>,
    pub message: Option<String>,
    pub error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OrderIdData {
    pub order_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireOrder {
    pub order_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub status_message_raw: Option<String>,
    #[serde(default)]
    pub order_type: String,
    #[serde(default)]
    pub transaction_type: String,
    #[serde(default)]
    pub tradingsymbol: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub filled_quantity: i64,
    #[serde(default)]
    pub average_price: f64,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub trigger_price: f64,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub order_timestamp: Option<String>,
    #[serde(default)]
    pub exchange_timestamp: Option<String>,
}

fn dec(v: f64) -> Decimal {
    Decimal::from_f64_retain(v).unwrap_or_default()
}

/// Broker timestamps are exchange-local "YYYY-MM-DD HH:MM:SS".
fn parse_broker_ts(raw: &str, tz_offset_min: i32) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok()?;
    let offset_ms = (tz_offset_min as i64) * 60 * 1000;
    Some(naive.and_utc().timestamp_millis() - offset_ms)
}

impl WireOrder {
    /// `None` when the payload is not usable (unknown status or side);
    /// such updates are logged and dropped at the boundary, never guessed.
    pub fn into_broker_order(self, tz_offset_min: i32) -> Option<BrokerOrder> {
        let status = OrderStatusWire::parse(&self.status)?;
        let side = Side::from_str(&self.transaction_type).ok()?;
        let kind = OrderKind::from_str(&self.order_type).ok()?;
        Some(BrokerOrder {
            order_id: self.order_id,
            status,
            status_message: self.status_message,
            status_message_raw: self.status_message_raw,
            kind,
            side,
            tradingsymbol: self.tradingsymbol,
            exchange: self.exchange,
            quantity: self.quantity,
            filled_quantity: self.filled_quantity,
            average_price: dec(self.average_price),
            price: dec(self.price),
            trigger_price: dec(self.trigger_price),
            tag: self.tag,
            order_timestamp: self
                .order_timestamp
                .as_deref()
                .and_then(|t| parse_broker_ts(t, tz_offset_min)),
            exchange_timestamp: self
                .exchange_timestamp
                .as_deref()
                .and_then(|t| parse_broker_ts(t, tz_offset_min)),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct WirePosition {
    #[serde(default)]
    pub instrument_token: u32,
    #[serde(default)]
    pub tradingsymbol: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub average_price: f64,
}

impl WirePosition {
    pub fn into_net_position(self) -> Option<NetPosition> {
        let product = match self.product.as_str() {
            "MIS" => Product::Mis,
            "NRML" => Product::Nrml,
            // CNC and friends are cash-delivery; this engine never opens
            // them, and reconciliation must not adopt them either.
            _ => return None,
        };
        Some(NetPosition {
            instrument_token: self.instrument_token,
            tradingsymbol: self.tradingsymbol,
            exchange: self.exchange,
            product,
            quantity: self.quantity,
            average_price: dec(self.average_price),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct WirePositions {
    #[serde(default)]
    pub net: Vec<WirePosition>,
    #[serde(default)]
    pub day: Vec<WirePosition>,
}

#[derive(Debug, Deserialize)]
pub struct WireDepthLevel {
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct WireDepth {
    #[serde(default)]
    pub buy: Vec<WireDepthLevel>,
    #[serde(default)]
    pub sell: Vec<WireDepthLevel>,
}

#[derive(Debug, Deserialize)]
pub struct WireQuote {
    #[serde(default)]
    pub last_price: f64,
    #[serde(default)]
    pub depth: Option<WireDepth>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl WireQuote {
    pub fn into_quote(self, tz_offset_min: i32) -> Quote {
        let (buy_depth, sell_depth) = match self.depth {
            Some(depth) => (
                depth
                    .buy
                    .into_iter()
                    .map(|l| DepthLevel { price: dec(l.price), quantity: l.quantity })
                    .collect(),
                depth
                    .sell
                    .into_iter()
                    .map(|l| DepthLevel { price: dec(l.price), quantity: l.quantity })
                    .collect(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        Quote {
            last_price: dec(self.last_price),
            buy_depth,
            sell_depth,
            timestamp: self
                .timestamp
                .as_deref()
                .and_then(|t| parse_broker_ts(t, tz_offset_min)),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WireLtp {
    #[serde(default)]
    pub last_price: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec as d;

    #[test]
    fn test_wire_order_parses_trigger_pending() {
        let raw = r#"{
            "order_id": "230801000123456",
            "status": "TRIGGER PENDING",
            "order_type": "SL-M",
            "transaction_type": "SELL",
            "tradingsymbol": "NIFTY24AUG24800CE",
            "exchange": "NFO",
            "quantity": 50,
            "filled_quantity": 0,
            "average_price": 0,
            "price": 0,
            "trigger_price": 88.0,
            "tag": "T9b2f4c6a1d3e4f5a8bS",
            "order_timestamp": "2024-08-01 10:15:22"
        }"#;
        let wire: WireOrder = serde_json::from_str(raw).unwrap();
        let order = wire.into_broker_order(330).unwrap();
        assert_eq!(order.status, OrderStatusWire::TriggerPending);
        assert_eq!(order.kind, OrderKind::SlM);
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.trigger_price, d!(88));
        assert!(order.order_timestamp.is_some());
    }

    #[test]
    fn test_wire_order_unknown_status_dropped() {
        let raw = r#"{
            "order_id": "1",
            "status": "PUT ORDER REQ RECEIVED",
            "order_type": "LIMIT",
            "transaction_type": "BUY"
        }"#;
        let wire: WireOrder = serde_json::from_str(raw).unwrap();
        assert!(wire.into_broker_order(330).is_none());
    }

    #[test]
    fn test_wire_position_filters_cash_products() {
        let mis = WirePosition {
            instrument_token: 1,
            tradingsymbol: "X".into(),
            exchange: "NFO".into(),
            product: "MIS".into(),
            quantity: 50,
            average_price: 100.0,
        };
        assert!(mis.into_net_position().is_some());

        let cnc = WirePosition {
            instrument_token: 1,
            tradingsymbol: "X".into(),
            exchange: "NSE".into(),
            product: "CNC".into(),
            quantity: 10,
            average_price: 100.0,
        };
        assert!(cnc.into_net_position().is_none());
    }

    #[test]
    fn test_wire_quote_depth_mapping() {
        let raw = r#"{
            "last_price": 100.0,
            "depth": {
                "buy": [{"price": 99.95, "quantity": 300}],
                "sell": [{"price": 100.05, "quantity": 250}]
            },
            "timestamp": "2024-08-01 10:15:22"
        }"#;
        let wire: WireQuote = serde_json::from_str(raw).unwrap();
        let quote = wire.into_quote(330);
        assert_eq!(quote.best_bid(), Some(d!(99.95)));
        assert_eq!(quote.best_ask(), Some(d!(100.05)));
        assert!(quote.timestamp.is_some());
    }

    #[test]
    fn test_broker_ts_offset() {
        // 10:15:22 IST == 04:45:22 UTC
        let ms = parse_broker_ts("2024-08-01 10:15:22", 330).unwrap();
        let utc = chrono::DateTime::from_timestamp_millis(ms).unwrap();
        assert_eq!(utc.format("%H:%M:%S").to_string(), "04:45:22");
    }
}
