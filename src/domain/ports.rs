//! Outbound ports. The engine only ever talks to the broker and the alert
//! channel through these traits; infrastructure provides the adapters.

use crate::domain::errors::BrokerError;
use crate::domain::trading::types::{OrderKind, Product, Side, Validity};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Broker order lifecycle status, parsed once at the adapter boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatusWire {
    Open,
    TriggerPending,
    Triggered,
    ModifyPending,
    Partial,
    Complete,
    Cancelled,
    Rejected,
    Lapsed,
}

impl OrderStatusWire {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatusWire::Complete
                | OrderStatusWire::Cancelled
                | OrderStatusWire::Rejected
                | OrderStatusWire::Lapsed
        )
    }

    /// Coarse progression rank used to drop regressions after a terminal
    /// status. Pre-terminal regressions (MODIFY_PENDING -> OPEN) are accepted
    /// as-is; only "less progressed than a known terminal" is filtered.
    pub fn rank(&self) -> u8 {
        match self {
            OrderStatusWire::Open => 1,
            OrderStatusWire::TriggerPending => 1,
            OrderStatusWire::ModifyPending => 1,
            OrderStatusWire::Triggered => 2,
            OrderStatusWire::Partial => 3,
            OrderStatusWire::Complete => 4,
            OrderStatusWire::Cancelled => 4,
            OrderStatusWire::Rejected => 4,
            OrderStatusWire::Lapsed => 4,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "OPEN" => Some(OrderStatusWire::Open),
            "TRIGGER PENDING" => Some(OrderStatusWire::TriggerPending),
            "TRIGGERED" => Some(OrderStatusWire::Triggered),
            "MODIFY PENDING" => Some(OrderStatusWire::ModifyPending),
            "PARTIAL" => Some(OrderStatusWire::Partial),
            "COMPLETE" => Some(OrderStatusWire::Complete),
            "CANCELLED" => Some(OrderStatusWire::Cancelled),
            "REJECTED" => Some(OrderStatusWire::Rejected),
            "LAPSED" => Some(OrderStatusWire::Lapsed),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            OrderStatusWire::Open => "OPEN",
            OrderStatusWire::TriggerPending => "TRIGGER PENDING",
            OrderStatusWire::Triggered => "TRIGGERED",
            OrderStatusWire::ModifyPending => "MODIFY PENDING",
            OrderStatusWire::Partial => "PARTIAL",
            OrderStatusWire::Complete => "COMPLETE",
            OrderStatusWire::Cancelled => "CANCELLED",
            OrderStatusWire::Rejected => "REJECTED",
            OrderStatusWire::Lapsed => "LAPSED",
        }
    }
}

/// Normalized broker order record; also the shape of a postback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub order_id: String,
    pub status: OrderStatusWire,
    pub status_message: Option<String>,
    pub status_message_raw: Option<String>,
    pub kind: OrderKind,
    pub side: Side,
    pub tradingsymbol: String,
    pub exchange: String,
    pub quantity: i64,
    pub filled_quantity: i64,
    pub average_price: Decimal,
    pub price: Decimal,
    pub trigger_price: Decimal,
    pub tag: Option<String>,
    pub order_timestamp: Option<i64>,
    pub exchange_timestamp: Option<i64>,
}

impl BrokerOrder {
    pub fn pending_quantity(&self) -> i64 {
        (self.quantity - self.filled_quantity).max(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetPosition {
    pub instrument_token: u32,
    pub tradingsymbol: String,
    pub exchange: String,
    pub product: Product,
    /// Signed: positive long, negative short.
    pub quantity: i64,
    pub average_price: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionsSnapshot {
    pub net: Vec<NetPosition>,
    pub day: Vec<NetPosition>,
}

impl PositionsSnapshot {
    pub fn net_qty_by_token(&self) -> HashMap<u32, i64> {
        let mut out = HashMap::new();
        for p in &self.net {
            *out.entry(p.instrument_token).or_insert(0) += p.quantity;
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub last_price: Decimal,
    pub buy_depth: Vec<DepthLevel>,
    pub sell_depth: Vec<DepthLevel>,
    pub timestamp: Option<i64>,
}

impl Quote {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.buy_depth.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.sell_depth.first().map(|l| l.price)
    }

    pub fn spread_bps(&self) -> Option<Decimal> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        let mid = (bid + ask) / Decimal::TWO;
        if mid <= Decimal::ZERO {
            return None;
        }
        Some((ask - bid) / mid * Decimal::from(10_000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Variety {
    Regular,
    Amo,
}

impl Variety {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Variety::Regular => "regular",
            Variety::Amo => "amo",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderParams {
    pub exchange: String,
    pub tradingsymbol: String,
    pub side: Side,
    pub quantity: i64,
    pub product: Product,
    pub kind: OrderKind,
    pub validity: Validity,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub tag: Option<String>,
    pub market_protection: Option<Decimal>,
}

#[derive(Debug, Clone, Default)]
pub struct ModifyParams {
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub quantity: Option<i64>,
    pub kind: Option<OrderKind>,
}

#[derive(Debug, Clone)]
pub struct ConvertPositionParams {
    pub exchange: String,
    pub tradingsymbol: String,
    pub side: Side,
    pub quantity: i64,
    pub old_product: Product,
    pub new_product: Product,
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn place_order(&self, variety: Variety, params: OrderParams) -> BrokerResult<String>;
    async fn modify_order(
        &self,
        variety: Variety,
        order_id: &str,
        patch: ModifyParams,
    ) -> BrokerResult<String>;
    async fn cancel_order(&self, variety: Variety, order_id: &str) -> BrokerResult<String>;
    async fn orders(&self) -> BrokerResult<Vec<BrokerOrder>>;
    async fn order_history(&self, order_id: &str) -> BrokerResult<Vec<BrokerOrder>>;
    async fn positions(&self) -> BrokerResult<PositionsSnapshot>;
    async fn quote(&self, keys: &[String]) -> BrokerResult<HashMap<String, Quote>>;
    async fn ltp(&self, keys: &[String]) -> BrokerResult<HashMap<String, Decimal>>;
    async fn convert_position(&self, params: ConvertPositionParams) -> BrokerResult<()>;
}

/// One routable option contract for a signal on an underlying.
#[derive(Debug, Clone)]
pub struct OptionCandidate {
    pub instrument_token: u32,
    pub instrument: crate::domain::trading::types::Instrument,
    pub meta: crate::domain::trading::types::OptionMeta,
}

/// Instrument catalog + option picker. Universe construction lives outside
/// this crate; the engine only asks for a token's instrument or the ranked
/// contracts for an underlying.
#[async_trait]
pub trait OptionRouter: Send + Sync {
    async fn instrument(
        &self,
        token: u32,
    ) -> anyhow::Result<Option<crate::domain::trading::types::Instrument>>;
    /// Ranked candidates (ATM first) for a directional signal.
    async fn candidates(
        &self,
        underlying_token: u32,
        side: Side,
    ) -> anyhow::Result<Vec<OptionCandidate>>;
}

/// Adaptive optimizer verdict for a symbol x strategy x regime key.
#[derive(Debug, Clone)]
pub struct Advice {
    pub confidence_mult: Decimal,
    pub qty_mult: Decimal,
    pub blocked: bool,
    pub reason: Option<String>,
}

impl Default for Advice {
    fn default() -> Self {
        Self {
            confidence_mult: Decimal::ONE,
            qty_mult: Decimal::ONE,
            blocked: false,
            reason: None,
        }
    }
}

#[async_trait]
pub trait EdgeAdvisor: Send + Sync {
    async fn evaluate(&self, strategy_id: &str, symbol: &str, regime: &str) -> Advice;
}

/// Default advisor: no adjustment. The real optimizer lives in the
/// telemetry stack outside this crate.
pub struct NoopAdvisor;

#[async_trait]
impl EdgeAdvisor for NoopAdvisor {
    async fn evaluate(&self, _strategy_id: &str, _symbol: &str, _regime: &str) -> Advice {
        Advice::default()
    }
}

/// Alert fan-out. Channel wiring (chat, mail, pager) lives outside; the
/// default sink logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    KillSwitch,
    Halt,
    WatchdogFire,
    Slippage,
    Rejection,
    DailyStop,
    Recovery,
}

pub trait AlertSink: Send + Sync {
    fn alert(&self, kind: AlertKind, message: &str);
}

pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, kind: AlertKind, message: &str) {
        match kind {
            AlertKind::KillSwitch | AlertKind::Halt | AlertKind::DailyStop => {
                tracing::error!("ALERT [{:?}] {}", kind, message)
            }
            _ => tracing::warn!("ALERT [{:?}] {}", kind, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_parse_wire_names() {
        assert_eq!(
            OrderStatusWire::parse("TRIGGER PENDING"),
            Some(OrderStatusWire::TriggerPending)
        );
        assert_eq!(OrderStatusWire::parse("COMPLETE"), Some(OrderStatusWire::Complete));
        assert_eq!(OrderStatusWire::parse("complete"), None);
        for s in [
            OrderStatusWire::Open,
            OrderStatusWire::TriggerPending,
            OrderStatusWire::Triggered,
            OrderStatusWire::ModifyPending,
            OrderStatusWire::Partial,
            OrderStatusWire::Complete,
            OrderStatusWire::Cancelled,
            OrderStatusWire::Rejected,
            OrderStatusWire::Lapsed,
        ] {
            assert_eq!(OrderStatusWire::parse(s.as_wire()), Some(s));
        }
    }

    #[test]
    fn test_terminal_ranks_dominate() {
        assert!(OrderStatusWire::Complete.rank() > OrderStatusWire::Open.rank());
        assert!(OrderStatusWire::Cancelled.rank() > OrderStatusWire::Partial.rank());
        assert!(!OrderStatusWire::TriggerPending.is_terminal());
        assert!(OrderStatusWire::Lapsed.is_terminal());
    }

    #[test]
    fn test_quote_spread_bps() {
        let q = Quote {
            last_price: dec!(100),
            buy_depth: vec![DepthLevel { price: dec!(99.95), quantity: 100 }],
            sell_depth: vec![DepthLevel { price: dec!(100.05), quantity: 120 }],
            timestamp: None,
        };
        let spread = q.spread_bps().unwrap();
        assert!(spread > dec!(9.9) && spread < dec!(10.1), "spread={}", spread);
    }

    #[test]
    fn test_net_qty_by_token_sums() {
        let snap = PositionsSnapshot {
            net: vec![
                NetPosition {
                    instrument_token: 1,
                    tradingsymbol: "A".into(),
                    exchange: "NFO".into(),
                    product: Product::Mis,
                    quantity: 50,
                    average_price: dec!(10),
                },
                NetPosition {
                    instrument_token: 1,
                    tradingsymbol: "A".into(),
                    exchange: "NFO".into(),
                    product: Product::Nrml,
                    quantity: -20,
                    average_price: dec!(10),
                },
            ],
            day: vec![],
        };
        assert_eq!(snap.net_qty_by_token().get(&1), Some(&30));
    }
}
