use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn flipped(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for long, -1 for short. Signed P&L math uses this.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(format!("unknown transaction type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Product {
    Mis,
    Nrml,
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Product::Mis => write!(f, "MIS"),
            Product::Nrml => write!(f, "NRML"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Validity {
    Day,
    Ioc,
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validity::Day => write!(f, "DAY"),
            Validity::Ioc => write!(f, "IOC"),
        }
    }
}

/// Broker-level order type. `Sl` is a stoploss-limit (trigger + limit price),
/// `SlM` is a stoploss-market (trigger only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    Sl,
    SlM,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKind::Market => write!(f, "MARKET"),
            OrderKind::Limit => write!(f, "LIMIT"),
            OrderKind::Sl => write!(f, "SL"),
            OrderKind::SlM => write!(f, "SL-M"),
        }
    }
}

impl std::str::FromStr for OrderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MARKET" => Ok(OrderKind::Market),
            "LIMIT" => Ok(OrderKind::Limit),
            "SL" => Ok(OrderKind::Sl),
            "SL-M" => Ok(OrderKind::SlM),
            other => Err(format!("unknown order type: {}", other)),
        }
    }
}

/// Which leg of a trade an order belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderRole {
    Entry,
    Sl,
    Tp1,
    Target,
    PanicExit,
    BrokerSquareoff,
}

impl OrderRole {
    /// Single-letter code used in the broker order tag.
    pub fn code(&self) -> char {
        match self {
            OrderRole::Entry => 'E',
            OrderRole::Sl => 'S',
            OrderRole::Target => 'T',
            OrderRole::PanicExit => 'P',
            OrderRole::Tp1 => '1',
            OrderRole::BrokerSquareoff => 'Q',
        }
    }

    pub fn is_exit_leg(&self) -> bool {
        !matches!(self, OrderRole::Entry)
    }
}

impl fmt::Display for OrderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderRole::Entry => write!(f, "ENTRY"),
            OrderRole::Sl => write!(f, "SL"),
            OrderRole::Tp1 => write!(f, "TP1"),
            OrderRole::Target => write!(f, "TARGET"),
            OrderRole::PanicExit => write!(f, "PANIC_EXIT"),
            OrderRole::BrokerSquareoff => write!(f, "BROKER_SQUAREOFF"),
        }
    }
}

impl std::str::FromStr for OrderRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTRY" => Ok(OrderRole::Entry),
            "SL" => Ok(OrderRole::Sl),
            "TP1" => Ok(OrderRole::Tp1),
            "TARGET" => Ok(OrderRole::Target),
            "PANIC_EXIT" => Ok(OrderRole::PanicExit),
            "BROKER_SQUAREOFF" => Ok(OrderRole::BrokerSquareoff),
            other => Err(format!("unknown order role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptType {
    Ce,
    Pe,
}

impl fmt::Display for OptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptType::Ce => write!(f, "CE"),
            OptType::Pe => write!(f, "PE"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionMeta {
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub opt_type: OptType,
    pub delta: Option<Decimal>,
    pub gamma: Option<Decimal>,
    pub vega: Option<Decimal>,
    pub theta: Option<Decimal>,
    pub iv_pts: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub exchange: String,
    pub tradingsymbol: String,
    pub segment: String,
    pub lot_size: i64,
    pub tick_size: Decimal,
    /// Broker freeze quantity: max qty per single order for this contract.
    pub freeze_qty: Option<i64>,
}

impl Instrument {
    pub fn quote_key(&self) -> String {
        format!("{}:{}", self.exchange, self.tradingsymbol)
    }

    pub fn is_option(&self) -> bool {
        self.segment.ends_with("-OPT")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
    pub ts: i64,
    pub interval_min: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub instrument_token: u32,
    pub last_price: Decimal,
    pub ts: i64,
}

/// Strategy-layer input. Produced outside this crate, consumed by
/// `TradeManager::on_signal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub instrument_token: u32,
    pub side: Side,
    /// 0..=100
    pub confidence: Decimal,
    pub strategy_id: String,
    pub strategy_style: String,
    pub regime: String,
    pub candle: Candle,
    pub interval_min: u32,
    pub underlying_token: Option<u32>,
    /// Strategy-proposed stop; subject to the SL quality gate and plan overlay.
    pub stop_loss: Option<Decimal>,
    pub target: Option<Decimal>,
}

/// One closed quantity slice of a trade (TP1 leg, runner, panic exit ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlLeg {
    pub role: OrderRole,
    pub qty: i64,
    pub price: Decimal,
    pub pnl_inr: Decimal,
    pub at: i64,
}

// ===== Price helpers =====

/// Round to the nearest multiple of `tick`. Falls back to the input when the
/// tick is zero or negative: bad instrument data must not corrupt prices.
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    ((price / tick).round() * tick).normalize()
}

/// Round down (toward negative infinity) to a tick multiple.
pub fn floor_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    ((price / tick).floor() * tick).normalize()
}

pub fn bps_of(price: Decimal, bps: Decimal) -> Decimal {
    price * bps / Decimal::from(10_000)
}
