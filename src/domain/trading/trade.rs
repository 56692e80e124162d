use crate::domain::trading::state_machine::TradeStatus;
use crate::domain::trading::types::{
    Instrument, OptionMeta, OrderKind, OrderRole, PnlLeg, Product, Side,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The primary entity: one trade from signal acceptance to flat.
///
/// Mutated only by the TradeManager task, persisted through the TradeStore
/// on every meaningful change, immutable once CLOSED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    // Identity & instrument
    pub trade_id: String,
    pub instrument_token: u32,
    pub instrument: Instrument,
    pub side: Side,
    pub qty: i64,
    pub initial_qty: i64,
    pub underlying_token: Option<u32>,
    pub option_meta: Option<OptionMeta>,

    // Prices
    pub expected_entry_price: Option<Decimal>,
    pub entry_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub initial_stop_loss: Option<Decimal>,
    pub sl_trigger: Option<Decimal>,
    pub sl_limit_price: Option<Decimal>,
    pub target_price: Option<Decimal>,
    pub planned_target_price: Option<Decimal>,
    pub tp1_price: Option<Decimal>,
    pub exit_price: Option<Decimal>,

    // Order references
    pub entry_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub sl_order_type: Option<OrderKind>,
    pub target_order_id: Option<String>,
    pub target_order_type: Option<OrderKind>,
    pub tp1_order_id: Option<String>,
    pub panic_exit_order_id: Option<String>,
    pub exit_order_id: Option<String>,
    pub exit_order_role: Option<OrderRole>,

    // Scale-out
    pub tp1_qty: i64,
    pub runner_qty: i64,
    pub tp1_done: bool,
    pub tp1_aborted: bool,
    pub tp1_filled_qty: i64,
    pub pnl_legs: Vec<PnlLeg>,

    // Risk & edge
    pub risk_inr: Option<Decimal>,
    pub risk_pts: Option<Decimal>,
    pub rr: Option<Decimal>,
    pub est_charges_inr: Option<Decimal>,
    pub min_green_inr: Option<Decimal>,
    pub min_green_pts: Option<Decimal>,
    pub entry_slippage_bps: Option<Decimal>,
    pub entry_slippage_inr: Option<Decimal>,
    pub exit_slippage_bps: Option<Decimal>,
    pub exit_slippage_inr: Option<Decimal>,
    pub peak_ltp: Option<Decimal>,
    pub be_locked: bool,
    pub trail_sl: bool,

    // State
    pub status: TradeStatus,
    pub close_reason: Option<String>,
    pub exit_reason: Option<String>,
    pub last_event: Option<String>,
    pub last_event_at: Option<i64>,
    #[serde(default)]
    pub last_event_meta: Value,

    // Lifecycle timestamps (epoch ms)
    pub decision_at: i64,
    pub entry_at: Option<i64>,
    pub entry_filled_at: Option<i64>,
    pub exit_at: Option<i64>,
    pub closed_at: Option<i64>,
    pub updated_at: i64,

    // Flags captured at entry
    pub target_virtual: bool,
    pub dyn_exit_disabled: bool,
    pub entry_finalized: bool,
    pub product: Product,

    // Signal provenance
    pub strategy_id: String,
    pub strategy_style: String,
    pub regime: String,
    pub confidence: Decimal,
}

impl Trade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trade_id: String,
        instrument_token: u32,
        instrument: Instrument,
        side: Side,
        qty: i64,
        expected_entry_price: Decimal,
        stop_loss: Decimal,
        product: Product,
        strategy_id: String,
        strategy_style: String,
        regime: String,
        confidence: Decimal,
        now_ms: i64,
    ) -> Self {
        Self {
            trade_id,
            instrument_token,
            instrument,
            side,
            qty,
            initial_qty: qty,
            underlying_token: None,
            option_meta: None,
            expected_entry_price: Some(expected_entry_price),
            entry_price: None,
            stop_loss: Some(stop_loss),
            initial_stop_loss: Some(stop_loss),
            sl_trigger: None,
            sl_limit_price: None,
            target_price: None,
            planned_target_price: None,
            tp1_price: None,
            exit_price: None,
            entry_order_id: None,
            sl_order_id: None,
            sl_order_type: None,
            target_order_id: None,
            target_order_type: None,
            tp1_order_id: None,
            panic_exit_order_id: None,
            exit_order_id: None,
            exit_order_role: None,
            tp1_qty: 0,
            runner_qty: 0,
            tp1_done: false,
            tp1_aborted: false,
            tp1_filled_qty: 0,
            pnl_legs: Vec::new(),
            risk_inr: None,
            risk_pts: None,
            rr: None,
            est_charges_inr: None,
            min_green_inr: None,
            min_green_pts: None,
            entry_slippage_bps: None,
            entry_slippage_inr: None,
            exit_slippage_bps: None,
            exit_slippage_inr: None,
            peak_ltp: None,
            be_locked: false,
            trail_sl: false,
            status: TradeStatus::EntryPlaced,
            close_reason: None,
            exit_reason: None,
            last_event: None,
            last_event_at: None,
            last_event_meta: Value::Null,
            decision_at: now_ms,
            entry_at: None,
            entry_filled_at: None,
            exit_at: None,
            closed_at: None,
            updated_at: now_ms,
            target_virtual: false,
            dyn_exit_disabled: false,
            entry_finalized: false,
            product,
            strategy_id,
            strategy_style,
            regime,
            confidence,
        }
    }

    /// Signed P&L in rupees at `price` for the currently open quantity.
    pub fn open_pnl_at(&self, price: Decimal) -> Option<Decimal> {
        let entry = self.entry_price?;
        Some((price - entry) * self.side.sign() * Decimal::from(self.qty))
    }

    /// Points of favorable excursion at `price` (positive means in profit).
    pub fn favorable_pts(&self, price: Decimal) -> Option<Decimal> {
        let entry = self.entry_price?;
        Some((price - entry) * self.side.sign())
    }

    /// Realized P&L accumulated across closed legs.
    pub fn realized_pnl(&self) -> Decimal {
        self.pnl_legs.iter().map(|l| l.pnl_inr).sum()
    }

    /// A desired stop respecting BE-lock monotonicity: once locked, the SL
    /// may only move in the profit-favorable direction.
    pub fn clamp_sl_monotone(&self, proposed: Decimal) -> Decimal {
        let Some(current) = self.stop_loss else {
            return proposed;
        };
        if !self.be_locked {
            return proposed;
        }
        match self.side {
            Side::Buy => proposed.max(current),
            Side::Sell => proposed.min(current),
        }
    }

    /// Exit side for any protective or panic leg.
    pub fn exit_side(&self) -> Side {
        self.side.flipped()
    }

    pub fn record_event(&mut self, event: &str, meta: Value, now_ms: i64) {
        self.last_event = Some(event.to_string());
        self.last_event_at = Some(now_ms);
        self.last_event_meta = meta;
        self.updated_at = now_ms;
    }

    pub fn order_id_for_role(&self, role: OrderRole) -> Option<&str> {
        match role {
            OrderRole::Entry => self.entry_order_id.as_deref(),
            OrderRole::Sl => self.sl_order_id.as_deref(),
            OrderRole::Tp1 => self.tp1_order_id.as_deref(),
            OrderRole::Target => self.target_order_id.as_deref(),
            OrderRole::PanicExit => self.panic_exit_order_id.as_deref(),
            OrderRole::BrokerSquareoff => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn sample_trade(side: Side) -> Trade {
        let instrument = Instrument {
            exchange: "NFO".to_string(),
            tradingsymbol: "NIFTY24AUG24800CE".to_string(),
            segment: "NFO-OPT".to_string(),
            lot_size: 25,
            tick_size: dec!(0.05),
            freeze_qty: Some(1800),
        };
        Trade::new(
            "t-1".to_string(),
            256265,
            instrument,
            side,
            50,
            dec!(100),
            dec!(88),
            Product::Mis,
            "breakout".to_string(),
            "momentum".to_string(),
            "TREND".to_string(),
            dec!(90),
            1_700_000_000_000,
        )
    }

    #[test]
    fn test_open_pnl_signed() {
        let mut t = sample_trade(Side::Buy);
        t.entry_price = Some(dec!(100));
        assert_eq!(t.open_pnl_at(dec!(102)), Some(dec!(100)));

        let mut s = sample_trade(Side::Sell);
        s.entry_price = Some(dec!(100));
        assert_eq!(s.open_pnl_at(dec!(102)), Some(dec!(-100)));
    }

    #[test]
    fn test_sl_monotone_after_be_lock() {
        let mut t = sample_trade(Side::Buy);
        t.stop_loss = Some(dec!(100));
        t.be_locked = true;
        // Tightening up is fine, loosening down is clamped back
        assert_eq!(t.clamp_sl_monotone(dec!(101)), dec!(101));
        assert_eq!(t.clamp_sl_monotone(dec!(95)), dec!(100));

        let mut s = sample_trade(Side::Sell);
        s.stop_loss = Some(dec!(100));
        s.be_locked = true;
        assert_eq!(s.clamp_sl_monotone(dec!(99)), dec!(99));
        assert_eq!(s.clamp_sl_monotone(dec!(105)), dec!(100));
    }

    #[test]
    fn test_sl_free_before_be_lock() {
        let t = sample_trade(Side::Buy);
        assert_eq!(t.clamp_sl_monotone(dec!(80)), dec!(80));
    }

    #[test]
    fn test_realized_pnl_sums_legs() {
        let mut t = sample_trade(Side::Buy);
        t.pnl_legs.push(PnlLeg {
            role: OrderRole::Tp1,
            qty: 25,
            price: dec!(110),
            pnl_inr: dec!(250),
            at: 0,
        });
        t.pnl_legs.push(PnlLeg {
            role: OrderRole::Target,
            qty: 25,
            price: dec!(124),
            pnl_inr: dec!(600),
            at: 0,
        });
        assert_eq!(t.realized_pnl(), dec!(850));
    }
}
