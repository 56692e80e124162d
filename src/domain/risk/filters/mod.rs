pub mod cost_gate;
pub mod edge_gate;
pub mod exposure_gate;
pub mod pacing_gate;
pub mod regime_gate;
pub mod sl_quality_gate;
pub mod spread_gate;

use crate::domain::ports::Quote;
use crate::domain::risk::state::{DayState, RiskState};
use crate::domain::trading::types::{Candle, Instrument, OptionMeta, Signal};
use rust_decimal::Decimal;

/// Result of a single entry gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateResult {
    Pass,
    /// Blocked with a decision code + human reason, e.g. ("SPREAD_WIDE", ...).
    Block(&'static str, String),
}

impl GateResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, GateResult::Pass)
    }

    pub fn block_code(&self) -> Option<&'static str> {
        match self {
            GateResult::Block(code, _) => Some(code),
            GateResult::Pass => None,
        }
    }
}

/// Everything a gate may look at. Sizing-dependent fields are `None` for
/// gates that run before quantity is known.
#[derive(Debug)]
pub struct GateContext<'a> {
    pub signal: &'a Signal,
    pub instrument: &'a Instrument,
    pub quote: Option<&'a Quote>,
    pub ltp: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub target: Option<Decimal>,
    pub qty: Option<i64>,
    pub recent_candles: &'a [Candle],
    pub risk_state: &'a RiskState,
    pub day_state: DayState,
    pub day_realized_pnl: Decimal,
    pub est_charges_inr: Option<Decimal>,
    /// Present when the signal was routed to an option contract.
    pub option_meta: Option<OptionMeta>,
    pub now_ms: i64,
}

impl GateContext<'_> {
    pub fn per_unit_risk(&self) -> Decimal {
        (self.entry_price - self.stop_loss).abs()
    }

    pub fn expected_move(&self) -> Option<Decimal> {
        self.target.map(|t| (t - self.entry_price).abs())
    }
}

/// One entry precondition. Gates are pure: they read the context and
/// produce a verdict, never touch the broker or the store.
pub trait SignalGate: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, ctx: &GateContext<'_>) -> GateResult;
}

/// Run gates in order; the first block wins.
pub fn run_gates(gates: &[Box<dyn SignalGate>], ctx: &GateContext<'_>) -> GateResult {
    for gate in gates {
        let verdict = gate.check(ctx);
        if let GateResult::Block(code, reason) = &verdict {
            tracing::info!("Gate {} blocked signal: [{}] {}", gate.name(), code, reason);
            return verdict;
        }
    }
    GateResult::Pass
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::domain::trading::types::Side;
    use rust_decimal_macros::dec;

    pub fn sample_instrument() -> Instrument {
        Instrument {
            exchange: "NFO".to_string(),
            tradingsymbol: "NIFTY24AUG24800CE".to_string(),
            segment: "NFO-OPT".to_string(),
            lot_size: 25,
            tick_size: dec!(0.05),
            freeze_qty: Some(1800),
        }
    }

    pub fn sample_candle(close: Decimal, volume: i64, ts: i64) -> Candle {
        Candle {
            open: close - dec!(0.5),
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume,
            ts,
            interval_min: 5,
        }
    }

    pub fn sample_signal(side: Side, confidence: Decimal) -> Signal {
        Signal {
            instrument_token: 256265,
            side,
            confidence,
            strategy_id: "breakout".to_string(),
            strategy_style: "momentum".to_string(),
            regime: "TREND".to_string(),
            candle: sample_candle(dec!(100), 12_000, 1_700_000_000_000),
            interval_min: 5,
            underlying_token: None,
            stop_loss: Some(dec!(88)),
            target: Some(dec!(124)),
        }
    }
}
