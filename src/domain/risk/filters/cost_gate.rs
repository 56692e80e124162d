use crate::domain::risk::filters::{GateContext, GateResult, SignalGate};
use rust_decimal::Decimal;

/// All-in round-trip cost model: flat brokerage per order plus a
/// percentage-of-turnover component for exchange/regulatory charges.
#[derive(Debug, Clone)]
pub struct CostModel {
    pub flat_per_order_inr: Decimal,
    /// Fraction of turnover, e.g. 0.0006 = 6 bps, applied to both legs.
    pub turnover_pct: Decimal,
    /// Safety margin multiplier on the estimate.
    pub buffer_mult: Decimal,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            flat_per_order_inr: Decimal::from(20),
            turnover_pct: Decimal::new(6, 4),
            buffer_mult: Decimal::new(11, 1), // 1.1x
        }
    }
}

impl CostModel {
    /// Estimated round-trip charges for `qty` units around `price`.
    pub fn round_trip_inr(&self, price: Decimal, qty: i64) -> Decimal {
        let turnover = price * Decimal::from(qty) * Decimal::TWO;
        (self.flat_per_order_inr * Decimal::TWO + turnover * self.turnover_pct) * self.buffer_mult
    }

    /// Minimum favorable move in currency for the trade to close green.
    pub fn min_green_inr(&self, price: Decimal, qty: i64) -> Decimal {
        self.round_trip_inr(price, qty)
    }

    /// Same threshold expressed in points per unit.
    pub fn min_green_pts(&self, price: Decimal, qty: i64) -> Decimal {
        if qty <= 0 {
            return Decimal::ZERO;
        }
        self.min_green_inr(price, qty) / Decimal::from(qty)
    }
}

#[derive(Debug, Clone)]
pub struct CostGateConfig {
    /// Expected move must exceed this multiple of all-in costs.
    pub cost_mult: Decimal,
    pub model: CostModel,
}

impl Default for CostGateConfig {
    fn default() -> Self {
        Self {
            cost_mult: Decimal::TWO,
            model: CostModel::default(),
        }
    }
}

/// Refuses trades whose expected move cannot pay for itself. Runs after
/// sizing (charges scale with quantity).
pub struct CostGate {
    config: CostGateConfig,
}

impl CostGate {
    pub fn new(config: CostGateConfig) -> Self {
        Self { config }
    }
}

impl SignalGate for CostGate {
    fn name(&self) -> &'static str {
        "CostGate"
    }

    fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        let Some(qty) = ctx.qty else {
            return GateResult::Pass;
        };
        let Some(expected_move) = ctx.expected_move() else {
            return GateResult::Pass;
        };

        let charges = ctx
            .est_charges_inr
            .unwrap_or_else(|| self.config.model.round_trip_inr(ctx.entry_price, qty));
        let expected_gain_inr = expected_move * Decimal::from(qty);
        let required = charges * self.config.cost_mult;
        if expected_gain_inr < required {
            return GateResult::Block(
                "COST_GATE",
                format!(
                    "expected gain {} < {} ({}x charges {})",
                    expected_gain_inr, required, self.config.cost_mult, charges
                ),
            );
        }
        GateResult::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::risk::filters::test_support::*;
    use crate::domain::risk::state::{DayState, RiskState};
    use crate::domain::trading::types::Side;
    use rust_decimal_macros::dec;

    fn verdict(qty: Option<i64>, entry: Decimal, target: Option<Decimal>) -> GateResult {
        let gate = CostGate::new(CostGateConfig::default());
        let sig = sample_signal(Side::Buy, dec!(90));
        let inst = sample_instrument();
        let rs = RiskState::new(chrono::NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(), 0);
        let ctx = GateContext {
            signal: &sig,
            instrument: &inst,
            quote: None,
            ltp: entry,
            entry_price: entry,
            stop_loss: entry - dec!(12),
            target,
            qty,
            recent_candles: &[],
            risk_state: &rs,
            day_state: DayState::Running,
            day_realized_pnl: dec!(0),
            est_charges_inr: None,
            option_meta: None,
            now_ms: 0,
        };
        gate.check(&ctx)
    }

    #[test]
    fn test_cost_model_estimate() {
        let model = CostModel::default();
        // turnover = 100*50*2 = 10_000; pct = 6; flat = 40; total 46 * 1.1 = 50.6
        assert_eq!(model.round_trip_inr(dec!(100), 50), dec!(50.60));
        assert!(model.min_green_pts(dec!(100), 50) > dec!(1));
    }

    #[test]
    fn test_wide_target_passes() {
        // gain = 24*50 = 1200 vs required ~101
        assert!(verdict(Some(50), dec!(100), Some(dec!(124))).is_pass());
    }

    #[test]
    fn test_thin_target_blocks() {
        // gain = 1*50 = 50 < required ~101
        assert_eq!(
            verdict(Some(50), dec!(100), Some(dec!(101))).block_code(),
            Some("COST_GATE")
        );
    }

    #[test]
    fn test_pre_sizing_pass_through() {
        assert!(verdict(None, dec!(100), Some(dec!(101))).is_pass());
        assert!(verdict(Some(50), dec!(100), None).is_pass());
    }
}
