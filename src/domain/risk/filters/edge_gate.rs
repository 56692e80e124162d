use crate::domain::risk::filters::{GateContext, GateResult, SignalGate};
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct EdgeGateConfig {
    /// Expected premium gain must exceed this multiple of the drag terms.
    pub edge_mult: Decimal,
    /// Fraction of a day the trade is expected to be held (theta share).
    pub hold_fraction: Decimal,
    /// Assumed adverse IV move in points while holding.
    pub adverse_iv_pts: Decimal,
}

impl Default for EdgeGateConfig {
    fn default() -> Self {
        Self {
            edge_mult: Decimal::new(15, 1), // 1.5x
            hold_fraction: Decimal::new(4, 2),
            adverse_iv_pts: Decimal::ONE,
        }
    }
}

/// Option IV/theta edge gate: a long premium trade must expect to out-earn
/// the vega and theta drag by a configured multiple. Non-options pass.
pub struct EdgeGate {
    config: EdgeGateConfig,
}

impl EdgeGate {
    pub fn new(config: EdgeGateConfig) -> Self {
        Self { config }
    }
}

impl SignalGate for EdgeGate {
    fn name(&self) -> &'static str {
        "EdgeGate"
    }

    fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        if !ctx.instrument.is_option() {
            return GateResult::Pass;
        }
        let Some(expected_move) = ctx.expected_move() else {
            return GateResult::Pass;
        };

        // Greeks are optional instrument metadata; without them the gate
        // cannot price the drag and stands aside.
        let (vega, theta) = match &ctx.signal_option_greeks() {
            Some(g) => *g,
            None => return GateResult::Pass,
        };

        let drag = (vega * self.config.adverse_iv_pts).abs()
            + (theta * self.config.hold_fraction).abs();
        let required = drag * self.config.edge_mult;
        if expected_move < required {
            return GateResult::Block(
                "IV_THETA_EDGE",
                format!(
                    "expected move {} < {} (edge {}x over drag {})",
                    expected_move, required, self.config.edge_mult, drag
                ),
            );
        }
        GateResult::Pass
    }
}

impl GateContext<'_> {
    /// (vega, theta) when both are present on the routed contract.
    fn signal_option_greeks(&self) -> Option<(Decimal, Decimal)> {
        let meta = self.option_meta.as_ref()?;
        Some((meta.vega?, meta.theta?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::risk::filters::test_support::*;
    use crate::domain::risk::state::{DayState, RiskState};
    use crate::domain::trading::types::{OptType, OptionMeta, Side};
    use rust_decimal_macros::dec;

    fn meta(vega: Decimal, theta: Decimal) -> OptionMeta {
        OptionMeta {
            strike: dec!(24800),
            expiry: chrono::NaiveDate::from_ymd_opt(2024, 8, 29).unwrap(),
            opt_type: OptType::Ce,
            delta: Some(dec!(0.5)),
            gamma: None,
            vega: Some(vega),
            theta: Some(theta),
            iv_pts: Some(dec!(14)),
        }
    }

    fn verdict(target: Option<Decimal>, option_meta: Option<OptionMeta>) -> GateResult {
        let gate = EdgeGate::new(EdgeGateConfig::default());
        let sig = sample_signal(Side::Buy, dec!(90));
        let inst = sample_instrument();
        let rs = RiskState::new(chrono::NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(), 0);
        let ctx = GateContext {
            signal: &sig,
            instrument: &inst,
            quote: None,
            ltp: dec!(100),
            entry_price: dec!(100),
            stop_loss: dec!(88),
            target,
            qty: None,
            recent_candles: &[],
            risk_state: &rs,
            day_state: DayState::Running,
            day_realized_pnl: dec!(0),
            est_charges_inr: None,
            option_meta,
            now_ms: 0,
        };
        gate.check(&ctx)
    }

    #[test]
    fn test_strong_edge_passes() {
        // drag = |8*1| + |-120*0.04| = 12.8; required = 19.2 < move 24
        assert!(verdict(Some(dec!(124)), Some(meta(dec!(8), dec!(-120)))).is_pass());
    }

    #[test]
    fn test_theta_heavy_contract_blocks() {
        // drag = |20*1| + |-600*0.04| = 44; required 66 > move 24
        let v = verdict(Some(dec!(124)), Some(meta(dec!(20), dec!(-600))));
        assert_eq!(v.block_code(), Some("IV_THETA_EDGE"));
    }

    #[test]
    fn test_missing_greeks_pass() {
        let mut m = meta(dec!(8), dec!(-120));
        m.vega = None;
        assert!(verdict(Some(dec!(124)), Some(m)).is_pass());
        assert!(verdict(Some(dec!(124)), None).is_pass());
    }
}
