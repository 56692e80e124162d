use crate::domain::risk::filters::{GateContext, GateResult, SignalGate};
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct ExposureGateConfig {
    /// Cap on notional (entry price × qty) for a single position.
    pub max_position_value_inr: Decimal,
    /// Cap on total notional across open positions plus the new one.
    pub max_portfolio_value_inr: Decimal,
    /// Notional / risk ceiling; refuses degenerate leverage on bad stops.
    pub max_leverage: Decimal,
}

impl Default for ExposureGateConfig {
    fn default() -> Self {
        Self {
            max_position_value_inr: Decimal::from(500_000),
            max_portfolio_value_inr: Decimal::from(1_000_000),
            max_leverage: Decimal::from(200),
        }
    }
}

/// Runs after sizing (needs a concrete quantity).
pub struct ExposureGate {
    config: ExposureGateConfig,
}

impl ExposureGate {
    pub fn new(config: ExposureGateConfig) -> Self {
        Self { config }
    }
}

impl SignalGate for ExposureGate {
    fn name(&self) -> &'static str {
        "ExposureGate"
    }

    fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        let Some(qty) = ctx.qty else {
            return GateResult::Pass;
        };

        let notional = ctx.entry_price * Decimal::from(qty);
        if notional > self.config.max_position_value_inr {
            return GateResult::Block(
                "POSITION_VALUE_CAP",
                format!(
                    "notional {} > per-position cap {}",
                    notional, self.config.max_position_value_inr
                ),
            );
        }

        // Single-instrument mode still counts any registered leftovers
        let open_notional: Decimal = ctx
            .risk_state
            .open_positions
            .iter()
            .map(|p| ctx.entry_price * Decimal::from(p.qty.abs()))
            .sum();
        if notional + open_notional > self.config.max_portfolio_value_inr {
            return GateResult::Block(
                "PORTFOLIO_VALUE_CAP",
                format!(
                    "portfolio notional {} > cap {}",
                    notional + open_notional,
                    self.config.max_portfolio_value_inr
                ),
            );
        }

        let risk = ctx.per_unit_risk() * Decimal::from(qty);
        if risk > Decimal::ZERO && notional / risk > self.config.max_leverage {
            return GateResult::Block(
                "LEVERAGE_CAP",
                format!("notional/risk {:.0} > {}", notional / risk, self.config.max_leverage),
            );
        }

        GateResult::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::risk::filters::test_support::*;
    use crate::domain::risk::state::{DayState, OpenPosition, RiskState};
    use crate::domain::trading::types::Side;
    use rust_decimal_macros::dec;

    fn verdict(qty: i64, entry: Decimal, sl: Decimal, rs: &RiskState) -> GateResult {
        let gate = ExposureGate::new(ExposureGateConfig::default());
        let sig = sample_signal(Side::Buy, dec!(90));
        let inst = sample_instrument();
        let ctx = GateContext {
            signal: &sig,
            instrument: &inst,
            quote: None,
            ltp: entry,
            entry_price: entry,
            stop_loss: sl,
            target: None,
            qty: Some(qty),
            recent_candles: &[],
            risk_state: rs,
            day_state: DayState::Running,
            day_realized_pnl: dec!(0),
            est_charges_inr: None,
            option_meta: None,
            now_ms: 0,
        };
        gate.check(&ctx)
    }

    #[test]
    fn test_normal_size_passes() {
        let rs = RiskState::new(chrono::NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(), 0);
        assert!(verdict(50, dec!(100), dec!(88), &rs).is_pass());
    }

    #[test]
    fn test_position_value_cap() {
        let rs = RiskState::new(chrono::NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(), 0);
        assert_eq!(
            verdict(10_000, dec!(100), dec!(88), &rs).block_code(),
            Some("POSITION_VALUE_CAP")
        );
    }

    #[test]
    fn test_portfolio_cap_counts_open_positions() {
        let mut rs = RiskState::new(chrono::NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(), 0);
        rs.track_open(OpenPosition { token: 9, trade_id: "t-9".into(), side: Side::Buy, qty: 4600 });
        // New leg 4540 x 110 = 499.4k stays under the per-position cap, but
        // 4600 x 110 already open pushes the portfolio over 1M.
        assert_eq!(
            verdict(4540, dec!(110), dec!(100), &rs).block_code(),
            Some("PORTFOLIO_VALUE_CAP")
        );
    }

    #[test]
    fn test_leverage_cap_on_hairline_stop() {
        let rs = RiskState::new(chrono::NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(), 0);
        assert_eq!(
            verdict(100, dec!(100), dec!(99.999), &rs).block_code(),
            Some("LEVERAGE_CAP")
        );
    }
}
