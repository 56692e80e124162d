use crate::domain::risk::filters::{GateContext, GateResult, SignalGate};
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct PacingGateConfig {
    pub min_confidence: Decimal,
    /// Floor bump per consecutive failed entry.
    pub bump_per_failure: Decimal,
    /// Floor bump applied while the day is red.
    pub red_day_bump: Decimal,
    pub max_floor: Decimal,
}

impl Default for PacingGateConfig {
    fn default() -> Self {
        Self {
            min_confidence: Decimal::from(60),
            bump_per_failure: Decimal::from(5),
            red_day_bump: Decimal::from(8),
            max_floor: Decimal::from(92),
        }
    }
}

/// Dynamic confidence floor: the worse the session is going, the better a
/// signal has to be.
pub struct PacingGate {
    config: PacingGateConfig,
}

impl PacingGate {
    pub fn new(config: PacingGateConfig) -> Self {
        Self { config }
    }

    pub fn floor(&self, consecutive_failures: u32, day_realized_pnl: Decimal) -> Decimal {
        let mut floor = self.config.min_confidence
            + self.config.bump_per_failure * Decimal::from(consecutive_failures);
        if day_realized_pnl < Decimal::ZERO {
            floor += self.config.red_day_bump;
        }
        floor.min(self.config.max_floor)
    }
}

impl SignalGate for PacingGate {
    fn name(&self) -> &'static str {
        "PacingGate"
    }

    fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        let floor = self.floor(ctx.risk_state.consecutive_failures, ctx.day_realized_pnl);
        if ctx.signal.confidence < floor {
            return GateResult::Block(
                "CONFIDENCE_BELOW_FLOOR",
                format!("confidence {} < pacing floor {}", ctx.signal.confidence, floor),
            );
        }
        GateResult::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_floor_rises_with_failures_and_red_day() {
        let gate = PacingGate::new(PacingGateConfig::default());
        assert_eq!(gate.floor(0, dec!(0)), dec!(60));
        assert_eq!(gate.floor(2, dec!(0)), dec!(70));
        assert_eq!(gate.floor(2, dec!(-500)), dec!(78));
        // Capped
        assert_eq!(gate.floor(10, dec!(-500)), dec!(92));
    }
}
