use crate::domain::risk::filters::{GateContext, GateResult, SignalGate};
use crate::domain::trading::types::Side;
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct SlQualityConfig {
    /// Stop must sit at least this many ticks away from entry.
    pub min_ticks: u32,
    /// Stop must not be farther than this fraction of entry (0.2 = 20%).
    pub max_distance_pct: Decimal,
}

impl Default for SlQualityConfig {
    fn default() -> Self {
        Self {
            min_ticks: 2,
            max_distance_pct: Decimal::new(20, 2),
        }
    }
}

/// Rejects stops that are on the wrong side, hugging the entry, or so far
/// away that the implied risk is meaningless.
pub struct SlQualityGate {
    config: SlQualityConfig,
}

impl SlQualityGate {
    pub fn new(config: SlQualityConfig) -> Self {
        Self { config }
    }
}

impl SignalGate for SlQualityGate {
    fn name(&self) -> &'static str {
        "SlQualityGate"
    }

    fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        let entry = ctx.entry_price;
        let sl = ctx.stop_loss;

        let wrong_side = match ctx.signal.side {
            Side::Buy => sl >= entry,
            Side::Sell => sl <= entry,
        };
        if wrong_side {
            return GateResult::Block(
                "SL_WRONG_SIDE",
                format!("sl {} vs entry {} for {}", sl, entry, ctx.signal.side),
            );
        }

        let distance = (entry - sl).abs();
        let min_distance = ctx.instrument.tick_size * Decimal::from(self.config.min_ticks);
        if distance < min_distance {
            return GateResult::Block(
                "SL_TOO_TIGHT",
                format!("sl distance {} < {} ({} ticks)", distance, min_distance, self.config.min_ticks),
            );
        }

        if entry > Decimal::ZERO && distance / entry > self.config.max_distance_pct {
            return GateResult::Block(
                "SL_TOO_FAR",
                format!(
                    "sl distance {} is {:.1}% of entry (max {}%)",
                    distance,
                    distance / entry * Decimal::from(100),
                    self.config.max_distance_pct * Decimal::from(100)
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
    use rust_decimal_macros::dec;

    fn check(side: Side, entry: Decimal, sl: Decimal) -> GateResult {
        let gate = SlQualityGate::new(SlQualityConfig::default());
        let mut sig = sample_signal(side, dec!(90));
        sig.stop_loss = Some(sl);
        let inst = sample_instrument();
        let rs = RiskState::new(chrono::NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(), 0);
        let ctx = GateContext {
            signal: &sig,
            instrument: &inst,
            quote: None,
            ltp: entry,
            entry_price: entry,
            stop_loss: sl,
            target: None,
            qty: None,
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
    fn test_sane_stop_passes() {
        assert!(check(Side::Buy, dec!(100), dec!(95)).is_pass());
        assert!(check(Side::Sell, dec!(100), dec!(105)).is_pass());
    }

    #[test]
    fn test_wrong_side_blocks() {
        assert_eq!(check(Side::Buy, dec!(100), dec!(101)).block_code(), Some("SL_WRONG_SIDE"));
        assert_eq!(check(Side::Sell, dec!(100), dec!(99)).block_code(), Some("SL_WRONG_SIDE"));
        // Stop exactly at entry is also refused
        assert_eq!(check(Side::Buy, dec!(100), dec!(100)).block_code(), Some("SL_WRONG_SIDE"));
    }

    #[test]
    fn test_too_tight_blocks() {
        // 0.05 tick size, min 2 ticks => 0.10 required
        assert_eq!(check(Side::Buy, dec!(100), dec!(99.95)).block_code(), Some("SL_TOO_TIGHT"));
    }

    #[test]
    fn test_too_far_blocks() {
        assert_eq!(check(Side::Buy, dec!(100), dec!(70)).block_code(), Some("SL_TOO_FAR"));
    }
}
