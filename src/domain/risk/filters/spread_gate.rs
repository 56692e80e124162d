use crate::domain::risk::filters::{GateContext, GateResult, SignalGate};
use rust_decimal::Decimal;

/// Per-segment spread caps in basis points, plus a staleness bound on the
/// quote the spread was computed from.
#[derive(Debug, Clone)]
pub struct SpreadGateConfig {
    pub max_spread_bps_eq: Decimal,
    pub max_spread_bps_fut: Decimal,
    pub max_spread_bps_opt: Decimal,
    pub max_quote_age_ms: i64,
    /// Missing depth blocks options but passes cash (some feeds omit depth).
    pub require_depth_for_options: bool,
}

impl Default for SpreadGateConfig {
    fn default() -> Self {
        Self {
            max_spread_bps_eq: Decimal::from(15),
            max_spread_bps_fut: Decimal::from(10),
            max_spread_bps_opt: Decimal::from(80),
            max_quote_age_ms: 5_000,
            require_depth_for_options: true,
        }
    }
}

pub struct SpreadGate {
    config: SpreadGateConfig,
}

impl SpreadGate {
    pub fn new(config: SpreadGateConfig) -> Self {
        Self { config }
    }

    fn limit_for(&self, segment: &str) -> Decimal {
        if segment.ends_with("-OPT") {
            self.config.max_spread_bps_opt
        } else if segment.ends_with("-FUT") {
            self.config.max_spread_bps_fut
        } else {
            self.config.max_spread_bps_eq
        }
    }
}

impl SignalGate for SpreadGate {
    fn name(&self) -> &'static str {
        "SpreadGate"
    }

    fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        let Some(quote) = ctx.quote else {
            if self.config.require_depth_for_options && ctx.instrument.is_option() {
                return GateResult::Block(
                    "QUOTE_MISSING",
                    format!("no quote for {}", ctx.instrument.tradingsymbol),
                );
            }
            return GateResult::Pass;
        };

        if let Some(ts) = quote.timestamp {
            let age = ctx.now_ms - ts;
            if age > self.config.max_quote_age_ms {
                return GateResult::Block(
                    "QUOTE_STALE",
                    format!("quote is {}ms old (max {}ms)", age, self.config.max_quote_age_ms),
                );
            }
        }

        let Some(spread) = quote.spread_bps() else {
            if self.config.require_depth_for_options && ctx.instrument.is_option() {
                return GateResult::Block(
                    "DEPTH_MISSING",
                    format!("no depth for {}", ctx.instrument.tradingsymbol),
                );
            }
            return GateResult::Pass;
        };

        let limit = self.limit_for(&ctx.instrument.segment);
        if spread > limit {
            return GateResult::Block(
                "SPREAD_WIDE",
                format!("spread {:.1} bps > cap {} bps", spread, limit),
            );
        }
        GateResult::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{DepthLevel, Quote};
    use crate::domain::risk::filters::test_support::*;
    use crate::domain::risk::state::{DayState, RiskState};
    use crate::domain::trading::types::Side;
    use rust_decimal_macros::dec;

    fn quote(bid: Decimal, ask: Decimal, ts: i64) -> Quote {
        Quote {
            last_price: (bid + ask) / dec!(2),
            buy_depth: vec![DepthLevel { price: bid, quantity: 500 }],
            sell_depth: vec![DepthLevel { price: ask, quantity: 500 }],
            timestamp: Some(ts),
        }
    }

    fn ctx_with<'a>(
        q: Option<&'a Quote>,
        signal: &'a crate::domain::trading::types::Signal,
        instrument: &'a crate::domain::trading::types::Instrument,
        risk_state: &'a RiskState,
    ) -> GateContext<'a> {
        GateContext {
            signal,
            instrument,
            quote: q,
            ltp: dec!(100),
            entry_price: dec!(100),
            stop_loss: dec!(88),
            target: Some(dec!(124)),
            qty: None,
            recent_candles: &[],
            risk_state,
            day_state: DayState::Running,
            day_realized_pnl: dec!(0),
            est_charges_inr: None,
            option_meta: None,
            now_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_tight_spread_passes() {
        let gate = SpreadGate::new(SpreadGateConfig::default());
        let sig = sample_signal(Side::Buy, dec!(90));
        let inst = sample_instrument();
        let rs = RiskState::new(chrono::NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(), 0);
        let q = quote(dec!(99.95), dec!(100.05), 1_700_000_000_000);
        assert!(gate.check(&ctx_with(Some(&q), &sig, &inst, &rs)).is_pass());
    }

    #[test]
    fn test_wide_spread_blocks() {
        let gate = SpreadGate::new(SpreadGateConfig::default());
        let sig = sample_signal(Side::Buy, dec!(90));
        let inst = sample_instrument();
        let rs = RiskState::new(chrono::NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(), 0);
        // 2 wide on ~100 mid = ~200 bps, over the 80 bps option cap
        let q = quote(dec!(99), dec!(101), 1_700_000_000_000);
        let verdict = gate.check(&ctx_with(Some(&q), &sig, &inst, &rs));
        assert_eq!(verdict.block_code(), Some("SPREAD_WIDE"));
    }

    #[test]
    fn test_stale_quote_blocks() {
        let gate = SpreadGate::new(SpreadGateConfig::default());
        let sig = sample_signal(Side::Buy, dec!(90));
        let inst = sample_instrument();
        let rs = RiskState::new(chrono::NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(), 0);
        let q = quote(dec!(99.95), dec!(100.05), 1_700_000_000_000 - 60_000);
        let verdict = gate.check(&ctx_with(Some(&q), &sig, &inst, &rs));
        assert_eq!(verdict.block_code(), Some("QUOTE_STALE"));
    }

    #[test]
    fn test_missing_quote_blocks_options_only() {
        let gate = SpreadGate::new(SpreadGateConfig::default());
        let sig = sample_signal(Side::Buy, dec!(90));
        let mut inst = sample_instrument();
        let rs = RiskState::new(chrono::NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(), 0);
        let verdict = gate.check(&ctx_with(None, &sig, &inst, &rs));
        assert_eq!(verdict.block_code(), Some("QUOTE_MISSING"));

        inst.segment = "NSE".to_string();
        assert!(gate.check(&ctx_with(None, &sig, &inst, &rs)).is_pass());
    }
}
