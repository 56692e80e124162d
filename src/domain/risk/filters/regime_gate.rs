use crate::domain::risk::filters::{GateContext, GateResult, SignalGate};
use crate::domain::trading::types::Candle;
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct RegimeGateConfig {
    /// ATR as a fraction of price, e.g. 0.0015 = 0.15%.
    pub min_atr_pct: Decimal,
    pub max_atr_pct: Decimal,
    /// Signal-candle volume vs trailing average.
    pub min_rel_volume: Decimal,
    /// Signal-candle range rank within the lookback, 0..=100.
    pub min_range_pctile: Decimal,
    pub atr_period: usize,
    /// Higher-timeframe trend must agree with the signal direction.
    pub require_htf_trend: bool,
    pub htf_factor: u32,
    /// (style, regime) pairs that are refused outright.
    pub blocked_style_regimes: Vec<(String, String)>,
}

impl Default for RegimeGateConfig {
    fn default() -> Self {
        Self {
            min_atr_pct: Decimal::new(8, 4),   // 0.08%
            max_atr_pct: Decimal::new(300, 4), // 3%
            min_rel_volume: Decimal::new(7, 1), // 0.7x
            min_range_pctile: Decimal::from(20),
            atr_period: 14,
            require_htf_trend: true,
            htf_factor: 3,
            blocked_style_regimes: vec![("momentum".to_string(), "CHOP".to_string())],
        }
    }
}

/// Regime filters: volatility floor/ceiling, participation, range rank and
/// multi-timeframe trend agreement. All derived from the engine's rolling
/// candle buffer; a short buffer passes (never block on missing history).
pub struct RegimeGate {
    config: RegimeGateConfig,
}

impl RegimeGate {
    pub fn new(config: RegimeGateConfig) -> Self {
        Self { config }
    }

    fn atr(&self, candles: &[Candle]) -> Option<Decimal> {
        let period = self.config.atr_period;
        if candles.len() < period + 1 {
            return None;
        }
        let window = &candles[candles.len() - period..];
        let mut prev_close = candles[candles.len() - period - 1].close;
        let mut sum = Decimal::ZERO;
        for c in window {
            let tr = (c.high - c.low)
                .max((c.high - prev_close).abs())
                .max((c.low - prev_close).abs());
            sum += tr;
            prev_close = c.close;
        }
        Some(sum / Decimal::from(period as i64))
    }

    fn rel_volume(&self, candles: &[Candle], signal_volume: i64) -> Option<Decimal> {
        if candles.len() < 5 {
            return None;
        }
        let lookback = &candles[candles.len().saturating_sub(20)..];
        let avg: Decimal = lookback.iter().map(|c| Decimal::from(c.volume)).sum::<Decimal>()
            / Decimal::from(lookback.len() as i64);
        if avg <= Decimal::ZERO {
            return None;
        }
        Some(Decimal::from(signal_volume) / avg)
    }

    fn range_pctile(&self, candles: &[Candle], signal: &Candle) -> Option<Decimal> {
        if candles.len() < 10 {
            return None;
        }
        let range = signal.high - signal.low;
        let below = candles
            .iter()
            .filter(|c| (c.high - c.low) <= range)
            .count();
        Some(Decimal::from(below as i64) * Decimal::from(100) / Decimal::from(candles.len() as i64))
    }

    /// Trend of the buffer resampled at `htf_factor` × the signal interval:
    /// last HTF close vs the one before it.
    fn htf_trend_up(&self, candles: &[Candle]) -> Option<bool> {
        let factor = self.config.htf_factor as usize;
        if factor < 2 || candles.len() < factor * 2 {
            return None;
        }
        let last = &candles[candles.len() - factor..];
        let prev = &candles[candles.len() - factor * 2..candles.len() - factor];
        let last_close = last.last()?.close;
        let prev_close = prev.last()?.close;
        Some(last_close > prev_close)
    }
}

impl SignalGate for RegimeGate {
    fn name(&self) -> &'static str {
        "RegimeGate"
    }

    fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        let style = ctx.signal.strategy_style.as_str();
        let regime = ctx.signal.regime.as_str();
        for (s, r) in &self.config.blocked_style_regimes {
            if s == style && r == regime {
                return GateResult::Block(
                    "STYLE_REGIME_MISMATCH",
                    format!("style {} blocked in regime {}", style, regime),
                );
            }
        }

        if let Some(atr) = self.atr(ctx.recent_candles)
            && ctx.entry_price > Decimal::ZERO
        {
            let atr_pct = atr / ctx.entry_price;
            if atr_pct < self.config.min_atr_pct {
                return GateResult::Block(
                    "ATR_TOO_LOW",
                    format!("atr {:.4}% below floor", atr_pct * Decimal::from(100)),
                );
            }
            if atr_pct > self.config.max_atr_pct {
                return GateResult::Block(
                    "ATR_TOO_HIGH",
                    format!("atr {:.4}% above ceiling", atr_pct * Decimal::from(100)),
                );
            }
        }

        if let Some(rel) = self.rel_volume(ctx.recent_candles, ctx.signal.candle.volume)
            && rel < self.config.min_rel_volume
        {
            return GateResult::Block(
                "REL_VOLUME_LOW",
                format!("relative volume {:.2} < {}", rel, self.config.min_rel_volume),
            );
        }

        if let Some(pctile) = self.range_pctile(ctx.recent_candles, &ctx.signal.candle)
            && pctile < self.config.min_range_pctile
        {
            return GateResult::Block(
                "RANGE_PCTILE_LOW",
                format!("range percentile {:.0} < {}", pctile, self.config.min_range_pctile),
            );
        }

        if self.config.require_htf_trend
            && let Some(up) = self.htf_trend_up(ctx.recent_candles)
        {
            let agrees = match ctx.signal.side {
                crate::domain::trading::types::Side::Buy => up,
                crate::domain::trading::types::Side::Sell => !up,
            };
            if !agrees {
                return GateResult::Block(
                    "HTF_TREND_DISAGREES",
                    format!("higher timeframe trend opposes {} signal", ctx.signal.side),
                );
            }
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

    fn rising_candles(n: usize, volume: i64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = dec!(100) + Decimal::from(i as i64) * dec!(0.3);
                Candle {
                    open: close - dec!(0.2),
                    high: close + dec!(0.4),
                    low: close - dec!(0.4),
                    close,
                    volume,
                    ts: 1_700_000_000_000 + (i as i64) * 300_000,
                    interval_min: 5,
                }
            })
            .collect()
    }

    fn check_with(candles: &[Candle], side: Side, style: &str, regime: &str) -> GateResult {
        let gate = RegimeGate::new(RegimeGateConfig::default());
        let mut sig = sample_signal(side, dec!(90));
        sig.strategy_style = style.to_string();
        sig.regime = regime.to_string();
        sig.candle = candles.last().copied().unwrap_or(sig.candle);
        let inst = sample_instrument();
        let rs = RiskState::new(chrono::NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(), 0);
        let ctx = GateContext {
            signal: &sig,
            instrument: &inst,
            quote: None,
            ltp: dec!(105),
            entry_price: dec!(105),
            stop_loss: dec!(95),
            target: None,
            qty: None,
            recent_candles: candles,
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
    fn test_blocked_style_regime_pair() {
        let verdict = check_with(&[], Side::Buy, "momentum", "CHOP");
        assert_eq!(verdict.block_code(), Some("STYLE_REGIME_MISMATCH"));
    }

    #[test]
    fn test_short_history_passes() {
        assert!(check_with(&rising_candles(3, 10_000), Side::Buy, "momentum", "TREND").is_pass());
    }

    #[test]
    fn test_uptrend_blocks_sell_when_htf_required() {
        let candles = rising_candles(30, 10_000);
        let verdict = check_with(&candles, Side::Sell, "momentum", "TREND");
        assert_eq!(verdict.block_code(), Some("HTF_TREND_DISAGREES"));
        assert!(check_with(&candles, Side::Buy, "momentum", "TREND").is_pass());
    }

    #[test]
    fn test_dead_tape_blocks_on_volume() {
        // History at high volume, signal candle at a fraction of it
        let mut candles = rising_candles(30, 50_000);
        if let Some(last) = candles.last_mut() {
            last.volume = 1_000;
        }
        let verdict = check_with(&candles, Side::Buy, "momentum", "TREND");
        assert_eq!(verdict.block_code(), Some("REL_VOLUME_LOW"));
    }
}
