//! Exit planning.
//!
//! A pure function over `(trade, candles, ltp, now)`: no broker calls, no
//! persistence. The engine's exit loop applies whatever this returns;
//! monotone SL moves, target adjustments, or an immediate exit.

use crate::config::PlannerConfig;
use crate::domain::risk::filters::cost_gate::CostModel;
use crate::domain::trading::trade::Trade;
use crate::domain::trading::types::{bps_of, floor_to_tick, round_to_tick, Candle, Side};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitNowReason {
    TimeStop,
    HardTrailViolation,
}

impl std::fmt::Display for ExitNowReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitNowReason::TimeStop => write!(f, "TIME_STOP"),
            ExitNowReason::HardTrailViolation => write!(f, "HARD_TRAIL_VIOLATION"),
        }
    }
}

/// Fields the engine should persist back onto the trade.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanPatch {
    pub be_locked: Option<bool>,
    pub peak_ltp: Option<Decimal>,
    pub trail_sl: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct PlanMeta {
    pub pnl_inr: Option<Decimal>,
    pub peak_ltp: Option<Decimal>,
    pub min_green_inr: Option<Decimal>,
    pub skip_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Default)]
pub struct ExitPlan {
    /// New desired SL trigger, already clamped monotone.
    pub stop_loss: Option<Decimal>,
    pub target_price: Option<Decimal>,
    pub exit_now: Option<ExitNowReason>,
    pub patch: PlanPatch,
    pub meta: PlanMeta,
}

pub struct ExitPlanner {
    config: PlannerConfig,
    costs: CostModel,
}

impl ExitPlanner {
    pub fn new(config: PlannerConfig, costs: CostModel) -> Self {
        Self { config, costs }
    }

    /// Initial SL/target overlay at entry time: structure stop from the
    /// recent swing, target from RR over the resulting risk.
    pub fn initial_plan(
        &self,
        side: Side,
        entry: Decimal,
        proposed_sl: Decimal,
        candles: &[Candle],
        tick: Decimal,
        rr_target: Decimal,
    ) -> (Decimal, Decimal) {
        let swing = self.swing_stop(side, candles, tick);
        // Take the tighter of strategy stop and structure stop, never a stop
        // on the wrong side of entry.
        let sl = match (side, swing) {
            (Side::Buy, Some(s)) if s > proposed_sl && s < entry => s,
            (Side::Sell, Some(s)) if s < proposed_sl && s > entry => s,
            _ => proposed_sl,
        };
        let risk = (entry - sl).abs();
        let target = match side {
            Side::Buy => entry + risk * rr_target,
            Side::Sell => entry - risk * rr_target,
        };
        (round_to_tick(sl, tick), round_to_tick(target, tick))
    }

    pub fn plan(
        &self,
        trade: &Trade,
        candles: &[Candle],
        ltp: Decimal,
        _underlying_ltp: Option<Decimal>,
        now_ms: i64,
    ) -> ExitPlan {
        let mut plan = ExitPlan::default();

        if trade.dyn_exit_disabled {
            plan.meta.skip_reason = Some("dyn_exit_disabled");
            return plan;
        }
        let Some(entry) = trade.entry_price else {
            plan.meta.skip_reason = Some("entry_not_filled");
            return plan;
        };
        if ltp <= Decimal::ZERO {
            plan.meta.skip_reason = Some("no_ltp");
            return plan;
        }

        let tick = trade.instrument.tick_size;
        let side = trade.side;
        let pnl = trade.open_pnl_at(ltp);
        plan.meta.pnl_inr = pnl;

        // Peak tracking
        let peak = match (trade.peak_ltp, side) {
            (Some(p), Side::Buy) => p.max(ltp),
            (Some(p), Side::Sell) => p.min(ltp),
            (None, _) => ltp,
        };
        if trade.peak_ltp != Some(peak) {
            plan.patch.peak_ltp = Some(peak);
        }
        plan.meta.peak_ltp = Some(peak);

        let min_green = trade
            .min_green_inr
            .unwrap_or_else(|| self.costs.min_green_inr(entry, trade.qty));
        plan.meta.min_green_inr = Some(min_green);

        let favorable = trade.favorable_pts(ltp).unwrap_or_default();
        let risk_pts = trade
            .risk_pts
            .or_else(|| trade.initial_stop_loss.map(|s| (entry - s).abs()))
            .unwrap_or_default();

        let mut desired_sl: Option<Decimal> = None;

        // Breakeven lock once profit clears a cost multiple
        if !trade.be_locked
            && let Some(p) = pnl
            && p >= min_green * self.config.be_lock_cost_mult
        {
            let fee_share = if trade.qty > 0 {
                self.costs.min_green_pts(entry, trade.qty)
            } else {
                Decimal::ZERO
            };
            let buffer = tick * Decimal::from(self.config.level_buffer_ticks);
            let be = match side {
                Side::Buy => entry + buffer + fee_share,
                Side::Sell => entry - buffer - fee_share,
            };
            desired_sl = Some(be);
            plan.patch.be_locked = Some(true);
        }

        // ATR trail once profit has reached TRAIL_ARM_R x risk
        if risk_pts > Decimal::ZERO
            && favorable >= risk_pts * self.config.trail_arm_r
            && let Some(atr) = atr(candles, self.config.atr_period)
        {
            let trail = match side {
                Side::Buy => peak - atr * self.config.trail_atr_mult,
                Side::Sell => peak + atr * self.config.trail_atr_mult,
            };
            desired_sl = Some(match (desired_sl, side) {
                (Some(cur), Side::Buy) => cur.max(trail),
                (Some(cur), Side::Sell) => cur.min(trail),
                (None, _) => trail,
            });
            if !trade.trail_sl {
                plan.patch.trail_sl = Some(true);
            }
        }

        // Structure anchor: trail never loosens below the latest swing/round
        // level shelf once trailing is armed.
        if let Some(cur) = desired_sl {
            let anchored = self.anchor_to_levels(side, cur, ltp, candles, tick);
            desired_sl = Some(anchored);
        }

        if let Some(mut sl) = desired_sl {
            sl = round_to_tick(sl, tick);
            // Never propose a stop through the market
            let valid = match side {
                Side::Buy => sl < ltp,
                Side::Sell => sl > ltp,
            };
            if valid {
                let clamped = trade.clamp_sl_monotone(sl);
                if Some(clamped) != trade.stop_loss {
                    plan.stop_loss = Some(clamped);
                }
            }
        }

        // Time stop: held past the window and still under min-green
        if let Some(filled_at) = trade.entry_filled_at
            && now_ms - filled_at >= self.config.time_stop_after_ms
            && pnl.is_some_and(|p| p < min_green)
        {
            plan.exit_now = Some(ExitNowReason::TimeStop);
        }

        plan
    }

    /// Most recent swing low (long) / swing high (short) with a tick buffer.
    fn swing_stop(&self, side: Side, candles: &[Candle], tick: Decimal) -> Option<Decimal> {
        let lookback = self.config.swing_lookback;
        if candles.len() < 3 {
            return None;
        }
        let window = &candles[candles.len().saturating_sub(lookback)..];
        let buffer = tick * Decimal::from(self.config.level_buffer_ticks);
        match side {
            Side::Buy => {
                let low = window.iter().map(|c| c.low).min()?;
                Some(low - buffer)
            }
            Side::Sell => {
                let high = window.iter().map(|c| c.high).max()?;
                Some(high + buffer)
            }
        }
    }

    /// Keep the stop away from obvious liquidity: round levels get a buffer
    /// so the stop rests beyond the magnet, not on it.
    fn anchor_to_levels(
        &self,
        side: Side,
        sl: Decimal,
        ltp: Decimal,
        _candles: &[Candle],
        tick: Decimal,
    ) -> Decimal {
        let step = self.config.round_level_step;
        if step <= Decimal::ZERO {
            return sl;
        }
        let nearest = round_to_tick((sl / step).round() * step, tick);
        let buffer = tick * Decimal::from(self.config.level_buffer_ticks);
        let dist = (sl - nearest).abs();
        if dist > buffer {
            return sl;
        }
        match side {
            Side::Buy => (nearest - buffer).min(bound_below(ltp, tick)),
            Side::Sell => nearest + buffer,
        }
    }
}

fn bound_below(ltp: Decimal, tick: Decimal) -> Decimal {
    floor_to_tick(ltp - bps_of(ltp, Decimal::ONE), tick)
}

fn atr(candles: &[Candle], period: usize) -> Option<Decimal> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::types::{Instrument, Product};
    use rust_decimal_macros::dec;

    fn planner() -> ExitPlanner {
        let config = PlannerConfig {
            be_lock_cost_mult: dec!(1.5),
            trail_arm_r: dec!(1.1),
            trail_atr_mult: dec!(2),
            atr_period: 5,
            time_stop_after_ms: 20 * 60 * 1000,
            round_level_step: dec!(50),
            level_buffer_ticks: 2,
            dyn_exit_interval_ms: 2000,
            swing_lookback: 10,
        };
        ExitPlanner::new(config, CostModel::default())
    }

    fn live_trade(side: Side) -> Trade {
        let instrument = Instrument {
            exchange: "NFO".into(),
            tradingsymbol: "NIFTY24AUG24800CE".into(),
            segment: "NFO-OPT".into(),
            lot_size: 25,
            tick_size: dec!(0.05),
            freeze_qty: Some(1800),
        };
        let mut t = Trade::new(
            "t-1".into(),
            1,
            instrument,
            side,
            50,
            dec!(100),
            dec!(88),
            Product::Mis,
            "breakout".into(),
            "momentum".into(),
            "TREND".into(),
            dec!(90),
            1_700_000_000_000,
        );
        t.entry_price = Some(dec!(100));
        t.entry_filled_at = Some(1_700_000_000_000);
        t.risk_pts = Some(dec!(12));
        t.min_green_inr = Some(dec!(60));
        t.status = crate::domain::trading::state_machine::TradeStatus::Live;
        t
    }

    fn flat_candles(n: usize, close: Decimal) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                open: close,
                high: close + dec!(0.5),
                low: close - dec!(0.5),
                close,
                volume: 1000,
                ts: 1_700_000_000_000 + i as i64 * 60_000,
                interval_min: 1,
            })
            .collect()
    }

    #[test]
    fn test_skips_until_filled() {
        let p = planner();
        let mut t = live_trade(Side::Buy);
        t.entry_price = None;
        let plan = p.plan(&t, &[], dec!(101), None, 1_700_000_000_000);
        assert_eq!(plan.meta.skip_reason, Some("entry_not_filled"));
        assert!(plan.stop_loss.is_none());
    }

    #[test]
    fn test_peak_tracking_both_sides() {
        let p = planner();
        let mut t = live_trade(Side::Buy);
        t.peak_ltp = Some(dec!(103));
        let plan = p.plan(&t, &[], dec!(105), None, 1_700_000_000_100);
        assert_eq!(plan.patch.peak_ltp, Some(dec!(105)));

        let mut s = live_trade(Side::Sell);
        s.peak_ltp = Some(dec!(97));
        let plan = p.plan(&s, &[], dec!(95), None, 1_700_000_000_100);
        assert_eq!(plan.patch.peak_ltp, Some(dec!(95)));
    }

    #[test]
    fn test_be_lock_after_cost_multiple() {
        let p = planner();
        let t = live_trade(Side::Buy);
        // pnl at 102 = 100 INR >= 1.5 * 60 = 90
        let plan = p.plan(&t, &[], dec!(102), None, 1_700_000_000_100);
        assert_eq!(plan.patch.be_locked, Some(true));
        let sl = plan.stop_loss.expect("BE lock must move the stop");
        assert!(sl > dec!(100), "BE stop {} should clear entry + fees", sl);
        assert!(sl < dec!(102));
    }

    #[test]
    fn test_trail_arms_at_r_multiple() {
        let p = planner();
        let mut t = live_trade(Side::Buy);
        t.be_locked = true;
        t.stop_loss = Some(dec!(100.5));
        t.peak_ltp = Some(dec!(114));
        // favorable = 14 pts >= 1.1 * 12 = 13.2 -> trail armed
        let candles = flat_candles(8, dec!(112));
        let plan = p.plan(&t, &candles, dec!(114), None, 1_700_000_000_100);
        assert_eq!(plan.patch.trail_sl, Some(true));
        // ATR ~1 => trail = 114 - 2 = 112 > current 100.5
        let sl = plan.stop_loss.expect("trail must tighten the stop");
        assert!(sl > dec!(105), "trail stop {} too loose", sl);
    }

    #[test]
    fn test_trail_respects_monotonicity() {
        let p = planner();
        let mut t = live_trade(Side::Buy);
        t.be_locked = true;
        t.stop_loss = Some(dec!(113));
        t.peak_ltp = Some(dec!(120));
        let candles = flat_candles(8, dec!(114));
        // Trail would suggest ~116; price fell back to 114, stop stays >= 113
        let plan = p.plan(&t, &candles, dec!(114), None, 1_700_000_000_100);
        if let Some(sl) = plan.stop_loss {
            assert!(sl >= dec!(113));
            assert!(sl < dec!(114));
        }
    }

    #[test]
    fn test_time_stop_only_when_under_min_green() {
        let p = planner();
        let t = live_trade(Side::Buy);
        let late = 1_700_000_000_000 + 21 * 60 * 1000;
        // pnl at 100.5 = 25 < min green 60 -> time stop
        let plan = p.plan(&t, &[], dec!(100.5), None, late);
        assert_eq!(plan.exit_now, Some(ExitNowReason::TimeStop));
        // pnl at 103 = 150 >= 60 -> keep holding
        let plan = p.plan(&t, &[], dec!(103), None, late);
        assert_eq!(plan.exit_now, None);
    }

    #[test]
    fn test_initial_plan_uses_structure_and_rr() {
        let p = planner();
        let mut candles = flat_candles(10, dec!(98));
        // Swing low at 96.5 - buffer 0.1 = 96.4 tightens an 88 stop
        candles.push(Candle {
            open: dec!(97),
            high: dec!(99),
            low: dec!(96.5),
            close: dec!(98.5),
            volume: 2000,
            ts: 1_700_000_001_000,
            interval_min: 1,
        });
        let (sl, target) =
            p.initial_plan(Side::Buy, dec!(100), dec!(88), &candles, dec!(0.05), dec!(2));
        assert!(sl > dec!(88) && sl < dec!(100), "structure stop {} expected", sl);
        assert_eq!(target, round_to_tick(dec!(100) + (dec!(100) - sl) * dec!(2), dec!(0.05)));
    }

    #[test]
    fn test_dyn_exit_disabled_short_circuits() {
        let p = planner();
        let mut t = live_trade(Side::Buy);
        t.dyn_exit_disabled = true;
        let plan = p.plan(&t, &[], dec!(110), None, 1_700_000_000_100);
        assert_eq!(plan.meta.skip_reason, Some("dyn_exit_disabled"));
        assert!(plan.stop_loss.is_none() && plan.exit_now.is_none());
    }
}
