//! Quantity sizing.
//!
//! Risk-based size normalized to lot multiples, freeze-quantity capped, then
//! re-checked against the risk cap after lot rounding. When one lot cannot
//! fit the cap under FORCE_ONE_LOT, the stop-loss fitter tightens the stop
//! toward entry so a single lot fits, instead of refusing the trade.

use crate::config::{LotPolicy, RiskConfig};
use crate::domain::trading::types::{round_to_tick, Instrument, Side};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq)]
pub enum SizingOutcome {
    Sized {
        qty: i64,
        /// Possibly tightened by the SL fitter.
        stop_loss: Decimal,
        risk_inr: Decimal,
        risk_pts: Decimal,
        sl_fitted: bool,
    },
    Blocked {
        code: &'static str,
        reason: String,
    },
}

pub struct SizingEngine {
    config: RiskConfig,
}

impl SizingEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn size(
        &self,
        instrument: &Instrument,
        side: Side,
        entry: Decimal,
        stop_loss: Decimal,
        confidence_qty_mult: Decimal,
    ) -> SizingOutcome {
        let lot = instrument.lot_size.max(1);
        let per_unit_risk = (entry - stop_loss).abs();
        if per_unit_risk <= Decimal::ZERO {
            return SizingOutcome::Blocked {
                code: "ZERO_RISK",
                reason: "entry equals stop".to_string(),
            };
        }

        let risk_cap = self.config.risk_per_trade_inr * confidence_qty_mult.clamp(Decimal::ZERO, Decimal::ONE);
        if risk_cap <= Decimal::ZERO {
            return SizingOutcome::Blocked {
                code: "QTY_MULT_ZERO",
                reason: "advisor zeroed the quantity multiplier".to_string(),
            };
        }

        let raw_qty = (risk_cap / per_unit_risk)
            .floor()
            .to_i64()
            .unwrap_or(0);
        let mut lots = raw_qty / lot;

        if lots == 0 {
            match self.config.lot_policy {
                LotPolicy::Strict => {
                    return SizingOutcome::Blocked {
                        code: "BELOW_ONE_LOT",
                        reason: format!(
                            "risk {} cannot fund one lot of {} at {}/unit",
                            risk_cap, lot, per_unit_risk
                        ),
                    };
                }
                LotPolicy::ForceOneLot => lots = 1,
            }
        }

        // Freeze quantity cap
        if let Some(freeze) = instrument.freeze_qty
            && freeze >= lot
        {
            lots = lots.min(freeze / lot);
        }

        let mut qty = lots * lot;
        let mut sl = stop_loss;
        let mut fitted = false;

        if self.config.lot_risk_cap_enforce {
            let eps = Decimal::ONE + self.config.lot_risk_cap_eps_pct / Decimal::from(100);
            let allowed = risk_cap * eps;

            // Trim lots while over cap
            while qty > 0 && per_unit_risk * Decimal::from(qty) > allowed && qty > lot {
                qty -= lot;
            }

            if per_unit_risk * Decimal::from(qty) > allowed {
                // One lot still over cap
                match self.config.lot_policy {
                    LotPolicy::Strict => {
                        return SizingOutcome::Blocked {
                            code: "LOT_RISK_CAP_BLOCK",
                            reason: format!(
                                "one lot risks {} over cap {}",
                                per_unit_risk * Decimal::from(qty),
                                allowed
                            ),
                        };
                    }
                    LotPolicy::ForceOneLot => {
                        // SL fitter: tighten the stop so one lot fits
                        let max_pts = allowed / Decimal::from(qty);
                        let fitted_sl = match side {
                            Side::Buy => entry - max_pts,
                            Side::Sell => entry + max_pts,
                        };
                        let fitted_sl = round_to_tick(fitted_sl, instrument.tick_size);
                        let fitted_pts = (entry - fitted_sl).abs();
                        // The fitter must leave a real stop behind
                        if fitted_pts < instrument.tick_size * Decimal::TWO {
                            return SizingOutcome::Blocked {
                                code: "LOT_RISK_CAP_BLOCK",
                                reason: format!(
                                    "fitted stop {} too close to entry {}",
                                    fitted_sl, entry
                                ),
                            };
                        }
                        sl = fitted_sl;
                        fitted = true;
                    }
                }
            }
        }

        let risk_pts = (entry - sl).abs();
        SizingOutcome::Sized {
            qty,
            stop_loss: sl,
            risk_inr: risk_pts * Decimal::from(qty),
            risk_pts,
            sl_fitted: fitted,
        }
    }
}
