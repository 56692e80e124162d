//! Software OCO: the exchange does not link the stop and the target, so the
//! engine enforces the invariant itself: a fill on either leg cancels the
//! sibling, a fill on both is a critical incident.

use crate::application::engine::manager::{now_ms, TradeManager};
use crate::domain::ports::{AlertKind, BrokerOrder, ModifyParams};
use crate::domain::trading::state_machine::TradeStatus;
use crate::domain::trading::trade::Trade;
use crate::domain::trading::types::{round_to_tick, OrderRole, PnlLeg, Side};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use tracing::{error, info, warn};

impl TradeManager {
    /// Cancel the OCO sibling(s) of the leg that just filled. Cancels are
    /// pre-marked expected so their postbacks read as OCO, not failure.
    pub(crate) async fn cancel_sibling_of(&mut self, filled: OrderRole) {
        let Some(trade) = &self.active else { return };
        let mut to_cancel: Vec<String> = Vec::new();
        match filled {
            OrderRole::Sl => {
                to_cancel.extend(trade.target_order_id.clone());
                to_cancel.extend(trade.tp1_order_id.clone());
            }
            OrderRole::Target => {
                to_cancel.extend(trade.sl_order_id.clone());
                to_cancel.extend(trade.tp1_order_id.clone());
            }
            _ => {
                to_cancel.extend(trade.sl_order_id.clone());
                to_cancel.extend(trade.target_order_id.clone());
                to_cancel.extend(trade.tp1_order_id.clone());
            }
        }
        for order_id in to_cancel {
            if let Err(e) = self.cancel_order_expected(&order_id).await {
                warn!("TradeManager: OCO cancel of {} failed: {}", order_id, e);
            }
        }
    }

    /// True when this COMPLETE belongs to a sibling of the leg that already
    /// closed the trade: both exits filled. Kill, flatten, halt.
    pub(crate) async fn detect_double_fill(&mut self, order: &BrokerOrder, _role: OrderRole) -> bool {
        let Some(trade) = &self.active else { return false };
        if !trade.status.is_terminal() {
            return false;
        }
        if trade.exit_order_id.as_deref() == Some(order.order_id.as_str()) {
            return false;
        }
        let trade = trade.clone();
        self.oco_double_fill(&trade, order).await;
        true
    }

    pub(crate) async fn oco_double_fill(&mut self, trade: &Trade, order: &BrokerOrder) {
        let now = now_ms();
        error!(
            "TradeManager: OCO DOUBLE FILL on trade {} (order {}): position inverted",
            trade.trade_id, order.order_id
        );
        self.alerts.alert(
            AlertKind::Halt,
            &format!(
                "OCO double fill: trade {} order {} filled after terminal state",
                trade.trade_id, order.order_id
            ),
        );

        // Record the detection on the persisted trade even when inactive
        let mut record = trade.clone();
        record.record_event(
            "OCO_DOUBLE_FILL",
            json!({ "orderId": order.order_id.clone(), "detectedAt": now }),
            now,
        );
        if let Err(e) = self.store.update_trade(&record).await {
            warn!("TradeManager: could not record double fill: {}", e);
        }

        self.engage_kill("OCO_DOUBLE_FILL").await;
        self.raise_halt("OCO double fill");
        self.flatten_residual(trade.instrument_token, &trade.trade_id).await;
    }

    /// Panic-exit whatever net quantity the broker still shows for `token`,
    /// independent of any trade record. Allowed under halt.
    pub(crate) async fn flatten_residual(&mut self, token: u32, origin_trade_id: &str) {
        let net_qty = match self.broker.positions().await {
            Ok(snapshot) => snapshot.net_qty_by_token().get(&token).copied().unwrap_or(0),
            Err(e) => {
                error!("TradeManager: cannot read positions for residual flatten: {}", e);
                return;
            }
        };
        if net_qty == 0 {
            info!("TradeManager: no residual position for token {}", token);
            return;
        }
        if let Some(active) = &self.active
            && active.instrument_token == token
        {
            self.panic_exit("RESIDUAL_POSITION", true).await;
            return;
        }

        // No active record owns this position; synthesize one so the panic
        // leg and its postbacks have a home.
        warn!(
            "TradeManager: flattening orphan residual qty {} on token {} (from {})",
            net_qty, token, origin_trade_id
        );
        match self.rehydrate_recovery_trade(token, net_qty).await {
            Some(()) => self.panic_exit("RESIDUAL_POSITION", true).await,
            None => error!("TradeManager: residual flatten could not build a recovery record"),
        }
    }

    /// TP1 filled (fully or the filled part of a cancelled partial): shrink
    /// the position to the runner, resize the stop, lock breakeven.
    pub(crate) async fn scale_out_tp1(&mut self, filled_qty: i64, fill_price: Decimal) {
        let now = now_ms();
        let Some(trade) = &mut self.active else { return };
        if filled_qty <= 0 {
            return;
        }

        let entry = trade.entry_price.unwrap_or_default();
        let pnl = (fill_price - entry) * trade.side.sign() * Decimal::from(filled_qty);
        trade.pnl_legs.push(PnlLeg {
            role: OrderRole::Tp1,
            qty: filled_qty,
            price: fill_price,
            pnl_inr: pnl,
            at: now,
        });
        trade.tp1_done = true;
        trade.tp1_filled_qty = filled_qty;
        trade.tp1_order_id = None;
        trade.qty = (trade.initial_qty - filled_qty).max(0);
        trade.runner_qty = trade.qty;
        trade.record_event(
            "TP1_FILLED",
            json!({ "qty": filled_qty, "price": fill_price, "runner": trade.qty }),
            now,
        );

        // True breakeven for the runner: entry plus buffer plus the whole
        // round-trip fee share spread over the remaining quantity.
        let tick = trade.instrument.tick_size;
        let fee_share = if trade.qty > 0 {
            self.costs.round_trip_inr(entry, trade.initial_qty) / Decimal::from(trade.qty)
        } else {
            Decimal::ZERO
        };
        let buffer = tick * Decimal::from(self.config.stops.be_buffer_ticks);
        let be_stop = match trade.side {
            Side::Buy => entry + buffer + fee_share,
            Side::Sell => entry - buffer - fee_share,
        };
        let be_stop = round_to_tick(be_stop, tick);
        trade.stop_loss = Some(be_stop);
        trade.sl_trigger = Some(be_stop);
        trade.be_locked = true;

        let runner = trade.qty;
        let sl_order_id = trade.sl_order_id.clone();
        let exit_side = trade.exit_side();
        self.persist_trade().await;
        self.daily_risk.realized_pnl += pnl;
        self.persist_daily().await;

        if runner == 0 {
            // Nothing left to protect: the TP1 was effectively a full exit
            self.cancel_sibling_of(OrderRole::Tp1).await;
            self.close_trade(
                TradeStatus::ExitedTarget,
                Some(fill_price),
                0,
                OrderRole::Tp1,
                "TP1 | FULL_EXIT",
            )
            .await;
            return;
        }

        if let Some(order_id) = sl_order_id {
            let limit = self.sl_limit_price(be_stop, exit_side, tick);
            let patch = ModifyParams {
                price: self
                    .active
                    .as_ref()
                    .and_then(|t| t.sl_order_type)
                    .filter(|k| *k == crate::domain::trading::types::OrderKind::Sl)
                    .map(|_| limit),
                trigger_price: Some(be_stop),
                quantity: Some(runner),
                kind: None,
            };
            match self.modify_order_guarded(&order_id, patch).await {
                Ok(()) => {
                    let trade = self.active.as_mut().expect("checked");
                    trade.sl_limit_price = Some(limit);
                    trade.record_event(
                        "SL_RESIZED_BE",
                        json!({ "trigger": be_stop, "qty": runner }),
                        now_ms(),
                    );
                    self.persist_trade().await;
                }
                Err(e) => {
                    error!("TradeManager: SL resize after TP1 failed: {}", e);
                    self.guard_fail(&format!("SL_RESIZE_FAILED: {}", e)).await;
                }
            }
        } else {
            self.place_exits_if_missing().await;
        }
    }

    // ===== Position-first safety =====

    /// Cross-check one trade against broker net positions. The broker is
    /// ground truth; disagreement always resolves toward flatness.
    pub(crate) async fn position_first_check(
        &mut self,
        trade: &Trade,
        pos_by_token: &HashMap<u32, i64>,
        now: i64,
    ) {
        if !self.config.reconcile.oco_position_reconciler_enabled {
            return;
        }
        let broker_qty = pos_by_token
            .get(&trade.instrument_token)
            .copied()
            .unwrap_or(0);
        let expected = match trade.side {
            Side::Buy => trade.qty,
            Side::Sell => -trade.qty,
        };

        if trade.status.holds_position() {
            if broker_qty == 0 {
                // Flat at the broker while we think we hold. Give an exit in
                // progress its grace window before declaring staleness.
                let exit_in_progress = trade.panic_exit_order_id.is_some()
                    || trade.exit_order_id.is_some()
                    || trade
                        .last_event_at
                        .is_some_and(|at| now - at < self.config.reconcile.oco_flat_grace_ms);
                if exit_in_progress {
                    return;
                }
                error!(
                    "TradeManager: trade {} is LIVE but broker shows flat; closing record",
                    trade.trade_id
                );
                self.engage_kill("POSITION_VANISHED").await;
                if self
                    .active
                    .as_ref()
                    .is_some_and(|t| t.trade_id == trade.trade_id)
                {
                    let ltp = self.last_price.get(&trade.instrument_token).copied();
                    self.close_trade(
                        TradeStatus::Closed,
                        ltp,
                        trade.qty,
                        OrderRole::BrokerSquareoff,
                        "POSITION_VANISHED",
                    )
                    .await;
                }
                return;
            }

            let sign_flipped = broker_qty.signum() != expected.signum();
            let over = broker_qty.abs() > expected.abs();
            if sign_flipped || over {
                error!(
                    "TradeManager: over-exit on {}: broker {} vs expected {}",
                    trade.trade_id, broker_qty, expected
                );
                self.engage_kill("OVER_EXIT").await;
                self.raise_halt("broker quantity exceeds or opposes the trade");
                self.flatten_residual(trade.instrument_token, &trade.trade_id).await;
            }
        } else if trade.status.is_terminal() && broker_qty != 0 {
            error!(
                "TradeManager: leftover exposure after terminal trade {}: qty {}",
                trade.trade_id, broker_qty
            );
            self.engage_kill("LEFTOVER_EXPOSURE").await;
            self.raise_halt("position outlived its trade record");
            self.flatten_residual(trade.instrument_token, &trade.trade_id).await;
        }
    }
}
