//! Broker postback handling: snapshot + regression filter, order-link
//! lookup with orphan queueing, and per-role dispatch.

use crate::application::engine::manager::{now_ms, TradeManager};
use crate::domain::ports::{BrokerOrder, OrderStatusWire};
use crate::domain::repositories::OrphanOrderUpdate;
use crate::domain::trading::state_machine::{self, TradeStatus};
use crate::domain::trading::types::{bps_of, OrderRole, Side};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, warn};

impl TradeManager {
    pub async fn on_order_update(&mut self, order: BrokerOrder) {
        let now = now_ms();

        // Resolve the trade this order belongs to
        let link = match self.store.find_trade_by_order(&order.order_id).await {
            Ok(link) => link,
            Err(e) => {
                warn!("TradeManager: link lookup failed for {}: {}", order.order_id, e);
                None
            }
        };

        let (trade_id, role) = match link {
            Some((trade, role)) => (trade.trade_id, role),
            None => {
                self.append_order_log(&order, None).await;
                if let Some(role) = self.match_broker_squareoff(&order) {
                    let trade_id = self
                        .active
                        .as_ref()
                        .map(|t| t.trade_id.clone())
                        .expect("squareoff match implies active trade");
                    info!(
                        "TradeManager: unlinked {} matched active trade as {}",
                        order.order_id, role
                    );
                    self.link_order_for(&trade_id, &order.order_id, role).await;
                    (trade_id, role)
                } else {
                    self.queue_orphan(order, now).await;
                    return;
                }
            }
        };

        // Terminal-regression filter + last-known snapshot
        if !self.remember_order(&trade_id, &order, Some(role), "postback").await {
            return;
        }
        self.append_order_log(&order, Some(&trade_id)).await;

        // OCO cancels we initiated come back as CANCELLED; consume silently.
        if order.status == OrderStatusWire::Cancelled
            && self.expected_cancels.remove(&order.order_id)
        {
            info!("TradeManager: expected cancel confirmed for {}", order.order_id);
            self.maybe_schedule_reconcile();
            return;
        }

        // The active trade is authoritative in memory; postbacks for other
        // (recently closed) trades only matter for double-fill detection.
        let is_active = self
            .active
            .as_ref()
            .is_some_and(|t| t.trade_id == trade_id);
        if !is_active {
            self.handle_inactive_trade_update(&trade_id, role, &order).await;
            self.maybe_schedule_reconcile();
            return;
        }

        match role {
            OrderRole::Entry => self.handle_entry_update(&order).await,
            OrderRole::Sl => self.handle_sl_update(&order).await,
            OrderRole::Target => self.handle_target_update(&order).await,
            OrderRole::Tp1 => self.handle_tp1_update(&order).await,
            OrderRole::PanicExit => self.handle_panic_update(&order).await,
            OrderRole::BrokerSquareoff => self.handle_squareoff_update(&order).await,
        }

        self.maybe_schedule_reconcile();
    }

    fn maybe_schedule_reconcile(&mut self) {
        if self.config.reconcile.on_order_update {
            self.schedule_reconcile();
        }
    }

    /// Heuristic for postbacks with no link: a COMPLETE on the active
    /// trade's symbol, on the exit side, for its quantity is the broker's
    /// own square-off (RMS/EOD) and must be adopted, not orphaned.
    fn match_broker_squareoff(&self, order: &BrokerOrder) -> Option<OrderRole> {
        let trade = self.active.as_ref()?;
        if order.status != OrderStatusWire::Complete {
            return None;
        }
        if order.tradingsymbol != trade.instrument.tradingsymbol {
            return None;
        }
        if order.side != trade.exit_side() {
            return None;
        }
        if !trade.status.holds_position() {
            return None;
        }
        Some(OrderRole::BrokerSquareoff)
    }

    async fn queue_orphan(&mut self, order: BrokerOrder, now: i64) {
        // Re-queues of the same order id carry their attempt count forward
        // so a link that never materializes ends in the DLQ, not a loop.
        let prior = self
            .store
            .pop_orphan_order_updates(&order.order_id)
            .await
            .unwrap_or_default();
        let attempts = prior.iter().map(|o| o.attempts).max().unwrap_or(0) + 1;
        let created_at = prior.first().map(|o| o.created_at).unwrap_or(now);

        let orphan = OrphanOrderUpdate {
            order_id: order.order_id.clone(),
            update: order,
            attempts,
            created_at,
        };

        if attempts > self.config.reconcile.orphan_max_attempts {
            warn!(
                "TradeManager: orphan {} exceeded {} attempts, dead-lettering",
                orphan.order_id, self.config.reconcile.orphan_max_attempts
            );
            self.metrics.orphans_dead_lettered.inc();
            if let Err(e) = self.store.dead_letter(&orphan, "no order link after retries").await {
                warn!("TradeManager: dead-letter of {} failed: {}", orphan.order_id, e);
            }
            return;
        }

        self.metrics.orphans_queued.inc();
        if let Err(e) = self.store.save_orphan_order_update(&orphan).await {
            warn!("TradeManager: failed to queue orphan {}: {}", orphan.order_id, e);
        } else {
            info!(
                "TradeManager: queued orphan postback for {} (attempt {})",
                orphan.order_id, attempts
            );
        }
    }

    /// Replay queued postbacks once a link exists for `order_id`.
    pub(crate) async fn drain_orphans_for(&mut self, order_id: &str) {
        let orphans = match self.store.pop_orphan_order_updates(order_id).await {
            Ok(o) => o,
            Err(e) => {
                warn!("TradeManager: orphan pop failed for {}: {}", order_id, e);
                return;
            }
        };
        for orphan in orphans {
            info!("TradeManager: replaying orphan postback for {}", orphan.order_id);
            Box::pin(self.on_order_update(orphan.update)).await;
        }
    }

    // ===== Entry =====

    pub(crate) async fn handle_entry_update(&mut self, order: &BrokerOrder) {
        let now = now_ms();
        let Some(trade) = &mut self.active else { return };

        match order.status {
            OrderStatusWire::Open | OrderStatusWire::TriggerPending => {
                if trade.status == TradeStatus::EntryPlaced {
                    trade.status = TradeStatus::EntryOpen;
                    self.persist_trade().await;
                }
            }
            OrderStatusWire::Partial => {
                // Protect whatever is filled; a later COMPLETE resizes again.
                let filled = order.filled_quantity;
                if filled > 0 && filled != trade.qty {
                    trade.qty = filled;
                    if order.average_price > Decimal::ZERO {
                        trade.entry_price = Some(order.average_price);
                    }
                    trade.record_event(
                        "ENTRY_PARTIAL",
                        json!({ "filled": filled, "avg": order.average_price }),
                        now,
                    );
                    self.persist_trade().await;
                    self.place_exits_if_missing().await;
                }
            }
            OrderStatusWire::Complete => {
                if state_machine::is_stale_entry_fill(trade.status) {
                    info!(
                        "TradeManager: stale ENTRY_FILLED for {} in {}, dropped",
                        order.order_id, trade.status
                    );
                    return;
                }
                self.entry_filled(order).await;
            }
            OrderStatusWire::Rejected | OrderStatusWire::Lapsed | OrderStatusWire::Cancelled => {
                if order.filled_quantity > 0 {
                    // Partial fill then dead order: keep the position guarded
                    trade.qty = order.filled_quantity;
                    if order.average_price > Decimal::ZERO {
                        trade.entry_price = Some(order.average_price);
                    }
                    trade.entry_finalized = true;
                    trade.record_event(
                        "ENTRY_DEAD_WITH_PARTIAL",
                        json!({ "filled": order.filled_quantity, "status": order.status.as_wire() }),
                        now,
                    );
                    self.persist_trade().await;
                    self.place_exits_if_missing().await;
                } else {
                    let reason = format!(
                        "{}: {}",
                        order.status.as_wire(),
                        order.status_message.as_deref().unwrap_or("entry died")
                    );
                    self.entry_failed(&reason).await;
                }
            }
            _ => {}
        }
    }

    async fn entry_filled(&mut self, order: &BrokerOrder) {
        let now = now_ms();
        let trade = self.active.as_mut().expect("caller checked");

        let fill_price = if order.average_price > Decimal::ZERO {
            order.average_price
        } else {
            order.price
        };
        if order.filled_quantity > 0 {
            trade.qty = order.filled_quantity;
        }
        trade.entry_price = Some(fill_price);
        trade.entry_filled_at = Some(now);
        trade.entry_finalized = true;
        trade.status = TradeStatus::EntryFilled;
        trade.record_event(
            "ENTRY_FILLED",
            json!({ "avg": fill_price, "qty": trade.qty }),
            now,
        );

        // Slippage vs the decision price, adverse only
        let mut slip_bps = Decimal::ZERO;
        if let Some(expected) = trade.expected_entry_price
            && expected > Decimal::ZERO
        {
            let adverse = (fill_price - expected) * trade.side.sign();
            if adverse > Decimal::ZERO {
                slip_bps = adverse / expected * Decimal::from(10_000);
            }
            trade.entry_slippage_bps = Some(slip_bps);
            trade.entry_slippage_inr = Some(adverse.max(Decimal::ZERO) * Decimal::from(trade.qty));
        }
        let is_option = trade.option_meta.is_some();
        let token = trade.instrument_token;
        let trade_id = trade.trade_id.clone();
        let side = trade.side;
        let qty = trade.qty;

        self.persist_trade().await;
        self.record_entry_slippage(is_option, slip_bps).await;

        // The entry watchdog is done; protective legs take over.
        self.scheduler.cancel_for_trade(&trade_id);
        self.risk_state.track_open(crate::domain::risk::state::OpenPosition {
            token,
            trade_id: trade_id.clone(),
            side,
            qty,
        });
        self.persist_risk().await;

        // Exits placed on an earlier partial need their quantities pushed up
        let had_exits = self
            .active
            .as_ref()
            .is_some_and(|t| t.sl_order_id.is_some() || t.target_order_id.is_some());
        self.place_exits_if_missing().await;
        if had_exits {
            self.resize_exits_to_qty().await;
        }

        if let Some(trade) = &mut self.active
            && trade.status == TradeStatus::EntryFilled
        {
            trade.status = TradeStatus::Live;
            self.persist_trade().await;
        }
    }

    // ===== Stop-loss =====

    pub(crate) async fn handle_sl_update(&mut self, order: &BrokerOrder) {
        let Some(trade) = &self.active else { return };

        match order.status {
            OrderStatusWire::Complete => {
                if self.detect_double_fill(order, OrderRole::Sl).await {
                    return;
                }
                let exit_price = if order.average_price > Decimal::ZERO {
                    order.average_price
                } else {
                    order.price
                };
                if let Some(trade) = self.active.as_mut() {
                    trade.exit_order_id = Some(order.order_id.clone());
                    trade.exit_order_role = Some(OrderRole::Sl);
                }
                // OCO: the sibling target must die before we are flat
                self.cancel_sibling_of(OrderRole::Sl).await;
                let qty = order.filled_quantity.max(self.active.as_ref().map(|t| t.qty).unwrap_or(0));
                self.close_trade(
                    TradeStatus::ExitedSl,
                    Some(exit_price),
                    qty,
                    OrderRole::Sl,
                    "SL | FILLED",
                )
                .await;
            }
            OrderStatusWire::Rejected => {
                let msg = order.status_message.clone().unwrap_or_default();
                self.guard_fail(&format!("SL_REJECTED: {}", msg)).await;
            }
            OrderStatusWire::Cancelled => {
                // Unexpected cancel of the protective stop while holding
                if trade.status.holds_position() {
                    self.guard_fail("SL_CANCELLED_EXTERNALLY").await;
                }
            }
            OrderStatusWire::TriggerPending | OrderStatusWire::Open | OrderStatusWire::Triggered => {
                // Normal resting states; the tick path arms the watchdog
            }
            _ => {}
        }
    }

    // ===== Target =====

    pub(crate) async fn handle_target_update(&mut self, order: &BrokerOrder) {
        let Some(trade) = &self.active else { return };

        match order.status {
            OrderStatusWire::Complete => {
                if self.detect_double_fill(order, OrderRole::Target).await {
                    return;
                }
                let exit_price = if order.average_price > Decimal::ZERO {
                    order.average_price
                } else {
                    order.price
                };
                if let Some(trade) = self.active.as_mut() {
                    trade.exit_order_id = Some(order.order_id.clone());
                    trade.exit_order_role = Some(OrderRole::Target);
                }
                self.cancel_sibling_of(OrderRole::Target).await;
                let qty = order.filled_quantity.max(self.active.as_ref().map(|t| t.qty).unwrap_or(0));
                self.close_trade(
                    TradeStatus::ExitedTarget,
                    Some(exit_price),
                    qty,
                    OrderRole::Target,
                    "TARGET | FILLED",
                )
                .await;
            }
            OrderStatusWire::Rejected => {
                // Margin/RMS rejection of the resting order: virtual target
                let now = now_ms();
                warn!(
                    "TradeManager: target {} rejected, tracking virtually",
                    order.order_id
                );
                let trade = self.active.as_mut().expect("checked");
                trade.target_virtual = true;
                trade.target_order_id = None;
                trade.record_event(
                    "TARGET_VIRTUAL",
                    json!({ "reason": order.status_message.clone() }),
                    now,
                );
                self.persist_trade().await;
            }
            OrderStatusWire::Cancelled => {
                if trade.status.holds_position() {
                    // Not ours (expected cancels were consumed earlier):
                    // reconcile will re-place the missing leg
                    warn!("TradeManager: target cancelled externally, will re-place");
                    let trade = self.active.as_mut().expect("checked");
                    trade.target_order_id = None;
                    self.persist_trade().await;
                    self.schedule_reconcile();
                }
            }
            _ => {}
        }
    }

    // ===== TP1 =====

    pub(crate) async fn handle_tp1_update(&mut self, order: &BrokerOrder) {
        let now = now_ms();
        let Some(trade) = &mut self.active else { return };

        match order.status {
            OrderStatusWire::Partial => {
                trade.tp1_filled_qty = order.filled_quantity;
                self.persist_trade().await;
            }
            OrderStatusWire::Complete => {
                let fill_price = if order.average_price > Decimal::ZERO {
                    order.average_price
                } else {
                    order.price
                };
                let filled = order.filled_quantity.max(trade.tp1_qty);
                self.scale_out_tp1(filled, fill_price).await;
            }
            OrderStatusWire::Cancelled => {
                if trade.tp1_filled_qty > 0 {
                    // Partial TP1 then cancel: scale out what we got
                    let filled = trade.tp1_filled_qty;
                    let price = if order.average_price > Decimal::ZERO {
                        order.average_price
                    } else {
                        trade.tp1_price.unwrap_or_default()
                    };
                    self.scale_out_tp1(filled, price).await;
                } else {
                    trade.tp1_aborted = true;
                    trade.tp1_order_id = None;
                    trade.record_event("TP1_CANCELLED", json!({}), now);
                    self.persist_trade().await;
                }
            }
            OrderStatusWire::Rejected => {
                trade.tp1_aborted = true;
                trade.tp1_order_id = None;
                trade.record_event(
                    "TP1_REJECTED",
                    json!({ "reason": order.status_message.clone() }),
                    now,
                );
                self.persist_trade().await;
                // Single full-size target instead
                self.place_exits_if_missing().await;
            }
            _ => {}
        }
    }

    // ===== Panic exit =====

    pub(crate) async fn handle_panic_update(&mut self, order: &BrokerOrder) {
        let Some(trade) = &self.active else { return };

        match order.status {
            OrderStatusWire::Complete => {
                let exit_price = if order.average_price > Decimal::ZERO {
                    order.average_price
                } else {
                    order.price
                };
                let reason = trade
                    .exit_reason
                    .clone()
                    .unwrap_or_else(|| "PANIC_EXIT".to_string());
                let qty = order.filled_quantity;
                self.close_trade(
                    TradeStatus::Closed,
                    Some(exit_price),
                    qty,
                    OrderRole::PanicExit,
                    &format!("{} | FILLED", reason),
                )
                .await;
            }
            OrderStatusWire::Rejected | OrderStatusWire::Cancelled | OrderStatusWire::Lapsed => {
                // The panic-exit watchdog owns the retry ladder; make sure
                // the order id is clear so a retry can place a fresh one.
                warn!(
                    "TradeManager: panic exit {} died with {}",
                    order.order_id,
                    order.status.as_wire()
                );
                let trade = self.active.as_mut().expect("checked");
                if trade.panic_exit_order_id.as_deref() == Some(order.order_id.as_str()) {
                    trade.panic_exit_order_id = None;
                }
                self.persist_trade().await;
            }
            _ => {}
        }
    }

    // ===== Broker square-off =====

    pub(crate) async fn handle_squareoff_update(&mut self, order: &BrokerOrder) {
        if order.status != OrderStatusWire::Complete {
            return;
        }
        let Some(_trade) = &self.active else { return };
        let exit_price = if order.average_price > Decimal::ZERO {
            order.average_price
        } else {
            order.price
        };
        warn!("TradeManager: broker square-off detected ({})", order.order_id);
        if let Some(trade) = self.active.as_mut() {
            trade.exit_order_id = Some(order.order_id.clone());
            trade.exit_order_role = Some(OrderRole::BrokerSquareoff);
        }
        // Our own resting legs are now orphans at the broker; cancel them.
        self.cancel_sibling_of(OrderRole::BrokerSquareoff).await;
        let qty = order.filled_quantity;
        self.close_trade(
            TradeStatus::Closed,
            Some(exit_price),
            qty,
            OrderRole::BrokerSquareoff,
            "BROKER_SQUAREOFF | FILLED",
        )
        .await;
    }

    /// Updates for trades that are no longer active. The dangerous case is
    /// a sibling COMPLETE arriving after the trade already closed from the
    /// other side: both exits filled, we are now net short/long.
    async fn handle_inactive_trade_update(
        &mut self,
        trade_id: &str,
        role: OrderRole,
        order: &BrokerOrder,
    ) {
        if order.status != OrderStatusWire::Complete {
            return;
        }
        let trade = match self.store.get_trade(trade_id).await {
            Ok(Some(t)) => t,
            _ => return,
        };
        if !trade.status.is_terminal() {
            return;
        }
        if trade.exit_order_id.as_deref() == Some(order.order_id.as_str()) {
            return; // the fill that closed it, replayed
        }
        if !matches!(role, OrderRole::Sl | OrderRole::Target | OrderRole::Tp1) {
            return;
        }
        self.oco_double_fill(&trade, order).await;
    }

    // ===== Watchdog arming from ticks =====

    pub(crate) async fn arm_watchdogs_on_tick(&mut self, ltp: Decimal, now: i64) {
        let Some(trade) = &self.active else { return };
        if !trade.status.holds_position() {
            return;
        }
        let trade_id = trade.trade_id.clone();

        // SL watchdog: trigger crossed but the stop is still working
        if self.config.watchdogs.sl_enabled
            && let (Some(sl_order_id), Some(trigger)) =
                (trade.sl_order_id.clone(), trade.sl_trigger.or(trade.stop_loss))
            && !self.scheduler.is_armed(&trade_id, "sl_watchdog")
        {
            let buffer = bps_of(trigger, self.config.watchdogs.sl_trigger_bps_buffer);
            let crossed = match trade.side {
                Side::Buy => ltp <= trigger + buffer,
                Side::Sell => ltp >= trigger - buffer,
            };
            let breach_ok = !self.config.watchdogs.sl_require_ltp_breach || crossed;
            if crossed && breach_ok {
                self.scheduler.arm(crate::application::engine::scheduler::ScheduledTask {
                    due: tokio::time::Instant::now()
                        + tokio::time::Duration::from_secs(self.config.watchdogs.sl_open_sec),
                    trade_id: trade_id.clone(),
                    kind: crate::application::engine::scheduler::TaskKind::SlWatchdog {
                        order_id: sl_order_id,
                    },
                    armed_at_ms: now,
                });
            }
        }

        // Target watchdog: price touched the target but the order rests
        let Some(trade) = &self.active else { return };
        if self.config.watchdogs.target_enabled
            && !trade.target_virtual
            && let (Some(target_order_id), Some(target)) =
                (trade.target_order_id.clone(), trade.target_price)
            && !self.scheduler.is_armed(&trade_id, "target_watchdog")
            && !self.in_flight.target_watchdog
        {
            let touched = match trade.side {
                Side::Buy => ltp >= target,
                Side::Sell => ltp <= target,
            };
            if touched {
                self.scheduler.arm(crate::application::engine::scheduler::ScheduledTask {
                    due: tokio::time::Instant::now()
                        + tokio::time::Duration::from_millis(
                            self.config.watchdogs.target_retry_interval_ms,
                        ),
                    trade_id,
                    kind: crate::application::engine::scheduler::TaskKind::TargetWatchdogRetry {
                        order_id: target_order_id,
                        retries_left: self.config.watchdogs.target_retries,
                    },
                    armed_at_ms: now,
                });
            }
        }
    }

    /// Virtual target: the level is tracked from ticks; crossing it cancels
    /// the SL and fires a market exit.
    pub(crate) async fn check_virtual_target(&mut self, ltp: Decimal, _now: i64) {
        let Some(trade) = &self.active else { return };
        if !trade.target_virtual || !trade.status.holds_position() {
            return;
        }
        let Some(target) = trade.target_price.or(trade.planned_target_price) else {
            return;
        };
        if self.in_flight.virtual_target {
            return;
        }
        let hit = match trade.side {
            Side::Buy => ltp >= target,
            Side::Sell => ltp <= target,
        };
        if !hit {
            return;
        }

        self.in_flight.virtual_target = true;
        info!(
            "TradeManager: virtual target {} hit at {}, exiting",
            target, ltp
        );
        self.metrics.watchdog_fires.with_label_values(&["virtual_target"]).inc();
        self.virtual_target_exit().await;
        self.in_flight.virtual_target = false;
    }
}
