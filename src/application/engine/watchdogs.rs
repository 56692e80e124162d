//! Watchdog firings. Every body re-reads current state first: a task armed
//! seconds ago may describe a world that no longer exists.

use crate::application::engine::manager::{now_ms, TradeManager};
use crate::application::engine::scheduler::{ScheduledTask, TaskKind};
use crate::domain::ports::{AlertKind, ModifyParams, OrderStatusWire};
use crate::domain::trading::state_machine::TradeStatus;
use crate::domain::trading::types::{round_to_tick, OrderKind, OrderRole, Side};
use serde_json::json;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

impl TradeManager {
    /// Fire every scheduled task that is due. The run loop calls this from
    /// its timer; it is public so operational tooling can pump the queue.
    pub async fn fire_due_tasks(&mut self) {
        for task in self.scheduler.pop_due(Instant::now()) {
            // Trade moved on? The task is void.
            let still_relevant = self
                .active
                .as_ref()
                .is_some_and(|t| t.trade_id == task.trade_id && !t.status.is_terminal());
            if !still_relevant {
                continue;
            }
            match task.kind.clone() {
                TaskKind::EntryLimitTimeout { order_id } => {
                    self.entry_limit_timeout(&task, &order_id).await;
                }
                TaskKind::SlWatchdog { order_id } => {
                    self.sl_watchdog_fire(&task, &order_id).await;
                }
                TaskKind::TargetWatchdogRetry { order_id, retries_left } => {
                    self.target_watchdog_fire(&task, &order_id, retries_left).await;
                }
                TaskKind::PanicExitTimeout { order_id, retries_left } => {
                    self.panic_exit_timeout(&task, &order_id, retries_left).await;
                }
            }
        }
    }

    /// Latest broker view of one order, preferring history over the list.
    async fn fresh_order_status(&self, order_id: &str) -> Option<(OrderStatusWire, i64)> {
        match self.broker.order_history(order_id).await {
            Ok(history) if !history.is_empty() => history
                .last()
                .map(|o| (o.status, o.filled_quantity)),
            _ => match self.broker.orders().await {
                Ok(orders) => orders
                    .into_iter()
                    .find(|o| o.order_id == order_id)
                    .map(|o| (o.status, o.filled_quantity)),
                Err(e) => {
                    warn!("TradeManager: order status probe failed for {}: {}", order_id, e);
                    None
                }
            },
        }
    }

    // ===== Entry-limit fallback =====

    /// LIMIT entry rested too long. Grace-recheck, cancel, and only a
    /// zero-fill cancel earns a MARKET fallback; any partial fill is
    /// protected in place instead.
    pub(crate) async fn entry_limit_timeout(&mut self, task: &ScheduledTask, order_id: &str) {
        if self.in_flight.entry_fallback {
            return;
        }
        self.in_flight.entry_fallback = true;
        self.metrics.watchdog_fires.with_label_values(&["entry_limit_timeout"]).inc();

        let outcome = self.entry_limit_timeout_inner(task, order_id).await;
        self.in_flight.entry_fallback = false;
        if let Err(reason) = outcome {
            warn!("TradeManager: entry fallback aborted: {}", reason);
        }
    }

    async fn entry_limit_timeout_inner(
        &mut self,
        task: &ScheduledTask,
        order_id: &str,
    ) -> Result<(), String> {
        // Grace recheck: the fill may have landed while the task was queued
        tokio::time::sleep(Duration::from_millis(self.config.watchdogs.entry_grace_recheck_ms))
            .await;

        let trade_still_open = self
            .active
            .as_ref()
            .is_some_and(|t| {
                t.trade_id == task.trade_id
                    && matches!(t.status, TradeStatus::EntryPlaced | TradeStatus::EntryOpen)
            });
        if !trade_still_open {
            return Err("trade advanced during grace window".into());
        }

        let status = self.fresh_order_status(order_id).await;
        match status {
            Some((OrderStatusWire::Complete, _)) => {
                // The postback will (or did) do the rest
                return Err("entry filled during grace window".into());
            }
            Some((s, filled)) if s.is_terminal() => {
                if filled == 0 {
                    self.entry_failed(&format!("ENTRY_{}", s.as_wire())).await;
                }
                return Err("entry already terminal".into());
            }
            Some((_, filled)) if filled > 0 => {
                // Partial: keep the resting order working the remainder and
                // never fall back to MARKET over it.
                info!("TradeManager: entry {} partially filled, no fallback", order_id);
                return Ok(());
            }
            None => return Err("could not determine entry status".into()),
            _ => {}
        }

        // Still open with zero fills: cancel, confirm, market fallback.
        info!("TradeManager: entry limit timed out, cancelling {}", order_id);
        if let Err(e) = self.cancel_order_expected(order_id).await {
            return Err(format!("cancel failed: {}", e));
        }

        // Confirm the cancel really left zero fills (cancel/fill race)
        tokio::time::sleep(Duration::from_millis(self.config.watchdogs.entry_grace_recheck_ms))
            .await;
        if let Some((status, filled)) = self.fresh_order_status(order_id).await {
            if filled > 0 {
                info!("TradeManager: cancel raced a partial fill ({} qty), protecting it", filled);
                return Ok(());
            }
            if status == OrderStatusWire::Complete {
                return Err("entry completed during cancel".into());
            }
        }

        let (params, trade_id) = {
            let trade = self.active.as_ref().ok_or("no active trade")?;
            let params = crate::domain::ports::OrderParams {
                exchange: trade.instrument.exchange.clone(),
                tradingsymbol: trade.instrument.tradingsymbol.clone(),
                side: trade.side,
                quantity: trade.qty,
                product: trade.product,
                kind: OrderKind::Market,
                validity: crate::domain::trading::types::Validity::Day,
                price: None,
                trigger_price: None,
                tag: Some(crate::domain::trading::tag::order_tag(
                    &trade.trade_id,
                    OrderRole::Entry,
                )),
                market_protection: self
                    .config
                    .orders
                    .enforce_market_protection
                    .then_some(self.config.orders.market_protection),
            };
            (params, trade.trade_id.clone())
        };

        match self.submit_order(params, false).await {
            Ok(new_order_id) => {
                if let Some(trade) = self.active.as_mut() {
                    trade.entry_order_id = Some(new_order_id.clone());
                    trade.record_event(
                        "ENTRY_MARKET_FALLBACK",
                        json!({ "orderId": new_order_id.clone() }),
                        now_ms(),
                    );
                }
                self.persist_trade().await;
                self.link_order_for(&trade_id, &new_order_id, OrderRole::Entry).await;
                Ok(())
            }
            Err(e) => {
                self.entry_failed(&format!("MARKET_FALLBACK_FAILED: {}", e)).await;
                Err(e.to_string())
            }
        }
    }

    // ===== SL watchdog =====

    /// Armed when LTP crossed the trigger; fired `open_sec` later. If the
    /// stop still has not completed, it is presumed wedged: cancel it and
    /// go to market.
    pub(crate) async fn sl_watchdog_fire(&mut self, task: &ScheduledTask, order_id: &str) {
        let holds = self
            .active
            .as_ref()
            .is_some_and(|t| t.trade_id == task.trade_id && t.status.holds_position());
        if !holds {
            return;
        }

        match self.fresh_order_status(order_id).await {
            Some((OrderStatusWire::Complete, _)) => return,
            Some((OrderStatusWire::Cancelled | OrderStatusWire::Rejected, _)) => {
                // Someone else killed the stop; treat as guard failure
                self.guard_fail("SL_DEAD_AT_WATCHDOG").await;
                return;
            }
            None => warn!("TradeManager: SL watchdog could not probe {}", order_id),
            _ => {}
        }

        self.metrics.watchdog_fires.with_label_values(&["sl_watchdog"]).inc();
        self.alerts.alert(
            AlertKind::WatchdogFire,
            &format!("SL {} triggered but unfilled after {}s", order_id, self.config.watchdogs.sl_open_sec),
        );
        error!(
            "TradeManager: SL watchdog firing for {} (order {})",
            task.trade_id, order_id
        );

        if self.config.watchdogs.sl_kill_switch_on_fire {
            self.engage_kill("SL_WATCHDOG_FIRE").await;
        }
        if let Err(e) = self.cancel_order_expected(order_id).await {
            warn!("TradeManager: SL watchdog cancel failed: {}", e);
        }
        if let Some(trade) = &mut self.active {
            trade.sl_order_id = None;
        }
        self.panic_exit("SL_TRIGGERED_NOT_FILLED", true).await;
    }

    // ===== Target watchdog =====

    /// Price touched the target but the resting limit did not fill: chase
    /// the book by moving the limit into the spread; after the retry budget,
    /// cancel and take MARKET.
    pub(crate) async fn target_watchdog_fire(
        &mut self,
        task: &ScheduledTask,
        order_id: &str,
        retries_left: u32,
    ) {
        if self.in_flight.target_watchdog {
            return;
        }
        let holds = self
            .active
            .as_ref()
            .is_some_and(|t| t.trade_id == task.trade_id && t.status.holds_position());
        if !holds {
            return;
        }

        self.in_flight.target_watchdog = true;
        self.target_watchdog_inner(task, order_id, retries_left).await;
        self.in_flight.target_watchdog = false;
    }

    async fn target_watchdog_inner(
        &mut self,
        task: &ScheduledTask,
        order_id: &str,
        retries_left: u32,
    ) {
        match self.fresh_order_status(order_id).await {
            Some((status, _)) if status.is_terminal() => return,
            None => return,
            _ => {}
        }

        let Some(trade) = &self.active else { return };
        let ltp = self.last_price.get(&trade.instrument_token).copied();
        let still_touched = match (ltp, trade.target_price, trade.side) {
            (Some(p), Some(t), Side::Buy) => p >= t,
            (Some(p), Some(t), Side::Sell) => p <= t,
            _ => false,
        };
        if !still_touched {
            return;
        }

        self.metrics.watchdog_fires.with_label_values(&["target_watchdog"]).inc();

        if retries_left > 0 {
            // Chase: reprice the limit at the near touch of the book
            let instrument = trade.instrument.clone();
            let exit_side = trade.exit_side();
            let tick = instrument.tick_size;
            let quote = self.fetch_quote(&instrument).await;
            let aggressive = quote
                .as_ref()
                .and_then(|q| match exit_side {
                    Side::Sell => q.best_bid(),
                    Side::Buy => q.best_ask(),
                })
                .or(ltp);
            let Some(price) = aggressive else { return };
            let price = round_to_tick(price, tick);

            info!(
                "TradeManager: target chase, repricing {} to {} ({} retries left)",
                order_id, price, retries_left
            );
            match self
                .modify_order_guarded(
                    order_id,
                    ModifyParams { price: Some(price), ..ModifyParams::default() },
                )
                .await
            {
                Ok(()) => {
                    if let Some(trade) = &mut self.active {
                        trade.target_price = Some(price);
                        trade.record_event(
                            "TARGET_CHASED",
                            json!({ "price": price, "retriesLeft": retries_left }),
                            now_ms(),
                        );
                    }
                    self.persist_trade().await;
                    self.scheduler.arm(ScheduledTask {
                        due: Instant::now()
                            + Duration::from_millis(self.config.watchdogs.target_retry_interval_ms),
                        trade_id: task.trade_id.clone(),
                        kind: TaskKind::TargetWatchdogRetry {
                            order_id: order_id.to_string(),
                            retries_left: retries_left - 1,
                        },
                        armed_at_ms: now_ms(),
                    });
                }
                Err(e) => {
                    warn!("TradeManager: target chase modify failed: {}", e);
                    self.schedule_reconcile();
                }
            }
        } else {
            // Retries exhausted: cancel and market out the runner
            warn!("TradeManager: target watchdog out of retries, going to market");
            self.alerts.alert(
                AlertKind::WatchdogFire,
                &format!("target {} touched but unfilled; market exit", order_id),
            );
            if let Err(e) = self.cancel_order_expected(order_id).await {
                warn!("TradeManager: target cancel failed: {}", e);
            }
            if let Some(trade) = &mut self.active {
                trade.target_order_id = None;
            }
            self.virtual_target_exit().await;
        }
    }

    /// Market exit in the Target role: used by the virtual target and by
    /// the exhausted target watchdog.
    pub(crate) async fn virtual_target_exit(&mut self) {
        let Some(trade) = &self.active else { return };
        if !trade.status.holds_position() {
            return;
        }
        let trade_id = trade.trade_id.clone();
        let instrument = trade.instrument.clone();
        let exit_side = trade.exit_side();
        let qty = trade.qty;
        let product = trade.product;

        // Nothing resting may outlive the exit: cancel the stop and any
        // still-working target before crossing the spread.
        let resting: Vec<String> = {
            let trade = self.active.as_ref().expect("checked above");
            [&trade.sl_order_id, &trade.target_order_id, &trade.tp1_order_id]
                .into_iter()
                .flatten()
                .cloned()
                .collect()
        };
        for order_id in resting {
            if let Err(e) = self.cancel_order_expected(&order_id).await {
                warn!("TradeManager: cancel before market exit failed: {}", e);
            }
        }
        if let Some(trade) = self.active.as_mut() {
            trade.target_order_id = None;
        }

        let params = crate::domain::ports::OrderParams {
            exchange: instrument.exchange.clone(),
            tradingsymbol: instrument.tradingsymbol.clone(),
            side: exit_side,
            quantity: qty,
            product,
            kind: OrderKind::Market,
            validity: crate::domain::trading::types::Validity::Day,
            price: None,
            trigger_price: None,
            tag: Some(crate::domain::trading::tag::order_tag(&trade_id, OrderRole::Target)),
            market_protection: self
                .config
                .orders
                .enforce_market_protection
                .then_some(self.config.orders.market_protection),
        };
        match self.submit_order(params, false).await {
            Ok(order_id) => {
                if let Some(trade) = self.active.as_mut() {
                    trade.target_order_id = Some(order_id.clone());
                    trade.target_order_type = Some(OrderKind::Market);
                    trade.exit_order_id = Some(order_id.clone());
                    trade.exit_order_role = Some(OrderRole::Target);
                    trade.record_event(
                        "TARGET_MARKET_EXIT",
                        json!({ "orderId": order_id.clone() }),
                        now_ms(),
                    );
                }
                self.persist_trade().await;
                self.link_order_for(&trade_id, &order_id, OrderRole::Target).await;
            }
            Err(e) => {
                error!("TradeManager: virtual target exit failed: {}", e);
                self.guard_fail(&format!("VIRTUAL_TARGET_EXIT_FAILED: {}", e)).await;
            }
        }
    }

    // ===== Panic-exit watchdog =====

    pub(crate) async fn panic_exit_timeout(
        &mut self,
        task: &ScheduledTask,
        order_id: &str,
        retries_left: u32,
    ) {
        let holds = self
            .active
            .as_ref()
            .is_some_and(|t| t.trade_id == task.trade_id && !t.status.is_terminal());
        if !holds {
            return;
        }

        match self.fresh_order_status(order_id).await {
            Some((OrderStatusWire::Complete, _)) => return,
            None => {
                warn!("TradeManager: panic watchdog cannot probe {}, retrying later", order_id);
            }
            _ => {}
        }

        self.metrics.watchdog_fires.with_label_values(&["panic_exit_timeout"]).inc();

        if retries_left == 0 {
            error!("TradeManager: panic exit retries exhausted for {}", task.trade_id);
            self.alerts.alert(
                AlertKind::Halt,
                &format!("panic exit for {} not filling; manual intervention needed", task.trade_id),
            );
            self.raise_halt("panic exit unfilled after retries");
            return;
        }

        warn!(
            "TradeManager: panic exit {} unfilled, cancel/replace ({} retries left)",
            order_id, retries_left
        );
        if let Err(e) = self.cancel_order_expected(order_id).await {
            warn!("TradeManager: panic replace cancel failed: {}", e);
        }
        if let Some(trade) = &mut self.active {
            trade.panic_exit_order_id = None;
        }
        let reason = self
            .active
            .as_ref()
            .and_then(|t| t.exit_reason.clone())
            .unwrap_or_else(|| "PANIC_EXIT_RETRY".to_string());
        self.panic_exit(&reason, true).await;
    }

    // ===== Dynamic exit loop =====

    /// Periodic ExitPlanner consultation while a trade is live.
    pub async fn dyn_exit_tick(&mut self) {
        if self.in_flight.dyn_exit {
            return;
        }
        let Some(trade) = &self.active else { return };
        if !trade.status.holds_position() || trade.entry_price.is_none() {
            return;
        }
        let Some(ltp) = self.last_price.get(&trade.instrument_token).copied() else {
            return;
        };

        self.in_flight.dyn_exit = true;
        self.dyn_exit_inner(ltp).await;
        self.in_flight.dyn_exit = false;
    }

    async fn dyn_exit_inner(&mut self, ltp: rust_decimal::Decimal) {
        let now = now_ms();
        let (plan, trade_id) = {
            let trade = self.active.as_ref().expect("caller checked");
            let candles = self.candle_slice(trade.instrument_token);
            let underlying_ltp = trade
                .underlying_token
                .and_then(|t| self.last_price.get(&t).copied());
            (
                self.planner.plan(trade, &candles, ltp, underlying_ltp, now),
                trade.trade_id.clone(),
            )
        };

        // Apply the patch first so state is persisted even if orders fail
        let mut dirty = false;
        if let Some(trade) = &mut self.active {
            if let Some(peak) = plan.patch.peak_ltp {
                trade.peak_ltp = Some(peak);
                dirty = true;
            }
            if plan.patch.be_locked == Some(true) && !trade.be_locked {
                trade.be_locked = true;
                trade.record_event("BE_LOCKED", json!({ "ltp": ltp }), now);
                dirty = true;
            }
            if plan.patch.trail_sl == Some(true) && !trade.trail_sl {
                trade.trail_sl = true;
                dirty = true;
            }
        }

        if let Some(reason) = plan.exit_now {
            info!("TradeManager: planner exit-now {} for {}", reason, trade_id);
            if dirty {
                self.persist_trade().await;
            }
            self.planned_exit(&reason.to_string()).await;
            return;
        }

        if let Some(new_sl) = plan.stop_loss {
            self.apply_sl_move(new_sl).await;
            dirty = false; // apply_sl_move persists
        }

        if let Some(new_target) = plan.target_price {
            self.apply_target_move(new_target).await;
            dirty = false;
        }

        if dirty {
            self.persist_trade().await;
        }
    }

    /// Move the working stop (modify in place when possible).
    pub(crate) async fn apply_sl_move(&mut self, new_sl: rust_decimal::Decimal) {
        let Some(trade) = &self.active else { return };
        let tick = trade.instrument.tick_size;
        let exit_side = trade.exit_side();
        let clamped = trade.clamp_sl_monotone(round_to_tick(new_sl, tick));
        if Some(clamped) == trade.stop_loss {
            return;
        }
        let sl_order_id = trade.sl_order_id.clone();
        let is_limit_stop = trade.sl_order_type == Some(OrderKind::Sl);

        if let Some(trade) = &mut self.active {
            trade.stop_loss = Some(clamped);
            trade.sl_trigger = Some(clamped);
        }
        self.persist_trade().await;

        if let Some(order_id) = sl_order_id {
            let limit = is_limit_stop.then(|| self.sl_limit_price(clamped, exit_side, tick));
            let patch = ModifyParams {
                price: limit,
                trigger_price: Some(clamped),
                quantity: None,
                kind: None,
            };
            if let Err(e) = self.modify_order_guarded(&order_id, patch).await {
                warn!("TradeManager: SL modify failed: {}", e);
                self.schedule_reconcile();
            } else if let Some(trade) = &mut self.active {
                trade.sl_limit_price = limit.or(trade.sl_limit_price);
                trade.record_event("SL_TRAILED", json!({ "trigger": clamped }), now_ms());
            }
        }
    }

    pub(crate) async fn apply_target_move(&mut self, new_target: rust_decimal::Decimal) {
        let Some(trade) = &self.active else { return };
        let tick = trade.instrument.tick_size;
        let rounded = round_to_tick(new_target, tick);
        if Some(rounded) == trade.target_price {
            return;
        }
        let target_order_id = trade.target_order_id.clone();

        if let Some(trade) = &mut self.active {
            trade.target_price = Some(rounded);
        }
        self.persist_trade().await;

        if let Some(order_id) = target_order_id {
            let patch = ModifyParams { price: Some(rounded), ..ModifyParams::default() };
            if let Err(e) = self.modify_order_guarded(&order_id, patch).await {
                warn!("TradeManager: target modify failed: {}", e);
                self.schedule_reconcile();
            }
        }
    }

    /// Planner-initiated exit: cancel working legs and market out, in the
    /// Target role (it is a voluntary exit, not a guard failure).
    async fn planned_exit(&mut self, reason: &str) {
        let Some(trade) = &mut self.active else { return };
        trade.exit_reason = Some(reason.to_string());
        self.persist_trade().await;
        self.virtual_target_exit().await;
    }
}
