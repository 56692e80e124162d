//! Protective exits and flatteners: SL placement with SL-M fallback, target
//! placement with virtual fallback, TP1 scale-out split, panic exit, EOD
//! product conversion and the terminal close record.

use crate::application::engine::manager::{now_ms, TradeManager};
use crate::application::engine::scheduler::{ScheduledTask, TaskKind};
use crate::domain::errors::BrokerError;
use crate::domain::ports::{AlertKind, ConvertPositionParams, OrderParams};
use crate::domain::trading::state_machine::TradeStatus;
use crate::domain::trading::tag::order_tag;
use crate::domain::trading::types::{
    bps_of, round_to_tick, OrderKind, OrderRole, PnlLeg, Product, Side, Validity,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

impl TradeManager {
    /// SL limit price for a stoploss-limit order: trigger price pushed
    /// through by the configured buffer so the limit still fills after the
    /// trigger, capped in bps.
    pub(crate) fn sl_limit_price(&self, trigger: Decimal, exit_side: Side, tick: Decimal) -> Decimal {
        let cfg = &self.config.stops;
        let mut buffer = bps_of(trigger, cfg.sl_limit_buffer_bps)
            .max(tick * Decimal::from(cfg.sl_limit_buffer_ticks))
            .max(cfg.sl_limit_buffer_abs);
        let cap = bps_of(trigger, cfg.sl_limit_buffer_max_bps);
        if cap > Decimal::ZERO {
            buffer = buffer.min(cap);
        }
        let raw = match exit_side {
            // Selling out of a long: limit below trigger
            Side::Sell => trigger - buffer,
            Side::Buy => trigger + buffer,
        };
        round_to_tick(raw, tick)
    }

    /// Place whatever protective legs are missing for the active trade.
    /// Guarded per-trade: postbacks and reconcile ticks may both get here.
    pub(crate) async fn place_exits_if_missing(&mut self) {
        let Some(trade_id) = self.active.as_ref().map(|t| t.trade_id.clone()) else {
            return;
        };
        if !self.in_flight.exit_placement.insert(trade_id.clone()) {
            return;
        }
        self.place_exits_inner().await;
        self.in_flight.exit_placement.remove(&trade_id);
    }

    async fn place_exits_inner(&mut self) {
        let Some(trade) = &self.active else { return };
        // ENTRY_OPEN with a recorded fill price is a partial fill: that
        // quantity needs protection even though the entry still rests.
        let has_exposure = trade.status.holds_position()
            || (trade.status == TradeStatus::EntryOpen && trade.entry_price.is_some());
        if !has_exposure || trade.qty <= 0 {
            return;
        }
        // A panic exit in flight owns the position; do not stack exits on it.
        if trade.panic_exit_order_id.is_some() {
            return;
        }

        if trade.sl_order_id.is_none() {
            self.place_sl_order().await;
        }

        let Some(trade) = &self.active else { return };
        if trade.target_virtual {
            return;
        }
        let want_tp1 = self.config.stops.tp1_enabled
            && !trade.tp1_done
            && !trade.tp1_aborted
            && trade.tp1_order_id.is_none();
        let want_target = trade.target_order_id.is_none();
        if want_tp1 || want_target {
            self.place_target_orders().await;
        }
    }

    async fn place_sl_order(&mut self) {
        let Some(trade) = &self.active else { return };
        let Some(stop) = trade.stop_loss else {
            warn!("TradeManager: trade {} has no stop to place", trade.trade_id);
            return;
        };
        let trade_id = trade.trade_id.clone();
        let instrument = trade.instrument.clone();
        let exit_side = trade.exit_side();
        let qty = trade.qty;
        let product = trade.product;
        let tick = instrument.tick_size;
        let trigger = round_to_tick(stop, tick);

        let preferred = if instrument.exchange == "NFO" || instrument.segment.starts_with("NFO") {
            self.config.stops.stoploss_order_type_fo
        } else {
            self.config.stops.stoploss_order_type_eq
        };

        let mut kind = preferred;
        let mut attempt = self
            .submit_sl(&trade_id, &instrument, exit_side, qty, product, kind, trigger)
            .await;

        if let Err(BrokerError::SlmBlocked { message }) = &attempt {
            // Exchange refuses SL-M on this contract: stoploss-limit fallback
            info!("TradeManager: SL-M blocked ({}), falling back to SL", message);
            kind = OrderKind::Sl;
            attempt = self
                .submit_sl(&trade_id, &instrument, exit_side, qty, product, kind, trigger)
                .await;
        }

        match attempt {
            Ok(order_id) => {
                let limit_price = (kind == OrderKind::Sl)
                    .then(|| self.sl_limit_price(trigger, exit_side, tick));
                if let Some(trade) = self.active.as_mut() {
                    trade.sl_order_id = Some(order_id.clone());
                    trade.sl_order_type = Some(kind);
                    trade.sl_trigger = Some(trigger);
                    trade.sl_limit_price = limit_price;
                    trade.record_event(
                        "SL_PLACED",
                        json!({ "orderId": order_id.clone(), "kind": kind.to_string(), "trigger": trigger }),
                        now_ms(),
                    );
                }
                self.persist_trade().await;
                self.link_order_for(&trade_id, &order_id, OrderRole::Sl).await;
            }
            Err(e) => {
                error!("TradeManager: SL placement failed: {}", e);
                self.guard_fail(&format!("SL_PLACE_FAILED: {}", e)).await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_sl(
        &mut self,
        trade_id: &str,
        instrument: &crate::domain::trading::types::Instrument,
        exit_side: Side,
        qty: i64,
        product: Product,
        kind: OrderKind,
        trigger: Decimal,
    ) -> Result<String, BrokerError> {
        let price = (kind == OrderKind::Sl)
            .then(|| self.sl_limit_price(trigger, exit_side, instrument.tick_size));
        self.submit_order(
            OrderParams {
                exchange: instrument.exchange.clone(),
                tradingsymbol: instrument.tradingsymbol.clone(),
                side: exit_side,
                quantity: qty,
                product,
                kind,
                validity: Validity::Day,
                price,
                trigger_price: Some(trigger),
                tag: Some(order_tag(trade_id, OrderRole::Sl)),
                market_protection: None,
            },
            false,
        )
        .await
    }

    /// TP1/runner split when eligible, single resting target otherwise.
    async fn place_target_orders(&mut self) {
        let Some(trade) = &self.active else { return };
        let Some(entry) = trade.entry_price.or(trade.expected_entry_price) else {
            return;
        };
        let trade_id = trade.trade_id.clone();
        let instrument = trade.instrument.clone();
        let exit_side = trade.exit_side();
        let product = trade.product;
        let tick = instrument.tick_size;
        let lot = instrument.lot_size.max(1);
        let qty = trade.qty;
        let risk_pts = trade.risk_pts.unwrap_or_default();
        let side_sign = trade.side.sign();

        let target = trade
            .planned_target_price
            .unwrap_or_else(|| entry + side_sign * risk_pts * self.config.stops.rr_target);
        let target = round_to_tick(target, tick);

        // Scale-out split, only when both legs stay in whole lots
        let mut tp1_qty = 0;
        if self.config.stops.tp1_enabled && !trade.tp1_done && !trade.tp1_aborted {
            let desired = Decimal::from(qty) * self.config.stops.tp1_fraction;
            let lots = (desired / Decimal::from(lot)).floor();
            tp1_qty = (lots * Decimal::from(lot)).to_i64().unwrap_or(0);
            if tp1_qty <= 0 || tp1_qty >= qty {
                tp1_qty = 0;
            }
        }
        let runner_qty = qty - tp1_qty;

        if tp1_qty > 0 && trade.tp1_order_id.is_none() {
            let tp1_price =
                round_to_tick(entry + side_sign * risk_pts * self.config.stops.tp1_rr, tick);
            let result = self
                .submit_order(
                    OrderParams {
                        exchange: instrument.exchange.clone(),
                        tradingsymbol: instrument.tradingsymbol.clone(),
                        side: exit_side,
                        quantity: tp1_qty,
                        product,
                        kind: OrderKind::Limit,
                        validity: Validity::Day,
                        price: Some(tp1_price),
                        trigger_price: None,
                        tag: Some(order_tag(&trade_id, OrderRole::Tp1)),
                        market_protection: None,
                    },
                    false,
                )
                .await;
            match result {
                Ok(order_id) => {
                    if let Some(trade) = self.active.as_mut() {
                        trade.tp1_order_id = Some(order_id.clone());
                        trade.tp1_price = Some(tp1_price);
                        trade.tp1_qty = tp1_qty;
                        trade.runner_qty = runner_qty;
                    }
                    self.persist_trade().await;
                    self.link_order_for(&trade_id, &order_id, OrderRole::Tp1).await;
                }
                Err(e) => {
                    warn!("TradeManager: TP1 placement failed, single target: {}", e);
                    if let Some(trade) = self.active.as_mut() {
                        trade.tp1_aborted = true;
                    }
                    self.persist_trade().await;
                }
            }
        }

        let Some(trade) = &self.active else { return };
        if trade.target_order_id.is_some() {
            return;
        }
        let resting_qty = if trade.tp1_order_id.is_some() { trade.runner_qty } else { qty };
        if resting_qty <= 0 {
            return;
        }

        let result = self
            .submit_order(
                OrderParams {
                    exchange: instrument.exchange.clone(),
                    tradingsymbol: instrument.tradingsymbol.clone(),
                    side: exit_side,
                    quantity: resting_qty,
                    product,
                    kind: OrderKind::Limit,
                    validity: Validity::Day,
                    price: Some(target),
                    trigger_price: None,
                    tag: Some(order_tag(&trade_id, OrderRole::Target)),
                    market_protection: None,
                },
                false,
            )
            .await;
        match result {
            Ok(order_id) => {
                if let Some(trade) = self.active.as_mut() {
                    trade.target_order_id = Some(order_id.clone());
                    trade.target_order_type = Some(OrderKind::Limit);
                    trade.target_price = Some(target);
                    trade.record_event(
                        "TARGET_PLACED",
                        json!({ "orderId": order_id.clone(), "price": target }),
                        now_ms(),
                    );
                }
                self.persist_trade().await;
                self.link_order_for(&trade_id, &order_id, OrderRole::Target).await;
            }
            Err(BrokerError::Rms { message }) | Err(BrokerError::Other { message }) => {
                // Broker refuses the resting order: track the level from ticks
                warn!(
                    "TradeManager: target rejected ({}), switching to virtual target",
                    message
                );
                if let Some(trade) = self.active.as_mut() {
                    trade.target_virtual = true;
                    trade.target_price = Some(target);
                    trade.record_event("TARGET_VIRTUAL", json!({ "price": target }), now_ms());
                }
                self.persist_trade().await;
            }
            Err(e) => {
                error!("TradeManager: target placement failed: {}", e);
                self.guard_fail(&format!("TARGET_PLACE_FAILED: {}", e)).await;
            }
        }
    }

    /// Push working exit quantities to the trade's current quantity, e.g.
    /// after a partial fill completed. Idempotent re-submits are swallowed.
    pub(crate) async fn resize_exits_to_qty(&mut self) {
        let Some(trade) = &self.active else { return };
        let qty = trade.qty;
        if qty <= 0 {
            return;
        }
        let legs: Vec<String> = [&trade.sl_order_id, &trade.target_order_id]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        for order_id in legs {
            let patch =
                crate::domain::ports::ModifyParams { quantity: Some(qty), ..Default::default() };
            if let Err(e) = self.modify_order_guarded(&order_id, patch).await {
                warn!("TradeManager: exit resize of {} failed: {}", order_id, e);
                self.schedule_reconcile();
            }
        }
    }

    /// Any protective-leg failure is fatal for the trade: guard state, kill
    /// switch, unconditional market exit.
    pub(crate) async fn guard_fail(&mut self, reason: &str) {
        let Some(trade) = &mut self.active else { return };
        warn!("TradeManager: guard failure on {}: {}", trade.trade_id, reason);
        if trade.status != TradeStatus::GuardFailed && !trade.status.is_terminal() {
            trade.status = TradeStatus::GuardFailed;
        }
        trade.record_event("GUARD_FAILED", json!({ "reason": reason }), now_ms());
        self.persist_trade().await;
        self.engage_kill(reason).await;
        self.panic_exit(reason, true).await;
    }

    /// Cancel all working legs, fetch live net quantity, market out.
    /// `allow_when_halted` lets the safety path run under a raised halt.
    pub(crate) async fn panic_exit(&mut self, reason: &str, allow_when_halted: bool) {
        let Some(trade) = &self.active else {
            warn!("TradeManager: panic exit requested without an active trade");
            return;
        };
        if trade.panic_exit_order_id.is_some() {
            return;
        }
        let trade_id = trade.trade_id.clone();
        let instrument = trade.instrument.clone();
        let token = trade.instrument_token;
        let product = trade.product;
        info!("TradeManager: panic exit for {} ({})", trade_id, reason);
        self.metrics.watchdog_fires.with_label_values(&["panic_exit"]).inc();

        // 1. Cancel anything still working
        let working: Vec<String> = {
            let trade = self.active.as_ref().expect("checked");
            [&trade.entry_order_id, &trade.sl_order_id, &trade.target_order_id, &trade.tp1_order_id]
                .into_iter()
                .flatten()
                .cloned()
                .collect()
        };
        for order_id in working {
            if let Err(e) = self.cancel_order_expected(&order_id).await {
                warn!("TradeManager: panic cancel of {} failed: {}", order_id, e);
            }
        }

        // 2. Ground truth: how much is actually on?
        let net_qty = match self.broker.positions().await {
            Ok(snapshot) => snapshot.net_qty_by_token().get(&token).copied().unwrap_or(0),
            Err(e) => {
                warn!("TradeManager: positions fetch failed in panic exit: {}", e);
                // Fall back to what the trade believes
                match self.active.as_ref() {
                    Some(t) if t.side == Side::Buy => t.qty,
                    Some(t) => -t.qty,
                    None => 0,
                }
            }
        };
        if net_qty == 0 {
            info!("TradeManager: already flat, closing record");
            let exit_price = self.last_price.get(&token).copied();
            self.close_trade(
                TradeStatus::Closed,
                exit_price,
                0,
                OrderRole::PanicExit,
                &format!("{} | ALREADY_FLAT", reason),
            )
            .await;
            return;
        }

        let exit_side = if net_qty > 0 { Side::Sell } else { Side::Buy };
        let qty = net_qty.abs();

        // 3. Market out; blocked markets fall back to a crossed limit
        let market = OrderParams {
            exchange: instrument.exchange.clone(),
            tradingsymbol: instrument.tradingsymbol.clone(),
            side: exit_side,
            quantity: qty,
            product,
            kind: OrderKind::Market,
            validity: Validity::Day,
            price: None,
            trigger_price: None,
            tag: Some(order_tag(&trade_id, OrderRole::PanicExit)),
            market_protection: self
                .config
                .orders
                .enforce_market_protection
                .then_some(self.config.orders.market_protection),
        };

        let placed = match self.submit_order(market, allow_when_halted).await {
            Ok(id) => Ok(id),
            Err(e) if self.config.watchdogs.panic_limit_fallback_enabled => {
                warn!("TradeManager: panic MARKET failed ({}), aggressive LIMIT fallback", e);
                self.panic_limit_fallback(
                    &trade_id,
                    token,
                    &instrument,
                    exit_side,
                    qty,
                    product,
                    allow_when_halted,
                )
                .await
            }
            Err(e) => Err(e),
        };

        match placed {
            Ok(order_id) => {
                let now = now_ms();
                if let Some(trade) = self.active.as_mut() {
                    trade.panic_exit_order_id = Some(order_id.clone());
                    trade.exit_order_id = Some(order_id.clone());
                    trade.exit_order_role = Some(OrderRole::PanicExit);
                    trade.exit_reason = Some(reason.to_string());
                    trade.exit_at = Some(now);
                    trade.record_event(
                        "PANIC_EXIT_PLACED",
                        json!({ "orderId": order_id.clone(), "reason": reason, "qty": qty }),
                        now,
                    );
                }
                self.persist_trade().await;
                self.link_order_for(&trade_id, &order_id, OrderRole::PanicExit).await;
                if self.active.as_ref().is_some_and(|t| t.trade_id == trade_id) {
                    self.scheduler.arm(ScheduledTask {
                        due: Instant::now()
                            + Duration::from_millis(
                                self.config.watchdogs.panic_exit_fill_timeout_ms,
                            ),
                        trade_id,
                        kind: TaskKind::PanicExitTimeout {
                            order_id,
                            retries_left: self.config.watchdogs.panic_exit_max_retries,
                        },
                        armed_at_ms: now,
                    });
                }
            }
            Err(e) => {
                error!("TradeManager: PANIC EXIT PLACEMENT FAILED: {}", e);
                self.alerts.alert(
                    AlertKind::Halt,
                    &format!("panic exit could not be placed for {}: {}", trade_id, e),
                );
                self.raise_halt("panic exit placement failed");
            }
        }
    }

    /// Aggressive limit across the spread, capped in bps from last price.
    #[allow(clippy::too_many_arguments)]
    async fn panic_limit_fallback(
        &mut self,
        trade_id: &str,
        token: u32,
        instrument: &crate::domain::trading::types::Instrument,
        exit_side: Side,
        qty: i64,
        product: Product,
        allow_when_halted: bool,
    ) -> Result<String, BrokerError> {
        let reference = match self.fetch_quote(instrument).await {
            Some(q) => match exit_side {
                Side::Sell => q.best_bid().unwrap_or(q.last_price),
                Side::Buy => q.best_ask().unwrap_or(q.last_price),
            },
            None => self.last_price.get(&token).copied().unwrap_or_default(),
        };
        if reference <= Decimal::ZERO {
            return Err(BrokerError::Other { message: "no reference price for limit fallback".into() });
        }
        let cap = bps_of(reference, self.config.watchdogs.panic_limit_fallback_max_bps);
        let price = match exit_side {
            Side::Sell => round_to_tick(reference - cap, instrument.tick_size),
            Side::Buy => round_to_tick(reference + cap, instrument.tick_size),
        };
        self.submit_order(
            OrderParams {
                exchange: instrument.exchange.clone(),
                tradingsymbol: instrument.tradingsymbol.clone(),
                side: exit_side,
                quantity: qty,
                product,
                kind: OrderKind::Limit,
                validity: Validity::Day,
                price: Some(price),
                trigger_price: None,
                tag: Some(order_tag(trade_id, OrderRole::PanicExit)),
                market_protection: None,
            },
            allow_when_halted,
        )
        .await
    }

    /// Terminal close record: realized P&L, registries, schedules.
    pub(crate) async fn close_trade(
        &mut self,
        status: TradeStatus,
        exit_price: Option<Decimal>,
        exit_qty: i64,
        role: OrderRole,
        reason: &str,
    ) {
        let now = now_ms();
        let Some(trade) = &mut self.active else { return };

        let mut leg_pnl = Decimal::ZERO;
        if let (Some(price), Some(entry)) = (exit_price, trade.entry_price)
            && exit_qty > 0
        {
            leg_pnl = (price - entry) * trade.side.sign() * Decimal::from(exit_qty);
            trade.pnl_legs.push(PnlLeg { role, qty: exit_qty, price, pnl_inr: leg_pnl, at: now });
        }
        trade.exit_price = exit_price.or(trade.exit_price);
        trade.close_reason = Some(reason.to_string());
        trade.status = status;
        trade.closed_at = Some(now);
        if trade.exit_at.is_none() {
            trade.exit_at = Some(now);
        }
        trade.record_event("CLOSED", json!({ "reason": reason, "status": status.to_string() }), now);

        let realized = trade.realized_pnl();
        let trade_id = trade.trade_id.clone();
        info!(
            "TradeManager: trade {} closed [{}] realized {}",
            trade_id, reason, realized
        );

        self.persist_trade().await;

        self.daily_risk.realized_pnl += leg_pnl;
        self.daily_risk.last_open_pnl = Decimal::ZERO;
        self.persist_daily().await;

        self.risk_state.untrack(&trade_id);
        self.persist_risk().await;

        self.scheduler.cancel_for_trade(&trade_id);
        self.in_flight.exit_placement.remove(&trade_id);
        self.metrics.trades_closed.inc();
        self.active = None;
        self.schedule_reconcile();
    }

    /// EOD: carry the position overnight as NRML instead of letting the
    /// broker square off MIS.
    pub(crate) async fn eod_convert_to_nrml(&mut self) {
        let Some(trade) = &self.active else { return };
        if trade.product != Product::Mis || !trade.status.holds_position() {
            return;
        }
        let params = ConvertPositionParams {
            exchange: trade.instrument.exchange.clone(),
            tradingsymbol: trade.instrument.tradingsymbol.clone(),
            side: trade.side,
            quantity: trade.qty,
            old_product: Product::Mis,
            new_product: Product::Nrml,
        };
        match self.broker.convert_position(params).await {
            Ok(()) => {
                if let Some(trade) = self.active.as_mut() {
                    trade.product = Product::Nrml;
                    trade.record_event("CONVERTED_NRML", json!({}), now_ms());
                    info!("TradeManager: converted {} MIS->NRML", trade.trade_id);
                }
                self.persist_trade().await;
            }
            Err(e) => warn!("TradeManager: MIS->NRML conversion failed: {}", e),
        }
    }
}
