//! Signal intake: the ordered entry gates, sizing, and entry placement.

use crate::application::engine::manager::{now_ms, TradeManager};
use crate::application::engine::scheduler::{ScheduledTask, TaskKind};
use crate::application::sizing::SizingOutcome;
use crate::config::{OptSlMode, OptTargetMode};
use crate::domain::ports::{OptionCandidate, OrderParams, Quote};
use crate::domain::risk::filters::cost_gate::{CostGate, CostGateConfig};
use crate::domain::risk::filters::edge_gate::{EdgeGate, EdgeGateConfig};
use crate::domain::risk::filters::exposure_gate::{ExposureGate, ExposureGateConfig};
use crate::domain::risk::filters::pacing_gate::{PacingGate, PacingGateConfig};
use crate::domain::risk::filters::regime_gate::{RegimeGate, RegimeGateConfig};
use crate::domain::risk::filters::sl_quality_gate::{SlQualityGate, SlQualityConfig};
use crate::domain::risk::filters::spread_gate::{SpreadGate, SpreadGateConfig};
use crate::domain::risk::filters::{run_gates, GateContext, GateResult, SignalGate};
use crate::domain::risk::state::DayState;
use crate::domain::trading::state_machine::TradeStatus;
use crate::domain::trading::tag::order_tag;
use crate::domain::trading::trade::Trade;
use crate::domain::trading::types::{
    round_to_tick, Instrument, OptionMeta, OrderKind, OrderRole, Side, Signal, Validity,
};
use rust_decimal::Decimal;
use serde_json::json;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// The instrument a signal will actually trade, after option routing.
pub(crate) struct RoutedTarget {
    pub token: u32,
    pub instrument: Instrument,
    pub option_meta: Option<OptionMeta>,
    pub quote: Option<Quote>,
    /// Multiplier from liquidity health, 0..=1.
    pub confidence_mult: Decimal,
}

impl TradeManager {
    fn gate_block(&self, code: &'static str, detail: &str) {
        self.metrics.gate_blocks.with_label_values(&[code]).inc();
        info!("TradeManager: signal refused [{}] {}", code, detail);
    }

    #[tracing::instrument(skip_all, fields(token = signal.instrument_token, side = %signal.side))]
    pub async fn on_signal(&mut self, signal: Signal) {
        let now = now_ms();
        self.buffer_candle(signal.instrument_token, signal.candle);

        // 1. Single active trade
        if let Some(active) = &self.active {
            self.gate_block("ACTIVE_TRADE_EXISTS", &active.trade_id.clone());
            return;
        }
        // 2. No-trade window
        if self.in_no_trade_window(now) {
            self.gate_block("NO_TRADE_WINDOW", "inside a configured no-trade window");
            return;
        }
        // 3. Global switches and cooldowns
        if !self.config.trading_enabled {
            self.gate_block("TRADING_DISABLED", "TRADING_ENABLED=false");
            return;
        }
        if self.halted {
            self.gate_block("HALTED", "engine halt is raised");
            return;
        }
        if self.kill_engaged() {
            self.gate_block("KILL_SWITCH", "kill switch engaged");
            return;
        }
        if self.slippage_cooldown_until_ms > now {
            self.gate_block("SLIPPAGE_COOLDOWN", "slippage feedback cooldown");
            return;
        }
        let token_key = signal.instrument_token.to_string();
        if self.risk_state.in_cooldown(&token_key, now) {
            self.gate_block("STRATEGY_COOLDOWN", &token_key);
            return;
        }
        if self.breakers.cooling_down(now) {
            self.gate_block("CIRCUIT_BREAKER_COOLDOWN", "breaker cooldown active");
            return;
        }

        // 4. Option routing + liquidity pre-check
        let routed = match self.route_signal(&signal, now).await {
            Ok(r) => r,
            Err((code, detail)) => {
                self.gate_block(code, &detail);
                return;
            }
        };

        // 5. Daily state
        match self.daily_risk.state {
            DayState::HardStop => {
                self.gate_block("DAILY_HARD_STOP", "day is hard-stopped");
                return;
            }
            DayState::SoftStop => {
                self.gate_block("DAILY_SOFT_STOP", "day is soft-stopped");
                return;
            }
            DayState::Running => {}
        }

        let mut confidence = signal.confidence * routed.confidence_mult;

        // Entry price from the routed book: cross the spread for immediacy
        let ltp = routed
            .quote
            .as_ref()
            .map(|q| q.last_price)
            .or_else(|| self.last_price.get(&routed.token).copied())
            .unwrap_or(signal.candle.close);
        let entry_price = match (&routed.quote, signal.side) {
            (Some(q), Side::Buy) => q.best_ask().unwrap_or(ltp),
            (Some(q), Side::Sell) => q.best_bid().unwrap_or(ltp),
            (None, _) => ltp,
        };
        if entry_price <= Decimal::ZERO {
            self.gate_block("NO_PRICE", "no usable entry price");
            return;
        }

        // Initial stop: strategy-provided for the signal instrument, premium
        // rule when the trade was routed to an option.
        let proposed_sl = if routed.option_meta.is_some() {
            match self.config.stops.opt_sl_mode {
                OptSlMode::Pct => {
                    entry_price
                        - signal.side.sign() * entry_price * self.config.stops.opt_stop_pct
                }
                OptSlMode::Points => {
                    entry_price - signal.side.sign() * self.config.stops.opt_sl_points
                }
            }
        } else {
            match signal.stop_loss {
                Some(sl) => sl,
                None => {
                    self.gate_block("NO_STOP", "signal carries no stop-loss");
                    return;
                }
            }
        };

        // 9. Plan overlay: structure stop + RR target from recent candles
        let candles = self.candle_slice(routed.token);
        let (mut stop_loss, planned_target) = self.planner.initial_plan(
            signal.side,
            entry_price,
            round_to_tick(proposed_sl, routed.instrument.tick_size),
            &candles,
            routed.instrument.tick_size,
            self.config.stops.rr_target,
        );
        let target = match signal.target {
            // Honor an explicit strategy target when it is nearer than plan
            Some(t) if signal.side == Side::Buy && t < planned_target => t,
            Some(t) if signal.side == Side::Sell && t > planned_target => t,
            _ => planned_target,
        };

        // 10. Adaptive optimizer
        let advice = self
            .advisor
            .evaluate(&signal.strategy_id, &routed.instrument.tradingsymbol, &signal.regime)
            .await;
        if advice.blocked {
            self.gate_block(
                "ADAPTIVE_BLOCK",
                advice.reason.as_deref().unwrap_or("advisor block"),
            );
            return;
        }
        confidence *= advice.confidence_mult;

        // 5b-8. Pre-sizing gates (pacing floor, spread, regime, SL quality)
        let mut gated_signal = signal.clone();
        gated_signal.confidence = confidence;
        let pre_sizing: Vec<Box<dyn SignalGate>> = vec![
            Box::new(PacingGate::new(PacingGateConfig {
                min_confidence: self.config.min_signal_confidence,
                ..PacingGateConfig::default()
            })),
            Box::new(SpreadGate::new(SpreadGateConfig {
                max_spread_bps_eq: self.config.max_spread_bps_eq,
                max_spread_bps_fut: self.config.max_spread_bps_fut,
                max_spread_bps_opt: self.config.max_spread_bps_opt,
                ..SpreadGateConfig::default()
            })),
            Box::new(RegimeGate::new(RegimeGateConfig {
                min_atr_pct: self.config.min_atr_pct,
                max_atr_pct: self.config.max_atr_pct,
                min_rel_volume: self.config.min_rel_volume,
                ..RegimeGateConfig::default()
            })),
            Box::new(SlQualityGate::new(SlQualityConfig::default())),
        ];
        let ctx = GateContext {
            signal: &gated_signal,
            instrument: &routed.instrument,
            quote: routed.quote.as_ref(),
            ltp,
            entry_price,
            stop_loss,
            target: Some(target),
            qty: None,
            recent_candles: &candles,
            risk_state: &self.risk_state,
            day_state: self.daily_risk.state,
            day_realized_pnl: self.daily_risk.realized_pnl,
            est_charges_inr: None,
            option_meta: routed.option_meta.clone(),
            now_ms: now,
        };
        if let GateResult::Block(code, detail) = run_gates(&pre_sizing, &ctx) {
            if code == "SPREAD_WIDE" {
                let hits = self.breakers.record_spread_spike(now);
                if self.config.breakers.enabled && hits >= self.config.breakers.max_spread_spikes_5m
                {
                    self.trip_breaker("spread spikes", now);
                }
            }
            self.gate_block(code, &detail);
            return;
        }

        // 11-12. Sizing with lot policy, freeze cap and risk-cap fitter
        let outcome = self.sizer.size(
            &routed.instrument,
            signal.side,
            entry_price,
            stop_loss,
            advice.qty_mult,
        );
        let (qty, risk_inr, risk_pts, sl_fitted) = match outcome {
            SizingOutcome::Sized { qty, stop_loss: sl, risk_inr, risk_pts, sl_fitted } => {
                stop_loss = sl;
                (qty, risk_inr, risk_pts, sl_fitted)
            }
            SizingOutcome::Blocked { code, reason } => {
                self.gate_block(code, &reason);
                return;
            }
        };

        // 13-15. Post-sizing gates (exposure, option edge, costs)
        let est_charges = self.costs.round_trip_inr(entry_price, qty);
        let post_sizing: Vec<Box<dyn SignalGate>> = vec![
            Box::new(ExposureGate::new(ExposureGateConfig {
                max_position_value_inr: self.config.risk.max_position_value_inr,
                max_portfolio_value_inr: self.config.risk.max_portfolio_value_inr,
                ..ExposureGateConfig::default()
            })),
            Box::new(EdgeGate::new(EdgeGateConfig::default())),
            Box::new(CostGate::new(CostGateConfig::default())),
        ];
        let ctx = GateContext {
            qty: Some(qty),
            stop_loss,
            est_charges_inr: Some(est_charges),
            ..ctx
        };
        if let GateResult::Block(code, detail) = run_gates(&post_sizing, &ctx) {
            self.gate_block(code, &detail);
            return;
        }

        // All gates passed: build and place the entry.
        self.open_trade(
            &signal, routed, entry_price, stop_loss, target, qty, risk_inr, risk_pts, sl_fitted,
            confidence, est_charges, now,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn open_trade(
        &mut self,
        signal: &Signal,
        routed: RoutedTarget,
        entry_price: Decimal,
        stop_loss: Decimal,
        target: Decimal,
        qty: i64,
        risk_inr: Decimal,
        risk_pts: Decimal,
        sl_fitted: bool,
        confidence: Decimal,
        est_charges: Decimal,
        now: i64,
    ) -> Option<()> {
        let trade_id = Uuid::new_v4().to_string();
        let is_option = routed.option_meta.is_some();
        let routed_symbol = routed.instrument.tradingsymbol.clone();

        let mut trade = Trade::new(
            trade_id.clone(),
            routed.token,
            routed.instrument.clone(),
            signal.side,
            qty,
            entry_price,
            stop_loss,
            self.config.orders.default_product,
            signal.strategy_id.clone(),
            signal.strategy_style.clone(),
            signal.regime.clone(),
            confidence,
            now,
        );
        trade.underlying_token = signal.underlying_token.or(if is_option {
            Some(signal.instrument_token)
        } else {
            None
        });
        trade.option_meta = routed.option_meta;
        trade.planned_target_price = Some(target);
        trade.risk_inr = Some(risk_inr);
        trade.risk_pts = Some(risk_pts);
        trade.rr = if risk_pts > Decimal::ZERO {
            Some(((target - entry_price).abs() / risk_pts).round_dp(2))
        } else {
            None
        };
        trade.est_charges_inr = Some(est_charges);
        trade.min_green_inr = Some(self.costs.min_green_inr(entry_price, qty));
        trade.min_green_pts = Some(self.costs.min_green_pts(entry_price, qty));
        trade.target_virtual =
            is_option && self.config.stops.opt_target_mode == OptTargetMode::Virtual;
        if sl_fitted {
            trade.record_event("SL_FITTED", json!({ "stopLoss": stop_loss }), now);
        }

        if let Err(e) = self.store.insert_trade(&trade).await {
            warn!("TradeManager: could not insert trade: {}", e);
            return None;
        }
        self.daily_risk.last_trade_id = Some(trade_id.clone());

        let entry_kind = if is_option {
            self.config.orders.entry_order_type_opt
        } else {
            self.config.orders.entry_order_type
        };
        let params = OrderParams {
            exchange: routed.instrument.exchange.clone(),
            tradingsymbol: routed.instrument.tradingsymbol.clone(),
            side: signal.side,
            quantity: qty,
            product: trade.product,
            kind: entry_kind,
            validity: Validity::Day,
            price: (entry_kind == OrderKind::Limit).then_some(entry_price),
            trigger_price: None,
            tag: Some(order_tag(&trade_id, OrderRole::Entry)),
            market_protection: (entry_kind == OrderKind::Market
                && self.config.orders.enforce_market_protection)
                .then_some(self.config.orders.market_protection),
        };

        self.active = Some(trade);

        match self.submit_order(params, false).await {
            Ok(order_id) => {
                if let Some(trade) = self.active.as_mut() {
                    trade.entry_order_id = Some(order_id.clone());
                    trade.entry_at = Some(now_ms());
                    trade.status = TradeStatus::EntryOpen;
                    trade.record_event(
                        "ENTRY_PLACED",
                        json!({ "orderId": order_id.clone(), "kind": entry_kind.to_string() }),
                        now_ms(),
                    );
                }
                self.persist_trade().await;
                self.persist_daily().await;
                self.metrics.trades_opened.inc();

                // Linking may replay queued postbacks and advance the trade;
                // only arm the entry watchdog if it is still resting.
                self.link_order_for(&trade_id, &order_id, OrderRole::Entry).await;
                let still_resting = self.active.as_ref().is_some_and(|t| {
                    matches!(t.status, TradeStatus::EntryPlaced | TradeStatus::EntryOpen)
                });
                if entry_kind == OrderKind::Limit && still_resting {
                    self.scheduler.arm(ScheduledTask {
                        due: Instant::now()
                            + Duration::from_millis(self.config.watchdogs.entry_limit_timeout_ms),
                        trade_id: trade_id.clone(),
                        kind: TaskKind::EntryLimitTimeout { order_id },
                        armed_at_ms: now_ms(),
                    });
                }
                info!(
                    "TradeManager: entry placed for {} {} x{} @ ~{} (sl {}, target {})",
                    signal.side,
                    routed_symbol,
                    qty,
                    entry_price,
                    stop_loss,
                    target
                );
                Some(())
            }
            Err(e) => {
                warn!("TradeManager: entry placement failed: {}", e);
                self.entry_failed(&format!("PLACE_FAILED: {}", e)).await;
                None
            }
        }
    }

    /// Entry never became a position: mark failed, bump the failure streak.
    pub(crate) async fn entry_failed(&mut self, reason: &str) {
        let now = now_ms();
        if let Some(trade) = &mut self.active {
            trade.status = TradeStatus::EntryFailed;
            trade.close_reason = Some(reason.to_string());
            trade.closed_at = Some(now);
            trade.record_event("ENTRY_FAILED", json!({ "reason": reason }), now);
        }
        self.persist_trade().await;
        if let Some(trade) = self.active.take() {
            self.scheduler.cancel_for_trade(&trade.trade_id);
        }

        self.record_broker_reject(now);
        self.risk_state.consecutive_failures += 1;
        if self.risk_state.consecutive_failures >= self.config.risk.consecutive_failure_limit {
            self.engage_kill("CONSECUTIVE_ENTRY_FAILURES").await;
        } else {
            self.persist_risk().await;
        }
    }

    // ===== Option routing =====

    /// Resolve what to trade. Signals on an option-mode underlying are
    /// routed to a contract through the picker with a liquidity pre-check;
    /// anything else trades the signal instrument directly.
    pub(crate) async fn route_signal(
        &mut self,
        signal: &Signal,
        now: i64,
    ) -> Result<RoutedTarget, (&'static str, String)> {
        let route_to_option = self.config.option_routing.enabled
            && signal.underlying_token.is_none()
            && self.is_underlying_token(signal.instrument_token).await;

        if !route_to_option {
            let instrument = match self.router.instrument(signal.instrument_token).await {
                Ok(Some(i)) => i,
                Ok(None) => {
                    return Err((
                        "UNKNOWN_INSTRUMENT",
                        format!("token {} not in catalog", signal.instrument_token),
                    ));
                }
                Err(e) => return Err(("CATALOG_ERROR", e.to_string())),
            };
            let quote = self.fetch_quote(&instrument).await;
            return Ok(RoutedTarget {
                token: signal.instrument_token,
                instrument,
                option_meta: None,
                quote,
                confidence_mult: Decimal::ONE,
            });
        }

        let candidates = match self
            .router
            .candidates(signal.instrument_token, signal.side)
            .await
        {
            Ok(c) if !c.is_empty() => c,
            Ok(_) => return Err(("OPT_ROUTE_FAILED", "no option candidates".to_string())),
            Err(e) => return Err(("OPT_ROUTE_FAILED", e.to_string())),
        };

        let take = self.config.option_routing.max_alternates.max(1);
        let mut best: Option<(Decimal, OptionCandidate, Quote)> = None;
        for candidate in candidates.into_iter().take(take) {
            let Some(quote) = self.fetch_quote(&candidate.instrument).await else {
                continue;
            };
            let health = self.liquidity_health(&quote, now);
            if health < self.config.option_routing.min_health {
                self.breakers.record_quote_guard(now);
                continue;
            }
            if best.as_ref().is_none_or(|(h, _, _)| health > *h) {
                best = Some((health, candidate, quote));
            }
        }

        match best {
            Some((health, candidate, quote)) => {
                // Worse books shave confidence, never raise it
                let confidence_mult =
                    (Decimal::new(85, 2) + health / Decimal::from(400)).min(Decimal::ONE);
                info!(
                    "TradeManager: routed to {} (health {:.0})",
                    candidate.instrument.tradingsymbol, health
                );
                Ok(RoutedTarget {
                    token: candidate.instrument_token,
                    instrument: candidate.instrument,
                    option_meta: Some(candidate.meta),
                    quote: Some(quote),
                    confidence_mult,
                })
            }
            None => {
                let hits = self.breakers.record_quote_guard(now);
                if self.config.breakers.enabled
                    && hits >= self.config.breakers.max_quote_guard_hits_5m
                {
                    self.trip_breaker("quote guard", now);
                }
                Err((
                    "OPT_HEALTH_FLOOR",
                    "no candidate met the liquidity health floor".to_string(),
                ))
            }
        }
    }

    async fn is_underlying_token(&self, token: u32) -> bool {
        match self.router.instrument(token).await {
            Ok(Some(instrument)) => !instrument.segment.contains("-OPT"),
            _ => false,
        }
    }

    pub(crate) async fn fetch_quote(&self, instrument: &Instrument) -> Option<Quote> {
        let key = instrument.quote_key();
        match self.broker.quote(&[key.clone()]).await {
            Ok(mut quotes) => quotes.remove(&key),
            Err(e) => {
                warn!("TradeManager: quote fetch failed for {}: {}", key, e);
                None
            }
        }
    }

    /// 0..=100 composite of spread, top-of-book depth and quote freshness.
    pub(crate) fn liquidity_health(&self, quote: &Quote, now: i64) -> Decimal {
        let mut health = Decimal::from(100);

        match quote.spread_bps() {
            Some(spread) => {
                let cap = self.config.max_spread_bps_opt.max(Decimal::ONE);
                let penalty = (spread / cap * Decimal::from(50)).min(Decimal::from(60));
                health -= penalty;
            }
            None => return Decimal::ZERO,
        }

        let min_depth = self.config.option_routing.min_depth_qty;
        let bid_depth = quote.buy_depth.first().map(|l| l.quantity).unwrap_or(0);
        let ask_depth = quote.sell_depth.first().map(|l| l.quantity).unwrap_or(0);
        if bid_depth < min_depth || ask_depth < min_depth {
            health -= Decimal::from(25);
        }

        if let Some(ts) = quote.timestamp {
            if now - ts > self.config.option_routing.quote_stale_ms {
                health -= Decimal::from(30);
            }
        } else {
            health -= Decimal::from(10);
        }

        health.max(Decimal::ZERO)
    }
}
