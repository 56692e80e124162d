//! Broker reconciliation: periodic and postback-debounced. Position-first;
//! net positions are ground truth, order state is advisory.

use crate::application::engine::manager::{now_ms, TradeManager};
use crate::domain::ports::{AlertKind, BrokerOrder, OrderStatusWire};
use crate::domain::trading::state_machine::TradeStatus;
use crate::domain::trading::tag;
use crate::domain::trading::trade::Trade;
use crate::domain::trading::types::{round_to_tick, OrderRole, Side};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use tracing::{error, info, warn};

impl TradeManager {
    #[tracing::instrument(skip_all)]
    pub async fn reconcile(&mut self) {
        if self.in_flight.reconcile {
            return;
        }
        self.in_flight.reconcile = true;
        self.metrics.reconcile_runs.inc();

        let result = self.reconcile_inner().await;
        self.in_flight.reconcile = false;
        if let Err(e) = result {
            warn!("Reconciler: pass failed: {}", e);
        }
    }

    async fn reconcile_inner(&mut self) -> anyhow::Result<()> {
        let now = now_ms();
        let (orders, positions) =
            futures::join!(self.broker.orders(), self.broker.positions());
        let orders = orders.map_err(|e| anyhow::anyhow!("orders fetch: {}", e))?;
        let positions = positions.map_err(|e| anyhow::anyhow!("positions fetch: {}", e))?;
        let pos_by_token = positions.net_qty_by_token();
        let orders_by_id: HashMap<String, &BrokerOrder> =
            orders.iter().map(|o| (o.order_id.clone(), o)).collect();

        // Recently closed trades first: leftover exposure on a terminal
        // trade must kill + flatten, never be adopted as a fresh recovery.
        self.finalize_recent_closed(&pos_by_token, now).await;

        // Rehydrate the in-memory active trade after a restart
        if self.active.is_none() {
            let mut actives = self.store.get_active_trades().await?;
            if let Some(trade) = actives.pop() {
                info!("Reconciler: rehydrated active trade {} ({})", trade.trade_id, trade.status);
                self.active = Some(trade);
            }
        }

        // No record anywhere, but the broker says we hold something
        if self.active.is_none() {
            for (token, qty) in pos_by_token.iter() {
                if *qty != 0 {
                    warn!(
                        "Reconciler: broker position {} on token {} with no trade record",
                        qty, token
                    );
                    if self.rehydrate_recovery_trade(*token, *qty).await.is_some() {
                        if self.config.reconcile.hard_flatten_on_restart {
                            self.panic_exit("RESTART_FLATTEN", true).await;
                        } else {
                            self.place_exits_if_missing().await;
                        }
                    }
                    break; // single-trade engine: one recovery at a time
                }
            }
        }

        let Some(trade) = self.active.clone() else {
            return Ok(());
        };

        // Drain any orphan postbacks for orders we know about
        let known_orders: Vec<String> = [
            trade.entry_order_id.clone(),
            trade.sl_order_id.clone(),
            trade.target_order_id.clone(),
            trade.tp1_order_id.clone(),
            trade.panic_exit_order_id.clone(),
        ]
        .into_iter()
        .flatten()
        .collect();
        for order_id in &known_orders {
            self.drain_orphans_for(order_id).await;
        }

        // Cross-check each leg against the broker's order book, replaying
        // any terminal state the postback stream lost.
        for (role, order_id) in [
            (OrderRole::Entry, trade.entry_order_id.clone()),
            (OrderRole::Sl, trade.sl_order_id.clone()),
            (OrderRole::Target, trade.target_order_id.clone()),
            (OrderRole::Tp1, trade.tp1_order_id.clone()),
            (OrderRole::PanicExit, trade.panic_exit_order_id.clone()),
        ] {
            let Some(order_id) = order_id else { continue };
            let Some(broker_order) = orders_by_id.get(order_id.as_str()) else {
                continue;
            };
            if self.leg_state_diverged(&trade, role, broker_order) {
                info!(
                    "Reconciler: replaying missed {} update for {} ({})",
                    broker_order.status.as_wire(),
                    order_id,
                    role
                );
                Box::pin(self.on_order_update((*broker_order).clone())).await;
            }
        }

        // Tag-scan: orders the broker accepted that we never recorded
        // (lost place responses) get adopted by their tag.
        if let Some(snapshot) = self.active.clone() {
            for order in &orders {
                let Some(order_tag) = order.tag.as_deref() else { continue };
                let Some(role) = tag::parse_role(order_tag, &snapshot.trade_id) else {
                    continue;
                };
                let known = snapshot.order_id_for_role(role) == Some(order.order_id.as_str());
                if !known && !order.status.is_terminal() {
                    warn!(
                        "Reconciler: adopting untracked {} order {} by tag",
                        role, order.order_id
                    );
                    self.adopt_order(role, &order.order_id).await;
                }
            }
        }

        // A filled position must never sit unprotected
        if let Some(trade) = &self.active
            && trade.status.holds_position()
            && (trade.sl_order_id.is_none()
                || (!trade.target_virtual
                    && trade.target_order_id.is_none()
                    && trade.tp1_order_id.is_none()))
        {
            self.place_exits_if_missing().await;
        }

        // Entry died without us noticing: close the record
        if let Some(trade) = self.active.clone()
            && matches!(trade.status, TradeStatus::EntryPlaced | TradeStatus::EntryOpen)
            && let Some(entry_id) = &trade.entry_order_id
            && let Some(broker_order) = orders_by_id.get(entry_id.as_str())
            && broker_order.status.is_terminal()
            && broker_order.status != OrderStatusWire::Complete
            && broker_order.filled_quantity == 0
        {
            info!("Reconciler: entry {} is dead at the broker, closing record", entry_id);
            self.entry_failed(&format!("ENTRY_{}", broker_order.status.as_wire())).await;
        }

        // Position-first invariant for the active trade
        if let Some(trade) = self.active.clone() {
            self.position_first_check(&trade, &pos_by_token, now).await;
        }

        Ok(())
    }

    /// Order state at the broker that our trade record does not reflect.
    fn leg_state_diverged(&self, trade: &Trade, role: OrderRole, order: &BrokerOrder) -> bool {
        match order.status {
            OrderStatusWire::Complete => match role {
                OrderRole::Entry => !matches!(
                    trade.status,
                    TradeStatus::Live
                        | TradeStatus::EntryFilled
                        | TradeStatus::RecoveryRehydrated
                ) && !trade.status.is_terminal(),
                OrderRole::Sl | OrderRole::Target | OrderRole::PanicExit => {
                    !trade.status.is_terminal()
                }
                OrderRole::Tp1 => !trade.tp1_done,
                OrderRole::BrokerSquareoff => !trade.status.is_terminal(),
            },
            OrderStatusWire::Rejected | OrderStatusWire::Cancelled | OrderStatusWire::Lapsed => {
                // Terminal-dead legs we still reference are divergences,
                // unless we cancelled them ourselves.
                !self.expected_cancels.contains(&order.order_id)
                    && trade.order_id_for_role(role) == Some(order.order_id.as_str())
                    && trade.status.holds_position()
            }
            _ => false,
        }
    }

    async fn adopt_order(&mut self, role: OrderRole, order_id: &str) {
        let Some(trade) = &mut self.active else { return };
        match role {
            OrderRole::Entry => trade.entry_order_id = Some(order_id.to_string()),
            OrderRole::Sl => trade.sl_order_id = Some(order_id.to_string()),
            OrderRole::Target => trade.target_order_id = Some(order_id.to_string()),
            OrderRole::Tp1 => trade.tp1_order_id = Some(order_id.to_string()),
            OrderRole::PanicExit => trade.panic_exit_order_id = Some(order_id.to_string()),
            OrderRole::BrokerSquareoff => {}
        }
        let trade_id = trade.trade_id.clone();
        self.persist_trade().await;
        self.link_order_for(&trade_id, order_id, role).await;
    }

    /// Build a recovery trade for a broker position with no record, so the
    /// engine can reassert protective exits. Never engages the kill switch
    /// by itself.
    pub(crate) async fn rehydrate_recovery_trade(&mut self, token: u32, net_qty: i64) -> Option<()> {
        let now = now_ms();
        let instrument = match self.router.instrument(token).await {
            Ok(Some(i)) => i,
            _ => {
                error!("Reconciler: no instrument for token {}, cannot recover", token);
                return None;
            }
        };
        let side = if net_qty > 0 { Side::Buy } else { Side::Sell };
        let qty = net_qty.abs();

        let ltp = match self.last_price.get(&token).copied() {
            Some(p) => p,
            None => {
                let key = instrument.quote_key();
                match self.broker.ltp(&[key.clone()]).await {
                    Ok(map) => map.get(&key).copied().unwrap_or_default(),
                    Err(_) => Decimal::ZERO,
                }
            }
        };
        if ltp <= Decimal::ZERO {
            error!("Reconciler: no price for recovery on token {}", token);
            return None;
        }

        // Risk-derived stop from configured per-trade risk
        let per_unit = self.config.risk.risk_per_trade_inr / Decimal::from(qty.max(1));
        let stop = round_to_tick(ltp - side.sign() * per_unit, instrument.tick_size);

        let trade_id = uuid::Uuid::new_v4().to_string();
        let mut trade = Trade::new(
            trade_id.clone(),
            token,
            instrument,
            side,
            qty,
            ltp,
            stop,
            self.config.orders.default_product,
            "recovery".to_string(),
            "recovery".to_string(),
            "UNKNOWN".to_string(),
            Decimal::ZERO,
            now,
        );
        trade.status = TradeStatus::RecoveryRehydrated;
        trade.entry_price = Some(ltp);
        trade.entry_filled_at = Some(now);
        trade.entry_finalized = true;
        trade.risk_inr = Some(self.config.risk.risk_per_trade_inr);
        trade.risk_pts = Some(per_unit);
        // Planner owns the target for recoveries; no resting target now
        trade.target_virtual = true;
        trade.record_event("RECOVERY_REHYDRATED", json!({ "netQty": net_qty, "ltp": ltp }), now);

        if let Err(e) = self.store.insert_trade(&trade).await {
            error!("Reconciler: could not persist recovery trade: {}", e);
            return None;
        }
        self.alerts.alert(
            AlertKind::Recovery,
            &format!("recovery trade {} for token {} qty {}", trade_id, token, net_qty),
        );
        self.risk_state.track_open(crate::domain::risk::state::OpenPosition {
            token,
            trade_id,
            side,
            qty,
        });
        self.persist_risk().await;
        self.active = Some(trade);
        self.metrics.trades_opened.inc();
        Some(())
    }

    /// Recently closed trades: position-first leftover checks, then the
    /// final terminal -> CLOSED hop once the broker book is flat.
    async fn finalize_recent_closed(&mut self, pos_by_token: &HashMap<u32, i64>, now: i64) {
        let recent = match self
            .store
            .get_recently_closed(self.config.reconcile.recent_closed_lookback)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("Reconciler: recent-closed load failed: {}", e);
                return;
            }
        };
        for trade in recent {
            self.position_first_check(&trade, pos_by_token, now).await;

            let flat = pos_by_token
                .get(&trade.instrument_token)
                .copied()
                .unwrap_or(0)
                == 0;
            if flat && trade.status.is_terminal() && trade.status != TradeStatus::Closed {
                let mut finalized = trade.clone();
                finalized.status = TradeStatus::Closed;
                finalized.updated_at = now;
                if let Err(e) = self.store.update_trade(&finalized).await {
                    warn!("Reconciler: finalize of {} failed: {}", finalized.trade_id, e);
                }
            }
        }
    }
}
