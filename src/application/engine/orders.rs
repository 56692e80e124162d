//! Order plumbing shared by every leg: rate-limited submission, guarded
//! modify/cancel, expected-cancel marking and live-order snapshots.

use crate::application::engine::manager::{now_ms, TradeManager};
use crate::application::engine::submit::{place_with_retry, RetryPolicy};
use crate::domain::errors::{BrokerError, RateLimitExceeded};
use crate::domain::ports::{BrokerOrder, ModifyParams, OrderParams, Variety};
use crate::domain::repositories::{LiveOrderEntry, OrderLink, OrderLogEntry};
use crate::domain::trading::types::OrderRole;
use tracing::{error, info, warn};

impl TradeManager {
    /// Admit one broker call through both rate limiters. The persisted day
    /// counter reaching its cap engages the kill switch.
    pub(crate) async fn admit_broker_call(&mut self) -> Result<(), BrokerError> {
        let now = now_ms();
        if let Err(e) = self.rate_limiter.check(1, now) {
            if matches!(e, RateLimitExceeded::PerDay { .. }) {
                self.engage_kill("DAILY_ORDER_CAP").await;
            }
            return Err(BrokerError::Other { message: e.to_string() });
        }
        if let Err(e) = self.broker_rate.check(1, now) {
            return Err(BrokerError::Other { message: e.to_string() });
        }
        self.rate_limiter.record(1, now);
        self.broker_rate.record(1, now);
        self.daily_risk.orders_placed = self.rate_limiter.day_count();
        Ok(())
    }

    /// Place an order through the dedup/retry helper. `allow_when_halted`
    /// is reserved for panic exits; everything else is refused under halt.
    pub(crate) async fn submit_order(
        &mut self,
        params: OrderParams,
        allow_when_halted: bool,
    ) -> Result<String, BrokerError> {
        if self.halted && !allow_when_halted {
            return Err(BrokerError::Other {
                message: "engine halted; only panic exits may place orders".to_string(),
            });
        }
        self.admit_broker_call().await?;
        let result =
            place_with_retry(&self.broker, Variety::Regular, params, RetryPolicy::default()).await;
        match &result {
            Ok(order_id) => {
                self.metrics.orders_placed.inc();
                self.persist_daily().await;
                info!("TradeManager: placed order {}", order_id);
            }
            Err(e) => {
                self.persist_daily().await;
                if !e.is_retryable() {
                    self.record_broker_reject(now_ms());
                }
            }
        }
        result
    }

    pub(crate) async fn modify_order_guarded(
        &mut self,
        order_id: &str,
        patch: ModifyParams,
    ) -> Result<(), BrokerError> {
        self.admit_broker_call().await?;
        match self
            .broker
            .modify_order(Variety::Regular, order_id, patch)
            .await
        {
            Ok(_) => Ok(()),
            // Idempotent re-submit: the broker already has these parameters
            Err(BrokerError::NotModified) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Cancel and mark the id expected so the CANCELLED postback is not
    /// misread as a leg failure.
    pub(crate) async fn cancel_order_expected(&mut self, order_id: &str) -> Result<(), BrokerError> {
        self.expected_cancels.insert(order_id.to_string());
        if let Err(e) = self.admit_broker_call().await {
            self.expected_cancels.remove(order_id);
            return Err(e);
        }
        match self.broker.cancel_order(Variety::Regular, order_id).await {
            Ok(_) => Ok(()),
            Err(BrokerError::NotCancellable { message }) => {
                // Being processed: the fill/cancel race resolves via reconcile
                warn!("TradeManager: cancel of {} deferred: {}", order_id, message);
                self.schedule_reconcile();
                Ok(())
            }
            Err(e) => {
                self.expected_cancels.remove(order_id);
                Err(e)
            }
        }
    }

    pub(crate) async fn link_order_for(
        &mut self,
        trade_id: &str,
        order_id: &str,
        role: OrderRole,
    ) {
        let link = OrderLink {
            order_id: order_id.to_string(),
            trade_id: trade_id.to_string(),
            role,
            created_at: now_ms(),
        };
        if let Err(e) = self.store.link_order(&link).await {
            error!(
                "TradeManager: failed to link order {} to trade {}: {}",
                order_id, trade_id, e
            );
        }
        // A link just appeared; drain anything that raced ahead of it
        self.drain_orphans_for(order_id).await;
    }

    pub(crate) async fn append_order_log(&self, order: &BrokerOrder, trade_id: Option<&str>) {
        let entry = OrderLogEntry {
            order_id: order.order_id.clone(),
            trade_id: trade_id.map(|s| s.to_string()),
            status: order.status.as_wire().to_string(),
            payload: serde_json::to_value(order).unwrap_or(serde_json::Value::Null),
            created_at: now_ms(),
        };
        if let Err(e) = self.store.append_order_log(&entry).await {
            warn!("TradeManager: order log append failed: {}", e);
        }
    }

    /// Upsert the last-known order object for the trade. Returns false when
    /// the update regresses a known terminal status and must be dropped.
    pub(crate) async fn remember_order(
        &mut self,
        trade_id: &str,
        order: &BrokerOrder,
        role: Option<OrderRole>,
        source: &str,
    ) -> bool {
        let mut snapshots = self
            .store
            .get_live_order_snapshots_by_trade_ids(&[trade_id.to_string()])
            .await
            .unwrap_or_default();
        let mut snapshot = snapshots.remove(trade_id).unwrap_or_default();

        if let Some(existing) = snapshot.by_order_id.get(&order.order_id) {
            let known = existing.order.status;
            if known.is_terminal() && order.status.rank() < known.rank() {
                info!(
                    "TradeManager: dropping stale {} update for {} (already {})",
                    order.status.as_wire(),
                    order.order_id,
                    known.as_wire()
                );
                return false;
            }
        }

        snapshot.by_order_id.insert(
            order.order_id.clone(),
            LiveOrderEntry {
                order: order.clone(),
                status: order.status.as_wire().to_string(),
                role,
                source: source.to_string(),
                seen_at: now_ms(),
            },
        );
        if let Err(e) = self
            .store
            .upsert_live_order_snapshot(trade_id, &snapshot)
            .await
        {
            warn!("TradeManager: snapshot upsert failed: {}", e);
        }
        true
    }
}
