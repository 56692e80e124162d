use crate::domain::errors::StoreError;
use crate::domain::ports::BrokerOrder;
use crate::domain::risk::state::{DailyRisk, RiskState};
use crate::domain::trading::trade::Trade;
use crate::domain::trading::types::OrderRole;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLink {
    pub order_id: String,
    pub trade_id: String,
    pub role: OrderRole,
    pub created_at: i64,
}

/// A postback that arrived before its order link existed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanOrderUpdate {
    pub order_id: String,
    pub update: BrokerOrder,
    pub attempts: u32,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveOrderEntry {
    pub order: BrokerOrder,
    pub status: String,
    pub role: Option<OrderRole>,
    /// "postback" or "reconcile"
    pub source: String,
    pub seen_at: i64,
}

/// Last-known broker order objects for one trade, used to hydrate after a
/// restart and to detect stale/regressing status updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveOrderSnapshot {
    pub by_order_id: HashMap<String, LiveOrderEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLogEntry {
    pub order_id: String,
    pub trade_id: Option<String>,
    pub status: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable persistence surface for the engine. One implementation over
/// SQLite lives in `infrastructure::persistence`.
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn insert_trade(&self, trade: &Trade) -> StoreResult<()>;

    /// Full-row write validated through the state machine: the persisted
    /// status must be able to transition to `trade.status`, otherwise the
    /// write is rejected and nothing changes.
    async fn update_trade(&self, trade: &Trade) -> StoreResult<()>;

    async fn get_trade(&self, trade_id: &str) -> StoreResult<Option<Trade>>;
    async fn get_active_trades(&self) -> StoreResult<Vec<Trade>>;
    /// Most recently closed trades, newest first, for the position-first
    /// reconciler's short lookback window.
    async fn get_recently_closed(&self, limit: u32) -> StoreResult<Vec<Trade>>;

    async fn link_order(&self, link: &OrderLink) -> StoreResult<()>;
    async fn find_trade_by_order(&self, order_id: &str) -> StoreResult<Option<(Trade, OrderRole)>>;

    async fn save_orphan_order_update(&self, orphan: &OrphanOrderUpdate) -> StoreResult<()>;
    async fn pop_orphan_order_updates(&self, order_id: &str)
        -> StoreResult<Vec<OrphanOrderUpdate>>;
    async fn dead_letter(&self, orphan: &OrphanOrderUpdate, reason: &str) -> StoreResult<()>;
    /// Drop queue rows older than the TTL. Returns the number purged.
    async fn purge_expired_orphans(&self, ttl_ms: i64, now_ms: i64) -> StoreResult<u64>;

    async fn append_order_log(&self, entry: &OrderLogEntry) -> StoreResult<()>;

    async fn upsert_live_order_snapshot(
        &self,
        trade_id: &str,
        snapshot: &LiveOrderSnapshot,
    ) -> StoreResult<()>;
    async fn get_live_order_snapshots_by_trade_ids(
        &self,
        trade_ids: &[String],
    ) -> StoreResult<HashMap<String, LiveOrderSnapshot>>;

    async fn upsert_daily_risk(&self, risk: &DailyRisk) -> StoreResult<()>;
    async fn get_daily_risk(&self, date: NaiveDate) -> StoreResult<Option<DailyRisk>>;

    async fn upsert_risk_state(&self, state: &RiskState) -> StoreResult<()>;
    async fn get_risk_state(&self, date: NaiveDate) -> StoreResult<Option<RiskState>>;
}
