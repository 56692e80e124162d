use crate::domain::errors::StoreError;
use crate::domain::repositories::{
    LiveOrderSnapshot, OrderLink, OrderLogEntry, OrphanOrderUpdate, StoreResult, TradeStore,
};
use crate::domain::risk::state::{DailyRisk, RiskState};
use crate::domain::trading::state_machine::{self, TradeStatus};
use crate::domain::trading::trade::Trade;
use crate::domain::trading::types::OrderRole;
use crate::infrastructure::persistence::database::Database;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::warn;

pub struct SqliteTradeStore {
    database: Database,
}

impl SqliteTradeStore {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    fn decode_trade(doc: &str, trade_id: &str) -> StoreResult<Trade> {
        serde_json::from_str(doc).map_err(|e| StoreError::Corrupt {
            entity: "trade",
            key: trade_id.to_string(),
            source: e,
        })
    }
}

#[async_trait]
impl TradeStore for SqliteTradeStore {
    async fn insert_trade(&self, trade: &Trade) -> StoreResult<()> {
        let doc = serde_json::to_string(trade).map_err(|e| StoreError::Corrupt {
            entity: "trade",
            key: trade.trade_id.clone(),
            source: e,
        })?;
        sqlx::query(
            r#"
            INSERT INTO trades (trade_id, status, instrument_token, doc, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.trade_id)
        .bind(trade.status.to_string())
        .bind(trade.instrument_token as i64)
        .bind(doc)
        .bind(trade.updated_at)
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }

    async fn update_trade(&self, trade: &Trade) -> StoreResult<()> {
        // Validate the transition against the persisted status; a rejected
        // edge writes nothing.
        let row = sqlx::query("SELECT status FROM trades WHERE trade_id = ?")
            .bind(&trade.trade_id)
            .fetch_optional(&self.database.pool)
            .await?;
        let Some(row) = row else {
            return Err(StoreError::TradeNotFound { trade_id: trade.trade_id.clone() });
        };
        let stored: String = row.try_get("status")?;
        let from = TradeStatus::from_str(&stored).map_err(|_| StoreError::TradeNotFound {
            trade_id: trade.trade_id.clone(),
        })?;
        if !state_machine::can_transition(from, trade.status) {
            return Err(StoreError::InvalidTransition {
                trade_id: trade.trade_id.clone(),
                from,
                to: trade.status,
            });
        }

        let doc = serde_json::to_string(trade).map_err(|e| StoreError::Corrupt {
            entity: "trade",
            key: trade.trade_id.clone(),
            source: e,
        })?;
        // Guard the read-check-write with a status predicate: a concurrent
        // writer that advanced the row to an incompatible status loses.
        let result = sqlx::query(
            r#"
            UPDATE trades SET status = ?, doc = ?, updated_at = ?
            WHERE trade_id = ? AND status = ?
            "#,
        )
        .bind(trade.status.to_string())
        .bind(doc)
        .bind(trade.updated_at)
        .bind(&trade.trade_id)
        .bind(&stored)
        .execute(&self.database.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(
                "TradeStore: conditional update of {} lost a race, skipped",
                trade.trade_id
            );
        }
        Ok(())
    }

    async fn get_trade(&self, trade_id: &str) -> StoreResult<Option<Trade>> {
        let row = sqlx::query("SELECT doc FROM trades WHERE trade_id = ?")
            .bind(trade_id)
            .fetch_optional(&self.database.pool)
            .await?;
        match row {
            Some(row) => {
                let doc: String = row.try_get("doc")?;
                Ok(Some(Self::decode_trade(&doc, trade_id)?))
            }
            None => Ok(None),
        }
    }

    async fn get_active_trades(&self) -> StoreResult<Vec<Trade>> {
        let rows = sqlx::query(
            r#"
            SELECT trade_id, doc FROM trades
            WHERE status NOT IN ('ENTRY_FAILED', 'EXITED_TARGET', 'EXITED_SL', 'CLOSED')
            ORDER BY updated_at DESC
            "#,
        )
        .fetch_all(&self.database.pool)
        .await?;
        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("trade_id")?;
            let doc: String = row.try_get("doc")?;
            trades.push(Self::decode_trade(&doc, &id)?);
        }
        Ok(trades)
    }

    async fn get_recently_closed(&self, limit: u32) -> StoreResult<Vec<Trade>> {
        let rows = sqlx::query(
            r#"
            SELECT trade_id, doc FROM trades
            WHERE status IN ('ENTRY_FAILED', 'EXITED_TARGET', 'EXITED_SL', 'CLOSED')
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.database.pool)
        .await?;
        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("trade_id")?;
            let doc: String = row.try_get("doc")?;
            trades.push(Self::decode_trade(&doc, &id)?);
        }
        Ok(trades)
    }

    async fn link_order(&self, link: &OrderLink) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_links (order_id, trade_id, role, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(order_id) DO NOTHING
            "#,
        )
        .bind(&link.order_id)
        .bind(&link.trade_id)
        .bind(link.role.to_string())
        .bind(link.created_at)
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }

    async fn find_trade_by_order(&self, order_id: &str) -> StoreResult<Option<(Trade, OrderRole)>> {
        let row = sqlx::query("SELECT trade_id, role FROM order_links WHERE order_id = ?")
            .bind(order_id)
            .fetch_optional(&self.database.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let trade_id: String = row.try_get("trade_id")?;
        let role_str: String = row.try_get("role")?;
        let role = OrderRole::from_str(&role_str).map_err(|_| StoreError::TradeNotFound {
            trade_id: trade_id.clone(),
        })?;
        match self.get_trade(&trade_id).await? {
            Some(trade) => Ok(Some((trade, role))),
            None => Ok(None),
        }
    }

    async fn save_orphan_order_update(&self, orphan: &OrphanOrderUpdate) -> StoreResult<()> {
        let doc = serde_json::to_string(&orphan.update).map_err(|e| StoreError::Corrupt {
            entity: "orphan",
            key: orphan.order_id.clone(),
            source: e,
        })?;
        sqlx::query(
            r#"
            INSERT INTO orphan_order_updates (order_id, doc, attempts, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&orphan.order_id)
        .bind(doc)
        .bind(orphan.attempts as i64)
        .bind(orphan.created_at)
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }

    async fn pop_orphan_order_updates(
        &self,
        order_id: &str,
    ) -> StoreResult<Vec<OrphanOrderUpdate>> {
        let rows = sqlx::query(
            r#"
            SELECT id, doc, attempts, created_at FROM orphan_order_updates
            WHERE order_id = ? ORDER BY created_at ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.database.pool)
        .await?;

        let mut orphans = Vec::with_capacity(rows.len());
        let mut ids: Vec<i64> = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let doc: String = row.try_get("doc")?;
            let attempts: i64 = row.try_get("attempts")?;
            let created_at: i64 = row.try_get("created_at")?;
            let update = serde_json::from_str(&doc).map_err(|e| StoreError::Corrupt {
                entity: "orphan",
                key: order_id.to_string(),
                source: e,
            })?;
            orphans.push(OrphanOrderUpdate {
                order_id: order_id.to_string(),
                update,
                attempts: attempts as u32,
                created_at,
            });
            ids.push(id);
        }
        for id in ids {
            sqlx::query("DELETE FROM orphan_order_updates WHERE id = ?")
                .bind(id)
                .execute(&self.database.pool)
                .await?;
        }
        Ok(orphans)
    }

    async fn dead_letter(&self, orphan: &OrphanOrderUpdate, reason: &str) -> StoreResult<()> {
        let doc = serde_json::to_string(&orphan.update).map_err(|e| StoreError::Corrupt {
            entity: "orphan",
            key: orphan.order_id.clone(),
            source: e,
        })?;
        sqlx::query(
            r#"
            INSERT INTO orphan_order_updates_dlq (order_id, doc, reason, dead_lettered_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&orphan.order_id)
        .bind(doc)
        .bind(reason)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.database.pool)
        .await?;
        sqlx::query("DELETE FROM orphan_order_updates WHERE order_id = ?")
            .bind(&orphan.order_id)
            .execute(&self.database.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired_orphans(&self, ttl_ms: i64, now_ms: i64) -> StoreResult<u64> {
        let cutoff = now_ms - ttl_ms;
        let result = sqlx::query("DELETE FROM orphan_order_updates WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.database.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn append_order_log(&self, entry: &OrderLogEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_logs (order_id, trade_id, status, payload, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.order_id)
        .bind(&entry.trade_id)
        .bind(&entry.status)
        .bind(entry.payload.to_string())
        .bind(entry.created_at)
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }

    async fn upsert_live_order_snapshot(
        &self,
        trade_id: &str,
        snapshot: &LiveOrderSnapshot,
    ) -> StoreResult<()> {
        let doc = serde_json::to_string(snapshot).map_err(|e| StoreError::Corrupt {
            entity: "live_order_snapshot",
            key: trade_id.to_string(),
            source: e,
        })?;
        sqlx::query(
            r#"
            INSERT INTO live_order_snapshots (trade_id, doc, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(trade_id) DO UPDATE SET
                doc = excluded.doc,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(trade_id)
        .bind(doc)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }

    async fn get_live_order_snapshots_by_trade_ids(
        &self,
        trade_ids: &[String],
    ) -> StoreResult<HashMap<String, LiveOrderSnapshot>> {
        let mut out = HashMap::new();
        for trade_id in trade_ids {
            let row = sqlx::query("SELECT doc FROM live_order_snapshots WHERE trade_id = ?")
                .bind(trade_id)
                .fetch_optional(&self.database.pool)
                .await?;
            if let Some(row) = row {
                let doc: String = row.try_get("doc")?;
                let snapshot = serde_json::from_str(&doc).map_err(|e| StoreError::Corrupt {
                    entity: "live_order_snapshot",
                    key: trade_id.clone(),
                    source: e,
                })?;
                out.insert(trade_id.clone(), snapshot);
            }
        }
        Ok(out)
    }

    async fn upsert_daily_risk(&self, risk: &DailyRisk) -> StoreResult<()> {
        let doc = serde_json::to_string(risk).map_err(|e| StoreError::Corrupt {
            entity: "daily_risk",
            key: risk.date.to_string(),
            source: e,
        })?;
        sqlx::query(
            r#"
            INSERT INTO daily_risk (date, doc, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(date) DO UPDATE SET
                doc = excluded.doc,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(risk.date.to_string())
        .bind(doc)
        .bind(risk.updated_at)
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }

    async fn get_daily_risk(&self, date: NaiveDate) -> StoreResult<Option<DailyRisk>> {
        let row = sqlx::query("SELECT doc FROM daily_risk WHERE date = ?")
            .bind(date.to_string())
            .fetch_optional(&self.database.pool)
            .await?;
        match row {
            Some(row) => {
                let doc: String = row.try_get("doc")?;
                let risk = serde_json::from_str(&doc).map_err(|e| StoreError::Corrupt {
                    entity: "daily_risk",
                    key: date.to_string(),
                    source: e,
                })?;
                Ok(Some(risk))
            }
            None => Ok(None),
        }
    }

    async fn upsert_risk_state(&self, state: &RiskState) -> StoreResult<()> {
        let doc = serde_json::to_string(state).map_err(|e| StoreError::Corrupt {
            entity: "risk_state",
            key: state.date.to_string(),
            source: e,
        })?;
        sqlx::query(
            r#"
            INSERT INTO risk_state (date, doc, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(date) DO UPDATE SET
                doc = excluded.doc,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(state.date.to_string())
        .bind(doc)
        .bind(state.updated_at)
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }

    async fn get_risk_state(&self, date: NaiveDate) -> StoreResult<Option<RiskState>> {
        let row = sqlx::query("SELECT doc FROM risk_state WHERE date = ?")
            .bind(date.to_string())
            .fetch_optional(&self.database.pool)
            .await?;
        match row {
            Some(row) => {
                let doc: String = row.try_get("doc")?;
                let state = serde_json::from_str(&doc).map_err(|e| StoreError::Corrupt {
                    entity: "risk_state",
                    key: date.to_string(),
                    source: e,
                })?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::types::{Instrument, Product, Side};
    use rust_decimal_macros::dec;

    async fn store() -> SqliteTradeStore {
        let db = Database::in_memory().await.expect("in-memory db");
        SqliteTradeStore::new(db)
    }

    fn sample_trade(id: &str) -> Trade {
        let instrument = Instrument {
            exchange: "NFO".into(),
            tradingsymbol: "NIFTY24AUG24800CE".into(),
            segment: "NFO-OPT".into(),
            lot_size: 25,
            tick_size: dec!(0.05),
            freeze_qty: Some(1800),
        };
        Trade::new(
            id.to_string(),
            256265,
            instrument,
            Side::Buy,
            50,
            dec!(100),
            dec!(88),
            Product::Mis,
            "breakout".into(),
            "momentum".into(),
            "TREND".into(),
            dec!(90),
            1_700_000_000_000,
        )
    }

    #[tokio::test]
    async fn test_trade_roundtrip_and_active_filter() {
        let store = store().await;
        let trade = sample_trade("t-1");
        store.insert_trade(&trade).await.unwrap();

        let loaded = store.get_trade("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.trade_id, "t-1");
        assert_eq!(loaded.status, TradeStatus::EntryPlaced);
        assert_eq!(loaded.stop_loss, Some(dec!(88)));

        let active = store.get_active_trades().await.unwrap();
        assert_eq!(active.len(), 1);

        let mut closed = loaded.clone();
        closed.status = TradeStatus::EntryFailed;
        closed.updated_at += 1;
        store.update_trade(&closed).await.unwrap();
        assert!(store.get_active_trades().await.unwrap().is_empty());
        assert_eq!(store.get_recently_closed(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_transition() {
        let store = store().await;
        let mut trade = sample_trade("t-2");
        store.insert_trade(&trade).await.unwrap();

        trade.status = TradeStatus::EntryFailed;
        trade.updated_at += 1;
        store.update_trade(&trade).await.unwrap();

        // Terminal ENTRY_FAILED must never go back to LIVE
        trade.status = TradeStatus::Live;
        trade.updated_at += 2;
        let err = store.update_trade(&trade).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        // And the stored row is untouched
        let stored = store.get_trade("t-2").await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::EntryFailed);
    }

    #[tokio::test]
    async fn test_status_history_is_a_state_machine_path() {
        let store = store().await;
        let mut trade = sample_trade("t-3");
        store.insert_trade(&trade).await.unwrap();

        let path = [
            TradeStatus::EntryOpen,
            TradeStatus::EntryFilled,
            TradeStatus::Live,
            TradeStatus::ExitedTarget,
            TradeStatus::Closed,
        ];
        for status in path {
            trade.status = status;
            trade.updated_at += 1;
            store.update_trade(&trade).await.unwrap();
        }
        let stored = store.get_trade("t-3").await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Closed);
    }

    #[tokio::test]
    async fn test_order_link_unique_and_lookup() {
        let store = store().await;
        let trade = sample_trade("t-4");
        store.insert_trade(&trade).await.unwrap();

        let link = OrderLink {
            order_id: "o-1".into(),
            trade_id: "t-4".into(),
            role: OrderRole::Entry,
            created_at: 1,
        };
        store.link_order(&link).await.unwrap();
        // Duplicate link is a no-op, not an error
        store.link_order(&link).await.unwrap();

        let (found, role) = store.find_trade_by_order("o-1").await.unwrap().unwrap();
        assert_eq!(found.trade_id, "t-4");
        assert_eq!(role, OrderRole::Entry);
        assert!(store.find_trade_by_order("o-unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_orphan_queue_pop_and_dlq() {
        use crate::domain::ports::{BrokerOrder, OrderStatusWire};
        use crate::domain::trading::types::OrderKind;

        let store = store().await;
        let update = BrokerOrder {
            order_id: "o-9".into(),
            status: OrderStatusWire::Complete,
            status_message: None,
            status_message_raw: None,
            kind: OrderKind::Limit,
            side: Side::Sell,
            tradingsymbol: "X".into(),
            exchange: "NFO".into(),
            quantity: 50,
            filled_quantity: 50,
            average_price: dec!(124),
            price: dec!(124),
            trigger_price: dec!(0),
            tag: None,
            order_timestamp: None,
            exchange_timestamp: None,
        };
        let orphan = OrphanOrderUpdate {
            order_id: "o-9".into(),
            update,
            attempts: 1,
            created_at: 1_000,
        };
        store.save_orphan_order_update(&orphan).await.unwrap();

        let popped = store.pop_orphan_order_updates("o-9").await.unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].update.order_id, "o-9");
        // Popping removes
        assert!(store.pop_orphan_order_updates("o-9").await.unwrap().is_empty());

        store.save_orphan_order_update(&orphan).await.unwrap();
        store.dead_letter(&orphan, "no link after retries").await.unwrap();
        assert!(store.pop_orphan_order_updates("o-9").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_ttl_purge() {
        use crate::domain::ports::{BrokerOrder, OrderStatusWire};
        use crate::domain::trading::types::OrderKind;

        let store = store().await;
        let update = BrokerOrder {
            order_id: "o-old".into(),
            status: OrderStatusWire::Open,
            status_message: None,
            status_message_raw: None,
            kind: OrderKind::Limit,
            side: Side::Buy,
            tradingsymbol: "X".into(),
            exchange: "NFO".into(),
            quantity: 50,
            filled_quantity: 0,
            average_price: dec!(0),
            price: dec!(100),
            trigger_price: dec!(0),
            tag: None,
            order_timestamp: None,
            exchange_timestamp: None,
        };
        let orphan =
            OrphanOrderUpdate { order_id: "o-old".into(), update, attempts: 1, created_at: 0 };
        store.save_orphan_order_update(&orphan).await.unwrap();

        let ttl = 6 * 3600 * 1000;
        let purged = store.purge_expired_orphans(ttl, ttl + 1).await.unwrap();
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn test_daily_risk_and_risk_state_upsert() {
        let store = store().await;
        let date = NaiveDate::from_ymd_opt(2024, 8, 1).unwrap();

        let mut daily = DailyRisk::new(date, 1);
        daily.realized_pnl = dec!(-1200);
        daily.orders_placed = 7;
        store.upsert_daily_risk(&daily).await.unwrap();
        daily.orders_placed = 9;
        store.upsert_daily_risk(&daily).await.unwrap();
        let loaded = store.get_daily_risk(date).await.unwrap().unwrap();
        assert_eq!(loaded.orders_placed, 9);
        assert_eq!(loaded.realized_pnl, dec!(-1200));

        let mut rs = RiskState::new(date, 1);
        rs.kill = true;
        rs.consecutive_failures = 2;
        store.upsert_risk_state(&rs).await.unwrap();
        let loaded = store.get_risk_state(date).await.unwrap().unwrap();
        assert!(loaded.kill);
        assert_eq!(loaded.consecutive_failures, 2);
        assert!(store.get_risk_state(date.succ_opt().unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_order_snapshot_roundtrip() {
        use crate::domain::ports::{BrokerOrder, OrderStatusWire};
        use crate::domain::repositories::LiveOrderEntry;
        use crate::domain::trading::types::OrderKind;

        let store = store().await;
        let mut snapshot = LiveOrderSnapshot::default();
        snapshot.by_order_id.insert(
            "o-1".into(),
            LiveOrderEntry {
                order: BrokerOrder {
                    order_id: "o-1".into(),
                    status: OrderStatusWire::Open,
                    status_message: None,
                    status_message_raw: None,
                    kind: OrderKind::SlM,
                    side: Side::Sell,
                    tradingsymbol: "X".into(),
                    exchange: "NFO".into(),
                    quantity: 50,
                    filled_quantity: 0,
                    average_price: dec!(0),
                    price: dec!(0),
                    trigger_price: dec!(88),
                    tag: Some("Tabc".into()),
                    order_timestamp: None,
                    exchange_timestamp: None,
                },
                status: "OPEN".into(),
                role: Some(OrderRole::Sl),
                source: "postback".into(),
                seen_at: 5,
            },
        );
        store.upsert_live_order_snapshot("t-1", &snapshot).await.unwrap();
        let loaded = store
            .get_live_order_snapshots_by_trade_ids(&["t-1".to_string()])
            .await
            .unwrap();
        assert_eq!(loaded["t-1"].by_order_id["o-1"].role, Some(OrderRole::Sl));
    }
}
