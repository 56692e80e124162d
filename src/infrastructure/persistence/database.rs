use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        // A pooled :memory: database is one database per connection; pin
        // the pool to a single connection so the schema is shared.
        let is_memory = db_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if is_memory { 1 } else { 5 })
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        let ddl: &[(&str, &str)] = &[
            (
                "trades table",
                r#"
                CREATE TABLE IF NOT EXISTS trades (
                    trade_id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    instrument_token INTEGER NOT NULL,
                    doc TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
            ),
            (
                "trades index",
                "CREATE INDEX IF NOT EXISTS idx_trades_status_updated ON trades (status, updated_at DESC)",
            ),
            (
                "order_links table",
                r#"
                CREATE TABLE IF NOT EXISTS order_links (
                    order_id TEXT PRIMARY KEY,
                    trade_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                )
                "#,
            ),
            (
                "order_links index",
                "CREATE INDEX IF NOT EXISTS idx_order_links_trade ON order_links (trade_id)",
            ),
            (
                "orphan_order_updates table",
                r#"
                CREATE TABLE IF NOT EXISTS orphan_order_updates (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    order_id TEXT NOT NULL,
                    doc TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 1,
                    created_at INTEGER NOT NULL
                )
                "#,
            ),
            (
                "orphan index",
                "CREATE INDEX IF NOT EXISTS idx_orphans_order ON orphan_order_updates (order_id, created_at)",
            ),
            (
                "orphan DLQ table",
                r#"
                CREATE TABLE IF NOT EXISTS orphan_order_updates_dlq (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    order_id TEXT NOT NULL,
                    doc TEXT NOT NULL,
                    reason TEXT,
                    dead_lettered_at INTEGER NOT NULL
                )
                "#,
            ),
            (
                "orphan DLQ index",
                "CREATE INDEX IF NOT EXISTS idx_orphans_dlq_order ON orphan_order_updates_dlq (order_id, dead_lettered_at DESC)",
            ),
            (
                "order_logs table",
                r#"
                CREATE TABLE IF NOT EXISTS order_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    order_id TEXT NOT NULL,
                    trade_id TEXT,
                    status TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                )
                "#,
            ),
            (
                "order_logs order index",
                "CREATE INDEX IF NOT EXISTS idx_order_logs_order ON order_logs (order_id, created_at DESC)",
            ),
            (
                "order_logs trade index",
                "CREATE INDEX IF NOT EXISTS idx_order_logs_trade ON order_logs (trade_id, created_at DESC)",
            ),
            (
                "live_order_snapshots table",
                r#"
                CREATE TABLE IF NOT EXISTS live_order_snapshots (
                    trade_id TEXT PRIMARY KEY,
                    doc TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
            ),
            (
                "daily_risk table",
                r#"
                CREATE TABLE IF NOT EXISTS daily_risk (
                    date TEXT PRIMARY KEY,
                    doc TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
            ),
            (
                "risk_state table",
                r#"
                CREATE TABLE IF NOT EXISTS risk_state (
                    date TEXT PRIMARY KEY,
                    doc TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
            ),
        ];

        for (what, statement) in ddl {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .with_context(|| format!("Failed to create {}", what))?;
        }

        info!("Database schema initialized.");
        Ok(())
    }
}
