use anyhow::{Context, Result};
use clap::Parser;
use scalpr::application::engine::TradeManager;
use scalpr::application::metrics::EngineMetrics;
use scalpr::config::Config;
use scalpr::domain::ports::{Broker, EdgeAdvisor, LogAlertSink, NoopAdvisor, OptionRouter};
use scalpr::domain::repositories::TradeStore;
use scalpr::infrastructure::catalog::FileCatalog;
use scalpr::infrastructure::kite::client::KiteClient;
use scalpr::infrastructure::kite::session;
use scalpr::infrastructure::kite::ticker::KiteTicker;
use scalpr::infrastructure::persistence::database::Database;
use scalpr::infrastructure::persistence::trade_store::SqliteTradeStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scalpr", about = "Intraday trade execution engine")]
struct Args {
    /// Instruments snapshot exported by the universe builder.
    #[arg(long, default_value = "data/instruments.json")]
    instruments: PathBuf,

    /// Instrument tokens to stream ticks for (comma separated).
    #[arg(long, value_delimiter = ',')]
    tokens: Vec<u32>,

    /// Run one reconcile pass and exit (operational check).
    #[arg(long)]
    reconcile_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = Config::from_env().context("configuration")?;

    let database = Database::new(&config.db_url).await?;
    let store: Arc<dyn TradeStore> = Arc::new(SqliteTradeStore::new(database));

    // Resolve broker credentials; exchange a request token when no access
    // token was provided directly.
    let mut access_token = config.broker.access_token.clone();
    if access_token.is_empty() {
        let api_secret = std::env::var("BROKER_API_SECRET").unwrap_or_default();
        let request_token = std::env::var("BROKER_REQUEST_TOKEN").unwrap_or_default();
        if !api_secret.is_empty() && !request_token.is_empty() {
            let session = session::exchange_request_token(
                &config.broker.base_url,
                &config.broker.api_key,
                &api_secret,
                &request_token,
            )
            .await
            .map_err(|e| anyhow::anyhow!("session exchange failed: {}", e))?;
            info!("Session established for user {}", session.user_id);
            access_token = session.access_token;
        } else {
            warn!("No broker credentials; the engine will run but broker calls will fail");
        }
    }

    let broker: Arc<dyn Broker> = Arc::new(KiteClient::new(
        config.broker.base_url.clone(),
        config.broker.api_key.clone(),
        access_token.clone(),
        config.session.tz_offset_min,
    ));

    let catalog = FileCatalog::load(&args.instruments)
        .unwrap_or_else(|e| {
            warn!("Instrument catalog load failed ({}); starting empty", e);
            FileCatalog::from_entries(Vec::new())
        });
    if catalog.is_empty() {
        warn!("Instrument catalog is empty; signals cannot be routed");
    }
    let router: Arc<dyn OptionRouter> = Arc::new(catalog);
    let advisor: Arc<dyn EdgeAdvisor> = Arc::new(NoopAdvisor);
    let alerts = Arc::new(LogAlertSink);
    let metrics = Arc::new(
        EngineMetrics::new(prometheus::default_registry()).context("metrics registration")?,
    );

    let (mut manager, handle) = TradeManager::new(
        config.clone(),
        broker,
        store,
        router,
        advisor,
        alerts,
        metrics,
    );

    if args.reconcile_once {
        manager.init().await;
        info!("Reconcile pass complete");
        return Ok(());
    }

    if !args.tokens.is_empty() {
        let ticker = KiteTicker::new(
            config.broker.ws_url.clone(),
            config.broker.api_key.clone(),
            access_token,
            args.tokens.clone(),
            config.session.tz_offset_min,
            handle.clone(),
        );
        tokio::spawn(ticker.run());
    } else {
        warn!("No tick tokens configured; watchdog arming relies on reconcile only");
    }

    // Ctrl-C drains into a clean shutdown of the engine loop
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown_handle
                .send(scalpr::application::engine::EngineCommand::Shutdown)
                .await;
        }
    });

    manager.run().await;
    Ok(())
}
