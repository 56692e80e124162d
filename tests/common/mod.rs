//! Shared test rig: a scripted broker, an in-memory store and a
//! ready-to-drive TradeManager.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use scalpr::application::engine::TradeManager;
use scalpr::application::metrics::EngineMetrics;
use scalpr::config::Config;
use scalpr::domain::errors::BrokerError;
use scalpr::domain::ports::{
    Broker, BrokerOrder, BrokerResult, ConvertPositionParams, DepthLevel, EdgeAdvisor,
    LogAlertSink, ModifyParams, NetPosition, NoopAdvisor, OptionRouter, OrderParams,
    OrderStatusWire, PositionsSnapshot, Quote, Variety,
};
use scalpr::domain::repositories::TradeStore;
use scalpr::domain::trading::types::{Candle, OrderKind, Product, Side, Signal, Tick};
use scalpr::infrastructure::catalog::{CatalogEntry, FileCatalog};
use scalpr::infrastructure::persistence::database::Database;
use scalpr::infrastructure::persistence::trade_store::SqliteTradeStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const UNDERLYING_TOKEN: u32 = 100;
pub const OPT_TOKEN: u32 = 9001;
pub const OPT_SYMBOL: &str = "TESTOPT";
pub const OPT_KEY: &str = "NFO:TESTOPT";

#[derive(Default)]
pub struct MockState {
    next_id: u32,
    pub placed: Vec<(String, OrderParams)>,
    pub cancelled: Vec<String>,
    pub modified: Vec<(String, ModifyParams)>,
    pub orders: HashMap<String, BrokerOrder>,
    pub net_positions: Vec<NetPosition>,
    pub quotes: HashMap<String, Quote>,
    pub ltps: HashMap<String, Decimal>,
    pub fail_slm: bool,
    pub reject_target_rms: bool,
    pub fail_market: bool,
}

pub struct MockBroker {
    pub state: Mutex<MockState>,
}

impl MockBroker {
    pub fn new() -> Self {
        let mut state = MockState::default();
        state.quotes.insert(OPT_KEY.to_string(), good_quote());
        state.ltps.insert(OPT_KEY.to_string(), dec!(100));
        Self { state: Mutex::new(state) }
    }

    pub fn set_net_position(&self, token: u32, qty: i64) {
        let mut state = self.state.lock().unwrap();
        state.net_positions = vec![NetPosition {
            instrument_token: token,
            tradingsymbol: OPT_SYMBOL.to_string(),
            exchange: "NFO".to_string(),
            product: Product::Mis,
            quantity: qty,
            average_price: dec!(100),
        }];
    }

    pub fn placed(&self) -> Vec<(String, OrderParams)> {
        self.state.lock().unwrap().placed.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    /// The broker-side order book entry, as a postback template.
    pub fn order(&self, order_id: &str) -> BrokerOrder {
        self.state.lock().unwrap().orders[order_id].clone()
    }

    /// Mark an order filled at the broker and return the COMPLETE postback.
    pub fn fill(&self, order_id: &str, avg: Decimal, filled: i64) -> BrokerOrder {
        let mut state = self.state.lock().unwrap();
        let order = state.orders.get_mut(order_id).expect("order exists");
        order.status = OrderStatusWire::Complete;
        order.filled_quantity = filled;
        order.average_price = avg;
        order.clone()
    }

    /// Partial-fill postback, broker book updated to match.
    pub fn partial(&self, order_id: &str, avg: Decimal, filled: i64) -> BrokerOrder {
        let mut state = self.state.lock().unwrap();
        let order = state.orders.get_mut(order_id).expect("order exists");
        order.status = OrderStatusWire::Partial;
        order.filled_quantity = filled;
        order.average_price = avg;
        order.clone()
    }

    /// Find the most recent placed order whose tag ends with `role_code`.
    pub fn last_with_role(&self, role_code: char) -> Option<(String, OrderParams)> {
        self.state
            .lock()
            .unwrap()
            .placed
            .iter()
            .rev()
            .find(|(_, p)| p.tag.as_deref().is_some_and(|t| t.ends_with(role_code)))
            .cloned()
    }

    pub fn count_with_kind(&self, kind: OrderKind) -> usize {
        self.state
            .lock()
            .unwrap()
            .placed
            .iter()
            .filter(|(_, p)| p.kind == kind)
            .count()
    }
}

fn order_from_params(order_id: &str, params: &OrderParams, status: OrderStatusWire) -> BrokerOrder {
    BrokerOrder {
        order_id: order_id.to_string(),
        status,
        status_message: None,
        status_message_raw: None,
        kind: params.kind,
        side: params.side,
        tradingsymbol: params.tradingsymbol.clone(),
        exchange: params.exchange.clone(),
        quantity: params.quantity,
        filled_quantity: 0,
        average_price: Decimal::ZERO,
        price: params.price.unwrap_or_default(),
        trigger_price: params.trigger_price.unwrap_or_default(),
        tag: params.tag.clone(),
        order_timestamp: Some(Utc::now().timestamp_millis()),
        exchange_timestamp: None,
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn place_order(&self, _variety: Variety, params: OrderParams) -> BrokerResult<String> {
        let mut state = self.state.lock().unwrap();
        if params.kind == OrderKind::SlM && state.fail_slm {
            return Err(BrokerError::SlmBlocked {
                message: "SL-M orders are blocked for this instrument".into(),
            });
        }
        let is_target = params.tag.as_deref().is_some_and(|t| t.ends_with('T'));
        if is_target && state.reject_target_rms {
            return Err(BrokerError::Rms { message: "insufficient margin for order".into() });
        }
        if params.kind == OrderKind::Market && state.fail_market {
            return Err(BrokerError::Other { message: "market orders blocked".into() });
        }

        state.next_id += 1;
        let order_id = format!("ord-{}", state.next_id);
        let status = match params.kind {
            OrderKind::Sl | OrderKind::SlM => OrderStatusWire::TriggerPending,
            _ => OrderStatusWire::Open,
        };
        state
            .orders
            .insert(order_id.clone(), order_from_params(&order_id, &params, status));
        state.placed.push((order_id.clone(), params));
        Ok(order_id)
    }

    async fn modify_order(
        &self,
        _variety: Variety,
        order_id: &str,
        patch: ModifyParams,
    ) -> BrokerResult<String> {
        let mut state = self.state.lock().unwrap();
        if let Some(order) = state.orders.get_mut(order_id) {
            if let Some(price) = patch.price {
                order.price = price;
            }
            if let Some(trigger) = patch.trigger_price {
                order.trigger_price = trigger;
            }
            if let Some(qty) = patch.quantity {
                order.quantity = qty;
            }
        }
        state.modified.push((order_id.to_string(), patch));
        Ok(order_id.to_string())
    }

    async fn cancel_order(&self, _variety: Variety, order_id: &str) -> BrokerResult<String> {
        let mut state = self.state.lock().unwrap();
        if let Some(order) = state.orders.get_mut(order_id) {
            if !order.status.is_terminal() {
                order.status = OrderStatusWire::Cancelled;
            }
        }
        state.cancelled.push(order_id.to_string());
        Ok(order_id.to_string())
    }

    async fn orders(&self) -> BrokerResult<Vec<BrokerOrder>> {
        Ok(self.state.lock().unwrap().orders.values().cloned().collect())
    }

    async fn order_history(&self, order_id: &str) -> BrokerResult<Vec<BrokerOrder>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .orders
            .get(order_id)
            .cloned()
            .into_iter()
            .collect())
    }

    async fn positions(&self) -> BrokerResult<PositionsSnapshot> {
        Ok(PositionsSnapshot {
            net: self.state.lock().unwrap().net_positions.clone(),
            day: vec![],
        })
    }

    async fn quote(&self, keys: &[String]) -> BrokerResult<HashMap<String, Quote>> {
        let state = self.state.lock().unwrap();
        Ok(keys
            .iter()
            .filter_map(|k| state.quotes.get(k).map(|q| (k.clone(), q.clone())))
            .collect())
    }

    async fn ltp(&self, keys: &[String]) -> BrokerResult<HashMap<String, Decimal>> {
        let state = self.state.lock().unwrap();
        Ok(keys
            .iter()
            .filter_map(|k| state.ltps.get(k).map(|l| (k.clone(), *l)))
            .collect())
    }

    async fn convert_position(&self, _params: ConvertPositionParams) -> BrokerResult<()> {
        Ok(())
    }
}

pub fn good_quote() -> Quote {
    Quote {
        last_price: dec!(100),
        buy_depth: vec![DepthLevel { price: dec!(99.95), quantity: 600 }],
        sell_depth: vec![DepthLevel { price: dec!(100), quantity: 600 }],
        timestamp: Some(Utc::now().timestamp_millis()),
    }
}

pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.session.no_trade_windows = vec![];
    // Keep session cutoffs out of the way unless a test opts in
    cfg.session.force_flatten_at = chrono::NaiveTime::from_hms_opt(23, 59, 0).unwrap();
    cfg.session.eod_mis_to_nrml_at = None;
    cfg.rate.max_orders_per_sec = 100;
    cfg.rate.max_orders_per_min = 1000;
    cfg.rate.broker_max_orders_per_sec = 100;
    cfg.rate.broker_max_orders_per_min = 1000;
    cfg.watchdogs.entry_limit_timeout_ms = 5;
    cfg.watchdogs.entry_grace_recheck_ms = 1;
    cfg.watchdogs.sl_open_sec = 0;
    cfg.watchdogs.target_retry_interval_ms = 1;
    cfg.watchdogs.panic_exit_fill_timeout_ms = 20;
    cfg.reconcile.debounce_ms = 1;
    cfg
}

pub struct Rig {
    pub manager: TradeManager,
    pub broker: Arc<MockBroker>,
    pub store: Arc<dyn TradeStore>,
}

pub async fn rig(cfg: Config) -> Rig {
    let db = Database::in_memory().await.expect("in-memory db");
    let store: Arc<dyn TradeStore> = Arc::new(SqliteTradeStore::new(db));
    let broker = Arc::new(MockBroker::new());
    let catalog = FileCatalog::from_entries(vec![
        CatalogEntry {
            instrument_token: UNDERLYING_TOKEN,
            exchange: "NSE".to_string(),
            tradingsymbol: "NIFTY".to_string(),
            segment: "NSE".to_string(),
            lot_size: 1,
            tick_size: dec!(0.05),
            freeze_qty: None,
            underlying_token: None,
            option_meta: None,
            moneyness_rank: 0,
        },
        CatalogEntry {
            instrument_token: OPT_TOKEN,
            exchange: "NFO".to_string(),
            tradingsymbol: OPT_SYMBOL.to_string(),
            segment: "NFO-OPT".to_string(),
            lot_size: 25,
            tick_size: dec!(0.05),
            freeze_qty: Some(1800),
            underlying_token: Some(UNDERLYING_TOKEN),
            option_meta: Some(scalpr::domain::trading::types::OptionMeta {
                strike: dec!(24800),
                expiry: chrono::NaiveDate::from_ymd_opt(2024, 8, 29).unwrap(),
                opt_type: scalpr::domain::trading::types::OptType::Ce,
                delta: Some(dec!(0.5)),
                gamma: None,
                vega: None,
                theta: None,
                iv_pts: None,
            }),
            moneyness_rank: 0,
        },
    ]);
    let router: Arc<dyn OptionRouter> = Arc::new(catalog);
    let advisor: Arc<dyn EdgeAdvisor> = Arc::new(NoopAdvisor);
    let broker_port: Arc<dyn Broker> = broker.clone();
    let (manager, _handle) = TradeManager::new(
        cfg,
        broker_port,
        store.clone(),
        router,
        advisor,
        Arc::new(LogAlertSink),
        Arc::new(EngineMetrics::unregistered()),
    );
    Rig { manager, broker, store }
}

pub fn breakout_signal() -> Signal {
    Signal {
        instrument_token: OPT_TOKEN,
        side: Side::Buy,
        confidence: dec!(92),
        strategy_id: "breakout".to_string(),
        strategy_style: "momentum".to_string(),
        regime: "TREND".to_string(),
        candle: Candle {
            open: dec!(99),
            high: dec!(100.5),
            low: dec!(98.5),
            close: dec!(100),
            volume: 15_000,
            ts: Utc::now().timestamp_millis(),
            interval_min: 5,
        },
        interval_min: 5,
        underlying_token: None,
        stop_loss: Some(dec!(88)),
        target: Some(dec!(124)),
    }
}

pub fn tick(price: Decimal) -> Tick {
    Tick {
        instrument_token: OPT_TOKEN,
        last_price: price,
        ts: Utc::now().timestamp_millis(),
    }
}

/// Drive the rig to a live trade with protective exits in place.
/// Returns (entry_id, sl_id, target_id).
pub async fn drive_to_live(rig: &mut Rig) -> (String, String, String) {
    rig.manager.on_signal(breakout_signal()).await;
    let (entry_id, entry) = rig.broker.last_with_role('E').expect("entry placed");
    assert_eq!(entry.kind, OrderKind::Limit);

    let fill = rig.broker.fill(&entry_id, dec!(100), entry.quantity);
    rig.broker.set_net_position(OPT_TOKEN, entry.quantity);
    rig.manager.on_order_update(fill).await;

    let (sl_id, _) = rig.broker.last_with_role('S').expect("sl placed");
    let (target_id, _) = rig.broker.last_with_role('T').expect("target placed");
    (entry_id, sl_id, target_id)
}
