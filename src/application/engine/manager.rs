use crate::application::engine::scheduler::TaskScheduler;
use crate::application::exit_planner::ExitPlanner;
use crate::application::metrics::EngineMetrics;
use crate::application::sizing::SizingEngine;
use crate::config::Config;
use crate::domain::ports::{
    AlertKind, AlertSink, Broker, BrokerOrder, EdgeAdvisor, OptionRouter,
};
use crate::domain::repositories::TradeStore;
use crate::domain::risk::filters::cost_gate::CostModel;
use crate::domain::risk::rate_limiter::{OrderRateLimiter, RateLimits};
use crate::domain::risk::state::{DailyRisk, DayState, RiskState};
use crate::domain::trading::trade::Trade;
use crate::domain::trading::types::{Candle, Side, Signal, Tick};
use chrono::{FixedOffset, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Everything that can wake the engine. The single mpsc funnel plus the
/// loop-local timers make all handlers mutually exclusive by construction.
#[derive(Debug)]
pub enum EngineCommand {
    Signal(Signal),
    OrderUpdate(BrokerOrder),
    Tick(Tick),
    Reconcile,
    Shutdown,
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub async fn send(&self, cmd: EngineCommand) -> bool {
        self.tx.send(cmd).await.is_ok()
    }

    pub fn try_send(&self, cmd: EngineCommand) -> bool {
        self.tx.try_send(cmd).is_ok()
    }
}

/// Rolling 5-minute event counters gating new entries.
#[derive(Debug, Default)]
pub(crate) struct CircuitBreakers {
    pub rejects: VecDeque<i64>,
    pub spread_spikes: VecDeque<i64>,
    pub stale_ticks: VecDeque<i64>,
    pub quote_guard_hits: VecDeque<i64>,
    pub cooldown_until_ms: i64,
}

const BREAKER_WINDOW_MS: i64 = 5 * 60 * 1000;

impl CircuitBreakers {
    fn bump(queue: &mut VecDeque<i64>, now_ms: i64) -> u32 {
        queue.push_back(now_ms);
        while let Some(front) = queue.front() {
            if now_ms - front > BREAKER_WINDOW_MS {
                queue.pop_front();
            } else {
                break;
            }
        }
        queue.len() as u32
    }

    pub fn record_reject(&mut self, now_ms: i64) -> u32 {
        Self::bump(&mut self.rejects, now_ms)
    }

    pub fn record_spread_spike(&mut self, now_ms: i64) -> u32 {
        Self::bump(&mut self.spread_spikes, now_ms)
    }

    pub fn record_stale_tick(&mut self, now_ms: i64) -> u32 {
        Self::bump(&mut self.stale_ticks, now_ms)
    }

    pub fn record_quote_guard(&mut self, now_ms: i64) -> u32 {
        Self::bump(&mut self.quote_guard_hits, now_ms)
    }

    pub fn cooling_down(&self, now_ms: i64) -> bool {
        self.cooldown_until_ms > now_ms
    }
}

/// Per-operation re-entrancy guards across await points.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    pub reconcile: bool,
    pub dyn_exit: bool,
    pub target_watchdog: bool,
    pub virtual_target: bool,
    pub entry_fallback: bool,
    /// tradeIds with a protective-exit placement running.
    pub exit_placement: HashSet<String>,
}

pub struct TradeManager {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) store: Arc<dyn TradeStore>,
    pub(crate) router: Arc<dyn OptionRouter>,
    pub(crate) advisor: Arc<dyn EdgeAdvisor>,
    pub(crate) alerts: Arc<dyn AlertSink>,
    pub(crate) config: Config,
    pub(crate) planner: ExitPlanner,
    pub(crate) sizer: SizingEngine,
    pub(crate) costs: CostModel,
    pub(crate) metrics: Arc<EngineMetrics>,

    cmd_rx: mpsc::Receiver<EngineCommand>,
    cmd_tx: mpsc::Sender<EngineCommand>,

    // Engine-owned mutable state. Exactly one task touches any of this.
    pub(crate) active: Option<Trade>,
    pub(crate) risk_state: RiskState,
    pub(crate) daily_risk: DailyRisk,
    pub(crate) rate_limiter: OrderRateLimiter,
    pub(crate) broker_rate: OrderRateLimiter,
    pub(crate) halted: bool,
    pub(crate) expected_cancels: HashSet<String>,
    pub(crate) last_price: HashMap<u32, Decimal>,
    pub(crate) last_tick_at: HashMap<u32, i64>,
    pub(crate) candles: HashMap<u32, VecDeque<Candle>>,
    pub(crate) scheduler: TaskScheduler,
    pub(crate) breakers: CircuitBreakers,
    pub(crate) in_flight: InFlight,
    pub(crate) slippage_window: VecDeque<Decimal>,
    pub(crate) slippage_cooldown_until_ms: i64,
    pub(crate) reconcile_due: Option<Instant>,
    pub(crate) last_risk_check_ms: i64,
    pub(crate) eod_converted: bool,
    pub(crate) force_flattened: bool,
}

const CANDLE_BUFFER: usize = 120;

impl TradeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        broker: Arc<dyn Broker>,
        store: Arc<dyn TradeStore>,
        router: Arc<dyn OptionRouter>,
        advisor: Arc<dyn EdgeAdvisor>,
        alerts: Arc<dyn AlertSink>,
        metrics: Arc<EngineMetrics>,
    ) -> (Self, EngineHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let handle = EngineHandle { tx: cmd_tx.clone() };

        let planner = ExitPlanner::new(config.planner.clone(), CostModel::default());
        let sizer = SizingEngine::new(config.risk.clone());
        let rate_limiter = OrderRateLimiter::new(RateLimits {
            per_sec: config.rate.max_orders_per_sec,
            per_min: config.rate.max_orders_per_min,
            per_day: Some(config.rate.max_orders_per_day),
        });
        let broker_rate = OrderRateLimiter::new(RateLimits {
            per_sec: config.rate.broker_max_orders_per_sec,
            per_min: config.rate.broker_max_orders_per_min,
            per_day: None,
        });

        let today = Self::session_date(&config, now_ms());
        let manager = Self {
            broker,
            store,
            router,
            advisor,
            alerts,
            planner,
            sizer,
            costs: CostModel::default(),
            metrics,
            cmd_rx,
            cmd_tx,
            active: None,
            risk_state: RiskState::new(today, now_ms()),
            daily_risk: DailyRisk::new(today, now_ms()),
            rate_limiter,
            broker_rate,
            halted: false,
            expected_cancels: HashSet::new(),
            last_price: HashMap::new(),
            last_tick_at: HashMap::new(),
            candles: HashMap::new(),
            scheduler: TaskScheduler::new(),
            breakers: CircuitBreakers::default(),
            in_flight: InFlight::default(),
            slippage_window: VecDeque::new(),
            slippage_cooldown_until_ms: 0,
            reconcile_due: None,
            last_risk_check_ms: 0,
            eod_converted: false,
            force_flattened: false,
            config,
        };
        (manager, handle)
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle { tx: self.cmd_tx.clone() }
    }

    // Read-only views for the admin surface and tests.

    pub fn active_trade(&self) -> Option<&Trade> {
        self.active.as_ref()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn kill_switch_engaged(&self) -> bool {
        self.kill_engaged()
    }

    pub fn daily(&self) -> &DailyRisk {
        &self.daily_risk
    }

    pub fn risk(&self) -> &RiskState {
        &self.risk_state
    }

    /// Load persisted risk posture and resync with the broker. Called once
    /// before the loop and again after connection recovery.
    pub async fn init(&mut self) {
        let today = Self::session_date(&self.config, now_ms());

        match self.store.get_risk_state(today).await {
            Ok(Some(rs)) => self.risk_state = rs,
            Ok(None) => self.risk_state = RiskState::new(today, now_ms()),
            Err(e) => error!("TradeManager: failed to load risk state: {}", e),
        }
        match self.store.get_daily_risk(today).await {
            Ok(Some(dr)) => self.daily_risk = dr,
            Ok(None) => self.daily_risk = DailyRisk::new(today, now_ms()),
            Err(e) => error!("TradeManager: failed to load daily risk: {}", e),
        }
        self.rate_limiter.seed_day_count(self.daily_risk.orders_placed);
        self.metrics
            .kill_switch
            .set(if self.kill_engaged() { 1 } else { 0 });

        info!(
            "TradeManager: session {} loaded (kill={}, day_state={}, orders_placed={})",
            today,
            self.kill_engaged(),
            self.daily_risk.state,
            self.daily_risk.orders_placed
        );

        self.reconcile().await;
    }

    pub async fn run(&mut self) {
        self.init().await;

        let mut reconcile_tick =
            interval(Duration::from_secs(self.config.reconcile.interval_sec.max(1)));
        reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut exit_tick = interval(Duration::from_millis(
            self.config.planner.dyn_exit_interval_ms.max(250),
        ));
        exit_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut housekeeping_tick = interval(Duration::from_secs(60));
        housekeeping_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("TradeManager: event loop started");

        loop {
            let next_task = self.scheduler.next_due();
            let debounce_due = self.reconcile_due;

            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(EngineCommand::Shutdown) | None => {
                            info!("TradeManager: shutting down");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }

                _ = async { sleep_until(next_task.expect("guarded by branch condition")).await },
                    if next_task.is_some() => {
                    self.fire_due_tasks().await;
                }

                _ = async { sleep_until(debounce_due.expect("guarded by branch condition")).await },
                    if debounce_due.is_some() => {
                    self.reconcile_due = None;
                    self.reconcile().await;
                }

                _ = exit_tick.tick() => {
                    self.dyn_exit_tick().await;
                }

                _ = reconcile_tick.tick() => {
                    self.reconcile().await;
                }

                _ = housekeeping_tick.tick() => {
                    self.housekeeping().await;
                }
            }
        }
    }

    pub(crate) async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Signal(signal) => self.on_signal(signal).await,
            EngineCommand::OrderUpdate(order) => self.on_order_update(order).await,
            EngineCommand::Tick(tick) => self.on_tick(tick).await,
            EngineCommand::Reconcile => self.reconcile().await,
            EngineCommand::Shutdown => unreachable!("handled by the loop"),
        }
    }

    // ===== Tick path =====

    pub async fn on_tick(&mut self, tick: Tick) {
        let now = now_ms();
        self.last_price.insert(tick.instrument_token, tick.last_price);
        self.last_tick_at.insert(tick.instrument_token, now);

        if self.config.breakers.enabled && now - tick.ts > 10_000 {
            let hits = self.breakers.record_stale_tick(now);
            if hits >= self.config.breakers.max_stale_ticks_5m {
                self.trip_breaker("stale ticks", now);
            }
        }

        let is_active_token = self
            .active
            .as_ref()
            .is_some_and(|t| t.instrument_token == tick.instrument_token);
        if is_active_token {
            self.track_peak(tick.last_price);
            self.arm_watchdogs_on_tick(tick.last_price, now).await;
            self.check_virtual_target(tick.last_price, now).await;
        }

        // Throttled session checks ride on the tick stream clock
        if now - self.last_risk_check_ms >= 1_000 {
            self.last_risk_check_ms = now;
            self.daily_risk_check(now).await;
            self.session_time_checks(now).await;
        }
    }

    fn track_peak(&mut self, ltp: Decimal) {
        if let Some(trade) = &mut self.active
            && trade.entry_price.is_some()
        {
            let peak = match (trade.peak_ltp, trade.side) {
                (Some(p), Side::Buy) => p.max(ltp),
                (Some(p), Side::Sell) => p.min(ltp),
                (None, _) => ltp,
            };
            trade.peak_ltp = Some(peak);
        }
    }

    pub(crate) async fn daily_risk_check(&mut self, now: i64) {
        let open_pnl = match (&self.active, self.active.as_ref().and_then(|t| {
            self.last_price.get(&t.instrument_token).copied()
        })) {
            (Some(trade), Some(ltp)) => trade.open_pnl_at(ltp).unwrap_or_default(),
            _ => Decimal::ZERO,
        };
        self.daily_risk.last_open_pnl = open_pnl;

        let changed = self.daily_risk.evaluate(
            self.config.risk.daily_max_loss_inr,
            self.config.risk.daily_profit_goal_inr,
            self.config.risk.daily_soft_stop_frac,
            now,
        );

        if let Some(new_state) = changed {
            self.persist_daily().await;
            match new_state {
                DayState::HardStop => {
                    let reason = self
                        .daily_risk
                        .state_reason
                        .clone()
                        .unwrap_or_else(|| "daily hard stop".to_string());
                    self.alerts.alert(AlertKind::DailyStop, &reason);
                    self.engage_kill(&reason).await;
                    if self.config.risk.auto_flatten_on_hard_stop
                        && self.active.as_ref().is_some_and(|t| t.status.holds_position())
                    {
                        self.panic_exit("DAILY_HARD_STOP", true).await;
                    }
                }
                DayState::SoftStop => {
                    self.alerts.alert(
                        AlertKind::DailyStop,
                        self.daily_risk.state_reason.as_deref().unwrap_or("soft stop"),
                    );
                }
                DayState::Running => {
                    info!("TradeManager: day state back to RUNNING");
                }
            }
        }
    }

    async fn session_time_checks(&mut self, now: i64) {
        let session_time = Self::session_time(&self.config, now);

        if !self.force_flattened && session_time >= self.config.session.force_flatten_at {
            let holds = self.active.as_ref().is_some_and(|t| t.status.holds_position());
            if holds {
                self.force_flattened = true;
                warn!("TradeManager: force-flatten time reached, exiting live trade");
                self.engage_kill("FORCE_FLATTEN").await;
                self.panic_exit("FORCE_FLATTEN", true).await;
            } else if self.active.is_none() {
                // No position to flatten; still stop taking entries
                self.force_flattened = true;
                self.engage_kill("FORCE_FLATTEN").await;
            }
        }

        if !self.eod_converted
            && let Some(convert_at) = self.config.session.eod_mis_to_nrml_at
            && session_time >= convert_at
        {
            self.eod_converted = true;
            self.eod_convert_to_nrml().await;
        }
    }

    // ===== Slippage feedback =====

    pub(crate) async fn record_entry_slippage(&mut self, trade_is_option: bool, slip_bps: Decimal) {
        let now = now_ms();
        let cap = if trade_is_option {
            self.config.slippage.max_entry_slippage_bps_opt
        } else {
            self.config.slippage.max_entry_slippage_bps
        };

        if slip_bps > self.config.slippage.entry_slippage_kill_bps {
            self.alerts.alert(
                AlertKind::Slippage,
                &format!("entry slippage {} bps past kill threshold", slip_bps),
            );
            self.engage_kill("ENTRY_SLIPPAGE_KILL").await;
            return;
        }

        if slip_bps > cap {
            self.alerts.alert(
                AlertKind::Slippage,
                &format!("entry slippage {} bps past cap {} bps", slip_bps, cap),
            );
        }

        self.slippage_window.push_back(slip_bps);
        while self.slippage_window.len() > self.config.slippage.feedback_window {
            self.slippage_window.pop_front();
        }
        if self.slippage_window.len() == self.config.slippage.feedback_window {
            let avg: Decimal = self.slippage_window.iter().copied().sum::<Decimal>()
                / Decimal::from(self.slippage_window.len() as i64);
            if avg > self.config.slippage.feedback_max_avg_bps {
                self.slippage_cooldown_until_ms =
                    now + (self.config.slippage.feedback_cooldown_sec as i64) * 1000;
                self.alerts.alert(
                    AlertKind::Slippage,
                    &format!("rolling slippage {} bps; entries cooled down", avg),
                );
                if self.config.slippage.feedback_kill_switch {
                    self.engage_kill("SLIPPAGE_FEEDBACK").await;
                }
                self.slippage_window.clear();
            }
        }
    }

    // ===== Kill / halt =====

    pub(crate) fn kill_engaged(&self) -> bool {
        self.risk_state.kill || self.daily_risk.kill
    }

    /// Sticky: cleared only by explicit admin action on the persisted rows.
    pub(crate) async fn engage_kill(&mut self, reason: &str) {
        if !self.kill_engaged() {
            self.alerts
                .alert(AlertKind::KillSwitch, &format!("kill switch: {}", reason));
        }
        self.risk_state.kill = true;
        self.daily_risk.kill = true;
        if self.daily_risk.state_reason.is_none() {
            self.daily_risk.state_reason = Some(reason.to_string());
        }
        self.metrics.kill_switch.set(1);
        self.persist_risk().await;
        self.persist_daily().await;
    }

    /// Invariant violation: block every non-panic order placement.
    pub(crate) fn raise_halt(&mut self, reason: &str) {
        if !self.halted {
            self.alerts.alert(AlertKind::Halt, &format!("halt: {}", reason));
            error!("TradeManager: HALT raised: {}", reason);
        }
        self.halted = true;
        self.metrics.halt.set(1);
    }

    // ===== Circuit breakers =====

    pub(crate) fn trip_breaker(&mut self, what: &str, now: i64) {
        if !self.breakers.cooling_down(now) {
            self.breakers.cooldown_until_ms =
                now + (self.config.breakers.cooldown_sec as i64) * 1000;
            self.alerts.alert(
                AlertKind::Rejection,
                &format!("circuit breaker tripped ({}), entries paused", what),
            );
        }
    }

    pub(crate) fn record_broker_reject(&mut self, now: i64) {
        self.metrics.orders_rejected.inc();
        if self.config.breakers.enabled {
            let hits = self.breakers.record_reject(now);
            if hits >= self.config.breakers.max_rejects_5m {
                self.trip_breaker("order rejects", now);
            }
        }
    }

    // ===== Persistence helpers =====

    pub(crate) async fn persist_trade(&mut self) {
        if let Some(trade) = &self.active {
            if let Err(e) = self.store.update_trade(trade).await {
                error!(
                    "TradeManager: failed to persist trade {}: {}",
                    trade.trade_id, e
                );
            }
        }
    }

    pub(crate) async fn persist_risk(&mut self) {
        self.risk_state.updated_at = now_ms();
        if let Err(e) = self.store.upsert_risk_state(&self.risk_state).await {
            error!("TradeManager: failed to persist risk state: {}", e);
        }
    }

    pub(crate) async fn persist_daily(&mut self) {
        self.daily_risk.updated_at = now_ms();
        if let Err(e) = self.store.upsert_daily_risk(&self.daily_risk).await {
            error!("TradeManager: failed to persist daily risk: {}", e);
        }
    }

    // ===== Misc plumbing =====

    pub(crate) fn buffer_candle(&mut self, token: u32, candle: Candle) {
        let buf = self.candles.entry(token).or_default();
        if buf.back().is_some_and(|c| c.ts == candle.ts) {
            *buf.back_mut().expect("nonempty") = candle;
        } else {
            buf.push_back(candle);
            while buf.len() > CANDLE_BUFFER {
                buf.pop_front();
            }
        }
    }

    pub(crate) fn candle_slice(&self, token: u32) -> Vec<Candle> {
        self.candles
            .get(&token)
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn schedule_reconcile(&mut self) {
        if !self.config.reconcile.on_order_update {
            return;
        }
        let due = Instant::now() + Duration::from_millis(self.config.reconcile.debounce_ms);
        // Coalesce bursts: keep the earliest pending deadline
        self.reconcile_due = Some(match self.reconcile_due {
            Some(existing) => existing.min(due),
            None => due,
        });
    }

    pub(crate) fn in_no_trade_window(&self, now: i64) -> bool {
        let t = Self::session_time(&self.config, now);
        self.config
            .session
            .no_trade_windows
            .iter()
            .any(|(start, end)| t >= *start && t < *end)
    }

    fn session_offset(config: &Config) -> FixedOffset {
        FixedOffset::east_opt(config.session.tz_offset_min * 60)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"))
    }

    pub(crate) fn session_time(config: &Config, now: i64) -> NaiveTime {
        let offset = Self::session_offset(config);
        chrono::DateTime::from_timestamp_millis(now)
            .map(|dt| dt.with_timezone(&offset).time())
            .unwrap_or_else(|| NaiveTime::from_hms_opt(0, 0, 0).expect("midnight"))
    }

    pub(crate) fn session_date(config: &Config, now: i64) -> chrono::NaiveDate {
        let offset = Self::session_offset(config);
        chrono::DateTime::from_timestamp_millis(now)
            .map(|dt| dt.with_timezone(&offset).date_naive())
            .unwrap_or_else(|| Utc::now().date_naive())
    }

    async fn housekeeping(&mut self) {
        let now = now_ms();
        match self
            .store
            .purge_expired_orphans(self.config.reconcile.orphan_ttl_ms, now)
            .await
        {
            Ok(0) => {}
            Ok(n) => info!("TradeManager: purged {} expired orphan postbacks", n),
            Err(e) => warn!("TradeManager: orphan purge failed: {}", e),
        }
    }
}
