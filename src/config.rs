use anyhow::{Context, Result};
use chrono::NaiveTime;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

use crate::domain::trading::types::{OrderKind, Product};

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    <T as FromStr>::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse {}={}: {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}

fn env_decimal(key: &str, default: &str) -> Result<Decimal> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    Decimal::from_str(raw.trim()).with_context(|| format!("Failed to parse {}={}", key, raw))
}

fn env_opt_decimal(key: &str) -> Result<Option<Decimal>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => Ok(Some(
            Decimal::from_str(raw.trim()).with_context(|| format!("Failed to parse {}={}", key, raw))?,
        )),
        _ => Ok(None),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<bool>().ok())
        .unwrap_or(default)
}

fn env_time(key: &str, default: &str) -> Result<NaiveTime> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .with_context(|| format!("Failed to parse {}={} (expected HH:MM)", key, raw))
}

fn env_opt_time(key: &str) -> Result<Option<NaiveTime>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => Ok(Some(
            NaiveTime::parse_from_str(raw.trim(), "%H:%M")
                .with_context(|| format!("Failed to parse {}={} (expected HH:MM)", key, raw))?,
        )),
        _ => Ok(None),
    }
}

/// "09:15-09:20,15:10-15:30" -> window list.
fn parse_windows(raw: &str) -> Result<Vec<(NaiveTime, NaiveTime)>> {
    let mut out = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (a, b) = part
            .split_once('-')
            .with_context(|| format!("Bad window '{}' (expected HH:MM-HH:MM)", part))?;
        let start = NaiveTime::parse_from_str(a.trim(), "%H:%M")
            .with_context(|| format!("Bad window start '{}'", a))?;
        let end = NaiveTime::parse_from_str(b.trim(), "%H:%M")
            .with_context(|| format!("Bad window end '{}'", b))?;
        out.push((start, end));
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LotPolicy {
    /// Refuse when risk-based size rounds below one lot.
    Strict,
    /// Take one lot anyway (subject to the risk-cap fitter).
    ForceOneLot,
}

impl FromStr for LotPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STRICT" => Ok(LotPolicy::Strict),
            "FORCE_ONE_LOT" => Ok(LotPolicy::ForceOneLot),
            other => anyhow::bail!("Invalid LOT_POLICY: {} (STRICT | FORCE_ONE_LOT)", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptTargetMode {
    Broker,
    Virtual,
}

impl FromStr for OptTargetMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BROKER" => Ok(OptTargetMode::Broker),
            "VIRTUAL" => Ok(OptTargetMode::Virtual),
            other => anyhow::bail!("Invalid OPT_TARGET_MODE: {} (BROKER | VIRTUAL)", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptSlMode {
    Pct,
    Points,
}

impl FromStr for OptSlMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PCT" => Ok(OptSlMode::Pct),
            "POINTS" => Ok(OptSlMode::Points),
            other => anyhow::bail!("Invalid OPT_SL_MODE: {} (PCT | POINTS)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderControls {
    pub default_product: Product,
    pub entry_order_type: OrderKind,
    pub entry_order_type_opt: OrderKind,
    pub enforce_market_protection: bool,
    /// Percent band for market protection, e.g. 5 = +-5%.
    pub market_protection: Decimal,
}

#[derive(Debug, Clone)]
pub struct RateConfig {
    pub max_orders_per_sec: u32,
    pub max_orders_per_min: u32,
    pub max_orders_per_day: u32,
    pub broker_max_orders_per_sec: u32,
    pub broker_max_orders_per_min: u32,
}

#[derive(Debug, Clone)]
pub struct SlippageConfig {
    pub max_entry_slippage_bps: Decimal,
    pub max_entry_slippage_bps_opt: Decimal,
    pub entry_slippage_kill_bps: Decimal,
    pub feedback_window: usize,
    pub feedback_max_avg_bps: Decimal,
    pub feedback_cooldown_sec: u64,
    pub feedback_kill_switch: bool,
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub risk_per_trade_inr: Decimal,
    pub daily_max_loss_inr: Decimal,
    pub daily_profit_goal_inr: Option<Decimal>,
    pub daily_soft_stop_frac: Decimal,
    pub max_position_value_inr: Decimal,
    pub max_portfolio_value_inr: Decimal,
    pub lot_risk_cap_enforce: bool,
    pub lot_risk_cap_eps_pct: Decimal,
    pub lot_policy: LotPolicy,
    pub consecutive_failure_limit: u32,
    pub auto_flatten_on_hard_stop: bool,
}

#[derive(Debug, Clone)]
pub struct StopTargetConfig {
    pub stoploss_order_type_eq: OrderKind,
    pub stoploss_order_type_fo: OrderKind,
    pub sl_limit_buffer_bps: Decimal,
    pub sl_limit_buffer_ticks: u32,
    pub sl_limit_buffer_abs: Decimal,
    pub sl_limit_buffer_max_bps: Decimal,
    pub rr_target: Decimal,
    pub opt_sl_mode: OptSlMode,
    pub opt_stop_pct: Decimal,
    pub opt_sl_points: Decimal,
    pub opt_target_mode: OptTargetMode,
    pub tp1_enabled: bool,
    /// Fraction of the position closed at TP1, e.g. 0.5.
    pub tp1_fraction: Decimal,
    pub tp1_rr: Decimal,
    /// Breakeven buffer over entry after a TP1 fill, in ticks.
    pub be_buffer_ticks: u32,
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub sl_enabled: bool,
    pub sl_open_sec: u64,
    pub sl_require_ltp_breach: bool,
    pub sl_trigger_bps_buffer: Decimal,
    pub sl_kill_switch_on_fire: bool,
    pub target_enabled: bool,
    pub target_retries: u32,
    pub target_retry_interval_ms: u64,
    pub panic_exit_fill_timeout_ms: u64,
    pub panic_exit_max_retries: u32,
    pub panic_limit_fallback_enabled: bool,
    pub panic_limit_fallback_max_bps: Decimal,
    pub entry_limit_timeout_ms: u64,
    pub entry_grace_recheck_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub on_order_update: bool,
    pub debounce_ms: u64,
    pub interval_sec: u64,
    pub oco_position_reconciler_enabled: bool,
    pub oco_flat_grace_ms: i64,
    pub recent_closed_lookback: u32,
    pub hard_flatten_on_restart: bool,
    pub orphan_ttl_ms: i64,
    pub orphan_max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub no_trade_windows: Vec<(NaiveTime, NaiveTime)>,
    pub force_flatten_at: NaiveTime,
    pub eod_mis_to_nrml_at: Option<NaiveTime>,
    /// Offset of exchange local time from UTC, minutes (IST = 330).
    pub tz_offset_min: i32,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub enabled: bool,
    pub max_rejects_5m: u32,
    pub max_spread_spikes_5m: u32,
    pub max_stale_ticks_5m: u32,
    pub max_quote_guard_hits_5m: u32,
    pub cooldown_sec: u64,
}

#[derive(Debug, Clone)]
pub struct OptionRoutingConfig {
    pub enabled: bool,
    pub min_health: Decimal,
    pub min_depth_qty: i64,
    pub quote_stale_ms: i64,
    pub max_alternates: usize,
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub be_lock_cost_mult: Decimal,
    pub trail_arm_r: Decimal,
    pub trail_atr_mult: Decimal,
    pub atr_period: usize,
    pub time_stop_after_ms: i64,
    pub round_level_step: Decimal,
    pub level_buffer_ticks: u32,
    pub dyn_exit_interval_ms: u64,
    pub swing_lookback: usize,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub api_key: String,
    pub access_token: String,
    pub base_url: String,
    pub ws_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub trading_enabled: bool,
    pub min_signal_confidence: Decimal,
    pub orders: OrderControls,
    pub rate: RateConfig,
    pub slippage: SlippageConfig,
    pub risk: RiskConfig,
    pub stops: StopTargetConfig,
    pub watchdogs: WatchdogConfig,
    pub reconcile: ReconcileConfig,
    pub session: SessionConfig,
    pub breakers: BreakerConfig,
    pub option_routing: OptionRoutingConfig,
    pub planner: PlannerConfig,
    pub broker: BrokerConfig,
    pub max_spread_bps_eq: Decimal,
    pub max_spread_bps_fut: Decimal,
    pub max_spread_bps_opt: Decimal,
    pub min_atr_pct: Decimal,
    pub max_atr_pct: Decimal,
    pub min_rel_volume: Decimal,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let db_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://data/scalpr.db".to_string());

        let orders = OrderControls {
            default_product: match env::var("DEFAULT_PRODUCT")
                .unwrap_or_else(|_| "MIS".to_string())
                .as_str()
            {
                "NRML" => Product::Nrml,
                _ => Product::Mis,
            },
            entry_order_type: env_or("ENTRY_ORDER_TYPE", OrderKind::Limit)
                .context("Failed to parse ENTRY_ORDER_TYPE")?,
            entry_order_type_opt: env_or("ENTRY_ORDER_TYPE_OPT", OrderKind::Limit)
                .context("Failed to parse ENTRY_ORDER_TYPE_OPT")?,
            enforce_market_protection: env_bool("ENFORCE_MARKET_PROTECTION", true),
            market_protection: env_decimal("MARKET_PROTECTION", "5")?,
        };

        let rate = RateConfig {
            max_orders_per_sec: env_or("MAX_ORDERS_PER_SEC", 5u32)?,
            max_orders_per_min: env_or("MAX_ORDERS_PER_MIN", 60u32)?,
            max_orders_per_day: env_or("MAX_ORDERS_PER_DAY", 500u32)?,
            broker_max_orders_per_sec: env_or("BROKER_MAX_ORDERS_PER_SEC", 10u32)?,
            broker_max_orders_per_min: env_or("BROKER_MAX_ORDERS_PER_MIN", 200u32)?,
        };

        let slippage = SlippageConfig {
            max_entry_slippage_bps: env_decimal("MAX_ENTRY_SLIPPAGE_BPS", "25")?,
            max_entry_slippage_bps_opt: env_decimal("MAX_ENTRY_SLIPPAGE_BPS_OPT", "120")?,
            entry_slippage_kill_bps: env_decimal("MAX_ENTRY_SLIPPAGE_KILL_BPS", "400")?,
            feedback_window: env_or("SLIPPAGE_FEEDBACK_WINDOW", 10usize)?,
            feedback_max_avg_bps: env_decimal("SLIPPAGE_FEEDBACK_MAX_AVG_BPS", "60")?,
            feedback_cooldown_sec: env_or("SLIPPAGE_FEEDBACK_COOLDOWN_SEC", 600u64)?,
            feedback_kill_switch: env_bool("SLIPPAGE_FEEDBACK_KILL_SWITCH", false),
        };

        let risk = RiskConfig {
            risk_per_trade_inr: env_decimal("RISK_PER_TRADE_INR", "1000")?,
            daily_max_loss_inr: env_decimal("DAILY_MAX_LOSS_INR", "5000")?,
            daily_profit_goal_inr: env_opt_decimal("DAILY_PROFIT_GOAL_INR")?,
            daily_soft_stop_frac: env_decimal("DAILY_SOFT_STOP_FRAC", "0.6")?,
            max_position_value_inr: env_decimal("MAX_POSITION_VALUE_INR", "500000")?,
            max_portfolio_value_inr: env_decimal("MAX_PORTFOLIO_VALUE_INR", "1000000")?,
            lot_risk_cap_enforce: env_bool("LOT_RISK_CAP_ENFORCE", true),
            lot_risk_cap_eps_pct: env_decimal("LOT_RISK_CAP_EPS_PCT", "0.1")?,
            lot_policy: env_or("LOT_POLICY", LotPolicy::ForceOneLot)?,
            consecutive_failure_limit: env_or("CONSECUTIVE_FAILURE_LIMIT", 3u32)?,
            auto_flatten_on_hard_stop: env_bool("AUTO_FLATTEN_ON_HARD_STOP", true),
        };

        let stops = StopTargetConfig {
            stoploss_order_type_eq: env_or("STOPLOSS_ORDER_TYPE_EQ", OrderKind::Sl)
                .context("Failed to parse STOPLOSS_ORDER_TYPE_EQ")?,
            stoploss_order_type_fo: env_or("STOPLOSS_ORDER_TYPE_FO", OrderKind::SlM)
                .context("Failed to parse STOPLOSS_ORDER_TYPE_FO")?,
            sl_limit_buffer_bps: env_decimal("SL_LIMIT_BUFFER_BPS", "30")?,
            sl_limit_buffer_ticks: env_or("SL_LIMIT_BUFFER_TICKS", 4u32)?,
            sl_limit_buffer_abs: env_decimal("SL_LIMIT_BUFFER_ABS", "0")?,
            sl_limit_buffer_max_bps: env_decimal("SL_LIMIT_BUFFER_MAX_BPS", "150")?,
            rr_target: env_decimal("RR_TARGET", "2")?,
            opt_sl_mode: env_or("OPT_SL_MODE", OptSlMode::Pct)?,
            opt_stop_pct: env_decimal("OPT_STOP_PCT", "0.12")?,
            opt_sl_points: env_decimal("OPT_SL_POINTS", "12")?,
            opt_target_mode: env_or("OPT_TARGET_MODE", OptTargetMode::Broker)?,
            tp1_enabled: env_bool("TP1_ENABLED", false),
            tp1_fraction: env_decimal("TP1_FRACTION", "0.5")?,
            tp1_rr: env_decimal("TP1_RR", "1")?,
            be_buffer_ticks: env_or("BE_BUFFER_TICKS", 2u32)?,
        };

        let watchdogs = WatchdogConfig {
            sl_enabled: env_bool("SL_WATCHDOG_ENABLED", true),
            sl_open_sec: env_or("SL_WATCHDOG_OPEN_SEC", 8u64)?,
            sl_require_ltp_breach: env_bool("SL_WATCHDOG_REQUIRE_LTP_BREACH", true),
            sl_trigger_bps_buffer: env_decimal("SL_WATCHDOG_TRIGGER_BPS_BUFFER", "10")?,
            sl_kill_switch_on_fire: env_bool("SL_WATCHDOG_KILL_SWITCH_ON_FIRE", true),
            target_enabled: env_bool("TARGET_WATCHDOG_ENABLED", true),
            target_retries: env_or("TARGET_WATCHDOG_RETRIES", 3u32)?,
            target_retry_interval_ms: env_or("TARGET_WATCHDOG_RETRY_INTERVAL_MS", 1500u64)?,
            panic_exit_fill_timeout_ms: env_or("PANIC_EXIT_FILL_TIMEOUT_MS", 5000u64)?,
            panic_exit_max_retries: env_or("PANIC_EXIT_MAX_RETRIES", 3u32)?,
            panic_limit_fallback_enabled: env_bool("PANIC_EXIT_LIMIT_FALLBACK_ENABLED", true),
            panic_limit_fallback_max_bps: env_decimal("PANIC_EXIT_LIMIT_FALLBACK_MAX_BPS", "200")?,
            entry_limit_timeout_ms: env_or("ENTRY_LIMIT_TIMEOUT_MS", 12_000u64)?,
            entry_grace_recheck_ms: env_or("ENTRY_GRACE_RECHECK_MS", 750u64)?,
        };

        let reconcile = ReconcileConfig {
            on_order_update: env_bool("RECONCILE_ON_ORDER_UPDATE", true),
            debounce_ms: env_or("RECONCILE_DEBOUNCE_MS", 1200u64)?,
            interval_sec: env_or("RECONCILE_INTERVAL_SEC", 20u64)?,
            oco_position_reconciler_enabled: env_bool("OCO_POSITION_RECONCILER_ENABLED", true),
            oco_flat_grace_ms: env_or("OCO_FLAT_GRACE_MS", 4000i64)?,
            recent_closed_lookback: env_or("RECENT_CLOSED_LOOKBACK", 3u32)?,
            hard_flatten_on_restart: env_bool("HARD_FLATTEN_ON_RESTART", false),
            orphan_ttl_ms: env_or("ORPHAN_TTL_MS", 6 * 3600 * 1000i64)?,
            orphan_max_attempts: env_or("ORPHAN_MAX_ATTEMPTS", 5u32)?,
        };

        let session = SessionConfig {
            no_trade_windows: parse_windows(
                &env::var("NO_TRADE_WINDOWS").unwrap_or_else(|_| "09:15-09:18".to_string()),
            )?,
            force_flatten_at: env_time("FORCE_FLATTEN_AT", "15:20")?,
            eod_mis_to_nrml_at: env_opt_time("EOD_MIS_TO_NRML_AT")?,
            tz_offset_min: env_or("SESSION_TZ_OFFSET_MIN", 330i32)?,
        };

        let breakers = BreakerConfig {
            enabled: env_bool("CIRCUIT_BREAKERS_ENABLED", true),
            max_rejects_5m: env_or("CB_MAX_REJECTS_5M", 3u32)?,
            max_spread_spikes_5m: env_or("CB_MAX_SPREAD_SPIKES_5M", 10u32)?,
            max_stale_ticks_5m: env_or("CB_MAX_STALE_TICKS_5M", 30u32)?,
            max_quote_guard_hits_5m: env_or("CB_MAX_QUOTE_GUARD_HITS_5M", 6u32)?,
            cooldown_sec: env_or("CB_COOLDOWN_SEC", 300u64)?,
        };

        let option_routing = OptionRoutingConfig {
            enabled: env_bool("OPTION_MODE_ENABLED", true),
            min_health: env_decimal("OPT_MIN_HEALTH", "40")?,
            min_depth_qty: env_or("OPT_MIN_DEPTH_QTY", 200i64)?,
            quote_stale_ms: env_or("OPT_QUOTE_STALE_MS", 4000i64)?,
            max_alternates: env_or("OPT_MAX_ALTERNATES", 2usize)?,
        };

        let planner = PlannerConfig {
            be_lock_cost_mult: env_decimal("BE_LOCK_COST_MULT", "1.5")?,
            trail_arm_r: env_decimal("TRAIL_ARM_R", "1.1")?,
            trail_atr_mult: env_decimal("TRAIL_ATR_MULT", "2")?,
            atr_period: env_or("PLANNER_ATR_PERIOD", 14usize)?,
            time_stop_after_ms: env_or("TIME_STOP_AFTER_MS", 20 * 60 * 1000i64)?,
            round_level_step: env_decimal("ROUND_LEVEL_STEP", "50")?,
            level_buffer_ticks: env_or("LEVEL_BUFFER_TICKS", 3u32)?,
            dyn_exit_interval_ms: env_or("DYN_EXIT_INTERVAL_MS", 2000u64)?,
            swing_lookback: env_or("SWING_LOOKBACK", 10usize)?,
        };

        let broker = BrokerConfig {
            api_key: env::var("BROKER_API_KEY").unwrap_or_default(),
            access_token: env::var("BROKER_ACCESS_TOKEN").unwrap_or_default(),
            base_url: env::var("BROKER_BASE_URL")
                .unwrap_or_else(|_| "https://api.kite.trade".to_string()),
            ws_url: env::var("BROKER_WS_URL")
                .unwrap_or_else(|_| "wss://ws.kite.trade".to_string()),
        };

        Ok(Self {
            db_url,
            trading_enabled: env_bool("TRADING_ENABLED", true),
            min_signal_confidence: env_decimal("MIN_SIGNAL_CONFIDENCE", "60")?,
            orders,
            rate,
            slippage,
            risk,
            stops,
            watchdogs,
            reconcile,
            session,
            breakers,
            option_routing,
            planner,
            broker,
            max_spread_bps_eq: env_decimal("MAX_SPREAD_BPS_EQ", "15")?,
            max_spread_bps_fut: env_decimal("MAX_SPREAD_BPS_FUT", "10")?,
            max_spread_bps_opt: env_decimal("MAX_SPREAD_BPS_OPT", "80")?,
            min_atr_pct: env_decimal("MIN_ATR_PCT", "0.0008")?,
            max_atr_pct: env_decimal("MAX_ATR_PCT", "0.03")?,
            min_rel_volume: env_decimal("MIN_REL_VOLUME", "0.7")?,
        })
    }
}

impl Default for Config {
    /// Defaults without touching the environment; used by tests.
    fn default() -> Self {
        // from_env only reads the environment for overrides, so a clean env
        // yields the documented defaults.
        Self::from_env().expect("default config must parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_windows() {
        let w = parse_windows("09:15-09:20, 15:10-15:30").unwrap();
        assert_eq!(w.len(), 2);
        assert_eq!(w[0].0, NaiveTime::from_hms_opt(9, 15, 0).unwrap());
        assert_eq!(w[1].1, NaiveTime::from_hms_opt(15, 30, 0).unwrap());
        assert!(parse_windows("0915-0930").is_err());
        assert!(parse_windows("").unwrap().is_empty());
    }

    #[test]
    fn test_lot_policy_parse() {
        assert_eq!("STRICT".parse::<LotPolicy>().unwrap(), LotPolicy::Strict);
        assert_eq!(
            "force_one_lot".parse::<LotPolicy>().unwrap(),
            LotPolicy::ForceOneLot
        );
        assert!("SOMETHING".parse::<LotPolicy>().is_err());
    }

    #[test]
    fn test_defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.rate.max_orders_per_sec, 5);
        assert_eq!(cfg.stops.stoploss_order_type_fo, OrderKind::SlM);
        assert!(cfg.watchdogs.sl_enabled);
        assert_eq!(cfg.session.force_flatten_at, NaiveTime::from_hms_opt(15, 20, 0).unwrap());
        assert!(cfg.risk.daily_profit_goal_inr.is_none());
    }
}
