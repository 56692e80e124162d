use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Session-day risk posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DayState {
    Running,
    SoftStop,
    HardStop,
}

impl fmt::Display for DayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DayState::Running => write!(f, "RUNNING"),
            DayState::SoftStop => write!(f, "SOFT_STOP"),
            DayState::HardStop => write!(f, "HARD_STOP"),
        }
    }
}

impl std::str::FromStr for DayState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(DayState::Running),
            "SOFT_STOP" => Ok(DayState::SoftStop),
            "HARD_STOP" => Ok(DayState::HardStop),
            other => Err(format!("unknown day state: {}", other)),
        }
    }
}

/// Persisted day P&L + posture, keyed by session day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyRisk {
    pub date: NaiveDate,
    pub realized_pnl: Decimal,
    pub last_open_pnl: Decimal,
    pub last_total: Decimal,
    pub state: DayState,
    pub state_reason: Option<String>,
    /// Sticky: once set, only explicit admin action clears it.
    pub kill: bool,
    pub orders_placed: u32,
    pub last_trade_id: Option<String>,
    pub updated_at: i64,
}

impl DailyRisk {
    pub fn new(date: NaiveDate, now_ms: i64) -> Self {
        Self {
            date,
            realized_pnl: Decimal::ZERO,
            last_open_pnl: Decimal::ZERO,
            last_total: Decimal::ZERO,
            state: DayState::Running,
            state_reason: None,
            kill: false,
            orders_placed: 0,
            last_trade_id: None,
            updated_at: now_ms,
        }
    }

    pub fn total(&self) -> Decimal {
        self.realized_pnl + self.last_open_pnl
    }

    /// Apply the daily loss/profit policy. Returns the new state when it
    /// changed. SOFT_STOP may revert to RUNNING if total recovers; HARD_STOP
    /// never reverts; neither transition touches `kill` on its own.
    pub fn evaluate(
        &mut self,
        max_loss_inr: Decimal,
        profit_goal_inr: Option<Decimal>,
        soft_stop_frac: Decimal,
        now_ms: i64,
    ) -> Option<DayState> {
        let total = self.total();
        self.last_total = total;
        self.updated_at = now_ms;

        let old = self.state;
        if old == DayState::HardStop {
            return None;
        }

        let hard_floor = -max_loss_inr.abs();
        let soft_floor = hard_floor * soft_stop_frac;

        let new = if total <= hard_floor {
            self.state_reason = Some(format!("daily loss {} breached cap {}", total, hard_floor));
            DayState::HardStop
        } else if let Some(goal) = profit_goal_inr
            && total >= goal
        {
            self.state_reason = Some(format!("daily profit goal {} reached", goal));
            DayState::HardStop
        } else if total <= soft_floor {
            self.state_reason = Some(format!("daily loss {} past soft floor {}", total, soft_floor));
            DayState::SoftStop
        } else {
            DayState::Running
        };

        if new != old {
            self.state = new;
            Some(new)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenPosition {
    pub token: u32,
    pub trade_id: String,
    pub side: crate::domain::trading::types::Side,
    pub qty: i64,
}

/// Process-mirror of per-day risk flags, persisted so a restart resumes with
/// the same posture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub date: NaiveDate,
    pub kill: bool,
    pub consecutive_failures: u32,
    pub open_positions: Vec<OpenPosition>,
    /// token key -> epoch ms until which entries on it are blocked.
    pub cooldown_until: HashMap<String, i64>,
    pub updated_at: i64,
}

impl RiskState {
    pub fn new(date: NaiveDate, now_ms: i64) -> Self {
        Self {
            date,
            kill: false,
            consecutive_failures: 0,
            open_positions: Vec::new(),
            cooldown_until: HashMap::new(),
            updated_at: now_ms,
        }
    }

    pub fn in_cooldown(&self, token_key: &str, now_ms: i64) -> bool {
        self.cooldown_until
            .get(token_key)
            .is_some_and(|until| *until > now_ms)
    }

    pub fn set_cooldown(&mut self, token_key: &str, until_ms: i64) {
        self.cooldown_until.insert(token_key.to_string(), until_ms);
    }

    pub fn track_open(&mut self, pos: OpenPosition) {
        self.open_positions.retain(|p| p.trade_id != pos.trade_id);
        self.open_positions.push(pos);
    }

    pub fn untrack(&mut self, trade_id: &str) {
        self.open_positions.retain(|p| p.trade_id != trade_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::types::Side;
    use rust_decimal_macros::dec;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 8, 1).unwrap()
    }

    #[test]
    fn test_daily_state_escalation() {
        let mut dr = DailyRisk::new(day(), 0);
        dr.realized_pnl = dec!(-3000);
        // soft floor at 60% of -5000 = -3000
        let changed = dr.evaluate(dec!(5000), None, dec!(0.6), 1);
        assert_eq!(changed, Some(DayState::SoftStop));

        dr.realized_pnl = dec!(-5200);
        let changed = dr.evaluate(dec!(5000), None, dec!(0.6), 2);
        assert_eq!(changed, Some(DayState::HardStop));

        // Hard stop is sticky even if P&L recovers
        dr.realized_pnl = dec!(100);
        assert_eq!(dr.evaluate(dec!(5000), None, dec!(0.6), 3), None);
        assert_eq!(dr.state, DayState::HardStop);
    }

    #[test]
    fn test_soft_stop_reverts_without_clearing_kill() {
        let mut dr = DailyRisk::new(day(), 0);
        dr.kill = true;
        dr.realized_pnl = dec!(-3100);
        dr.evaluate(dec!(5000), None, dec!(0.6), 1);
        assert_eq!(dr.state, DayState::SoftStop);

        dr.realized_pnl = dec!(-500);
        let changed = dr.evaluate(dec!(5000), None, dec!(0.6), 2);
        assert_eq!(changed, Some(DayState::Running));
        assert!(dr.kill, "soft-stop revert must not clear kill");
    }

    #[test]
    fn test_profit_goal_hard_stops() {
        let mut dr = DailyRisk::new(day(), 0);
        dr.realized_pnl = dec!(10500);
        let changed = dr.evaluate(dec!(5000), Some(dec!(10000)), dec!(0.6), 1);
        assert_eq!(changed, Some(DayState::HardStop));
    }

    #[test]
    fn test_cooldown_window() {
        let mut rs = RiskState::new(day(), 0);
        rs.set_cooldown("256265", 1_000);
        assert!(rs.in_cooldown("256265", 999));
        assert!(!rs.in_cooldown("256265", 1_000));
        assert!(!rs.in_cooldown("12345", 500));
    }

    #[test]
    fn test_open_position_registry_dedups_by_trade() {
        let mut rs = RiskState::new(day(), 0);
        let pos = OpenPosition { token: 1, trade_id: "t-1".into(), side: Side::Buy, qty: 50 };
        rs.track_open(pos.clone());
        rs.track_open(OpenPosition { qty: 25, ..pos });
        assert_eq!(rs.open_positions.len(), 1);
        assert_eq!(rs.open_positions[0].qty, 25);
        rs.untrack("t-1");
        assert!(rs.open_positions.is_empty());
    }
}
