//! Scheduled corrective tasks.
//!
//! One priority queue replaces ad-hoc timer callbacks: every watchdog and
//! fallback is a row here, and the engine loop fires due rows in order.
//! Firing only *re-checks* preconditions against persisted state: a task
//! whose trade has moved on exits without effect.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Entry LIMIT has not filled; run the cancel/market-fallback flow.
    EntryLimitTimeout { order_id: String },
    /// SL trigger was crossed but the order did not complete.
    SlWatchdog { order_id: String },
    /// Target touched but resting order still open; modify into the spread.
    TargetWatchdogRetry { order_id: String, retries_left: u32 },
    /// Panic exit order has not filled; cancel and replace.
    PanicExitTimeout { order_id: String, retries_left: u32 },
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::EntryLimitTimeout { .. } => "entry_limit_timeout",
            TaskKind::SlWatchdog { .. } => "sl_watchdog",
            TaskKind::TargetWatchdogRetry { .. } => "target_watchdog",
            TaskKind::PanicExitTimeout { .. } => "panic_exit_timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub due: Instant,
    pub trade_id: String,
    pub kind: TaskKind,
    pub armed_at_ms: i64,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on due time
        other.due.cmp(&self.due)
    }
}

#[derive(Default)]
pub struct TaskScheduler {
    heap: BinaryHeap<ScheduledTask>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, task: ScheduledTask) {
        tracing::debug!(
            "Scheduler: armed {} for trade {} in {:?}",
            task.kind.label(),
            task.trade_id,
            task.due.saturating_duration_since(Instant::now())
        );
        self.heap.push(task);
    }

    /// True when a task of this kind is already pending for the trade.
    pub fn is_armed(&self, trade_id: &str, label: &str) -> bool {
        self.heap
            .iter()
            .any(|t| t.trade_id == trade_id && t.kind.label() == label)
    }

    /// Drop all pending tasks for a trade (it reached a terminal state).
    pub fn cancel_for_trade(&mut self, trade_id: &str) {
        let remaining: Vec<ScheduledTask> = self
            .heap
            .drain()
            .filter(|t| t.trade_id != trade_id)
            .collect();
        self.heap = remaining.into();
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|t| t.due)
    }

    pub fn pop_due(&mut self, now: Instant) -> Vec<ScheduledTask> {
        let mut due = Vec::new();
        while let Some(head) = self.heap.peek() {
            if head.due <= now {
                due.push(self.heap.pop().expect("peeked head exists"));
            } else {
                break;
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn task(trade_id: &str, kind: TaskKind, in_ms: u64) -> ScheduledTask {
        ScheduledTask {
            due: Instant::now() + Duration::from_millis(in_ms),
            trade_id: trade_id.to_string(),
            kind,
            armed_at_ms: 0,
        }
    }

    #[test]
    fn test_pop_due_orders_by_time() {
        let mut s = TaskScheduler::new();
        s.arm(task("t-1", TaskKind::SlWatchdog { order_id: "o1".into() }, 50));
        s.arm(task("t-1", TaskKind::EntryLimitTimeout { order_id: "o2".into() }, 10));
        s.arm(task("t-1", TaskKind::PanicExitTimeout { order_id: "o3".into(), retries_left: 2 }, 5_000));

        let due = s.pop_due(Instant::now() + Duration::from_millis(100));
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].kind.label(), "entry_limit_timeout");
        assert_eq!(due[1].kind.label(), "sl_watchdog");
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_cancel_for_trade() {
        let mut s = TaskScheduler::new();
        s.arm(task("t-1", TaskKind::SlWatchdog { order_id: "o1".into() }, 100));
        s.arm(task("t-2", TaskKind::SlWatchdog { order_id: "o2".into() }, 100));
        s.cancel_for_trade("t-1");
        assert_eq!(s.len(), 1);
        assert!(s.is_armed("t-2", "sl_watchdog"));
        assert!(!s.is_armed("t-1", "sl_watchdog"));
    }

    #[test]
    fn test_next_due_is_earliest() {
        let mut s = TaskScheduler::new();
        assert!(s.next_due().is_none());
        s.arm(task("t-1", TaskKind::SlWatchdog { order_id: "o1".into() }, 500));
        s.arm(task("t-1", TaskKind::TargetWatchdogRetry { order_id: "o2".into(), retries_left: 3 }, 20));
        let next = s.next_due().unwrap();
        assert!(next <= Instant::now() + Duration::from_millis(30));
    }
}
