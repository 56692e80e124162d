//! Trade status lattice.
//!
//! Every persisted status change goes through `can_transition`; the store
//! rejects writes whose edge is not in this graph, so a trade's status
//! history is always a path here.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeStatus {
    EntryPlaced,
    EntryOpen,
    EntryFilled,
    EntryFailed,
    Live,
    /// Synthetic trade created by the reconciler for a broker position with
    /// no matching record. Behaves as LIVE for transition purposes.
    RecoveryRehydrated,
    ExitedTarget,
    ExitedSl,
    GuardFailed,
    Closed,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::EntryFailed
                | TradeStatus::ExitedTarget
                | TradeStatus::ExitedSl
                | TradeStatus::Closed
        )
    }

    /// The trade still owns (or may come to own) a broker position.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// A position is (or should be) open at the broker in this status.
    pub fn holds_position(&self) -> bool {
        matches!(
            self,
            TradeStatus::EntryFilled
                | TradeStatus::Live
                | TradeStatus::RecoveryRehydrated
                | TradeStatus::GuardFailed
        )
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradeStatus::EntryPlaced => "ENTRY_PLACED",
            TradeStatus::EntryOpen => "ENTRY_OPEN",
            TradeStatus::EntryFilled => "ENTRY_FILLED",
            TradeStatus::EntryFailed => "ENTRY_FAILED",
            TradeStatus::Live => "LIVE",
            TradeStatus::RecoveryRehydrated => "RECOVERY_REHYDRATED",
            TradeStatus::ExitedTarget => "EXITED_TARGET",
            TradeStatus::ExitedSl => "EXITED_SL",
            TradeStatus::GuardFailed => "GUARD_FAILED",
            TradeStatus::Closed => "CLOSED",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTRY_PLACED" => Ok(TradeStatus::EntryPlaced),
            "ENTRY_OPEN" => Ok(TradeStatus::EntryOpen),
            "ENTRY_FILLED" => Ok(TradeStatus::EntryFilled),
            "ENTRY_FAILED" => Ok(TradeStatus::EntryFailed),
            "LIVE" => Ok(TradeStatus::Live),
            "RECOVERY_REHYDRATED" => Ok(TradeStatus::RecoveryRehydrated),
            "EXITED_TARGET" => Ok(TradeStatus::ExitedTarget),
            "EXITED_SL" => Ok(TradeStatus::ExitedSl),
            "GUARD_FAILED" => Ok(TradeStatus::GuardFailed),
            "CLOSED" => Ok(TradeStatus::Closed),
            other => Err(format!("unknown trade status: {}", other)),
        }
    }
}

/// `(x, x)` is an allowed no-op. Terminal states may only move to CLOSED.
pub fn can_transition(from: TradeStatus, to: TradeStatus) -> bool {
    use TradeStatus::*;

    if from == to {
        return true;
    }
    if from.is_terminal() {
        return to == Closed;
    }
    match from {
        EntryPlaced => matches!(to, EntryOpen | EntryFilled | EntryFailed),
        EntryOpen => matches!(to, EntryFilled | EntryFailed | GuardFailed),
        EntryFilled => matches!(to, Live | ExitedTarget | ExitedSl | GuardFailed | Closed),
        Live | RecoveryRehydrated => matches!(to, ExitedTarget | ExitedSl | GuardFailed | Closed),
        GuardFailed => to == Closed,
        // Terminal arms handled above
        EntryFailed | ExitedTarget | ExitedSl | Closed => false,
    }
}

/// Postback reordering filter: an ENTRY_FILLED postback is stale once the
/// trade has advanced to a protected or terminal state. Applying it again
/// would re-run fill handling (and re-place exits).
pub fn is_stale_entry_fill(current: TradeStatus) -> bool {
    matches!(
        current,
        TradeStatus::Live | TradeStatus::RecoveryRehydrated | TradeStatus::GuardFailed
    ) || current.is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use TradeStatus::*;

    const ALL: [TradeStatus; 10] = [
        EntryPlaced,
        EntryOpen,
        EntryFilled,
        EntryFailed,
        Live,
        RecoveryRehydrated,
        ExitedTarget,
        ExitedSl,
        GuardFailed,
        Closed,
    ];

    #[test]
    fn test_self_transition_is_noop() {
        for s in ALL {
            assert!(can_transition(s, s), "{} -> {} should be allowed", s, s);
        }
    }

    #[test]
    fn test_entry_path() {
        assert!(can_transition(EntryPlaced, EntryOpen));
        assert!(can_transition(EntryPlaced, EntryFilled));
        assert!(can_transition(EntryPlaced, EntryFailed));
        assert!(can_transition(EntryOpen, EntryFilled));
        assert!(can_transition(EntryFilled, Live));
        assert!(!can_transition(EntryPlaced, Live));
        assert!(!can_transition(EntryOpen, Closed));
    }

    #[test]
    fn test_exit_paths() {
        assert!(can_transition(Live, ExitedTarget));
        assert!(can_transition(Live, ExitedSl));
        assert!(can_transition(Live, GuardFailed));
        assert!(can_transition(Live, Closed));
        assert!(can_transition(RecoveryRehydrated, ExitedSl));
        assert!(can_transition(GuardFailed, Closed));
        assert!(!can_transition(GuardFailed, Live));
    }

    #[test]
    fn test_terminal_never_reopens() {
        for term in ALL.into_iter().filter(|s| s.is_terminal()) {
            for next in ALL {
                if next == Closed || next == term {
                    assert!(can_transition(term, next));
                } else {
                    assert!(
                        !can_transition(term, next),
                        "{} -> {} must be forbidden",
                        term,
                        next
                    );
                }
            }
        }
    }

    #[test]
    fn test_every_status_reaches_closed() {
        // CLOSED must be reachable from every state in at most two hops.
        for s in ALL {
            let direct = can_transition(s, Closed);
            let via_guard = can_transition(s, GuardFailed) && can_transition(GuardFailed, Closed);
            let via_fail = can_transition(s, EntryFailed) && can_transition(EntryFailed, Closed);
            assert!(direct || via_guard || via_fail, "{} cannot reach CLOSED", s);
        }
    }

    #[test]
    fn test_stale_entry_fill_filter() {
        assert!(!is_stale_entry_fill(EntryPlaced));
        assert!(!is_stale_entry_fill(EntryOpen));
        assert!(!is_stale_entry_fill(EntryFilled));
        assert!(is_stale_entry_fill(Live));
        assert!(is_stale_entry_fill(ExitedSl));
        assert!(is_stale_entry_fill(GuardFailed));
        assert!(is_stale_entry_fill(Closed));
    }

    #[test]
    fn test_holds_position() {
        assert!(Live.holds_position());
        assert!(RecoveryRehydrated.holds_position());
        assert!(GuardFailed.holds_position());
        assert!(!EntryPlaced.holds_position());
        assert!(!Closed.holds_position());
    }
}
