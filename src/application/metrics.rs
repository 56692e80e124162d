use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Engine counters. Registered into the given registry so tests can use a
/// private one; `main` passes the default registry.
pub struct EngineMetrics {
    pub orders_placed: IntCounter,
    pub orders_rejected: IntCounter,
    pub gate_blocks: IntCounterVec,
    pub watchdog_fires: IntCounterVec,
    pub reconcile_runs: IntCounter,
    pub trades_opened: IntCounter,
    pub trades_closed: IntCounter,
    pub kill_switch: IntGauge,
    pub halt: IntGauge,
    pub orphans_queued: IntCounter,
    pub orphans_dead_lettered: IntCounter,
}

impl EngineMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let orders_placed =
            IntCounter::with_opts(Opts::new("scalpr_orders_placed_total", "Orders placed"))?;
        let orders_rejected = IntCounter::with_opts(Opts::new(
            "scalpr_orders_rejected_total",
            "Broker order rejections",
        ))?;
        let gate_blocks = IntCounterVec::new(
            Opts::new("scalpr_gate_blocks_total", "Signals blocked by entry gates"),
            &["code"],
        )?;
        let watchdog_fires = IntCounterVec::new(
            Opts::new("scalpr_watchdog_fires_total", "Watchdog corrective actions"),
            &["kind"],
        )?;
        let reconcile_runs =
            IntCounter::with_opts(Opts::new("scalpr_reconcile_runs_total", "Reconcile passes"))?;
        let trades_opened =
            IntCounter::with_opts(Opts::new("scalpr_trades_opened_total", "Trades opened"))?;
        let trades_closed =
            IntCounter::with_opts(Opts::new("scalpr_trades_closed_total", "Trades closed"))?;
        let kill_switch = IntGauge::with_opts(Opts::new(
            "scalpr_kill_switch",
            "1 when the kill switch is engaged",
        ))?;
        let halt = IntGauge::with_opts(Opts::new("scalpr_halt", "1 when the global halt is raised"))?;
        let orphans_queued = IntCounter::with_opts(Opts::new(
            "scalpr_orphan_postbacks_total",
            "Postbacks queued without an order link",
        ))?;
        let orphans_dead_lettered = IntCounter::with_opts(Opts::new(
            "scalpr_orphan_dead_letters_total",
            "Orphan postbacks dead-lettered",
        ))?;

        registry.register(Box::new(orders_placed.clone()))?;
        registry.register(Box::new(orders_rejected.clone()))?;
        registry.register(Box::new(gate_blocks.clone()))?;
        registry.register(Box::new(watchdog_fires.clone()))?;
        registry.register(Box::new(reconcile_runs.clone()))?;
        registry.register(Box::new(trades_opened.clone()))?;
        registry.register(Box::new(trades_closed.clone()))?;
        registry.register(Box::new(kill_switch.clone()))?;
        registry.register(Box::new(halt.clone()))?;
        registry.register(Box::new(orphans_queued.clone()))?;
        registry.register(Box::new(orphans_dead_lettered.clone()))?;

        Ok(Self {
            orders_placed,
            orders_rejected,
            gate_blocks,
            watchdog_fires,
            reconcile_runs,
            trades_opened,
            trades_closed,
            kill_switch,
            halt,
            orphans_queued,
            orphans_dead_lettered,
        })
    }

    /// Unregistered instance for unit tests.
    pub fn unregistered() -> Self {
        Self::new(&Registry::new()).expect("metrics construction cannot fail on a fresh registry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let registry = Registry::new();
        let metrics = EngineMetrics::new(&registry).unwrap();
        metrics.orders_placed.inc();
        metrics.gate_blocks.with_label_values(&["SPREAD_WIDE"]).inc();
        let families = registry.gather();
        assert!(families.iter().any(|f| f.name() == "scalpr_orders_placed_total"));
        // Double registration on the same registry is refused
        assert!(EngineMetrics::new(&registry).is_err());
    }
}
