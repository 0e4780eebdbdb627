//! ---
//! cobus_section: "05-step-coordination"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Step coordination and bus service composition."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};

/// Prometheus metric handles for bus activity.
pub struct BusMetrics {
    cycles: IntCounter,
    frames: IntCounter,
    sessions_admitted: IntCounter,
    signal_writes: IntCounter,
    quorum_wait: Histogram,
}

impl BusMetrics {
    /// Register bus metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let cycles = IntCounter::with_opts(Opts::new(
            "bus_cycles_total",
            "Completed simulation cycles (merge + broadcast)",
        ))?;
        let frames = IntCounter::with_opts(Opts::new(
            "bus_frames_total",
            "Protocol frames consumed from the transport",
        ))?;
        let sessions_admitted = IntCounter::with_opts(Opts::new(
            "bus_sessions_admitted_total",
            "Model sessions admitted since startup",
        ))?;
        let signal_writes = IntCounter::with_opts(Opts::new(
            "bus_signal_writes_total",
            "Individual signal writes applied to channel buffers",
        ))?;
        let quorum_wait = Histogram::with_opts(HistogramOpts::new(
            "bus_quorum_wait_seconds",
            "Time from a cycle's first write until quorum closed",
        ))?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(frames.clone()))?;
        registry.register(Box::new(sessions_admitted.clone()))?;
        registry.register(Box::new(signal_writes.clone()))?;
        registry.register(Box::new(quorum_wait.clone()))?;

        Ok(Self {
            cycles,
            frames,
            sessions_admitted,
            signal_writes,
            quorum_wait,
        })
    }

    /// Record a completed cycle.
    pub fn observe_cycle(&self) {
        self.cycles.inc();
    }

    /// Record a consumed frame.
    pub fn observe_frame(&self) {
        self.frames.inc();
    }

    /// Record an admitted session.
    pub fn observe_admission(&self) {
        self.sessions_admitted.inc();
    }

    /// Record applied signal writes.
    pub fn observe_writes(&self, count: usize) {
        self.signal_writes.inc_by(count as u64);
    }

    /// Record how long a cycle waited for quorum.
    pub fn observe_quorum_wait(&self, waited: Duration) {
        self.quorum_wait.observe(waited.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_count() {
        let registry = Registry::new();
        let metrics = BusMetrics::register(&registry).expect("register metrics");
        metrics.observe_cycle();
        metrics.observe_frame();
        metrics.observe_admission();
        metrics.observe_writes(3);
        metrics.observe_quorum_wait(Duration::from_millis(5));

        let families = registry.gather();
        assert!(families.iter().any(|f| f.get_name() == "bus_cycles_total"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "bus_quorum_wait_seconds"));
    }
}
