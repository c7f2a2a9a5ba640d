//! Prometheus metrics for the reconciliation workers.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::time::Duration;

/// Labels identifying a worker.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WorkerLabels {
    /// Worker kind (director, director-v6, realserver)
    pub worker: String,
}

/// Labels for reconfigure outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconfigureLabels {
    /// Worker kind
    pub worker: String,
    /// Outcome (complete, noop, error, critical)
    pub outcome: String,
}

/// Labels for node update handling.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeUpdateLabels {
    /// Worker kind
    pub worker: String,
    /// Update disposition (noop, updated)
    pub kind: String,
}

/// Labels for channel depth observations.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ChannelLabels {
    /// Worker kind
    pub worker: String,
    /// Channel name (config, nodes)
    pub channel: String,
}

/// Labels for loopback address errors.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AddressOpLabels {
    /// Operation (add, remove)
    pub op: String,
}

/// Metrics registry for the worker state machines.
pub struct WorkerMetrics {
    /// Prometheus registry
    pub registry: Registry,

    reconfigure_total: Family<ReconfigureLabels, Counter>,
    reconfigure_duration_seconds: Family<WorkerLabels, Histogram>,
    queue_depth: Family<ChannelLabels, Gauge>,
    node_updates_total: Family<NodeUpdateLabels, Counter>,
    config_updates_total: Family<WorkerLabels, Counter>,

    loopback_additions_total: Counter,
    loopback_removals_total: Counter,
    loopback_desired: Gauge,
    loopback_config_healthy: Gauge,
    loopback_errors_total: Family<AddressOpLabels, Counter>,

    haproxy_instances: Gauge,
    haproxy_errors_total: Counter,
    haproxy_dropped_errors_total: Counter,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconfigure_total = Family::<ReconfigureLabels, Counter>::default();
        registry.register(
            "ravel_reconfigure",
            "Reconfigure attempts by outcome",
            reconfigure_total.clone(),
        );

        let reconfigure_duration_seconds =
            Family::<WorkerLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 14))
            });
        registry.register(
            "ravel_reconfigure_duration_seconds",
            "Reconfigure duration in seconds",
            reconfigure_duration_seconds.clone(),
        );

        let queue_depth = Family::<ChannelLabels, Gauge>::default();
        registry.register(
            "ravel_queue_depth",
            "Inbound channel queue depth",
            queue_depth.clone(),
        );

        let node_updates_total = Family::<NodeUpdateLabels, Counter>::default();
        registry.register(
            "ravel_node_updates",
            "Node list deliveries by disposition",
            node_updates_total.clone(),
        );

        let config_updates_total = Family::<WorkerLabels, Counter>::default();
        registry.register(
            "ravel_config_updates",
            "Cluster config deliveries",
            config_updates_total.clone(),
        );

        let loopback_additions_total = Counter::default();
        registry.register(
            "ravel_loopback_additions",
            "VIP addresses added to the loopback device",
            loopback_additions_total.clone(),
        );

        let loopback_removals_total = Counter::default();
        registry.register(
            "ravel_loopback_removals",
            "VIP addresses removed from the loopback device",
            loopback_removals_total.clone(),
        );

        let loopback_desired = Gauge::default();
        registry.register(
            "ravel_loopback_desired",
            "Desired VIP address count",
            loopback_desired.clone(),
        );

        let loopback_config_healthy = Gauge::default();
        registry.register(
            "ravel_loopback_config_healthy",
            "Whether the last loopback reconcile succeeded (1=yes, 0=no)",
            loopback_config_healthy.clone(),
        );

        let loopback_errors_total = Family::<AddressOpLabels, Counter>::default();
        registry.register(
            "ravel_loopback_errors",
            "Loopback address operation failures",
            loopback_errors_total.clone(),
        );

        let haproxy_instances = Gauge::default();
        registry.register(
            "ravel_haproxy_instances",
            "Running HAProxy instances",
            haproxy_instances.clone(),
        );

        let haproxy_errors_total = Counter::default();
        registry.register(
            "ravel_haproxy_errors",
            "HAProxy instance errors observed by the supervisor",
            haproxy_errors_total.clone(),
        );

        let haproxy_dropped_errors_total = Counter::default();
        registry.register(
            "ravel_haproxy_dropped_errors",
            "HAProxy instance errors dropped because the error channel was full",
            haproxy_dropped_errors_total.clone(),
        );

        Self {
            registry,
            reconfigure_total,
            reconfigure_duration_seconds,
            queue_depth,
            node_updates_total,
            config_updates_total,
            loopback_additions_total,
            loopback_removals_total,
            loopback_desired,
            loopback_config_healthy,
            loopback_errors_total,
            haproxy_instances,
            haproxy_errors_total,
            haproxy_dropped_errors_total,
        }
    }

    /// Record one reconfigure attempt.
    pub fn reconfigure(&self, worker: &str, outcome: &str, duration: Duration) {
        self.reconfigure_total
            .get_or_create(&ReconfigureLabels {
                worker: worker.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
        self.reconfigure_duration_seconds
            .get_or_create(&WorkerLabels {
                worker: worker.to_string(),
            })
            .observe(duration.as_secs_f64());
    }

    pub fn queue_depth(&self, worker: &str, channel: &str, depth: usize) {
        self.queue_depth
            .get_or_create(&ChannelLabels {
                worker: worker.to_string(),
                channel: channel.to_string(),
            })
            .set(depth as i64);
    }

    pub fn node_update(&self, worker: &str, kind: &str) {
        self.node_updates_total
            .get_or_create(&NodeUpdateLabels {
                worker: worker.to_string(),
                kind: kind.to_string(),
            })
            .inc();
    }

    pub fn config_update(&self, worker: &str) {
        self.config_updates_total
            .get_or_create(&WorkerLabels {
                worker: worker.to_string(),
            })
            .inc();
    }

    pub fn loopback_additions(&self, count: usize) {
        self.loopback_additions_total.inc_by(count as u64);
    }

    pub fn loopback_removals(&self, count: usize) {
        self.loopback_removals_total.inc_by(count as u64);
    }

    pub fn loopback_desired(&self, count: usize) {
        self.loopback_desired.set(count as i64);
    }

    pub fn loopback_config_healthy(&self, healthy: bool) {
        self.loopback_config_healthy.set(healthy as i64);
    }

    pub fn loopback_error(&self, op: &str) {
        self.loopback_errors_total
            .get_or_create(&AddressOpLabels { op: op.to_string() })
            .inc();
    }

    pub fn haproxy_instances(&self, count: usize) {
        self.haproxy_instances.set(count as i64);
    }

    /// Advance the supervisor error counter to `total`.
    ///
    /// The supervisor reports a cumulative count, so the counter is bumped
    /// by the delta since the last observation.
    pub fn haproxy_errors(&self, total: u64) {
        let current = self.haproxy_errors_total.get();
        if total > current {
            self.haproxy_errors_total.inc_by(total - current);
        }
    }

    /// Advance the dropped-error counter to `total`.
    pub fn haproxy_dropped_errors(&self, total: u64) {
        let current = self.haproxy_dropped_errors_total.get();
        if total > current {
            self.haproxy_dropped_errors_total.inc_by(total - current);
        }
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
