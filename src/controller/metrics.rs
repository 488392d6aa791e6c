//! Prometheus metrics for the Cassandra operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `cassandra_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `cassandra_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `cassandra_actions_applied_total` (counter): structural actions applied, labeled by namespace/name/action.
//! - `cassandra_operation_transitions_total` (counter): operation state changes labeled by kind/state.
//! - `cassandra_cluster_phase` (gauge): 1 for the current phase of each cluster, 0 for the others.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::crd::ClusterPhase;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "cassandracluster"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind/category, e.g. "kube", "plan", "substrate_transient"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ActionLabels {
    pub namespace: String,
    pub name: String,
    /// AddRack, ScaleRack, UpdateImage, UpdateConfig or RemoveRack
    pub action: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub kind: String,
    pub state: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub namespace: String,
    pub name: String,
    pub phase: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static ACTIONS_APPLIED_TOTAL: Lazy<Family<ActionLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static OPERATION_TRANSITIONS_TOTAL: Lazy<Family<OperationLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static CLUSTER_PHASE: Lazy<Family<PhaseLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "cassandra_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "cassandra_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "cassandra_actions_applied_total",
        "Structural rack actions sent to the cluster",
        ACTIONS_APPLIED_TOTAL.clone(),
    );
    registry.register(
        "cassandra_operation_transitions_total",
        "Operation state transitions by kind and new state",
        OPERATION_TRANSITIONS_TOTAL.clone(),
    );
    registry.register(
        "cassandra_cluster_phase",
        "Current phase of each CassandraCluster (1 = active phase)",
        CLUSTER_PHASE.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_action_applied(namespace: &str, name: &str, action: &str) {
    let labels = ActionLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
        action: action.to_string(),
    };
    ACTIONS_APPLIED_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_operation_transition(kind: &str, state: &str) {
    let labels = OperationLabels {
        kind: kind.to_string(),
        state: state.to_string(),
    };
    OPERATION_TRANSITIONS_TOTAL.get_or_create(&labels).inc();
}

/// Set the phase gauge so exactly one phase reads 1 for the cluster
pub fn set_cluster_phase(namespace: &str, name: &str, phase: ClusterPhase) {
    for candidate in [
        ClusterPhase::Initializing,
        ClusterPhase::Running,
        ClusterPhase::Updating,
        ClusterPhase::Error,
    ] {
        let labels = PhaseLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            phase: candidate.to_string(),
        };
        CLUSTER_PHASE
            .get_or_create(&labels)
            .set(i64::from(candidate == phase));
    }
}
