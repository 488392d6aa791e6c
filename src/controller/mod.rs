//! Controller module for CassandraCluster reconciliation
//! This module contains the reconciliation core: observation, planning,
//! the operation state machine and the controller loop.

pub mod conditions;
pub mod config;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod observer;
pub mod operations;
pub mod planner;
#[cfg(test)]
mod planner_test;
mod reconciler;
pub mod resources;
pub mod sidecar;
pub mod substrate;
#[cfg(test)]
pub(crate) mod testing;
pub mod topology;

pub use config::{ConfigOverrides, OperatorConfig};
pub use planner::{plan, Action, Plan, PlanError, PlanLimits};
pub use reconciler::{
    calculate_backoff, run_controller, ClusterKey, ControllerState, Reconciler, CONTROLLER_NAME,
    REASON_PLAN_ERROR, REASON_SUBSTRATE_REJECTION, REASON_SUBSTRATE_UNAVAILABLE,
    REASON_VALIDATION_FAILED,
};
pub use substrate::{KubeSubstrate, Substrate, SubstrateError};
pub use topology::Topology;
