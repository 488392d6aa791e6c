//! Shared types for CassandraCluster specifications and status
//!
//! These types are used across the CRD definitions and controller logic.
//!
//! # Type Hierarchy
//!
//! - [`Topology`] / [`Datacenter`] / [`Rack`] - the desired placement of Cassandra nodes
//! - [`ResourceRequirements`] - CPU and memory requests/limits following Kubernetes conventions
//! - [`StorageConfig`] - Persistent storage for Cassandra data directories
//! - Status types: [`RackStatus`], [`OperationRecord`], [`Condition`]

use std::collections::BTreeMap;

use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Schema for free-form Cassandra configuration blocks
pub(crate) fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut obj = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(obj)
}

/// Kubernetes-style resource requirements
///
/// Resource quantities use the Kubernetes formats:
/// - CPU: `"500m"` (millicores), `"2"` (cores)
/// - Memory: `"512Mi"`, `"4Gi"`
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// Minimum resources requested
    pub requests: ResourceSpec,
    /// Maximum resources allowed
    pub limits: ResourceSpec,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            requests: ResourceSpec {
                cpu: "1".to_string(),
                memory: "2Gi".to_string(),
            },
            limits: ResourceSpec {
                cpu: "2".to_string(),
                memory: "4Gi".to_string(),
            },
        }
    }
}

/// Resource specification for CPU and memory
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ResourceSpec {
    /// CPU cores (e.g., "500m", "2")
    pub cpu: String,
    /// Memory (e.g., "1Gi", "4Gi")
    pub memory: String,
}

/// Storage configuration for the Cassandra data volume
///
/// # Examples
///
/// ```rust,no_run
/// use cassandra_k8s::crd::StorageConfig;
///
/// let storage = StorageConfig {
///     storage_class: "local-storage".to_string(),
///     data_capacity: "200Gi".to_string(),
/// };
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Storage class name (e.g., "standard", "local-storage")
    pub storage_class: String,
    /// Size of each node's PersistentVolumeClaim (e.g., "100Gi")
    pub data_capacity: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_class: "standard".to_string(),
            data_capacity: "10Gi".to_string(),
        }
    }
}

/// Placement of Cassandra datacenters and racks
///
/// An empty topology means a single `dc1` datacenter with a single `rack1`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    /// Datacenters, in declaration order
    #[serde(default)]
    pub dc: Vec<Datacenter>,
}

/// A Cassandra datacenter, typically mapped to a region
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Datacenter {
    pub name: String,

    /// Node labels used to target Kubernetes nodes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Configuration overrides applied to every rack of this datacenter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config: Option<serde_json::Value>,

    /// Overrides `spec.nodesPerRacks` for this datacenter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes_per_racks: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Racks of this datacenter, in declaration order
    #[serde(default)]
    pub rack: Vec<Rack>,
}

/// A rack: an independently scaled set of nodes, mapped to a failure domain
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rack {
    pub name: String,

    /// Node labels used to target Kubernetes nodes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config: Option<serde_json::Value>,

    /// Overrides the datacenter and cluster replica count for this rack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes_per_racks: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Overall lifecycle phase of a CassandraCluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ClusterPhase {
    /// The cluster has never converged yet
    #[default]
    Initializing,
    /// Every rack matches the desired replica count and no operation is in flight
    Running,
    /// A structural change or an operation is in flight
    Updating,
    /// The desired state is invalid or the substrate refused a change
    Error,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Initializing => write!(f, "Initializing"),
            ClusterPhase::Running => write!(f, "Running"),
            ClusterPhase::Updating => write!(f, "Updating"),
            ClusterPhase::Error => write!(f, "Error"),
        }
    }
}

/// Lifecycle phase of a single rack
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum RackPhase {
    #[default]
    Initializing,
    Running,
    /// A structural change to this rack has been issued and has not settled
    Updating,
}

impl std::fmt::Display for RackPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RackPhase::Initializing => write!(f, "Initializing"),
            RackPhase::Running => write!(f, "Running"),
            RackPhase::Updating => write!(f, "Updating"),
        }
    }
}

/// Status of one rack, keyed by `<dc>-<rack>` in the cluster status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RackStatus {
    pub dc: String,
    pub rack: String,
    /// Replica count requested by the spec (0 for racks being removed)
    pub desired_replicas: i32,
    /// Live Cassandra pods observed in the rack
    pub observed_replicas: i32,
    /// Live pods passing readiness
    pub ready_replicas: i32,
    pub phase: RackPhase,
    /// Last structural change issued against this rack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<RackActionStatus>,
}

/// Record of the last structural action applied to a rack
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RackActionStatus {
    /// Action kind (AddRack, ScaleRack, UpdateImage, UpdateConfig, RemoveRack)
    pub name: String,
    /// Human readable target, e.g. "replicas=5" or "image=cassandra:4.1"
    pub target: String,
    pub started_at: String,
}

/// Administrative operations that can run on Cassandra nodes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// nodetool cleanup
    Cleanup,
    /// nodetool rebuild, argument is the source datacenter
    Rebuild,
    /// nodetool upgradesstables
    #[serde(rename = "upgradesstables")]
    UpgradeSSTables,
    /// nodetool decommission
    Decommission,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Cleanup => "cleanup",
            OperationKind::Rebuild => "rebuild",
            OperationKind::UpgradeSSTables => "upgradesstables",
            OperationKind::Decommission => "decommission",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cleanup" => Ok(OperationKind::Cleanup),
            "rebuild" => Ok(OperationKind::Rebuild),
            "upgradesstables" => Ok(OperationKind::UpgradeSSTables),
            "decommission" => Ok(OperationKind::Decommission),
            other => Err(format!("unknown operation '{}'", other)),
        }
    }
}

/// What an operation applies to
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum OperationScope {
    Cluster,
    Rack { dc: String, rack: String },
    Node { dc: String, rack: String, pod: String },
}

impl std::fmt::Display for OperationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationScope::Cluster => write!(f, "cluster"),
            OperationScope::Rack { dc, rack } => write!(f, "{}-{}", dc, rack),
            OperationScope::Node { pod, .. } => write!(f, "{}", pod),
        }
    }
}

/// Lifecycle state of an operation
///
/// Pending -> Running -> {Done, Failed}; Failed -> Pending only on a retry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum OperationState {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationState::Pending => write!(f, "Pending"),
            OperationState::Running => write!(f, "Running"),
            OperationState::Done => write!(f, "Done"),
            OperationState::Failed => write!(f, "Failed"),
        }
    }
}

/// Why an operation failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum FailureClass {
    /// Retry budget exhausted on transient substrate errors
    Transient,
    /// The substrate refused the request as invalid; never retried
    Rejected,
    /// The node reported the operation itself failed
    OperationFailed,
    /// Pending past the bookkeeping deadline
    Timeout,
    /// Not started because a sibling operation failed
    Aborted,
}

/// Where an operation request came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum TriggerSource {
    /// `operation-name` / `operation-status` labels on a pod
    PodLabel,
    /// `operation.db.orange.com/<kind>` annotation on the CassandraCluster
    ClusterAnnotation,
    /// Fan-out child of another operation
    Parent,
    /// Decommission the operator requested before scaling a node away
    ScaleDown,
}

/// Status of one operation, keyed by `<kind>/<target>` in the cluster status
///
/// Child operations are flattened into the same map and point at their
/// parent through `parent`.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub kind: OperationKind,
    pub scope: OperationScope,
    /// Label selector matching the pods this operation targets
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument: Option<String>,
    pub state: OperationState,
    pub source: TriggerSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureClass>,
    #[serde(default)]
    pub retry_count: u32,
    /// Substrate-side identifier of a started node operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// Condition for status reporting
///
/// Follows the Kubernetes convention for condition reporting.
///
/// # Examples
///
/// ```rust,no_run
/// use cassandra_k8s::crd::Condition;
///
/// let condition = Condition::ready(true, "ClusterConverged", "All racks are running");
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "Progressing", "Degraded")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new Ready condition
    pub fn ready(status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: "Ready".to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        }
    }

    /// Set the observed generation for this condition
    pub fn with_observed_generation(mut self, generation: i64) -> Self {
        self.observed_generation = Some(generation);
        self
    }
}
