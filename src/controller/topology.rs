//! Observed topology model
//!
//! A read-only snapshot of what is actually running for one cluster, grouped
//! by rack. Produced by the observer, consumed by the planner and the
//! operation state machine.

use std::collections::BTreeMap;

use crate::crd::{OperationKind, RackKey};

/// Cassandra-internal node state, normalized from whatever the substrate reports
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeHealth {
    Up,
    Down,
    Joining,
    Leaving,
}

/// Value of the `operation-status` pod label
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TriggerStatus {
    ToDo,
    Ongoing,
    Done,
    Error,
}

impl TriggerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerStatus::ToDo => "ToDo",
            TriggerStatus::Ongoing => "Ongoing",
            TriggerStatus::Done => "Done",
            TriggerStatus::Error => "Error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ToDo" => Some(TriggerStatus::ToDo),
            "Ongoing" => Some(TriggerStatus::Ongoing),
            "Done" => Some(TriggerStatus::Done),
            "Error" => Some(TriggerStatus::Error),
            _ => None,
        }
    }
}

/// An operation request carried by pod labels
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodTrigger {
    pub kind: OperationKind,
    pub status: TriggerStatus,
    pub argument: Option<String>,
}

/// An operation request carried by a cluster annotation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterTrigger {
    pub kind: OperationKind,
    /// `None` targets the whole cluster
    pub rack: Option<RackKey>,
    pub argument: Option<String>,
}

/// All operation requests visible on the cluster object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterTriggers {
    pub operations: Vec<ClusterTrigger>,
    /// Operation keys a user asked to retry
    pub retries: Vec<String>,
}

/// One live Cassandra node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeObservation {
    /// Pod name
    pub name: String,
    pub ordinal: u32,
    pub ready: bool,
    pub health: NodeHealth,
    /// Whether the node still owns token ranges; `None` when not reported
    pub owns_data: Option<bool>,
    pub trigger: Option<PodTrigger>,
}

impl NodeObservation {
    /// Operation requested on this node that has not finished yet
    pub fn pending_operation(&self) -> Option<OperationKind> {
        self.trigger
            .as_ref()
            .filter(|t| matches!(t.status, TriggerStatus::ToDo | TriggerStatus::Ongoing))
            .map(|t| t.kind)
    }

    /// Nodes that report no range ownership can be removed without data loss
    pub fn holds_no_data(&self) -> bool {
        self.owns_data == Some(false)
    }
}

/// What the rack's workload object currently asks for
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadObservation {
    pub name: String,
    pub replicas: i32,
    pub image: Option<String>,
    pub config_hash: Option<String>,
    /// The workload controller has caught up with the latest change
    pub settled: bool,
}

/// Everything observed for one rack
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObservedRack {
    pub workload: Option<WorkloadObservation>,
    /// Live nodes, sorted by ordinal
    pub nodes: Vec<NodeObservation>,
}

impl ObservedRack {
    pub fn ready_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.ready).count()
    }

    pub fn is_empty(&self) -> bool {
        self.workload.is_none() && self.nodes.is_empty()
    }

    /// The workload settled and every requested replica is live and ready
    pub fn is_converged(&self) -> bool {
        match &self.workload {
            Some(w) => {
                w.settled
                    && self.nodes.len() == w.replicas.max(0) as usize
                    && self.ready_nodes() == self.nodes.len()
            }
            None => false,
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeObservation> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// Snapshot of one cluster, keyed by rack in (dc, rack) order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology {
    pub racks: BTreeMap<RackKey, ObservedRack>,
}

impl Topology {
    pub fn rack(&self, key: &RackKey) -> Option<&ObservedRack> {
        self.racks.get(key)
    }

    /// Find a node and the rack it belongs to
    pub fn find_node(&self, name: &str) -> Option<(&RackKey, &NodeObservation)> {
        self.racks
            .iter()
            .find_map(|(key, rack)| rack.node(name).map(|n| (key, n)))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&RackKey, &NodeObservation)> {
        self.racks
            .iter()
            .flat_map(|(key, rack)| rack.nodes.iter().map(move |n| (key, n)))
    }
}
