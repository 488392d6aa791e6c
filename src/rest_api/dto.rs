//! Response bodies of the REST API

use std::collections::BTreeMap;

use kube::ResourceExt;
use serde::Serialize;

use crate::crd::{CassandraCluster, CassandraClusterStatus, ClusterPhase, OperationRecord};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub leader: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub phase: ClusterPhase,
    pub racks: usize,
    pub desired_nodes: i32,
    pub ready_nodes: i32,
    pub active_operations: usize,
}

impl From<&CassandraCluster> for ClusterSummary {
    fn from(cluster: &CassandraCluster) -> Self {
        let status = cluster.status.clone().unwrap_or_default();
        let desired_nodes = cluster
            .spec
            .desired_racks()
            .iter()
            .map(|r| r.replicas)
            .sum();
        Self {
            name: cluster.name_any(),
            namespace: cluster.namespace().unwrap_or_default(),
            image: cluster.spec.cassandra_image.clone(),
            phase: status.phase,
            racks: status.racks.len(),
            desired_nodes,
            ready_nodes: status.racks.values().map(|r| r.ready_replicas).sum(),
            active_operations: status
                .operations
                .values()
                .filter(|op| crate::controller::operations::is_active(op))
                .count(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ClusterListResponse {
    pub items: Vec<ClusterSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetailResponse {
    pub name: String,
    pub namespace: String,
    pub generation: Option<i64>,
    pub status: CassandraClusterStatus,
    pub created_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OperationListResponse {
    pub operations: BTreeMap<String, OperationRecord>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CassandraClusterSpec, RackPhase, RackStatus};

    #[test]
    fn test_summary_counts_nodes_across_racks() {
        let mut cluster = CassandraCluster::new(
            "demo",
            CassandraClusterSpec {
                nodes_per_racks: 3,
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("db".to_string());
        let mut status = CassandraClusterStatus {
            phase: ClusterPhase::Updating,
            ..Default::default()
        };
        status.racks.insert(
            "dc1-rack1".to_string(),
            RackStatus {
                dc: "dc1".to_string(),
                rack: "rack1".to_string(),
                desired_replicas: 3,
                observed_replicas: 3,
                ready_replicas: 2,
                phase: RackPhase::Updating,
                last_action: None,
            },
        );
        cluster.status = Some(status);

        let summary = ClusterSummary::from(&cluster);
        assert_eq!(summary.namespace, "db");
        assert_eq!(summary.phase, ClusterPhase::Updating);
        assert_eq!(summary.desired_nodes, 3);
        assert_eq!(summary.ready_nodes, 2);
        assert_eq!(summary.active_operations, 0);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["desiredNodes"], 3);
        assert_eq!(json["phase"], "Updating");
    }
}
