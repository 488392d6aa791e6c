//! Cluster state observer
//!
//! Collapses the live pods and StatefulSets of one cluster into a [`Topology`].
//! Substrate objects are validated here; anything without rack identity is
//! ignored rather than treated as an error, and a node that does not exist
//! yet is simply absent from the snapshot.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, warn};

use crate::crd::{OperationKind, RackKey};

use super::resources::{
    cluster_selector, ANNOTATION_CONFIG_HASH, ANNOTATION_NODE_STATE, ANNOTATION_OPERATION_PREFIX,
    ANNOTATION_OPERATION_RETRY, ANNOTATION_OWNS_RANGES, CASSANDRA_CONTAINER, LABEL_DC,
    LABEL_OPERATION_ARGUMENT, LABEL_OPERATION_NAME, LABEL_OPERATION_STATUS, LABEL_RACK,
};
use super::substrate::{Substrate, SubstrateError};
use super::topology::{
    ClusterTrigger, ClusterTriggers, NodeHealth, NodeObservation, ObservedRack, PodTrigger,
    Topology, TriggerStatus, WorkloadObservation,
};

/// Read the live topology of one cluster
pub async fn observe<S: Substrate + ?Sized>(
    substrate: &S,
    namespace: &str,
    cluster_name: &str,
) -> Result<Topology, SubstrateError> {
    let selector = cluster_selector(cluster_name);
    let stateful_sets = substrate.list_stateful_sets(namespace, &selector).await?;
    let pods = substrate.list_pods(namespace, &selector).await?;

    let topology = build_topology(&pods, &stateful_sets);
    debug!(
        "Observed {} racks and {} nodes for {}/{}",
        topology.racks.len(),
        topology.nodes().count(),
        namespace,
        cluster_name
    );
    Ok(topology)
}

/// Normalize substrate objects into a topology snapshot
pub fn build_topology(pods: &[Pod], stateful_sets: &[StatefulSet]) -> Topology {
    let mut racks: BTreeMap<RackKey, ObservedRack> = BTreeMap::new();

    for sts in stateful_sets {
        let Some(key) = rack_key(sts.metadata.labels.as_ref()) else {
            continue;
        };
        racks.entry(key).or_default().workload = Some(observe_workload(sts));
    }

    for pod in pods {
        if pod.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let Some(key) = rack_key(pod.metadata.labels.as_ref()) else {
            continue;
        };
        let Some(node) = observe_node(pod) else {
            continue;
        };
        racks.entry(key).or_default().nodes.push(node);
    }

    for rack in racks.values_mut() {
        rack.nodes.sort_by_key(|n| n.ordinal);
    }

    Topology { racks }
}

fn rack_key(labels: Option<&BTreeMap<String, String>>) -> Option<RackKey> {
    let labels = labels?;
    let dc = labels.get(LABEL_DC)?;
    let rack = labels.get(LABEL_RACK)?;
    Some(RackKey::new(dc.as_str(), rack.as_str()))
}

fn observe_workload(sts: &StatefulSet) -> WorkloadObservation {
    let spec = sts.spec.as_ref();
    let replicas = spec.and_then(|s| s.replicas).unwrap_or(1);
    let template = spec.map(|s| &s.template);

    let image = template
        .and_then(|t| t.spec.as_ref())
        .and_then(|p| p.containers.iter().find(|c| c.name == CASSANDRA_CONTAINER))
        .and_then(|c| c.image.clone());

    let config_hash = template
        .and_then(|t| t.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(ANNOTATION_CONFIG_HASH))
        .cloned();

    let settled = match (sts.status.as_ref(), sts.metadata.generation) {
        (Some(status), generation) => {
            let caught_up = match (status.observed_generation, generation) {
                (Some(observed), Some(generation)) => observed >= generation,
                (_, None) => true,
                (None, Some(_)) => false,
            };
            let revisions_match = match (&status.current_revision, &status.update_revision) {
                (Some(current), Some(update)) => current == update,
                _ => true,
            };
            caught_up
                && revisions_match
                && status.replicas == replicas
                && status.ready_replicas.unwrap_or(0) == replicas
                && status.updated_replicas.unwrap_or(replicas) == replicas
        }
        (None, _) => false,
    };

    WorkloadObservation {
        name: sts.metadata.name.clone().unwrap_or_default(),
        replicas,
        image,
        config_hash,
        settled,
    }
}

fn observe_node(pod: &Pod) -> Option<NodeObservation> {
    let name = pod.metadata.name.clone()?;
    let Some(ordinal) = pod_ordinal(&name) else {
        warn!("Ignoring pod {} without a StatefulSet ordinal", name);
        return None;
    };

    let ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);

    let annotations = pod.metadata.annotations.as_ref();
    let reported_state = annotations.and_then(|a| a.get(ANNOTATION_NODE_STATE));
    let health = reported_state
        .and_then(|s| parse_node_state(s))
        .unwrap_or(if ready { NodeHealth::Up } else { NodeHealth::Down });

    let decommissioned = reported_state
        .map(|s| s.eq_ignore_ascii_case("DECOMMISSIONED"))
        .unwrap_or(false);
    let owns_data = if decommissioned {
        Some(false)
    } else {
        annotations
            .and_then(|a| a.get(ANNOTATION_OWNS_RANGES))
            .and_then(|v| v.parse::<bool>().ok())
    };

    Some(NodeObservation {
        name,
        ordinal,
        ready,
        health,
        owns_data,
        trigger: pod_trigger(pod.metadata.labels.as_ref()),
    })
}

/// StatefulSet pods end with `-<ordinal>`
pub fn pod_ordinal(name: &str) -> Option<u32> {
    name.rsplit_once('-')
        .and_then(|(_, ordinal)| ordinal.parse().ok())
}

/// Map nodetool status codes and gossip states onto [`NodeHealth`]
pub fn parse_node_state(state: &str) -> Option<NodeHealth> {
    match state.trim().to_ascii_uppercase().as_str() {
        "UN" | "NORMAL" | "UP" => Some(NodeHealth::Up),
        "DN" | "DOWN" | "DECOMMISSIONED" => Some(NodeHealth::Down),
        "UJ" | "DJ" | "JOINING" => Some(NodeHealth::Joining),
        "UL" | "DL" | "UM" | "DM" | "LEAVING" | "MOVING" => Some(NodeHealth::Leaving),
        _ => None,
    }
}

fn pod_trigger(labels: Option<&BTreeMap<String, String>>) -> Option<PodTrigger> {
    let labels = labels?;
    let kind = labels.get(LABEL_OPERATION_NAME)?;
    let kind = match kind.parse::<OperationKind>() {
        Ok(kind) => kind,
        Err(e) => {
            warn!("Ignoring pod operation trigger: {}", e);
            return None;
        }
    };
    let status = labels
        .get(LABEL_OPERATION_STATUS)
        .and_then(|s| TriggerStatus::parse(s))?;

    Some(PodTrigger {
        kind,
        status,
        argument: labels.get(LABEL_OPERATION_ARGUMENT).cloned(),
    })
}

/// Parse the operation annotations of a CassandraCluster
///
/// `operation.db.orange.com/<kind>: <target>[@<argument>]` requests an
/// operation; `operation.db.orange.com/retry: <key>[,<key>]` requests retries.
pub fn cluster_triggers(annotations: Option<&BTreeMap<String, String>>) -> ClusterTriggers {
    let mut triggers = ClusterTriggers::default();
    let Some(annotations) = annotations else {
        return triggers;
    };

    for (key, value) in annotations {
        if key == ANNOTATION_OPERATION_RETRY {
            let keys: BTreeSet<String> = value
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
            triggers.retries = keys.into_iter().collect();
            continue;
        }

        let Some(kind) = key.strip_prefix(ANNOTATION_OPERATION_PREFIX) else {
            continue;
        };
        let kind = match kind.parse::<OperationKind>() {
            Ok(kind) => kind,
            Err(e) => {
                warn!("Ignoring cluster operation annotation {}: {}", key, e);
                continue;
            }
        };

        let (target, argument) = match value.split_once('@') {
            Some((target, argument)) => (target.trim(), Some(argument.trim().to_string())),
            None => (value.trim(), None),
        };

        let rack = if target.is_empty() || target == "cluster" {
            None
        } else {
            match target.split_once('-') {
                Some((dc, rack)) if !dc.is_empty() && !rack.is_empty() => {
                    Some(RackKey::new(dc, rack))
                }
                _ => {
                    warn!(
                        "Ignoring cluster operation annotation {}: target '{}' is not 'cluster' or '<dc>-<rack>'",
                        key, target
                    );
                    continue;
                }
            }
        };

        triggers.operations.push(ClusterTrigger {
            kind,
            rack,
            argument: argument.filter(|a| !a.is_empty()),
        });
    }

    triggers
}
