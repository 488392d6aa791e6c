//! Kubernetes resource builders for CassandraCluster
//!
//! Each rack maps to one StatefulSet named `<cluster>-<dc>-<rack>`, governed
//! by the headless Service `<cluster>-<dc>` of its datacenter. One
//! PodDisruptionBudget named after the cluster covers every pod. Structural
//! actions other than rack creation are expressed as narrow patches so that
//! one action never changes more than the field it is about.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, ResourceRequirements as K8sResources,
    Service, ServicePort, ServiceSpec, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::crd::{CassandraCluster, DesiredRack, RackKey, ResourceRequirements};

pub const LABEL_APP: &str = "app";
pub const APP_NAME: &str = "cassandracluster";
pub const LABEL_CLUSTER: &str = "cassandracluster";
pub const LABEL_DC: &str = "cassandraclusters.db.orange.com.dc";
pub const LABEL_RACK: &str = "cassandraclusters.db.orange.com.rack";

pub const ANNOTATION_CONFIG_HASH: &str = "cassandraclusters.db.orange.com/config-hash";
pub const ANNOTATION_NODE_STATE: &str = "cassandraclusters.db.orange.com/node-state";
pub const ANNOTATION_OWNS_RANGES: &str = "cassandraclusters.db.orange.com/owns-ranges";

pub const LABEL_OPERATION_NAME: &str = "operation-name";
pub const LABEL_OPERATION_STATUS: &str = "operation-status";
pub const LABEL_OPERATION_ARGUMENT: &str = "operation-argument";

/// Prefix of cluster annotations requesting an operation
pub const ANNOTATION_OPERATION_PREFIX: &str = "operation.db.orange.com/";
/// Cluster annotation listing operation keys to retry
pub const ANNOTATION_OPERATION_RETRY: &str = "operation.db.orange.com/retry";

pub const CASSANDRA_CONTAINER: &str = "cassandra";
pub const SIDECAR_CONTAINER: &str = "cassandra-sidecar";
pub const DEFAULT_SIDECAR_IMAGE: &str = "gcr.io/cassandra-operator/instaclustr-icarus:1.1.0";

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "cassandra-operator";

const CQL_PORT: i32 = 9042;

const DATA_VOLUME: &str = "data";
const DATA_MOUNT_PATH: &str = "/var/lib/cassandra";

/// Labels shared by everything that belongs to one cluster
pub fn cluster_labels(cluster_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP.to_string(), APP_NAME.to_string());
    labels.insert(LABEL_CLUSTER.to_string(), cluster_name.to_string());
    labels
}

/// Labels identifying one rack's pods and workload
pub fn rack_labels(cluster_name: &str, rack: &RackKey) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster_name);
    labels.insert(LABEL_DC.to_string(), rack.dc.clone());
    labels.insert(LABEL_RACK.to_string(), rack.rack.clone());
    labels
}

/// Label selector string matching every pod and workload of a cluster
pub fn cluster_selector(cluster_name: &str) -> String {
    cluster_labels(cluster_name)
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn stateful_set_name(cluster_name: &str, rack: &RackKey) -> String {
    format!("{}-{}", cluster_name, rack.dc_rack_name())
}

/// Headless Service shared by the racks of one datacenter
pub fn service_name(cluster_name: &str, dc: &str) -> String {
    format!("{cluster_name}-{dc}")
}

fn datacenter_labels(cluster_name: &str, dc: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster_name);
    labels.insert(LABEL_DC.to_string(), dc.to_string());
    labels
}

/// Create an OwnerReference for garbage collection
pub fn owner_reference(cluster: &CassandraCluster) -> OwnerReference {
    OwnerReference {
        api_version: CassandraCluster::api_version(&()).to_string(),
        kind: CassandraCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Build the StatefulSet for a new rack
pub fn build_stateful_set(
    cluster: &CassandraCluster,
    rack: &DesiredRack,
    sidecar_port: u16,
) -> StatefulSet {
    let cluster_name = cluster.name_any();
    let name = stateful_set_name(&cluster_name, &rack.key);
    let labels = rack_labels(&cluster_name, &rack.key);

    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_CONFIG_HASH.to_string(), rack.config_hash.clone());

    let mut storage_requests = BTreeMap::new();
    storage_requests.insert(
        "storage".to_string(),
        Quantity(rack.storage.data_capacity.clone()),
    );

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            annotations: Some(annotations.clone()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(rack.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            service_name: service_name(&cluster_name, &rack.key.dc),
            pod_management_policy: Some("OrderedReady".to_string()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateStatefulSetStrategy {
                    max_unavailable: Some(IntOrString::Int(cluster.spec.max_pod_unavailable)),
                    ..Default::default()
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![
                        build_cassandra_container(&cluster_name, rack),
                        build_sidecar_container(sidecar_port),
                    ],
                    service_account_name: cluster.spec.service_account_name.clone(),
                    node_selector: if rack.labels.is_empty() {
                        None
                    } else {
                        Some(rack.labels.clone())
                    },
                    termination_grace_period_seconds: Some(1800),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(DATA_VOLUME.to_string()),
                    labels: Some(labels),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    storage_class_name: Some(rack.storage.storage_class.clone()),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(storage_requests),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Build the headless Service giving the pods of a datacenter stable DNS names
///
/// Not-ready addresses are published so that joining nodes can find seeds.
pub fn build_headless_service(cluster: &CassandraCluster, dc: &str) -> Service {
    let cluster_name = cluster.name_any();
    let labels = datacenter_labels(&cluster_name, dc);

    Service {
        metadata: ObjectMeta {
            name: Some(service_name(&cluster_name, dc)),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("cql".to_string()),
                port: CQL_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        status: None,
    }
}

/// Build the PodDisruptionBudget covering every pod of the cluster
pub fn build_pod_disruption_budget(cluster: &CassandraCluster) -> PodDisruptionBudget {
    let cluster_name = cluster.name_any();
    let labels = cluster_labels(&cluster_name);

    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(cluster_name),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            selector: Some(LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            }),
            max_unavailable: Some(IntOrString::Int(cluster.spec.max_pod_unavailable)),
            ..Default::default()
        }),
        status: None,
    }
}

fn build_cassandra_container(cluster_name: &str, rack: &DesiredRack) -> Container {
    let port = |name: &str, port: i32| ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..Default::default()
    };

    Container {
        name: CASSANDRA_CONTAINER.to_string(),
        image: Some(rack.image.clone()),
        ports: Some(vec![
            port("intra-node", 7000),
            port("intra-node-tls", 7001),
            port("jmx-port", 7199),
            port("cql", CQL_PORT),
        ]),
        env: Some(cassandra_env(cluster_name, rack)),
        resources: Some(k8s_resources(&rack.resources)),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: DATA_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn cassandra_env(cluster_name: &str, rack: &DesiredRack) -> Vec<EnvVar> {
    let value = |name: &str, value: String| EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    };

    vec![
        value("CASSANDRA_CLUSTER_NAME", cluster_name.to_string()),
        value("CASSANDRA_DC", rack.key.dc.clone()),
        value("CASSANDRA_RACK", rack.key.rack.clone()),
        value("CASSANDRA_CONFIG", rack.config.to_string()),
        EnvVar {
            name: "POD_IP".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "status.podIP".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

fn build_sidecar_container(sidecar_port: u16) -> Container {
    Container {
        name: SIDECAR_CONTAINER.to_string(),
        image: Some(DEFAULT_SIDECAR_IMAGE.to_string()),
        ports: Some(vec![ContainerPort {
            name: Some("sidecar".to_string()),
            container_port: i32::from(sidecar_port),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: DATA_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn k8s_resources(resources: &ResourceRequirements) -> K8sResources {
    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity(resources.requests.cpu.clone()));
    requests.insert(
        "memory".to_string(),
        Quantity(resources.requests.memory.clone()),
    );

    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity(resources.limits.cpu.clone()));
    limits.insert(
        "memory".to_string(),
        Quantity(resources.limits.memory.clone()),
    );

    K8sResources {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    }
}

/// Strategic merge patch changing only the replica count
pub fn scale_patch(replicas: i32) -> serde_json::Value {
    serde_json::json!({
        "spec": { "replicas": replicas }
    })
}

/// Strategic merge patch changing only the Cassandra image
pub fn image_patch(image: &str) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "template": {
                "spec": {
                    "containers": [
                        { "name": CASSANDRA_CONTAINER, "image": image }
                    ]
                }
            }
        }
    })
}

/// Strategic merge patch rolling out new configuration and resources
///
/// The config hash lands in the pod template, which triggers a rolling restart.
pub fn config_patch(rack: &DesiredRack) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "annotations": { ANNOTATION_CONFIG_HASH: rack.config_hash }
        },
        "spec": {
            "template": {
                "metadata": {
                    "annotations": { ANNOTATION_CONFIG_HASH: rack.config_hash }
                },
                "spec": {
                    "containers": [
                        {
                            "name": CASSANDRA_CONTAINER,
                            "env": [
                                { "name": "CASSANDRA_CONFIG", "value": rack.config.to_string() }
                            ],
                            "resources": k8s_resources(&rack.resources),
                        }
                    ]
                }
            }
        }
    })
}
