//! Substrate interface
//!
//! Everything the reconciliation core reads from or asks of the outside world
//! goes through [`Substrate`]. Every call is fallible and none is assumed to
//! be atomic with another. [`KubeSubstrate`] is the Kubernetes implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::crd::{CassandraCluster, OperationKind};
use crate::error::is_retriable_kube_error;

use super::resources::FIELD_MANAGER;
use super::sidecar::SidecarClient;

/// Failure classes of substrate calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubstrateError {
    /// Network trouble, timeouts, throttling or conflicts; worth retrying
    #[error("transient: {0}")]
    Transient(String),

    /// The substrate refused the request as invalid; retrying will not help
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<kube::Error> for SubstrateError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => SubstrateError::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if !is_retriable_kube_error(&err) => {
                SubstrateError::Rejected(format!("{} ({})", resp.message, resp.reason))
            }
            _ => SubstrateError::Transient(err.to_string()),
        }
    }
}

/// A node-level operation to hand to the node's sidecar
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeOperationRequest {
    pub kind: OperationKind,
    pub argument: Option<String>,
}

/// Progress of a started node operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationProgress {
    InProgress,
    Succeeded,
    Failed(String),
}

/// Label or annotation changes; `None` removes the key
pub type MetadataPatch = BTreeMap<String, Option<String>>;

#[async_trait]
pub trait Substrate: Send + Sync {
    /// Fetch a cluster; `Ok(None)` when it no longer exists
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CassandraCluster>, SubstrateError>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, SubstrateError>;

    async fn list_stateful_sets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<StatefulSet>, SubstrateError>;

    /// Create or fully update a StatefulSet
    async fn apply_stateful_set(
        &self,
        namespace: &str,
        stateful_set: &StatefulSet,
    ) -> Result<(), SubstrateError>;

    /// Strategic merge patch against an existing StatefulSet
    async fn patch_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), SubstrateError>;

    /// Delete a StatefulSet; deleting a missing one succeeds
    async fn delete_stateful_set(&self, namespace: &str, name: &str) -> Result<(), SubstrateError>;

    async fn patch_pod_labels(
        &self,
        namespace: &str,
        pod: &str,
        labels: &MetadataPatch,
    ) -> Result<(), SubstrateError>;

    async fn patch_cluster_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &MetadataPatch,
    ) -> Result<(), SubstrateError>;

    /// JSON merge patch (RFC 7386) against the status subresource
    ///
    /// Carries no resourceVersion, so metadata writes in between never make
    /// it conflict.
    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), SubstrateError>;

    /// Create or update the headless Service of a datacenter
    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<(), SubstrateError>;

    async fn apply_pod_disruption_budget(
        &self,
        namespace: &str,
        budget: &PodDisruptionBudget,
    ) -> Result<(), SubstrateError>;

    /// Start an operation on one node; returns a handle to poll with
    async fn start_node_operation(
        &self,
        namespace: &str,
        pod: &str,
        request: &NodeOperationRequest,
    ) -> Result<String, SubstrateError>;

    async fn poll_node_operation(
        &self,
        namespace: &str,
        pod: &str,
        handle: &str,
    ) -> Result<OperationProgress, SubstrateError>;
}

/// Kubernetes-backed substrate
#[derive(Clone)]
pub struct KubeSubstrate {
    client: Client,
    sidecar: SidecarClient,
}

impl KubeSubstrate {
    pub fn new(client: Client, sidecar: SidecarClient) -> Self {
        Self { client, sidecar }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn pod_ip(&self, namespace: &str, pod: &str) -> Result<String, SubstrateError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod_obj = api.get(pod).await?;
        pod_obj
            .status
            .and_then(|s| s.pod_ip)
            .ok_or_else(|| SubstrateError::Transient(format!("pod {pod} has no IP yet")))
    }
}

#[async_trait]
impl Substrate for KubeSubstrate {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CassandraCluster>, SubstrateError> {
        let api: Api<CassandraCluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, SubstrateError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(pods.items)
    }

    async fn list_stateful_sets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<StatefulSet>, SubstrateError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let sets = api.list(&ListParams::default().labels(selector)).await?;
        Ok(sets.items)
    }

    #[instrument(skip(self, stateful_set), fields(name = %stateful_set.name_any()))]
    async fn apply_stateful_set(
        &self,
        namespace: &str,
        stateful_set: &StatefulSet,
    ) -> Result<(), SubstrateError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let name = stateful_set.name_any();
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(stateful_set),
        )
        .await?;
        info!("Applied StatefulSet {}/{}", namespace, name);
        Ok(())
    }

    #[instrument(skip(self, patch))]
    async fn patch_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), SubstrateError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await?;
        info!("Patched StatefulSet {}/{}", namespace, name);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_stateful_set(&self, namespace: &str, name: &str) -> Result<(), SubstrateError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Deleted StatefulSet {}/{}", namespace, name);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!("StatefulSet {}/{} already gone", namespace, name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_pod_labels(
        &self,
        namespace: &str,
        pod: &str,
        labels: &MetadataPatch,
    ) -> Result<(), SubstrateError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        api.patch(pod, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_cluster_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &MetadataPatch,
    ) -> Result<(), SubstrateError> {
        let api: Api<CassandraCluster> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), SubstrateError> {
        let api: Api<CassandraCluster> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(patch),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, service), fields(name = %service.name_any()))]
    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<(), SubstrateError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let name = service.name_any();
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(service),
        )
        .await?;
        info!("Applied Service {}/{}", namespace, name);
        Ok(())
    }

    #[instrument(skip(self, budget), fields(name = %budget.name_any()))]
    async fn apply_pod_disruption_budget(
        &self,
        namespace: &str,
        budget: &PodDisruptionBudget,
    ) -> Result<(), SubstrateError> {
        let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
        let name = budget.name_any();
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(budget),
        )
        .await?;
        info!("Applied PodDisruptionBudget {}/{}", namespace, name);
        Ok(())
    }

    #[instrument(skip(self, request), fields(kind = %request.kind))]
    async fn start_node_operation(
        &self,
        namespace: &str,
        pod: &str,
        request: &NodeOperationRequest,
    ) -> Result<String, SubstrateError> {
        let ip = self.pod_ip(namespace, pod).await?;
        self.sidecar
            .start_operation(&self.sidecar.base_url(&ip), request)
            .await
    }

    async fn poll_node_operation(
        &self,
        namespace: &str,
        pod: &str,
        handle: &str,
    ) -> Result<OperationProgress, SubstrateError> {
        let ip = self.pod_ip(namespace, pod).await?;
        self.sidecar
            .operation_status(&self.sidecar.base_url(&ip), handle)
            .await
    }
}

/// Smallest JSON merge patch turning `from` into `to`
///
/// Keys missing from `to` become `null`. Arrays and scalars are replaced
/// whole. Returns `None` when nothing differs.
pub fn merge_diff(from: &Value, to: &Value) -> Option<Value> {
    match (from, to) {
        (Value::Object(from), Value::Object(to)) => {
            let mut patch = Map::new();
            for (key, old) in from {
                match to.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new) => {
                        if let Some(diff) = merge_diff(old, new) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                }
            }
            // A null field is the same as an absent one under merge semantics
            for (key, new) in to {
                if !from.contains_key(key) && !new.is_null() {
                    patch.insert(key.clone(), new.clone());
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        (from, to) if from == to => None,
        (_, to) => Some(to.clone()),
    }
}
