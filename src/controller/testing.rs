//! In-memory substrate for reconciler tests
//!
//! Stores one cluster plus its pods, StatefulSets, Services and
//! PodDisruptionBudgets. Every accepted StatefulSet change converges
//! immediately: pods are created or removed and reported Ready, so the next
//! pass observes the settled result. Metadata and status writes bump the
//! cluster's resourceVersion the way the API server does.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::crd::{CassandraCluster, CassandraClusterSpec, CassandraClusterStatus};

use super::resources::ANNOTATION_OWNS_RANGES;
use super::substrate::{
    MetadataPatch, NodeOperationRequest, OperationProgress, Substrate, SubstrateError,
};

pub const NAMESPACE: &str = "default";

#[derive(Default)]
struct World {
    cluster: Option<CassandraCluster>,
    stateful_sets: BTreeMap<String, StatefulSet>,
    pods: BTreeMap<String, Pod>,
    services: BTreeMap<String, Service>,
    budgets: BTreeMap<String, PodDisruptionBudget>,
    mutation_failures: VecDeque<SubstrateError>,
    status_failures: VecDeque<SubstrateError>,
    observe_failures: VecDeque<SubstrateError>,
    start_script: VecDeque<Result<String, SubstrateError>>,
    poll_script: VecDeque<Result<OperationProgress, SubstrateError>>,
    mutations: Vec<String>,
    started: Vec<(String, NodeOperationRequest)>,
    status_writes: usize,
    next_handle: usize,
}

#[derive(Default)]
pub struct FakeSubstrate {
    world: Mutex<World>,
}

impl FakeSubstrate {
    pub fn with_cluster(name: &str, spec: CassandraClusterSpec) -> Self {
        let mut cluster = CassandraCluster::new(name, spec);
        cluster.metadata.namespace = Some(NAMESPACE.to_string());
        cluster.metadata.generation = Some(1);
        cluster.metadata.resource_version = Some("1".to_string());

        let fake = Self::default();
        fake.world().cluster = Some(cluster);
        fake
    }

    fn world(&self) -> std::sync::MutexGuard<'_, World> {
        self.world.lock().unwrap()
    }

    pub fn cluster(&self) -> CassandraCluster {
        self.world().cluster.clone().unwrap()
    }

    pub fn status(&self) -> CassandraClusterStatus {
        self.cluster().status.unwrap_or_default()
    }

    pub fn delete_cluster(&self) {
        self.world().cluster = None;
    }

    /// Change the spec the way a user edit would, bumping the generation
    pub fn update_spec(&self, edit: impl FnOnce(&mut CassandraClusterSpec)) {
        let mut world = self.world();
        let cluster = world.cluster.as_mut().unwrap();
        edit(&mut cluster.spec);
        cluster.metadata.generation = Some(cluster.metadata.generation.unwrap_or(0) + 1);
        bump_resource_version(cluster);
    }

    pub fn set_cluster_annotation(&self, key: &str, value: &str) {
        let mut world = self.world();
        let cluster = world.cluster.as_mut().unwrap();
        cluster
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        bump_resource_version(cluster);
    }

    pub fn cluster_annotations(&self) -> BTreeMap<String, String> {
        self.cluster().metadata.annotations.unwrap_or_default()
    }

    pub fn set_pod_labels(&self, pod: &str, labels: &[(&str, &str)]) {
        let mut world = self.world();
        let pod = world.pods.get_mut(pod).unwrap();
        let existing = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (k, v) in labels {
            existing.insert(k.to_string(), v.to_string());
        }
    }

    pub fn pod_label(&self, pod: &str, key: &str) -> Option<String> {
        self.world()
            .pods
            .get(pod)
            .and_then(|p| p.metadata.labels.as_ref())
            .and_then(|l| l.get(key).cloned())
    }

    pub fn set_pod_annotation(&self, pod: &str, key: &str, value: &str) {
        let mut world = self.world();
        let pod = world.pods.get_mut(pod).unwrap();
        pod.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.world().pods.keys().cloned().collect()
    }

    pub fn stateful_set(&self, name: &str) -> Option<StatefulSet> {
        self.world().stateful_sets.get(name).cloned()
    }

    pub fn stateful_set_names(&self) -> Vec<String> {
        self.world().stateful_sets.keys().cloned().collect()
    }

    /// The next StatefulSet mutation fails with `error`
    pub fn fail_next_mutation(&self, error: SubstrateError) {
        self.world().mutation_failures.push_back(error);
    }

    /// The next status write fails with `error`
    pub fn fail_next_status_write(&self, error: SubstrateError) {
        self.world().status_failures.push_back(error);
    }

    /// The next pod/StatefulSet listing fails with `error`
    pub fn fail_next_observe(&self, error: SubstrateError) {
        self.world().observe_failures.push_back(error);
    }

    pub fn script_start(&self, result: Result<String, SubstrateError>) {
        self.world().start_script.push_back(result);
    }

    pub fn script_poll(&self, result: Result<OperationProgress, SubstrateError>) {
        self.world().poll_script.push_back(result);
    }

    /// Accepted StatefulSet mutations, e.g. `apply demo-dc1-rack1`
    pub fn mutations(&self) -> Vec<String> {
        self.world().mutations.clone()
    }

    /// Node operations handed to the sidecar, by pod
    pub fn started_operations(&self) -> Vec<(String, NodeOperationRequest)> {
        self.world().started.clone()
    }

    pub fn status_writes(&self) -> usize {
        self.world().status_writes
    }

    pub fn resource_version(&self) -> Option<String> {
        self.cluster().metadata.resource_version
    }

    pub fn service_names(&self) -> Vec<String> {
        self.world().services.keys().cloned().collect()
    }

    pub fn pod_disruption_budget(&self, name: &str) -> Option<PodDisruptionBudget> {
        self.world().budgets.get(name).cloned()
    }
}

fn bump_resource_version(cluster: &mut CassandraCluster) {
    let current = cluster
        .metadata
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    cluster.metadata.resource_version = Some((current + 1).to_string());
}

/// RFC 7386 JSON merge patch: `null` removes a key, objects merge, the rest replaces
fn json_merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    use serde_json::Value;
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                json_merge(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    let empty = BTreeMap::new();
    let labels = labels.unwrap_or(&empty);
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

/// Strategic-merge-like patch: objects merge, named lists merge by `name`
fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    use serde_json::Value;
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) => merge_patch(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(patch))
            if patch.iter().all(|p| p.get("name").is_some()) =>
        {
            for item in patch {
                match target
                    .iter_mut()
                    .find(|t| t.get("name").is_some() && t.get("name") == item.get("name"))
                {
                    Some(existing) => merge_patch(existing, item),
                    None => target.push(item.clone()),
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn ready_pod(sts: &StatefulSet, ordinal: i32) -> Pod {
    let name = format!("{}-{}", sts.name_any(), ordinal);
    let labels = sts
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.clone());
    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(NAMESPACE.to_string()),
            labels,
            annotations: Some(BTreeMap::from([(
                ANNOTATION_OWNS_RANGES.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        status: Some(PodStatus {
            pod_ip: Some(format!("10.0.0.{}", ordinal + 1)),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Bring pods and status in line with the StatefulSet spec
fn converge(world: &mut World, name: &str) {
    let Some(sts) = world.stateful_sets.get_mut(name) else {
        return;
    };
    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    sts.status = Some(StatefulSetStatus {
        replicas,
        ready_replicas: Some(replicas),
        updated_replicas: Some(replicas),
        current_replicas: Some(replicas),
        observed_generation: sts.metadata.generation,
        ..Default::default()
    });
    let sts = sts.clone();

    let prefix = format!("{name}-");
    let ordinal_of = |pod: &str| {
        pod.strip_prefix(&prefix)
            .and_then(|o| o.parse::<i32>().ok())
    };
    world
        .pods
        .retain(|pod, _| ordinal_of(pod).map(|o| o < replicas).unwrap_or(true));
    for ordinal in 0..replicas {
        let pod = format!("{name}-{ordinal}");
        world
            .pods
            .entry(pod)
            .or_insert_with(|| ready_pod(&sts, ordinal));
    }
}

impl World {
    fn take_failure(&mut self) -> Result<(), SubstrateError> {
        match self.mutation_failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Substrate for FakeSubstrate {
    async fn get_cluster(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<CassandraCluster>, SubstrateError> {
        Ok(self
            .world()
            .cluster
            .clone()
            .filter(|c| c.name_any() == name))
    }

    async fn list_pods(&self, _namespace: &str, selector: &str) -> Result<Vec<Pod>, SubstrateError> {
        let mut world = self.world();
        if let Some(e) = world.observe_failures.pop_front() {
            return Err(e);
        }
        Ok(world
            .pods
            .values()
            .filter(|p| matches_selector(p.metadata.labels.as_ref(), selector))
            .cloned()
            .collect())
    }

    async fn list_stateful_sets(
        &self,
        _namespace: &str,
        selector: &str,
    ) -> Result<Vec<StatefulSet>, SubstrateError> {
        let mut world = self.world();
        if let Some(e) = world.observe_failures.pop_front() {
            return Err(e);
        }
        Ok(world
            .stateful_sets
            .values()
            .filter(|s| matches_selector(s.metadata.labels.as_ref(), selector))
            .cloned()
            .collect())
    }

    async fn apply_stateful_set(
        &self,
        _namespace: &str,
        stateful_set: &StatefulSet,
    ) -> Result<(), SubstrateError> {
        let mut world = self.world();
        world.take_failure()?;
        let name = stateful_set.name_any();
        let generation = world
            .stateful_sets
            .get(&name)
            .and_then(|s| s.metadata.generation)
            .unwrap_or(0)
            + 1;
        let mut sts = stateful_set.clone();
        sts.metadata.generation = Some(generation);
        world.stateful_sets.insert(name.clone(), sts);
        world.mutations.push(format!("apply {name}"));
        converge(&mut world, &name);
        Ok(())
    }

    async fn patch_stateful_set(
        &self,
        _namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), SubstrateError> {
        let mut world = self.world();
        world.take_failure()?;
        let existing = world
            .stateful_sets
            .get(name)
            .ok_or_else(|| SubstrateError::NotFound(format!("statefulset {name}")))?;

        let mut value = serde_json::to_value(existing)
            .map_err(|e| SubstrateError::Rejected(e.to_string()))?;
        merge_patch(&mut value, patch);
        let mut sts: StatefulSet =
            serde_json::from_value(value).map_err(|e| SubstrateError::Rejected(e.to_string()))?;
        sts.metadata.generation = Some(sts.metadata.generation.unwrap_or(0) + 1);

        world.stateful_sets.insert(name.to_string(), sts);
        world.mutations.push(format!("patch {name}"));
        converge(&mut world, name);
        Ok(())
    }

    async fn delete_stateful_set(&self, _namespace: &str, name: &str) -> Result<(), SubstrateError> {
        let mut world = self.world();
        world.take_failure()?;
        world.stateful_sets.remove(name);
        let prefix = format!("{name}-");
        world.pods.retain(|pod, _| !pod.starts_with(&prefix));
        world.mutations.push(format!("delete {name}"));
        Ok(())
    }

    async fn patch_pod_labels(
        &self,
        _namespace: &str,
        pod: &str,
        labels: &MetadataPatch,
    ) -> Result<(), SubstrateError> {
        let mut world = self.world();
        let pod = world
            .pods
            .get_mut(pod)
            .ok_or_else(|| SubstrateError::NotFound(format!("pod {pod}")))?;
        let existing = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in labels {
            match value {
                Some(v) => existing.insert(key.clone(), v.clone()),
                None => existing.remove(key),
            };
        }
        Ok(())
    }

    async fn patch_cluster_annotations(
        &self,
        _namespace: &str,
        _name: &str,
        annotations: &MetadataPatch,
    ) -> Result<(), SubstrateError> {
        let mut world = self.world();
        let cluster = world
            .cluster
            .as_mut()
            .ok_or_else(|| SubstrateError::NotFound("cluster".to_string()))?;
        let existing = cluster.metadata.annotations.get_or_insert_with(BTreeMap::new);
        for (key, value) in annotations {
            match value {
                Some(v) => existing.insert(key.clone(), v.clone()),
                None => existing.remove(key),
            };
        }
        bump_resource_version(cluster);
        Ok(())
    }

    async fn patch_cluster_status(
        &self,
        _namespace: &str,
        _name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), SubstrateError> {
        let mut world = self.world();
        if let Some(e) = world.status_failures.pop_front() {
            return Err(e);
        }
        let cluster = world
            .cluster
            .as_mut()
            .ok_or_else(|| SubstrateError::NotFound("cluster".to_string()))?;
        if let Some(expected) = patch.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()) {
            if cluster.metadata.resource_version.as_deref() != Some(expected) {
                return Err(SubstrateError::Transient(format!(
                    "conflict: resourceVersion {expected} is stale"
                )));
            }
        }

        let mut value = serde_json::to_value(&cluster.status)
            .map_err(|e| SubstrateError::Rejected(e.to_string()))?;
        if let Some(status) = patch.get("status") {
            json_merge(&mut value, status);
        }
        cluster.status =
            serde_json::from_value(value).map_err(|e| SubstrateError::Rejected(e.to_string()))?;
        bump_resource_version(cluster);
        world.status_writes += 1;
        Ok(())
    }

    async fn apply_service(&self, _namespace: &str, service: &Service) -> Result<(), SubstrateError> {
        let mut world = self.world();
        world.take_failure()?;
        world.services.insert(service.name_any(), service.clone());
        Ok(())
    }

    async fn apply_pod_disruption_budget(
        &self,
        _namespace: &str,
        budget: &PodDisruptionBudget,
    ) -> Result<(), SubstrateError> {
        let mut world = self.world();
        world.take_failure()?;
        world.budgets.insert(budget.name_any(), budget.clone());
        Ok(())
    }

    async fn start_node_operation(
        &self,
        _namespace: &str,
        pod: &str,
        request: &NodeOperationRequest,
    ) -> Result<String, SubstrateError> {
        let mut world = self.world();
        let result = match world.start_script.pop_front() {
            Some(result) => result,
            None => {
                world.next_handle += 1;
                Ok(format!("op-{}", world.next_handle))
            }
        };
        if result.is_ok() {
            world.started.push((pod.to_string(), request.clone()));
        }
        result
    }

    async fn poll_node_operation(
        &self,
        _namespace: &str,
        _pod: &str,
        _handle: &str,
    ) -> Result<OperationProgress, SubstrateError> {
        self.world()
            .poll_script
            .pop_front()
            .unwrap_or(Ok(OperationProgress::Succeeded))
    }
}
