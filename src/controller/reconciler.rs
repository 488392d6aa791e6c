//! Main reconciler for CassandraCluster resources
//!
//! One pass reads the cluster, observes its pods and StatefulSets, plans,
//! applies at most one structural action, drives the operation state machine,
//! persists the status and only then acknowledges operation triggers.
//! [`run_controller`] drives passes from a kube-runtime [`Controller`], which
//! never runs two passes for the same cluster at once.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{self, Action as ControllerAction, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{
    CassandraCluster, CassandraClusterStatus, ClusterPhase, DesiredRack, OperationState,
    RackActionStatus, RackKey, RackPhase, RackStatus,
};
use crate::error::{Error, Result};

use super::conditions::{
    find_condition, set_condition, CONDITION_STATUS_TRUE, CONDITION_TYPE_DEGRADED,
    CONDITION_TYPE_PROGRESSING, CONDITION_TYPE_READY,
};
use super::config::OperatorConfig;
use super::observer;
use super::operations::{self, NodeStep, OperationMap, Outcome, TriggerWrites};
use super::planner::{self, Action, DeferReason, Plan};
use super::resources::{
    build_headless_service, build_pod_disruption_budget, build_stateful_set, config_patch,
    image_patch, scale_patch, stateful_set_name, LABEL_CLUSTER,
};
use super::sidecar::SidecarClient;
use super::substrate::{merge_diff, KubeSubstrate, Substrate, SubstrateError};
use super::topology::{ObservedRack, Topology};

pub const CONTROLLER_NAME: &str = "cassandracluster";

pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";
pub const REASON_PLAN_ERROR: &str = "PlanError";
pub const REASON_SUBSTRATE_REJECTION: &str = "SubstrateRejection";
pub const REASON_SUBSTRATE_UNAVAILABLE: &str = "SubstrateUnavailable";

/// How long a non-leader waits before looking at a cluster again
const NOT_LEADER_RETRY: Duration = Duration::from_secs(5);

const DEFAULT_BACKOFF_BASE_SECS: u64 = 15;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;

/// Exponential backoff: `base * 2^attempt`, capped at `max`
///
/// Defaults to 15s base and 300s cap. The exponent stops growing at 5.
pub fn calculate_backoff(attempt: u32, base_secs: Option<u64>, max_secs: Option<u64>) -> Duration {
    let base = base_secs.unwrap_or(DEFAULT_BACKOFF_BASE_SECS);
    let max = max_secs.unwrap_or(DEFAULT_BACKOFF_MAX_SECS);
    let delay = base.saturating_mul(2u64.saturating_pow(attempt.min(5)));
    Duration::from_secs(delay.min(max))
}

/// Identity of one CassandraCluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_cluster(cluster: &CassandraCluster) -> Self {
        Self::new(
            cluster.namespace().unwrap_or_else(|| "default".to_string()),
            cluster.name_any(),
        )
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub operator_namespace: String,
    pub is_leader: Arc<AtomicBool>,
    pub config: OperatorConfig,
}

/// Outcome of applying the first planned action
enum ActionResult {
    Idle,
    Blocked,
    Applied(Action),
    Failed(SubstrateError),
}

/// Reconciles one cluster at a time against a [`Substrate`]
pub struct Reconciler<S: ?Sized> {
    substrate: Arc<S>,
    config: OperatorConfig,
}

impl<S: Substrate + ?Sized> Reconciler<S> {
    pub fn new(substrate: Arc<S>, config: OperatorConfig) -> Self {
        Self { substrate, config }
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Run one reconciliation pass
    ///
    /// Returns when to look at the cluster again, or `None` when it is gone.
    #[instrument(skip(self), fields(namespace = %key.namespace, name = %key.name))]
    pub async fn reconcile(&self, key: &ClusterKey) -> Result<Option<Duration>> {
        let Some(cluster) = self.substrate.get_cluster(&key.namespace, &key.name).await? else {
            debug!("CassandraCluster {} no longer exists", key);
            return Ok(None);
        };

        let now = Utc::now();
        let generation = cluster.metadata.generation;
        let previous = cluster.status.clone().unwrap_or_default();
        let mut status = previous.clone();
        status.observed_generation = generation;

        if let Err(errors) = cluster.spec.validate() {
            let message = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            warn!("Invalid spec for {}: {}", key, message);
            fail_status(&mut status, REASON_VALIDATION_FAILED, message, generation);
            self.persist(&cluster, &previous, &status).await?;
            return Ok(Some(self.config.steady_interval()));
        }

        let mut topology =
            observer::observe(self.substrate.as_ref(), &key.namespace, &key.name).await?;
        operations::mark_decommissioned(&mut topology, &status.operations);
        let desired = cluster.spec.desired_racks();
        refresh_racks(&mut status, &desired, &topology);

        let in_flight: BTreeSet<RackKey> = status
            .racks
            .values()
            .filter(|r| r.phase == RackPhase::Updating)
            .map(|r| RackKey::new(r.dc.as_str(), r.rack.as_str()))
            .collect();

        let plan = match planner::plan(&desired, &topology, &in_flight, self.config.plan_limits()) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Cannot plan {}: {}", key, e);
                fail_status(&mut status, REASON_PLAN_ERROR, e.to_string(), generation);
                self.persist(&cluster, &previous, &status).await?;
                return Ok(Some(self.config.steady_interval()));
            }
        };
        for deferral in &plan.deferred {
            debug!("Deferred {}: {:?}", deferral.rack, deferral.reason);
            // One decommission per rack at a time, highest ordinal first
            if let DeferReason::NodesOwnData { nodes } = &deferral.reason {
                if let Some(pod) = nodes.first() {
                    if operations::request_decommission(&mut status.operations, &deferral.rack, pod, now)
                        .is_some()
                    {
                        info!("Decommissioning {} before it is scaled away", pod);
                    }
                }
            }
        }

        let blocked = rejected_at_generation(&status, generation);
        let result = match plan.actions.first() {
            None => ActionResult::Idle,
            Some(action) if blocked => {
                debug!("Holding {} until the spec changes", action);
                ActionResult::Blocked
            }
            Some(action) => match self.apply_action(&cluster, &desired, action).await {
                Ok(()) => ActionResult::Applied(action.clone()),
                Err(e) => ActionResult::Failed(e),
            },
        };

        let mut requeue: Option<Duration> = None;
        let mut degraded: Option<(&str, String)> = None;
        match &result {
            ActionResult::Idle => {}
            ActionResult::Blocked => {
                degraded = Some((
                    REASON_SUBSTRATE_REJECTION,
                    status.last_error.clone().unwrap_or_default(),
                ));
            }
            ActionResult::Applied(action) => {
                info!("Applied {} to {}", action, key);
                mark_updating(&mut status, action, now);
                status.substrate_retries = 0;
                #[cfg(feature = "metrics")]
                super::metrics::inc_action_applied(&key.namespace, &key.name, action.name());
            }
            ActionResult::Failed(SubstrateError::Rejected(msg)) => {
                warn!("{} rejected for {}: {}", plan.actions[0], key, msg);
                let message = format!("{} rejected: {}", plan.actions[0], msg);
                status.last_error = Some(message.clone());
                degraded = Some((REASON_SUBSTRATE_REJECTION, message));
            }
            ActionResult::Failed(e) => {
                status.substrate_retries += 1;
                let message = format!("{} failed: {}", plan.actions[0], e);
                warn!(
                    "{} for {} (attempt {}/{})",
                    message, key, status.substrate_retries, self.config.operation_retry_budget
                );
                status.last_error = Some(message.clone());
                requeue = Some(calculate_backoff(status.substrate_retries - 1, None, None));
                if status.substrate_retries >= self.config.operation_retry_budget {
                    degraded = Some((REASON_SUBSTRATE_UNAVAILABLE, message));
                }
            }
        }

        let mut recorded = previous.clone();
        let writes = self
            .run_operations(&cluster, &desired, &topology, &mut recorded, &mut status, now)
            .await?;

        let converged = matches!(result, ActionResult::Idle)
            && is_converged(&status, &desired, &plan);
        status.phase = match &degraded {
            Some(_) => ClusterPhase::Error,
            None if converged => ClusterPhase::Running,
            None if previous.phase == ClusterPhase::Initializing => ClusterPhase::Initializing,
            None => ClusterPhase::Updating,
        };
        status.message = Some(match &degraded {
            Some((_, message)) => message.clone(),
            None => progress_message(&status, &plan),
        });
        if status.phase == ClusterPhase::Running {
            status.last_error = None;
        }
        update_conditions(&mut status, degraded.as_ref(), generation);

        self.persist(&cluster, &recorded, &status).await?;
        self.write_triggers(&cluster, &writes).await;

        #[cfg(feature = "metrics")]
        super::metrics::set_cluster_phase(&key.namespace, &key.name, status.phase);

        let active = !converged
            || status.racks.values().any(|r| r.phase == RackPhase::Updating)
            || status.has_active_operations();
        let after = match requeue {
            Some(backoff) => backoff,
            None if status.phase == ClusterPhase::Error => self.config.steady_interval(),
            None if active => self.config.active_interval(),
            None => self.config.steady_interval(),
        };
        Ok(Some(after))
    }

    /// Send one structural action to the substrate
    async fn apply_action(
        &self,
        cluster: &CassandraCluster,
        desired: &[DesiredRack],
        action: &Action,
    ) -> std::result::Result<(), SubstrateError> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let name = stateful_set_name(&cluster.name_any(), action.rack());
        let desired_rack = || {
            desired
                .iter()
                .find(|d| &d.key == action.rack())
                .ok_or_else(|| SubstrateError::Rejected(format!("rack {} is not declared", action.rack())))
        };

        match action {
            Action::AddRack { rack, .. } => {
                let rack_spec = desired_rack()?;
                self.substrate
                    .apply_service(&namespace, &build_headless_service(cluster, &rack.dc))
                    .await?;
                self.substrate
                    .apply_pod_disruption_budget(&namespace, &build_pod_disruption_budget(cluster))
                    .await?;
                let sts = build_stateful_set(cluster, rack_spec, self.config.sidecar_port);
                self.substrate.apply_stateful_set(&namespace, &sts).await
            }
            Action::ScaleRack { to, .. } => {
                self.substrate
                    .patch_stateful_set(&namespace, &name, &scale_patch(*to))
                    .await
            }
            Action::UpdateImage { image, .. } => {
                self.substrate
                    .patch_stateful_set(&namespace, &name, &image_patch(image))
                    .await
            }
            Action::UpdateConfig { .. } => {
                self.substrate
                    .patch_stateful_set(&namespace, &name, &config_patch(desired_rack()?))
                    .await
            }
            Action::RemoveRack { .. } => self.substrate.delete_stateful_set(&namespace, &name).await,
        }
    }

    /// Advance every operation by one step
    ///
    /// Records that are about to be started for the first time, or again
    /// after a retry, are written to the status before the sidecar is called,
    /// so a lost status write never issues the same start twice. `recorded`
    /// tracks what the status subresource holds afterwards. Returns the
    /// trigger updates to make once the final status is stored.
    async fn run_operations(
        &self,
        cluster: &CassandraCluster,
        desired: &[DesiredRack],
        topology: &Topology,
        recorded: &mut CassandraClusterStatus,
        status: &mut CassandraClusterStatus,
        now: DateTime<Utc>,
    ) -> Result<TriggerWrites> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let settings = self.config.operation_settings();
        let triggers = observer::cluster_triggers(cluster.metadata.annotations.as_ref());
        let records = &mut status.operations;
        let before: HashMap<String, OperationState> =
            records.iter().map(|(k, r)| (k.clone(), r.state)).collect();

        operations::ingest_triggers(records, topology, &triggers, &settings, now);
        operations::expand(records, desired, topology, now);
        operations::aggregate(records, &settings, now);

        let steps = operations::node_steps(records, topology, &settings, now);
        let unrecorded_start = steps.iter().any(|step| match step {
            NodeStep::Start { key, .. } => recorded.operations.get(key) != records.get(key),
            _ => false,
        });
        if unrecorded_start {
            let mut checkpoint = recorded.clone();
            checkpoint.operations = records.clone();
            self.persist(cluster, recorded, &checkpoint).await?;
            *recorded = checkpoint;
        }

        for step in steps {
            let (key, outcome) = match step {
                NodeStep::Start { key, pod, request } => {
                    let outcome = match self
                        .substrate
                        .start_node_operation(&namespace, &pod, &request)
                        .await
                    {
                        Ok(handle) => {
                            info!("Started {} on {}", request.kind, pod);
                            Outcome::Started { handle }
                        }
                        Err(e) => {
                            warn!("Could not start {} on {}: {}", request.kind, pod, e);
                            Outcome::Error(e)
                        }
                    };
                    (key, outcome)
                }
                NodeStep::Poll { key, pod, handle } => {
                    let outcome = match self
                        .substrate
                        .poll_node_operation(&namespace, &pod, &handle)
                        .await
                    {
                        Ok(progress) => Outcome::Progress(progress),
                        Err(e) => {
                            debug!("Polling {} on {} failed: {}", key, pod, e);
                            Outcome::Error(e)
                        }
                    };
                    (key, outcome)
                }
                NodeStep::Timeout { key } => {
                    warn!("Operation {} timed out waiting to start", key);
                    (key, Outcome::TimedOut)
                }
            };
            operations::apply_outcome(records, &key, outcome, &settings, now);
        }

        operations::aggregate(records, &settings, now);

        for (key, record) in records.iter() {
            if before.get(key) != Some(&record.state) {
                debug!("Operation {} is now {}", key, record.state);
                #[cfg(feature = "metrics")]
                super::metrics::inc_operation_transition(record.kind.as_str(), &record.state.to_string());
            }
        }

        Ok(operations::trigger_writes(records, topology, &triggers, &settings))
    }

    /// Mirror operation states onto pod labels and cluster annotations
    ///
    /// Runs after the status is stored: a consumed trigger is only removed
    /// once the record it produced is durable.
    async fn write_triggers(&self, cluster: &CassandraCluster, writes: &TriggerWrites) {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        for (pod, labels) in &writes.pod_labels {
            if let Err(e) = self.substrate.patch_pod_labels(&namespace, pod, labels).await {
                warn!("Failed to update operation labels on {}: {}", pod, e);
            }
        }
        if !writes.cluster_annotations.is_empty() {
            if let Err(e) = self
                .substrate
                .patch_cluster_annotations(&namespace, &cluster.name_any(), &writes.cluster_annotations)
                .await
            {
                warn!("Failed to update operation annotations: {}", e);
            }
        }
    }

    /// Write the status only when something changed
    ///
    /// Sends a merge patch holding just the fields that differ from
    /// `previous`, with removed map entries set to null.
    async fn persist(
        &self,
        cluster: &CassandraCluster,
        previous: &CassandraClusterStatus,
        status: &CassandraClusterStatus,
    ) -> Result<()> {
        if status == previous {
            debug!("Status of {} unchanged", cluster.name_any());
            return Ok(());
        }
        let from = serde_json::to_value(previous)?;
        let to = serde_json::to_value(status)?;
        let Some(diff) = merge_diff(&from, &to) else {
            return Ok(());
        };
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        self.substrate
            .patch_cluster_status(&namespace, &cluster.name_any(), &serde_json::json!({ "status": diff }))
            .await?;
        Ok(())
    }
}

fn fail_status(
    status: &mut CassandraClusterStatus,
    reason: &str,
    message: String,
    generation: Option<i64>,
) {
    status.phase = ClusterPhase::Error;
    status.message = Some(message.clone());
    status.last_error = Some(message.clone());
    update_conditions(status, Some(&(reason, message)), generation);
}

/// A rejection recorded for the current generation blocks further actions
fn rejected_at_generation(status: &CassandraClusterStatus, generation: Option<i64>) -> bool {
    find_condition(&status.conditions, CONDITION_TYPE_DEGRADED)
        .map(|c| {
            c.status == CONDITION_STATUS_TRUE
                && c.reason == REASON_SUBSTRATE_REJECTION
                && c.observed_generation == generation
        })
        .unwrap_or(false)
}

/// An Updating rack settles once its workload has caught up with the last
/// change (generation and revisions) and every replica is ready. Further
/// differences from the spec are the planner's next action, not this one.
fn rack_phase(previous: RackPhase, desired: Option<&DesiredRack>, observed: Option<&ObservedRack>) -> RackPhase {
    let Some(observed) = observed else {
        return RackPhase::Initializing;
    };
    match previous {
        RackPhase::Updating if observed.workload.is_none() && desired.is_some() => {
            RackPhase::Initializing
        }
        RackPhase::Updating => {
            let settled = match &observed.workload {
                Some(_) => observed.is_converged(),
                None => observed.nodes.is_empty(),
            };
            if settled {
                RackPhase::Running
            } else {
                RackPhase::Updating
            }
        }
        _ if observed.workload.is_some() => RackPhase::Running,
        _ => RackPhase::Initializing,
    }
}

/// Recompute per-rack status from the spec and the observed topology
///
/// Racks that are no longer declared keep an entry until nothing of them is
/// observed any more.
fn refresh_racks(status: &mut CassandraClusterStatus, desired: &[DesiredRack], topology: &Topology) {
    let mut racks = std::collections::BTreeMap::new();

    let mut entry = |key: &RackKey, wanted: Option<&DesiredRack>, observed: Option<&ObservedRack>| {
        let name = key.dc_rack_name();
        let mut rack = status.racks.get(&name).cloned().unwrap_or_else(|| RackStatus {
            dc: key.dc.clone(),
            rack: key.rack.clone(),
            ..Default::default()
        });
        rack.desired_replicas = wanted.map(|d| d.replicas).unwrap_or(0);
        rack.observed_replicas = observed.map(|r| r.nodes.len() as i32).unwrap_or(0);
        rack.ready_replicas = observed.map(|r| r.ready_nodes() as i32).unwrap_or(0);
        rack.phase = rack_phase(rack.phase, wanted, observed);
        racks.insert(name, rack);
    };

    for rack in desired {
        entry(&rack.key, Some(rack), topology.rack(&rack.key));
    }
    for (key, observed) in &topology.racks {
        if desired.iter().any(|d| &d.key == key) || observed.is_empty() {
            continue;
        }
        entry(key, None, Some(observed));
    }

    status.racks = racks;
}

fn mark_updating(status: &mut CassandraClusterStatus, action: &Action, now: DateTime<Utc>) {
    let key = action.rack();
    let rack = status
        .racks
        .entry(key.dc_rack_name())
        .or_insert_with(|| RackStatus {
            dc: key.dc.clone(),
            rack: key.rack.clone(),
            ..Default::default()
        });
    rack.phase = RackPhase::Updating;
    rack.last_action = Some(RackActionStatus {
        name: action.name().to_string(),
        target: action.target(),
        started_at: now.to_rfc3339(),
    });
}

/// Every rack at its desired size, nothing planned, nothing in flight
fn is_converged(status: &CassandraClusterStatus, desired: &[DesiredRack], plan: &Plan) -> bool {
    plan.is_converged()
        && !status.has_active_operations()
        && status.racks.values().all(|r| r.phase != RackPhase::Updating)
        && desired.iter().all(|d| {
            status
                .racks
                .get(&d.key.dc_rack_name())
                .map(|r| r.observed_replicas == d.replicas)
                .unwrap_or(false)
        })
}

fn progress_message(status: &CassandraClusterStatus, plan: &Plan) -> String {
    let updating: Vec<&str> = status
        .racks
        .iter()
        .filter(|(_, r)| r.phase == RackPhase::Updating)
        .map(|(name, _)| name.as_str())
        .collect();
    if !updating.is_empty() {
        return format!("Updating racks: {}", updating.join(", "));
    }
    if let Some(action) = plan.actions.first() {
        return format!("Next action: {action}");
    }
    if let Some(deferral) = plan.deferred.first() {
        return format!("Waiting on rack {}: {:?}", deferral.rack, deferral.reason);
    }
    let active = status
        .operations
        .values()
        .filter(|op| operations::is_active(op))
        .count();
    if active > 0 {
        return format!("{active} operation(s) in progress");
    }
    if status.racks.values().any(|r| r.observed_replicas != r.desired_replicas) {
        return "Waiting for racks to reach their desired size".to_string();
    }
    "Cluster is running".to_string()
}

fn update_conditions(
    status: &mut CassandraClusterStatus,
    degraded: Option<&(&str, String)>,
    generation: Option<i64>,
) {
    let phase = status.phase;
    let message = status.message.clone().unwrap_or_default();

    set_condition(
        &mut status.conditions,
        CONDITION_TYPE_READY,
        phase == ClusterPhase::Running,
        match phase {
            ClusterPhase::Running => "ClusterConverged",
            ClusterPhase::Error => "Error",
            _ => "Converging",
        },
        &message,
        generation,
    );
    set_condition(
        &mut status.conditions,
        CONDITION_TYPE_PROGRESSING,
        matches!(phase, ClusterPhase::Initializing | ClusterPhase::Updating),
        match phase {
            ClusterPhase::Initializing | ClusterPhase::Updating => "ApplyingChanges",
            _ => "Idle",
        },
        &message,
        generation,
    );
    match degraded {
        Some((reason, message)) => set_condition(
            &mut status.conditions,
            CONDITION_TYPE_DEGRADED,
            true,
            reason,
            message,
            generation,
        ),
        None => set_condition(
            &mut status.conditions,
            CONDITION_TYPE_DEGRADED,
            false,
            "AsExpected",
            "",
            generation,
        ),
    }
}

/// Per-controller context handed to every pass
struct Context {
    reconciler: Reconciler<KubeSubstrate>,
    is_leader: Arc<AtomicBool>,
    /// Consecutive failed passes per cluster, for backoff
    failures: Mutex<HashMap<ClusterKey, u32>>,
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let namespace = state.operator_namespace.clone();
    let clusters: Api<CassandraCluster> = Api::namespaced(client.clone(), &namespace);

    info!("Starting CassandraCluster controller in namespace {}", namespace);

    // Verify CRD exists
    match clusters.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("CassandraCluster CRD is available"),
        Err(e) => {
            error!(
                "CassandraCluster CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "CassandraCluster CRD not installed".to_string(),
            ));
        }
    }

    let sidecar = SidecarClient::new(state.config.sidecar_port)?;
    let substrate = Arc::new(KubeSubstrate::new(client.clone(), sidecar));
    let context = Arc::new(Context {
        reconciler: Reconciler::new(substrate, state.config.clone()),
        is_leader: Arc::clone(&state.is_leader),
        failures: Mutex::new(HashMap::new()),
    });

    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let stateful_sets: Api<StatefulSet> = Api::namespaced(client.clone(), &namespace);
    let label_selector = watcher::Config::default().labels(LABEL_CLUSTER);
    let concurrency = u16::try_from(state.config.workers).unwrap_or(u16::MAX);

    info!("Running up to {} reconcile passes at once", concurrency);

    Controller::new(clusters, watcher::Config::default())
        .owns(stateful_sets, label_selector.clone())
        .watches(pods, label_selector, |pod: Pod| owning_cluster(&pod))
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile_cluster, error_policy, context)
        .for_each(|res| async move {
            match res {
                Ok((obj, _action)) => debug!("Reconciled {}", obj.name),
                Err(e) => warn!("Controller error: {}", e),
            }
        })
        .await;

    info!("Controller stopped");
    Ok(())
}

/// Map a labelled pod to the cluster it belongs to
fn owning_cluster<K: ResourceExt>(obj: &K) -> Option<ObjectRef<CassandraCluster>> {
    let name = obj.labels().get(LABEL_CLUSTER)?;
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    Some(ObjectRef::new(name).within(&namespace))
}

async fn reconcile_cluster(cluster: Arc<CassandraCluster>, ctx: Arc<Context>) -> Result<ControllerAction> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        return Ok(ControllerAction::requeue(NOT_LEADER_RETRY));
    }

    let key = ClusterKey::from_cluster(&cluster);
    let started = Instant::now();
    let result = ctx.reconciler.reconcile(&key).await;

    #[cfg(feature = "metrics")]
    super::metrics::observe_reconcile_duration_seconds(
        CONTROLLER_NAME,
        started.elapsed().as_secs_f64(),
    );

    let after = result?;
    ctx.failures
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .remove(&key);
    debug!("Reconciled {} in {:?}", key, started.elapsed());

    Ok(match after {
        Some(delay) => ControllerAction::requeue(delay),
        None => ControllerAction::await_change(),
    })
}

/// Requeue a failed pass with per-cluster exponential backoff
fn error_policy(cluster: Arc<CassandraCluster>, error: &Error, ctx: Arc<Context>) -> ControllerAction {
    #[cfg(feature = "metrics")]
    super::metrics::inc_reconcile_error(CONTROLLER_NAME, error.kind());

    let key = ClusterKey::from_cluster(&cluster);
    let delay = next_backoff(&ctx.failures, &key);
    if error.is_retriable() {
        warn!("Reconcile of {} failed, retrying in {:?}: {}", key, delay, error);
    } else {
        error!("Reconcile of {} failed, retrying in {:?}: {}", key, delay, error);
    }
    ControllerAction::requeue(delay)
}

/// Count one more failure for `key` and return the delay before the next pass
fn next_backoff(failures: &Mutex<HashMap<ClusterKey, u32>>, key: &ClusterKey) -> Duration {
    let mut failures = failures.lock().unwrap_or_else(|p| p.into_inner());
    let attempt = failures.entry(key.clone()).or_insert(0);
    let delay = calculate_backoff(*attempt, None, None);
    *attempt += 1;
    delay
}
