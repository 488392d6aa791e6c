//! Operation state machine
//!
//! Tracks long-running administrative operations (cleanup, rebuild,
//! upgradesstables, decommission) from request to completion. Records live
//! flat in `status.operations`; Cluster and Rack records fan out into child
//! records that point back through `parent`, and only Node records are ever
//! issued to the substrate.
//!
//! Everything in this module is pure. The reconciler performs the substrate
//! calls described by [`NodeStep`] and [`TriggerWrites`] and feeds the results
//! back through [`apply_outcome`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::crd::{
    DesiredRack, FailureClass, OperationKind, OperationRecord, OperationScope, OperationState,
    RackKey, TriggerSource,
};

use super::resources::{
    ANNOTATION_OPERATION_PREFIX, ANNOTATION_OPERATION_RETRY, LABEL_DC, LABEL_OPERATION_STATUS,
    LABEL_RACK,
};
use super::substrate::{MetadataPatch, NodeOperationRequest, OperationProgress, SubstrateError};
use super::topology::{ClusterTriggers, Topology, TriggerStatus};

const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";

pub type OperationMap = BTreeMap<String, OperationRecord>;

/// Tunables of the state machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationSettings {
    /// Transient failures tolerated before an operation fails for good
    pub retry_budget: u32,
    /// How long an operation may wait in Pending before it is failed
    pub pending_timeout: Duration,
    /// Node operations allowed to run at once within one rack
    pub node_operations_per_rack: usize,
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            pending_timeout: Duration::from_secs(1800),
            node_operations_per_rack: 1,
        }
    }
}

/// What happened when the reconciler acted on a record
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Started { handle: String },
    Progress(OperationProgress),
    Error(SubstrateError),
    TimedOut,
    Aborted(String),
}

/// Why a retry request was refused
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryRefused {
    NotFailed,
    Terminal,
}

pub fn node_key(kind: OperationKind, pod: &str) -> String {
    format!("{kind}/{pod}")
}

pub fn rack_key(kind: OperationKind, rack: &RackKey) -> String {
    format!("{kind}/{rack}")
}

pub fn cluster_key(kind: OperationKind) -> String {
    format!("{kind}/cluster")
}

fn child_key(parent: &str, target: &str) -> String {
    format!("{parent}/{target}")
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339()
}

/// A fresh Pending record
pub fn new_record(
    kind: OperationKind,
    scope: OperationScope,
    argument: Option<String>,
    source: TriggerSource,
    parent: Option<String>,
    now: DateTime<Utc>,
) -> OperationRecord {
    let target_selector = match &scope {
        OperationScope::Cluster => BTreeMap::new(),
        OperationScope::Rack { dc, rack } => BTreeMap::from([
            (LABEL_DC.to_string(), dc.clone()),
            (LABEL_RACK.to_string(), rack.clone()),
        ]),
        OperationScope::Node { pod, .. } => {
            BTreeMap::from([(POD_NAME_LABEL.to_string(), pod.clone())])
        }
    };

    OperationRecord {
        kind,
        scope,
        target_selector,
        argument,
        state: OperationState::Pending,
        source,
        parent,
        created_at: timestamp(now),
        started_at: None,
        finished_at: None,
        last_error: None,
        failure: None,
        retry_count: 0,
        handle: None,
    }
}

/// Done, or Failed with no retry left
///
/// Fan-out children are terminal as soon as they fail: only their parent
/// carries a trigger a user can retry.
pub fn is_terminal(op: &OperationRecord, retry_budget: u32) -> bool {
    match op.state {
        OperationState::Done => true,
        OperationState::Failed => {
            op.failure == Some(FailureClass::Rejected)
                || op.retry_count >= retry_budget
                || op.source == TriggerSource::Parent
        }
        OperationState::Pending | OperationState::Running => false,
    }
}

pub fn is_active(op: &OperationRecord) -> bool {
    matches!(op.state, OperationState::Pending | OperationState::Running)
}

fn fail(op: &mut OperationRecord, class: FailureClass, message: String, now: DateTime<Utc>) {
    op.state = OperationState::Failed;
    op.failure = Some(class);
    op.last_error = Some(message);
    op.finished_at = Some(timestamp(now));
}

/// Transition table of a single record
///
/// Deterministic in its inputs. Terminal states absorb every outcome; Pending
/// is the only state that can time out or be aborted, so a Running node
/// operation is never cancelled.
pub fn advance(
    op: &OperationRecord,
    outcome: Outcome,
    retry_budget: u32,
    now: DateTime<Utc>,
) -> OperationRecord {
    let mut next = op.clone();

    match (op.state, outcome) {
        (OperationState::Pending, Outcome::Started { handle }) => {
            next.state = OperationState::Running;
            next.started_at = Some(timestamp(now));
            next.handle = Some(handle);
            next.failure = None;
        }
        (
            OperationState::Pending,
            Outcome::Error(SubstrateError::Transient(msg) | SubstrateError::NotFound(msg)),
        ) => {
            next.retry_count += 1;
            if next.retry_count >= retry_budget {
                fail(
                    &mut next,
                    FailureClass::Transient,
                    format!("retry budget exhausted: {msg}"),
                    now,
                );
            } else {
                next.last_error = Some(msg);
            }
        }
        (OperationState::Pending, Outcome::Error(SubstrateError::Rejected(msg))) => {
            fail(&mut next, FailureClass::Rejected, msg, now);
        }
        (OperationState::Pending, Outcome::TimedOut) => {
            fail(
                &mut next,
                FailureClass::Timeout,
                "timed out waiting to start".to_string(),
                now,
            );
        }
        (OperationState::Pending, Outcome::Aborted(msg)) => {
            fail(&mut next, FailureClass::Aborted, msg, now);
        }
        (OperationState::Running, Outcome::Progress(OperationProgress::Succeeded)) => {
            next.state = OperationState::Done;
            next.finished_at = Some(timestamp(now));
        }
        (OperationState::Running, Outcome::Progress(OperationProgress::Failed(msg))) => {
            fail(&mut next, FailureClass::OperationFailed, msg, now);
        }
        (OperationState::Running, Outcome::Error(SubstrateError::Transient(msg))) => {
            next.last_error = Some(msg);
        }
        (OperationState::Running, Outcome::Error(SubstrateError::NotFound(msg))) => {
            fail(
                &mut next,
                FailureClass::OperationFailed,
                format!("operation lost: {msg}"),
                now,
            );
        }
        (OperationState::Running, Outcome::Error(SubstrateError::Rejected(msg))) => {
            fail(&mut next, FailureClass::Rejected, msg, now);
        }
        _ => {}
    }

    next
}

/// The manual Failed -> Pending edge
pub fn retry(
    op: &OperationRecord,
    retry_budget: u32,
    now: DateTime<Utc>,
) -> Result<OperationRecord, RetryRefused> {
    if op.state != OperationState::Failed {
        return Err(RetryRefused::NotFailed);
    }
    if is_terminal(op, retry_budget) {
        return Err(RetryRefused::Terminal);
    }
    Ok(requeue(op, now))
}

fn requeue(op: &OperationRecord, now: DateTime<Utc>) -> OperationRecord {
    let mut next = op.clone();
    next.state = OperationState::Pending;
    next.retry_count += 1;
    next.created_at = timestamp(now);
    next.started_at = None;
    next.finished_at = None;
    next.failure = None;
    next.handle = None;
    next
}

fn children_of<'a>(records: &'a OperationMap, key: &'a str) -> impl Iterator<Item = (&'a String, &'a OperationRecord)> + 'a {
    records
        .iter()
        .filter(move |(_, r)| r.parent.as_deref() == Some(key))
}

fn descendants(records: &OperationMap, key: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack = vec![key.to_string()];
    while let Some(current) = stack.pop() {
        for (child, _) in children_of(records, &current) {
            out.push(child.clone());
            stack.push(child.clone());
        }
    }
    out
}

/// Retry a record; failed or aborted descendants are re-queued with it, Done ones stay Done
pub fn retry_tree(
    records: &mut OperationMap,
    key: &str,
    retry_budget: u32,
    now: DateTime<Utc>,
) -> Result<(), RetryRefused> {
    let op = records.get(key).ok_or(RetryRefused::NotFailed)?;
    let next = retry(op, retry_budget, now)?;
    records.insert(key.to_string(), next);

    for child in descendants(records, key) {
        if let Some(record) = records.get(&child) {
            if record.state == OperationState::Failed {
                let next = requeue(record, now);
                records.insert(child, next);
            }
        }
    }
    Ok(())
}

fn remove_tree(records: &mut OperationMap, key: &str) {
    for child in descendants(records, key) {
        records.remove(&child);
    }
    records.remove(key);
}

/// Turn trigger labels and annotations into records
///
/// Also handles the retry edges and prunes finished records whose trigger
/// was acknowledged (removed).
pub fn ingest_triggers(
    records: &mut OperationMap,
    topology: &Topology,
    triggers: &ClusterTriggers,
    settings: &OperationSettings,
    now: DateTime<Utc>,
) {
    for (rack, node) in topology.nodes() {
        let Some(trigger) = &node.trigger else {
            continue;
        };
        if trigger.status != TriggerStatus::ToDo {
            continue;
        }
        let key = node_key(trigger.kind, &node.name);
        match records.get(&key).map(|r| r.state) {
            None | Some(OperationState::Done) => {
                let record = new_record(
                    trigger.kind,
                    OperationScope::Node {
                        dc: rack.dc.clone(),
                        rack: rack.rack.clone(),
                        pod: node.name.clone(),
                    },
                    trigger.argument.clone(),
                    TriggerSource::PodLabel,
                    None,
                    now,
                );
                records.insert(key, record);
            }
            Some(OperationState::Failed) => {
                let _ = retry_tree(records, &key, settings.retry_budget, now);
            }
            Some(OperationState::Pending | OperationState::Running) => {}
        }
    }

    for trigger in &triggers.operations {
        let (key, scope) = match &trigger.rack {
            Some(rack) => (
                rack_key(trigger.kind, rack),
                OperationScope::Rack {
                    dc: rack.dc.clone(),
                    rack: rack.rack.clone(),
                },
            ),
            None => (cluster_key(trigger.kind), OperationScope::Cluster),
        };
        if records.contains_key(&key) {
            continue;
        }
        let record = new_record(
            trigger.kind,
            scope,
            trigger.argument.clone(),
            TriggerSource::ClusterAnnotation,
            None,
            now,
        );
        records.insert(key, record);
    }

    for key in &triggers.retries {
        let _ = retry_tree(records, key, settings.retry_budget, now);
    }

    let acknowledged: Vec<String> = records
        .iter()
        .filter(|(_, r)| !is_active(r) && r.parent.is_none())
        .filter(|(key, r)| !trigger_present(key, r, topology, triggers))
        .map(|(key, _)| key.clone())
        .collect();
    for key in acknowledged {
        remove_tree(records, &key);
    }
}

/// Whether the label or annotation that created a root record is still there
fn trigger_present(
    key: &str,
    record: &OperationRecord,
    topology: &Topology,
    triggers: &ClusterTriggers,
) -> bool {
    match record.source {
        TriggerSource::PodLabel => match &record.scope {
            OperationScope::Node { pod, .. } => topology
                .find_node(pod)
                .and_then(|(_, n)| n.trigger.as_ref())
                .map(|t| t.kind == record.kind)
                .unwrap_or(false),
            _ => false,
        },
        TriggerSource::ClusterAnnotation => triggers.operations.iter().any(|t| {
            let trigger_key = match &t.rack {
                Some(rack) => rack_key(t.kind, rack),
                None => cluster_key(t.kind),
            };
            trigger_key == key
        }),
        TriggerSource::Parent => true,
        // Kept while the pod exists so a decommissioned node stays marked
        // until the scale-down removes it
        TriggerSource::ScaleDown => match &record.scope {
            OperationScope::Node { pod, .. } => topology.find_node(pod).is_some(),
            _ => false,
        },
    }
}

/// Queue a decommission of `pod` ahead of scaling it away
///
/// Returns the key of the new record, or `None` when a decommission of that
/// pod is already tracked, whatever its state.
pub fn request_decommission(
    records: &mut OperationMap,
    rack: &RackKey,
    pod: &str,
    now: DateTime<Utc>,
) -> Option<String> {
    let key = node_key(OperationKind::Decommission, pod);
    if records.contains_key(&key) {
        return None;
    }
    let record = new_record(
        OperationKind::Decommission,
        OperationScope::Node {
            dc: rack.dc.clone(),
            rack: rack.rack.clone(),
            pod: pod.to_string(),
        },
        None,
        TriggerSource::ScaleDown,
        None,
        now,
    );
    records.insert(key.clone(), record);
    Some(key)
}

/// Mark nodes whose decommission finished as holding no data
pub fn mark_decommissioned(topology: &mut Topology, records: &OperationMap) {
    for record in records.values() {
        if record.kind != OperationKind::Decommission || record.state != OperationState::Done {
            continue;
        }
        let OperationScope::Node { dc, rack, pod } = &record.scope else {
            continue;
        };
        if let Some(node) = topology
            .racks
            .get_mut(&RackKey::new(dc.as_str(), rack.as_str()))
            .and_then(|r| r.nodes.iter_mut().find(|n| &n.name == pod))
        {
            node.owns_data = Some(false);
        }
    }
}

/// Create children for Cluster and Rack records that have not fanned out yet
///
/// A Rack record covers the pods observed at fan-out time; a rack without
/// pods has nothing to do and completes immediately.
pub fn expand(
    records: &mut OperationMap,
    desired: &[DesiredRack],
    topology: &Topology,
    now: DateTime<Utc>,
) {
    // Cluster records first so their new Rack children fan out in the same pass
    for scope_is_cluster in [true, false] {
        let parents: Vec<String> = records
            .iter()
            .filter(|(_, r)| r.state == OperationState::Pending)
            .filter(|(_, r)| match r.scope {
                OperationScope::Cluster => scope_is_cluster,
                OperationScope::Rack { .. } => !scope_is_cluster,
                OperationScope::Node { .. } => false,
            })
            .filter(|(key, _)| children_of(records, key).next().is_none())
            .map(|(key, _)| key.clone())
            .collect();

        for parent_key in parents {
            let Some(parent) = records.get(&parent_key).cloned() else {
                continue;
            };
            let children: Vec<(String, OperationRecord)> = match &parent.scope {
                OperationScope::Cluster => desired
                    .iter()
                    .map(|d| {
                        (
                            child_key(&parent_key, &d.key.dc_rack_name()),
                            new_record(
                                parent.kind,
                                OperationScope::Rack {
                                    dc: d.key.dc.clone(),
                                    rack: d.key.rack.clone(),
                                },
                                parent.argument.clone(),
                                TriggerSource::Parent,
                                Some(parent_key.clone()),
                                now,
                            ),
                        )
                    })
                    .collect(),
                OperationScope::Rack { dc, rack } => topology
                    .rack(&RackKey::new(dc.as_str(), rack.as_str()))
                    .map(|r| r.nodes.as_slice())
                    .unwrap_or_default()
                    .iter()
                    .map(|n| {
                        (
                            child_key(&parent_key, &n.name),
                            new_record(
                                parent.kind,
                                OperationScope::Node {
                                    dc: dc.clone(),
                                    rack: rack.clone(),
                                    pod: n.name.clone(),
                                },
                                parent.argument.clone(),
                                TriggerSource::Parent,
                                Some(parent_key.clone()),
                                now,
                            ),
                        )
                    })
                    .collect(),
                OperationScope::Node { .. } => Vec::new(),
            };

            if children.is_empty() {
                if let Some(record) = records.get_mut(&parent_key) {
                    record.state = OperationState::Done;
                    record.finished_at = Some(timestamp(now));
                }
                continue;
            }
            records.extend(children);
        }
    }
}

/// Roll child states up into Rack and Cluster records
///
/// Fail-fast: once a child fails terminally the parent fails and every
/// still-Pending descendant is aborted. Running descendants keep going.
pub fn aggregate(records: &mut OperationMap, settings: &OperationSettings, now: DateTime<Utc>) {
    for scope_is_cluster in [false, true] {
        let parents: Vec<String> = records
            .iter()
            .filter(|(_, r)| match r.scope {
                OperationScope::Cluster => scope_is_cluster,
                OperationScope::Rack { .. } => !scope_is_cluster,
                OperationScope::Node { .. } => false,
            })
            .map(|(key, _)| key.clone())
            .collect();

        for parent_key in parents {
            let children: Vec<(String, OperationRecord)> = children_of(records, &parent_key)
                .map(|(k, r)| (k.clone(), r.clone()))
                .collect();
            if children.is_empty() {
                continue;
            }
            let Some(parent) = records.get(&parent_key).cloned() else {
                continue;
            };
            if !is_active(&parent) {
                continue;
            }

            let mut next = parent.clone();
            let failed_child = children
                .iter()
                .find(|(_, c)| c.state == OperationState::Failed && is_terminal(c, settings.retry_budget));

            if let Some((child, record)) = failed_child {
                let class = match record.failure {
                    Some(FailureClass::Aborted) | None => FailureClass::OperationFailed,
                    Some(class) => class,
                };
                let reason = record.last_error.clone().unwrap_or_default();
                fail(&mut next, class, format!("{child} failed: {reason}"), now);
                if next.started_at.is_none() {
                    next.started_at = Some(timestamp(now));
                }
                records.insert(parent_key.clone(), next);
                abort_pending(records, &parent_key, now);
                continue;
            }

            if children.iter().all(|(_, c)| c.state == OperationState::Done) {
                next.state = OperationState::Done;
                next.finished_at = Some(timestamp(now));
                if next.started_at.is_none() {
                    next.started_at = Some(timestamp(now));
                }
            } else if next.state == OperationState::Pending
                && children.iter().any(|(_, c)| c.state != OperationState::Pending)
            {
                next.state = OperationState::Running;
                next.started_at = Some(timestamp(now));
            }

            if next != parent {
                records.insert(parent_key, next);
            }
        }
    }
}

fn abort_pending(records: &mut OperationMap, key: &str, now: DateTime<Utc>) {
    let reason = format!("aborted: {key} failed");
    for child in descendants(records, key) {
        if let Some(record) = records.get(&child) {
            if record.state == OperationState::Pending {
                let next = advance(record, Outcome::Aborted(reason.clone()), u32::MAX, now);
                records.insert(child, next);
            }
        }
    }
}

/// A substrate interaction the reconciler has to perform for one Node record
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeStep {
    Start {
        key: String,
        pod: String,
        request: NodeOperationRequest,
    },
    Poll {
        key: String,
        pod: String,
        handle: String,
    },
    Timeout {
        key: String,
    },
}

/// Decide which node operations to start, poll or time out this pass
///
/// A Node record is started at most once: only records without `started_at`
/// are considered, and within a rack no more than
/// `node_operations_per_rack` run at the same time. Nodes must be Ready.
pub fn node_steps(
    records: &OperationMap,
    topology: &Topology,
    settings: &OperationSettings,
    now: DateTime<Utc>,
) -> Vec<NodeStep> {
    let mut steps = Vec::new();
    let mut running_per_rack: BTreeMap<RackKey, usize> = BTreeMap::new();
    let mut busy_pods: BTreeSet<&str> = BTreeSet::new();

    for (key, record) in records {
        let OperationScope::Node { dc, rack, pod } = &record.scope else {
            continue;
        };
        if record.state == OperationState::Running {
            *running_per_rack
                .entry(RackKey::new(dc.as_str(), rack.as_str()))
                .or_default() += 1;
            busy_pods.insert(pod.as_str());
            if let Some(handle) = &record.handle {
                steps.push(NodeStep::Poll {
                    key: key.clone(),
                    pod: pod.clone(),
                    handle: handle.clone(),
                });
            }
        }
    }

    for (key, record) in records {
        let OperationScope::Node { dc, rack, pod } = &record.scope else {
            continue;
        };
        if record.state != OperationState::Pending || record.started_at.is_some() {
            continue;
        }

        if pending_expired(record, settings.pending_timeout, now) {
            steps.push(NodeStep::Timeout { key: key.clone() });
            continue;
        }

        let rack_key = RackKey::new(dc.as_str(), rack.as_str());
        let running = running_per_rack.entry(rack_key.clone()).or_default();
        if *running >= settings.node_operations_per_rack || busy_pods.contains(pod.as_str()) {
            continue;
        }
        let ready = topology
            .rack(&rack_key)
            .and_then(|r| r.node(pod))
            .map(|n| n.ready)
            .unwrap_or(false);
        if !ready {
            continue;
        }

        *running += 1;
        busy_pods.insert(pod.as_str());
        steps.push(NodeStep::Start {
            key: key.clone(),
            pod: pod.clone(),
            request: NodeOperationRequest {
                kind: record.kind,
                argument: record.argument.clone(),
            },
        });
    }

    steps
}

fn pending_expired(record: &OperationRecord, timeout: Duration, now: DateTime<Utc>) -> bool {
    DateTime::parse_from_rfc3339(&record.created_at)
        .map(|created| {
            let waited = now.signed_duration_since(created.with_timezone(&Utc));
            waited.num_seconds() >= timeout.as_secs() as i64
        })
        .unwrap_or(false)
}

/// Feed the result of a [`NodeStep`] back into the record it belongs to
pub fn apply_outcome(
    records: &mut OperationMap,
    key: &str,
    outcome: Outcome,
    settings: &OperationSettings,
    now: DateTime<Utc>,
) -> Option<(OperationState, OperationState)> {
    let record = records.get(key)?;
    let next = advance(record, outcome, settings.retry_budget, now);
    let transition = (record.state, next.state);
    records.insert(key.to_string(), next);
    Some(transition)
}

/// Label and annotation updates that mirror record states back onto triggers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TriggerWrites {
    pub pod_labels: BTreeMap<String, MetadataPatch>,
    pub cluster_annotations: MetadataPatch,
}

impl TriggerWrites {
    pub fn is_empty(&self) -> bool {
        self.pod_labels.is_empty() && self.cluster_annotations.is_empty()
    }
}

/// Compute trigger updates for the current records
///
/// Pod labels follow the record: Running is `Ongoing`, Done is `Done`,
/// Failed is `Error`. A terminal cluster-level record has its annotation
/// removed. A consumed retry annotation is removed.
pub fn trigger_writes(
    records: &OperationMap,
    topology: &Topology,
    triggers: &ClusterTriggers,
    settings: &OperationSettings,
) -> TriggerWrites {
    let mut writes = TriggerWrites::default();

    for (key, record) in records {
        match record.source {
            TriggerSource::PodLabel => {
                let OperationScope::Node { pod, .. } = &record.scope else {
                    continue;
                };
                let expected = match record.state {
                    OperationState::Pending => continue,
                    OperationState::Running => TriggerStatus::Ongoing,
                    OperationState::Done => TriggerStatus::Done,
                    OperationState::Failed => TriggerStatus::Error,
                };
                let Some(trigger) = topology.find_node(pod).and_then(|(_, n)| n.trigger.as_ref())
                else {
                    continue;
                };
                if trigger.kind == record.kind && trigger.status != expected {
                    writes.pod_labels.insert(
                        pod.clone(),
                        BTreeMap::from([(
                            LABEL_OPERATION_STATUS.to_string(),
                            Some(expected.as_str().to_string()),
                        )]),
                    );
                }
            }
            TriggerSource::ClusterAnnotation => {
                if is_terminal(record, settings.retry_budget)
                    && trigger_present(key, record, topology, triggers)
                {
                    writes.cluster_annotations.insert(
                        format!("{ANNOTATION_OPERATION_PREFIX}{}", record.kind),
                        None,
                    );
                }
            }
            TriggerSource::Parent | TriggerSource::ScaleDown => {}
        }
    }

    if !triggers.retries.is_empty() {
        writes
            .cluster_annotations
            .insert(ANNOTATION_OPERATION_RETRY.to_string(), None);
    }

    writes
}
