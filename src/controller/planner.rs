//! Topology planner
//!
//! Pure function from desired racks and observed topology to the ordered list
//! of structural actions needed to converge. No I/O happens here.
//!
//! Ordering rules:
//! - at most one action per rack, chosen by priority: replica count, image, config
//! - across racks: AddRack, scale-ups, UpdateImage, UpdateConfig, scale-downs, RemoveRack
//! - within one kind: lexicographic (dc, rack)
//! - racks with an action in flight are skipped
//! - no node that still owns token ranges is scaled away
//! - the list is capped to the free rack-update slots

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

use crate::crd::{DesiredRack, RackKey};

use super::topology::{ObservedRack, Topology};

/// Structural change to one rack
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    AddRack { rack: RackKey, replicas: i32 },
    RemoveRack { rack: RackKey },
    ScaleRack { rack: RackKey, from: i32, to: i32 },
    UpdateImage { rack: RackKey, image: String },
    UpdateConfig { rack: RackKey, config_hash: String },
}

impl Action {
    pub fn rack(&self) -> &RackKey {
        match self {
            Action::AddRack { rack, .. }
            | Action::RemoveRack { rack }
            | Action::ScaleRack { rack, .. }
            | Action::UpdateImage { rack, .. }
            | Action::UpdateConfig { rack, .. } => rack,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::AddRack { .. } => "AddRack",
            Action::RemoveRack { .. } => "RemoveRack",
            Action::ScaleRack { .. } => "ScaleRack",
            Action::UpdateImage { .. } => "UpdateImage",
            Action::UpdateConfig { .. } => "UpdateConfig",
        }
    }

    /// Short description of what the action moves the rack to
    pub fn target(&self) -> String {
        match self {
            Action::AddRack { replicas, .. } => format!("replicas={replicas}"),
            Action::RemoveRack { .. } => "removed".to_string(),
            Action::ScaleRack { to, .. } => format!("replicas={to}"),
            Action::UpdateImage { image, .. } => format!("image={image}"),
            Action::UpdateConfig { config_hash, .. } => {
                format!("config={}", &config_hash[..config_hash.len().min(12)])
            }
        }
    }

    /// Position in the global ordering
    fn rank(&self) -> u8 {
        match self {
            Action::AddRack { .. } => 0,
            Action::ScaleRack { from, to, .. } if to > from => 1,
            Action::UpdateImage { .. } => 2,
            Action::UpdateConfig { .. } => 3,
            Action::ScaleRack { .. } => 4,
            Action::RemoveRack { .. } => 5,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, {})", self.name(), self.rack(), self.target())
    }
}

/// Why a rack that needs work got no action this time
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeferReason {
    /// The rack already has a structural change in flight
    InFlight,
    /// No free rack-update slot
    ConcurrencyLimit,
    /// Scale-down or removal waits for these nodes to give up their token
    /// ranges, highest ordinal first
    NodesOwnData { nodes: Vec<String> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deferral {
    pub rack: RackKey,
    pub reason: DeferReason,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub actions: Vec<Action>,
    pub deferred: Vec<Deferral>,
}

impl Plan {
    /// Nothing to do and nothing waiting
    pub fn is_converged(&self) -> bool {
        self.actions.is_empty() && self.deferred.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlanLimits {
    pub max_concurrent_rack_updates: usize,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            max_concurrent_rack_updates: 1,
        }
    }
}

/// Structurally invalid desired state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("rack {0} is declared more than once")]
    DuplicateRack(RackKey),

    #[error("rack {rack} has a negative replica count ({replicas})")]
    NegativeReplicas { rack: RackKey, replicas: i32 },

    #[error("rack {rack} asks for 0 replicas but nodes {nodes:?} still own data; remove the rack from the topology instead")]
    ZeroReplicasWithData { rack: RackKey, nodes: Vec<String> },
}

/// Compute the ordered actions converging `observed` towards `desired`
///
/// `in_flight` holds the racks whose status phase is Updating.
pub fn plan(
    desired: &[DesiredRack],
    observed: &Topology,
    in_flight: &BTreeSet<RackKey>,
    limits: PlanLimits,
) -> Result<Plan, PlanError> {
    let mut wanted: BTreeMap<&RackKey, &DesiredRack> = BTreeMap::new();
    for rack in desired {
        if wanted.insert(&rack.key, rack).is_some() {
            return Err(PlanError::DuplicateRack(rack.key.clone()));
        }
        if rack.replicas < 0 {
            return Err(PlanError::NegativeReplicas {
                rack: rack.key.clone(),
                replicas: rack.replicas,
            });
        }
        if rack.replicas == 0 {
            if let Some(current) = observed.rack(&rack.key) {
                let owners = data_owners(current, 0);
                if !owners.is_empty() {
                    return Err(PlanError::ZeroReplicasWithData {
                        rack: rack.key.clone(),
                        nodes: owners,
                    });
                }
            }
        }
    }

    let mut candidates = Vec::new();
    let mut deferred = Vec::new();

    for (key, rack) in &wanted {
        let current = observed.rack(key);
        match action_for_desired(rack, current) {
            Ok(None) => {}
            Ok(Some(_)) if in_flight.contains(*key) => deferred.push(Deferral {
                rack: (*key).clone(),
                reason: DeferReason::InFlight,
            }),
            Ok(Some(action)) => candidates.push(action),
            Err(_) if in_flight.contains(*key) => deferred.push(Deferral {
                rack: (*key).clone(),
                reason: DeferReason::InFlight,
            }),
            Err(reason) => deferred.push(Deferral {
                rack: (*key).clone(),
                reason,
            }),
        }
    }

    for (key, current) in &observed.racks {
        if wanted.contains_key(key) || current.is_empty() {
            continue;
        }
        match action_for_undesired(key, current) {
            _ if in_flight.contains(key) => deferred.push(Deferral {
                rack: key.clone(),
                reason: DeferReason::InFlight,
            }),
            Ok(action) => candidates.push(action),
            Err(reason) => deferred.push(Deferral {
                rack: key.clone(),
                reason,
            }),
        }
    }

    candidates.sort_by(|a, b| a.rank().cmp(&b.rank()).then_with(|| a.rack().cmp(b.rack())));

    let busy = in_flight
        .iter()
        .filter(|key| wanted.contains_key(key) || observed.rack(key).is_some())
        .count();
    let slots = limits.max_concurrent_rack_updates.saturating_sub(busy);

    let mut actions = candidates;
    if actions.len() > slots {
        for action in actions.split_off(slots) {
            deferred.push(Deferral {
                rack: action.rack().clone(),
                reason: DeferReason::ConcurrencyLimit,
            });
        }
    }

    Ok(Plan { actions, deferred })
}

/// Pick the single most urgent change for a rack that should exist
///
/// A scale-down is held back while any node past the new replica count still
/// owns token ranges.
fn action_for_desired(
    rack: &DesiredRack,
    current: Option<&ObservedRack>,
) -> Result<Option<Action>, DeferReason> {
    let Some(workload) = current.and_then(|c| c.workload.as_ref()) else {
        return Ok(Some(Action::AddRack {
            rack: rack.key.clone(),
            replicas: rack.replicas,
        }));
    };

    if workload.replicas != rack.replicas {
        if rack.replicas < workload.replicas {
            let keep = rack.replicas.max(0) as u32;
            let owners = current.map(|c| data_owners(c, keep)).unwrap_or_default();
            if !owners.is_empty() {
                return Err(DeferReason::NodesOwnData { nodes: owners });
            }
        }
        return Ok(Some(Action::ScaleRack {
            rack: rack.key.clone(),
            from: workload.replicas,
            to: rack.replicas,
        }));
    }
    if workload.image.as_deref() != Some(rack.image.as_str()) {
        return Ok(Some(Action::UpdateImage {
            rack: rack.key.clone(),
            image: rack.image.clone(),
        }));
    }
    if workload.config_hash.as_deref() != Some(rack.config_hash.as_str()) {
        return Ok(Some(Action::UpdateConfig {
            rack: rack.key.clone(),
            config_hash: rack.config_hash.clone(),
        }));
    }
    Ok(None)
}

/// Drain, then remove, a rack that is no longer declared
///
/// Nothing is scaled away while a node of the rack still owns data.
fn action_for_undesired(key: &RackKey, current: &ObservedRack) -> Result<Action, DeferReason> {
    let owners = data_owners(current, 0);
    if !owners.is_empty() {
        return Err(DeferReason::NodesOwnData { nodes: owners });
    }

    match &current.workload {
        Some(workload) if workload.replicas > 0 => Ok(Action::ScaleRack {
            rack: key.clone(),
            from: workload.replicas,
            to: 0,
        }),
        _ => Ok(Action::RemoveRack { rack: key.clone() }),
    }
}

/// Nodes from ordinal `from` upwards that have not reported giving up their
/// ranges, highest ordinal first
fn data_owners(rack: &ObservedRack, from: u32) -> Vec<String> {
    let mut owners: Vec<_> = rack
        .nodes
        .iter()
        .filter(|n| n.ordinal >= from && !n.holds_no_data())
        .collect();
    owners.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));
    owners.into_iter().map(|n| n.name.clone()).collect()
}
