//! CassandraCluster Custom Resource Definition
//!
//! The CassandraCluster CRD describes the desired topology of a Cassandra
//! cluster (datacenters, racks, replica counts, image, configuration) and
//! carries the status the operator derives from the live cluster.

use std::collections::{BTreeMap, BTreeSet};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::types::{
    preserve_unknown_fields, ClusterPhase, Condition, OperationRecord, OperationState,
    RackStatus, ResourceRequirements, StorageConfig, Topology,
};

pub const DEFAULT_CASSANDRA_IMAGE: &str = "cassandra:3.11.10";
pub const DEFAULT_DC: &str = "dc1";
pub const DEFAULT_RACK: &str = "rack1";

/// Structured validation error for `CassandraClusterSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.how_to_fix)
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "db.orange.com",
    version = "v2",
    kind = "CassandraCluster",
    namespaced,
    status = "CassandraClusterStatus",
    shortname = "cassc",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.cassandraImage"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CassandraClusterSpec {
    /// Cassandra image and version for every rack
    #[serde(default = "default_image")]
    pub cassandra_image: String,

    /// Nodes per rack, overridable per datacenter and per rack
    #[serde(default = "default_nodes_per_racks")]
    pub nodes_per_racks: i32,

    #[serde(default)]
    pub resources: ResourceRequirements,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Cluster-wide configuration overrides (cassandra.yaml keys)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config: Option<serde_json::Value>,

    #[serde(default)]
    pub topology: Topology,

    /// Maximum number of unavailable pods in the generated PodDisruptionBudget
    #[serde(default = "default_max_pod_unavailable")]
    pub max_pod_unavailable: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

fn default_image() -> String {
    DEFAULT_CASSANDRA_IMAGE.to_string()
}

fn default_nodes_per_racks() -> i32 {
    1
}

fn default_max_pod_unavailable() -> i32 {
    1
}

impl Default for CassandraClusterSpec {
    fn default() -> Self {
        Self {
            cassandra_image: default_image(),
            nodes_per_racks: default_nodes_per_racks(),
            resources: ResourceRequirements::default(),
            storage: StorageConfig::default(),
            config: None,
            topology: Topology::default(),
            max_pod_unavailable: default_max_pod_unavailable(),
            service_account_name: None,
        }
    }
}

/// Identity of a rack inside a cluster
///
/// Ordering is datacenter name then rack name, which is the planner's
/// tie-break order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RackKey {
    pub dc: String,
    pub rack: String,
}

impl RackKey {
    pub fn new(dc: impl Into<String>, rack: impl Into<String>) -> Self {
        Self {
            dc: dc.into(),
            rack: rack.into(),
        }
    }

    /// `<dc>-<rack>`, used as status map key and in resource names
    pub fn dc_rack_name(&self) -> String {
        format!("{}-{}", self.dc, self.rack)
    }
}

impl std::fmt::Display for RackKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.dc, self.rack)
    }
}

/// A rack with every cluster/datacenter default resolved
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredRack {
    pub key: RackKey,
    pub replicas: i32,
    pub image: String,
    /// Fingerprint of the merged configuration and resources
    pub config_hash: String,
    pub config: serde_json::Value,
    pub storage: StorageConfig,
    pub resources: ResourceRequirements,
    pub labels: BTreeMap<String, String>,
}

impl CassandraClusterSpec {
    /// Validate the spec
    ///
    /// Checks naming rules, duplicate datacenters and racks, replica counts
    /// and the image reference. All problems are reported at once.
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors: Vec<SpecValidationError> = Vec::new();

        if self.cassandra_image.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.cassandraImage",
                "cassandraImage must not be empty",
                "Set spec.cassandraImage to an image reference such as cassandra:3.11.10.",
            ));
        }

        if self.nodes_per_racks < 0 {
            errors.push(SpecValidationError::new(
                "spec.nodesPerRacks",
                "nodesPerRacks must not be negative",
                "Set spec.nodesPerRacks to 0 or greater.",
            ));
        }

        if self.max_pod_unavailable < 1 {
            errors.push(SpecValidationError::new(
                "spec.maxPodUnavailable",
                "maxPodUnavailable must be at least 1",
                "Set spec.maxPodUnavailable to 1 or greater.",
            ));
        }

        if let Some(config) = &self.config {
            validate_config_block(config, "spec.config", &mut errors);
        }

        let mut dc_names = BTreeSet::new();
        for (i, dc) in self.topology.dc.iter().enumerate() {
            let field = format!("spec.topology.dc[{i}]");
            validate_name(&dc.name, &format!("{field}.name"), &mut errors);
            if !dc_names.insert(dc.name.as_str()) {
                errors.push(SpecValidationError::new(
                    format!("{field}.name"),
                    format!("duplicate datacenter name '{}'", dc.name),
                    "Give every datacenter in spec.topology.dc a unique name.",
                ));
            }
            if let Some(n) = dc.nodes_per_racks {
                if n < 0 {
                    errors.push(SpecValidationError::new(
                        format!("{field}.nodesPerRacks"),
                        "nodesPerRacks must not be negative",
                        "Set nodesPerRacks to 0 or greater.",
                    ));
                }
            }
            if let Some(config) = &dc.config {
                validate_config_block(config, &format!("{field}.config"), &mut errors);
            }

            let mut rack_names = BTreeSet::new();
            for (j, rack) in dc.rack.iter().enumerate() {
                let rack_field = format!("{field}.rack[{j}]");
                validate_name(&rack.name, &format!("{rack_field}.name"), &mut errors);
                if !rack_names.insert(rack.name.as_str()) {
                    errors.push(SpecValidationError::new(
                        format!("{rack_field}.name"),
                        format!(
                            "duplicate rack name '{}' in datacenter '{}'",
                            rack.name, dc.name
                        ),
                        "Give every rack of a datacenter a unique name.",
                    ));
                }
                if let Some(n) = rack.nodes_per_racks {
                    if n < 0 {
                        errors.push(SpecValidationError::new(
                            format!("{rack_field}.nodesPerRacks"),
                            "nodesPerRacks must not be negative",
                            "Set nodesPerRacks to 0 or greater.",
                        ));
                    }
                }
                if let Some(config) = &rack.config {
                    validate_config_block(config, &format!("{rack_field}.config"), &mut errors);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Resolve the topology into one `DesiredRack` per rack
    ///
    /// Racks come out in declaration order. Duplicates are not filtered here;
    /// the planner rejects them.
    pub fn desired_racks(&self) -> Vec<DesiredRack> {
        if self.topology.dc.is_empty() {
            return vec![self.resolve_rack(DEFAULT_DC, DEFAULT_RACK, None, None)];
        }

        let mut racks = Vec::new();
        for dc in &self.topology.dc {
            if dc.rack.is_empty() {
                racks.push(self.resolve_rack(&dc.name, DEFAULT_RACK, Some(dc), None));
                continue;
            }
            for rack in &dc.rack {
                racks.push(self.resolve_rack(&dc.name, &rack.name, Some(dc), Some(rack)));
            }
        }
        racks
    }

    fn resolve_rack(
        &self,
        dc_name: &str,
        rack_name: &str,
        dc: Option<&super::types::Datacenter>,
        rack: Option<&super::types::Rack>,
    ) -> DesiredRack {
        let replicas = rack
            .and_then(|r| r.nodes_per_racks)
            .or_else(|| dc.and_then(|d| d.nodes_per_racks))
            .unwrap_or(self.nodes_per_racks);

        let resources = rack
            .and_then(|r| r.resources.clone())
            .or_else(|| dc.and_then(|d| d.resources.clone()))
            .unwrap_or_else(|| self.resources.clone());

        let storage = dc
            .and_then(|d| d.storage.clone())
            .unwrap_or_else(|| self.storage.clone());

        let mut config = serde_json::Value::Object(Default::default());
        for layer in [
            self.config.as_ref(),
            dc.and_then(|d| d.config.as_ref()),
            rack.and_then(|r| r.config.as_ref()),
        ]
        .into_iter()
        .flatten()
        {
            merge_json(&mut config, layer);
        }

        let mut labels = dc.map(|d| d.labels.clone()).unwrap_or_default();
        if let Some(r) = rack {
            labels.extend(r.labels.clone());
        }

        let config_hash = config_fingerprint(&config, &resources);

        DesiredRack {
            key: RackKey::new(dc_name, rack_name),
            replicas,
            image: self.cassandra_image.clone(),
            config_hash,
            config,
            storage,
            resources,
            labels,
        }
    }
}

/// Deep-merge `overlay` into `base`; objects merge key by key, anything else replaces
pub fn merge_json(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(k) {
                    Some(existing) => merge_json(existing, v),
                    None => {
                        base_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// SHA-256 over the canonical JSON of config and resources
///
/// serde_json's map is ordered, so the serialization is stable.
pub fn config_fingerprint(config: &serde_json::Value, resources: &ResourceRequirements) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(
        serde_json::to_string(resources)
            .unwrap_or_default()
            .as_bytes(),
    );
    format!("{:x}", hasher.finalize())
}

/// Datacenter and rack names end up in `<dc>-<rack>` identifiers and pod names
fn validate_name(name: &str, field: &str, errors: &mut Vec<SpecValidationError>) {
    let valid = name
        .chars()
        .next()
        .map(|c| c.is_ascii_lowercase())
        .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());

    if !valid {
        errors.push(SpecValidationError::new(
            field,
            format!(
                "'{}' must start with a lowercase letter and contain only lowercase letters and digits",
                name
            ),
            "Use names like dc1 or rack1; '-' is reserved as the datacenter/rack separator.",
        ));
    }
}

fn validate_config_block(
    config: &serde_json::Value,
    field: &str,
    errors: &mut Vec<SpecValidationError>,
) {
    if !config.is_object() {
        errors.push(SpecValidationError::new(
            field,
            "config must be an object of cassandra.yaml keys",
            "Provide config as a mapping, e.g. {\"num_tokens\": 256}.",
        ));
    }
}

/// Status subresource for CassandraCluster
///
/// Owned exclusively by the operator. Every failure is visible here; there is
/// no other error channel.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CassandraClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Per-rack status keyed by `<dc>-<rack>`
    #[serde(default)]
    pub racks: BTreeMap<String, RackStatus>,

    /// Operations keyed by `<kind>/<target>`
    #[serde(default)]
    pub operations: BTreeMap<String, OperationRecord>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Consecutive transient substrate failures while applying actions
    #[serde(default)]
    pub substrate_retries: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl CassandraClusterStatus {
    /// Whether any operation is still Pending or Running
    pub fn has_active_operations(&self) -> bool {
        self.operations
            .values()
            .any(|op| matches!(op.state, OperationState::Pending | OperationState::Running))
    }
}
