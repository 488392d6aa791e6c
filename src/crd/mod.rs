//! Custom Resource Definitions for Cassandra-K8s
//!
//! This module defines the CassandraCluster CRD and the shared types of its
//! spec and status.

mod cassandra_cluster;
pub mod types;


pub use cassandra_cluster::{
    config_fingerprint, merge_json, CassandraCluster, CassandraClusterSpec,
    CassandraClusterStatus, DesiredRack, RackKey, SpecValidationError, DEFAULT_CASSANDRA_IMAGE,
    DEFAULT_DC, DEFAULT_RACK,
};
pub use types::*;
