//! Cassandra-K8s: Kubernetes Operator for Apache Cassandra
//!
//! This crate provides the reconciliation core of an operator that keeps
//! Cassandra clusters (datacenters, racks, nodes) converged on their
//! declared topology, and runs administrative operations on their nodes.

pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
