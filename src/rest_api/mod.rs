//! REST API module for external integrations
//!
//! Read-only HTTP API exposing the CassandraClusters, their status and their
//! operations, plus health and Prometheus metrics.

mod dto;
mod handlers;
mod server;

pub use server::{router, run_server};
