//! Error types for the Cassandra operator

use thiserror::Error;

use crate::controller::planner::PlanError;
use crate::controller::substrate::SubstrateError;

/// Result type alias used across the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Planning error: {0}")]
    PlanError(#[from] PlanError),

    #[error("Transient substrate error: {0}")]
    SubstrateTransient(String),

    #[error("Substrate rejected request: {0}")]
    SubstrateRejection(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a later pass is likely to succeed without human intervention
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(e) => is_retriable_kube_error(e),
            Error::HttpError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::SubstrateTransient(_) | Error::NotFound(_) => true,
            Error::SerializationError(_)
            | Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::PlanError(_)
            | Error::SubstrateRejection(_)
            | Error::Internal(_) => false,
        }
    }

    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::PlanError(_) => "plan",
            Error::SubstrateTransient(_) => "substrate_transient",
            Error::SubstrateRejection(_) => "substrate_rejection",
            Error::NotFound(_) => "not_found",
            Error::HttpError(_) => "http",
            Error::Internal(_) => "internal",
        }
    }
}

/// Classify kube errors: conflicts, throttling and server errors are worth retrying
pub(crate) fn is_retriable_kube_error(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(resp) => resp.code == 409 || resp.code == 429 || resp.code >= 500,
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}

impl From<SubstrateError> for Error {
    fn from(err: SubstrateError) -> Self {
        match err {
            SubstrateError::Transient(msg) => Error::SubstrateTransient(msg),
            SubstrateError::Rejected(msg) => Error::SubstrateRejection(msg),
            SubstrateError::NotFound(msg) => Error::NotFound(msg),
        }
    }
}
