//! HTTP client for the per-pod Cassandra sidecar
//!
//! The sidecar runs next to every Cassandra container and executes nodetool
//! style operations asynchronously: `POST /operations` returns an id which is
//! then polled with `GET /operations/{id}`.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::crd::OperationKind;

use super::substrate::{NodeOperationRequest, OperationProgress, SubstrateError};

pub const DEFAULT_SIDECAR_PORT: u16 = 4567;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OperationRequestBody<'a> {
    #[serde(rename = "type")]
    type_: &'a str,
    #[serde(skip_serializing_if = "Option::is_none", rename = "sourceDC")]
    source_dc: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct OperationCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationStatusBody {
    state: String,
    #[serde(default)]
    failure_cause: Option<String>,
}

/// Client for the sidecar REST API
#[derive(Clone, Debug)]
pub struct SidecarClient {
    http: reqwest::Client,
    port: u16,
}

impl SidecarClient {
    pub fn new(port: u16) -> Result<Self, SubstrateError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SubstrateError::Rejected(format!("invalid sidecar client: {e}")))?;
        Ok(Self { http, port })
    }

    /// Base URL of the sidecar listening next to a pod
    pub fn base_url(&self, pod_ip: &str) -> String {
        format!("http://{}:{}", pod_ip, self.port)
    }

    /// Ask the sidecar to start an operation; returns the sidecar's operation id
    #[instrument(skip(self, request), fields(kind = %request.kind))]
    pub async fn start_operation(
        &self,
        base_url: &str,
        request: &NodeOperationRequest,
    ) -> Result<String, SubstrateError> {
        let body = OperationRequestBody {
            type_: request.kind.as_str(),
            source_dc: match request.kind {
                OperationKind::Rebuild => request.argument.as_deref(),
                _ => None,
            },
        };

        let response = self
            .http
            .post(format!("{base_url}/operations"))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let created: OperationCreated = response.json().await.map_err(|e| {
            SubstrateError::Transient(format!("malformed sidecar response: {e}"))
        })?;
        debug!("Sidecar accepted {} as {}", request.kind, created.id);
        Ok(created.id)
    }

    /// Poll a previously started operation
    #[instrument(skip(self))]
    pub async fn operation_status(
        &self,
        base_url: &str,
        id: &str,
    ) -> Result<OperationProgress, SubstrateError> {
        let response = self
            .http
            .get(format!("{base_url}/operations/{id}"))
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SubstrateError::NotFound(format!(
                "sidecar has no operation {id}"
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let body: OperationStatusBody = response.json().await.map_err(|e| {
            SubstrateError::Transient(format!("malformed sidecar response: {e}"))
        })?;

        Ok(match body.state.to_ascii_uppercase().as_str() {
            "COMPLETED" => OperationProgress::Succeeded,
            "FAILED" => OperationProgress::Failed(
                body.failure_cause
                    .unwrap_or_else(|| "operation failed on node".to_string()),
            ),
            _ => OperationProgress::InProgress,
        })
    }
}

fn classify_transport_error(err: reqwest::Error) -> SubstrateError {
    SubstrateError::Transient(format!("sidecar unreachable: {err}"))
}

/// 4xx means the sidecar refused the request; everything else may clear up
fn classify_status(status: StatusCode, body: &str) -> SubstrateError {
    if status.is_client_error() {
        SubstrateError::Rejected(format!("sidecar returned {status}: {body}"))
    } else {
        SubstrateError::Transient(format!("sidecar returned {status}: {body}"))
    }
}
