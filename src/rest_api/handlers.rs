//! HTTP handlers for the REST API

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kube::{api::Api, ResourceExt};
use tracing::{error, instrument};

use crate::controller::ControllerState;
use crate::crd::CassandraCluster;

use super::dto::{
    ClusterDetailResponse, ClusterListResponse, ClusterSummary, ErrorResponse, HealthResponse,
    OperationListResponse,
};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Health check endpoint
#[instrument(skip(state))]
pub async fn health(State(state): State<Arc<ControllerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        leader: state.is_leader.load(Ordering::Relaxed),
    })
}

/// List the CassandraClusters watched by this operator
#[instrument(skip(state))]
pub async fn list_clusters(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<ClusterListResponse>, ApiError> {
    let api: Api<CassandraCluster> =
        Api::namespaced(state.client.clone(), &state.operator_namespace);

    match api.list(&Default::default()).await {
        Ok(clusters) => {
            let items: Vec<ClusterSummary> =
                clusters.items.iter().map(ClusterSummary::from).collect();
            let total = items.len();
            Ok(Json(ClusterListResponse { items, total }))
        }
        Err(e) => {
            error!("Failed to list clusters: {:?}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("list_failed", &e.to_string())),
            ))
        }
    }
}

async fn fetch_cluster(
    state: &ControllerState,
    namespace: &str,
    name: &str,
) -> Result<CassandraCluster, ApiError> {
    let api: Api<CassandraCluster> = Api::namespaced(state.client.clone(), namespace);

    match api.get(name).await {
        Ok(cluster) => Ok(cluster),
        Err(kube::Error::Api(e)) if e.code == 404 => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                &format!("CassandraCluster {}/{} not found", namespace, name),
            )),
        )),
        Err(e) => {
            error!("Failed to get cluster {}/{}: {:?}", namespace, name, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("get_failed", &e.to_string())),
            ))
        }
    }
}

/// Get one CassandraCluster with its full status
#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn get_cluster(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ClusterDetailResponse>, ApiError> {
    let cluster = fetch_cluster(&state, &namespace, &name).await?;

    Ok(Json(ClusterDetailResponse {
        name: cluster.name_any(),
        namespace: cluster.namespace().unwrap_or_default(),
        generation: cluster.metadata.generation,
        status: cluster.status.clone().unwrap_or_default(),
        created_at: cluster
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0.to_rfc3339()),
    }))
}

/// Operation records of one CassandraCluster
#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn list_operations(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<OperationListResponse>, ApiError> {
    let cluster = fetch_cluster(&state, &namespace, &name).await?;

    Ok(Json(OperationListResponse {
        operations: cluster.status.map(|s| s.operations).unwrap_or_default(),
    }))
}
