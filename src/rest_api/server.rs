//! Axum HTTP server for the REST API

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::ControllerState;
use crate::{Error, Result};

use super::handlers;

/// Metrics endpoint handler
#[cfg(feature = "metrics")]
async fn metrics_handler() -> std::result::Result<String, axum::http::StatusCode> {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY)
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(buffer)
}

/// Routes of the REST API
pub fn router(state: Arc<ControllerState>) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/clusters", get(handlers::list_clusters))
        .route(
            "/api/v1/clusters/{namespace}/{name}",
            get(handlers::get_cluster),
        )
        .route(
            "/api/v1/clusters/{namespace}/{name}/operations",
            get(handlers::list_operations),
        );

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the REST API server
pub async fn run_server(state: Arc<ControllerState>, addr: SocketAddr) -> Result<()> {
    let app = router(state);

    info!("REST API server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use serde_json::{json, Value};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::controller::OperatorConfig;
    use crate::crd::{CassandraCluster, CassandraClusterSpec, CassandraClusterStatus, ClusterPhase};

    const CLUSTERS_PATH: &str = "/apis/db.orange.com/v2/namespaces/cassandra/cassandraclusters";

    /// Controller state whose Kubernetes client talks to `apiserver`
    fn state(apiserver: &MockServer, leader: bool) -> Arc<ControllerState> {
        let config = kube::Config::new(apiserver.uri().parse().unwrap());
        let client = kube::Client::try_from(config).unwrap();
        Arc::new(ControllerState {
            client,
            operator_namespace: "cassandra".to_string(),
            is_leader: Arc::new(AtomicBool::new(leader)),
            config: OperatorConfig::default(),
        })
    }

    /// Serve the router on an ephemeral port and return its base URL
    async fn serve(state: Arc<ControllerState>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn cluster(name: &str, phase: ClusterPhase) -> CassandraCluster {
        let mut cluster = CassandraCluster::new(
            name,
            CassandraClusterSpec {
                nodes_per_racks: 3,
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("cassandra".to_string());
        cluster.metadata.generation = Some(4);
        cluster.status = Some(CassandraClusterStatus {
            phase,
            ..Default::default()
        });
        cluster
    }

    fn not_found(name: &str) -> Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("cassandraclusters.db.orange.com \"{name}\" not found"),
            "reason": "NotFound",
            "code": 404
        })
    }

    #[tokio::test]
    async fn test_health_reports_leadership() {
        let apiserver = MockServer::start().await;
        let base = serve(state(&apiserver, false)).await;

        let resp = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["leader"], false);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_list_clusters_summarizes_items() {
        let apiserver = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CLUSTERS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "db.orange.com/v2",
                "kind": "CassandraClusterList",
                "metadata": { "resourceVersion": "12" },
                "items": [
                    serde_json::to_value(cluster("alpha", ClusterPhase::Running)).unwrap(),
                    serde_json::to_value(cluster("beta", ClusterPhase::Updating)).unwrap(),
                ]
            })))
            .mount(&apiserver)
            .await;
        let base = serve(state(&apiserver, true)).await;

        let resp = reqwest::get(format!("{base}/api/v1/clusters")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["total"], 2);
        assert_eq!(body["items"][0]["name"], "alpha");
        assert_eq!(body["items"][0]["phase"], "Running");
        assert_eq!(body["items"][1]["phase"], "Updating");
        assert_eq!(body["items"][1]["desiredNodes"], 3);
    }

    #[tokio::test]
    async fn test_get_cluster_returns_status() {
        let apiserver = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{CLUSTERS_PATH}/alpha")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(cluster("alpha", ClusterPhase::Error)),
            )
            .mount(&apiserver)
            .await;
        let base = serve(state(&apiserver, true)).await;

        let resp = reqwest::get(format!("{base}/api/v1/clusters/cassandra/alpha"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["name"], "alpha");
        assert_eq!(body["generation"], 4);
        assert_eq!(body["status"]["phase"], "Error");
    }

    #[tokio::test]
    async fn test_missing_cluster_is_404() {
        let apiserver = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{CLUSTERS_PATH}/missing")))
            .respond_with(ResponseTemplate::new(404).set_body_json(not_found("missing")))
            .mount(&apiserver)
            .await;
        let base = serve(state(&apiserver, true)).await;

        for url in [
            format!("{base}/api/v1/clusters/cassandra/missing"),
            format!("{base}/api/v1/clusters/cassandra/missing/operations"),
        ] {
            let resp = reqwest::get(&url).await.unwrap();
            assert_eq!(resp.status(), 404, "{url}");
            let body: Value = resp.json().await.unwrap();
            assert_eq!(body["error"], "not_found");
            assert!(body["message"].as_str().unwrap().contains("cassandra/missing"));
        }
    }

    #[tokio::test]
    async fn test_apiserver_failure_is_500() {
        let apiserver = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CLUSTERS_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "etcdserver: request timed out",
                "reason": "InternalError",
                "code": 500
            })))
            .mount(&apiserver)
            .await;
        let base = serve(state(&apiserver, true)).await;

        let resp = reqwest::get(format!("{base}/api/v1/clusters")).await.unwrap();
        assert_eq!(resp.status(), 500);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "list_failed");
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_metrics_endpoint_serves_text() {
        let apiserver = MockServer::start().await;
        let base = serve(state(&apiserver, true)).await;

        let resp = reqwest::get(format!("{base}/metrics")).await.unwrap();
        assert_eq!(resp.status(), 200);
        resp.text().await.unwrap();
    }
}
