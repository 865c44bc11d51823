//! JSON HTTP surface over the sandbox manager.
//!
//! ## Endpoints
//!
//! - `POST /sandboxes` - create, or restore when `snapshot_dir` is given
//! - `GET /sandboxes` - list
//! - `GET /sandboxes/:id` - one sandbox
//! - `DELETE /sandboxes/:id` - delete
//! - `POST /sandboxes/delete` - bulk delete
//! - `POST /sandboxes/purge` - purge registered or orphaned sandboxes
//! - `POST /sandboxes/:id/snapshot` - snapshot, optionally deleting after
//! - `POST /sandboxes/:id/pause`, `POST /sandboxes/:id/resume`
//! - `GET /orphans` - hypervisor processes nothing owns
//! - `GET /health` - health check

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use cove_core::{CoreError, PurgeReport, SandboxManager, SandboxSummary, VmmProcessInfo};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

type AppState = Arc<SandboxManager>;

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateSandboxRequest {
    pub template_id: String,
    /// Generated when omitted.
    #[serde(default)]
    pub sandbox_id: Option<String>,
    /// Restore from this snapshot instead of booting.
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct BulkDeleteRequest {
    pub sandbox_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct BulkDeleteResponse {
    pub deleted: Vec<String>,
    pub failed: Vec<FailedId>,
}

#[derive(Debug, Serialize)]
pub struct FailedId {
    pub sandbox_id: String,
    pub error: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PurgeRequest {
    #[serde(default)]
    pub sandbox_ids: Vec<String>,
    #[serde(default)]
    pub purge_all: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotRequest {
    /// Delete the sandbox once the snapshot is written.
    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub sandbox_id: String,
    pub dir: PathBuf,
    pub memfile: PathBuf,
    pub snapfile: PathBuf,
    pub deleted: bool,
}

// ============================================================================
// Errors
// ============================================================================

/// A [`CoreError`] rendered as `{"error": ...}` with a matching status.
#[derive(Debug)]
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::AlreadyExists(_) | CoreError::Busy(_) => StatusCode::CONFLICT,
            CoreError::Template(cove_core::TemplateError::NotFound(_)) => StatusCode::NOT_FOUND,
            CoreError::Template(_) | CoreError::InvalidId(_) | CoreError::Toml(_) => {
                StatusCode::BAD_REQUEST
            }
            CoreError::NetworkExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "Request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Router
// ============================================================================

/// Build the HTTP router.
///
/// The returned router can be served directly with axum or composed
/// into a larger application.
pub fn build_router(manager: Arc<SandboxManager>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sandboxes", post(create_handler).get(list_handler))
        .route("/sandboxes/delete", post(bulk_delete_handler))
        .route("/sandboxes/purge", post(purge_handler))
        .route("/sandboxes/:id", get(get_handler).delete(delete_handler))
        .route("/sandboxes/:id/snapshot", post(snapshot_handler))
        .route("/sandboxes/:id/pause", post(pause_handler))
        .route("/sandboxes/:id/resume", post(resume_handler))
        .route("/orphans", get(orphans_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

async fn health_handler(State(manager): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "cove-server",
        "sandboxes": manager.count().await,
        "slots_in_use": manager.slots().in_use(),
    }))
}

async fn create_handler(
    State(manager): State<AppState>,
    Json(request): Json<CreateSandboxRequest>,
) -> ApiResult<(StatusCode, Json<SandboxSummary>)> {
    let sandbox_id = request
        .sandbox_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let summary = match &request.snapshot_dir {
        Some(dir) => {
            manager
                .create_from_snapshot(&request.template_id, &sandbox_id, dir)
                .await?
        }
        None => manager.create(&request.template_id, &sandbox_id).await?,
    };
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn list_handler(State(manager): State<AppState>) -> Json<Vec<SandboxSummary>> {
    Json(manager.list().await)
}

async fn get_handler(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SandboxSummary>> {
    Ok(Json(manager.get(&id).await?))
}

async fn delete_handler(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    manager.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn bulk_delete_handler(
    State(manager): State<AppState>,
    Json(request): Json<BulkDeleteRequest>,
) -> Json<BulkDeleteResponse> {
    let outcome = manager.delete_many(&request.sandbox_ids).await;
    Json(BulkDeleteResponse {
        deleted: outcome.succeeded,
        failed: outcome
            .failed
            .into_iter()
            .map(|(sandbox_id, e)| FailedId {
                sandbox_id,
                error: e.to_string(),
            })
            .collect(),
    })
}

async fn purge_handler(
    State(manager): State<AppState>,
    request: Option<Json<PurgeRequest>>,
) -> Json<PurgeReport> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    Json(manager.purge(&request.sandbox_ids, request.purge_all).await)
}

async fn snapshot_handler(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<SnapshotRequest>>,
) -> ApiResult<Json<SnapshotResponse>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let files = manager.snapshot(&id, request.delete).await?;
    Ok(Json(SnapshotResponse {
        sandbox_id: id,
        dir: files.dir,
        memfile: files.memfile,
        snapfile: files.snapfile,
        deleted: request.delete,
    }))
}

async fn pause_handler(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SandboxSummary>> {
    Ok(Json(manager.pause(&id).await?))
}

async fn resume_handler(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SandboxSummary>> {
    Ok(Json(manager.resume(&id).await?))
}

async fn orphans_handler(State(manager): State<AppState>) -> ApiResult<Json<Vec<VmmProcessInfo>>> {
    Ok(Json(manager.list_orphans().await?))
}

/// Start the HTTP server.
///
/// This function runs until the server is shut down via the provided
/// shutdown signal.
pub async fn serve(
    manager: Arc<SandboxManager>,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(manager);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use cove_core::{ManagerConfig, NetworkDriver, NetworkSlot};
    use cove_vmm::mock::MockLauncher;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct NoopNetwork;

    #[async_trait]
    impl NetworkDriver for NoopNetwork {
        async fn setup(&self, _slot: &NetworkSlot) -> cove_core::Result<()> {
            Ok(())
        }

        async fn teardown(&self, _slot: &NetworkSlot) -> cove_core::Result<()> {
            Ok(())
        }

        async fn list_namespaces(&self) -> cove_core::Result<Vec<NetworkSlot>> {
            Ok(Vec::new())
        }
    }

    fn test_manager() -> (TempDir, Arc<SandboxManager>) {
        let root = tempfile::tempdir().unwrap();
        let template = root.path().join("data/templates/base");
        std::fs::create_dir_all(template.join("image")).unwrap();
        std::fs::write(
            template.join("template.toml"),
            "template_id = \"base\"\nvcpu = 1\nmem_mb = 128\ndisk_mb = 256\n",
        )
        .unwrap();
        std::fs::write(template.join("image/rootfs.ext4"), b"rootfs").unwrap();

        let mut config = ManagerConfig::new(root.path().join("data"), root.path().join("run"));
        config.proc_root = root.path().join("proc");
        config.settle_delay = Duration::from_millis(1);
        std::fs::create_dir_all(&config.proc_root).unwrap();

        let manager = SandboxManager::new(
            config,
            Arc::new(MockLauncher::new()),
            Arc::new(NoopNetwork),
        );
        (root, Arc::new(manager))
    }

    async fn call(
        manager: &Arc<SandboxManager>,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = build_router(Arc::clone(manager))
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (_root, manager) = test_manager();
        let (status, body) = call(&manager, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sandboxes"], 0);
    }

    #[tokio::test]
    async fn test_create_list_delete() {
        let (_root, manager) = test_manager();
        let (status, body) = call(
            &manager,
            "POST",
            "/sandboxes",
            Some(serde_json::json!({ "template_id": "base", "sandbox_id": "web-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["sandbox_id"], "web-1");
        assert_eq!(body["state"], "running");
        assert_eq!(body["vmm_type"], "firecracker");

        let (status, body) = call(&manager, "GET", "/sandboxes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = call(&manager, "DELETE", "/sandboxes/web-1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = call(&manager, "DELETE", "/sandboxes/web-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "sandbox not found: web-1");
    }

    #[tokio::test]
    async fn test_create_generates_id() {
        let (_root, manager) = test_manager();
        let (status, body) = call(
            &manager,
            "POST",
            "/sandboxes",
            Some(serde_json::json!({ "template_id": "base" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["sandbox_id"].as_str().unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (_root, manager) = test_manager();
        let create = |template: &str, id: &str| {
            Some(serde_json::json!({ "template_id": template, "sandbox_id": id }))
        };

        let (status, _) = call(&manager, "POST", "/sandboxes", create("missing", "a")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&manager, "POST", "/sandboxes", create("base", "a/b")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        call(&manager, "POST", "/sandboxes", create("base", "a")).await;
        let (status, _) = call(&manager, "POST", "/sandboxes", create("base", "a")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&manager, "POST", "/sandboxes/ghost/pause", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pause_snapshot_and_bulk_delete() {
        let (_root, manager) = test_manager();
        for id in ["a", "b"] {
            manager.create("base", id).await.unwrap();
        }

        let (status, body) = call(&manager, "POST", "/sandboxes/a/pause", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "paused");

        let (status, body) = call(
            &manager,
            "POST",
            "/sandboxes/b/snapshot",
            Some(serde_json::json!({ "delete": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], true);
        assert!(PathBuf::from(body["memfile"].as_str().unwrap()).is_file());

        let (status, body) = call(
            &manager,
            "POST",
            "/sandboxes/delete",
            Some(serde_json::json!({ "sandbox_ids": ["a", "b"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], serde_json::json!(["a"]));
        assert_eq!(body["failed"][0]["sandbox_id"], "b");
    }

    #[tokio::test]
    async fn test_purge_without_body() {
        let (_root, manager) = test_manager();
        manager.create("base", "a").await.unwrap();

        let (status, body) = call(
            &manager,
            "POST",
            "/sandboxes/purge",
            Some(serde_json::json!({ "purge_all": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["targets"][0]["kind"], "registered");
        assert_eq!(manager.count().await, 0);

        let (status, body) = call(&manager, "POST", "/sandboxes/purge", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "purged 0 target(s)");
    }
}
