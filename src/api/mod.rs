//! JSON control API for the local hosting manager.
//!
//! Every response body carries `success`; failures add `error` and map to
//! 400 (bad input or read-only host), 404 (unknown domain or app) or 500.

pub mod server;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::errors::HostingError;
use crate::hosting::{HostingManager, NodeAppRequest};

pub use server::{build_router, start_server};

// ── Shared application state ──────────────────────────────────────────

pub struct ApiState {
    pub manager: Arc<HostingManager>,
}

pub type SharedState = Arc<ApiState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DeployDomainRequest {
    pub domain_name: Option<String>,
    pub port: Option<Value>,
    pub site_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployNodeRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub deploy_config: DeployConfig,
}

#[derive(Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_app_port")]
    pub port: u16,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            port: default_app_port(),
        }
    }
}

fn default_app_port() -> u16 {
    3000
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub limit: Option<u32>,
    pub domain: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"success": false, "error": message}))).into_response()
    }
}

impl From<HostingError> for ApiError {
    fn from(err: HostingError) -> Self {
        if err.is_not_found() {
            ApiError::NotFound(err.to_string())
        } else if err.is_client_error() {
            ApiError::BadRequest(err.to_string())
        } else {
            tracing::error!(error = %err, "request failed");
            ApiError::Internal(err.to_string())
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/domains", get(list_domains).post(deploy_domain))
        .route("/api/domains/{name}", delete(remove_domain))
        .route("/api/domains/{name}/ssl", post(add_ssl))
        .route("/api/logs", get(logs))
        .route("/api/deploy/nodejs", post(deploy_nodejs))
        .route("/api/apps/status/{name}", get(app_status))
        .route("/api/apps/start/{name}", post(start_app))
        .route("/api/apps/stop/{name}", post(stop_app))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let config = state.manager.config();
    Json(json!({
        "success": true,
        "status": "healthy",
        "timestamp": chrono::Local::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "readonly_mode": config.readonly(),
        "web_root": config.web_root,
        "database_path": config.database_path,
    }))
}

async fn status(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let status = state.manager.status().await?;
    Ok(Json(json!({"success": true, "status": status})))
}

async fn list_domains(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let domains = state.manager.list_domains().await?;
    Ok(Json(json!({
        "success": true,
        "count": domains.len(),
        "domains": domains,
        "readonly_mode": state.manager.config().readonly(),
    })))
}

/// Accept the port as a JSON number or a numeric string.
fn parse_port(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

async fn deploy_domain(
    State(state): State<SharedState>,
    payload: Result<Json<DeployDomainRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let (Some(domain), Some(port), Some(site_type)) = (req.domain_name, req.port, req.site_type) else {
        return Err(ApiError::BadRequest(
            "Missing required fields: domain_name, port, site_type".to_string(),
        ));
    };
    let port = parse_port(&port)
        .ok_or_else(|| ApiError::BadRequest("Port must be an integer".to_string()))?;

    let deployment = state.manager.deploy_domain(&domain, port, &site_type).await?;
    let mut body = json!({
        "success": true,
        "message": format!("Domain {} deployed successfully", domain),
        "domain": deployment,
        "readonly_mode": deployment.readonly_mode,
    });
    if deployment.readonly_mode {
        body["warnings"] = json!([
            "Read-only filesystem detected - SSL and nginx configuration are unavailable"
        ]);
    }
    Ok(Json(body))
}

async fn remove_domain(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.remove_domain(&name).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Domain {} removed successfully", name),
        "readonly_mode": state.manager.config().readonly(),
    })))
}

async fn add_ssl(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.manager.add_ssl(&name).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Let's Encrypt SSL certificate added to {}", name),
        "https_url": format!("https://{}", record.domain_name),
        "domain": record,
    })))
}

async fn logs(
    State(state): State<SharedState>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(100);
    let logs = state.manager.logs(limit, query.domain).await?;
    Ok(Json(json!({
        "success": true,
        "count": logs.len(),
        "logs": logs,
        "readonly_mode": state.manager.config().readonly(),
    })))
}

async fn deploy_nodejs(
    State(state): State<SharedState>,
    payload: Result<Json<DeployNodeRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    if req.name.trim().is_empty() || req.files.is_empty() {
        return Err(ApiError::BadRequest("Missing site name or files".to_string()));
    }
    let request = NodeAppRequest {
        name: req.name,
        files: req.files,
        port: req.deploy_config.port,
    };
    let deployment = state.manager.apps().deploy(&request).await?;
    let mut body = serde_json::to_value(&deployment).map_err(|e| ApiError::Internal(e.to_string()))?;
    body["success"] = json!(true);
    Ok(Json(body))
}

async fn app_status(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.manager.apps().status(&name).await?;
    let mut body = serde_json::to_value(&report).map_err(|e| ApiError::Internal(e.to_string()))?;
    body["success"] = json!(true);
    Ok(Json(body))
}

async fn start_app(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.apps().start(&name).await?;
    Ok(Json(json!({"success": true})))
}

async fn stop_app(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let stopped = state.manager.apps().stop(&name).await?;
    Ok(Json(json!({"success": stopped})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::FsCapability;
    use crate::exec::fake::FakeRunner;
    use crate::config::HostingConfig;
    use crate::hosting::AppRecord;
    use crate::hosting::tests::fixture;
    use crate::render::ProcessManager;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_app(capability: FsCapability) -> (TempDir, Arc<FakeRunner>, Router) {
        let (root, runner, manager) = fixture(capability);
        let state = Arc::new(ApiState {
            manager: Arc::new(manager),
        });
        (root, runner, api_router().with_state(state))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_root, _runner, app) = test_app(FsCapability::ReadOnly);
        let response = app.oneshot(get("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["readonly_mode"], true);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_deploy_then_list_domains() {
        let (_root, _runner, app) = test_app(FsCapability::Writable);

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/domains",
                json!({"domain_name": "example.com", "port": "8080", "site_type": "api"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["domain"]["port"], 8080);
        assert!(body.get("warnings").is_none());

        let response = app.oneshot(get("/api/domains")).await.unwrap();
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["domains"][0]["domain_name"], "example.com");
        assert_eq!(body["domains"][0]["site_type"], "api");
        assert_eq!(body["domains"][0]["url"], "http://example.com");
    }

    #[tokio::test]
    async fn test_deploy_domain_validation_is_400() {
        let (_root, _runner, app) = test_app(FsCapability::Writable);

        for payload in [
            json!({"domain_name": "example.com", "port": 70000, "site_type": "static"}),
            json!({"domain_name": "example.com", "port": 80, "site_type": "php"}),
            json!({"domain_name": "../etc", "port": 80, "site_type": "static"}),
            json!({"domain_name": "example.com"}),
        ] {
            let response = app.clone().oneshot(post_json("/api/domains", payload)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body: Value = body_json(response.into_body()).await;
            assert_eq!(body["success"], false);
            assert!(body["error"].is_string());
        }
    }

    #[tokio::test]
    async fn test_malformed_json_is_400() {
        let (_root, _runner, app) = test_app(FsCapability::Writable);
        let request = Request::builder()
            .method("POST")
            .uri("/api/domains")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_nginx_rejection_is_500() {
        let (_root, runner, app) = test_app(FsCapability::Writable);
        runner.fail("nginx -t", "nginx: [emerg] invalid");
        let response = app
            .oneshot(post_json(
                "/api/domains",
                json!({"domain_name": "bad.com", "port": 80, "site_type": "static"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_remove_unknown_domain_is_404() {
        let (_root, _runner, app) = test_app(FsCapability::Writable);
        let request = Request::builder()
            .method("DELETE")
            .uri("/api/domains/missing.com")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ssl_on_readonly_host_is_400() {
        let (_root, runner, app) = test_app(FsCapability::ReadOnly);
        let response = app
            .oneshot(post_json("/api/domains/example.com/ssl", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!runner.ran("certbot"));
    }

    #[tokio::test]
    async fn test_ssl_then_logs_filtered_by_domain() {
        let (_root, _runner, app) = test_app(FsCapability::Writable);
        app.clone()
            .oneshot(post_json(
                "/api/domains",
                json!({"domain_name": "secure.com", "port": 80, "site_type": "static"}),
            ))
            .await
            .unwrap();
        app.clone()
            .oneshot(post_json(
                "/api/domains",
                json!({"domain_name": "other.com", "port": 80, "site_type": "static"}),
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(post_json("/api/domains/secure.com/ssl", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["https_url"], "https://secure.com");
        assert_eq!(body["domain"]["ssl_enabled"], true);

        let response = app.oneshot(get("/api/logs?domain=secure.com&limit=10")).await.unwrap();
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["count"], 2);
        assert!(
            body["logs"]
                .as_array()
                .unwrap()
                .iter()
                .all(|l| l["domain_name"] == "secure.com")
        );
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let (_root, runner, app) = test_app(FsCapability::Writable);
        runner.respond("systemctl is-active nginx", 0, "active\n", "");
        let response = app.oneshot(get("/api/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["status"]["nginx_running"], true);
        assert_eq!(body["status"]["database_ok"], true);
        assert_eq!(body["status"]["domains"]["active"], 0);
    }

    #[tokio::test]
    async fn test_deploy_nodejs_requires_name_and_files() {
        let (_root, _runner, app) = test_app(FsCapability::ReadOnly);
        let response = app
            .oneshot(post_json("/api/deploy/nodejs", json!({"name": "shop", "files": {}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["error"], "Missing site name or files");
    }

    #[tokio::test]
    async fn test_unknown_app_is_404() {
        let (_root, _runner, app) = test_app(FsCapability::ReadOnly);
        let response = app.clone().oneshot(get("/api/apps/status/ghost")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let request = Request::builder()
            .method("POST")
            .uri("/api/apps/stop/ghost")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    fn save_app(root: &std::path::Path, site: &str, manager: ProcessManager) {
        let config = HostingConfig::sandboxed(root, FsCapability::Writable);
        AppRecord {
            site_name: site.to_string(),
            port: 4000,
            cwd: config.site_dir(site),
            process_manager: manager,
            start_command: "npm start".to_string(),
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
            readonly_mode: false,
        }
        .save(&config.app_records_dir)
        .unwrap();
    }

    #[tokio::test]
    async fn test_stop_reports_whether_app_stopped() {
        let (root, runner, app) = test_app(FsCapability::Writable);
        runner.fail("systemctl stop nodejs-unit", "Failed to stop nodejs-unit.service: Access denied");
        save_app(root.path(), "idle", ProcessManager::PidFile);
        save_app(root.path(), "unit", ProcessManager::Systemd);
        save_app(root.path(), "worker", ProcessManager::Pm2);

        for (site, expected) in [("idle", false), ("unit", false), ("worker", true)] {
            let request = Request::builder()
                .method("POST")
                .uri(format!("/api/apps/stop/{}", site))
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{}", site);
            let body: Value = body_json(response.into_body()).await;
            assert_eq!(body["success"], expected, "{}", site);
        }
        assert!(runner.ran("pm2 stop worker"));
    }
}
