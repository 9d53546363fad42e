use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::{ApiState, api_router};
use crate::hosting::HostingManager;

/// The API router with permissive CORS, ready to serve.
pub fn build_router(manager: Arc<HostingManager>) -> Router {
    let state = Arc::new(ApiState { manager });
    api_router().layer(CorsLayer::permissive()).with_state(state)
}

/// Serve the hosting API on `host:port` until Ctrl+C or SIGTERM.
pub async fn start_server(manager: HostingManager, host: &str, port: u16) -> Result<()> {
    let readonly = manager.config().readonly();
    let web_root = manager.config().web_root.clone();
    let app = build_router(Arc::new(manager));

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    println!("Hosting API running at http://{}", local_addr);
    println!("  Web root:  {}", web_root.display());
    if readonly {
        println!("  Mode:      read-only (nginx and SSL management disabled)");
    }
    tracing::info!(addr = %local_addr, readonly, "hosting API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::FsCapability;
    use crate::hosting::tests::fixture;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_cors_preflight_is_allowed() {
        let (_root, _runner, manager) = fixture(FsCapability::Writable);
        let app = build_router(Arc::new(manager));
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/api/domains")
            .header("origin", "https://dashboard.example.com")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (_root, _runner, manager) = fixture(FsCapability::Writable);
        let app = build_router(Arc::new(manager));
        let request = Request::builder()
            .uri("/api/nope")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
