//! HTTP API server for leasepool.
//!
//! Every route lives under `/{context_root}` and answers with an operation
//! result: `rc` 0 on success, -1 with `msg` and `code` on failure.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! leasepool serve --listen 127.0.0.1:7890
//!
//! # Lease a device
//! curl -X POST http://localhost:7890/pool/lease/by-name \
//!   -H "Content-Type: application/json" \
//!   -d '{"name": "d1", "lessor": "alice"}'
//! ```

pub mod error;
pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::pool::Pool;

/// Upper bound on one request. Cloud boots poll for several minutes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(900);

/// Create the API router with all endpoints under `/{context_root}`.
pub fn create_router(pool: Arc<Pool>, context_root: &str) -> Router {
    let lease_routes = Router::new()
        .route("/by-name", post(handlers::lease::lease_by_name))
        .route("/by-os", post(handlers::lease::lease_by_os))
        .route("/by-contents", post(handlers::lease::lease_by_contents));

    let snapshot_routes = Router::new()
        .route("/take", post(handlers::snapshots::take))
        .route("/rename", post(handlers::snapshots::rename))
        .route("/update", post(handlers::snapshots::update))
        .route("/bind", post(handlers::snapshots::bind));

    let routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/devices/:lessor", get(handlers::devices::list_devices))
        .route("/devices/add", post(handlers::devices::add_device))
        .route("/devices/remove", post(handlers::devices::remove_device))
        .route("/reload", post(handlers::devices::reload))
        .route("/status/:name", get(handlers::vm::status))
        .route("/ip/:name", get(handlers::vm::address))
        .route("/ping/:hostname", get(handlers::vm::ping))
        .route("/unlease", post(handlers::lease::unlease))
        .route("/start", post(handlers::vm::start))
        .route("/stop", post(handlers::vm::stop))
        .route("/restore", post(handlers::vm::restore))
        .nest("/lease", lease_routes)
        .nest("/snapshot", snapshot_routes)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    Router::new()
        .nest(&format!("/{}", context_root), routes)
        .layer(TraceLayer::new_for_http())
        .with_state(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::notify::LogNotifier;
    use crate::sync::ResourceSerializer;
    use crate::vm::backend::{AdapterMap, OpenStackAdapter, OpenStackTimeouts};
    use crate::vm::testing::{FakeAdapter, FakeCompute};
    use crate::vm::{CanonicalState, HypervisorAdapter};
    use std::time::Duration;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use leasepool_protocol::{Device, MachineType, OpResult, User};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn pool_with(dir: &TempDir, binding: &str, adapter: Arc<dyn HypervisorAdapter>) -> Arc<Pool> {
        let devices = vec![Device {
            name: "d1".into(),
            machinetype: MachineType::Virtual,
            os: "linux".into(),
            hypervisor: Some(binding.into()),
            password: "secret".into(),
            ..Default::default()
        }];
        let users = vec![
            User {
                name: "alice".into(),
                ..Default::default()
            },
            User {
                name: "bob".into(),
                ..Default::default()
            },
        ];
        std::fs::write(
            dir.path().join("devices.json"),
            serde_json::to_string(&devices).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("users.json"),
            serde_json::to_string(&users).unwrap(),
        )
        .unwrap();

        let config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut adapters = AdapterMap::new();
        adapters.insert(binding.into(), adapter);
        Arc::new(Pool::open(&config, adapters, Arc::new(LogNotifier)).unwrap())
    }

    fn app(dir: &TempDir) -> Router {
        let pool = pool_with(dir, "fake1", Arc::new(FakeAdapter::new("fake1")));
        create_router(pool, "pool")
    }

    async fn call(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, OpResult) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_under_context_root() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);
        let (status, result) = call(&app, "GET", "/pool/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_lease_then_foreign_unlease_rejected() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);

        let (status, result) = call(
            &app,
            "POST",
            "/pool/lease/by-name",
            r#"{"name": "d1", "lessor": "alice"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result.rc, 0);

        let (status, result) = call(
            &app,
            "POST",
            "/pool/unlease",
            r#"{"name": "d1", "actor": "bob"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(result.rc, -1);
        assert_eq!(result.code.as_deref(), Some("PRECONDITION"));
        assert!(result.msg.contains("bob"));
    }

    #[tokio::test]
    async fn test_unknown_device_status_is_not_found() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);
        let (status, result) = call(&app, "GET", "/pool/status/nope", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(result.code.as_deref(), Some("NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_device_listing_redacts() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);
        let request = Request::builder()
            .uri("/pool/devices/bob")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json[0]["name"], "d1");
        assert_eq!(json[0]["password"], ".");
        assert_eq!(json[0]["available"], "true");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_request_still_finishes_launch() {
        let dir = TempDir::new().unwrap();
        let compute = Arc::new(FakeCompute::with_states(&[
            CanonicalState::NonExistent,
            CanonicalState::Build,
            CanonicalState::Active,
        ]));
        let cloud = OpenStackAdapter::new(
            "cloud1",
            compute.clone(),
            Arc::new(ResourceSerializer::new("floating-ip")),
            "m1.medium".into(),
            OpenStackTimeouts::default(),
        );
        let pool = pool_with(&dir, "cloud1", Arc::new(cloud));
        pool.lease_by_name("d1", "alice").await.unwrap();
        let app = create_router(pool, "pool");

        let request = Request::builder()
            .method("POST")
            .uri("/pool/start")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name": "d1", "actor": "alice"}"#))
            .unwrap();
        // The client gives up while the instance is still settling after boot.
        let abandoned = tokio::time::timeout(Duration::from_secs(1), app.oneshot(request)).await;
        assert!(abandoned.is_err());
        assert_eq!(compute.calls(), vec!["boot d1 m1.medium master"]);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(
            compute.calls(),
            vec!["boot d1 m1.medium master", "associate d1"]
        );
    }

    #[tokio::test]
    async fn test_ping_rejects_flag_like_hostname() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);
        let (status, result) = call(&app, "GET", "/pool/ping/-c", "").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(result.code.as_deref(), Some("PRECONDITION"));
        assert!(result.msg.contains("invalid hostname"));
    }
}
