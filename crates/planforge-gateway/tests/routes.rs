//! Gateway surface tests: status codes, error bodies, the approval round
//! trip over HTTP, artifact export, SSE framing, and metrics.

#![allow(clippy::unwrap_used)]

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use http_body_util::BodyExt;
use planforge_core::{ConfigHandle, Metrics, PlanforgeConfig};
use planforge_dispatch::{Dispatcher, WorkerPool};
use planforge_events::{CatalogCache, EventBus};
use planforge_gateway::{AppState, GatewayServer};
use planforge_handlers::builtin_registry;
use planforge_orchestrator::Orchestrator;
use planforge_store::{MemoryStateStore, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn test_router() -> Router {
    let mut raw = PlanforgeConfig::default();
    raw.worker.concurrency = 4;
    raw.task.retry_backoff_base_ms = 10;
    raw.queue.claim_wait_seconds = 1;
    let config = ConfigHandle::new(raw);

    let metrics = Arc::new(Metrics::new());
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let bus = EventBus::new(
        Arc::clone(&store),
        Arc::clone(&metrics),
        &config.snapshot().eventbus,
    );
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&metrics),
        config.clone(),
    );
    let _ = dispatcher.start_lease_reaper();
    let catalog = CatalogCache::new(Arc::clone(&store));
    let pool = WorkerPool::new(
        Arc::clone(&dispatcher),
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::new(builtin_registry()),
        Arc::clone(&catalog),
        Arc::clone(&metrics),
        config.clone(),
    );
    pool.start().await;
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&dispatcher),
        Arc::clone(&metrics),
        config.clone(),
    );
    let _ = orchestrator.start();

    GatewayServer::build(Arc::new(AppState {
        orchestrator,
        store,
        bus,
        dispatcher,
        catalog,
        metrics,
        config,
    }))
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, body)
}

fn create_body(project: &str) -> serde_json::Value {
    serde_json::json!({
        "project_id": project,
        "requirements": "Build a URL shortener with analytics dashboard. Expected load 1k RPS.",
    })
}

async fn wait_for_status(router: &Router, job_id: &str, wanted: &str) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let (status, body) = send(router, get_request(&format!("/jobs/{job_id}"))).await;
            assert_eq!(status, StatusCode::OK);
            if body["status"] == wanted {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job never reached {wanted}"))
}

#[tokio::test]
async fn test_health() {
    let router = test_router().await;
    let (status, body) = send(&router, get_request("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_create_job_validations() {
    let router = test_router().await;

    let (status, body) = send(
        &router,
        json_request(
            "POST",
            "/jobs",
            serde_json::json!({"project_id": "p1", "requirements": ""}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_input");

    let (status, _) = send(&router, json_request("POST", "/jobs", create_body("p1"))).await;
    assert_eq!(status, StatusCode::CREATED);

    // Second active job for the same project conflicts deterministically.
    let (status, body) = send(&router, json_request("POST", "/jobs", create_body("p1"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");
}

#[tokio::test]
async fn test_get_unknown_job_is_404() {
    let router = test_router().await;
    let (status, body) = send(
        &router,
        get_request(&format!("/jobs/{}", uuid::Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_full_job_round_trip_over_http() {
    let router = test_router().await;

    let (status, created) =
        send(&router, json_request("POST", "/jobs", create_body("p1"))).await;
    assert_eq!(status, StatusCode::CREATED);
    let job_id = created["job_id"].as_str().unwrap().to_string();

    wait_for_status(&router, &job_id, "waiting_for_approval").await;

    // The PRD artifact is readable once the gate is reached.
    let (status, prd) = send(
        &router,
        get_request(&format!("/jobs/{job_id}/artifacts/prd")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let prd_hash = prd["hash"].as_str().unwrap().to_string();

    // A not-yet-produced artifact 404s.
    let (status, _) = send(
        &router,
        get_request(&format!("/jobs/{job_id}/artifacts/delivery")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Approving a stale hash is rejected.
    let (status, body) = send(
        &router,
        json_request(
            "POST",
            &format!("/jobs/{job_id}/approve"),
            serde_json::json!({"prd_hash": "0000000000"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "stale_approval");

    let (status, _) = send(
        &router,
        json_request(
            "POST",
            &format!("/jobs/{job_id}/approve"),
            serde_json::json!({"prd_hash": prd_hash, "notes": "ship it"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Approving twice is a lifecycle violation.
    let (status, body) = send(
        &router,
        json_request(
            "POST",
            &format!("/jobs/{job_id}/approve"),
            serde_json::json!({"prd_hash": prd_hash}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "wrong_stage");

    wait_for_status(&router, &job_id, "completed").await;

    // Export: a zip with one entry per artifact.
    let response = router
        .clone()
        .oneshot(get_request(&format!("/jobs/{job_id}/export")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE].to_str().unwrap(),
        "application/zip"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(bytes.len() > 100);
    assert_eq!(&bytes[..2], b"PK");

    // Metrics reflect the finished job.
    let (status, metrics) = send(&router, get_request("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["counters"]["jobs_completed"], 1);
    assert!(metrics["counters"]["tasks_succeeded"].as_u64().unwrap() >= 12);
    assert!(metrics["counters"]["usage"]["tokens"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_restart_requires_failed_job() {
    let router = test_router().await;
    let (_, created) = send(&router, json_request("POST", "/jobs", create_body("p1"))).await;
    let job_id = created["job_id"].as_str().unwrap();

    let (status, body) = send(
        &router,
        json_request("POST", &format!("/jobs/{job_id}/restart"), serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "not_failed");
}

#[tokio::test]
async fn test_delete_job_then_404() {
    let router = test_router().await;
    let (_, created) = send(&router, json_request("POST", "/jobs", create_body("p1"))).await;
    let job_id = created["job_id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/jobs/{job_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "deleted");

    let (status, _) = send(&router, get_request(&format!("/jobs/{job_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sse_replays_finished_job() {
    let router = test_router().await;
    let (_, created) = send(&router, json_request("POST", "/jobs", create_body("p1"))).await;
    let job_id = created["job_id"].as_str().unwrap().to_string();
    wait_for_status(&router, &job_id, "waiting_for_approval").await;
    let (_, prd) = send(
        &router,
        get_request(&format!("/jobs/{job_id}/artifacts/prd")),
    )
    .await;
    send(
        &router,
        json_request(
            "POST",
            &format!("/jobs/{job_id}/approve"),
            serde_json::json!({"prd_hash": prd["hash"]}),
        ),
    )
    .await;
    wait_for_status(&router, &job_id, "completed").await;

    let response = router
        .clone()
        .oneshot(get_request(&format!("/jobs/{job_id}/events?from_seq=0")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    // The replayed stream carries the whole history up to job_completed.
    let mut stream = response.into_body().into_data_stream();
    let collected = tokio::time::timeout(Duration::from_secs(10), async {
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            text.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            if text.contains("event: job_completed") {
                return text;
            }
        }
        text
    })
    .await
    .expect("SSE replay timed out");
    assert!(collected.contains("event: job_created"));
    assert!(collected.contains("event: approval_granted"));
    assert!(collected.contains("event: job_completed"));
}

#[tokio::test]
async fn test_module_catalog_admin_round_trip() {
    let router = test_router().await;

    let (status, _) = send(
        &router,
        json_request(
            "PUT",
            "/modules/auth-core",
            serde_json::json!({
                "name": "Authentication",
                "capabilities": ["oauth", "sessions"],
                "version": "2.1.0",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, modules) = send(&router, get_request("/modules")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(modules[0]["id"], "auth-core");
    assert_eq!(modules[0]["version"], "2.1.0");
}

#[tokio::test]
async fn test_allowlist_admin_round_trip() {
    let router = test_router().await;

    let (status, _) = send(
        &router,
        json_request(
            "PUT",
            "/allowlists/qa",
            serde_json::json!({"skills": ["browser", "http_fetch"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, allowlist) = send(&router, get_request("/allowlists/qa")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(allowlist["role"], "qa");
    assert_eq!(allowlist["skills"][0], "browser");

    let (status, _) = send(&router, get_request("/allowlists/security")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&router, get_request("/allowlists/warlock")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_input");
}
