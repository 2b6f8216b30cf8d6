use axum::extract::{Request, State};
use axum::middleware::{self as axum_mw, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::Router;
use planforge_core::{ConfigHandle, Metrics};
use planforge_dispatch::Dispatcher;
use planforge_events::{CatalogCache, EventBus};
use planforge_orchestrator::Orchestrator;
use planforge_store::StateStore;
use std::sync::Arc;

/// Shared application state handed to every route.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn StateStore>,
    pub bus: Arc<EventBus>,
    pub dispatcher: Arc<Dispatcher>,
    pub catalog: Arc<CatalogCache>,
    pub metrics: Arc<Metrics>,
    pub config: ConfigHandle,
}

/// The gateway router factory.
pub struct GatewayServer;

impl GatewayServer {
    /// Builds the full client API router.
    pub fn build(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route(
                "/jobs",
                post(crate::routes::create_job).get(crate::routes::list_jobs),
            )
            .route(
                "/jobs/{id}",
                get(crate::routes::get_job).delete(crate::routes::delete_job),
            )
            .route(
                "/jobs/{id}/artifacts/{kind}",
                get(crate::routes::get_artifact),
            )
            .route("/jobs/{id}/export", get(crate::routes::export_job))
            .route("/jobs/{id}/approve", post(crate::routes::approve))
            .route(
                "/jobs/{id}/request-changes",
                post(crate::routes::request_changes),
            )
            .route("/jobs/{id}/restart", post(crate::routes::restart))
            .route("/jobs/{id}/events", get(crate::stream::subscribe_job))
            .route("/events", get(crate::stream::subscribe_all))
            .route("/metrics", get(crate::routes::metrics))
            .route("/modules", get(crate::routes::list_modules))
            .route("/modules/{id}", put(crate::routes::upsert_module))
            .route(
                "/allowlists/{role}",
                get(crate::routes::get_allowlist).put(crate::routes::set_allowlist),
            )
            .layer(axum_mw::from_fn_with_state(state.clone(), track_requests))
            .with_state(state)
    }
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({"status": "ok", "service": "planforge"}))
}

async fn track_requests(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> impl IntoResponse {
    Metrics::incr(&state.metrics.requests);
    next.run(request).await
}
