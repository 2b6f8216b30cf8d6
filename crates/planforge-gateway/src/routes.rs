use crate::error::ApiError;
use crate::server::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use planforge_core::{
    ArtifactKind, Job, JobStatus, ModuleEntry, PlanforgeError, Role, SkillAllowlist,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub project_id: String,
    pub requirements: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct ApproveRequest {
    pub prd_hash: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Deserialize)]
pub struct RequestChangesRequest {
    pub feedback: String,
}

#[derive(Deserialize)]
pub struct UpsertModuleRequest {
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub version: String,
}

#[derive(Deserialize)]
pub struct SetAllowlistRequest {
    pub skills: Vec<String>,
}

fn job_summary(job: &Job) -> serde_json::Value {
    serde_json::json!({
        "job_id": job.id,
        "status": job.status,
        "stage": job.stage,
    })
}

pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .orchestrator
        .create_job(&request.project_id, &request.requirements, request.metadata)
        .await?;
    Ok((StatusCode::CREATED, Json(job_summary(&job))))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.store.get_job(id).await?))
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let jobs = state
        .store
        .list_jobs(query.status, query.limit.unwrap_or(100))
        .await?;
    Ok(Json(jobs))
}

pub async fn get_artifact(
    State(state): State<Arc<AppState>>,
    Path((id, kind)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let kind: ArtifactKind = kind
        .parse()
        .map_err(PlanforgeError::InvalidInput)?;
    // 404 for the job itself and for a not-yet-produced artifact alike.
    state.store.get_job(id).await?;
    let artifact = state.store.artifact_for_job(id, kind).await?;
    Ok(Json(artifact))
}

/// Streams a zip archive containing every artifact of the job.
pub async fn export_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.get_job(id).await?;
    let artifacts = state.store.artifacts_for_job(id).await?;

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut archive = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for artifact in &artifacts {
            let name = format!("{}-{}.json", artifact.kind, &artifact.hash[..12]);
            archive
                .start_file(name, options)
                .map_err(|e| PlanforgeError::FatalBackend(format!("archive write: {e}")))?;
            let body = serde_json::to_vec_pretty(artifact).map_err(PlanforgeError::from)?;
            archive
                .write_all(&body)
                .map_err(PlanforgeError::from)?;
        }
        archive
            .finish()
            .map_err(|e| PlanforgeError::FatalBackend(format!("archive finish: {e}")))?;
    }

    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"job-{id}.zip\""),
        ),
    ];
    Ok((headers, cursor.into_inner()))
}

pub async fn approve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ApproveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .orchestrator
        .approve(id, &request.prd_hash, request.notes)
        .await?;
    Ok(Json(job_summary(&job)))
}

pub async fn request_changes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<RequestChangesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .orchestrator
        .request_changes(id, &request.feedback)
        .await?;
    Ok(Json(job_summary(&job)))
}

pub async fn restart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.orchestrator.restart(id).await?;
    Ok(Json(job_summary(&job)))
}

pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.delete(id).await?;
    Ok(Json(serde_json::json!({"job_id": id, "status": "deleted"})))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.metrics.snapshot();
    let depths = state.dispatcher.queue_depths().await;
    let queues: serde_json::Map<String, serde_json::Value> = depths
        .into_iter()
        .map(|(role, depth)| {
            let key = role.map_or_else(|| "fallback".to_string(), |r| r.as_str().to_string());
            (key, serde_json::json!(depth))
        })
        .collect();
    Ok(Json(serde_json::json!({
        "counters": snapshot,
        "queues": queues,
        "workers": state.dispatcher.worker_count().await,
        "subscribers": state.bus.subscriber_count().await,
    })))
}

pub async fn list_modules(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ModuleEntry>>, ApiError> {
    Ok(Json(state.catalog.modules().await?.as_ref().clone()))
}

pub async fn upsert_module(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<UpsertModuleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = ModuleEntry::new(id, request.name, request.capabilities, request.version);
    state.catalog.upsert(entry.clone()).await?;
    Ok(Json(entry))
}

pub async fn get_allowlist(
    State(state): State<Arc<AppState>>,
    Path(role): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let role: Role = role.parse().map_err(PlanforgeError::InvalidInput)?;
    let allowlist = state
        .store
        .get_allowlist(role)
        .await?
        .ok_or_else(|| PlanforgeError::NotFound(format!("allowlist for {role}")))?;
    Ok(Json(allowlist))
}

pub async fn set_allowlist(
    State(state): State<Arc<AppState>>,
    Path(role): Path<String>,
    Json(request): Json<SetAllowlistRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let role: Role = role.parse().map_err(PlanforgeError::InvalidInput)?;
    let allowlist = SkillAllowlist {
        role,
        skills: request.skills,
    };
    state.store.set_allowlist(allowlist.clone()).await?;
    Ok(Json(allowlist))
}
