//! Core types and error definitions for the Planforge platform.
//!
//! This crate provides the foundational types shared across all Planforge
//! crates: the job/task/artifact/event data model, the workflow stage
//! machine vocabulary, error handling, configuration snapshots, and the
//! process-wide metrics registry.
//!
//! # Main types
//!
//! - [`PlanforgeError`] — Unified error enum for all Planforge subsystems.
//! - [`PlanforgeResult`] — Convenience alias for `Result<T, PlanforgeError>`.
//! - [`Job`] / [`Stage`] / [`JobStatus`] — A planning request and its workflow position.
//! - [`Task`] / [`Role`] / [`TaskStatus`] — One unit of work for one worker role.
//! - [`Artifact`] / [`ArtifactKind`] — Content-addressed task outputs.
//! - [`Event`] / [`EventKind`] — Append-only per-job audit records.
//! - [`TruthRecord`] — The approved (requirements, PRD) contract for a job.
//! - [`PlanforgeConfig`] / [`ConfigHandle`] — Immutable config snapshot with atomic swap.
//! - [`Metrics`] — Process-wide counters and gauges.

/// Content-addressed artifact types.
pub mod artifact;
/// Module catalog and skill allowlist entries.
pub mod catalog;
/// Configuration sections and the swappable snapshot handle.
pub mod config;
/// Append-only event records.
pub mod event;
/// Jobs and the workflow stage machine.
pub mod job;
/// Process-wide counters, gauges, and usage accounting.
pub mod metrics;
/// Tasks, roles, and claim leases.
pub mod task;
/// The approved requirements/PRD contract.
pub mod truth;

use thiserror::Error;

/// Top-level error type for the Planforge platform.
///
/// Variants are the caller-visible error kinds of the system; components
/// match on the variant to decide between retry, escalation, and crash.
#[derive(Debug, Error)]
pub enum PlanforgeError {
    /// The caller supplied an invalid request; no state was changed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A conditional write lost the race against a concurrent writer.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The requested entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A lifecycle operation was attempted at the wrong workflow stage.
    #[error("Wrong stage: {0}")]
    WrongStage(String),

    /// An approval referenced a PRD that is no longer the current one.
    #[error("Stale approval: {0}")]
    StaleApproval(String),

    /// Restart was requested for a job that has not failed.
    #[error("Job not failed: {0}")]
    NotFailed(String),

    /// A task handler overran its deadline.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// A transient backend failure; retried with bounded backoff.
    #[error("Transient backend error: {0}")]
    TransientBackend(String),

    /// A structural backend failure; the affected component should crash.
    #[error("Fatal backend error: {0}")]
    FatalBackend(String),

    /// A role handler reported a failure while executing a task.
    #[error("Handler error: {0}")]
    Handler(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlanforgeError {
    /// Stable machine-readable kind string, used in wire error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            PlanforgeError::InvalidInput(_) => "invalid_input",
            PlanforgeError::Conflict(_) => "conflict",
            PlanforgeError::NotFound(_) => "not_found",
            PlanforgeError::WrongStage(_) => "wrong_stage",
            PlanforgeError::StaleApproval(_) => "stale_approval",
            PlanforgeError::NotFailed(_) => "not_failed",
            PlanforgeError::DeadlineExceeded(_) => "deadline_exceeded",
            PlanforgeError::TransientBackend(_) => "transient_backend",
            PlanforgeError::FatalBackend(_) => "fatal_backend",
            PlanforgeError::Handler(_) => "handler",
            PlanforgeError::Json(_) => "json",
            PlanforgeError::Io(_) => "io",
        }
    }
}

/// A convenience `Result` alias using [`PlanforgeError`].
pub type PlanforgeResult<T> = Result<T, PlanforgeError>;

pub use artifact::{content_hash, Artifact, ArtifactKind};
pub use catalog::{ModuleEntry, SkillAllowlist};
pub use config::{
    ConfigHandle, EventBusSettings, OrchestratorSettings, PlanforgeConfig, QueueSettings,
    ServerSettings, StoreBackend, StoreSettings, TaskSettings, WorkerSettings,
};
pub use event::{Event, EventKind};
pub use job::{Job, JobStatus, Stage};
pub use metrics::{Metrics, MetricsSnapshot, Usage};
pub use task::{ClaimLease, Role, Task, TaskStatus};
pub use truth::TruthRecord;
