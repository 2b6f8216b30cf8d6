use crate::task::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted but no task wave released yet.
    Queued,
    /// Pre-approval stages are executing.
    InProgress,
    /// Blocked on the human approval gate.
    WaitingForApproval,
    /// The reviewer asked for PRD changes; regeneration is underway.
    ChangesRequested,
    /// Post-approval stages are executing.
    Running,
    /// All stages finished.
    Completed,
    /// A stage exhausted its retries.
    Failed,
}

impl JobStatus {
    /// Whether the job can no longer make progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::WaitingForApproval => "waiting_for_approval",
            JobStatus::ChangesRequested => "changes_requested",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A node of the workflow state machine.
///
/// The workflow is linear with two fan-out stages: [`Stage::Planning`]
/// releases the plan and feature-tree tasks in parallel, and
/// [`Stage::Validation`] releases the four post-development review tasks.
/// [`Stage::WaitingForApproval`] is the only stage with an empty wave; it
/// blocks on an external decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initialization,
    PrdGeneration,
    WaitingForApproval,
    Planning,
    Architecture,
    Uiux,
    Development,
    Validation,
    PmReview,
    Delivery,
    Completed,
    Failed,
}

impl Stage {
    /// The stage entered after this one completes, `None` for terminal stages.
    ///
    /// `Failed` is never a successor here; it is reached only through
    /// failure propagation.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Initialization => Some(Stage::PrdGeneration),
            Stage::PrdGeneration => Some(Stage::WaitingForApproval),
            Stage::WaitingForApproval => Some(Stage::Planning),
            Stage::Planning => Some(Stage::Architecture),
            Stage::Architecture => Some(Stage::Uiux),
            Stage::Uiux => Some(Stage::Development),
            Stage::Development => Some(Stage::Validation),
            Stage::Validation => Some(Stage::PmReview),
            Stage::PmReview => Some(Stage::Delivery),
            Stage::Delivery => Some(Stage::Completed),
            Stage::Completed | Stage::Failed => None,
        }
    }

    /// The worker roles whose tasks make up this stage's wave.
    pub fn wave_roles(self) -> &'static [Role] {
        match self {
            Stage::PrdGeneration => &[Role::Prd],
            Stage::Planning => &[Role::Plan, Role::FeatureTree],
            Stage::Architecture => &[Role::Architecture],
            Stage::Uiux => &[Role::Uiux],
            Stage::Development => &[Role::Development],
            Stage::Validation => &[Role::Qa, Role::Security, Role::Documentation, Role::Support],
            Stage::PmReview => &[Role::PmReview],
            Stage::Delivery => &[Role::Delivery],
            Stage::Initialization
            | Stage::WaitingForApproval
            | Stage::Completed
            | Stage::Failed => &[],
        }
    }

    /// Whether the stage machine stops here.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    /// Position in the workflow, used as the default task priority so that
    /// earlier stages win when queues are shared.
    pub fn ordinal(self) -> i32 {
        match self {
            Stage::Initialization => 0,
            Stage::PrdGeneration => 1,
            Stage::WaitingForApproval => 2,
            Stage::Planning => 3,
            Stage::Architecture => 4,
            Stage::Uiux => 5,
            Stage::Development => 6,
            Stage::Validation => 7,
            Stage::PmReview => 8,
            Stage::Delivery => 9,
            Stage::Completed => 10,
            Stage::Failed => 11,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Initialization => "initialization",
            Stage::PrdGeneration => "prd_generation",
            Stage::WaitingForApproval => "waiting_for_approval",
            Stage::Planning => "planning",
            Stage::Architecture => "architecture",
            Stage::Uiux => "uiux",
            Stage::Development => "development",
            Stage::Validation => "validation",
            Stage::PmReview => "pm_review",
            Stage::Delivery => "delivery",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Metadata key under which the original requirements text is stored.
pub const META_REQUIREMENTS: &str = "requirements";
/// Metadata key recording the role of the task that failed the job.
pub const META_FAILED_STAGE: &str = "failed_stage";
/// Metadata key recording the failure reason.
pub const META_FAILED_REASON: &str = "failed_reason";
/// Metadata key counting PRD revisions requested through the approval gate.
pub const META_PRD_REVISION: &str = "prd_revision";
/// Metadata key carrying the most recent change-request feedback.
pub const META_PRD_FEEDBACK: &str = "prd_feedback";

/// A single end-to-end planning request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub id: Uuid,
    /// Human-supplied project identifier; at most one active job per project.
    pub project_id: String,
    /// Current lifecycle status. Mutated only by the Orchestrator.
    pub status: JobStatus,
    /// Current workflow stage. Mutated only by the Orchestrator.
    pub stage: Stage,
    /// UTC creation timestamp.
    pub created_at: DateTime<Utc>,
    /// UTC timestamp of the last mutation.
    pub updated_at: DateTime<Utc>,
    /// Free-form metadata; holds the original requirements and, on failure,
    /// the failed stage and reason.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Job {
    /// Creates a job in `initialization`/`queued` with the requirements
    /// recorded in metadata.
    pub fn new(
        project_id: impl Into<String>,
        requirements: impl Into<String>,
        mut metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        metadata.insert(
            META_REQUIREMENTS.to_string(),
            serde_json::Value::String(requirements.into()),
        );
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            status: JobStatus::Queued,
            stage: Stage::Initialization,
            created_at: now,
            updated_at: now,
            metadata,
        }
    }

    /// The original requirements text, empty if absent (never the case for
    /// jobs created through intake).
    pub fn requirements(&self) -> &str {
        self.metadata
            .get(META_REQUIREMENTS)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }

    /// Whether this job still blocks its project id from reuse.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Number of PRD revisions requested so far through the approval gate.
    pub fn prd_revision(&self) -> u32 {
        self.metadata
            .get(META_PRD_REVISION)
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_starts_queued_in_initialization() {
        let job = Job::new("p1", "Build a URL shortener", HashMap::new());
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.stage, Stage::Initialization);
        assert_eq!(job.requirements(), "Build a URL shortener");
        assert!(job.is_active());
    }

    #[test]
    fn test_stage_chain_reaches_completed() {
        let mut stage = Stage::Initialization;
        let mut hops = 0;
        while let Some(next) = stage.next() {
            stage = next;
            hops += 1;
            assert!(hops < 20, "stage chain must terminate");
        }
        assert_eq!(stage, Stage::Completed);
    }

    #[test]
    fn test_gate_stage_has_empty_wave() {
        assert!(Stage::WaitingForApproval.wave_roles().is_empty());
        assert_eq!(Stage::Validation.wave_roles().len(), 4);
        assert_eq!(Stage::Planning.wave_roles().len(), 2);
    }

    #[test]
    fn test_stage_ordinals_are_monotonic_along_the_chain() {
        let mut stage = Stage::Initialization;
        while let Some(next) = stage.next() {
            assert!(next.ordinal() > stage.ordinal());
            stage = next;
        }
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::WaitingForApproval).unwrap();
        assert_eq!(json, "\"waiting_for_approval\"");
        let json = serde_json::to_string(&Stage::PmReview).unwrap();
        assert_eq!(json, "\"pm_review\"");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(Stage::Failed.next().is_none());
    }
}
