use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a workflow event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobCreated,
    StageEntered,
    TaskQueued,
    TaskClaimed,
    TaskStarted,
    TaskSucceeded,
    TaskFailed,
    ApprovalRequested,
    ApprovalGranted,
    ChangesRequested,
    ArtifactStored,
    JobCompleted,
    JobFailed,
    Heartbeat,
    QueueSaturated,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::JobCreated => "job_created",
            EventKind::StageEntered => "stage_entered",
            EventKind::TaskQueued => "task_queued",
            EventKind::TaskClaimed => "task_claimed",
            EventKind::TaskStarted => "task_started",
            EventKind::TaskSucceeded => "task_succeeded",
            EventKind::TaskFailed => "task_failed",
            EventKind::ApprovalRequested => "approval_requested",
            EventKind::ApprovalGranted => "approval_granted",
            EventKind::ChangesRequested => "changes_requested",
            EventKind::ArtifactStored => "artifact_stored",
            EventKind::JobCompleted => "job_completed",
            EventKind::JobFailed => "job_failed",
            EventKind::Heartbeat => "heartbeat",
            EventKind::QueueSaturated => "queue_saturated",
        };
        write!(f, "{s}")
    }
}

/// An append-only per-job audit record.
///
/// `seq` is assigned by the State Store at append time and is strictly
/// increasing and gap-free within a job, so clients deduplicate at-least-once
/// deliveries by sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Per-job monotonic sequence number; 1 for the first event of a job.
    pub seq: u64,
    /// The owning job.
    pub job_id: Uuid,
    /// The related task, when the event concerns one.
    pub task_id: Option<Uuid>,
    /// What happened.
    pub kind: EventKind,
    /// Correlates events caused by one external request or one handling step.
    pub correlation_id: Uuid,
    /// Opaque event payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// UTC timestamp of the append.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates an event with a fresh correlation id and unassigned sequence.
    ///
    /// The store overwrites `seq` on append.
    pub fn new(job_id: Uuid, kind: EventKind) -> Self {
        Self {
            seq: 0,
            job_id,
            task_id: None,
            kind,
            correlation_id: Uuid::new_v4(),
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Attaches the related task id.
    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Attaches an opaque payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Reuses an existing correlation id so related events group together.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}
