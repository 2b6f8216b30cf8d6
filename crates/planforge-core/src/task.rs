use crate::artifact::ArtifactKind;
use crate::job::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A named worker capability; each task is handled by exactly one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Prd,
    Plan,
    FeatureTree,
    Architecture,
    Uiux,
    Development,
    Qa,
    Security,
    Documentation,
    Support,
    PmReview,
    Delivery,
}

impl Role {
    /// All roles, in workflow order.
    pub const ALL: [Role; 12] = [
        Role::Prd,
        Role::Plan,
        Role::FeatureTree,
        Role::Architecture,
        Role::Uiux,
        Role::Development,
        Role::Qa,
        Role::Security,
        Role::Documentation,
        Role::Support,
        Role::PmReview,
        Role::Delivery,
    ];

    /// Stable string form, also used as queue and allowlist keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Prd => "prd",
            Role::Plan => "plan",
            Role::FeatureTree => "feature_tree",
            Role::Architecture => "architecture",
            Role::Uiux => "uiux",
            Role::Development => "development",
            Role::Qa => "qa",
            Role::Security => "security",
            Role::Documentation => "documentation",
            Role::Support => "support",
            Role::PmReview => "pm_review",
            Role::Delivery => "delivery",
        }
    }

    /// The artifact kind this role produces.
    pub fn artifact_kind(self) -> ArtifactKind {
        match self {
            Role::Prd => ArtifactKind::Prd,
            Role::Plan => ArtifactKind::Plan,
            Role::FeatureTree => ArtifactKind::FeatureTree,
            Role::Architecture => ArtifactKind::Architecture,
            Role::Uiux => ArtifactKind::Uiux,
            Role::Development => ArtifactKind::Development,
            Role::Qa => ArtifactKind::Qa,
            Role::Security => ArtifactKind::Security,
            Role::Documentation => ArtifactKind::Documentation,
            Role::Support => ArtifactKind::Support,
            Role::PmReview => ArtifactKind::PmReview,
            Role::Delivery => ArtifactKind::Delivery,
        }
    }

    /// Roles whose artifacts this role's tasks consume.
    ///
    /// Dependency task ids are resolved against these roles when a wave is
    /// generated.
    pub fn dependency_roles(self) -> &'static [Role] {
        match self {
            Role::Prd => &[],
            Role::Plan | Role::FeatureTree => &[Role::Prd],
            Role::Architecture => &[Role::Prd, Role::Plan],
            Role::Uiux => &[Role::Architecture],
            Role::Development => &[Role::Architecture, Role::Uiux],
            Role::Qa | Role::Security | Role::Documentation | Role::Support => {
                &[Role::Development]
            }
            Role::PmReview => &[Role::Qa, Role::Security, Role::Documentation, Role::Support],
            Role::Delivery => &[Role::PmReview],
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown role '{s}'"))
    }
}

/// Status of a task, owned piecewise: the Orchestrator creates tasks
/// (`pending`) and cancels them, the Dispatcher moves `queued` ⇄ `claimed`,
/// the worker moves `claimed → running → succeeded | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Claimed,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transition is legal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Legality of a transition along the status DAG.
    ///
    /// `claimed → queued` is the lease-expiry path and `running → queued`
    /// the retry path; both restart the attempt without passing through a
    /// terminal state.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Claimed)
                | (Queued, Cancelled)
                | (Claimed, Running)
                | (Claimed, Queued)
                | (Claimed, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Queued)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// The time-bounded claim a worker holds on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLease {
    /// The worker holding the claim.
    pub worker_id: Uuid,
    /// When the claim lapses unless renewed by a heartbeat.
    pub expires_at: DateTime<Utc>,
}

impl ClaimLease {
    /// Whether the lease has lapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One unit of work executed by one worker for one role within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Deterministic identifier derived from (job, stage, role, wave index).
    pub id: Uuid,
    /// The owning job.
    pub job_id: Uuid,
    /// The worker role that handles this task.
    pub role: Role,
    /// Free-form operation name; builtin handlers use the role string.
    pub task_type: String,
    /// The stage this task belongs to.
    pub stage: Stage,
    /// Current status.
    pub status: TaskStatus,
    /// Queue precedence; lower values run first.
    pub priority: i32,
    /// Task ids that must be `succeeded` before this task becomes eligible.
    pub dependencies: Vec<Uuid>,
    /// Input payload handed to the role handler.
    pub input: serde_json::Value,
    /// Output payload, set exactly when the task succeeds.
    pub output: Option<serde_json::Value>,
    /// Error string from the most recent failure.
    pub error: Option<String>,
    /// The active claim, if any.
    pub lease: Option<ClaimLease>,
    /// Execution attempts so far (first attempt is 1).
    pub attempt: u32,
    /// Attempts allowed before the failure becomes terminal.
    pub max_attempts: u32,
    /// Per-attempt handler deadline.
    pub deadline_seconds: u64,
    /// UTC creation timestamp.
    pub created_at: DateTime<Utc>,
    /// UTC timestamp of the last mutation.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Derives the stable task id for a (job, stage, role, wave index) slot.
    ///
    /// Regenerating a wave after a restart therefore reproduces the same
    /// ids, which is what makes wave generation idempotent.
    pub fn derive_id(job_id: Uuid, stage: Stage, role: Role, wave_index: u32) -> Uuid {
        let mut hasher = Sha256::new();
        hasher.update(job_id.as_bytes());
        hasher.update(stage.to_string().as_bytes());
        hasher.update(role.as_str().as_bytes());
        hasher.update(wave_index.to_be_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Uuid::from_bytes(bytes)
    }

    /// Creates a pending task in the given wave slot.
    pub fn new(job_id: Uuid, stage: Stage, role: Role, wave_index: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Self::derive_id(job_id, stage, role, wave_index),
            job_id,
            role,
            task_type: role.as_str().to_string(),
            stage,
            status: TaskStatus::Pending,
            priority: stage.ordinal(),
            dependencies: Vec::new(),
            input: serde_json::Value::Null,
            output: None,
            error: None,
            lease: None,
            attempt: 0,
            max_attempts: 3,
            deadline_seconds: 600,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the dependency task ids.
    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Sets the input payload.
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    /// Overrides the queue priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Overrides the retry budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Overrides the per-attempt deadline.
    pub fn with_deadline_seconds(mut self, deadline_seconds: u64) -> Self {
        self.deadline_seconds = deadline_seconds;
        self
    }

    /// Whether all dependencies appear in `succeeded_ids` and the task is
    /// still waiting to be queued.
    pub fn is_ready(&self, succeeded_ids: &[Uuid]) -> bool {
        self.status == TaskStatus::Pending
            && self.dependencies.iter().all(|d| succeeded_ids.contains(d))
    }
}
