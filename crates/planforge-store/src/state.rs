use async_trait::async_trait;
use chrono::{DateTime, Utc};
use planforge_core::{
    Artifact, ArtifactKind, Event, Job, JobStatus, ModuleEntry, PlanforgeResult, Role,
    SkillAllowlist, Stage, Task, TruthRecord,
};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// The transactional operation surface of the State Store.
///
/// Ownership of fields follows the component split: the Orchestrator drives
/// job transitions, the Dispatcher drives `queued ⇄ claimed`, workers drive
/// `claimed → running → succeeded | failed`. Every conditional operation
/// returns `Conflict` when the expectation does not hold, which is how
/// concurrent instances coordinate without leader election.
#[async_trait]
pub trait StateStore: Send + Sync {
    // --- Jobs ---

    /// Inserts a new job. Fails with `Conflict` if the project id already
    /// has an active (non-terminal) job.
    async fn insert_job(&self, job: &Job) -> PlanforgeResult<()>;

    /// Fetches a job by id.
    async fn get_job(&self, job_id: Uuid) -> PlanforgeResult<Job>;

    /// Lists jobs, newest first, optionally filtered by status.
    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize)
        -> PlanforgeResult<Vec<Job>>;

    /// Conditionally moves a job from `(expect_status, expect_stage)` to
    /// `(next_status, next_stage)`. Fails with `Conflict` when stale.
    async fn transition_job(
        &self,
        job_id: Uuid,
        expect: (JobStatus, Stage),
        next: (JobStatus, Stage),
    ) -> PlanforgeResult<Job>;

    /// Merges entries into the job's metadata map.
    async fn update_job_metadata(
        &self,
        job_id: Uuid,
        entries: HashMap<String, serde_json::Value>,
    ) -> PlanforgeResult<Job>;

    /// Resets a failed job for restart in one transaction: deletes its
    /// tasks, artifacts, and truth record, strips failure metadata, and
    /// returns the job to `queued`/`initialization`. Fails with `NotFailed`
    /// if the job has not failed. The event log is preserved.
    async fn reset_failed_job(&self, job_id: Uuid) -> PlanforgeResult<Job>;

    /// Removes a job and all of its records in one cascade.
    async fn delete_job(&self, job_id: Uuid) -> PlanforgeResult<()>;

    // --- Tasks ---

    /// Inserts a task unless a task with the same id already exists.
    /// Returns `false` for the duplicate case, which is how idempotent wave
    /// regeneration detects already-materialized slots.
    async fn insert_task(&self, task: &Task) -> PlanforgeResult<bool>;

    /// Fetches a task by id.
    async fn get_task(&self, task_id: Uuid) -> PlanforgeResult<Task>;

    /// All tasks of a job, in creation order.
    async fn tasks_for_job(&self, job_id: Uuid) -> PlanforgeResult<Vec<Task>>;

    /// Moves an eligible task `pending → queued`.
    async fn mark_task_queued(&self, task_id: Uuid) -> PlanforgeResult<Task>;

    /// Atomically claims a queued task for a worker, recording the lease
    /// and incrementing the attempt counter. Fails with `Conflict` when the
    /// task is not `queued` (someone else claimed it, or it was cancelled).
    async fn claim_task(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        lease: Duration,
    ) -> PlanforgeResult<Task>;

    /// Moves a claimed task to `running`. Guarded by the claiming worker.
    async fn start_task(&self, task_id: Uuid, worker_id: Uuid) -> PlanforgeResult<Task>;

    /// Extends the leases this worker holds on the given tasks. Returns how
    /// many were renewed; tasks the worker no longer holds are skipped.
    async fn renew_leases(
        &self,
        worker_id: Uuid,
        task_ids: &[Uuid],
        lease: Duration,
    ) -> PlanforgeResult<usize>;

    /// Completes a task with its output payload. Guarded by the claiming
    /// worker; fails with `Conflict` if the task was cancelled or reclaimed
    /// in the meantime, in which case the caller discards the result.
    async fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        output: serde_json::Value,
    ) -> PlanforgeResult<Task>;

    /// Terminally fails a task, recording the error string.
    async fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        error: &str,
    ) -> PlanforgeResult<Task>;

    /// Returns a claimed or running task to `queued` for another attempt,
    /// recording the error that caused the retry.
    async fn requeue_task(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        error: &str,
    ) -> PlanforgeResult<Task>;

    /// Releases every claim whose lease expired before `now`, returning the
    /// affected tasks (already back in `queued`, attempt preserved).
    async fn release_expired_leases(&self, now: DateTime<Utc>) -> PlanforgeResult<Vec<Task>>;

    /// Marks every non-terminal task of a job `cancelled` in one
    /// transaction, returning the affected task ids.
    async fn cancel_tasks_for_job(&self, job_id: Uuid) -> PlanforgeResult<Vec<Uuid>>;

    // --- Artifacts ---

    /// Stores an artifact, addressed by its content hash. Idempotent: a put
    /// of already-stored content returns the existing hash and stores
    /// nothing. Returns `(hash, newly_stored)`.
    async fn put_artifact(&self, artifact: Artifact) -> PlanforgeResult<(String, bool)>;

    /// Fetches an artifact by content hash.
    async fn get_artifact(&self, hash: &str) -> PlanforgeResult<Artifact>;

    /// The most recently produced artifact of a kind for a job.
    async fn artifact_for_job(
        &self,
        job_id: Uuid,
        kind: ArtifactKind,
    ) -> PlanforgeResult<Artifact>;

    /// All artifacts of a job, in creation order.
    async fn artifacts_for_job(&self, job_id: Uuid) -> PlanforgeResult<Vec<Artifact>>;

    // --- Truth records ---

    /// Writes the job truth record, advances the job, and appends the
    /// approval event in a single transaction. `expect` guards the job CAS
    /// exactly like [`StateStore::transition_job`].
    async fn write_truth(
        &self,
        record: TruthRecord,
        expect: (JobStatus, Stage),
        next: (JobStatus, Stage),
        event: Event,
    ) -> PlanforgeResult<(Job, Event)>;

    /// The current truth record of a job, if approved.
    async fn get_truth(&self, job_id: Uuid) -> PlanforgeResult<Option<TruthRecord>>;

    // --- Events ---

    /// Appends an event, assigning the next per-job sequence number.
    /// Returns the stored event with `seq` set.
    async fn append_event(&self, event: Event) -> PlanforgeResult<Event>;

    /// Paged history read: events of a job with `seq >= from_seq`, ordered
    /// by sequence, at most `limit`.
    async fn events_for_job(
        &self,
        job_id: Uuid,
        from_seq: u64,
        limit: usize,
    ) -> PlanforgeResult<Vec<Event>>;

    // --- Module catalog & allowlists ---

    /// Creates or replaces a module catalog entry.
    async fn upsert_module(&self, entry: ModuleEntry) -> PlanforgeResult<()>;

    /// All module catalog entries, ordered by id.
    async fn list_modules(&self) -> PlanforgeResult<Vec<ModuleEntry>>;

    /// The skill allowlist for a role, if configured.
    async fn get_allowlist(&self, role: Role) -> PlanforgeResult<Option<SkillAllowlist>>;

    /// Sets the skill allowlist for a role.
    async fn set_allowlist(&self, allowlist: SkillAllowlist) -> PlanforgeResult<()>;
}
