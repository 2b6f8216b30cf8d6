use crate::state::StateStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use planforge_core::{
    job, Artifact, ArtifactKind, ClaimLease, Event, Job, JobStatus, ModuleEntry, PlanforgeError,
    PlanforgeResult, Role, SkillAllowlist, Stage, Task, TaskStatus, TruthRecord,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub(crate) struct Collections {
    pub(crate) jobs: HashMap<Uuid, Job>,
    pub(crate) tasks: HashMap<Uuid, Task>,
    pub(crate) artifacts: HashMap<String, Artifact>,
    pub(crate) truth: HashMap<Uuid, TruthRecord>,
    pub(crate) events: HashMap<Uuid, Vec<Event>>,
    pub(crate) modules: HashMap<String, ModuleEntry>,
    pub(crate) allowlists: HashMap<Role, SkillAllowlist>,
}

/// In-memory State Store.
///
/// One coarse `RwLock` over all collections gives every multi-entity
/// operation (truth-record write, bulk cancel, cascade delete) transactional
/// semantics for free.
pub struct MemoryStateStore {
    pub(crate) inner: RwLock<Collections>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Collections::default()),
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn transition_task_status(task: &mut Task, next: TaskStatus) -> PlanforgeResult<()> {
    if !task.status.can_transition_to(next) {
        return Err(PlanforgeError::Conflict(format!(
            "task {} cannot move {} -> {}",
            task.id, task.status, next
        )));
    }
    task.status = next;
    task.updated_at = Utc::now();
    Ok(())
}

fn worker_guard(task: &Task, worker_id: Uuid) -> PlanforgeResult<()> {
    match &task.lease {
        Some(lease) if lease.worker_id == worker_id => Ok(()),
        Some(lease) => Err(PlanforgeError::Conflict(format!(
            "task {} is held by worker {}, not {}",
            task.id, lease.worker_id, worker_id
        ))),
        None => Err(PlanforgeError::Conflict(format!(
            "task {} has no active claim",
            task.id
        ))),
    }
}

impl Collections {
    fn job_mut(&mut self, job_id: Uuid) -> PlanforgeResult<&mut Job> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| PlanforgeError::NotFound(format!("job {job_id}")))
    }

    fn task_mut(&mut self, task_id: Uuid) -> PlanforgeResult<&mut Task> {
        self.tasks
            .get_mut(&task_id)
            .ok_or_else(|| PlanforgeError::NotFound(format!("task {task_id}")))
    }

    pub(crate) fn transition_job(
        &mut self,
        job_id: Uuid,
        expect: (JobStatus, Stage),
        next: (JobStatus, Stage),
    ) -> PlanforgeResult<Job> {
        let job = self.job_mut(job_id)?;
        if job.status != expect.0 || job.stage != expect.1 {
            return Err(PlanforgeError::Conflict(format!(
                "job {} is at ({}, {}), expected ({}, {})",
                job_id, job.status, job.stage, expect.0, expect.1
            )));
        }
        job.status = next.0;
        job.stage = next.1;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    pub(crate) fn append_event(&mut self, mut event: Event) -> PlanforgeResult<Event> {
        let log = self.events.entry(event.job_id).or_default();
        event.seq = log.last().map(|e| e.seq).unwrap_or(0) + 1;
        log.push(event.clone());
        Ok(event)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn insert_job(&self, job: &Job) -> PlanforgeResult<()> {
        let mut inner = self.inner.write().await;
        let active = inner
            .jobs
            .values()
            .any(|j| j.project_id == job.project_id && j.is_active());
        if active {
            return Err(PlanforgeError::Conflict(format!(
                "project '{}' already has an active job",
                job.project_id
            )));
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> PlanforgeResult<Job> {
        let inner = self.inner.read().await;
        inner
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| PlanforgeError::NotFound(format!("job {job_id}")))
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> PlanforgeResult<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn transition_job(
        &self,
        job_id: Uuid,
        expect: (JobStatus, Stage),
        next: (JobStatus, Stage),
    ) -> PlanforgeResult<Job> {
        let mut inner = self.inner.write().await;
        inner.transition_job(job_id, expect, next)
    }

    async fn update_job_metadata(
        &self,
        job_id: Uuid,
        entries: HashMap<String, serde_json::Value>,
    ) -> PlanforgeResult<Job> {
        let mut inner = self.inner.write().await;
        let job = inner.job_mut(job_id)?;
        job.metadata.extend(entries);
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn reset_failed_job(&self, job_id: Uuid) -> PlanforgeResult<Job> {
        let mut inner = self.inner.write().await;
        let job = inner.job_mut(job_id)?;
        if job.status != JobStatus::Failed {
            return Err(PlanforgeError::NotFailed(format!(
                "job {} is {}, restart requires failed",
                job_id, job.status
            )));
        }
        job.status = JobStatus::Queued;
        job.stage = Stage::Initialization;
        job.metadata.remove(job::META_FAILED_STAGE);
        job.metadata.remove(job::META_FAILED_REASON);
        job.metadata.remove(job::META_PRD_REVISION);
        job.metadata.remove(job::META_PRD_FEEDBACK);
        job.updated_at = Utc::now();
        let job = job.clone();
        inner.tasks.retain(|_, t| t.job_id != job_id);
        inner.artifacts.retain(|_, a| a.job_id != job_id);
        inner.truth.remove(&job_id);
        Ok(job)
    }

    async fn delete_job(&self, job_id: Uuid) -> PlanforgeResult<()> {
        let mut inner = self.inner.write().await;
        if inner.jobs.remove(&job_id).is_none() {
            return Err(PlanforgeError::NotFound(format!("job {job_id}")));
        }
        inner.tasks.retain(|_, t| t.job_id != job_id);
        inner.artifacts.retain(|_, a| a.job_id != job_id);
        inner.truth.remove(&job_id);
        inner.events.remove(&job_id);
        Ok(())
    }

    async fn insert_task(&self, task: &Task) -> PlanforgeResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(&task.id) {
            return Ok(false);
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(true)
    }

    async fn get_task(&self, task_id: Uuid) -> PlanforgeResult<Task> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| PlanforgeError::NotFound(format!("task {task_id}")))
    }

    async fn tasks_for_job(&self, job_id: Uuid) -> PlanforgeResult<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn mark_task_queued(&self, task_id: Uuid) -> PlanforgeResult<Task> {
        let mut inner = self.inner.write().await;
        let task = inner.task_mut(task_id)?;
        transition_task_status(task, TaskStatus::Queued)?;
        Ok(task.clone())
    }

    async fn claim_task(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        lease: Duration,
    ) -> PlanforgeResult<Task> {
        let mut inner = self.inner.write().await;
        let task = inner.task_mut(task_id)?;
        if task.status != TaskStatus::Queued {
            return Err(PlanforgeError::Conflict(format!(
                "task {} is {}, not queued",
                task_id, task.status
            )));
        }
        transition_task_status(task, TaskStatus::Claimed)?;
        task.lease = Some(ClaimLease {
            worker_id,
            expires_at: Utc::now()
                + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(30)),
        });
        task.attempt += 1;
        Ok(task.clone())
    }

    async fn start_task(&self, task_id: Uuid, worker_id: Uuid) -> PlanforgeResult<Task> {
        let mut inner = self.inner.write().await;
        let task = inner.task_mut(task_id)?;
        worker_guard(task, worker_id)?;
        transition_task_status(task, TaskStatus::Running)?;
        Ok(task.clone())
    }

    async fn renew_leases(
        &self,
        worker_id: Uuid,
        task_ids: &[Uuid],
        lease: Duration,
    ) -> PlanforgeResult<usize> {
        let mut inner = self.inner.write().await;
        let mut renewed = 0;
        let extend =
            chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(30));
        for task_id in task_ids {
            if let Some(task) = inner.tasks.get_mut(task_id) {
                if matches!(task.status, TaskStatus::Claimed | TaskStatus::Running) {
                    if let Some(l) = &mut task.lease {
                        if l.worker_id == worker_id {
                            l.expires_at = Utc::now() + extend;
                            renewed += 1;
                        }
                    }
                }
            }
        }
        Ok(renewed)
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        output: serde_json::Value,
    ) -> PlanforgeResult<Task> {
        if output.is_null() {
            return Err(PlanforgeError::FatalBackend(format!(
                "task {task_id} completion without an output payload"
            )));
        }
        let mut inner = self.inner.write().await;
        let task = inner.task_mut(task_id)?;
        worker_guard(task, worker_id)?;
        transition_task_status(task, TaskStatus::Succeeded)?;
        task.output = Some(output);
        task.error = None;
        task.lease = None;
        Ok(task.clone())
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        error: &str,
    ) -> PlanforgeResult<Task> {
        let mut inner = self.inner.write().await;
        let task = inner.task_mut(task_id)?;
        worker_guard(task, worker_id)?;
        transition_task_status(task, TaskStatus::Failed)?;
        task.error = Some(error.to_string());
        task.lease = None;
        Ok(task.clone())
    }

    async fn requeue_task(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        error: &str,
    ) -> PlanforgeResult<Task> {
        let mut inner = self.inner.write().await;
        let task = inner.task_mut(task_id)?;
        worker_guard(task, worker_id)?;
        transition_task_status(task, TaskStatus::Queued)?;
        task.error = Some(error.to_string());
        task.lease = None;
        Ok(task.clone())
    }

    async fn release_expired_leases(&self, now: DateTime<Utc>) -> PlanforgeResult<Vec<Task>> {
        let mut inner = self.inner.write().await;
        let expired: Vec<Uuid> = inner
            .tasks
            .values()
            .filter(|t| {
                matches!(t.status, TaskStatus::Claimed | TaskStatus::Running)
                    && t.lease.as_ref().is_some_and(|l| l.is_expired(now))
            })
            .map(|t| t.id)
            .collect();
        let mut released = Vec::with_capacity(expired.len());
        for task_id in expired {
            let task = inner.task_mut(task_id)?;
            transition_task_status(task, TaskStatus::Queued)?;
            task.lease = None;
            released.push(task.clone());
        }
        Ok(released)
    }

    async fn cancel_tasks_for_job(&self, job_id: Uuid) -> PlanforgeResult<Vec<Uuid>> {
        let mut inner = self.inner.write().await;
        let mut cancelled = Vec::new();
        for task in inner.tasks.values_mut() {
            if task.job_id == job_id && !task.status.is_terminal() {
                task.status = TaskStatus::Cancelled;
                task.lease = None;
                task.updated_at = Utc::now();
                cancelled.push(task.id);
            }
        }
        Ok(cancelled)
    }

    async fn put_artifact(&self, artifact: Artifact) -> PlanforgeResult<(String, bool)> {
        let mut inner = self.inner.write().await;
        let hash = artifact.hash.clone();
        if inner.artifacts.contains_key(&hash) {
            return Ok((hash, false));
        }
        inner.artifacts.insert(hash.clone(), artifact);
        Ok((hash, true))
    }

    async fn get_artifact(&self, hash: &str) -> PlanforgeResult<Artifact> {
        let inner = self.inner.read().await;
        inner
            .artifacts
            .get(hash)
            .cloned()
            .ok_or_else(|| PlanforgeError::NotFound(format!("artifact {hash}")))
    }

    async fn artifact_for_job(
        &self,
        job_id: Uuid,
        kind: ArtifactKind,
    ) -> PlanforgeResult<Artifact> {
        let inner = self.inner.read().await;
        inner
            .artifacts
            .values()
            .filter(|a| a.job_id == job_id && a.kind == kind)
            .max_by_key(|a| a.created_at)
            .cloned()
            .ok_or_else(|| {
                PlanforgeError::NotFound(format!("artifact {kind} for job {job_id}"))
            })
    }

    async fn artifacts_for_job(&self, job_id: Uuid) -> PlanforgeResult<Vec<Artifact>> {
        let inner = self.inner.read().await;
        let mut artifacts: Vec<Artifact> = inner
            .artifacts
            .values()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect();
        artifacts.sort_by_key(|a| a.created_at);
        Ok(artifacts)
    }

    async fn write_truth(
        &self,
        record: TruthRecord,
        expect: (JobStatus, Stage),
        next: (JobStatus, Stage),
        event: Event,
    ) -> PlanforgeResult<(Job, Event)> {
        let mut inner = self.inner.write().await;
        let job = inner.transition_job(record.job_id, expect, next)?;
        inner.truth.insert(record.job_id, record);
        let event = inner.append_event(event)?;
        Ok((job, event))
    }

    async fn get_truth(&self, job_id: Uuid) -> PlanforgeResult<Option<TruthRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.truth.get(&job_id).cloned())
    }

    async fn append_event(&self, event: Event) -> PlanforgeResult<Event> {
        let mut inner = self.inner.write().await;
        inner.append_event(event)
    }

    async fn events_for_job(
        &self,
        job_id: Uuid,
        from_seq: u64,
        limit: usize,
    ) -> PlanforgeResult<Vec<Event>> {
        let inner = self.inner.read().await;
        let events = inner
            .events
            .get(&job_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.seq >= from_seq)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(events)
    }

    async fn upsert_module(&self, entry: ModuleEntry) -> PlanforgeResult<()> {
        let mut inner = self.inner.write().await;
        inner.modules.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn list_modules(&self) -> PlanforgeResult<Vec<ModuleEntry>> {
        let inner = self.inner.read().await;
        let mut modules: Vec<ModuleEntry> = inner.modules.values().cloned().collect();
        modules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(modules)
    }

    async fn get_allowlist(&self, role: Role) -> PlanforgeResult<Option<SkillAllowlist>> {
        let inner = self.inner.read().await;
        Ok(inner.allowlists.get(&role).cloned())
    }

    async fn set_allowlist(&self, allowlist: SkillAllowlist) -> PlanforgeResult<()> {
        let mut inner = self.inner.write().await;
        inner.allowlists.insert(allowlist.role, allowlist);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use planforge_core::{content_hash, EventKind};
    use std::collections::HashMap as StdHashMap;

    fn store() -> MemoryStateStore {
        MemoryStateStore::new()
    }

    fn sample_job(project: &str) -> Job {
        Job::new(project, "Build a URL shortener with analytics", StdHashMap::new())
    }

    fn sample_task(job_id: Uuid) -> Task {
        Task::new(job_id, Stage::PrdGeneration, Role::Prd, 0)
    }

    #[tokio::test]
    async fn test_insert_job_rejects_second_active_for_project() {
        let store = store();
        let a = sample_job("p2");
        store.insert_job(&a).await.unwrap();

        let b = sample_job("p2");
        let err = store.insert_job(&b).await.unwrap_err();
        assert!(matches!(err, PlanforgeError::Conflict(_)));

        // Terminal job frees the project id.
        store
            .transition_job(
                a.id,
                (JobStatus::Queued, Stage::Initialization),
                (JobStatus::Failed, Stage::Failed),
            )
            .await
            .unwrap();
        store.insert_job(&sample_job("p2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_transition_job_cas_detects_staleness() {
        let store = store();
        let job = sample_job("p1");
        store.insert_job(&job).await.unwrap();

        store
            .transition_job(
                job.id,
                (JobStatus::Queued, Stage::Initialization),
                (JobStatus::InProgress, Stage::PrdGeneration),
            )
            .await
            .unwrap();

        // Same expectation again is stale now.
        let err = store
            .transition_job(
                job.id,
                (JobStatus::Queued, Stage::Initialization),
                (JobStatus::InProgress, Stage::PrdGeneration),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PlanforgeError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = store();
        let job = sample_job("p1");
        store.insert_job(&job).await.unwrap();
        let task = sample_task(job.id);
        store.insert_task(&task).await.unwrap();
        store.mark_task_queued(task.id).await.unwrap();

        let w1 = Uuid::new_v4();
        let w2 = Uuid::new_v4();
        let claimed = store
            .claim_task(task.id, w1, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(claimed.status, TaskStatus::Claimed);
        assert_eq!(claimed.attempt, 1);

        let err = store
            .claim_task(task.id, w2, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, PlanforgeError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_complete_requires_claiming_worker() {
        let store = store();
        let job = sample_job("p1");
        store.insert_job(&job).await.unwrap();
        let task = sample_task(job.id);
        store.insert_task(&task).await.unwrap();
        store.mark_task_queued(task.id).await.unwrap();

        let w1 = Uuid::new_v4();
        store
            .claim_task(task.id, w1, Duration::from_secs(30))
            .await
            .unwrap();
        store.start_task(task.id, w1).await.unwrap();

        let err = store
            .complete_task(task.id, Uuid::new_v4(), serde_json::json!({"ok": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, PlanforgeError::Conflict(_)));

        let done = store
            .complete_task(task.id, w1, serde_json::json!({"ok": true}))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert!(done.output.is_some());
    }

    #[tokio::test]
    async fn test_succeeded_requires_output() {
        let store = store();
        let job = sample_job("p1");
        store.insert_job(&job).await.unwrap();
        let task = sample_task(job.id);
        store.insert_task(&task).await.unwrap();
        store.mark_task_queued(task.id).await.unwrap();
        let w = Uuid::new_v4();
        store.claim_task(task.id, w, Duration::from_secs(30)).await.unwrap();
        store.start_task(task.id, w).await.unwrap();

        let err = store
            .complete_task(task.id, w, serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, PlanforgeError::FatalBackend(_)));
    }

    #[tokio::test]
    async fn test_release_expired_leases_requeues() {
        let store = store();
        let job = sample_job("p1");
        store.insert_job(&job).await.unwrap();
        let task = sample_task(job.id);
        store.insert_task(&task).await.unwrap();
        store.mark_task_queued(task.id).await.unwrap();

        let w = Uuid::new_v4();
        store
            .claim_task(task.id, w, Duration::from_secs(0))
            .await
            .unwrap();

        let released = store
            .release_expired_leases(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].status, TaskStatus::Queued);
        assert!(released[0].lease.is_none());

        // Another worker can now claim; attempt counts the second claim.
        let reclaimed = store
            .claim_task(task.id, Uuid::new_v4(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(reclaimed.attempt, 2);
    }

    #[tokio::test]
    async fn test_cancel_tasks_skips_terminal() {
        let store = store();
        let job = sample_job("p1");
        store.insert_job(&job).await.unwrap();

        let done = sample_task(job.id);
        store.insert_task(&done).await.unwrap();
        store.mark_task_queued(done.id).await.unwrap();
        let w = Uuid::new_v4();
        store.claim_task(done.id, w, Duration::from_secs(30)).await.unwrap();
        store.start_task(done.id, w).await.unwrap();
        store
            .complete_task(done.id, w, serde_json::json!({"artifact": "x"}))
            .await
            .unwrap();

        let pending = Task::new(job.id, Stage::Planning, Role::Plan, 0);
        store.insert_task(&pending).await.unwrap();

        let cancelled = store.cancel_tasks_for_job(job.id).await.unwrap();
        assert_eq!(cancelled, vec![pending.id]);
        assert_eq!(
            store.get_task(done.id).await.unwrap().status,
            TaskStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_put_artifact_is_idempotent() {
        let store = store();
        let job_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        let content = serde_json::json!({"title": "PRD"});

        let a = Artifact::new(ArtifactKind::Prd, job_id, task_id, content.clone());
        let b = Artifact::new(ArtifactKind::Prd, job_id, task_id, content.clone());
        let (hash_a, stored_a) = store.put_artifact(a).await.unwrap();
        let (hash_b, stored_b) = store.put_artifact(b).await.unwrap();

        assert_eq!(hash_a, hash_b);
        assert_eq!(hash_a, content_hash(&content));
        assert!(stored_a);
        assert!(!stored_b);
        assert_eq!(store.artifacts_for_job(job_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_event_sequences_are_gap_free_per_job() {
        let store = store();
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();

        for _ in 0..3 {
            store
                .append_event(Event::new(job_a, EventKind::Heartbeat))
                .await
                .unwrap();
        }
        store
            .append_event(Event::new(job_b, EventKind::JobCreated))
            .await
            .unwrap();

        let log_a = store.events_for_job(job_a, 0, 100).await.unwrap();
        assert_eq!(log_a.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        let log_b = store.events_for_job(job_b, 0, 100).await.unwrap();
        assert_eq!(log_b[0].seq, 1);

        // Paged read from a mid-sequence number.
        let tail = store.events_for_job(job_a, 2, 100).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_write_truth_is_transactional() {
        let store = store();
        let job = sample_job("p1");
        store.insert_job(&job).await.unwrap();

        let record = TruthRecord {
            job_id: job.id,
            requirements_hash: "r".into(),
            prd_hash: "p".into(),
            prd_artifact_id: "p".into(),
            approved_at: Utc::now(),
            notes: None,
        };
        // Wrong expectation: nothing is written.
        let err = store
            .write_truth(
                record.clone(),
                (JobStatus::WaitingForApproval, Stage::WaitingForApproval),
                (JobStatus::Running, Stage::Planning),
                Event::new(job.id, EventKind::ApprovalGranted),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PlanforgeError::Conflict(_)));
        assert!(store.get_truth(job.id).await.unwrap().is_none());
        assert!(store.events_for_job(job.id, 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_failed_job_clears_derived_state() {
        let store = store();
        let mut job = sample_job("p1");
        job.status = JobStatus::Failed;
        job.stage = Stage::Failed;
        store.insert_job(&job).await.unwrap();

        let task = sample_task(job.id);
        store.insert_task(&task).await.unwrap();
        let artifact = Artifact::new(
            ArtifactKind::Prd,
            job.id,
            task.id,
            serde_json::json!({"title": "PRD"}),
        );
        store.put_artifact(artifact).await.unwrap();
        store
            .append_event(Event::new(job.id, EventKind::JobFailed))
            .await
            .unwrap();

        let reset = store.reset_failed_job(job.id).await.unwrap();
        assert_eq!(reset.status, JobStatus::Queued);
        assert_eq!(reset.stage, Stage::Initialization);
        assert!(store.tasks_for_job(job.id).await.unwrap().is_empty());
        assert!(store.artifacts_for_job(job.id).await.unwrap().is_empty());
        // Event history survives restart.
        assert_eq!(store.events_for_job(job.id, 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_rejected_unless_failed() {
        let store = store();
        let job = sample_job("p1");
        store.insert_job(&job).await.unwrap();
        let err = store.reset_failed_job(job.id).await.unwrap_err();
        assert!(matches!(err, PlanforgeError::NotFailed(_)));
    }

    #[tokio::test]
    async fn test_delete_job_cascades() {
        let store = store();
        let job = sample_job("p1");
        store.insert_job(&job).await.unwrap();
        let task = sample_task(job.id);
        store.insert_task(&task).await.unwrap();
        store
            .append_event(Event::new(job.id, EventKind::JobCreated))
            .await
            .unwrap();

        store.delete_job(job.id).await.unwrap();
        assert!(matches!(
            store.get_job(job.id).await.unwrap_err(),
            PlanforgeError::NotFound(_)
        ));
        assert!(store.tasks_for_job(job.id).await.unwrap().is_empty());
        assert!(store.events_for_job(job.id, 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_task_is_idempotent_by_id() {
        let store = store();
        let job = sample_job("p1");
        store.insert_job(&job).await.unwrap();
        let task = sample_task(job.id);
        assert!(store.insert_task(&task).await.unwrap());
        assert!(!store.insert_task(&task).await.unwrap());
    }

    #[tokio::test]
    async fn test_module_catalog_round_trip() {
        let store = store();
        store
            .upsert_module(ModuleEntry::new(
                "auth-core",
                "Authentication",
                vec!["oauth".into()],
                "1.0.0",
            ))
            .await
            .unwrap();
        store
            .upsert_module(ModuleEntry::new(
                "auth-core",
                "Authentication",
                vec!["oauth".into(), "sso".into()],
                "1.1.0",
            ))
            .await
            .unwrap();

        let modules = store.list_modules().await.unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].version, "1.1.0");
    }
}
