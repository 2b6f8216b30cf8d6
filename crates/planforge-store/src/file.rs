use crate::memory::MemoryStateStore;
use crate::state::StateStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use planforge_core::{
    Artifact, ArtifactKind, Event, Job, JobStatus, ModuleEntry, PlanforgeError, PlanforgeResult,
    Role, SkillAllowlist, Stage, Task, TruthRecord,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

const JOBS_DIR: &str = "jobs";
const TASKS_DIR: &str = "tasks";
const ARTIFACTS_DIR: &str = "artifacts";
const TRUTH_DIR: &str = "truth";
const EVENTS_DIR: &str = "events";
const MODULES_FILE: &str = "modules.json";
const ALLOWLISTS_FILE: &str = "allowlists.json";

/// File-backed State Store: the in-memory semantics with write-through JSON
/// persistence under a data directory, reloaded on startup.
///
/// One file per entity (events as per-job JSONL append logs), mirroring the
/// persisted-state layout of §6: jobs, tasks, artifacts, events, job truth,
/// module catalog, and skill allowlists.
pub struct FileStateStore {
    mem: MemoryStateStore,
    dir: PathBuf,
}

impl FileStateStore {
    /// Opens the store, creating the directory tree and loading any
    /// previously persisted state.
    pub async fn open(dir: impl Into<PathBuf>) -> PlanforgeResult<Self> {
        let dir = dir.into();
        for sub in [JOBS_DIR, TASKS_DIR, ARTIFACTS_DIR, TRUTH_DIR, EVENTS_DIR] {
            tokio::fs::create_dir_all(dir.join(sub)).await?;
        }
        let store = Self {
            mem: MemoryStateStore::new(),
            dir,
        };
        store.load().await?;
        Ok(store)
    }

    async fn load(&self) -> PlanforgeResult<()> {
        let mut inner = self.mem.inner.write().await;

        for job in read_dir_json::<Job>(&self.dir.join(JOBS_DIR)).await? {
            inner.jobs.insert(job.id, job);
        }
        for task in read_dir_json::<Task>(&self.dir.join(TASKS_DIR)).await? {
            inner.tasks.insert(task.id, task);
        }
        for artifact in read_dir_json::<Artifact>(&self.dir.join(ARTIFACTS_DIR)).await? {
            inner.artifacts.insert(artifact.hash.clone(), artifact);
        }
        for record in read_dir_json::<TruthRecord>(&self.dir.join(TRUTH_DIR)).await? {
            inner.truth.insert(record.job_id, record);
        }

        let mut entries = tokio::fs::read_dir(self.dir.join(EVENTS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let data = tokio::fs::read_to_string(entry.path()).await?;
            let mut log: Vec<Event> = Vec::new();
            for line in data.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str(line) {
                    Ok(event) => log.push(event),
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "Skipping corrupt event line"),
                }
            }
            if let Some(first) = log.first() {
                let job_id = first.job_id;
                log.sort_by_key(|e| e.seq);
                inner.events.insert(job_id, log);
            }
        }

        if let Some(modules) =
            read_json_file::<Vec<ModuleEntry>>(&self.dir.join(MODULES_FILE)).await?
        {
            inner.modules = modules.into_iter().map(|m| (m.id.clone(), m)).collect();
        }
        if let Some(allowlists) =
            read_json_file::<Vec<SkillAllowlist>>(&self.dir.join(ALLOWLISTS_FILE)).await?
        {
            inner.allowlists = allowlists.into_iter().map(|a| (a.role, a)).collect();
        }
        Ok(())
    }

    fn job_path(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(JOBS_DIR).join(format!("{job_id}.json"))
    }

    fn task_path(&self, task_id: Uuid) -> PathBuf {
        self.dir.join(TASKS_DIR).join(format!("{task_id}.json"))
    }

    fn artifact_path(&self, hash: &str) -> PathBuf {
        self.dir.join(ARTIFACTS_DIR).join(format!("{hash}.json"))
    }

    fn truth_path(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(TRUTH_DIR).join(format!("{job_id}.json"))
    }

    fn events_path(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(EVENTS_DIR).join(format!("{job_id}.jsonl"))
    }

    async fn save_job(&self, job: &Job) -> PlanforgeResult<()> {
        write_json_file(&self.job_path(job.id), job).await
    }

    async fn save_task(&self, task: &Task) -> PlanforgeResult<()> {
        write_json_file(&self.task_path(task.id), task).await
    }

    async fn append_event_line(&self, event: &Event) -> PlanforgeResult<()> {
        use tokio::io::AsyncWriteExt;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(event.job_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn save_modules(&self) -> PlanforgeResult<()> {
        let modules = self.mem.list_modules().await?;
        write_json_file(&self.dir.join(MODULES_FILE), &modules).await
    }

    async fn remove_job_files(&self, job_id: Uuid, tasks: &[Task], artifacts: &[Artifact]) {
        let _ = tokio::fs::remove_file(self.truth_path(job_id)).await;
        for task in tasks {
            let _ = tokio::fs::remove_file(self.task_path(task.id)).await;
        }
        for artifact in artifacts {
            let _ = tokio::fs::remove_file(self.artifact_path(&artifact.hash)).await;
        }
    }
}

async fn read_dir_json<T: serde::de::DeserializeOwned>(dir: &Path) -> PlanforgeResult<Vec<T>> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let data = tokio::fs::read_to_string(entry.path()).await?;
        match serde_json::from_str(&data) {
            Ok(value) => out.push(value),
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Skipping corrupt record"),
        }
    }
    Ok(out)
}

async fn read_json_file<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> PlanforgeResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = tokio::fs::read_to_string(path).await?;
    Ok(Some(serde_json::from_str(&data).map_err(|e| {
        PlanforgeError::FatalBackend(format!("corrupt store file {}: {e}", path.display()))
    })?))
}

async fn write_json_file<T: serde::Serialize>(path: &Path, value: &T) -> PlanforgeResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn insert_job(&self, job: &Job) -> PlanforgeResult<()> {
        self.mem.insert_job(job).await?;
        self.save_job(job).await
    }

    async fn get_job(&self, job_id: Uuid) -> PlanforgeResult<Job> {
        self.mem.get_job(job_id).await
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> PlanforgeResult<Vec<Job>> {
        self.mem.list_jobs(status, limit).await
    }

    async fn transition_job(
        &self,
        job_id: Uuid,
        expect: (JobStatus, Stage),
        next: (JobStatus, Stage),
    ) -> PlanforgeResult<Job> {
        let job = self.mem.transition_job(job_id, expect, next).await?;
        self.save_job(&job).await?;
        Ok(job)
    }

    async fn update_job_metadata(
        &self,
        job_id: Uuid,
        entries: HashMap<String, serde_json::Value>,
    ) -> PlanforgeResult<Job> {
        let job = self.mem.update_job_metadata(job_id, entries).await?;
        self.save_job(&job).await?;
        Ok(job)
    }

    async fn reset_failed_job(&self, job_id: Uuid) -> PlanforgeResult<Job> {
        let tasks = self.mem.tasks_for_job(job_id).await?;
        let artifacts = self.mem.artifacts_for_job(job_id).await?;
        let job = self.mem.reset_failed_job(job_id).await?;
        self.remove_job_files(job_id, &tasks, &artifacts).await;
        self.save_job(&job).await?;
        Ok(job)
    }

    async fn delete_job(&self, job_id: Uuid) -> PlanforgeResult<()> {
        let tasks = self.mem.tasks_for_job(job_id).await?;
        let artifacts = self.mem.artifacts_for_job(job_id).await?;
        self.mem.delete_job(job_id).await?;
        self.remove_job_files(job_id, &tasks, &artifacts).await;
        let _ = tokio::fs::remove_file(self.job_path(job_id)).await;
        let _ = tokio::fs::remove_file(self.events_path(job_id)).await;
        Ok(())
    }

    async fn insert_task(&self, task: &Task) -> PlanforgeResult<bool> {
        let inserted = self.mem.insert_task(task).await?;
        if inserted {
            self.save_task(task).await?;
        }
        Ok(inserted)
    }

    async fn get_task(&self, task_id: Uuid) -> PlanforgeResult<Task> {
        self.mem.get_task(task_id).await
    }

    async fn tasks_for_job(&self, job_id: Uuid) -> PlanforgeResult<Vec<Task>> {
        self.mem.tasks_for_job(job_id).await
    }

    async fn mark_task_queued(&self, task_id: Uuid) -> PlanforgeResult<Task> {
        let task = self.mem.mark_task_queued(task_id).await?;
        self.save_task(&task).await?;
        Ok(task)
    }

    async fn claim_task(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        lease: Duration,
    ) -> PlanforgeResult<Task> {
        let task = self.mem.claim_task(task_id, worker_id, lease).await?;
        self.save_task(&task).await?;
        Ok(task)
    }

    async fn start_task(&self, task_id: Uuid, worker_id: Uuid) -> PlanforgeResult<Task> {
        let task = self.mem.start_task(task_id, worker_id).await?;
        self.save_task(&task).await?;
        Ok(task)
    }

    async fn renew_leases(
        &self,
        worker_id: Uuid,
        task_ids: &[Uuid],
        lease: Duration,
    ) -> PlanforgeResult<usize> {
        let renewed = self.mem.renew_leases(worker_id, task_ids, lease).await?;
        for task_id in task_ids {
            if let Ok(task) = self.mem.get_task(*task_id).await {
                self.save_task(&task).await?;
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
        let task = self.mem.complete_task(task_id, worker_id, output).await?;
        self.save_task(&task).await?;
        Ok(task)
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        error: &str,
    ) -> PlanforgeResult<Task> {
        let task = self.mem.fail_task(task_id, worker_id, error).await?;
        self.save_task(&task).await?;
        Ok(task)
    }

    async fn requeue_task(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        error: &str,
    ) -> PlanforgeResult<Task> {
        let task = self.mem.requeue_task(task_id, worker_id, error).await?;
        self.save_task(&task).await?;
        Ok(task)
    }

    async fn release_expired_leases(&self, now: DateTime<Utc>) -> PlanforgeResult<Vec<Task>> {
        let released = self.mem.release_expired_leases(now).await?;
        for task in &released {
            self.save_task(task).await?;
        }
        Ok(released)
    }

    async fn cancel_tasks_for_job(&self, job_id: Uuid) -> PlanforgeResult<Vec<Uuid>> {
        let cancelled = self.mem.cancel_tasks_for_job(job_id).await?;
        for task_id in &cancelled {
            if let Ok(task) = self.mem.get_task(*task_id).await {
                self.save_task(&task).await?;
            }
        }
        Ok(cancelled)
    }

    async fn put_artifact(&self, artifact: Artifact) -> PlanforgeResult<(String, bool)> {
        let saved = artifact.clone();
        let (hash, stored) = self.mem.put_artifact(artifact).await?;
        if stored {
            write_json_file(&self.artifact_path(&hash), &saved).await?;
        }
        Ok((hash, stored))
    }

    async fn get_artifact(&self, hash: &str) -> PlanforgeResult<Artifact> {
        self.mem.get_artifact(hash).await
    }

    async fn artifact_for_job(
        &self,
        job_id: Uuid,
        kind: ArtifactKind,
    ) -> PlanforgeResult<Artifact> {
        self.mem.artifact_for_job(job_id, kind).await
    }

    async fn artifacts_for_job(&self, job_id: Uuid) -> PlanforgeResult<Vec<Artifact>> {
        self.mem.artifacts_for_job(job_id).await
    }

    async fn write_truth(
        &self,
        record: TruthRecord,
        expect: (JobStatus, Stage),
        next: (JobStatus, Stage),
        event: Event,
    ) -> PlanforgeResult<(Job, Event)> {
        let saved = record.clone();
        let (job, event) = self.mem.write_truth(record, expect, next, event).await?;
        write_json_file(&self.truth_path(job.id), &saved).await?;
        self.save_job(&job).await?;
        self.append_event_line(&event).await?;
        Ok((job, event))
    }

    async fn get_truth(&self, job_id: Uuid) -> PlanforgeResult<Option<TruthRecord>> {
        self.mem.get_truth(job_id).await
    }

    async fn append_event(&self, event: Event) -> PlanforgeResult<Event> {
        let event = self.mem.append_event(event).await?;
        self.append_event_line(&event).await?;
        Ok(event)
    }

    async fn events_for_job(
        &self,
        job_id: Uuid,
        from_seq: u64,
        limit: usize,
    ) -> PlanforgeResult<Vec<Event>> {
        self.mem.events_for_job(job_id, from_seq, limit).await
    }

    async fn upsert_module(&self, entry: ModuleEntry) -> PlanforgeResult<()> {
        self.mem.upsert_module(entry).await?;
        self.save_modules().await
    }

    async fn list_modules(&self) -> PlanforgeResult<Vec<ModuleEntry>> {
        self.mem.list_modules().await
    }

    async fn get_allowlist(&self, role: Role) -> PlanforgeResult<Option<SkillAllowlist>> {
        self.mem.get_allowlist(role).await
    }

    async fn set_allowlist(&self, allowlist: SkillAllowlist) -> PlanforgeResult<()> {
        self.mem.set_allowlist(allowlist).await?;
        let mut lists = Vec::new();
        for role in Role::ALL {
            if let Some(list) = self.mem.get_allowlist(role).await? {
                lists.push(list);
            }
        }
        write_json_file(&self.dir.join(ALLOWLISTS_FILE), &lists).await
    }
}
