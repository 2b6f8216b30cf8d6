use crate::waves::generate_wave;
use chrono::Utc;
use planforge_core::{
    artifact, job, ArtifactKind, ConfigHandle, Event, EventKind, Job, JobStatus, Metrics,
    PlanforgeError, PlanforgeResult, Stage, TaskStatus, TruthRecord,
};
use planforge_dispatch::Dispatcher;
use planforge_events::{EventBus, SubscriberFilter};
use planforge_store::StateStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The workflow state machine.
///
/// Reacts to completion events from the bus, advances jobs stage by stage,
/// gates on human approval, and propagates terminal task failures. Handling
/// is serialized per job by a per-job advance lock; concurrency across jobs
/// is unbounded. All advance logic is idempotent — it keys on "all sibling
/// tasks succeeded" plus a CAS stage transition, so duplicate events and
/// concurrent instances are harmless.
pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    config: ConfigHandle,
    job_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    /// Creates the orchestrator over its collaborators.
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<EventBus>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<Metrics>,
        config: ConfigHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            dispatcher,
            metrics,
            config,
            job_locks: Mutex::new(HashMap::new()),
        })
    }

    async fn job_lock(&self, job_id: Uuid) -> PlanforgeResult<Arc<Mutex<()>>> {
        let lock = {
            let mut locks = self.job_locks.lock().await;
            locks.entry(job_id).or_default().clone()
        };
        Ok(lock)
    }

    /// Acquires the per-job advance lock, bounded by the configured timeout.
    async fn lock_job(&self, job_id: Uuid) -> PlanforgeResult<tokio::sync::OwnedMutexGuard<()>> {
        let lock = self.job_lock(job_id).await?;
        let timeout = Duration::from_secs(
            self.config
                .snapshot()
                .orchestrator
                .per_job_lock_timeout_seconds
                .max(1),
        );
        tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                PlanforgeError::TransientBackend(format!(
                    "advance lock for job {job_id} timed out"
                ))
            })
    }

    // --- Job intake ---

    /// Accepts a submission: creates the job, emits `job_created`, and
    /// immediately moves it into PRD generation.
    pub async fn create_job(
        &self,
        project_id: &str,
        requirements: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> PlanforgeResult<Job> {
        let min_len = self.config.snapshot().orchestrator.min_requirements_len;
        if project_id.trim().is_empty() {
            return Err(PlanforgeError::InvalidInput(
                "project_id must not be empty".to_string(),
            ));
        }
        if requirements.len() < min_len {
            return Err(PlanforgeError::InvalidInput(format!(
                "requirements must be at least {min_len} characters"
            )));
        }

        let job = Job::new(project_id, requirements, metadata);
        self.store.insert_job(&job).await?;
        Metrics::incr(&self.metrics.jobs_created);
        Metrics::gauge_add(&self.metrics.active_jobs, 1);

        self.bus
            .publish(
                Event::new(job.id, EventKind::JobCreated).with_payload(serde_json::json!({
                    "project_id": job.project_id,
                })),
            )
            .await?;

        info!(job_id = %job.id, project_id = %job.project_id, "Job created");
        self.begin(job).await
    }

    /// Moves a freshly created (or restarted) job into PRD generation and
    /// releases the initial wave.
    async fn begin(&self, job: Job) -> PlanforgeResult<Job> {
        let job = self
            .store
            .transition_job(
                job.id,
                (JobStatus::Queued, Stage::Initialization),
                (JobStatus::InProgress, Stage::PrdGeneration),
            )
            .await?;
        self.emit_stage_entered(&job, Stage::PrdGeneration).await?;
        self.release_wave(&job, Stage::PrdGeneration, true).await?;
        Ok(job)
    }

    /// Materializes a stage's wave and queues whatever is eligible.
    ///
    /// Insertion is idempotent (stable task ids), so regenerating after a
    /// duplicate event or a restart is safe. With `defer_on_backpressure`,
    /// tasks for saturated roles stay `pending`; the maintenance tick
    /// releases them once the queue drains.
    async fn release_wave(
        &self,
        job: &Job,
        stage: Stage,
        defer_on_backpressure: bool,
    ) -> PlanforgeResult<()> {
        let settings = self.config.snapshot().task.clone();
        for task in generate_wave(job, stage, &settings) {
            self.store.insert_task(&task).await?;
            if defer_on_backpressure && self.dispatcher.is_saturated(task.role).await {
                debug!(job_id = %job.id, role = %task.role, "Deferring wave under backpressure");
                continue;
            }
            self.enqueue_if_eligible(job.id, task.id).await?;
        }
        Ok(())
    }

    /// Queues a pending task when every dependency has succeeded.
    async fn enqueue_if_eligible(&self, job_id: Uuid, task_id: Uuid) -> PlanforgeResult<bool> {
        let task = self.store.get_task(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        let succeeded = self.succeeded_ids(job_id).await?;
        if !task.is_ready(&succeeded) {
            return Ok(false);
        }
        match self.dispatcher.enqueue(&task).await {
            Ok(()) => Ok(true),
            // The maintenance tick and an event handler can race on the
            // same pending task; whoever loses the queued CAS just moves on.
            Err(PlanforgeError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn succeeded_ids(&self, job_id: Uuid) -> PlanforgeResult<Vec<Uuid>> {
        Ok(self
            .store
            .tasks_for_job(job_id)
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Succeeded)
            .map(|t| t.id)
            .collect())
    }

    async fn emit_stage_entered(&self, job: &Job, stage: Stage) -> PlanforgeResult<()> {
        self.bus
            .publish(
                Event::new(job.id, EventKind::StageEntered)
                    .with_payload(serde_json::json!({"stage": stage.to_string()})),
            )
            .await?;
        Ok(())
    }

    // --- Event loop ---

    /// Starts the engine: subscribes to the bus and runs the maintenance
    /// tick that releases deferred and newly eligible tasks.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut subscription = match orchestrator
                .bus
                .subscribe(SubscriberFilter::All, None)
                .await
            {
                Ok(sub) => sub,
                Err(e) => {
                    error!(error = %e, "Orchestrator failed to subscribe, exiting");
                    return;
                }
            };
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    event = subscription.recv() => match event {
                        Some(event) => orchestrator.handle_event(event).await,
                        None => {
                            // The bus dropped us (buffer overflow). Losing
                            // events is not an option for the engine, so
                            // resubscribe; advance logic tolerates the gap.
                            warn!("Orchestrator subscription lost, resubscribing");
                            match orchestrator.bus.subscribe(SubscriberFilter::All, None).await {
                                Ok(sub) => subscription = sub,
                                Err(e) => {
                                    error!(error = %e, "Resubscribe failed, exiting");
                                    return;
                                }
                            }
                        }
                    },
                    _ = tick.tick() => orchestrator.maintenance_tick().await,
                }
            }
        })
    }

    async fn handle_event(&self, event: Event) {
        let result = match event.kind {
            EventKind::TaskSucceeded => match event.task_id {
                Some(task_id) => self.on_task_succeeded(event.job_id, task_id).await,
                None => Ok(()),
            },
            EventKind::TaskFailed => {
                let terminal = event
                    .payload
                    .get("terminal")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                match (terminal, event.task_id) {
                    (true, Some(task_id)) => {
                        let error = event
                            .payload
                            .get("error")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_string();
                        self.on_task_failed(event.job_id, task_id, &error).await
                    }
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            match e {
                PlanforgeError::NotFound(what) => {
                    warn!(job_id = %event.job_id, %what, "Ignoring event for unknown entity");
                }
                PlanforgeError::FatalBackend(reason) => {
                    // Structural store failure; crash the engine and let
                    // supervision restart it.
                    panic!("orchestrator fatal backend error: {reason}");
                }
                e => warn!(job_id = %event.job_id, error = %e, "Event handling failed"),
            }
        }
    }

    /// Reacts to a successful task: if its whole stage has succeeded,
    /// advances the job and releases the next wave.
    async fn on_task_succeeded(&self, job_id: Uuid, task_id: Uuid) -> PlanforgeResult<()> {
        let _guard = self.lock_job(job_id).await?;

        let job = self.store.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(());
        }
        let tasks = self.store.tasks_for_job(job_id).await?;
        let Some(task) = tasks.iter().find(|t| t.id == task_id) else {
            warn!(job_id = %job_id, task_id = %task_id, "Completion for unknown task, ignoring");
            return Ok(());
        };

        // Duplicate or late event for an already-advanced stage.
        if task.stage != job.stage {
            debug!(job_id = %job_id, task_stage = %task.stage, job_stage = %job.stage, "Stale completion event");
            return Ok(());
        }

        let stage_done = tasks
            .iter()
            .filter(|t| t.stage == job.stage)
            .all(|t| t.status == TaskStatus::Succeeded);
        if !stage_done {
            // Siblings still running; nothing to advance, but dependencies
            // of pending tasks may have just been satisfied.
            for t in tasks.iter().filter(|t| t.status == TaskStatus::Pending) {
                self.enqueue_if_eligible(job_id, t.id).await?;
            }
            return Ok(());
        }

        let Some(next) = job.stage.next() else {
            return Ok(());
        };
        self.advance_to(job, next).await.map(|_| ())
    }

    async fn advance_to(&self, job: Job, next: Stage) -> PlanforgeResult<Job> {
        let next_status = match next {
            Stage::WaitingForApproval => JobStatus::WaitingForApproval,
            Stage::Completed => JobStatus::Completed,
            _ => JobStatus::Running,
        };

        let advanced = match self
            .store
            .transition_job(job.id, (job.status, job.stage), (next_status, next))
            .await
        {
            Ok(job) => job,
            Err(PlanforgeError::Conflict(_)) => {
                // Another instance (or a duplicate event) advanced first.
                debug!(job_id = %job.id, "Advance lost the CAS, already done");
                return self.store.get_job(job.id).await;
            }
            Err(e) => return Err(e),
        };

        info!(job_id = %advanced.id, stage = %next, "Stage entered");
        self.emit_stage_entered(&advanced, next).await?;

        match next {
            Stage::WaitingForApproval => {
                let prd = self
                    .store
                    .artifact_for_job(advanced.id, ArtifactKind::Prd)
                    .await?;
                self.bus
                    .publish(
                        Event::new(advanced.id, EventKind::ApprovalRequested).with_payload(
                            serde_json::json!({"prd_hash": prd.hash}),
                        ),
                    )
                    .await?;
            }
            Stage::Completed => {
                Metrics::incr(&self.metrics.jobs_completed);
                Metrics::gauge_add(&self.metrics.active_jobs, -1);
                self.bus
                    .publish(Event::new(advanced.id, EventKind::JobCompleted))
                    .await?;
                info!(job_id = %advanced.id, "Job completed");
            }
            stage => {
                self.release_wave(&advanced, stage, false).await?;
            }
        }
        Ok(advanced)
    }

    /// Reacts to a terminal task failure: cancels still-pending siblings,
    /// records the failed stage, and fails the job.
    async fn on_task_failed(
        &self,
        job_id: Uuid,
        task_id: Uuid,
        error: &str,
    ) -> PlanforgeResult<()> {
        let _guard = self.lock_job(job_id).await?;

        let job = self.store.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(());
        }
        let task = self.store.get_task(task_id).await?;

        warn!(job_id = %job_id, task_id = %task_id, role = %task.role, %error, "Task failed terminally, failing job");

        self.dispatcher.cancel_job(job_id).await?;
        self.store
            .update_job_metadata(
                job_id,
                HashMap::from([
                    (
                        job::META_FAILED_STAGE.to_string(),
                        serde_json::Value::String(task.role.as_str().to_string()),
                    ),
                    (
                        job::META_FAILED_REASON.to_string(),
                        serde_json::Value::String(error.to_string()),
                    ),
                ]),
            )
            .await?;
        let failed = self
            .store
            .transition_job(
                job_id,
                (job.status, job.stage),
                (JobStatus::Failed, Stage::Failed),
            )
            .await?;

        Metrics::incr(&self.metrics.jobs_failed);
        Metrics::gauge_add(&self.metrics.active_jobs, -1);
        self.bus
            .publish(
                Event::new(failed.id, EventKind::JobFailed)
                    .with_task(task_id)
                    .with_payload(serde_json::json!({
                        "failed_stage": task.role.as_str(),
                        "error": error,
                    })),
            )
            .await?;
        Ok(())
    }

    /// Re-evaluates pending tasks: deferred intake waves and tasks whose
    /// dependencies completed while no event was in flight.
    async fn maintenance_tick(&self) {
        let jobs = match self.store.list_jobs(None, usize::MAX).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Maintenance sweep failed");
                return;
            }
        };
        for job in jobs.into_iter().filter(Job::is_active) {
            let tasks = match self.store.tasks_for_job(job.id).await {
                Ok(tasks) => tasks,
                Err(_) => continue,
            };
            for task in tasks.into_iter().filter(|t| t.status == TaskStatus::Pending) {
                if self.dispatcher.is_saturated(task.role).await {
                    continue;
                }
                if let Err(e) = self.enqueue_if_eligible(job.id, task.id).await {
                    warn!(job_id = %job.id, task_id = %task.id, error = %e, "Maintenance enqueue failed");
                }
            }
        }
    }

    // --- HITL gate ---

    /// Grants approval: validates the reviewed PRD hash, writes the truth
    /// record transactionally, and releases the planning wave.
    pub async fn approve(
        &self,
        job_id: Uuid,
        prd_hash: &str,
        notes: Option<String>,
    ) -> PlanforgeResult<Job> {
        let _guard = self.lock_job(job_id).await?;

        let job = self.store.get_job(job_id).await?;
        if job.stage != Stage::WaitingForApproval {
            return Err(PlanforgeError::WrongStage(format!(
                "job {} is at {}, approval requires waiting_for_approval",
                job_id, job.stage
            )));
        }
        let prd = self
            .store
            .artifact_for_job(job_id, ArtifactKind::Prd)
            .await?;
        if prd.hash != prd_hash {
            return Err(PlanforgeError::StaleApproval(format!(
                "PRD {} is no longer current",
                prd_hash
            )));
        }

        let record = TruthRecord {
            job_id,
            requirements_hash: artifact::text_hash(job.requirements()),
            prd_hash: prd.hash.clone(),
            prd_artifact_id: prd.hash.clone(),
            approved_at: Utc::now(),
            notes,
        };
        let (job, event) = self
            .store
            .write_truth(
                record,
                (job.status, Stage::WaitingForApproval),
                (JobStatus::Running, Stage::Planning),
                Event::new(job_id, EventKind::ApprovalGranted)
                    .with_payload(serde_json::json!({"prd_hash": prd.hash})),
            )
            .await?;
        self.bus.broadcast_appended(&event).await;

        info!(job_id = %job_id, "Approval granted");
        self.emit_stage_entered(&job, Stage::Planning).await?;
        self.release_wave(&job, Stage::Planning, false).await?;
        Ok(job)
    }

    /// Sends the job back to PRD generation with reviewer feedback. The
    /// regenerated PRD occupies a fresh wave slot, so a later approval
    /// validates against the new artifact.
    pub async fn request_changes(&self, job_id: Uuid, feedback: &str) -> PlanforgeResult<Job> {
        let _guard = self.lock_job(job_id).await?;

        let job = self.store.get_job(job_id).await?;
        if job.stage != Stage::WaitingForApproval {
            return Err(PlanforgeError::WrongStage(format!(
                "job {} is at {}, change requests require waiting_for_approval",
                job_id, job.stage
            )));
        }

        let revision = job.prd_revision() + 1;
        self.store
            .update_job_metadata(
                job_id,
                HashMap::from([
                    (
                        job::META_PRD_REVISION.to_string(),
                        serde_json::json!(revision),
                    ),
                    (
                        job::META_PRD_FEEDBACK.to_string(),
                        serde_json::Value::String(feedback.to_string()),
                    ),
                ]),
            )
            .await?;
        let job = self
            .store
            .transition_job(
                job_id,
                (job.status, Stage::WaitingForApproval),
                (JobStatus::ChangesRequested, Stage::PrdGeneration),
            )
            .await?;

        self.bus
            .publish(
                Event::new(job_id, EventKind::ChangesRequested)
                    .with_payload(serde_json::json!({"feedback": feedback, "revision": revision})),
            )
            .await?;
        info!(job_id = %job_id, revision, "Changes requested");

        self.emit_stage_entered(&job, Stage::PrdGeneration).await?;
        self.release_wave(&job, Stage::PrdGeneration, false).await?;
        Ok(job)
    }

    // --- Restart / delete ---

    /// Restarts a failed job from scratch: tasks and artifacts are wiped,
    /// the event history is preserved, and intake re-runs.
    pub async fn restart(&self, job_id: Uuid) -> PlanforgeResult<Job> {
        let _guard = self.lock_job(job_id).await?;

        let job = self.store.reset_failed_job(job_id).await?;
        Metrics::gauge_add(&self.metrics.active_jobs, 1);
        self.bus
            .publish(
                Event::new(job.id, EventKind::JobCreated).with_payload(serde_json::json!({
                    "project_id": job.project_id,
                    "restart": true,
                })),
            )
            .await?;
        info!(job_id = %job_id, "Job restarted");
        self.begin(job).await
    }

    /// Cancels in-flight work and removes every record of the job.
    pub async fn delete(&self, job_id: Uuid) -> PlanforgeResult<()> {
        let guard = self.lock_job(job_id).await?;

        let job = self.store.get_job(job_id).await?;
        self.dispatcher.cancel_job(job_id).await?;
        self.store.delete_job(job_id).await?;
        if job.is_active() {
            Metrics::gauge_add(&self.metrics.active_jobs, -1);
        }
        drop(guard);
        self.job_locks.lock().await.remove(&job_id);
        info!(job_id = %job_id, "Job deleted");
        Ok(())
    }
}
