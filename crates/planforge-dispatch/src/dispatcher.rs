use crate::queue::RoleQueues;
use chrono::Utc;
use planforge_core::{
    ConfigHandle, Event, EventKind, Metrics, PlanforgeError, PlanforgeResult, Role, Task,
    TaskStatus,
};
use planforge_events::EventBus;
use planforge_store::StateStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A registered worker: its identity, declared roles, and concurrency.
#[derive(Debug, Clone)]
pub struct WorkerRegistration {
    /// Worker identity used in claims and leases.
    pub worker_id: Uuid,
    /// Roles this worker can execute.
    pub roles: Vec<Role>,
    /// Concurrent handler slots the worker hosts.
    pub max_concurrency: usize,
}

/// What became of a failed task attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Re-queued for another attempt after backoff.
    Retried { attempt: u32, delay: Duration },
    /// The retry budget is exhausted; the failure is terminal and has been
    /// escalated via a terminal `task_failed` event.
    Terminal,
    /// The task reached a terminal state (usually cancelled) while the
    /// attempt was in flight; the failure is dropped.
    Discarded,
}

/// The dispatch layer: per-role priority queues with claim/lease/heartbeat
/// discipline, retries with exponential backoff, and backpressure
/// signalling.
///
/// Multiple dispatcher instances coordinate through the State Store's
/// conditional claims; losing a claim race is normal and simply means
/// another worker took the task.
pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    queues: RoleQueues,
    workers: RwLock<HashMap<Uuid, WorkerRegistration>>,
    registered_roles: RwLock<HashSet<Role>>,
    cancellations: RwLock<HashMap<Uuid, CancellationToken>>,
    metrics: Arc<Metrics>,
    config: ConfigHandle,
}

impl Dispatcher {
    /// Creates a dispatcher over the store and bus.
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
        config: ConfigHandle,
    ) -> Arc<Self> {
        let soft_cap = config.snapshot().queue.soft_cap_per_role;
        Arc::new(Self {
            store,
            bus,
            queues: RoleQueues::new(soft_cap),
            workers: RwLock::new(HashMap::new()),
            registered_roles: RwLock::new(HashSet::new()),
            cancellations: RwLock::new(HashMap::new()),
            metrics,
            config,
        })
    }

    /// Registers a worker and returns its registration (the lease handle).
    pub async fn register_worker(
        &self,
        roles: Vec<Role>,
        max_concurrency: usize,
    ) -> WorkerRegistration {
        let registration = WorkerRegistration {
            worker_id: Uuid::new_v4(),
            roles: roles.clone(),
            max_concurrency: max_concurrency.max(1),
        };
        {
            let mut registered = self.registered_roles.write().await;
            registered.extend(roles.iter().copied());
        }
        self.workers
            .write()
            .await
            .insert(registration.worker_id, registration.clone());
        info!(worker_id = %registration.worker_id, roles = ?roles, "Worker registered");
        registration
    }

    /// Number of registered workers.
    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Whether a role queue is over its soft cap.
    pub async fn is_saturated(&self, role: Role) -> bool {
        self.queues.is_saturated(role).await
    }

    /// Current depth per role queue.
    pub async fn queue_depths(&self) -> HashMap<Option<Role>, usize> {
        self.queues.depths().await
    }

    /// Moves an eligible task to `queued` and pushes it onto its role
    /// queue, emitting `task_queued` (and `queue_saturated` past the soft
    /// cap).
    pub async fn enqueue(&self, task: &Task) -> PlanforgeResult<()> {
        let queued = self.store.mark_task_queued(task.id).await?;
        let registered = self.registered_roles.read().await.contains(&task.role);
        let depth = self
            .queues
            .push(task.role, registered, queued.priority, queued.id)
            .await;

        self.bus
            .publish(
                Event::new(task.job_id, EventKind::TaskQueued)
                    .with_task(task.id)
                    .with_payload(serde_json::json!({
                        "role": task.role.as_str(),
                        "attempt": queued.attempt,
                    })),
            )
            .await?;

        let soft_cap = self.config.snapshot().queue.soft_cap_per_role;
        if depth > soft_cap {
            warn!(role = %task.role, depth, "Role queue saturated");
            self.bus
                .publish(
                    Event::new(task.job_id, EventKind::QueueSaturated).with_payload(
                        serde_json::json!({"role": task.role.as_str(), "depth": depth}),
                    ),
                )
                .await?;
        }
        Ok(())
    }

    /// Claims the next task for a worker, blocking up to `wait`.
    ///
    /// Pops candidates in priority order and validates each against the
    /// store: entries that are no longer `queued` (cancelled, or claimed by
    /// a racing instance) are discarded and the pop continues.
    pub async fn claim(
        &self,
        worker_id: Uuid,
        roles: &[Role],
        wait: Duration,
    ) -> PlanforgeResult<Option<Task>> {
        let lease = self.config.snapshot().worker.lease();
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            while let Some((_, task_id)) = self.queues.pop_any(roles).await {
                match self.store.claim_task(task_id, worker_id, lease).await {
                    Ok(task) => {
                        self.bus
                            .publish(
                                Event::new(task.job_id, EventKind::TaskClaimed)
                                    .with_task(task.id)
                                    .with_payload(serde_json::json!({
                                        "worker_id": worker_id,
                                        "attempt": task.attempt,
                                    })),
                            )
                            .await?;
                        return Ok(Some(task));
                    }
                    Err(PlanforgeError::Conflict(reason)) => {
                        // Someone else claimed it, or it was cancelled while
                        // queued; either way the entry is stale.
                        debug!(task_id = %task_id, %reason, "Skipping stale queue entry");
                    }
                    Err(PlanforgeError::NotFound(_)) => {
                        debug!(task_id = %task_id, "Queue entry for deleted task");
                    }
                    Err(e) => return Err(e),
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // Wake on push or give up at the deadline.
            let _ = tokio::time::timeout(remaining, self.queues.wait_for_work()).await;
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Renews the leases a worker holds on its in-flight tasks.
    pub async fn heartbeat(&self, worker_id: Uuid, task_ids: &[Uuid]) -> PlanforgeResult<usize> {
        let lease = self.config.snapshot().worker.lease();
        self.store.renew_leases(worker_id, task_ids, lease).await
    }

    /// Records a successful completion and emits `task_succeeded`.
    pub async fn complete(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        output: serde_json::Value,
    ) -> PlanforgeResult<Task> {
        let task = self.store.complete_task(task_id, worker_id, output).await?;
        Metrics::incr(&self.metrics.tasks_succeeded);
        self.bus
            .publish(
                Event::new(task.job_id, EventKind::TaskSucceeded)
                    .with_task(task.id)
                    .with_payload(task.output.clone().unwrap_or_default()),
            )
            .await?;
        Ok(task)
    }

    /// Records a failed attempt, deciding between retry and terminal
    /// escalation.
    ///
    /// Retries re-enter the queue after exponential backoff; the terminal
    /// case emits `task_failed` with `"terminal": true`, which the
    /// Orchestrator reacts to.
    pub async fn fail(
        self: &Arc<Self>,
        task_id: Uuid,
        worker_id: Uuid,
        error: &str,
    ) -> PlanforgeResult<FailureDisposition> {
        let task = self.store.get_task(task_id).await?;
        if task.status.is_terminal() {
            debug!(task_id = %task_id, status = %task.status, "Discarding failure for terminal task");
            return Ok(FailureDisposition::Discarded);
        }
        let terminal = task.attempt >= task.max_attempts;

        if terminal {
            let task = self.store.fail_task(task_id, worker_id, error).await?;
            Metrics::incr(&self.metrics.tasks_failed);
            self.bus
                .publish(
                    Event::new(task.job_id, EventKind::TaskFailed)
                        .with_task(task.id)
                        .with_payload(serde_json::json!({
                            "error": error,
                            "attempt": task.attempt,
                            "terminal": true,
                        })),
                )
                .await?;
            return Ok(FailureDisposition::Terminal);
        }

        let task = self.store.requeue_task(task_id, worker_id, error).await?;
        Metrics::incr(&self.metrics.tasks_retried);
        let delay = self.config.snapshot().task.backoff_delay(task.attempt);
        self.bus
            .publish(
                Event::new(task.job_id, EventKind::TaskFailed)
                    .with_task(task.id)
                    .with_payload(serde_json::json!({
                        "error": error,
                        "attempt": task.attempt,
                        "terminal": false,
                        "retry_in_ms": delay.as_millis() as u64,
                    })),
            )
            .await?;

        let dispatcher = Arc::clone(self);
        let attempt = task.attempt;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            dispatcher.requeue_after_backoff(task).await;
        });
        Ok(FailureDisposition::Retried { attempt, delay })
    }

    async fn requeue_after_backoff(&self, task: Task) {
        // The task may have been cancelled during the backoff window.
        match self.store.get_task(task.id).await {
            Ok(current) if current.status == TaskStatus::Queued => {
                let registered = self.registered_roles.read().await.contains(&current.role);
                self.queues
                    .push(current.role, registered, current.priority, current.id)
                    .await;
            }
            Ok(current) => {
                debug!(task_id = %task.id, status = %current.status, "Skipping backoff requeue");
            }
            Err(e) => warn!(task_id = %task.id, error = %e, "Backoff requeue lookup failed"),
        }
    }

    /// The cancellation token shared by all in-flight work of a job.
    pub async fn cancellation_token(&self, job_id: Uuid) -> CancellationToken {
        let mut tokens = self.cancellations.write().await;
        tokens.entry(job_id).or_default().clone()
    }

    /// Cancels a job's dispatchable work: marks non-terminal tasks
    /// `cancelled` in the store and fires the job's cancellation token so
    /// cooperative handlers stop at their next boundary.
    pub async fn cancel_job(&self, job_id: Uuid) -> PlanforgeResult<Vec<Uuid>> {
        let cancelled = self.store.cancel_tasks_for_job(job_id).await?;
        for _ in &cancelled {
            Metrics::incr(&self.metrics.tasks_cancelled);
        }
        if let Some(token) = self.cancellations.write().await.remove(&job_id) {
            token.cancel();
        }
        Ok(cancelled)
    }

    /// Starts the lease reaper: every half lease, claims whose lease
    /// expired are released back to `queued` and re-pushed so another
    /// worker picks them up. This is the at-least-once recovery path for
    /// crashed workers.
    pub fn start_lease_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let lease = dispatcher.config.snapshot().worker.lease();
                tokio::time::sleep(lease / 2).await;
                match dispatcher.store.release_expired_leases(Utc::now()).await {
                    Ok(released) => {
                        for task in released {
                            warn!(task_id = %task.id, attempt = task.attempt, "Lease expired, re-queueing");
                            Metrics::incr(&dispatcher.metrics.tasks_retried);
                            let registered = dispatcher
                                .registered_roles
                                .read()
                                .await
                                .contains(&task.role);
                            dispatcher
                                .queues
                                .push(task.role, registered, task.priority, task.id)
                                .await;
                            let _ = dispatcher
                                .bus
                                .publish(
                                    Event::new(task.job_id, EventKind::TaskQueued)
                                        .with_task(task.id)
                                        .with_payload(serde_json::json!({
                                            "role": task.role.as_str(),
                                            "attempt": task.attempt,
                                            "lease_expired": true,
                                        })),
                                )
                                .await;
                        }
                    }
                    Err(e) => warn!(error = %e, "Lease reaper sweep failed"),
                }
            }
        })
    }
}
