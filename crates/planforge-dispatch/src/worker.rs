use crate::dispatcher::Dispatcher;
use crate::handler::{DependencyOutput, HandlerContext, HandlerRegistry};
use planforge_core::{
    Artifact, ConfigHandle, Event, EventKind, Metrics, PlanforgeError, PlanforgeResult, Role,
    Task,
};
use planforge_events::{CatalogCache, EventBus};
use planforge_store::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared state cloned into each worker loop.
struct LoopContext {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    handlers: Arc<HandlerRegistry>,
    catalog: Arc<CatalogCache>,
    metrics: Arc<Metrics>,
    config: ConfigHandle,
    worker_id: Uuid,
    roles: Vec<Role>,
    shutdown: CancellationToken,
}

/// A pool of long-lived worker loops.
///
/// Each loop claims one task at a time for its declared roles, resolves the
/// task's dependency outputs and truth record from the State Store, runs
/// the role handler under the task deadline, and lands the result
/// atomically: artifact first, then the conditional completion. A result
/// whose task was cancelled or reclaimed in the meantime is discarded.
pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    handlers: Arc<HandlerRegistry>,
    catalog: Arc<CatalogCache>,
    metrics: Arc<Metrics>,
    config: ConfigHandle,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Creates a pool executing the given handler set.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn StateStore>,
        bus: Arc<EventBus>,
        handlers: Arc<HandlerRegistry>,
        catalog: Arc<CatalogCache>,
        metrics: Arc<Metrics>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            dispatcher,
            store,
            bus,
            handlers,
            catalog,
            metrics,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops every loop at its next claim boundary.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Registers one worker for the registry's roles and spawns its
    /// concurrency slots.
    pub async fn start(&self) -> Vec<JoinHandle<()>> {
        let roles = self.handlers.roles();
        let concurrency = self.config.snapshot().worker.concurrency;
        let registration = self
            .dispatcher
            .register_worker(roles.clone(), concurrency)
            .await;

        let mut handles = Vec::with_capacity(concurrency);
        for slot in 0..concurrency {
            let ctx = LoopContext {
                dispatcher: Arc::clone(&self.dispatcher),
                store: Arc::clone(&self.store),
                bus: Arc::clone(&self.bus),
                handlers: Arc::clone(&self.handlers),
                catalog: Arc::clone(&self.catalog),
                metrics: Arc::clone(&self.metrics),
                config: self.config.clone(),
                worker_id: registration.worker_id,
                roles: roles.clone(),
                shutdown: self.shutdown.clone(),
            };
            handles.push(tokio::spawn(async move {
                debug!(worker_id = %ctx.worker_id, slot, "Worker loop started");
                run_loop(ctx).await;
            }));
        }
        info!(
            worker_id = %registration.worker_id,
            slots = concurrency,
            "Worker pool started"
        );
        handles
    }
}

async fn run_loop(ctx: LoopContext) {
    let claim_wait = Duration::from_secs(ctx.config.snapshot().queue.claim_wait_seconds.max(1));
    loop {
        let claimed = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            claimed = ctx.dispatcher.claim(ctx.worker_id, &ctx.roles, claim_wait) => claimed,
        };
        match claimed {
            Ok(Some(task)) => {
                if let Err(e) = execute_task(&ctx, task).await {
                    warn!(worker_id = %ctx.worker_id, error = %e, "Task execution error");
                }
            }
            Ok(None) => {}
            Err(PlanforgeError::FatalBackend(e)) => {
                // Structural store failure: stop the loop and let
                // supervision restart the process.
                warn!(worker_id = %ctx.worker_id, error = %e, "Fatal backend error, stopping worker");
                break;
            }
            Err(e) => {
                warn!(worker_id = %ctx.worker_id, error = %e, "Claim failed");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

async fn execute_task(ctx: &LoopContext, task: Task) -> PlanforgeResult<()> {
    let Some(handler) = ctx.handlers.get(task.role) else {
        // No handler is a configuration problem, not a transient one.
        ctx.dispatcher
            .fail(
                task.id,
                ctx.worker_id,
                &format!("no handler registered for role {}", task.role),
            )
            .await?;
        return Ok(());
    };

    let task = ctx.store.start_task(task.id, ctx.worker_id).await?;
    ctx.bus
        .publish(
            Event::new(task.job_id, EventKind::TaskStarted)
                .with_task(task.id)
                .with_payload(serde_json::json!({
                    "role": task.role.as_str(),
                    "attempt": task.attempt,
                })),
        )
        .await?;

    let handler_ctx = build_handler_context(ctx, &task).await?;
    let cancel = handler_ctx.cancel.clone();

    // Renew the lease while the handler runs.
    let heartbeat = spawn_heartbeat(ctx, task.id);

    let deadline = Duration::from_secs(task.deadline_seconds.max(1));
    let result = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(task_id = %task.id, "Cancelled mid-flight, discarding");
            heartbeat.abort();
            return Ok(());
        }
        outcome = tokio::time::timeout(deadline, handler.execute(handler_ctx)) => outcome,
    };
    heartbeat.abort();

    match result {
        Ok(Ok(outcome)) => {
            let artifact = Artifact::new(outcome.kind, task.job_id, task.id, outcome.content);
            let (hash, stored) = ctx.store.put_artifact(artifact).await?;
            if stored {
                Metrics::incr(&ctx.metrics.artifacts_stored);
                ctx.bus
                    .publish(
                        Event::new(task.job_id, EventKind::ArtifactStored)
                            .with_task(task.id)
                            .with_payload(serde_json::json!({
                                "artifact": hash,
                                "kind": outcome.kind.as_str(),
                            })),
                    )
                    .await?;
            }
            ctx.metrics.record_usage(outcome.usage);

            let output = serde_json::json!({
                "artifact": hash,
                "kind": outcome.kind.as_str(),
            });
            match ctx.dispatcher.complete(task.id, ctx.worker_id, output).await {
                Ok(_) => {}
                Err(PlanforgeError::Conflict(reason)) => {
                    // Cancelled or reclaimed while we were computing; the
                    // result is discarded, the artifact store is
                    // content-addressed so the orphan write is harmless.
                    debug!(task_id = %task.id, %reason, "Discarding result");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Err(e)) => {
            ctx.dispatcher
                .fail(task.id, ctx.worker_id, &e.to_string())
                .await?;
        }
        Err(_elapsed) => {
            let error = PlanforgeError::DeadlineExceeded(format!(
                "handler for {} overran {}s",
                task.role, task.deadline_seconds
            ));
            ctx.dispatcher
                .fail(task.id, ctx.worker_id, &error.to_string())
                .await?;
        }
    }
    Ok(())
}

async fn build_handler_context(ctx: &LoopContext, task: &Task) -> PlanforgeResult<HandlerContext> {
    let mut dependencies = Vec::with_capacity(task.dependencies.len());
    for dep_id in &task.dependencies {
        let dep = ctx.store.get_task(*dep_id).await?;
        let output = dep.output.clone().unwrap_or(serde_json::Value::Null);
        let artifact = match output.get("artifact").and_then(|v| v.as_str()) {
            Some(hash) => ctx.store.get_artifact(hash).await.ok(),
            None => None,
        };
        dependencies.push(DependencyOutput {
            task_id: dep.id,
            role: dep.role,
            output,
            artifact,
        });
    }

    let truth = ctx.store.get_truth(task.job_id).await?;
    let modules = ctx.catalog.modules().await?.as_ref().clone();
    let cancel = ctx
        .dispatcher
        .cancellation_token(task.job_id)
        .await
        .child_token();

    Ok(HandlerContext {
        task: task.clone(),
        dependencies,
        truth,
        modules,
        cancel,
    })
}

fn spawn_heartbeat(ctx: &LoopContext, task_id: Uuid) -> JoinHandle<()> {
    let dispatcher = Arc::clone(&ctx.dispatcher);
    let worker_id = ctx.worker_id;
    let interval = ctx.config.snapshot().worker.heartbeat();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            if let Err(e) = dispatcher.heartbeat(worker_id, &[task_id]).await {
                warn!(task_id = %task_id, error = %e, "Heartbeat failed");
            }
        }
    })
}
