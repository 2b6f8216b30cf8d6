use async_trait::async_trait;
use planforge_core::{
    Artifact, ArtifactKind, ModuleEntry, PlanforgeResult, Role, Task, TruthRecord, Usage,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The resolved output of one dependency task, handed to a handler.
#[derive(Debug, Clone)]
pub struct DependencyOutput {
    /// The dependency task.
    pub task_id: Uuid,
    /// The role that produced it.
    pub role: Role,
    /// The dependency's output payload.
    pub output: serde_json::Value,
    /// The artifact the output references, when resolvable.
    pub artifact: Option<Artifact>,
}

/// Everything a role handler receives for one execution.
///
/// The truth record and module catalog are read-only context; the
/// cancellation token must be respected at the handler's own I/O
/// boundaries.
#[derive(Clone)]
pub struct HandlerContext {
    /// The task being executed.
    pub task: Task,
    /// Resolved dependency outputs, in dependency order.
    pub dependencies: Vec<DependencyOutput>,
    /// The job's approved truth record, absent before the approval gate.
    pub truth: Option<TruthRecord>,
    /// Snapshot of the module catalog.
    pub modules: Vec<ModuleEntry>,
    /// Cooperative cancellation; checked between handler phases.
    pub cancel: CancellationToken,
}

impl HandlerContext {
    /// The dependency output produced by the given role, if present.
    pub fn dependency(&self, role: Role) -> Option<&DependencyOutput> {
        self.dependencies.iter().find(|d| d.role == role)
    }

    /// The artifact content produced by the given role's dependency.
    pub fn dependency_content(&self, role: Role) -> Option<&serde_json::Value> {
        self.dependency(role)
            .and_then(|d| d.artifact.as_ref())
            .map(|a| &a.content)
    }
}

/// What a handler produces on success.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    /// The artifact body.
    pub content: serde_json::Value,
    /// The artifact type, normally the role's own kind.
    pub kind: ArtifactKind,
    /// Token/cost accounting for metrics.
    pub usage: Usage,
}

impl HandlerOutcome {
    /// An outcome of the role's default artifact kind with zero usage.
    pub fn new(kind: ArtifactKind, content: serde_json::Value) -> Self {
        Self {
            content,
            kind,
            usage: Usage::default(),
        }
    }

    /// Attaches usage accounting.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

/// An opaque agent implementation for one role.
///
/// Handlers must be idempotent with respect to retries: the same inputs
/// always yield a semantically equivalent artifact.
#[async_trait]
pub trait RoleHandler: Send + Sync {
    /// The role this handler serves.
    fn role(&self) -> Role;

    /// Executes one task. Errors become task failures and count toward the
    /// retry budget.
    async fn execute(&self, ctx: HandlerContext) -> PlanforgeResult<HandlerOutcome>;
}

/// Role → handler map. New roles are added here without touching the
/// Orchestrator.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Role, Arc<dyn RoleHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under its declared role, replacing any previous
    /// registration.
    pub fn register(&mut self, handler: Arc<dyn RoleHandler>) {
        self.handlers.insert(handler.role(), handler);
    }

    /// The handler for a role.
    pub fn get(&self, role: Role) -> Option<Arc<dyn RoleHandler>> {
        self.handlers.get(&role).cloned()
    }

    /// All roles with a registered handler.
    pub fn roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.handlers.keys().copied().collect();
        roles.sort_by_key(|r| r.as_str());
        roles
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use planforge_core::Stage;

    struct NoopHandler(Role);

    #[async_trait]
    impl RoleHandler for NoopHandler {
        fn role(&self) -> Role {
            self.0
        }

        async fn execute(&self, _ctx: HandlerContext) -> PlanforgeResult<HandlerOutcome> {
            Ok(HandlerOutcome::new(
                self.0.artifact_kind(),
                serde_json::json!({}),
            ))
        }
    }

    #[test]
    fn test_registry_register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(NoopHandler(Role::Prd)));
        registry.register(Arc::new(NoopHandler(Role::Qa)));

        assert!(registry.get(Role::Prd).is_some());
        assert!(registry.get(Role::Plan).is_none());
        assert_eq!(registry.roles().len(), 2);
    }

    #[test]
    fn test_context_dependency_lookup() {
        let job_id = Uuid::new_v4();
        let task = Task::new(job_id, Stage::Architecture, Role::Architecture, 0);
        let dep = DependencyOutput {
            task_id: Uuid::new_v4(),
            role: Role::Prd,
            output: serde_json::json!({"artifact": "abc"}),
            artifact: None,
        };
        let ctx = HandlerContext {
            task,
            dependencies: vec![dep],
            truth: None,
            modules: vec![],
            cancel: CancellationToken::new(),
        };
        assert!(ctx.dependency(Role::Prd).is_some());
        assert!(ctx.dependency(Role::Plan).is_none());
        assert!(ctx.dependency_content(Role::Prd).is_none());
    }
}
