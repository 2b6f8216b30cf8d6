//! Builtin role handlers for the Planforge platform.
//!
//! Deterministic, LLM-free implementations of every worker role, used by
//! the test suites and the demo deployment profile. Each handler derives
//! its artifact purely from its inputs (task input, dependency artifacts,
//! truth record, module catalog), so identical inputs always produce
//! identical artifact hashes — which is exactly the idempotency the
//! platform's retry and restart semantics rely on.
//!
//! # Main types
//!
//! - [`BuiltinHandler`] — The deterministic handler for one role.
//! - [`builtin_registry`] — A registry covering all twelve roles.
//! - [`FailingHandler`] / [`BlockingHandler`] — Failure-path and
//!   lease-expiry test doubles.

use async_trait::async_trait;
use planforge_core::{PlanforgeError, PlanforgeResult, Role, Usage};
use planforge_dispatch::{HandlerContext, HandlerOutcome, HandlerRegistry, RoleHandler};
use std::time::Duration;

/// Deterministic handler for one role.
///
/// The produced artifact summarizes the role's decision over its dependency
/// artifacts; no randomness, no clock reads, no external I/O.
pub struct BuiltinHandler {
    role: Role,
}

impl BuiltinHandler {
    /// A handler for the given role.
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    fn cancelled(ctx: &HandlerContext) -> PlanforgeResult<()> {
        if ctx.cancel.is_cancelled() {
            return Err(PlanforgeError::Handler("cancelled".to_string()));
        }
        Ok(())
    }

    fn dependency_hashes(ctx: &HandlerContext) -> serde_json::Value {
        let mut refs = serde_json::Map::new();
        for dep in &ctx.dependencies {
            if let Some(artifact) = &dep.artifact {
                refs.insert(
                    dep.role.as_str().to_string(),
                    serde_json::Value::String(artifact.hash.clone()),
                );
            }
        }
        serde_json::Value::Object(refs)
    }

    fn build_content(&self, ctx: &HandlerContext) -> serde_json::Value {
        let requirements = ctx
            .task
            .input
            .get("requirements")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let inputs = Self::dependency_hashes(ctx);

        match self.role {
            Role::Prd => {
                let mut content = serde_json::json!({
                    "title": "Product Requirements Document",
                    "requirements": requirements,
                    "sections": ["overview", "goals", "user_stories", "acceptance_criteria"],
                });
                if let Some(feedback) = ctx.task.input.get("feedback") {
                    content["feedback_addressed"] = feedback.clone();
                }
                content
            }
            Role::Plan => serde_json::json!({
                "title": "Delivery Plan",
                "milestones": ["foundation", "core_features", "hardening", "launch"],
                "inputs": inputs,
            }),
            Role::FeatureTree => {
                // Reuse decisions come from the module catalog: a feature
                // backed by an existing capability references the module
                // instead of a new build.
                let reuse: Vec<serde_json::Value> = ctx
                    .modules
                    .iter()
                    .map(|m| {
                        serde_json::json!({
                            "module": m.id,
                            "version": m.version,
                            "capabilities": m.capabilities,
                        })
                    })
                    .collect();
                serde_json::json!({
                    "title": "Feature Tree",
                    "root": "platform",
                    "reused_modules": reuse,
                    "inputs": inputs,
                })
            }
            Role::Architecture => serde_json::json!({
                "title": "Architecture",
                "components": ["api", "worker", "store", "events"],
                "inputs": inputs,
            }),
            Role::Uiux => serde_json::json!({
                "title": "UI/UX Specification",
                "screens": ["dashboard", "detail", "settings"],
                "inputs": inputs,
            }),
            Role::Development => serde_json::json!({
                "title": "Development Breakdown",
                "workstreams": ["backend", "frontend", "infrastructure"],
                "inputs": inputs,
            }),
            Role::Qa => serde_json::json!({
                "title": "QA Report",
                "verdict": "pass",
                "coverage": ["functional", "regression", "load"],
                "inputs": inputs,
            }),
            Role::Security => serde_json::json!({
                "title": "Security Review",
                "verdict": "pass",
                "checks": ["authn", "authz", "data_handling"],
                "inputs": inputs,
            }),
            Role::Documentation => serde_json::json!({
                "title": "Documentation Set",
                "documents": ["user_guide", "api_reference", "runbook"],
                "inputs": inputs,
            }),
            Role::Support => serde_json::json!({
                "title": "Support Plan",
                "channels": ["email", "chat"],
                "inputs": inputs,
            }),
            Role::PmReview => serde_json::json!({
                "title": "PM Review",
                "verdict": "approved",
                "inputs": inputs,
            }),
            Role::Delivery => serde_json::json!({
                "title": "Delivery Package",
                "approved_prd": ctx.truth.as_ref().map(|t| t.prd_hash.clone()),
                "inputs": inputs,
            }),
        }
    }
}

#[async_trait]
impl RoleHandler for BuiltinHandler {
    fn role(&self) -> Role {
        self.role
    }

    async fn execute(&self, ctx: HandlerContext) -> PlanforgeResult<HandlerOutcome> {
        Self::cancelled(&ctx)?;
        let content = self.build_content(&ctx);
        Self::cancelled(&ctx)?;

        // Deterministic usage accounting so restart runs reproduce metrics.
        let tokens = content.to_string().len() as u64 / 4;
        Ok(
            HandlerOutcome::new(self.role.artifact_kind(), content).with_usage(Usage {
                tokens,
                cost_microdollars: tokens * 3,
            }),
        )
    }
}

/// A registry hosting a [`BuiltinHandler`] for every role.
pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for role in Role::ALL {
        registry.register(std::sync::Arc::new(BuiltinHandler::new(role)));
    }
    registry
}

/// Always fails; exercises retry exhaustion and failure propagation.
pub struct FailingHandler {
    role: Role,
    message: String,
}

impl FailingHandler {
    /// A handler for `role` that fails every attempt with `message`.
    pub fn new(role: Role, message: impl Into<String>) -> Self {
        Self {
            role,
            message: message.into(),
        }
    }
}

#[async_trait]
impl RoleHandler for FailingHandler {
    fn role(&self) -> Role {
        self.role
    }

    async fn execute(&self, _ctx: HandlerContext) -> PlanforgeResult<HandlerOutcome> {
        Err(PlanforgeError::Handler(self.message.clone()))
    }
}

/// Blocks until cancelled or for a fixed duration; exercises deadlines and
/// lease expiry.
pub struct BlockingHandler {
    role: Role,
    duration: Duration,
}

impl BlockingHandler {
    /// A handler for `role` that sleeps for `duration` before succeeding.
    pub fn new(role: Role, duration: Duration) -> Self {
        Self { role, duration }
    }
}

#[async_trait]
impl RoleHandler for BlockingHandler {
    fn role(&self) -> Role {
        self.role
    }

    async fn execute(&self, ctx: HandlerContext) -> PlanforgeResult<HandlerOutcome> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(PlanforgeError::Handler("cancelled".to_string()));
            }
            _ = tokio::time::sleep(self.duration) => {}
        }
        Ok(HandlerOutcome::new(
            self.role.artifact_kind(),
            serde_json::json!({"slept_ms": self.duration.as_millis() as u64}),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use planforge_core::{Stage, Task};
    use planforge_dispatch::DependencyOutput;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn context_for(role: Role, input: serde_json::Value) -> HandlerContext {
        let job_id = Uuid::new_v4();
        let task = Task::new(job_id, Stage::PrdGeneration, role, 0).with_input(input);
        HandlerContext {
            task,
            dependencies: vec![],
            truth: None,
            modules: vec![],
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_identical_inputs_yield_identical_content() {
        let handler = BuiltinHandler::new(Role::Prd);
        let input = serde_json::json!({"requirements": "Build a URL shortener"});
        let a = handler.execute(context_for(Role::Prd, input.clone())).await.unwrap();
        let b = handler.execute(context_for(Role::Prd, input)).await.unwrap();
        assert_eq!(a.content, b.content);
    }

    #[tokio::test]
    async fn test_prd_carries_feedback_when_present() {
        let handler = BuiltinHandler::new(Role::Prd);
        let ctx = context_for(
            Role::Prd,
            serde_json::json!({"requirements": "r", "feedback": "Add OAuth login"}),
        );
        let outcome = handler.execute(ctx).await.unwrap();
        assert_eq!(outcome.content["feedback_addressed"], "Add OAuth login");
    }

    #[tokio::test]
    async fn test_dependency_hashes_flow_into_content() {
        let handler = BuiltinHandler::new(Role::Plan);
        let mut ctx = context_for(Role::Plan, serde_json::json!({"requirements": "r"}));
        let artifact = planforge_core::Artifact::new(
            planforge_core::ArtifactKind::Prd,
            ctx.task.job_id,
            Uuid::new_v4(),
            serde_json::json!({"title": "PRD"}),
        );
        let hash = artifact.hash.clone();
        ctx.dependencies.push(DependencyOutput {
            task_id: Uuid::new_v4(),
            role: Role::Prd,
            output: serde_json::json!({"artifact": hash}),
            artifact: Some(artifact),
        });
        let outcome = handler.execute(ctx).await.unwrap();
        assert_eq!(outcome.content["inputs"]["prd"], hash);
    }

    #[tokio::test]
    async fn test_cancelled_context_aborts() {
        let handler = BuiltinHandler::new(Role::Qa);
        let ctx = context_for(Role::Qa, serde_json::json!({}));
        ctx.cancel.cancel();
        assert!(handler.execute(ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_handler_always_fails() {
        let handler = FailingHandler::new(Role::Qa, "synthetic failure");
        let err = handler
            .execute(context_for(Role::Qa, serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("synthetic failure"));
    }

    #[tokio::test]
    async fn test_blocking_handler_honors_cancellation() {
        let handler = BlockingHandler::new(Role::Qa, Duration::from_secs(60));
        let ctx = context_for(Role::Qa, serde_json::json!({}));
        let cancel = ctx.cancel.clone();
        let exec = tokio::spawn(async move { handler.execute(ctx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = exec.await.unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_builtin_registry_covers_all_roles() {
        let registry = builtin_registry();
        for role in Role::ALL {
            assert!(registry.get(role).is_some(), "missing handler for {role}");
        }
    }
}
