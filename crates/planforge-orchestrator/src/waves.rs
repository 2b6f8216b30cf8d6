use planforge_core::{job, Job, Role, Stage, Task, TaskSettings};

/// The stage whose wave contains tasks of the given role.
pub fn role_stage(role: Role) -> Stage {
    match role {
        Role::Prd => Stage::PrdGeneration,
        Role::Plan | Role::FeatureTree => Stage::Planning,
        Role::Architecture => Stage::Architecture,
        Role::Uiux => Stage::Uiux,
        Role::Development => Stage::Development,
        Role::Qa | Role::Security | Role::Documentation | Role::Support => Stage::Validation,
        Role::PmReview => Stage::PmReview,
        Role::Delivery => Stage::Delivery,
    }
}

/// Wave index for a role within a job. The PRD slot advances with each
/// requested revision; every other role occupies slot 0.
fn wave_index(job: &Job, role: Role) -> u32 {
    match role {
        Role::Prd => job.prd_revision(),
        _ => 0,
    }
}

/// Generates the task wave for a stage of a job.
///
/// Deterministic in (job id, stage, prior revisions): task ids are derived
/// from their wave slot and dependencies are derived the same way, so
/// regenerating a wave after a restart or a duplicate event reproduces
/// byte-identical task identities. Dependencies point at the task ids whose
/// artifacts the new task consumes.
pub fn generate_wave(job: &Job, stage: Stage, settings: &TaskSettings) -> Vec<Task> {
    stage
        .wave_roles()
        .iter()
        .map(|&role| {
            let deps = role
                .dependency_roles()
                .iter()
                .map(|&dep| {
                    Task::derive_id(job.id, role_stage(dep), dep, wave_index(job, dep))
                })
                .collect();

            let mut input = serde_json::json!({
                "requirements": job.requirements(),
            });
            if role == Role::Prd {
                if let Some(feedback) = job.metadata.get(job::META_PRD_FEEDBACK) {
                    input["feedback"] = feedback.clone();
                }
            }

            Task::new(job.id, stage, role, wave_index(job, role))
                .with_dependencies(deps)
                .with_input(input)
                .with_max_attempts(settings.max_attempts)
                .with_deadline_seconds(settings.default_deadline_seconds)
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_job() -> Job {
        Job::new("p1", "Build a URL shortener", HashMap::new())
    }

    #[test]
    fn test_prd_wave_has_one_task_without_deps() {
        let job = sample_job();
        let wave = generate_wave(&job, Stage::PrdGeneration, &TaskSettings::default());
        assert_eq!(wave.len(), 1);
        assert_eq!(wave[0].role, Role::Prd);
        assert!(wave[0].dependencies.is_empty());
        assert_eq!(wave[0].input["requirements"], "Build a URL shortener");
    }

    #[test]
    fn test_planning_wave_depends_on_prd() {
        let job = sample_job();
        let prd_id = Task::derive_id(job.id, Stage::PrdGeneration, Role::Prd, 0);
        let wave = generate_wave(&job, Stage::Planning, &TaskSettings::default());
        assert_eq!(wave.len(), 2);
        for task in &wave {
            assert_eq!(task.dependencies, vec![prd_id]);
        }
    }

    #[test]
    fn test_architecture_depends_on_prd_and_plan() {
        let job = sample_job();
        let wave = generate_wave(&job, Stage::Architecture, &TaskSettings::default());
        let prd_id = Task::derive_id(job.id, Stage::PrdGeneration, Role::Prd, 0);
        let plan_id = Task::derive_id(job.id, Stage::Planning, Role::Plan, 0);
        assert_eq!(wave[0].dependencies, vec![prd_id, plan_id]);
    }

    #[test]
    fn test_validation_wave_fans_out_from_development() {
        let job = sample_job();
        let dev_id = Task::derive_id(job.id, Stage::Development, Role::Development, 0);
        let wave = generate_wave(&job, Stage::Validation, &TaskSettings::default());
        assert_eq!(wave.len(), 4);
        for task in &wave {
            assert_eq!(task.dependencies, vec![dev_id]);
        }
    }

    #[test]
    fn test_wave_regeneration_is_idempotent() {
        let job = sample_job();
        let first = generate_wave(&job, Stage::Validation, &TaskSettings::default());
        let second = generate_wave(&job, Stage::Validation, &TaskSettings::default());
        let ids = |wave: &[Task]| wave.iter().map(|t| t.id).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn test_prd_revision_shifts_the_prd_slot_and_downstream_deps() {
        let mut job = sample_job();
        job.metadata.insert(
            job::META_PRD_REVISION.to_string(),
            serde_json::json!(1),
        );
        job.metadata.insert(
            job::META_PRD_FEEDBACK.to_string(),
            serde_json::json!("Add OAuth login"),
        );

        let wave = generate_wave(&job, Stage::PrdGeneration, &TaskSettings::default());
        let original = Task::derive_id(job.id, Stage::PrdGeneration, Role::Prd, 0);
        assert_ne!(wave[0].id, original);
        assert_eq!(wave[0].input["feedback"], "Add OAuth login");

        // Later stages resolve their prd dependency to the revised slot.
        let planning = generate_wave(&job, Stage::Planning, &TaskSettings::default());
        assert_eq!(planning[0].dependencies, vec![wave[0].id]);
    }

    #[test]
    fn test_settings_flow_into_tasks() {
        let job = sample_job();
        let settings = TaskSettings {
            default_deadline_seconds: 42,
            max_attempts: 7,
            ..TaskSettings::default()
        };
        let wave = generate_wave(&job, Stage::PrdGeneration, &settings);
        assert_eq!(wave[0].deadline_seconds, 42);
        assert_eq!(wave[0].max_attempts, 7);
    }
}
