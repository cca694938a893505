//! Task-list update contract.
//!
//! Task identity is the description string, so every update must resend the
//! complete list. Dropping a previously known task would silently lose work
//! the model already committed to — omissions are rejected with the exact
//! missing descriptions so the model can correct itself.

use chrono::Utc;
use tandem_core::{Plan, Task, TaskStatus};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskUpdateError {
    #[error("task list is empty")]
    Empty,
    #[error("duplicate task description `{0}`")]
    Duplicate(String),
    #[error("task list update omits existing tasks: {}", .0.join(", "))]
    MissingTasks(Vec<String>),
    #[error("more than one task is in_progress: {}", .0.join(", "))]
    MultipleInProgress(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdateOutcome {
    pub plan: Plan,
    /// Descriptions that transitioned to `completed` in this update; each
    /// one raises an approval request before the workflow proceeds.
    pub newly_completed: Vec<String>,
}

/// Validate and apply a complete task array against the existing plan.
/// `replace` skips the completeness check for an intentional wholesale
/// rewrite.
pub fn apply_task_update(
    existing: Option<&Plan>,
    tasks: Vec<Task>,
    replace: bool,
) -> Result<TaskUpdateOutcome, TaskUpdateError> {
    if tasks.is_empty() {
        return Err(TaskUpdateError::Empty);
    }

    let mut seen = std::collections::HashSet::new();
    for task in &tasks {
        if !seen.insert(task.description.as_str()) {
            return Err(TaskUpdateError::Duplicate(task.description.clone()));
        }
    }

    let in_progress: Vec<String> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .map(|t| t.description.clone())
        .collect();
    if in_progress.len() > 1 {
        return Err(TaskUpdateError::MultipleInProgress(in_progress));
    }

    if let Some(plan) = existing
        && !replace
    {
        let missing: Vec<String> = plan
            .tasks
            .iter()
            .filter(|old| !seen.contains(old.description.as_str()))
            .map(|old| old.description.clone())
            .collect();
        if !missing.is_empty() {
            return Err(TaskUpdateError::MissingTasks(missing));
        }
    }

    let newly_completed = tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Completed)
        .filter(|task| {
            existing
                .and_then(|plan| {
                    plan.tasks
                        .iter()
                        .find(|old| old.description == task.description)
                })
                .is_none_or(|old| old.status != TaskStatus::Completed)
        })
        .map(|task| task.description.clone())
        .collect();

    let plan = match existing {
        Some(plan) if !replace => Plan {
            plan_id: plan.plan_id,
            tasks,
            created_at: plan.created_at,
            updated_at: Utc::now(),
        },
        _ => Plan::new(tasks),
    };

    Ok(TaskUpdateOutcome {
        plan,
        newly_completed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(description: &str, status: TaskStatus) -> Task {
        Task {
            description: description.to_string(),
            status,
            category: "code".to_string(),
        }
    }

    fn abc_plan() -> Plan {
        Plan::new(vec![
            task("A", TaskStatus::Pending),
            task("B", TaskStatus::Pending),
            task("C", TaskStatus::Pending),
        ])
    }

    #[test]
    fn omitting_a_known_task_is_rejected_with_exact_names() {
        let plan = abc_plan();
        let err = apply_task_update(
            Some(&plan),
            vec![task("A", TaskStatus::Pending), task("C", TaskStatus::Pending)],
            false,
        )
        .expect_err("rejected");
        assert_eq!(err, TaskUpdateError::MissingTasks(vec!["B".to_string()]));
    }

    #[test]
    fn complete_resend_with_updated_statuses_succeeds() {
        let plan = abc_plan();
        let outcome = apply_task_update(
            Some(&plan),
            vec![
                task("A", TaskStatus::Completed),
                task("B", TaskStatus::InProgress),
                task("C", TaskStatus::Pending),
            ],
            false,
        )
        .expect("accepted");
        assert_eq!(outcome.plan.plan_id, plan.plan_id);
        assert_eq!(outcome.newly_completed, vec!["A".to_string()]);
    }

    #[test]
    fn already_completed_tasks_do_not_retrigger_approval() {
        let mut plan = abc_plan();
        plan.tasks[0].status = TaskStatus::Completed;
        let outcome = apply_task_update(
            Some(&plan),
            vec![
                task("A", TaskStatus::Completed),
                task("B", TaskStatus::Pending),
                task("C", TaskStatus::Pending),
            ],
            false,
        )
        .expect("accepted");
        assert!(outcome.newly_completed.is_empty());
    }

    #[test]
    fn wholesale_replace_skips_the_completeness_check() {
        let plan = abc_plan();
        let outcome = apply_task_update(Some(&plan), vec![task("X", TaskStatus::Pending)], true)
            .expect("replaced");
        assert_ne!(outcome.plan.plan_id, plan.plan_id);
        assert_eq!(outcome.plan.tasks.len(), 1);
    }

    #[test]
    fn duplicates_and_empty_lists_are_rejected() {
        assert_eq!(
            apply_task_update(None, vec![], false),
            Err(TaskUpdateError::Empty)
        );
        let err = apply_task_update(
            None,
            vec![task("A", TaskStatus::Pending), task("A", TaskStatus::Pending)],
            false,
        )
        .expect_err("duplicate");
        assert_eq!(err, TaskUpdateError::Duplicate("A".to_string()));
    }

    #[test]
    fn at_most_one_task_in_progress() {
        let err = apply_task_update(
            None,
            vec![
                task("A", TaskStatus::InProgress),
                task("B", TaskStatus::InProgress),
            ],
            false,
        )
        .expect_err("two in progress");
        assert!(matches!(err, TaskUpdateError::MultipleInProgress(_)));
    }
}
