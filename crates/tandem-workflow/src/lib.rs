//! Plan/task approval workflow.
//!
//! The state machine is a pure transition function over explicit values —
//! no process-wide interpreter. A session-scoped [`WorkflowMachine`] applies
//! transitions, persists a snapshot on every state entry, and interprets
//! effects, so multiple sessions can run concurrently without shared
//! globals.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tandem_core::{Plan, Result, TaskStatus, project_dir, project_key};
use uuid::Uuid;

mod approvals;
mod tasks;

pub use approvals::{ApprovalError, ApprovalKind, ApprovalTable, PendingApproval};
pub use tasks::{TaskUpdateError, TaskUpdateOutcome, apply_task_update};

const SNAPSHOT_FILE: &str = "workflow-state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Idle,
    Initiating,
    GeneratingPlan,
    PlanReview,
    ApprovedPlan,
    ExecutingTask,
    TaskReview,
    ApprovedTask,
    RejectedTask,
    Completed,
    PartiallyCompleted,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub prompt: Option<String>,
    pub plan: Option<Plan>,
    /// Index of the task currently executing; -1 means before the first.
    pub task_cursor: i64,
    pub session_id: Option<Uuid>,
    /// Stable identifier derived from the workspace path. Survives RESET.
    pub project_id: String,
    pub auto_approve: bool,
    pub error_message: Option<String>,
    pub feedback: Option<String>,
}

impl WorkflowContext {
    #[must_use]
    pub fn new(project_id: String) -> Self {
        Self {
            prompt: None,
            plan: None,
            task_cursor: -1,
            session_id: None,
            project_id,
            auto_approve: false,
            error_message: None,
            feedback: None,
        }
    }

    fn cleared(&self) -> Self {
        Self::new(self.project_id.clone())
    }

    fn cursor_task_index(&self) -> Option<usize> {
        usize::try_from(self.task_cursor).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub state: WorkflowState,
    pub context: WorkflowContext,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    SubmitPrompt { prompt: String },
    PlanningStarted,
    PlanGenerated { plan: Plan },
    ApprovePlan,
    RejectPlan { comment: String },
    StartTaskExecution,
    TaskCompleted,
    ApproveTask { last_approved_index: Option<usize> },
    RejectTask { comment: String },
    FinishExecution,
    Fail { message: String },
    Retry,
    Reset,
    RestoreState { snapshot: WorkflowSnapshot },
    EnableAutoApprove,
    DisableAutoApprove,
}

/// Side effects a transition requests; interpreted by [`WorkflowMachine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    PersistSnapshot,
    ClearSnapshot,
    /// A restored session is waiting on an approval whose in-memory resolver
    /// was lost; the front end must re-surface the request.
    ReissueApprovalRequest(ApprovalKind),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub state: WorkflowState,
    pub context: WorkflowContext,
    pub effects: Vec<Effect>,
}

fn enter(state: WorkflowState, context: WorkflowContext) -> Option<Step> {
    Some(Step {
        state,
        context,
        effects: vec![Effect::PersistSnapshot],
    })
}

fn set_task_status(context: &mut WorkflowContext, index: usize, status: TaskStatus) {
    if let Some(plan) = context.plan.as_mut()
        && let Some(task) = plan.tasks.get_mut(index)
    {
        task.status = status;
        plan.updated_at = chrono::Utc::now();
    }
}

/// Pure transition function: `(state, context, event) -> step`. `None`
/// means the event is illegal in this state and must be ignored without
/// changing anything.
#[must_use]
pub fn step(
    state: &WorkflowState,
    context: &WorkflowContext,
    event: &WorkflowEvent,
) -> Option<Step> {
    use WorkflowEvent as E;
    use WorkflowState as S;

    // Events honored regardless of the current state.
    match event {
        E::Reset => {
            return Some(Step {
                state: S::Idle,
                context: context.cleared(),
                effects: vec![Effect::ClearSnapshot],
            });
        }
        E::Fail { message } => {
            let mut ctx = context.clone();
            ctx.error_message = Some(message.clone());
            return enter(S::Error, ctx);
        }
        E::RestoreState { snapshot } => {
            return Some(Step {
                state: snapshot.state,
                context: snapshot.context.clone(),
                effects: Vec::new(),
            });
        }
        E::EnableAutoApprove => {
            let mut ctx = context.clone();
            ctx.auto_approve = true;
            return Some(Step {
                state: *state,
                context: ctx,
                effects: vec![Effect::PersistSnapshot],
            });
        }
        E::DisableAutoApprove => {
            let mut ctx = context.clone();
            ctx.auto_approve = false;
            return Some(Step {
                state: *state,
                context: ctx,
                effects: vec![Effect::PersistSnapshot],
            });
        }
        _ => {}
    }

    match (state, event) {
        (S::Idle | S::Completed | S::PartiallyCompleted, E::SubmitPrompt { prompt }) => {
            let mut ctx = context.clone();
            ctx.prompt = Some(prompt.clone());
            ctx.error_message = None;
            if ctx.session_id.is_none() {
                ctx.session_id = Some(Uuid::now_v7());
            }
            enter(S::Initiating, ctx)
        }
        (S::Initiating, E::PlanningStarted) => enter(S::GeneratingPlan, context.clone()),
        (S::GeneratingPlan, E::PlanGenerated { plan }) => {
            let mut ctx = context.clone();
            ctx.plan = Some(plan.clone());
            enter(S::PlanReview, ctx)
        }
        (S::PlanReview, E::ApprovePlan) => {
            let mut ctx = context.clone();
            ctx.task_cursor = -1;
            ctx.feedback = None;
            enter(S::ApprovedPlan, ctx)
        }
        (S::PlanReview, E::RejectPlan { comment }) => {
            let mut ctx = context.clone();
            ctx.feedback = Some(comment.clone());
            enter(S::GeneratingPlan, ctx)
        }
        (S::ApprovedPlan | S::RejectedTask | S::PartiallyCompleted, E::StartTaskExecution) => {
            let mut ctx = context.clone();
            ctx.task_cursor += 1;
            if let Some(index) = ctx.cursor_task_index() {
                set_task_status(&mut ctx, index, TaskStatus::InProgress);
            }
            enter(S::ExecutingTask, ctx)
        }
        (S::ApprovedPlan, E::PlanningStarted) => enter(S::GeneratingPlan, context.clone()),
        (S::ExecutingTask, E::TaskCompleted) => {
            let mut ctx = context.clone();
            if let Some(index) = ctx.cursor_task_index() {
                set_task_status(&mut ctx, index, TaskStatus::Review);
            }
            enter(S::TaskReview, ctx)
        }
        (S::TaskReview, E::ApproveTask { last_approved_index }) => {
            let mut ctx = context.clone();
            let approved_through = last_approved_index
                .map(|i| i as i64)
                .unwrap_or(ctx.task_cursor);
            ctx.task_cursor = approved_through;
            if let Some(plan) = ctx.plan.as_mut() {
                for (index, task) in plan.tasks.iter_mut().enumerate() {
                    if task.status == TaskStatus::Review && (index as i64) <= approved_through {
                        task.status = TaskStatus::Done;
                    }
                }
                plan.updated_at = chrono::Utc::now();
            }
            enter(S::ApprovedTask, ctx)
        }
        (S::TaskReview, E::RejectTask { comment }) => {
            let mut ctx = context.clone();
            if let Some(index) = ctx.cursor_task_index() {
                set_task_status(&mut ctx, index, TaskStatus::Rejected);
            }
            ctx.task_cursor -= 1;
            ctx.feedback = Some(comment.clone());
            enter(S::RejectedTask, ctx)
        }
        (S::ApprovedTask, E::StartTaskExecution) => {
            let task_count = context.plan.as_ref().map_or(0, |p| p.tasks.len()) as i64;
            if context.task_cursor < task_count - 1 {
                let mut ctx = context.clone();
                ctx.task_cursor += 1;
                if let Some(index) = ctx.cursor_task_index() {
                    set_task_status(&mut ctx, index, TaskStatus::InProgress);
                }
                enter(S::ExecutingTask, ctx)
            } else {
                enter(S::Completed, context.clone())
            }
        }
        (
            S::ApprovedTask | S::ExecutingTask | S::Completed | S::PartiallyCompleted,
            E::FinishExecution,
        ) => {
            let pending = context.plan.as_ref().map_or(0, Plan::pending_count);
            if pending > 0 {
                enter(S::PartiallyCompleted, context.clone())
            } else {
                enter(S::Completed, context.clone())
            }
        }
        (S::RejectedTask, E::PlanGenerated { plan }) => {
            let mut ctx = context.clone();
            ctx.plan = Some(plan.clone());
            enter(S::PlanReview, ctx)
        }
        (S::Error, E::Retry) => {
            let mut ctx = context.clone();
            ctx.error_message = None;
            if ctx.plan.is_some() {
                enter(S::PlanReview, ctx)
            } else {
                enter(S::Idle, ctx)
            }
        }
        _ => None,
    }
}

/// Session-scoped interpreter: owns the current state/context, applies
/// transitions, persists snapshots keyed by the workspace path hash, and
/// tracks the in-memory approval correlation table.
pub struct WorkflowMachine {
    state: WorkflowState,
    context: WorkflowContext,
    snapshot_path: PathBuf,
    approvals: ApprovalTable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub changed: bool,
    pub effects: Vec<Effect>,
}

impl WorkflowMachine {
    pub fn new(storage_root: &Path, project_root: &Path) -> Self {
        let snapshot_path = project_dir(storage_root, project_root).join(SNAPSHOT_FILE);
        Self {
            state: WorkflowState::Idle,
            context: WorkflowContext::new(project_key(project_root)),
            snapshot_path,
            approvals: ApprovalTable::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> WorkflowState {
        self.state
    }

    #[must_use]
    pub fn context(&self) -> &WorkflowContext {
        &self.context
    }

    pub fn approvals(&mut self) -> &mut ApprovalTable {
        &mut self.approvals
    }

    /// Register a plan-approval request and build the UI event announcing
    /// it. Fails while another request is outstanding.
    pub fn request_plan_approval(
        &mut self,
        plan_file: &str,
    ) -> std::result::Result<(Uuid, tandem_core::UiEvent), ApprovalError> {
        let request_id = self.approvals.begin(ApprovalKind::Plan)?;
        Ok((
            request_id,
            tandem_core::UiEvent::PlanApprovalRequested {
                request_id,
                plan_file: plan_file.to_string(),
            },
        ))
    }

    /// Register a task-approval request for the task at `index`.
    pub fn request_task_approval(
        &mut self,
        index: usize,
    ) -> std::result::Result<(Uuid, tandem_core::UiEvent), ApprovalError> {
        let description = self
            .context
            .plan
            .as_ref()
            .and_then(|plan| plan.tasks.get(index))
            .map(|task| task.description.clone())
            .unwrap_or_default();
        let request_id = self.approvals.begin(ApprovalKind::Task { index })?;
        Ok((
            request_id,
            tandem_core::UiEvent::TaskApprovalRequest {
                request_id,
                task_description: description,
                task_index: index,
            },
        ))
    }

    /// Apply one event. Illegal events are no-ops and report
    /// `changed: false`; nothing is persisted for them.
    pub fn handle(&mut self, event: &WorkflowEvent) -> Result<Applied> {
        let Some(outcome) = step(&self.state, &self.context, event) else {
            return Ok(Applied {
                changed: false,
                effects: Vec::new(),
            });
        };
        self.state = outcome.state;
        self.context = outcome.context;
        for effect in &outcome.effects {
            match effect {
                Effect::PersistSnapshot => self.persist_snapshot()?,
                Effect::ClearSnapshot => self.clear_snapshot()?,
                Effect::ReissueApprovalRequest(_) => {}
            }
        }
        Ok(Applied {
            changed: true,
            effects: outcome.effects,
        })
    }

    /// Restore from the persisted snapshot, if any. When the restored state
    /// was waiting on an approval, the in-memory resolver is gone — the
    /// returned effect tells the caller to re-surface the request instead of
    /// hanging forever.
    pub fn restore(&mut self) -> Result<Vec<Effect>> {
        if !self.snapshot_path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.snapshot_path)?;
        let snapshot: WorkflowSnapshot = serde_json::from_str(&raw)?;
        self.state = snapshot.state;
        self.context = snapshot.context;

        let mut effects = Vec::new();
        if self.approvals.is_empty() {
            match self.state {
                WorkflowState::PlanReview => {
                    effects.push(Effect::ReissueApprovalRequest(ApprovalKind::Plan));
                }
                WorkflowState::TaskReview => {
                    let index = self.context.cursor_task_index().unwrap_or(0);
                    effects.push(Effect::ReissueApprovalRequest(ApprovalKind::Task { index }));
                }
                _ => {}
            }
        }
        Ok(effects)
    }

    fn persist_snapshot(&self) -> Result<()> {
        if let Some(parent) = self.snapshot_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let snapshot = WorkflowSnapshot {
            state: self.state,
            context: self.context.clone(),
        };
        fs::write(&self.snapshot_path, serde_json::to_vec_pretty(&snapshot)?)?;
        Ok(())
    }

    fn clear_snapshot(&self) -> Result<()> {
        if self.snapshot_path.exists() {
            fs::remove_file(&self.snapshot_path)?;
        }
        Ok(())
    }
}
