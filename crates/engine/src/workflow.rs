//! Workflow: an ordered saga of steps driven forward, with reverse
//! compensation when a step fails.
//!
//! A workflow is itself a [`Step`], so sagas nest; the nested workflow runs
//! against a snapshot of the parent state and its mutations never write
//! back. Execution within one instance is strictly sequential, which is what
//! makes compensation ordering deterministic; run one instance from one task
//! at a time.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use capstan_state::NamespacedStateBag;
use capstan_types::{Report, ReportAction, ReportStatus};
use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::builder::WorkflowBuilder;
use crate::context::RunContext;
use crate::step::{ActionHook, ReportHook, Step, StepHandle, dispatch_report_hooks};

/// Policy applied when a forward step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Halt at the first failure without compensation.
    #[default]
    StopOnError,
    /// Record failures and keep executing subsequent steps. Never
    /// compensates; a caller who wants compensation afterwards invokes
    /// `rollback` explicitly.
    ContinueOnError,
    /// Compensate previously completed steps in reverse order, then halt.
    RollbackOnError,
}

/// Policy applied when a compensation itself fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackMode {
    /// Keep compensating earlier steps past a failed compensation.
    #[default]
    ContinueOnError,
    /// Abort outstanding compensations at the first failure, leaving earlier
    /// steps un-compensated. The workflow report surfaces where compensation
    /// halted.
    StopOnError,
}

/// Lifecycle of one workflow instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    NotStarted,
    Executing,
    Completed,
    Failed,
    RolledBack,
}

/// Ordered saga of steps sharing one [`NamespacedStateBag`].
///
/// Built by [`WorkflowBuilder`]; the step list is fixed after build. Forward
/// execution hands each step a view of the shared state (or a snapshot, for
/// nested workflows), captures a per-step snapshot for rollback determinism,
/// and aggregates every step report into one tree.
pub struct Workflow {
    id: String,
    steps: Vec<Arc<dyn Step>>,
    state: RwLock<Arc<NamespacedStateBag>>,
    execution_mode: ExecutionMode,
    rollback_mode: RollbackMode,
    status: RwLock<WorkflowStatus>,
    snapshots: Mutex<Vec<Option<Arc<NamespacedStateBag>>>>,
    rollback_override: Option<ActionHook>,
    on_completion: Option<ReportHook>,
    on_failure: Option<ReportHook>,
    async_callbacks: bool,
}

impl Workflow {
    pub(crate) fn from_builder(builder: &WorkflowBuilder) -> Self {
        Workflow {
            id: builder.id.clone(),
            steps: builder.steps.clone(),
            state: RwLock::new(Arc::new(NamespacedStateBag::new())),
            execution_mode: builder.execution_mode,
            rollback_mode: builder.rollback_mode,
            status: RwLock::new(WorkflowStatus::NotStarted),
            snapshots: Mutex::new(Vec::new()),
            rollback_override: builder.rollback_override.clone(),
            on_completion: builder.on_completion.clone(),
            on_failure: builder.on_failure.clone(),
            async_callbacks: builder.async_callbacks,
        }
    }

    pub fn status(&self) -> WorkflowStatus {
        *self.status.read().expect("workflow status lock")
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    pub fn rollback_mode(&self) -> RollbackMode {
        self.rollback_mode
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    fn current_state(&self) -> Arc<NamespacedStateBag> {
        Arc::clone(&self.state.read().expect("workflow state lock"))
    }

    fn set_status(&self, status: WorkflowStatus) {
        *self.status.write().expect("workflow status lock") = status;
    }

    fn handle(&self) -> StepHandle {
        StepHandle::new(self.id.as_str(), self.current_state())
    }

    async fn run_forward(&self, ctx: RunContext) -> Report {
        let started_at = Utc::now();
        self.set_status(WorkflowStatus::Executing);
        info!(
            workflow_id = %self.id,
            step_count = self.steps.len(),
            mode = ?self.execution_mode,
            "workflow execution started"
        );

        {
            let mut snapshots = self.snapshots.lock().expect("workflow snapshots lock");
            snapshots.clear();
            snapshots.resize_with(self.steps.len(), || None);
        }

        let run_state = self.current_state();
        let mut children: Vec<Report> = Vec::with_capacity(self.steps.len());
        let mut rolled_back = false;
        let mut compensation_halted_at: Option<String> = None;

        for (index, step) in self.steps.iter().enumerate() {
            let handed: Arc<NamespacedStateBag> = if step.is_composite() {
                // Nested workflows mutate a copy; nothing writes back.
                Arc::new(run_state.snapshot())
            } else {
                Arc::new(run_state.step_view())
            };
            step.attach_state(Arc::clone(&handed));

            debug!(workflow_id = %self.id, step_id = %step.id(), index, "step started");

            let report = match step.prepare(ctx.clone()).await {
                Ok(step_ctx) => step.execute(step_ctx).await,
                Err(error) => {
                    warn!(
                        workflow_id = %self.id,
                        step_id = %step.id(),
                        error = %error,
                        "step preparation failed"
                    );
                    Report::failure(step.id(), error).with_action(ReportAction::Prepare)
                }
            };

            // Captured after the step ran: the snapshot carries the step's
            // own writes and nothing a later step does.
            {
                let mut snapshots = self.snapshots.lock().expect("workflow snapshots lock");
                snapshots[index] = Some(Arc::new(handed.snapshot()));
            }

            let failed = report.is_failed();
            children.push(report);
            if !failed {
                continue;
            }

            match self.execution_mode {
                ExecutionMode::ContinueOnError => {
                    debug!(workflow_id = %self.id, step_id = %step.id(), "continuing past failed step");
                }
                ExecutionMode::StopOnError => {
                    warn!(workflow_id = %self.id, step_id = %step.id(), "stopping workflow, no compensation");
                    break;
                }
                ExecutionMode::RollbackOnError => {
                    warn!(
                        workflow_id = %self.id,
                        step_id = %step.id(),
                        "compensating previously completed steps"
                    );
                    if index > 0 {
                        let snapshots = self.snapshots.lock().expect("workflow snapshots lock").clone();
                        let reports = self.rollback_range(ctx.clone(), index - 1, Some(&snapshots)).await;
                        if reports.len() < index {
                            compensation_halted_at = reports.keys().last().cloned();
                        }
                        for (step_id, rollback_report) in reports {
                            if let Some(child) = children.iter_mut().find(|child| child.id == step_id) {
                                child.rollback = Some(Box::new(rollback_report));
                            }
                        }
                    }
                    rolled_back = true;
                    break;
                }
            }
        }

        let failed_count = children.iter().filter(|child| child.is_failed()).count();
        let any_failed = failed_count > 0;

        let mut report = Report::success(&self.id);
        report.action = ReportAction::Execute;
        report.started_at = started_at;
        report.children = children;
        if any_failed {
            report.status = ReportStatus::Failed;
            report.error = Some(format!("{failed_count} of {} steps failed", self.steps.len()));
        }
        if rolled_back {
            report.metadata.insert("rolled_back".into(), "true".into());
        }
        if let Some(step_id) = compensation_halted_at {
            report.metadata.insert("compensation_halted_at".into(), step_id);
        }
        report.finished_at = Utc::now();

        let final_status = if rolled_back {
            WorkflowStatus::RolledBack
        } else if any_failed {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };
        self.set_status(final_status);

        let counts = report.child_status_counts();
        info!(
            workflow_id = %self.id,
            status = ?final_status,
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            "workflow execution finished"
        );

        dispatch_report_hooks(
            &ctx,
            &report,
            self.on_completion.as_ref(),
            self.on_failure.as_ref(),
            self.async_callbacks,
        )
        .await;
        ctx.join_callbacks().await;
        report
    }

    /// Walks steps from `start` down to 0, invoking each compensation against
    /// its snapshot, or against the current workflow state when no snapshot
    /// was captured. Returns the reports keyed by step id in traversal order.
    async fn rollback_range(
        &self,
        ctx: RunContext,
        start: usize,
        snapshots: Option<&[Option<Arc<NamespacedStateBag>>]>,
    ) -> IndexMap<String, Report> {
        let mut reports = IndexMap::new();
        for index in (0..=start).rev() {
            let step = &self.steps[index];
            let state = snapshots
                .and_then(|all| all.get(index).cloned())
                .flatten()
                .unwrap_or_else(|| self.current_state());
            step.attach_state(state);

            debug!(workflow_id = %self.id, step_id = %step.id(), index, "step rollback started");
            let mut report = step.rollback(ctx.clone()).await;
            // Forced for consistency no matter what the hook produced.
            report.action = ReportAction::Rollback;

            let failed = report.is_failed();
            if failed {
                warn!(
                    workflow_id = %self.id,
                    step_id = %step.id(),
                    error = report.error.as_deref().unwrap_or("unspecified"),
                    "step rollback failed"
                );
            }
            reports.insert(step.id().to_string(), report);

            if failed && self.rollback_mode == RollbackMode::StopOnError {
                warn!(
                    workflow_id = %self.id,
                    step_id = %step.id(),
                    remaining = index,
                    "compensation aborted, earlier steps left un-compensated"
                );
                break;
            }
        }
        reports
    }
}

#[async_trait]
impl Step for Workflow {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> Arc<NamespacedStateBag> {
        self.current_state()
    }

    fn attach_state(&self, state: Arc<NamespacedStateBag>) {
        *self.state.write().expect("workflow state lock") = state;
    }

    async fn execute(&self, ctx: RunContext) -> Report {
        self.run_forward(ctx).await
    }

    /// Compensates every step in reverse against the current state, or runs
    /// the configured whole-workflow override instead.
    async fn rollback(&self, ctx: RunContext) -> Report {
        let report = match &self.rollback_override {
            Some(hook) => {
                debug!(workflow_id = %self.id, "running workflow rollback override");
                let started_at = Utc::now();
                let mut report = match hook(ctx.clone(), self.handle()).await {
                    Ok(user) => Report::success(&self.id).with_report(user),
                    Err(error) => {
                        warn!(workflow_id = %self.id, error = %error, "workflow rollback override failed");
                        Report::failure(&self.id, error)
                    }
                };
                report.action = ReportAction::Rollback;
                report.started_at = started_at;
                report.finished_at = Utc::now();
                report
            }
            None if self.steps.is_empty() => Report::skipped(&self.id).with_action(ReportAction::Rollback),
            None => {
                let started_at = Utc::now();
                let reports = self.rollback_range(ctx.clone(), self.steps.len() - 1, None).await;
                let any_failed = reports.values().any(Report::is_failed);
                let mut report = Report::success(&self.id);
                report.action = ReportAction::Rollback;
                report.started_at = started_at;
                report.children = reports.into_values().collect();
                if any_failed {
                    report.status = ReportStatus::Failed;
                    report.error = Some("one or more compensations failed".into());
                }
                report.finished_at = Utc::now();
                report
            }
        };

        if self.rollback_override.is_some() || !self.steps.is_empty() {
            self.set_status(WorkflowStatus::RolledBack);
        }
        dispatch_report_hooks(
            &ctx,
            &report,
            self.on_completion.as_ref(),
            self.on_failure.as_ref(),
            self.async_callbacks,
        )
        .await;
        ctx.join_callbacks().await;
        report
    }

    fn is_composite(&self) -> bool {
        true
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("steps", &self.steps.len())
            .field("execution_mode", &self.execution_mode)
            .field("rollback_mode", &self.rollback_mode)
            .field("status", &self.status())
            .finish()
    }
}
