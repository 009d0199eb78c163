//! Step trait and the hook-driven implementation the builders produce.

use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use capstan_state::NamespacedStateBag;
use capstan_types::{Report, ReportAction, ReportStatus};
use chrono::Utc;
use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::context::RunContext;

/// Hook that derives the context a step's `execute` stage will see.
pub type PrepareHook =
    Arc<dyn Fn(RunContext, StepHandle) -> BoxFuture<'static, Result<RunContext>> + Send + Sync>;

/// Forward or compensating business action.
pub type ActionHook =
    Arc<dyn Fn(RunContext, StepHandle) -> BoxFuture<'static, Result<Report>> + Send + Sync>;

/// Observer invoked with the finished report of its step or workflow.
pub type ReportHook = Arc<dyn Fn(Report) -> BoxFuture<'static, ()> + Send + Sync>;

/// Unit of work inside a saga.
///
/// The engine drives `prepare` → `execute` forward and `rollback` backward,
/// attaching the state each stage must use beforehand. Business failures are
/// never `Err`: `execute` and `rollback` always return a [`Report`] and
/// callers inspect its status.
#[async_trait]
pub trait Step: Send + Sync {
    /// Identifier, unique within the owning workflow.
    fn id(&self) -> &str;

    /// State the step reads and writes.
    ///
    /// Self-created on first use when the step runs standalone; a driving
    /// workflow replaces it before every stage.
    fn state(&self) -> Arc<NamespacedStateBag>;

    /// Hands the step the state its next stage must operate on.
    fn attach_state(&self, state: Arc<NamespacedStateBag>);

    /// Derives the context `execute` will receive.
    ///
    /// An error means the step cannot run; the driving workflow records it as
    /// a Prepare-stage Failed report and `execute` never runs.
    async fn prepare(&self, ctx: RunContext) -> Result<RunContext> {
        Ok(ctx)
    }

    /// Runs the forward business action.
    async fn execute(&self, ctx: RunContext) -> Report;

    /// Runs the compensating action.
    ///
    /// Steps without compensation report Skipped: some actions are
    /// irreversible, which is a business decision rather than a defect.
    async fn rollback(&self, ctx: RunContext) -> Report;

    /// Whether the step is itself a workflow.
    ///
    /// Composite steps receive a snapshot of the parent state instead of a
    /// shared view, so nested mutations cannot write back.
    fn is_composite(&self) -> bool {
        false
    }
}

impl fmt::Debug for dyn Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("id", &self.id()).finish_non_exhaustive()
    }
}

/// Execution-time view of a step handed to its hooks.
#[derive(Debug, Clone)]
pub struct StepHandle {
    id: Arc<str>,
    state: Arc<NamespacedStateBag>,
}

impl StepHandle {
    pub fn new(id: impl Into<Arc<str>>, state: Arc<NamespacedStateBag>) -> Self {
        StepHandle {
            id: id.into(),
            state,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &NamespacedStateBag {
        &self.state
    }
}

/// Dispatches the completion or failure hook matching `report`'s status.
///
/// Sync dispatch awaits the hook inline; async dispatch spawns it against a
/// cloned report and registers the task with the context's callback set.
/// Skipped reports dispatch nothing.
pub(crate) async fn dispatch_report_hooks(
    ctx: &RunContext,
    report: &Report,
    on_completion: Option<&ReportHook>,
    on_failure: Option<&ReportHook>,
    async_callbacks: bool,
) {
    let hook = match report.status {
        ReportStatus::Success => on_completion,
        ReportStatus::Failed => on_failure,
        ReportStatus::Skipped => None,
    };
    let Some(hook) = hook else { return };
    if async_callbacks {
        let hook = Arc::clone(hook);
        let snapshot = report.clone();
        ctx.callbacks().push(tokio::spawn(async move { hook(snapshot).await }));
    } else {
        hook(report.clone()).await;
    }
}

/// Hook-holding step assembled by
/// [`FnStepBuilder`](crate::builder::FnStepBuilder).
pub struct FnStep {
    pub(crate) id: String,
    pub(crate) prepare: Option<PrepareHook>,
    pub(crate) execute: Option<ActionHook>,
    pub(crate) rollback: Option<ActionHook>,
    pub(crate) on_completion: Option<ReportHook>,
    pub(crate) on_failure: Option<ReportHook>,
    pub(crate) async_callbacks: bool,
    pub(crate) attached_state: Mutex<Option<Arc<NamespacedStateBag>>>,
}

impl FnStep {
    fn handle(&self) -> StepHandle {
        StepHandle::new(self.id.as_str(), Step::state(self))
    }

    async fn run_action(&self, ctx: RunContext, action: ReportAction, hook: Option<&ActionHook>) -> Report {
        let started_at = Utc::now();
        let mut report = match hook {
            None => {
                debug!(step_id = %self.id, action = %action, "no hook configured, skipping");
                Report::skipped(&self.id)
            }
            Some(hook) => match hook(ctx.clone(), self.handle()).await {
                Ok(user) => Report::success(&self.id).with_report(user),
                Err(error) => {
                    warn!(step_id = %self.id, action = %action, error = %error, "step hook failed");
                    Report::failure(&self.id, error)
                }
            },
        };
        report.action = action;
        report.started_at = started_at;
        report.finished_at = Utc::now();
        dispatch_report_hooks(
            &ctx,
            &report,
            self.on_completion.as_ref(),
            self.on_failure.as_ref(),
            self.async_callbacks,
        )
        .await;
        report
    }
}

#[async_trait]
impl Step for FnStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> Arc<NamespacedStateBag> {
        let mut slot = self.attached_state.lock().expect("step state lock");
        Arc::clone(slot.get_or_insert_with(|| Arc::new(NamespacedStateBag::new())))
    }

    fn attach_state(&self, state: Arc<NamespacedStateBag>) {
        *self.attached_state.lock().expect("step state lock") = Some(state);
    }

    async fn prepare(&self, ctx: RunContext) -> Result<RunContext> {
        match &self.prepare {
            None => Ok(ctx),
            Some(hook) => hook(ctx, self.handle()).await,
        }
    }

    async fn execute(&self, ctx: RunContext) -> Report {
        debug!(step_id = %self.id, "step execution started");
        self.run_action(ctx, ReportAction::Execute, self.execute.as_ref()).await
    }

    async fn rollback(&self, ctx: RunContext) -> Report {
        debug!(step_id = %self.id, "step rollback started");
        self.run_action(ctx, ReportAction::Rollback, self.rollback.as_ref()).await
    }
}

impl fmt::Debug for FnStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep")
            .field("id", &self.id)
            .field("has_prepare", &self.prepare.is_some())
            .field("has_execute", &self.execute.is_some())
            .field("has_rollback", &self.rollback.is_some())
            .field("async_callbacks", &self.async_callbacks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{FnStepBuilder, StepBuilder};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bare_step(id: &str) -> FnStep {
        FnStep {
            id: id.into(),
            prepare: None,
            execute: None,
            rollback: None,
            on_completion: None,
            on_failure: None,
            async_callbacks: false,
            attached_state: Mutex::new(None),
        }
    }

    #[tokio::test]
    async fn missing_hooks_report_skipped() {
        let step = bare_step("noop");

        let executed = step.execute(RunContext::new()).await;
        assert!(executed.is_skipped());
        assert_eq!(executed.action, ReportAction::Execute);

        let rolled_back = step.rollback(RunContext::new()).await;
        assert!(rolled_back.is_skipped());
        assert_eq!(rolled_back.action, ReportAction::Rollback);
    }

    #[tokio::test]
    async fn hook_error_becomes_failed_report_and_fires_on_failure() {
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failures);
        let step = FnStepBuilder::new("provision")
            .execute(|_ctx, _step| async { Err(anyhow::anyhow!("quota exceeded")) })
            .on_failure(move |report| {
                let seen = Arc::clone(&seen);
                async move {
                    assert!(report.is_failed());
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build()
            .unwrap();

        let report = step.execute(RunContext::new()).await;
        assert!(report.is_failed());
        assert_eq!(report.error.as_deref(), Some("quota exceeded"));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn user_report_is_reconciled_into_envelope() {
        let step = FnStepBuilder::new("verify")
            .execute(|_ctx, _step| async {
                Ok(Report::success("some-other-id").with_message("all healthy"))
            })
            .build()
            .unwrap();

        let report = step.execute(RunContext::new()).await;
        assert_eq!(report.id, "verify");
        assert_eq!(report.action, ReportAction::Execute);
        assert!(report.is_success());
        assert_eq!(report.message.as_deref(), Some("all healthy"));
    }

    #[tokio::test]
    async fn prepare_derives_the_context_execute_sees() {
        let observed = Arc::new(Mutex::new(None::<String>));
        let sink = Arc::clone(&observed);
        let step = FnStepBuilder::new("deploy")
            .prepare(|ctx, _step| async move { Ok(ctx.with_value("release", "v42")) })
            .execute(move |ctx, step| {
                let sink = Arc::clone(&sink);
                async move {
                    *sink.lock().unwrap() = ctx.value("release").map(str::to_string);
                    Ok(Report::success(step.id()))
                }
            })
            .build()
            .unwrap();

        let ctx = step.prepare(RunContext::new()).await.unwrap();
        let report = step.execute(ctx).await;
        assert!(report.is_success());
        assert_eq!(observed.lock().unwrap().as_deref(), Some("v42"));
    }

    #[tokio::test]
    async fn async_callbacks_run_after_join() {
        let completions = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&completions);
        let step = FnStepBuilder::new("notify")
            .execute(|_ctx, step| async move { Ok(Report::success(step.id())) })
            .on_completion(move |_report| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            })
            .with_async_callbacks(true)
            .build()
            .unwrap();

        let ctx = RunContext::new();
        let report = step.execute(ctx.clone()).await;
        assert!(report.is_success());

        ctx.join_callbacks().await;
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skipped_stage_fires_no_callbacks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let on_completion = Arc::clone(&calls);
        let on_failure = Arc::clone(&calls);
        let step = FnStepBuilder::new("irreversible")
            .execute(|_ctx, step| async move { Ok(Report::success(step.id())) })
            .on_completion(move |_report| {
                let calls = Arc::clone(&on_completion);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_failure(move |_report| {
                let calls = Arc::clone(&on_failure);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build()
            .unwrap();

        // No rollback hook: Skipped, and neither callback fires.
        let report = step.rollback(RunContext::new()).await;
        assert!(report.is_skipped());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn standalone_step_owns_its_state_until_attached() {
        let step = bare_step("standalone");
        let first = step.state();
        let second = step.state();
        assert!(Arc::ptr_eq(&first, &second));

        let replacement = Arc::new(NamespacedStateBag::new());
        replacement.global().set("env", "prod".to_string());
        step.attach_state(Arc::clone(&replacement));
        assert!(Arc::ptr_eq(&step.state(), &replacement));
        assert_eq!(
            step.state().global().get_cloned::<String>("env").as_deref(),
            Some("prod")
        );
    }
}
