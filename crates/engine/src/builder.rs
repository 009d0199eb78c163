//! Fluent construction surface for steps and workflows.
//!
//! Builders validate the wiring before anything runs: empty ids, missing
//! execute hooks, and duplicate step ids are [`BuildError`]s at build time,
//! not failures at run time. Every `build` call produces a fresh step, so a
//! builder held by a [`Registry`](crate::registry::Registry) is safely
//! reusable.

use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use capstan_state::NamespacedStateBag;
use capstan_types::Report;
use tracing::debug;

use crate::context::RunContext;
use crate::error::BuildError;
use crate::step::{ActionHook, FnStep, PrepareHook, ReportHook, Step, StepHandle};
use crate::workflow::{ExecutionMode, RollbackMode, Workflow};

/// Produces steps on demand, typically through a
/// [`Registry`](crate::registry::Registry).
///
/// `build` takes `&self` and returns a fresh step each call. A failing build
/// is an ordinary [`BuildError`]; when resolution must be deferred to run
/// time, wrap the builder in a [`DeferredStep`] and the failure surfaces as a
/// Prepare-stage Failed report instead.
pub trait StepBuilder: Send + Sync {
    /// Id of the step this builder produces.
    fn id(&self) -> &str;

    /// Checks the wiring without constructing anything.
    fn validate(&self) -> Result<(), BuildError>;

    /// Constructs a fresh step.
    fn build(&self) -> Result<Arc<dyn Step>, BuildError>;
}

impl std::fmt::Debug for dyn StepBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepBuilder").field("id", &self.id()).finish_non_exhaustive()
    }
}

/// Assembles an [`FnStep`] from async hook closures.
#[derive(Clone, Default)]
pub struct FnStepBuilder {
    id: String,
    prepare: Option<PrepareHook>,
    execute: Option<ActionHook>,
    rollback: Option<ActionHook>,
    on_completion: Option<ReportHook>,
    on_failure: Option<ReportHook>,
    async_callbacks: bool,
}

impl FnStepBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        FnStepBuilder {
            id: id.into(),
            ..FnStepBuilder::default()
        }
    }

    /// Hook deriving the context the execute stage will see.
    pub fn prepare<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(RunContext, StepHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RunContext>> + Send + 'static,
    {
        self.prepare = Some(Arc::new(move |ctx, step| Box::pin(hook(ctx, step))));
        self
    }

    /// Forward business action. Required; `build` rejects its absence.
    pub fn execute<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(RunContext, StepHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Report>> + Send + 'static,
    {
        self.execute = Some(Arc::new(move |ctx, step| Box::pin(hook(ctx, step))));
        self
    }

    /// Compensating action. Optional: a step without one reports Skipped when
    /// rolled back.
    pub fn rollback<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(RunContext, StepHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Report>> + Send + 'static,
    {
        self.rollback = Some(Arc::new(move |ctx, step| Box::pin(hook(ctx, step))));
        self
    }

    /// Observer invoked with every successful stage report.
    pub fn on_completion<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Report) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_completion = Some(Arc::new(move |report| Box::pin(hook(report))));
        self
    }

    /// Observer invoked with every failed stage report.
    pub fn on_failure<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Report) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_failure = Some(Arc::new(move |report| Box::pin(hook(report))));
        self
    }

    /// Dispatches completion/failure observers as background tasks registered
    /// with the run context instead of awaiting them inline.
    pub fn with_async_callbacks(mut self, enabled: bool) -> Self {
        self.async_callbacks = enabled;
        self
    }
}

impl StepBuilder for FnStepBuilder {
    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), BuildError> {
        if self.id.is_empty() {
            return Err(BuildError::EmptyStepId);
        }
        if self.execute.is_none() {
            return Err(BuildError::MissingExecuteHook(self.id.clone()));
        }
        Ok(())
    }

    fn build(&self) -> Result<Arc<dyn Step>, BuildError> {
        self.validate()?;
        Ok(Arc::new(FnStep {
            id: self.id.clone(),
            prepare: self.prepare.clone(),
            execute: self.execute.clone(),
            rollback: self.rollback.clone(),
            on_completion: self.on_completion.clone(),
            on_failure: self.on_failure.clone(),
            async_callbacks: self.async_callbacks,
            attached_state: Mutex::new(None),
        }))
    }
}

/// Assembles a [`Workflow`] from steps, failure policies, and hooks.
#[derive(Clone, Default)]
pub struct WorkflowBuilder {
    pub(crate) id: String,
    pub(crate) steps: Vec<Arc<dyn Step>>,
    pub(crate) execution_mode: ExecutionMode,
    pub(crate) rollback_mode: RollbackMode,
    pub(crate) rollback_override: Option<ActionHook>,
    pub(crate) on_completion: Option<ReportHook>,
    pub(crate) on_failure: Option<ReportHook>,
    pub(crate) async_callbacks: bool,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        WorkflowBuilder {
            id: id.into(),
            ..WorkflowBuilder::default()
        }
    }

    /// Appends one step; execution order is append order.
    pub fn step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends the given steps in order.
    pub fn steps(mut self, steps: impl IntoIterator<Item = Arc<dyn Step>>) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn rollback_mode(mut self, mode: RollbackMode) -> Self {
        self.rollback_mode = mode;
        self
    }

    /// Replaces the reverse step traversal for direct rollback invocations
    /// with one whole-workflow compensation.
    pub fn rollback_override<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(RunContext, StepHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Report>> + Send + 'static,
    {
        self.rollback_override = Some(Arc::new(move |ctx, step| Box::pin(hook(ctx, step))));
        self
    }

    /// Observer invoked with the aggregate report of a successful run.
    pub fn on_completion<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Report) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_completion = Some(Arc::new(move |report| Box::pin(hook(report))));
        self
    }

    /// Observer invoked with the aggregate report of a failed run.
    pub fn on_failure<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Report) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_failure = Some(Arc::new(move |report| Box::pin(hook(report))));
        self
    }

    pub fn with_async_callbacks(mut self, enabled: bool) -> Self {
        self.async_callbacks = enabled;
        self
    }

    /// Constructs the workflow, rejecting empty ids and duplicate step ids.
    pub fn build(&self) -> Result<Workflow, BuildError> {
        self.validate()?;
        debug!(workflow_id = %self.id, step_count = self.steps.len(), "workflow built");
        Ok(Workflow::from_builder(self))
    }
}

impl StepBuilder for WorkflowBuilder {
    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), BuildError> {
        if self.id.is_empty() {
            return Err(BuildError::EmptyWorkflowId);
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.id().is_empty() {
                return Err(BuildError::EmptyStepId);
            }
            if !seen.insert(step.id().to_string()) {
                return Err(BuildError::DuplicateStepId(step.id().to_string()));
            }
        }
        Ok(())
    }

    fn build(&self) -> Result<Arc<dyn Step>, BuildError> {
        Ok(Arc::new(WorkflowBuilder::build(self)?))
    }
}

/// Step whose construction is deferred to run time.
///
/// Wraps a [`StepBuilder`] and builds on first `prepare`; a build failure
/// becomes the prepare error, which the driving workflow records as a
/// Prepare-stage Failed report instead of panicking. State attached before
/// the build is held and handed to the built step.
pub struct DeferredStep {
    id: String,
    builder: Arc<dyn StepBuilder>,
    inner: Mutex<Option<Arc<dyn Step>>>,
    pending_state: Mutex<Option<Arc<NamespacedStateBag>>>,
}

impl DeferredStep {
    pub fn new(builder: Arc<dyn StepBuilder>) -> Self {
        DeferredStep {
            id: builder.id().to_string(),
            builder,
            inner: Mutex::new(None),
            pending_state: Mutex::new(None),
        }
    }

    fn built(&self) -> Option<Arc<dyn Step>> {
        self.inner.lock().expect("deferred step lock").clone()
    }

    fn build_once(&self) -> Result<Arc<dyn Step>, BuildError> {
        let mut inner = self.inner.lock().expect("deferred step lock");
        if let Some(step) = inner.as_ref() {
            return Ok(Arc::clone(step));
        }
        let step = self.builder.build()?;
        if let Some(state) = self.pending_state.lock().expect("deferred step lock").take() {
            step.attach_state(state);
        }
        *inner = Some(Arc::clone(&step));
        Ok(step)
    }
}

#[async_trait::async_trait]
impl Step for DeferredStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> Arc<NamespacedStateBag> {
        match self.built() {
            Some(step) => step.state(),
            None => {
                let mut pending = self.pending_state.lock().expect("deferred step lock");
                Arc::clone(pending.get_or_insert_with(|| Arc::new(NamespacedStateBag::new())))
            }
        }
    }

    fn attach_state(&self, state: Arc<NamespacedStateBag>) {
        match self.built() {
            Some(step) => step.attach_state(state),
            None => *self.pending_state.lock().expect("deferred step lock") = Some(state),
        }
    }

    async fn prepare(&self, ctx: RunContext) -> Result<RunContext> {
        let step = self.build_once()?;
        step.prepare(ctx).await
    }

    async fn execute(&self, ctx: RunContext) -> Report {
        match self.build_once() {
            Ok(step) => step.execute(ctx).await,
            Err(error) => Report::failure(&self.id, error),
        }
    }

    /// A never-built step has done nothing; there is nothing to compensate.
    async fn rollback(&self, ctx: RunContext) -> Report {
        match self.built() {
            Some(step) => step.rollback(ctx).await,
            None => Report::skipped(&self.id).with_action(capstan_types::ReportAction::Rollback),
        }
    }

    fn is_composite(&self) -> bool {
        self.built().is_some_and(|step| step.is_composite())
    }
}
