//! # Capstan Engine
//!
//! Capstan runs choreography-style Sagas: an ordered sequence of business
//! steps where each step defines its own compensation, executed in-process
//! without a central broker. A failing step can trigger automatic rollback of
//! everything that completed before it, each compensation operating on the
//! state snapshot captured when its step ran.
//!
//! ## Key pieces
//!
//! - **`Step`** — the unit of work: `prepare`, `execute`, `rollback`, plus
//!   optional completion/failure observers. [`FnStep`] assembles one from
//!   async closures.
//! - **`Workflow`** — an ordered saga of steps sharing one
//!   [`NamespacedStateBag`]; itself a [`Step`], so sagas nest with snapshot
//!   isolation at the boundary.
//! - **`Report`** — the serializable tree recording what every stage did;
//!   business failures surface here, never as `Err`.
//! - **`RunContext`** — cancellation flag, derived values, and the join point
//!   for background callbacks, threaded through every hook.
//!
//! ## Usage
//!
//! ```rust
//! use capstan_engine::{ExecutionMode, FnStepBuilder, RunContext, Step, StepBuilder, WorkflowBuilder};
//! use capstan_types::Report;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let provision = FnStepBuilder::new("provision")
//!     .execute(|_ctx, step| async move {
//!         step.state().global().set("instance", "i-042".to_string());
//!         Ok(Report::success(step.id()))
//!     })
//!     .rollback(|_ctx, step| async move {
//!         let instance = step.state().global().get_cloned::<String>("instance");
//!         Ok(Report::success(step.id()).with_message(format!("released {instance:?}")))
//!     })
//!     .build()?;
//!
//! let workflow = WorkflowBuilder::new("deploy")
//!     .execution_mode(ExecutionMode::RollbackOnError)
//!     .step(provision)
//!     .build()?;
//!
//! let report = workflow.execute(RunContext::new()).await;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! The engine emits `tracing` events and installs no subscriber; the
//! embedding application owns logging setup. Cancellation and timeouts are
//! likewise the caller's: hooks observe [`RunContext::is_cancelled`] where
//! they choose, and the engine never imposes a deadline.

pub mod builder;
pub mod context;
pub mod error;
pub mod registry;
pub mod step;
pub mod workflow;

pub use builder::{DeferredStep, FnStepBuilder, StepBuilder, WorkflowBuilder};
pub use capstan_state::{NamespacedStateBag, StateBag};
pub use capstan_types::{Report, ReportAction, ReportStatus, StatusCounts};
pub use context::{CallbackSet, RunContext};
pub use error::BuildError;
pub use registry::Registry;
pub use step::{FnStep, Step, StepHandle};
pub use workflow::{ExecutionMode, RollbackMode, Workflow, WorkflowStatus};
