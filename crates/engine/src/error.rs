//! Construction-time error taxonomy.

use thiserror::Error;

/// Errors raised while assembling steps and workflows.
///
/// These are programming errors: a caller wired the saga wrong. Business
/// failures never appear here — they surface as Failed reports in the
/// returned report tree.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("workflow id must not be empty")]
    EmptyWorkflowId,
    #[error("step id must not be empty")]
    EmptyStepId,
    #[error("step '{0}' has no execute hook")]
    MissingExecuteHook(String),
    #[error("duplicate step id '{0}' within one workflow")]
    DuplicateStepId(String),
    #[error("no builder registered for id '{0}'")]
    UnknownBuilder(String),
}
