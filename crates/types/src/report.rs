//! Report tree describing what a saga run did.
//!
//! Every step stage produces exactly one [`Report`]; a workflow aggregates its
//! steps' reports as children and attaches compensation reports to the forward
//! reports they undo. Reports serialize to JSON and YAML and round-trip
//! losslessly, so they double as the audit record of a run.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Stage of the step lifecycle a report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportAction {
    /// Context derivation and validation before the business action ran.
    Prepare,
    /// The forward business action.
    Execute,
    /// The compensating action that undoes a completed step.
    Rollback,
}

impl fmt::Display for ReportAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            ReportAction::Prepare => "prepare",
            ReportAction::Execute => "execute",
            ReportAction::Rollback => "rollback",
        };
        f.write_str(token)
    }
}

/// Outcome of one lifecycle stage.
///
/// The status is derived, never set ad hoc: a captured error forces `Failed`,
/// an absent hook yields `Skipped`, anything else is `Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    /// The stage ran and reported no error.
    Success,
    /// The stage ran and failed, or a hook error was captured.
    Failed,
    /// No hook was configured for the stage; nothing ran.
    Skipped,
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            ReportStatus::Success => "success",
            ReportStatus::Failed => "failed",
            ReportStatus::Skipped => "skipped",
        };
        f.write_str(token)
    }
}

/// Tally of child report outcomes, used in workflow completion logs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Record of one step's or one workflow's outcome.
///
/// The driving engine synthesizes the envelope (id, action, timestamps) and
/// reconciles whatever a user hook returned into it via [`Report::with_report`],
/// so a report in a finished tree is always fully populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Step or workflow id this report belongs to.
    pub id: String,
    /// Lifecycle stage that produced the report.
    pub action: ReportAction,
    /// Derived outcome of the stage.
    pub status: ReportStatus,
    /// When the stage started.
    pub started_at: DateTime<Utc>,
    /// When the stage finished.
    pub finished_at: DateTime<Utc>,
    /// Error text captured from a failed hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Free-form human message supplied by the hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Hook-supplied annotations, insertion-ordered.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub metadata: IndexMap<String, String>,
    /// Per-step reports when this report describes a workflow.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Report>,
    /// Compensation report attached when this step was rolled back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Box<Report>>,
}

impl Report {
    fn base(id: impl Into<String>, status: ReportStatus) -> Self {
        let now = Utc::now();
        Report {
            id: id.into(),
            action: ReportAction::Execute,
            status,
            started_at: now,
            finished_at: now,
            error: None,
            message: None,
            metadata: IndexMap::new(),
            children: Vec::new(),
            rollback: None,
        }
    }

    /// Successful report for `id`, action defaulting to `Execute`.
    pub fn success(id: impl Into<String>) -> Self {
        Report::base(id, ReportStatus::Success)
    }

    /// Failed report for `id` carrying the error's display text.
    pub fn failure(id: impl Into<String>, error: impl fmt::Display) -> Self {
        let mut report = Report::base(id, ReportStatus::Failed);
        report.error = Some(error.to_string());
        report
    }

    /// Skipped report for `id`; the stage had no hook and nothing ran.
    pub fn skipped(id: impl Into<String>) -> Self {
        Report::base(id, ReportStatus::Skipped)
    }

    /// Sets the lifecycle stage.
    pub fn with_action(mut self, action: ReportAction) -> Self {
        self.action = action;
        self
    }

    /// Sets the human message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Adds one metadata annotation.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Reconciles a user-returned, possibly partial report into this one.
    ///
    /// User hooks are free-form and cannot be trusted to populate the envelope
    /// correctly, so `self` keeps its id, action, and timestamps while `source`
    /// supplies status, error, message, metadata, children, and any nested
    /// rollback report. A present error re-derives the status to `Failed` no
    /// matter what `source` claimed.
    pub fn with_report(mut self, source: Report) -> Self {
        self.status = source.status;
        self.error = source.error;
        if source.message.is_some() {
            self.message = source.message;
        }
        for (key, value) in source.metadata {
            self.metadata.insert(key, value);
        }
        if !source.children.is_empty() {
            self.children = source.children;
        }
        if source.rollback.is_some() {
            self.rollback = source.rollback;
        }
        if self.error.is_some() {
            self.status = ReportStatus::Failed;
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Success
    }

    pub fn is_failed(&self) -> bool {
        self.status == ReportStatus::Failed
    }

    pub fn is_skipped(&self) -> bool {
        self.status == ReportStatus::Skipped
    }

    /// Wall-clock span between start and finish.
    pub fn duration(&self) -> Duration {
        self.finished_at - self.started_at
    }

    /// Tallies the direct children by status.
    pub fn child_status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for child in &self.children {
            match child.status {
                ReportStatus::Success => counts.succeeded += 1,
                ReportStatus::Failed => counts.failed += 1,
                ReportStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Report {
        let rolled_back = Report::success("provision")
            .with_action(ReportAction::Rollback)
            .with_message("instance released");
        let mut provision = Report::success("provision").with_metadata("instance", "i-042");
        provision.rollback = Some(Box::new(rolled_back));
        let verify = Report::failure("verify", "health check timed out");
        let mut workflow = Report::failure("deploy", "1 of 2 steps failed");
        workflow.children = vec![provision, verify];
        workflow
    }

    #[test]
    fn constructors_derive_status() {
        assert_eq!(Report::success("a").status, ReportStatus::Success);
        assert_eq!(Report::skipped("a").status, ReportStatus::Skipped);

        let failed = Report::failure("a", "boom");
        assert_eq!(failed.status, ReportStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn with_report_keeps_envelope_and_takes_payload() {
        let mut envelope = Report::success("step-1");
        envelope.action = ReportAction::Rollback;
        let started_at = envelope.started_at;

        let user = Report::failure("wrong-id", "undo failed")
            .with_action(ReportAction::Execute)
            .with_message("gave up after 3 attempts")
            .with_metadata("attempts", "3");

        let merged = envelope.with_report(user);
        assert_eq!(merged.id, "step-1");
        assert_eq!(merged.action, ReportAction::Rollback);
        assert_eq!(merged.started_at, started_at);
        assert_eq!(merged.status, ReportStatus::Failed);
        assert_eq!(merged.error.as_deref(), Some("undo failed"));
        assert_eq!(merged.message.as_deref(), Some("gave up after 3 attempts"));
        assert_eq!(merged.metadata.get("attempts").map(String::as_str), Some("3"));
    }

    #[test]
    fn with_report_rederives_failed_when_error_present() {
        let mut user = Report::success("s");
        user.error = Some("stale claim of success".into());

        let merged = Report::success("s").with_report(user);
        assert_eq!(merged.status, ReportStatus::Failed);
    }

    #[test]
    fn child_status_counts_tallies_direct_children() {
        let mut report = Report::success("wf");
        report.children = vec![
            Report::success("a"),
            Report::skipped("b"),
            Report::failure("c", "boom"),
            Report::success("d"),
        ];
        let counts = report.child_status_counts();
        assert_eq!(counts.succeeded, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.skipped, 1);
    }

    #[test]
    fn json_round_trip_preserves_tree() {
        let report = sample_tree();
        let encoded = serde_json::to_string(&report).unwrap();
        let decoded: Report = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, report);
        assert_eq!(decoded.children[1].error.as_deref(), Some("health check timed out"));
        assert!(decoded.children[0].rollback.is_some());
    }

    #[test]
    fn yaml_round_trip_preserves_tree() {
        let report = sample_tree();
        let encoded = serde_yaml::to_string(&report).unwrap();
        let decoded: Report = serde_yaml::from_str(&encoded).unwrap();
        assert_eq!(decoded, report);
        assert_eq!(decoded.status, ReportStatus::Failed);
    }

    #[test]
    fn status_and_action_use_lowercase_tokens() {
        assert_eq!(serde_json::to_string(&ReportStatus::Success).unwrap(), "\"success\"");
        assert_eq!(serde_json::to_string(&ReportStatus::Failed).unwrap(), "\"failed\"");
        assert_eq!(serde_json::to_string(&ReportStatus::Skipped).unwrap(), "\"skipped\"");
        assert_eq!(serde_json::to_string(&ReportAction::Prepare).unwrap(), "\"prepare\"");
        assert_eq!(serde_json::to_string(&ReportAction::Execute).unwrap(), "\"execute\"");
        assert_eq!(serde_json::to_string(&ReportAction::Rollback).unwrap(), "\"rollback\"");
        assert_eq!(ReportStatus::Skipped.to_string(), "skipped");
        assert_eq!(ReportAction::Rollback.to_string(), "rollback");
    }

    #[test]
    fn unknown_tokens_fail_to_decode() {
        assert!(serde_json::from_str::<ReportStatus>("\"pending\"").is_err());
        assert!(serde_json::from_str::<ReportAction>("\"retry\"").is_err());
        assert!(serde_yaml::from_str::<ReportStatus>("pending").is_err());
    }

    #[test]
    fn duration_is_finish_minus_start() {
        let mut report = Report::success("a");
        report.finished_at = report.started_at + Duration::milliseconds(250);
        assert_eq!(report.duration(), Duration::milliseconds(250));
    }
}
