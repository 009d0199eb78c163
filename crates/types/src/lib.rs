//! Shared data types for the capstan saga engine.
//!
//! The report tree is the engine's one observable artifact: every stage of
//! every step produces a [`Report`], workflows aggregate them, and the whole
//! tree serializes to JSON or YAML for auditing. This crate stays
//! dependency-light so step implementations can use it without pulling in the
//! engine.

pub mod report;

pub use report::{Report, ReportAction, ReportStatus, StatusCounts};
