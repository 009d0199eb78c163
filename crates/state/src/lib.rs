//! Concurrent namespaced state for the capstan saga engine.
//!
//! Steps pass data forward through these bags, and rollback determinism rests
//! on copying them precisely: [`StateBag`] is the thread-safe key/value unit,
//! [`NamespacedStateBag`] composes the step-local, workflow-global, and named
//! scopes a step sees and defines how they are viewed, deep-copied, and
//! merged.

pub mod bag;
pub mod namespace;

pub use bag::StateBag;
pub use namespace::NamespacedStateBag;
