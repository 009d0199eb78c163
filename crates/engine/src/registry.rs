//! Name-based lookup of step builders.
//!
//! Embedding applications register their concrete builders once and resolve
//! them by id while assembling workflows. The registry hands out builders,
//! not steps: every resolution still goes through the builder's own
//! validation, and [`DeferredStep`](crate::builder::DeferredStep) covers the
//! cases where resolution must wait until run time.

use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use tracing::debug;

use crate::builder::StepBuilder;
use crate::error::BuildError;

/// Maps step ids to the builders that produce them.
#[derive(Clone, Default)]
pub struct Registry {
    builders: Arc<RwLock<IndexMap<String, Arc<dyn StepBuilder>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Registers `builder` under its own id, replacing any previous builder
    /// with the same id.
    pub fn register(&self, builder: Arc<dyn StepBuilder>) {
        let id = builder.id().to_string();
        debug!(builder_id = %id, "step builder registered");
        self.builders.write().expect("registry lock").insert(id, builder);
    }

    /// Resolves the builder registered under `id`.
    pub fn of(&self, id: &str) -> Result<Arc<dyn StepBuilder>, BuildError> {
        let builders = self.builders.read().expect("registry lock");
        builders
            .get(id)
            .cloned()
            .ok_or_else(|| BuildError::UnknownBuilder(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.builders.read().expect("registry lock").contains_key(id)
    }

    /// Registered ids, in registration order.
    pub fn ids(&self) -> Vec<String> {
        let builders = self.builders.read().expect("registry lock");
        builders.keys().cloned().collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("ids", &self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FnStepBuilder;
    use capstan_types::Report;

    fn noop_builder(id: &str) -> Arc<dyn StepBuilder> {
        Arc::new(FnStepBuilder::new(id).execute(|_ctx, step| async move { Ok(Report::success(step.id())) }))
    }

    #[test]
    fn registers_and_resolves_by_id() {
        let registry = Registry::new();
        registry.register(noop_builder("provision"));
        registry.register(noop_builder("verify"));

        assert!(registry.contains("provision"));
        assert_eq!(registry.ids(), vec!["provision".to_string(), "verify".to_string()]);

        let builder = registry.of("verify").unwrap();
        assert_eq!(builder.id(), "verify");
        assert!(builder.build().is_ok());
    }

    #[test]
    fn unknown_id_is_a_build_error() {
        let registry = Registry::new();
        let err = registry.of("missing").unwrap_err();
        assert!(matches!(err, BuildError::UnknownBuilder(id) if id == "missing"));
    }

    #[test]
    fn reregistering_replaces_the_builder() {
        let registry = Registry::new();
        registry.register(noop_builder("step"));
        registry.register(Arc::new(
            FnStepBuilder::new("step")
                .execute(|_ctx, step| async move { Ok(Report::success(step.id()).with_message("v2")) }),
        ));

        assert_eq!(registry.ids().len(), 1);
    }
}
