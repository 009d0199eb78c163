//! Namespace composition over [`StateBag`]: step-local, workflow-global, and
//! named opt-in scopes.
//!
//! A workflow owns one `NamespacedStateBag`; each step receives a
//! [`step_view`](NamespacedStateBag::step_view) of it. The view shares the
//! Global bag and the custom-namespace table but owns a fresh Local bag,
//! which is what makes step-local state unreachable from any other step. A
//! [`snapshot`](NamespacedStateBag::snapshot) severs all sharing and is the
//! isolation boundary handed to nested workflows and kept for rollback.

use std::fmt;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use indexmap::map::Entry;
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::bag::StateBag;

type NamespaceTable = Arc<RwLock<IndexMap<String, Arc<StateBag>>>>;

/// Local, Global, and named state scopes for one step or workflow.
pub struct NamespacedStateBag {
    local: OnceCell<Arc<StateBag>>,
    global: Arc<StateBag>,
    namespaces: NamespaceTable,
}

impl NamespacedStateBag {
    /// Fresh state with an empty Global bag and no namespaces; the Local bag
    /// materializes on first use.
    pub fn new() -> Self {
        NamespacedStateBag {
            local: OnceCell::new(),
            global: Arc::new(StateBag::new()),
            namespaces: Arc::new(RwLock::new(IndexMap::new())),
        }
    }

    /// The private bag of the owning step.
    ///
    /// Created lazily and exactly once, even under concurrent first access.
    pub fn local(&self) -> Arc<StateBag> {
        Arc::clone(self.local.get_or_init(|| Arc::new(StateBag::new())))
    }

    /// The bag shared by every step of the owning workflow.
    pub fn global(&self) -> Arc<StateBag> {
        Arc::clone(&self.global)
    }

    /// The named shared bag, created on first request.
    ///
    /// Namespaces are visible to every step holding a view of the same state,
    /// regardless of which step created them.
    pub fn namespace(&self, name: &str) -> Arc<StateBag> {
        {
            let table = self.namespaces.read().expect("namespace table lock");
            if let Some(bag) = table.get(name) {
                return Arc::clone(bag);
            }
        }
        let mut table = self.namespaces.write().expect("namespace table lock");
        let bag = table.entry(name.to_string()).or_insert_with(|| {
            debug!(namespace = %name, "state namespace created");
            Arc::new(StateBag::new())
        });
        Arc::clone(bag)
    }

    /// Names of the custom namespaces created so far, in creation order.
    pub fn namespace_names(&self) -> Vec<String> {
        let table = self.namespaces.read().expect("namespace table lock");
        table.keys().cloned().collect()
    }

    /// Derives the state handed to one step of a workflow: Global and the
    /// namespace table are shared, the Local bag is fresh and still lazy.
    pub fn step_view(&self) -> NamespacedStateBag {
        NamespacedStateBag {
            local: OnceCell::new(),
            global: Arc::clone(&self.global),
            namespaces: Arc::clone(&self.namespaces),
        }
    }

    /// Deep-copies Local, Global, and every custom namespace.
    ///
    /// Values follow the per-entry copy rule of [`StateBag::snapshot`]:
    /// deep where the value carries a copy capability, by reference where it
    /// does not. No scope of the copy aliases the original.
    pub fn snapshot(&self) -> NamespacedStateBag {
        let local = match self.local.get() {
            Some(bag) => OnceCell::with_value(Arc::new(bag.snapshot())),
            None => OnceCell::new(),
        };
        let namespaces: IndexMap<String, Arc<StateBag>> = {
            let table = self.namespaces.read().expect("namespace table lock");
            table
                .iter()
                .map(|(name, bag)| (name.clone(), Arc::new(bag.snapshot())))
                .collect()
        };
        NamespacedStateBag {
            local,
            global: Arc::new(self.global.snapshot()),
            namespaces: Arc::new(RwLock::new(namespaces)),
        }
    }

    /// Unions `other` into `self`: Local, Global, and every custom namespace,
    /// last-writer-wins per key.
    ///
    /// A namespace present only in `other` is cloned in, never referenced, so
    /// later mutations of `other` stay its own. `other` is left unmodified.
    pub fn merge(&self, other: &NamespacedStateBag) {
        if let Some(theirs) = other.local.get() {
            self.local().merge(theirs);
        }
        self.global.merge(&other.global);

        let incoming: Vec<(String, Arc<StateBag>)> = {
            let table = other.namespaces.read().expect("namespace table lock");
            table
                .iter()
                .map(|(name, bag)| (name.clone(), Arc::clone(bag)))
                .collect()
        };
        for (name, theirs) in incoming {
            // Resolve the target bag under the table lock, merge outside it.
            let mine = {
                let mut table = self.namespaces.write().expect("namespace table lock");
                match table.entry(name) {
                    Entry::Occupied(slot) => Some(Arc::clone(slot.get())),
                    Entry::Vacant(slot) => {
                        slot.insert(Arc::new(theirs.snapshot()));
                        None
                    }
                }
            };
            if let Some(mine) = mine {
                mine.merge(&theirs);
            }
        }
    }
}

impl Default for NamespacedStateBag {
    fn default() -> Self {
        NamespacedStateBag::new()
    }
}

impl fmt::Debug for NamespacedStateBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespacedStateBag")
            .field("local_created", &self.local.get().is_some())
            .field("global_len", &self.global.len())
            .field("namespaces", &self.namespace_names())
            .finish()
    }
}
