//! Run-scoped context threaded through every hook invocation.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use indexmap::IndexMap;
use tokio::task::JoinHandle;
use tracing::warn;

/// Join handles of completion/failure callbacks dispatched in the background.
///
/// Every spawned callback is registered here, and [`join`](CallbackSet::join)
/// is the one place they are awaited. The driving workflow joins the set
/// before its `execute` returns; standalone step callers own the join
/// themselves via [`RunContext::join_callbacks`].
#[derive(Clone, Default)]
pub struct CallbackSet {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CallbackSet {
    pub fn push(&self, handle: JoinHandle<()>) {
        self.handles.lock().expect("callback set lock").push(handle);
    }

    /// Number of callbacks dispatched and not yet joined.
    pub fn pending(&self) -> usize {
        self.handles.lock().expect("callback set lock").len()
    }

    /// Awaits every callback dispatched so far, including ones enqueued while
    /// joining.
    pub async fn join(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut pending = self.handles.lock().expect("callback set lock");
                pending.drain(..).collect()
            };
            if handles.is_empty() {
                return;
            }
            for outcome in join_all(handles).await {
                if let Err(error) = outcome {
                    warn!(error = %error, "background callback task failed");
                }
            }
        }
    }
}

impl fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSet").field("pending", &self.pending()).finish()
    }
}

/// Cancellation flag, derived values, and the callback join point handed to
/// every hook.
///
/// Cloning is cheap and shares the cancellation flag and callback set, so a
/// context derived for one step still observes a caller's `cancel`. The
/// engine itself never polls the flag; hooks observe it where they choose,
/// and callers layer timeouts on top by cancelling from their own task.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    cancelled: Arc<AtomicBool>,
    values: IndexMap<String, String>,
    callbacks: CallbackSet,
}

impl RunContext {
    pub fn new() -> Self {
        RunContext::default()
    }

    /// Flags the run as cancelled for every context sharing this root.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Derives a context carrying `key` = `value`; `self` is untouched.
    ///
    /// This is the mechanism a `prepare` hook uses to extend the context its
    /// step's `execute` will see.
    pub fn with_value(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut derived = self.clone();
        derived.values.insert(key.into(), value.into());
        derived
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn callbacks(&self) -> &CallbackSet {
        &self.callbacks
    }

    /// Awaits every background callback dispatched through this context.
    pub async fn join_callbacks(&self) {
        self.callbacks.join().await;
    }
}
