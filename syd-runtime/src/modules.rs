//! Per-thread hooks of loaded modules.
//!
//! The registry is assembled during process bootstrap and is immutable once the worker pool
//! starts. Every worker thread runs the init hooks on entry and the finish hooks on exit; a
//! failing init unwinds the already-initialized prefix in reverse and the thread refuses to run.

use std::sync::Arc;

use tracing::error;

/// Optional per-thread lifecycle hooks a loaded module exposes.
pub trait RuntimeModule: Send + Sync {
    fn name(&self) -> &str;

    /// Called once on every worker thread before it enters its loop.
    fn on_thread_init(&self) -> bool {
        true
    }

    /// Called once on every worker thread after its loop exits.
    fn on_thread_finish(&self) {}
}

/// Immutable list of loaded modules.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn RuntimeModule>>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.modules.len())
            .finish()
    }
}

impl ModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a module; only meaningful before the worker pool starts.
    pub fn register(&mut self, module: Arc<dyn RuntimeModule>) {
        self.modules.push(module);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Runs `on_thread_init` on every module in registration order.
    ///
    /// On the first failure the already-initialized modules get `on_thread_finish` in reverse
    /// order and `false` is returned.
    pub(crate) fn thread_init(&self) -> bool {
        for (index, module) in self.modules.iter().enumerate() {
            if !module.on_thread_init() {
                error!(module = module.name(), "module per-thread init failed");
                for initialized in self.modules[..index].iter().rev() {
                    initialized.on_thread_finish();
                }
                return false;
            }
        }
        true
    }

    /// Runs `on_thread_finish` on every module in reverse registration order.
    pub(crate) fn thread_finish(&self) {
        for module in self.modules.iter().rev() {
            module.on_thread_finish();
        }
    }
}
