use std::sync::Arc;

use vela_core::{DocumentKey, FeatureLevel, Revision};

use crate::task::ParseTask;

/// Language-side task factory, injected at parser construction.
///
/// The scheduler calls `create_task` from its dispatch path while holding the
/// scheduler lock; implementations must only construct the task (the actual
/// parse runs later on a worker thread) and must not block or call back into
/// the parser.
pub trait LanguageRegistry: Send + Sync {
    /// Make a parse task for `document` at the requested analysis depth.
    ///
    /// Returning `None` declines the request: no backend claims the document.
    /// The scheduler logs a warning and discards the pending entry.
    fn create_task(
        &self,
        document: &DocumentKey,
        features: FeatureLevel,
    ) -> Option<Arc<dyn ParseTask>>;
}

/// Editor-side source of truth for open buffers, injected at parser
/// construction. Parse tasks read live contents through this registry rather
/// than from disk so unsaved edits are analyzed.
pub trait DocumentRegistry: Send + Sync {
    /// Current edit revision of `document`, if the registry knows it.
    fn revision(&self, document: &DocumentKey) -> Option<Revision>;

    /// Live buffer contents for `document`; `None` when the document is not
    /// open (backends then fall back to disk).
    fn text(&self, document: &DocumentKey) -> Option<Arc<String>>;
}
