//! Background parsing engine for Vela.
//!
//! The parser accepts a stream of parse requests for source documents and
//! produces, asynchronously, up-to-date semantic analyses through pluggable
//! language backends. The value is not the parsing itself (that is delegated)
//! but the scheduling around it:
//!
//! - A priority queue of pending documents with update-on-requeue semantics.
//! - A bounded worker pool executing parse tasks concurrently.
//! - Bookkeeping that prevents two concurrent analyses of the same document,
//!   merges duplicate requests, and folds edits that arrive during an
//!   in-flight parse into a delayed reparse.
//! - Suspend/resume, cooperative cancellation, and progress reporting.
//!
//! Language backends, the document registry, and the semantic store are
//! external collaborators injected as trait objects; see
//! [`LanguageRegistry`] and [`DocumentRegistry`].

mod config;
mod events;
mod pool;
mod registry;
mod scheduler;
mod task;
mod tracker;

pub use config::{ParserConfig, ParserSettings};
pub use events::{ParserEvent, ParserEventReceiver};
pub use registry::{DocumentRegistry, LanguageRegistry};
pub use scheduler::BackgroundParser;
pub use task::{Aborted, ParseListener, ParseStatus, ParseTask, TaskContext, TaskError};
pub use tracker::ChangeTracker;

pub use tokio_util::sync::CancellationToken;
