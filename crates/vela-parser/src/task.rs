use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use vela_core::{DocumentKey, EditRangeSet, FeatureLevel, Revision};

use crate::registry::DocumentRegistry;

/// Marker type returned by a task that observed an abort request and bailed
/// out at a safe point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aborted;

/// Terminal error of a parse task execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("parse aborted")]
    Aborted,
    #[error("parse task panicked")]
    Panicked,
    #[error("parse failed: {0}")]
    Failed(String),
}

impl From<Aborted> for TaskError {
    fn from(_: Aborted) -> Self {
        TaskError::Aborted
    }
}

/// Outcome of a parse task, as reported to listeners and events.
///
/// Aborts are bookkept exactly like failures: the task is retired, `done`
/// advances, and no retry happens in the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    Done,
    Failed,
    Aborted,
}

impl ParseStatus {
    pub fn is_success(self) -> bool {
        matches!(self, ParseStatus::Done)
    }
}

/// Signals marshalled from worker threads (and timers) to the dispatcher.
pub(crate) enum WorkerSignal {
    Progress {
        document: DocumentKey,
        sample: f32,
    },
    Finished {
        document: DocumentKey,
        status: ParseStatus,
    },
    ParseDocuments {
        /// Set when fired by the debounce timer; used to retire the matching
        /// timer handle. `None` for completion-path redrives.
        timer_generation: Option<u64>,
    },
}

/// Execution context handed to a running parse task.
///
/// Carries the cooperative abort token, the progress channel, and the
/// document registry for live buffer contents.
pub struct TaskContext {
    document: DocumentKey,
    abort: CancellationToken,
    documents: Arc<dyn DocumentRegistry>,
    signals: UnboundedSender<WorkerSignal>,
}

impl TaskContext {
    pub(crate) fn new(
        document: DocumentKey,
        abort: CancellationToken,
        documents: Arc<dyn DocumentRegistry>,
        signals: UnboundedSender<WorkerSignal>,
    ) -> Self {
        Self {
            document,
            abort,
            documents,
            signals,
        }
    }

    pub fn document(&self) -> &DocumentKey {
        &self.document
    }

    pub fn documents(&self) -> &Arc<dyn DocumentRegistry> {
        &self.documents
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Bail out when an abort was requested. Tasks are expected to call this
    /// between major phases.
    pub fn checkpoint(&self) -> Result<(), Aborted> {
        if self.abort.is_cancelled() {
            Err(Aborted)
        } else {
            Ok(())
        }
    }

    /// Report fractional progress in `[0, 1]`. Samples are advisory and may
    /// be coalesced by the scheduler.
    pub fn report_progress(&self, sample: f32) {
        let _ = self.signals.send(WorkerSignal::Progress {
            document: self.document.clone(),
            sample: sample.clamp(0.0, 1.0),
        });
    }
}

/// A unit of asynchronous analysis work for one document, produced by a
/// language backend.
///
/// The scheduler treats tasks as opaque capabilities: it creates them through
/// the [`LanguageRegistry`](crate::LanguageRegistry), hands them to a worker
/// thread, and retires them on completion. Implementations must be safe to
/// share between the scheduler (which may offer edit hints) and the worker
/// executing them.
pub trait ParseTask: Send + Sync + 'static {
    fn document(&self) -> DocumentKey;

    /// The analysis depth this task was created at.
    fn features(&self) -> FeatureLevel;

    /// Revision snapshot the task parsed; `None` until the task has run.
    fn revision(&self) -> Option<Revision> {
        None
    }

    /// Offer edit ranges to the task so an in-flight parse can fold them in.
    ///
    /// Returns `false` when the task can no longer accept hints (typically
    /// because parsing has passed the point where they could matter); the
    /// scheduler then queues a delayed reparse instead. Called under the
    /// scheduler lock: implementations must not block or call back into the
    /// parser.
    fn set_changed_ranges(&self, _ranges: &EditRangeSet) -> bool {
        false
    }

    /// Run the parse on a worker thread.
    ///
    /// Long-running implementations must poll [`TaskContext::checkpoint`]
    /// between major phases and return [`TaskError::Aborted`] (via `?` on the
    /// checkpoint) when an abort was requested.
    fn execute(&self, cx: &TaskContext) -> Result<(), TaskError>;
}

/// Completion callback target.
///
/// Listeners are held as weak handles; a listener dropped before the parse
/// finishes simply misses the notification.
pub trait ParseListener: Send + Sync {
    fn parse_finished(&self, document: &DocumentKey, status: ParseStatus);
}
