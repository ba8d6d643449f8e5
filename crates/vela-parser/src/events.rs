use tokio::sync::broadcast;

use vela_core::DocumentKey;

use crate::task::ParseStatus;

/// Events emitted by the background parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    /// A parse task retired, successfully or not.
    TaskFinished {
        document: DocumentKey,
        status: ParseStatus,
    },
    /// Aggregate progress over the current batch of promised documents.
    /// `value` counts completed tasks plus in-flight samples, scaled by 1000.
    ProgressShow { min: u64, max: u64, value: u64 },
    ProgressHide,
}

pub type ParserEventReceiver = broadcast::Receiver<ParserEvent>;

/// Lossy fan-out of parser events; emission never blocks and subscribers that
/// fall behind miss events.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: broadcast::Sender<ParserEvent>,
}

impl EventSender {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> ParserEventReceiver {
        self.tx.subscribe()
    }

    pub fn task_finished(&self, document: DocumentKey, status: ParseStatus) {
        let _ = self.tx.send(ParserEvent::TaskFinished { document, status });
    }

    pub fn show_progress(&self, max: u64, value: u64) {
        let _ = self.tx.send(ParserEvent::ProgressShow { min: 0, max, value });
    }

    pub fn hide_progress(&self) {
        let _ = self.tx.send(ParserEvent::ProgressHide);
    }
}
