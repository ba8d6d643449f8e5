use std::{
    collections::{BTreeMap, HashMap},
    panic::AssertUnwindSafe,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vela_core::{DocumentKey, EditRangeSet, FeatureLevel, Priority, TextRange};

use crate::{
    config::{ParserConfig, ParserSettings},
    events::{EventSender, ParserEventReceiver},
    pool::{PoolJob, WorkerPool},
    registry::{DocumentRegistry, LanguageRegistry},
    task::{ParseListener, ParseStatus, ParseTask, TaskContext, TaskError, WorkerSignal},
    tracker::ChangeTracker,
};

fn build_io_runtime(threads: usize) -> Runtime {
    // Thread creation can fail in constrained CI/sandbox environments. Degrade
    // gracefully rather than crashing during startup.
    let requested = threads.max(1);
    let mut desired = requested;
    loop {
        match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(desired)
            .enable_time()
            .thread_name("vela-io")
            .build()
        {
            Ok(runtime) => return runtime,
            Err(_err) if desired > 1 => {
                desired /= 2;
                continue;
            }
            Err(err) => {
                panic!("failed to build IO runtime (requested {requested} thread(s)): {err}")
            }
        }
    }
}

/// Upper bound on prepared-or-running tasks. Bounds the memory spent on
/// not-yet-started parse state and forces the queue to be redriven between
/// small batches so higher-priority arrivals can jump ahead.
fn admission_cap(worker_count: usize) -> usize {
    2 * worker_count + 1
}

/// A pending request for one document. Merges are upgrade-only: priorities
/// only improve, features only widen, listeners accumulate.
struct DocumentPlan {
    priority: Priority,
    features: FeatureLevel,
    listeners: Vec<Weak<dyn ParseListener>>,
}

impl DocumentPlan {
    fn new(
        priority: Priority,
        features: FeatureLevel,
        listener: Option<Weak<dyn ParseListener>>,
    ) -> Self {
        Self {
            priority,
            features,
            listeners: listener.into_iter().collect(),
        }
    }

    fn absorb(
        &mut self,
        priority: Priority,
        features: FeatureLevel,
        listener: Option<Weak<dyn ParseListener>>,
    ) {
        self.priority = self.priority.merge(priority);
        self.features = self.features.merge(features);
        if let Some(listener) = listener {
            self.add_listener(listener);
        }
    }

    fn add_listener(&mut self, listener: Weak<dyn ParseListener>) {
        if !self.listeners.iter().any(|l| l.ptr_eq(&listener)) {
            self.listeners.push(listener);
        }
    }
}

struct RunningParse {
    task: Arc<dyn ParseTask>,
    listeners: Vec<Weak<dyn ParseListener>>,
}

struct TimerHandle {
    generation: u64,
    cancel: CancellationToken,
}

struct ParserState {
    pending: HashMap<DocumentKey, DocumentPlan>,
    by_priority: BTreeMap<Priority, Vec<DocumentKey>>,
    running: HashMap<DocumentKey, RunningParse>,
    delayed: HashMap<DocumentKey, ChangeTracker>,
    progress: HashMap<DocumentKey, f32>,
    done_tasks: u32,
    total_tasks: u32,
    priority_floor: Priority,
    worker_count: usize,
    delay: Duration,
    suspended: bool,
    timer: Option<TimerHandle>,
    timer_generation: u64,
    done_subscribers: Vec<Weak<dyn ParseListener>>,
}

impl ParserState {
    fn new(config: &ParserConfig) -> Self {
        Self {
            pending: HashMap::new(),
            by_priority: BTreeMap::new(),
            running: HashMap::new(),
            delayed: HashMap::new(),
            progress: HashMap::new(),
            done_tasks: 0,
            total_tasks: 0,
            priority_floor: Priority::WORST,
            worker_count: config.worker_threads.max(1),
            delay: config.delay,
            suspended: false,
            timer: None,
            timer_generation: 0,
            done_subscribers: Vec::new(),
        }
    }
}

fn remove_from_bucket(
    by_priority: &mut BTreeMap<Priority, Vec<DocumentKey>>,
    priority: Priority,
    document: &DocumentKey,
) {
    if let Some(bucket) = by_priority.get_mut(&priority) {
        bucket.retain(|d| d != document);
        if bucket.is_empty() {
            by_priority.remove(&priority);
        }
    }
}

/// The background parser: a priority queue of documents waiting to be parsed,
/// a bounded worker pool executing parse tasks, and the bookkeeping that
/// prevents two concurrent analyses of the same document while never dropping
/// an edit.
///
/// Cloning is cheap and all operations are safe to call from any thread.
#[derive(Clone)]
pub struct BackgroundParser {
    inner: Arc<ParserInner>,
}

struct ParserInner {
    languages: Arc<dyn LanguageRegistry>,
    documents: Arc<dyn DocumentRegistry>,
    state: Mutex<ParserState>,
    pool: WorkerPool,
    events: EventSender,
    signals: mpsc::UnboundedSender<WorkerSignal>,
    /// Root abort token; every task token is a child, so teardown is a single
    /// `cancel()`.
    abort_root: CancellationToken,
    io_runtime: Option<Runtime>,
    io_handle: tokio::runtime::Handle,
}

impl BackgroundParser {
    pub fn new(
        config: ParserConfig,
        languages: Arc<dyn LanguageRegistry>,
        documents: Arc<dyn DocumentRegistry>,
    ) -> Self {
        let io_runtime = build_io_runtime(config.io_threads);
        let io_handle = io_runtime.handle().clone();
        Self::build(config, languages, documents, Some(io_runtime), io_handle)
    }

    /// Build a parser that reuses an existing Tokio runtime for its timer and
    /// dispatch plumbing.
    ///
    /// This is useful when the host is already running inside a Tokio runtime
    /// (e.g. in a `#[tokio::main]` binary) and we want to avoid spawning an
    /// extra `vela-io` runtime.
    pub fn new_with_io_handle(
        config: ParserConfig,
        languages: Arc<dyn LanguageRegistry>,
        documents: Arc<dyn DocumentRegistry>,
        io_handle: tokio::runtime::Handle,
    ) -> Self {
        Self::build(config, languages, documents, None, io_handle)
    }

    fn build(
        config: ParserConfig,
        languages: Arc<dyn LanguageRegistry>,
        documents: Arc<dyn DocumentRegistry>,
        io_runtime: Option<Runtime>,
        io_handle: tokio::runtime::Handle,
    ) -> Self {
        let (signals, signals_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ParserInner {
            languages,
            documents,
            state: Mutex::new(ParserState::new(&config)),
            pool: WorkerPool::new(config.worker_threads),
            events: EventSender::new(config.event_channel_capacity),
            signals,
            abort_root: CancellationToken::new(),
            io_runtime,
            io_handle,
        });

        // The dispatcher holds a weak handle: once the parser is torn down,
        // in-flight completion and timer signals become no-ops.
        let parser = Arc::downgrade(&inner);
        inner
            .io_handle
            .spawn(dispatch_loop(parser, signals_rx));

        Self { inner }
    }

    /// Upsert a parse request for `document`.
    ///
    /// Requests for a document already pending merge upgrade-only: the more
    /// urgent priority wins, the wider feature level wins, and listeners
    /// accumulate. A document currently being parsed is queued again and
    /// dispatched after the in-flight task retires.
    pub fn add_document(
        &self,
        document: DocumentKey,
        features: FeatureLevel,
        priority: Priority,
        listener: Option<&Arc<dyn ParseListener>>,
    ) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let listener = listener.map(Arc::downgrade);
        match state.pending.get_mut(&document) {
            Some(plan) => {
                let old_priority = plan.priority;
                plan.absorb(priority, features, listener);
                if plan.priority != old_priority {
                    let new_priority = plan.priority;
                    remove_from_bucket(&mut state.by_priority, old_priority, &document);
                    state
                        .by_priority
                        .entry(new_priority)
                        .or_default()
                        .push(document.clone());
                }
            }
            None => {
                tracing::debug!(document = %document, ?features, ?priority, "queueing document");
                state
                    .pending
                    .insert(document.clone(), DocumentPlan::new(priority, features, listener));
                state
                    .by_priority
                    .entry(priority)
                    .or_default()
                    .push(document);
                // The progress bar waits for this document.
                state.total_tasks += 1;
            }
        }
        self.inner.arm_timer(state);
    }

    /// Batched [`add_document`](Self::add_document) without listeners.
    pub fn add_document_list(
        &self,
        documents: impl IntoIterator<Item = DocumentKey>,
        features: FeatureLevel,
        priority: Priority,
    ) {
        for document in documents {
            self.add_document(document, features, priority, None);
        }
    }

    /// Remove a pending request. An in-flight parse for `document` runs to
    /// completion; listeners captured at dispatch are still notified and the
    /// result is still published.
    pub fn remove_document(&self, document: &DocumentKey) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if let Some(plan) = state.pending.remove(document) {
            remove_from_bucket(&mut state.by_priority, plan.priority, document);
            state.total_tasks = state.total_tasks.saturating_sub(1);
        }
    }

    /// Set the admission floor: only documents with priority numerically at
    /// or below `priority` are dispatched.
    pub fn set_priority_floor(&self, priority: Priority) {
        let mut state = self.inner.state.lock();
        state.priority_floor = priority;
        self.inner.arm_timer(&mut state);
    }

    /// Block all background work except `Priority::BEST` documents.
    pub fn disable_processing(&self) {
        self.set_priority_floor(Priority::BEST);
    }

    pub fn enable_processing(&self) {
        self.set_priority_floor(Priority::WORST);
    }

    /// Stop the debounce timer and the worker pool; running tasks finish.
    /// Idempotent.
    pub fn suspend(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.suspended {
                return;
            }
            state.suspended = true;
            if let Some(timer) = state.timer.take() {
                timer.cancel.cancel();
            }
        }
        self.inner.pool.suspend();
        self.inner.events.hide_progress();
    }

    /// Restart the timer and the worker pool. Idempotent.
    pub fn resume(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.suspended {
                return;
            }
            state.suspended = false;
            self.inner.arm_timer(&mut state);
            self.inner.emit_progress(&mut state);
        }
        self.inner.pool.resume();
    }

    pub fn set_worker_count(&self, workers: usize) {
        let workers = workers.max(1);
        {
            let mut state = self.inner.state.lock();
            if state.worker_count == workers {
                return;
            }
            state.worker_count = workers;
        }
        self.inner.pool.set_worker_count(workers);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.inner.state.lock().delay = delay;
    }

    /// Apply user settings on top of the running parser.
    pub fn apply_settings(&self, settings: &ParserSettings) {
        self.set_delay(Duration::from_millis(settings.delay_ms));
        self.set_worker_count(settings.worker_threads);
        if settings.enabled {
            self.resume();
        } else {
            self.suspend();
        }
    }

    /// Record an edit to `document`.
    ///
    /// When a parse for the document is in flight and accepts the range hint,
    /// the edit is folded into it; otherwise the edit accumulates in the
    /// delayed-reparse table and a follow-up parse at full features is
    /// scheduled. Edits are never dropped.
    pub fn notify_edit(&self, document: &DocumentKey, range: TextRange) {
        let mut state = self.inner.state.lock();
        if let Some(run) = state.running.get(document) {
            let hint: EditRangeSet = std::iter::once(range).collect();
            if run.task.set_changed_ranges(&hint) {
                return;
            }
        }
        state
            .delayed
            .entry(document.clone())
            .or_default()
            .add(range);
        self.inner.arm_timer(&mut state);
    }

    /// The in-flight task for `document`, if any. Diagnostic.
    pub fn in_flight_for(&self, document: &DocumentKey) -> Option<Arc<dyn ParseTask>> {
        self.inner
            .state
            .lock()
            .running
            .get(document)
            .map(|run| run.task.clone())
    }

    /// Subscribe to the parser's event stream (task completions, progress).
    pub fn subscribe(&self) -> ParserEventReceiver {
        self.inner.events.subscribe()
    }

    /// Register a listener notified after every task completion. Held weakly;
    /// dropping the listener unsubscribes it.
    pub fn subscribe_done(&self, listener: &Arc<dyn ParseListener>) {
        self.inner
            .state
            .lock()
            .done_subscribers
            .push(Arc::downgrade(listener));
    }

    /// Dispatch eligible pending documents now, without waiting for the
    /// debounce timer. Mostly useful for tests and forced refreshes.
    pub fn parse_documents(&self) {
        self.inner.parse_documents(None);
    }
}

async fn dispatch_loop(
    parser: Weak<ParserInner>,
    mut signals: mpsc::UnboundedReceiver<WorkerSignal>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(parser) = parser.upgrade() else {
            break;
        };
        match signal {
            WorkerSignal::Progress { document, sample } => {
                parser.record_progress(document, sample);
            }
            WorkerSignal::Finished { document, status } => {
                parser.complete_parse(document, status);
            }
            WorkerSignal::ParseDocuments { timer_generation } => {
                parser.parse_documents(timer_generation);
            }
        }
    }
}

impl ParserInner {
    /// Arm the single-shot debounce timer unless one is already pending.
    fn arm_timer(&self, state: &mut ParserState) {
        if state.suspended || state.timer.is_some() {
            return;
        }
        state.timer_generation += 1;
        let generation = state.timer_generation;
        let cancel = CancellationToken::new();
        state.timer = Some(TimerHandle {
            generation,
            cancel: cancel.clone(),
        });

        let signals = self.signals.clone();
        let delay = state.delay;
        self.io_handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = signals.send(WorkerSignal::ParseDocuments {
                        timer_generation: Some(generation),
                    });
                }
            }
        });
    }

    fn record_progress(&self, document: DocumentKey, sample: f32) {
        let mut state = self.state.lock();
        if !state.running.contains_key(&document) {
            return;
        }
        state.progress.insert(document, sample);
        self.emit_progress(&mut state);
    }

    /// Drain delayed edits and walk the priority buckets, handing the
    /// prepared batch to the worker pool.
    fn parse_documents(&self, timer_generation: Option<u64>) {
        let mut batch: Vec<PoolJob> = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if let Some(generation) = timer_generation {
                match &state.timer {
                    Some(timer) if timer.generation == generation => state.timer = None,
                    _ => {}
                }
            }
            if state.suspended {
                return;
            }

            tracing::debug!(
                pending = state.pending.len(),
                delayed = state.delayed.len(),
                running = state.running.len(),
                "parse documents"
            );

            // Documents edited while their parse was in flight come first:
            // reparse at full features with the accumulated ranges attached.
            let delayed = std::mem::take(&mut state.delayed);
            let mut declined = false;
            for (document, tracker) in delayed {
                if state.running.contains_key(&document) {
                    // Still in flight; drained again once that task retires.
                    state.delayed.insert(document, tracker);
                    continue;
                }
                // A plan queued meanwhile is folded into the reparse so its
                // listeners are not lost and the document is not parsed twice.
                let listeners = match state.pending.remove(&document) {
                    Some(plan) => {
                        remove_from_bucket(&mut state.by_priority, plan.priority, &document);
                        state.total_tasks = state.total_tasks.saturating_sub(1);
                        plan.listeners
                    }
                    None => Vec::new(),
                };
                match self.prepare_task(
                    state,
                    &document,
                    FeatureLevel::Full,
                    listeners,
                    Some(tracker.into_ranges()),
                ) {
                    Some(job) => batch.push(job),
                    None => {
                        tracing::warn!(document = %document, "no parse task for edited document");
                        declined = true;
                    }
                }
            }

            // Highest priority first; within a bucket, first scheduled runs
            // first. Stop at the admission floor and at the admission cap.
            let priorities: Vec<Priority> = state.by_priority.keys().copied().collect();
            'buckets: for priority in priorities {
                if priority > state.priority_floor {
                    break;
                }
                let bucket = state
                    .by_priority
                    .get(&priority)
                    .cloned()
                    .unwrap_or_default();
                for document in bucket {
                    // `running` already counts the batch prepared above.
                    if state.running.len() >= admission_cap(state.worker_count) {
                        break 'buckets;
                    }
                    if state.running.contains_key(&document) {
                        // Re-examined when the in-flight task retires.
                        continue;
                    }
                    let Some(plan) = state.pending.remove(&document) else {
                        continue;
                    };
                    remove_from_bucket(&mut state.by_priority, priority, &document);
                    state.total_tasks = state.total_tasks.saturating_sub(1);
                    match self.prepare_task(state, &document, plan.features, plan.listeners, None)
                    {
                        Some(job) => batch.push(job),
                        None => {
                            tracing::warn!(document = %document, "language backend declined document");
                            declined = true;
                        }
                    }
                }
            }

            if declined {
                self.arm_timer(state);
            }
            reconcile_state(state);
        }

        for job in batch {
            self.pool.enqueue(job);
        }

        let mut state = self.state.lock();
        self.emit_progress(&mut state);
        // Not hidden inside emit_progress so the bar doesn't flash while a
        // document is reparsed again and again.
        if state.done_tasks == state.total_tasks {
            self.events.hide_progress();
        }
    }

    /// Ask the backend for a task, register it as running, and wrap it into a
    /// pool job that reports back through the signal channel.
    fn prepare_task(
        &self,
        state: &mut ParserState,
        document: &DocumentKey,
        features: FeatureLevel,
        listeners: Vec<Weak<dyn ParseListener>>,
        changed_ranges: Option<EditRangeSet>,
    ) -> Option<PoolJob> {
        let task = self.languages.create_task(document, features)?;
        if let Some(ranges) = changed_ranges {
            if !task.set_changed_ranges(&ranges) {
                tracing::debug!(document = %document, "fresh task did not accept change hint");
            }
        }

        let cancel = self.abort_root.child_token();
        state.running.insert(
            document.clone(),
            RunningParse {
                task: task.clone(),
                listeners,
            },
        );
        state.total_tasks += 1;
        tracing::debug!(document = %document, ?features, "created parse task");

        let signals = self.signals.clone();
        let documents = self.documents.clone();
        let document = document.clone();
        Some(PoolJob::new(cancel, move |cancel| {
            let cx = TaskContext::new(document.clone(), cancel, documents, signals.clone());
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| task.execute(&cx)))
                .map_err(|_| TaskError::Panicked)
                .and_then(|result| result);
            let status = match result {
                Ok(()) => ParseStatus::Done,
                Err(TaskError::Aborted) => ParseStatus::Aborted,
                Err(err) => {
                    tracing::warn!(document = %document, error = %err, "parse task failed");
                    ParseStatus::Failed
                }
            };
            let _ = signals.send(WorkerSignal::Finished { document, status });
        }))
    }

    /// Completion path: retire the task, advance progress, notify listeners,
    /// schedule a delayed reparse when edits arrived mid-flight, and redrive
    /// the queue.
    fn complete_parse(&self, document: DocumentKey, status: ParseStatus) {
        let listeners: Vec<Arc<dyn ParseListener>> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(run) = state.running.remove(&document) else {
                // A completion for a task we no longer track; reconciled
                // state, nothing else to do.
                tracing::error!(document = %document, "completion for unknown parse task");
                return;
            };
            drop(run.task);
            state.progress.remove(&document);
            state.done_tasks += 1;

            if state.delayed.contains_key(&document) {
                self.arm_timer(state);
            }
            self.emit_progress(state);

            state.done_subscribers.retain(|l| l.strong_count() > 0);
            run.listeners
                .iter()
                .chain(state.done_subscribers.iter())
                .filter_map(Weak::upgrade)
                .collect()
        };

        tracing::debug!(document = %document, ?status, "parse task retired");
        for listener in listeners {
            listener.parse_finished(&document, status);
        }
        self.events.task_finished(document, status);

        // Keep the queue moving without waiting for the debounce delay.
        let _ = self
            .signals
            .send(WorkerSignal::ParseDocuments { timer_generation: None });
    }

    /// Progress arithmetic: completed tasks plus in-flight samples, scaled by
    /// 1000, out of the number of documents promised to the user. Resets once
    /// everything promised is done.
    fn emit_progress(&self, state: &mut ParserState) {
        if state.done_tasks == state.total_tasks {
            state.done_tasks = 0;
            state.total_tasks = 0;
        } else {
            let samples: f32 = state.progress.values().sum();
            let value = ((state.done_tasks as f32 + samples) * 1000.0) as u64;
            self.events
                .show_progress(u64::from(state.total_tasks) * 1000, value);
        }
    }
}

/// State corruption is fatal in debug builds and reconciled (favoring the
/// running entry) in release builds.
fn reconcile_state(state: &mut ParserState) {
    let overlapping: Vec<DocumentKey> = state
        .pending
        .keys()
        .filter(|document| state.running.contains_key(*document))
        .cloned()
        .collect();
    debug_assert!(
        overlapping.is_empty(),
        "documents both pending and running: {overlapping:?}"
    );
    for document in overlapping {
        tracing::error!(document = %document, "document both pending and running; dropping pending entry");
        if let Some(plan) = state.pending.remove(&document) {
            remove_from_bucket(&mut state.by_priority, plan.priority, &document);
            state.total_tasks = state.total_tasks.saturating_sub(1);
        }
    }

    debug_assert!(
        state.done_tasks <= state.total_tasks,
        "done ({}) ran ahead of total ({})",
        state.done_tasks,
        state.total_tasks
    );
    if state.done_tasks > state.total_tasks {
        tracing::error!(
            done = state.done_tasks,
            total = state.total_tasks,
            "progress counters out of sync; clamping"
        );
        state.total_tasks = state.done_tasks;
    }
}

impl Drop for ParserInner {
    fn drop(&mut self) {
        // Teardown: no callbacks may fire past this point. The dispatcher
        // only holds a weak handle, so pending signals become no-ops.
        self.abort_root.cancel();
        {
            let mut state = self.state.lock();
            if let Some(timer) = state.timer.take() {
                timer.cancel.cancel();
            }
            state.pending.clear();
            state.by_priority.clear();
            state.delayed.clear();
        }
        self.pool.drain();
        self.pool.shutdown(Duration::from_secs(5));
        if let Some(runtime) = self.io_runtime.take() {
            runtime.shutdown_background();
        }
    }
}
