use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

/// A queued unit of work.
///
/// The closure runs on a worker thread and owns its completion reporting
/// (including panic capture); the pool itself never inspects outcomes.
pub(crate) struct PoolJob {
    cancel: CancellationToken,
    run: Box<dyn FnOnce(CancellationToken) + Send>,
}

impl PoolJob {
    pub fn new(
        cancel: CancellationToken,
        run: impl FnOnce(CancellationToken) + Send + 'static,
    ) -> Self {
        Self {
            cancel,
            run: Box::new(run),
        }
    }
}

struct QueuedJob {
    id: u64,
    job: PoolJob,
}

/// Bounded pool of parse worker threads.
///
/// A suspended pool finishes jobs already on a worker but starts nothing new;
/// draining drops queued jobs and asks running ones to abort. Shrinking waits
/// for excess workers to finish their current job.
pub(crate) struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    wake: Condvar,
    settled: Condvar,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<QueuedJob>,
    running: Vec<(u64, CancellationToken)>,
    target_workers: usize,
    alive_workers: usize,
    next_job_id: u64,
    next_worker_id: u64,
    suspended: bool,
    shutdown: bool,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let pool = Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                wake: Condvar::new(),
                settled: Condvar::new(),
            }),
        };
        pool.set_worker_count(workers);
        pool
    }

    /// Append a job; returns immediately.
    pub fn enqueue(&self, job: PoolJob) {
        let mut state = self.inner.state.lock().expect("worker pool lock poisoned");
        if state.shutdown {
            return;
        }
        state.next_job_id = state.next_job_id.wrapping_add(1);
        let id = state.next_job_id;
        state.queue.push_back(QueuedJob { id, job });
        self.inner.wake.notify_one();
    }

    pub fn suspend(&self) {
        let mut state = self.inner.state.lock().expect("worker pool lock poisoned");
        state.suspended = true;
    }

    pub fn resume(&self) {
        let mut state = self.inner.state.lock().expect("worker pool lock poisoned");
        if state.suspended {
            state.suspended = false;
            self.inner.wake.notify_all();
        }
    }

    #[cfg(test)]
    pub fn is_suspended(&self) -> bool {
        self.inner
            .state
            .lock()
            .expect("worker pool lock poisoned")
            .suspended
    }

    /// Drop not-yet-started jobs and ask running ones to abort.
    pub fn drain(&self) {
        let mut state = self.inner.state.lock().expect("worker pool lock poisoned");
        state.queue.clear();
        for (_, cancel) in &state.running {
            cancel.cancel();
        }
    }

    /// Grow or shrink the pool. Growing spawns workers immediately; shrinking
    /// blocks until the excess workers have finished their current job.
    pub fn set_worker_count(&self, workers: usize) {
        let workers = workers.max(1);
        let mut state = self.inner.state.lock().expect("worker pool lock poisoned");
        if state.shutdown {
            return;
        }
        state.target_workers = workers;
        while state.alive_workers < state.target_workers {
            state.next_worker_id = state.next_worker_id.wrapping_add(1);
            let id = state.next_worker_id;
            let inner = Arc::clone(&self.inner);
            match std::thread::Builder::new()
                .name(format!("vela-worker-{id}"))
                .spawn(move || worker_loop(inner))
            {
                Ok(_) => state.alive_workers += 1,
                Err(err) => {
                    // Thread creation can fail in constrained environments;
                    // run with the workers we have rather than crashing.
                    tracing::warn!(error = %err, alive = state.alive_workers, "failed to spawn parse worker thread");
                    break;
                }
            }
        }
        if state.alive_workers > state.target_workers {
            self.inner.wake.notify_all();
            while state.alive_workers > state.target_workers {
                state = self
                    .inner
                    .settled
                    .wait(state)
                    .expect("worker pool lock poisoned");
            }
        }
    }

    #[cfg(test)]
    pub fn worker_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("worker pool lock poisoned")
            .target_workers
    }

    #[cfg(test)]
    pub fn queued_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("worker pool lock poisoned")
            .queue
            .len()
    }

    /// Drain the queue, abort running jobs, and wait (bounded) for all
    /// workers to exit. Jobs enqueued afterwards are dropped.
    pub fn shutdown(&self, timeout: Duration) {
        let mut state = self.inner.state.lock().expect("worker pool lock poisoned");
        state.shutdown = true;
        state.queue.clear();
        for (_, cancel) in &state.running {
            cancel.cancel();
        }
        self.inner.wake.notify_all();

        let deadline = Instant::now() + timeout;
        while state.alive_workers > 0 {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    alive = state.alive_workers,
                    "worker pool shutdown timed out with workers still busy"
                );
                break;
            }
            let (next, wait) = self
                .inner
                .settled
                .wait_timeout(state, deadline - now)
                .expect("worker pool lock poisoned");
            state = next;
            if wait.timed_out() {
                break;
            }
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let queued = {
            let mut state = inner.state.lock().expect("worker pool lock poisoned");
            loop {
                if state.shutdown || state.alive_workers > state.target_workers {
                    state.alive_workers -= 1;
                    inner.settled.notify_all();
                    return;
                }
                if !state.suspended {
                    if let Some(queued) = state.queue.pop_front() {
                        state.running.push((queued.id, queued.job.cancel.clone()));
                        break queued;
                    }
                }
                state = inner.wake.wait(state).expect("worker pool lock poisoned");
            }
        };

        let QueuedJob { id, job } = queued;
        let PoolJob { cancel, run } = job;
        run(cancel);

        let mut state = inner.state.lock().expect("worker pool lock poisoned");
        state.running.retain(|(running_id, _)| *running_id != id);
        inner.settled.notify_all();
    }
}
