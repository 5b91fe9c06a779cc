use crate::common::sync::{lock, wait};
use crate::config::{ProbeId, ProbeTarget};
use crate::probe::{CancelToken, Probe, ProbeOutcome, ProbeResult, ProgressFn, ProgressSample};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Builds the prober a worker thread keeps for its lifetime.
pub type ProberFactory = Arc<dyn Fn() -> Result<Box<dyn Probe>, curl::Error> + Send + Sync>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,
    #[error("pool capacity must be greater than zero")]
    InvalidCapacity,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Per-job callbacks.
///
/// `on_dispatch` runs while the pool lock is held, so it must only touch
/// state that is never locked around a call into the pool. The other two run
/// on the worker thread with no pool lock held.
pub trait JobObserver: Send + Sync {
    fn on_dispatch(&self, _id: ProbeId) {}

    fn on_progress(&self, sample: ProgressSample);

    fn on_complete(&self, result: &ProbeResult);
}

pub struct ProbeJob {
    pub target: ProbeTarget,
    pub cancel: CancelToken,
    pub observer: Option<Arc<dyn JobObserver>>,
}

impl ProbeJob {
    pub fn new(target: ProbeTarget, cancel: CancelToken) -> Self {
        Self {
            target,
            cancel,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    Finished(ProbeResult),
    /// Removed from the queue before any worker picked it up.
    Dropped,
}

pub struct JobHandle {
    id: ProbeId,
    done: Receiver<ProbeResult>,
}

impl JobHandle {
    pub fn id(&self) -> ProbeId {
        self.id
    }

    pub fn wait(self) -> JobOutcome {
        match self.done.recv() {
            Ok(result) => JobOutcome::Finished(result),
            Err(_) => JobOutcome::Dropped,
        }
    }

    /// `None` while the job is still queued or running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<JobOutcome> {
        match self.done.recv_timeout(timeout) {
            Ok(result) => Some(JobOutcome::Finished(result)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(JobOutcome::Dropped),
        }
    }
}

struct QueuedJob {
    job: ProbeJob,
    done: Sender<ProbeResult>,
}

struct PoolState {
    queue: VecDeque<QueuedJob>,
    capacity: usize,
    active: usize,
    peak_active: usize,
    paused: bool,
    shutdown: bool,
}

impl PoolState {
    fn can_dispatch(&self) -> bool {
        !self.paused && !self.queue.is_empty() && self.active < self.capacity
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
    changed: Condvar,
}

impl PoolShared {
    /// Blocks until a job may start. `None` once the pool is shut down and
    /// its queue is empty.
    fn next_job(&self) -> Option<QueuedJob> {
        let mut state = lock(&self.state);
        loop {
            if state.can_dispatch()
                && let Some(queued) = state.queue.pop_front()
            {
                state.active += 1;
                state.peak_active = state.peak_active.max(state.active);
                if let Some(observer) = &queued.job.observer {
                    observer.on_dispatch(queued.job.target.id());
                }
                return Some(queued);
            }
            if state.shutdown && state.queue.is_empty() {
                return None;
            }
            state = wait(&self.changed, state);
        }
    }
}

/// Releases a worker's slot once its job has been reported.
struct ActiveSlot<'a>(&'a PoolShared);

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.0.state);
        state.active = state.active.saturating_sub(1);
        drop(state);
        self.0.changed.notify_all();
    }
}

/// Bounded-concurrency executor for probes.
///
/// Jobs are dispatched in submission order to at most `capacity` workers at
/// a time. Each worker thread builds one prober through the factory on its
/// first job and reuses it afterwards.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    factory: ProberFactory,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(capacity: usize, factory: ProberFactory) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }
        let pool = Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    capacity,
                    active: 0,
                    peak_active: 0,
                    paused: false,
                    shutdown: false,
                }),
                changed: Condvar::new(),
            }),
            factory,
            workers: Mutex::new(Vec::new()),
        };
        pool.ensure_workers(capacity)?;
        Ok(pool)
    }

    pub fn submit(&self, job: ProbeJob) -> Result<JobHandle, PoolError> {
        let id = job.target.id();
        let (done, rx) = crossbeam_channel::bounded(1);
        {
            let mut state = lock(&self.shared.state);
            if state.shutdown {
                return Err(PoolError::ShutDown);
            }
            state.queue.push_back(QueuedJob { job, done });
        }
        self.shared.changed.notify_all();
        Ok(JobHandle { id, done: rx })
    }

    /// Applies at the next dispatch decision; running jobs are left alone.
    pub fn set_capacity(&self, capacity: usize) -> Result<(), PoolError> {
        if capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }
        self.ensure_workers(capacity)?;
        lock(&self.shared.state).capacity = capacity;
        self.shared.changed.notify_all();
        Ok(())
    }

    /// While paused no queued job is dispatched; running jobs continue.
    pub fn set_paused(&self, paused: bool) {
        lock(&self.shared.state).paused = paused;
        self.shared.changed.notify_all();
    }

    /// Removes every job that has not been dispatched yet. Their handles
    /// resolve to [`JobOutcome::Dropped`].
    pub fn drain_pending(&self) -> Vec<ProbeTarget> {
        let drained: Vec<QueuedJob> = lock(&self.shared.state).queue.drain(..).collect();
        self.shared.changed.notify_all();
        drained.into_iter().map(|queued| queued.job.target).collect()
    }

    /// Stops accepting submissions. Queued and running jobs still finish.
    pub fn shutdown(&self) {
        lock(&self.shared.state).shutdown = true;
        self.shared.changed.notify_all();
    }

    /// Waits for every worker thread to exit. Call after [`shutdown`].
    ///
    /// [`shutdown`]: WorkerPool::shutdown
    pub fn join(&self) {
        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("probe worker thread panicked");
            }
        }
    }

    pub fn capacity(&self) -> usize {
        lock(&self.shared.state).capacity
    }

    pub fn active(&self) -> usize {
        lock(&self.shared.state).active
    }

    pub fn pending(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    /// Highest number of jobs that ever ran at the same time.
    pub fn peak_active(&self) -> usize {
        lock(&self.shared.state).peak_active
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.shared.state).paused
    }

    fn ensure_workers(&self, count: usize) -> Result<(), PoolError> {
        let mut workers = lock(&self.workers);
        while workers.len() < count {
            let shared = Arc::clone(&self.shared);
            let factory = Arc::clone(&self.factory);
            let handle = thread::Builder::new()
                .name(format!("probe-worker-{}", workers.len() + 1))
                .spawn(move || worker_loop(&shared, &factory))?;
            workers.push(handle);
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.drain_pending();
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared, factory: &ProberFactory) {
    let mut prober: Option<Box<dyn Probe>> = None;
    while let Some(QueuedJob { job, done }) = shared.next_job() {
        let _slot = ActiveSlot(shared);
        let result = run_job(&mut prober, factory, &job);
        if let Some(observer) = &job.observer {
            let delivered =
                panic::catch_unwind(AssertUnwindSafe(|| observer.on_complete(&result)));
            if delivered.is_err() {
                tracing::error!(probe_id = result.id, "job completion callback panicked");
            }
        }
        // The handle may already be gone.
        let _ = done.send(result);
    }
}

fn run_job(
    prober: &mut Option<Box<dyn Probe>>,
    factory: &ProberFactory,
    job: &ProbeJob,
) -> ProbeResult {
    let target = &job.target;
    if job.cancel.is_cancelled() {
        return ProbeResult::cancelled(target, Duration::ZERO, 0);
    }

    if prober.is_none() {
        match factory() {
            Ok(created) => *prober = Some(created),
            Err(err) => {
                tracing::warn!(error = %err, "probe client init failed");
                return ProbeResult::failure(
                    target,
                    ProbeOutcome::NetworkError,
                    format!("probe client init failed: {err}"),
                    Duration::ZERO,
                );
            }
        }
    }
    let Some(probe) = prober.as_mut() else {
        return ProbeResult::failure(
            target,
            ProbeOutcome::NetworkError,
            "probe client unavailable",
            Duration::ZERO,
        );
    };

    let progress: Option<ProgressFn> = job.observer.as_ref().map(|observer| {
        let observer = Arc::clone(observer);
        Arc::new(move |sample: ProgressSample| observer.on_progress(sample)) as ProgressFn
    });

    match panic::catch_unwind(AssertUnwindSafe(|| {
        probe.execute(target, &job.cancel, progress)
    })) {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(probe_id = target.id(), "prober panicked; rebuilding client");
            *prober = None;
            ProbeResult::failure(
                target,
                ProbeOutcome::NetworkError,
                "probe panicked",
                Duration::ZERO,
            )
        }
    }
}
