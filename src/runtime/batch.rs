use super::pool::{JobObserver, ProbeJob, ProberFactory, WorkerPool};
use super::{BatchError, BatchState, BatchStatus};
use crate::common::sync::{lock, wait, wait_timeout};
use crate::config::{BatchId, ConfigError, ProbeId, TargetFactory};
use crate::events::EventSink;
use crate::metrics::StatsSnapshot;
use crate::metrics_aggregate::StatsAggregator;
use crate::probe::{CancelToken, ProbeResult, ProgressSample};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

struct BatchInner {
    status: BatchStatus,
    total: u64,
    completed: u64,
    dropped: u64,
    cancel_requested: bool,
    /// Indexed by probe id; guards against a second terminal event.
    finished: Vec<bool>,
    pool: Option<WorkerPool>,
}

struct BatchShared {
    batch_id: BatchId,
    inner: Mutex<BatchInner>,
    changed: Condvar,
    // Bumped under the pool lock at dispatch; never under `inner`.
    submitted: AtomicU64,
    cancel: CancelToken,
    aggregator: Arc<StatsAggregator>,
    sink: Arc<dyn EventSink>,
}

impl BatchShared {
    fn in_flight(&self, inner: &BatchInner) -> u64 {
        self.submitted
            .load(Ordering::SeqCst)
            .saturating_sub(inner.completed)
    }

    fn transition(&self, inner: &mut BatchInner, status: BatchStatus) {
        inner.status = status;
        self.publish("on_status", || self.sink.on_status(self.batch_id, status));
        self.changed.notify_all();
    }

    /// Calls into the sink. A panicking sink loses that one event; the batch
    /// keeps counting and still reaches a terminal state.
    fn publish(&self, callback: &'static str, deliver: impl FnOnce()) {
        if panic::catch_unwind(AssertUnwindSafe(deliver)).is_err() {
            tracing::error!(batch_id = %self.batch_id, callback, "event sink panicked");
        }
    }

    /// Moves to a terminal state once nothing is left to wait for.
    fn finish_if_done(&self, inner: &mut BatchInner) {
        if inner.status.is_terminal() {
            return;
        }
        let next = if inner.cancel_requested {
            (self.in_flight(inner) == 0).then_some(BatchStatus::Cancelled)
        } else {
            (inner.completed == inner.total).then_some(BatchStatus::Completed)
        };
        let Some(status) = next else {
            return;
        };

        if let Some(pool) = &inner.pool {
            pool.set_paused(false);
            pool.shutdown();
        }
        self.transition(inner, status);
        let stats = self.aggregator.snapshot();
        tracing::info!(
            batch_id = %self.batch_id,
            status = %status,
            completed = inner.completed,
            dropped = inner.dropped,
            success = stats.success_count,
            failed = stats.failed_count,
            "batch finished"
        );
    }
}

impl JobObserver for BatchShared {
    fn on_dispatch(&self, _id: ProbeId) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
    }

    fn on_progress(&self, sample: ProgressSample) {
        self.publish("on_progress", || self.sink.on_progress(&sample));
    }

    fn on_complete(&self, result: &ProbeResult) {
        let mut inner = lock(&self.inner);
        let slot = usize::try_from(result.id).ok();
        match slot.and_then(|slot| inner.finished.get_mut(slot)) {
            Some(done) if !*done => *done = true,
            _ => {
                tracing::warn!(
                    batch_id = %self.batch_id,
                    probe_id = result.id,
                    "ignoring duplicate or unknown probe result"
                );
                return;
            }
        }

        inner.completed += 1;
        // Published under the batch lock so no result can trail the
        // terminal status event.
        self.aggregator.record(result);
        self.publish("on_result", || self.sink.on_result(result));
        self.finish_if_done(&mut inner);
    }
}

/// Runs one batch of probes on a worker pool.
///
/// Lifecycle: `Idle -> Running <-> Paused -> Completed`, with `Cancelled`
/// reachable from `Running` and `Paused`. A runner drives a single batch.
///
/// Every event is delivered to the sink: one status event per transition,
/// zero or more progress samples per throughput probe and exactly one result
/// per dispatched probe. The runner's own [`StatsAggregator`] sees every
/// result before the sink does.
pub struct BatchRunner {
    shared: Arc<BatchShared>,
    prober_factory: ProberFactory,
}

impl BatchRunner {
    pub fn new(prober_factory: ProberFactory, sink: Arc<dyn EventSink>) -> Self {
        Self {
            shared: Arc::new(BatchShared {
                batch_id: Uuid::new_v4(),
                inner: Mutex::new(BatchInner {
                    status: BatchStatus::Idle,
                    total: 0,
                    completed: 0,
                    dropped: 0,
                    cancel_requested: false,
                    finished: Vec::new(),
                    pool: None,
                }),
                changed: Condvar::new(),
                submitted: AtomicU64::new(0),
                cancel: CancelToken::new(),
                aggregator: Arc::new(StatsAggregator::new()),
                sink,
            }),
            prober_factory,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.shared.batch_id
    }

    /// Builds `count` targets with ids `1..=count` and queues them on a pool
    /// of `concurrency` workers. Every target is built and checked before
    /// anything is dispatched.
    pub fn start<F>(
        &self,
        count: usize,
        concurrency: usize,
        mut factory: F,
    ) -> Result<(), BatchError>
    where
        F: TargetFactory,
    {
        if count == 0 {
            return Err(ConfigError::InvalidCount { value: count }.into());
        }
        if concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency { value: concurrency }.into());
        }

        let mut inner = self.lock_inner();
        if inner.status != BatchStatus::Idle {
            return Err(BatchError::InvalidTransition {
                action: "start",
                status: inner.status,
            });
        }

        let mut targets = Vec::with_capacity(count);
        for id in 1..=count as u64 {
            let target = factory.build(id);
            if target.id() != id {
                return Err(ConfigError::TargetIdMismatch {
                    expected: id,
                    got: target.id(),
                }
                .into());
            }
            targets.push(target);
        }

        let pool = WorkerPool::new(concurrency, Arc::clone(&self.prober_factory))?;
        let observer: Arc<dyn JobObserver> = self.shared.clone();
        for target in targets {
            let job = ProbeJob::new(target, self.shared.cancel.clone())
                .with_observer(Arc::clone(&observer));
            // Dispatch can start right away; results wait on `inner`.
            pool.submit(job)?;
        }

        inner.total = count as u64;
        inner.finished = vec![false; count + 1];
        inner.pool = Some(pool);
        tracing::info!(
            batch_id = %self.shared.batch_id,
            total = count,
            concurrency,
            "batch started"
        );
        self.shared.transition(&mut inner, BatchStatus::Running);
        Ok(())
    }

    /// Stops dispatching queued probes; running ones finish normally.
    pub fn pause(&self) -> Result<(), BatchError> {
        let mut inner = self.lock_inner();
        Self::expect_status(&inner, "pause", &[BatchStatus::Running])?;
        if let Some(pool) = &inner.pool {
            pool.set_paused(true);
        }
        tracing::info!(batch_id = %self.shared.batch_id, "batch paused");
        self.shared.transition(&mut inner, BatchStatus::Paused);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), BatchError> {
        let mut inner = self.lock_inner();
        Self::expect_status(&inner, "resume", &[BatchStatus::Paused])?;
        if let Some(pool) = &inner.pool {
            pool.set_paused(false);
        }
        tracing::info!(batch_id = %self.shared.batch_id, "batch resumed");
        self.shared.transition(&mut inner, BatchStatus::Running);
        Ok(())
    }

    /// Signals running probes to stop and discards queued ones. The batch
    /// turns `Cancelled` once every running probe has reported back.
    pub fn cancel(&self) -> Result<(), BatchError> {
        let mut inner = self.lock_inner();
        if inner.cancel_requested && !inner.status.is_terminal() {
            return Ok(());
        }
        Self::expect_status(
            &inner,
            "cancel",
            &[BatchStatus::Running, BatchStatus::Paused],
        )?;

        inner.cancel_requested = true;
        self.shared.cancel.cancel();
        let dropped = inner
            .pool
            .as_ref()
            .map_or(0, |pool| pool.drain_pending().len() as u64);
        inner.dropped += dropped;
        tracing::info!(
            batch_id = %self.shared.batch_id,
            dropped,
            in_flight = self.shared.in_flight(&inner),
            "batch cancel requested"
        );
        self.shared.finish_if_done(&mut inner);
        Ok(())
    }

    /// Changes how many probes may run at once. Takes effect at the next
    /// dispatch decision.
    pub fn set_concurrency(&self, concurrency: usize) -> Result<(), BatchError> {
        if concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency { value: concurrency }.into());
        }
        let inner = self.lock_inner();
        Self::expect_status(
            &inner,
            "resize",
            &[BatchStatus::Running, BatchStatus::Paused],
        )?;
        if let Some(pool) = &inner.pool {
            pool.set_capacity(concurrency)?;
        }
        tracing::info!(batch_id = %self.shared.batch_id, concurrency, "batch concurrency changed");
        Ok(())
    }

    /// Blocks until the batch is `Completed` or `Cancelled`. Returns at once
    /// for a batch that was never started.
    pub fn wait(&self) -> BatchStatus {
        let mut inner = self.lock_inner();
        while !inner.status.is_terminal() && inner.status != BatchStatus::Idle {
            inner = wait(&self.shared.changed, inner);
        }
        inner.status
    }

    /// Like [`wait`](BatchRunner::wait) but gives up after `timeout`,
    /// returning `None` if the batch is still active.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<BatchStatus> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock_inner();
        loop {
            if inner.status.is_terminal() || inner.status == BatchStatus::Idle {
                return Some(inner.status);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = wait_timeout(&self.shared.changed, inner, deadline - now);
            inner = guard;
        }
    }

    pub fn status(&self) -> BatchStatus {
        self.lock_inner().status
    }

    pub fn state(&self) -> BatchState {
        let inner = self.lock_inner();
        BatchState {
            batch_id: self.shared.batch_id,
            status: inner.status,
            total: inner.total,
            submitted: self.shared.submitted.load(Ordering::SeqCst),
            completed: inner.completed,
            dropped: inner.dropped,
            is_running: matches!(inner.status, BatchStatus::Running | BatchStatus::Paused),
            is_paused: inner.status == BatchStatus::Paused,
            cancel_requested: inner.cancel_requested,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.aggregator.snapshot()
    }

    pub fn aggregator(&self) -> Arc<StatsAggregator> {
        Arc::clone(&self.shared.aggregator)
    }

    fn lock_inner(&self) -> MutexGuard<'_, BatchInner> {
        lock(&self.shared.inner)
    }

    fn expect_status(
        inner: &BatchInner,
        action: &'static str,
        allowed: &[BatchStatus],
    ) -> Result<(), BatchError> {
        if inner.cancel_requested && !inner.status.is_terminal() {
            return Err(BatchError::CancelPending);
        }
        if allowed.contains(&inner.status) {
            Ok(())
        } else {
            Err(BatchError::InvalidTransition {
                action,
                status: inner.status,
            })
        }
    }
}

impl Drop for BatchRunner {
    fn drop(&mut self) {
        let active = matches!(self.status(), BatchStatus::Running | BatchStatus::Paused);
        if active && let Err(err) = self.cancel() {
            tracing::debug!(error = %err, "cancel on drop failed");
        }
    }
}
