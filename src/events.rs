use crate::common::sync::{lock, wait_timeout};
use crate::config::BatchId;
use crate::probe::{ProbeEvent, ProbeResult, ProgressSample};
use crate::runtime::BatchStatus;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default number of progress samples buffered before the oldest is dropped.
pub const DEFAULT_PROGRESS_CAPACITY: usize = 1024;

/// Receives engine events. Called from worker threads; implementations must
/// return quickly and never call back into the runner.
pub trait EventSink: Send + Sync {
    fn on_progress(&self, sample: &ProgressSample);

    fn on_result(&self, result: &ProbeResult);

    fn on_status(&self, _batch_id: BatchId, _status: BatchStatus) {}
}

/// Sink that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_progress(&self, _sample: &ProgressSample) {}

    fn on_result(&self, _result: &ProbeResult) {}
}

/// Progress samples and the other events wait in separate lanes so the
/// oldest sample can be evicted from the front. Each event carries a push
/// sequence number and `pop` merges the lanes back into push order.
#[derive(Default)]
struct QueueState {
    next_seq: u64,
    progress: VecDeque<(u64, ProbeEvent)>,
    lifecycle: VecDeque<(u64, ProbeEvent)>,
    dropped_progress: u64,
}

impl QueueState {
    fn pop(&mut self) -> Option<ProbeEvent> {
        let progress_first = match (self.progress.front(), self.lifecycle.front()) {
            (Some((progress, _)), Some((lifecycle, _))) => progress < lifecycle,
            (progress, _) => progress.is_some(),
        };
        let lane = if progress_first {
            &mut self.progress
        } else {
            &mut self.lifecycle
        };
        lane.pop_front().map(|(_, event)| event)
    }

    fn len(&self) -> usize {
        self.progress.len() + self.lifecycle.len()
    }
}

/// Pull-based sink decoupling a slow consumer from the workers.
///
/// Progress samples are bounded: once `progress_capacity` of them are
/// waiting, each new sample evicts the oldest one. Results and status events
/// are never dropped, and producers never block.
pub struct EventQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    progress_capacity: usize,
}

impl EventQueue {
    pub fn new(progress_capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            progress_capacity: progress_capacity.max(1),
        }
    }

    pub fn push(&self, event: ProbeEvent) {
        let mut state = lock(&self.state);
        let seq = state.next_seq;
        state.next_seq += 1;
        if event.is_progress() {
            if state.progress.len() >= self.progress_capacity {
                state.progress.pop_front();
                state.dropped_progress += 1;
                tracing::trace!(
                    dropped = state.dropped_progress,
                    "event queue full; dropped oldest progress sample"
                );
            }
            state.progress.push_back((seq, event));
        } else {
            state.lifecycle.push_back((seq, event));
        }
        drop(state);
        self.ready.notify_one();
    }

    pub fn try_recv(&self) -> Option<ProbeEvent> {
        lock(&self.state).pop()
    }

    /// Waits up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ProbeEvent> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if let Some(event) = state.pop() {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = wait_timeout(&self.ready, state, deadline - now);
            state = guard;
        }
    }

    pub fn drain(&self) -> Vec<ProbeEvent> {
        let mut state = lock(&self.state);
        let mut events = Vec::with_capacity(state.len());
        while let Some(event) = state.pop() {
            events.push(event);
        }
        events
    }

    pub fn len(&self) -> usize {
        lock(&self.state).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Progress samples evicted so far because the consumer fell behind.
    pub fn dropped_progress(&self) -> u64 {
        lock(&self.state).dropped_progress
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_CAPACITY)
    }
}

impl EventSink for EventQueue {
    fn on_progress(&self, sample: &ProgressSample) {
        self.push(ProbeEvent::Progress(sample.clone()));
    }

    fn on_result(&self, result: &ProbeResult) {
        self.push(ProbeEvent::Result(result.clone()));
    }

    fn on_status(&self, batch_id: BatchId, status: BatchStatus) {
        self.push(ProbeEvent::Status { batch_id, status });
    }
}
