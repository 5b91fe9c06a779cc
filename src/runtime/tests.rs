use super::{
    BatchError, BatchRunner, BatchStatus, JobObserver, JobOutcome, PoolError, ProbeJob,
    ProberFactory, WorkerPool,
};
use crate::config::{BatchId, ConfigError, ProbeId, ProbeKind, ProbeTarget, TargetTemplate};
use crate::events::{EventQueue, EventSink};
use crate::probe::{
    CancelToken, Probe, ProbeEvent, ProbeOutcome, ProbeResult, ProgressFn, ProgressSample,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use url::Url;

const LONG: Duration = Duration::from_secs(10);

/// Shared script for the in-process probes of one test.
#[derive(Clone)]
struct Script {
    delay: Duration,
    outcome: Arc<dyn Fn(ProbeId) -> (ProbeOutcome, Option<u16>) + Send + Sync>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    started: Arc<Mutex<Vec<ProbeId>>>,
}

impl Script {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            outcome: Arc::new(|_| (ProbeOutcome::Success, Some(200))),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            started: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn with_outcome<F>(mut self, outcome: F) -> Self
    where
        F: Fn(ProbeId) -> (ProbeOutcome, Option<u16>) + Send + Sync + 'static,
    {
        self.outcome = Arc::new(outcome);
        self
    }

    fn factory(&self) -> ProberFactory {
        let script = self.clone();
        Arc::new(move || {
            Ok(Box::new(ScriptedProbe {
                script: script.clone(),
            }) as Box<dyn Probe>)
        })
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn started(&self) -> Vec<ProbeId> {
        self.started.lock().expect("started").clone()
    }
}

struct ScriptedProbe {
    script: Script,
}

impl Probe for ScriptedProbe {
    fn execute(
        &mut self,
        target: &ProbeTarget,
        cancel: &CancelToken,
        progress: Option<ProgressFn>,
    ) -> ProbeResult {
        let script = &self.script;
        script.started.lock().expect("started").push(target.id());
        let running = script.running.fetch_add(1, Ordering::SeqCst) + 1;
        script.peak.fetch_max(running, Ordering::SeqCst);

        let began = Instant::now();
        let mut bytes = 0u64;
        while began.elapsed() < script.delay && !cancel.is_cancelled() {
            thread::sleep(Duration::from_millis(1));
            if target.kind() == ProbeKind::Throughput
                && let Some(progress) = &progress
            {
                bytes += 1024;
                progress(ProgressSample {
                    probe_id: target.id(),
                    bytes_so_far: bytes,
                    total_bytes: None,
                    instantaneous_speed_kbps: 1.0,
                    smoothed_speed_kbps: 1.0,
                    rolling_avg_kbps: 1.0,
                    progress_percent: None,
                    timestamp: SystemTime::now(),
                });
            }
        }
        script.running.fetch_sub(1, Ordering::SeqCst);

        if cancel.is_cancelled() {
            return ProbeResult::cancelled(target, began.elapsed(), bytes);
        }
        let (outcome, http_status) = (script.outcome)(target.id());
        ProbeResult {
            id: target.id(),
            kind: target.kind(),
            outcome,
            http_status,
            elapsed: began.elapsed(),
            bytes_transferred: bytes,
            speed_kbps: (outcome.is_success() && target.kind() == ProbeKind::Throughput)
                .then_some(512.0),
            body_preview: None,
            error_detail: (!outcome.is_success()).then(|| "scripted failure".to_string()),
        }
    }
}

fn template(kind: ProbeKind) -> TargetTemplate {
    TargetTemplate::new(vec![Url::parse("http://127.0.0.1/").expect("url")], kind)
        .expect("template")
}

fn runner(script: &Script) -> (BatchRunner, Arc<EventQueue>) {
    let queue = Arc::new(EventQueue::new(100_000));
    let sink: Arc<dyn EventSink> = queue.clone();
    (BatchRunner::new(script.factory(), sink), queue)
}

fn results(events: &[ProbeEvent]) -> Vec<&ProbeResult> {
    events
        .iter()
        .filter_map(|event| match event {
            ProbeEvent::Result(result) => Some(result),
            _ => None,
        })
        .collect()
}

fn statuses(events: &[ProbeEvent]) -> Vec<BatchStatus> {
    events
        .iter()
        .filter_map(|event| match event {
            ProbeEvent::Status { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + LONG;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn all_success_batch_completes_with_full_histogram() {
    let script = Script::new(Duration::from_millis(5));
    let (runner, queue) = runner(&script);

    runner
        .start(10, 3, template(ProbeKind::Latency))
        .expect("start");
    assert_eq!(runner.wait_timeout(LONG), Some(BatchStatus::Completed));

    let stats = runner.stats();
    assert_eq!(stats.total, 10);
    assert_eq!(stats.success_count, 10);
    assert_eq!(stats.failed_count, 0);
    assert_eq!(stats.status_histogram.len(), 1);
    assert_eq!(stats.status_histogram.get("200"), Some(&10));

    let state = runner.state();
    assert_eq!(state.submitted, 10);
    assert_eq!(state.completed, 10);
    assert!(!state.is_running);

    let events = queue.drain();
    assert_eq!(
        statuses(&events),
        vec![BatchStatus::Running, BatchStatus::Completed]
    );
    assert!(matches!(
        events.last(),
        Some(ProbeEvent::Status {
            status: BatchStatus::Completed,
            ..
        })
    ));
    let ids: BTreeSet<ProbeId> = results(&events).iter().map(|result| result.id).collect();
    assert_eq!(ids, (1..=10).collect());
}

#[test]
fn concurrency_limit_is_never_exceeded() {
    let script = Script::new(Duration::from_millis(10));
    let (runner, _queue) = runner(&script);

    runner
        .start(24, 4, template(ProbeKind::Latency))
        .expect("start");
    assert_eq!(runner.wait_timeout(LONG), Some(BatchStatus::Completed));

    assert!(script.peak() <= 4, "peak {}", script.peak());
    assert!(script.peak() >= 1);
}

#[test]
fn dispatch_follows_submission_order() {
    let script = Script::new(Duration::from_millis(1));
    let (runner, _queue) = runner(&script);

    runner
        .start(6, 1, template(ProbeKind::Latency))
        .expect("start");
    runner.wait_timeout(LONG).expect("finished");

    assert_eq!(script.started(), vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn connection_failures_all_count_as_failed() {
    let script = Script::new(Duration::from_millis(1))
        .with_outcome(|_| (ProbeOutcome::NetworkError, None));
    let (runner, _queue) = runner(&script);

    runner
        .start(5, 5, template(ProbeKind::Latency))
        .expect("start");
    runner.wait_timeout(LONG).expect("finished");

    let stats = runner.stats();
    assert_eq!(stats.total, 5);
    assert_eq!(stats.failed_count, 5);
    assert_eq!(stats.timeout_count, 0);
    assert_eq!(stats.status_histogram.get("CONNECTION_ERROR"), Some(&5));
}

#[test]
fn mixed_outcomes_keep_counts_consistent() {
    let script = Script::new(Duration::from_millis(1)).with_outcome(|id| match id % 4 {
        0 => (ProbeOutcome::Timeout, None),
        1 => (ProbeOutcome::Success, Some(200)),
        2 => (ProbeOutcome::HttpError, Some(503)),
        _ => (ProbeOutcome::ProxyError, Some(403)),
    });
    let (runner, _queue) = runner(&script);

    runner
        .start(20, 6, template(ProbeKind::Latency))
        .expect("start");
    runner.wait_timeout(LONG).expect("finished");

    let stats = runner.stats();
    assert_eq!(stats.success_count + stats.failed_count, 20);
    assert_eq!(stats.histogram_total(), 20);
    assert_eq!(stats.success_count, 5);
    assert_eq!(stats.timeout_count, 5);
    assert_eq!(stats.status_histogram.get("503"), Some(&5));
    assert_eq!(stats.status_histogram.get("403"), Some(&5));
    assert_eq!(stats.status_histogram.get("TIMEOUT"), Some(&5));
}

#[test]
fn zero_count_or_concurrency_is_rejected_before_dispatch() {
    let script = Script::new(Duration::ZERO);
    let (runner, queue) = runner(&script);

    let err = runner
        .start(0, 3, template(ProbeKind::Latency))
        .expect_err("count");
    assert!(matches!(
        err,
        BatchError::Config(ConfigError::InvalidCount { value: 0 })
    ));

    let err = runner
        .start(3, 0, template(ProbeKind::Latency))
        .expect_err("concurrency");
    match err {
        BatchError::Config(config) => assert_eq!(config.field(), "concurrency"),
        other => panic!("unexpected error {other:?}"),
    }

    assert_eq!(runner.status(), BatchStatus::Idle);
    assert!(queue.is_empty());
    assert!(script.started().is_empty());
}

#[test]
fn factory_must_keep_assigned_ids() {
    let script = Script::new(Duration::ZERO);
    let (runner, _queue) = runner(&script);
    let shifted = |id: ProbeId| {
        ProbeTarget::new(
            id + 1,
            Url::parse("http://127.0.0.1/").expect("url"),
            ProbeKind::Latency,
        )
    };

    let err = runner.start(3, 1, shifted).expect_err("mismatch");
    assert!(matches!(
        err,
        BatchError::Config(ConfigError::TargetIdMismatch {
            expected: 1,
            got: 2
        })
    ));
    assert!(script.started().is_empty());
}

#[test]
fn invalid_transitions_are_reported() {
    let script = Script::new(Duration::from_millis(1));
    let (runner, _queue) = runner(&script);

    assert!(matches!(
        runner.pause(),
        Err(BatchError::InvalidTransition {
            action: "pause",
            status: BatchStatus::Idle
        })
    ));
    assert!(runner.cancel().is_err());

    runner
        .start(2, 1, template(ProbeKind::Latency))
        .expect("start");
    assert!(matches!(
        runner.start(2, 1, template(ProbeKind::Latency)),
        Err(BatchError::InvalidTransition { action: "start", .. })
    ));
    runner.wait_timeout(LONG).expect("finished");

    assert!(matches!(
        runner.resume(),
        Err(BatchError::InvalidTransition {
            action: "resume",
            status: BatchStatus::Completed
        })
    ));
    assert!(matches!(
        runner.cancel(),
        Err(BatchError::InvalidTransition {
            action: "cancel",
            status: BatchStatus::Completed
        })
    ));
}

#[test]
fn pause_freezes_dispatch_until_resume() {
    let script = Script::new(Duration::from_millis(30));
    let (runner, queue) = runner(&script);

    runner
        .start(10, 2, template(ProbeKind::Latency))
        .expect("start");
    wait_until(|| runner.state().submitted >= 2);
    runner.pause().expect("pause");

    let frozen = runner.state().submitted;
    assert!(frozen < 10);
    thread::sleep(Duration::from_millis(150));

    let state = runner.state();
    assert_eq!(state.status, BatchStatus::Paused);
    assert!(state.is_paused);
    assert_eq!(state.submitted, frozen);
    // In-flight probes were allowed to finish.
    assert_eq!(state.completed, frozen);
    assert!(matches!(runner.resume(), Ok(())));
    assert!(matches!(
        runner.pause().and_then(|()| runner.resume()),
        Ok(())
    ));

    assert_eq!(runner.wait_timeout(LONG), Some(BatchStatus::Completed));
    assert_eq!(runner.state().submitted, 10);
    assert_eq!(runner.stats().success_count, 10);

    let transitions = statuses(&queue.drain());
    assert_eq!(transitions.first(), Some(&BatchStatus::Running));
    assert!(transitions.contains(&BatchStatus::Paused));
    assert_eq!(transitions.last(), Some(&BatchStatus::Completed));
}

#[test]
fn cancel_stops_in_flight_and_drops_queued_probes() {
    let script = Script::new(LONG);
    let (runner, queue) = runner(&script);

    runner
        .start(10, 2, template(ProbeKind::Latency))
        .expect("start");
    wait_until(|| script.started().len() == 2);
    runner.cancel().expect("cancel");

    assert_eq!(runner.wait_timeout(LONG), Some(BatchStatus::Cancelled));
    let state = runner.state();
    assert_eq!(state.submitted, 2);
    assert_eq!(state.completed, 2);
    assert_eq!(state.dropped, 8);
    assert!(state.cancel_requested);

    let events = queue.drain();
    let results = results(&events);
    assert_eq!(results.len(), 2);
    assert!(
        results
            .iter()
            .all(|result| result.outcome == ProbeOutcome::Cancelled)
    );
    assert!(matches!(
        events.last(),
        Some(ProbeEvent::Status {
            status: BatchStatus::Cancelled,
            ..
        })
    ));

    thread::sleep(Duration::from_millis(50));
    assert!(queue.is_empty(), "events after cancellation");
    assert_eq!(script.started().len(), 2);

    let stats = runner.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.failed_count, 2);
    assert_eq!(stats.status_histogram.get("CANCELLED"), Some(&2));
}

#[test]
fn cancel_while_paused_finishes_once_in_flight_returns() {
    let script = Script::new(Duration::from_millis(20));
    let (runner, _queue) = runner(&script);

    runner
        .start(5, 1, template(ProbeKind::Latency))
        .expect("start");
    runner.pause().expect("pause");
    runner.cancel().expect("cancel");
    assert!(matches!(
        runner.resume(),
        Err(BatchError::CancelPending) | Err(BatchError::InvalidTransition { .. })
    ));

    assert_eq!(runner.wait_timeout(LONG), Some(BatchStatus::Cancelled));
    let state = runner.state();
    assert_eq!(state.completed, state.submitted);
    assert_eq!(state.submitted + state.dropped, 5);
}

#[test]
fn throughput_progress_precedes_result_per_probe() {
    let script = Script::new(Duration::from_millis(15));
    let (runner, queue) = runner(&script);

    runner
        .start(4, 2, template(ProbeKind::Throughput))
        .expect("start");
    runner.wait_timeout(LONG).expect("finished");

    let mut last_bytes: HashMap<ProbeId, u64> = HashMap::new();
    let mut finished: BTreeSet<ProbeId> = BTreeSet::new();
    for event in queue.drain() {
        match event {
            ProbeEvent::Progress(sample) => {
                assert!(!finished.contains(&sample.probe_id));
                let previous = last_bytes.insert(sample.probe_id, sample.bytes_so_far);
                assert!(previous.is_none_or(|bytes| bytes <= sample.bytes_so_far));
            }
            ProbeEvent::Result(result) => {
                assert!(finished.insert(result.id), "duplicate result");
            }
            ProbeEvent::Status { .. } => {}
        }
    }
    assert_eq!(finished.len(), 4);
    assert!(!last_bytes.is_empty());
    assert_eq!(runner.stats().throughput.count, 4);
}

#[test]
fn concurrency_can_change_mid_run() {
    let script = Script::new(Duration::from_millis(10));
    let (runner, _queue) = runner(&script);

    assert!(runner.set_concurrency(2).is_err());
    runner
        .start(12, 1, template(ProbeKind::Latency))
        .expect("start");
    assert!(matches!(
        runner.set_concurrency(0),
        Err(BatchError::Config(ConfigError::InvalidConcurrency { value: 0 }))
    ));
    runner.set_concurrency(3).expect("resize");

    assert_eq!(runner.wait_timeout(LONG), Some(BatchStatus::Completed));
    assert!(script.peak() <= 3);
}

#[test]
fn panicking_probe_becomes_network_error() {
    struct Exploding;

    impl Probe for Exploding {
        fn execute(
            &mut self,
            _target: &ProbeTarget,
            _cancel: &CancelToken,
            _progress: Option<ProgressFn>,
        ) -> ProbeResult {
            panic!("scripted panic");
        }
    }

    let factory: ProberFactory = Arc::new(|| Ok(Box::new(Exploding) as Box<dyn Probe>));
    let queue = Arc::new(EventQueue::default());
    let sink: Arc<dyn EventSink> = queue.clone();
    let runner = BatchRunner::new(factory, sink);

    runner
        .start(3, 2, template(ProbeKind::Latency))
        .expect("start");
    assert_eq!(runner.wait_timeout(LONG), Some(BatchStatus::Completed));
    let stats = runner.stats();
    assert_eq!(stats.failed_count, 3);
    assert_eq!(stats.status_histogram.get("CONNECTION_ERROR"), Some(&3));
}

#[test]
fn prober_init_failure_is_reported_per_probe() {
    let factory: ProberFactory = Arc::new(|| Err(curl::Error::new(2)));
    let runner = BatchRunner::new(factory, Arc::new(EventQueue::default()));

    runner
        .start(2, 1, template(ProbeKind::Latency))
        .expect("start");
    assert_eq!(runner.wait_timeout(LONG), Some(BatchStatus::Completed));
    assert_eq!(runner.stats().failed_count, 2);
}

#[test]
fn panicking_sink_does_not_stall_the_batch() {
    struct FlakySink {
        results: Mutex<Vec<ProbeId>>,
        statuses: Mutex<Vec<BatchStatus>>,
    }

    impl EventSink for FlakySink {
        fn on_progress(&self, _sample: &ProgressSample) {}

        fn on_result(&self, result: &ProbeResult) {
            if result.id == 1 {
                panic!("sink rejected result 1");
            }
            self.results.lock().expect("results").push(result.id);
        }

        fn on_status(&self, _batch_id: BatchId, status: BatchStatus) {
            if status == BatchStatus::Running {
                panic!("sink rejected running status");
            }
            self.statuses.lock().expect("statuses").push(status);
        }
    }

    let script = Script::new(Duration::from_millis(2));
    let sink = Arc::new(FlakySink {
        results: Mutex::new(Vec::new()),
        statuses: Mutex::new(Vec::new()),
    });
    let runner = BatchRunner::new(script.factory(), sink.clone());

    runner
        .start(3, 1, template(ProbeKind::Latency))
        .expect("start");
    assert_eq!(runner.wait_timeout(LONG), Some(BatchStatus::Completed));

    let state = runner.state();
    assert_eq!(state.submitted, 3);
    assert_eq!(state.completed, 3);
    assert_eq!(runner.stats().success_count, 3);
    assert_eq!(script.started(), vec![1, 2, 3]);
    assert_eq!(*sink.results.lock().expect("results"), vec![2, 3]);
    assert_eq!(
        *sink.statuses.lock().expect("statuses"),
        vec![BatchStatus::Completed]
    );
}

#[test]
fn pool_worker_survives_panicking_completion_callback() {
    struct Explosive;

    impl JobObserver for Explosive {
        fn on_progress(&self, _sample: ProgressSample) {}

        fn on_complete(&self, result: &ProbeResult) {
            panic!("observer rejected result {}", result.id);
        }
    }

    let script = Script::new(Duration::ZERO);
    let pool = WorkerPool::new(1, script.factory()).expect("pool");
    let target = |id| template(ProbeKind::Latency).target(id);
    let observer: Arc<dyn JobObserver> = Arc::new(Explosive);

    let first = pool
        .submit(ProbeJob::new(target(1), CancelToken::new()).with_observer(observer))
        .expect("submit");
    let second = pool
        .submit(ProbeJob::new(target(2), CancelToken::new()))
        .expect("submit");

    assert!(matches!(first.wait(), JobOutcome::Finished(_)));
    match second.wait_timeout(LONG) {
        Some(JobOutcome::Finished(result)) => assert_eq!(result.id, 2),
        other => panic!("second job did not finish: {other:?}"),
    }
    assert_eq!(pool.peak_active(), 1);
}

#[test]
fn pool_runs_jobs_and_reports_drained_ones() {
    let script = Script::new(Duration::from_millis(5));
    let pool = WorkerPool::new(1, script.factory()).expect("pool");
    let target = |id| template(ProbeKind::Latency).target(id);

    pool.set_paused(true);
    let first = pool
        .submit(ProbeJob::new(target(1), CancelToken::new()))
        .expect("submit");
    let second = pool
        .submit(ProbeJob::new(target(2), CancelToken::new()))
        .expect("submit");
    assert_eq!(pool.pending(), 2);
    assert!(first.wait_timeout(Duration::from_millis(30)).is_none());

    let drained = pool.drain_pending();
    assert_eq!(drained.len(), 2);
    assert!(matches!(second.wait(), JobOutcome::Dropped));

    pool.set_paused(false);
    let third = pool
        .submit(ProbeJob::new(target(3), CancelToken::new()))
        .expect("submit");
    assert_eq!(third.id(), 3);
    match third.wait() {
        JobOutcome::Finished(result) => assert_eq!(result.id, 3),
        JobOutcome::Dropped => panic!("job was dropped"),
    }
    assert_eq!(pool.peak_active(), 1);

    pool.shutdown();
    assert!(matches!(
        pool.submit(ProbeJob::new(target(4), CancelToken::new())),
        Err(PoolError::ShutDown)
    ));
    pool.join();
    assert_eq!(pool.active(), 0);
}

#[test]
fn pool_rejects_zero_capacity() {
    let script = Script::new(Duration::ZERO);
    assert!(matches!(
        WorkerPool::new(0, script.factory()),
        Err(PoolError::InvalidCapacity)
    ));
    let pool = WorkerPool::new(2, script.factory()).expect("pool");
    assert!(matches!(pool.set_capacity(0), Err(PoolError::InvalidCapacity)));
    pool.set_capacity(5).expect("grow");
    assert_eq!(pool.capacity(), 5);
}
