//! Benchmark runner with concurrency control.
//!
//! One logical loop owns every in-flight request: submissions happen in
//! workload order as soon as the [`ConcurrencyGate`] admits them, completions
//! are collected in whatever order they finish. Nothing is spawned, so the
//! backend handle is borrowed rather than shared.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::config::RuntimeConfig;
use super::record::{BenchmarkRunResult, RequestOutcome, RequestRecord};
use crate::backend::{InferenceBackend, IterationSink};
use crate::dataset::Request;

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Counting admission gate for in-flight requests
pub struct ConcurrencyGate {
    /// `None` when unbounded
    slots: Option<Arc<Semaphore>>,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

/// Holds one gate slot; released on drop
#[derive(Debug)]
pub struct GatePermit {
    _slot: Option<OwnedSemaphorePermit>,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyGate {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            slots: limit.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> GatePermit {
        let slot = match &self.slots {
            // The semaphore is never closed
            Some(slots) => slots.clone().acquire_owned().await.ok(),
            None => None,
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        GatePermit {
            _slot: slot,
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest in-flight count observed
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// How a run dispatches its requests
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub streaming: bool,
    pub concurrency_limit: Option<usize>,
    /// Grace period for in-flight requests after an interrupt
    pub drain_timeout: Duration,
}

impl DispatchOptions {
    pub fn from_runtime(config: &RuntimeConfig, drain_timeout: Duration) -> Self {
        Self {
            streaming: config.streaming,
            concurrency_limit: config.concurrency_limit,
            drain_timeout,
        }
    }
}

/// Drives a workload against a backend
pub struct Dispatcher<'a> {
    backend: &'a dyn InferenceBackend,
    options: DispatchOptions,
    cancel: CancellationToken,
}

impl<'a> Dispatcher<'a> {
    pub fn new(backend: &'a dyn InferenceBackend, options: DispatchOptions, cancel: CancellationToken) -> Self {
        Self {
            backend,
            options,
            cancel,
        }
    }

    /// Execute `requests`, forwarding iteration statistics to `sink` while running.
    ///
    /// Returns one record per submitted request. After an interrupt, requests
    /// never submitted have no record.
    pub async fn run(&self, requests: &[Request], sink: Option<IterationSink>) -> BenchmarkRunResult {
        let attached = match sink {
            Some(sink) => {
                self.backend.attach_iteration_stats(sink).await;
                true
            }
            None => false,
        };
        let gate = ConcurrencyGate::new(self.options.concurrency_limit);

        let started_at = Utc::now();
        let run_start = Instant::now();
        let progress_step = (requests.len() / 10).max(1);

        let mut records = Vec::with_capacity(requests.len());
        // Submission index -> (request id, submitted at, known input length)
        let mut outstanding: HashMap<usize, (u64, Duration, u32)> = HashMap::new();
        let mut in_flight: FuturesUnordered<BoxFuture<'_, (usize, RequestRecord)>> = FuturesUnordered::new();
        let mut pending = requests.iter().enumerate();
        let mut next = pending.next();
        let mut interrupted = false;

        tracing::info!(
            requests = requests.len(),
            concurrency = ?self.options.concurrency_limit,
            streaming = self.options.streaming,
            backend = self.backend.name(),
            "Starting dispatch"
        );

        loop {
            if next.is_none() && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    interrupted = true;
                    break;
                }

                Some((index, record)) = in_flight.next(), if !in_flight.is_empty() => {
                    outstanding.remove(&index);
                    records.push(record);
                    if records.len() % progress_step == 0 {
                        tracing::info!(done = records.len(), total = requests.len(), "Progress");
                    }
                }

                permit = gate.acquire(), if next.is_some() => {
                    if let Some((index, request)) = next.take() {
                        outstanding.insert(index, (request.id, run_start.elapsed(), request.input_len()));
                        let backend = self.backend;
                        let streaming = self.options.streaming;
                        in_flight.push(
                            async move {
                                let record = execute(backend, request, streaming, run_start, permit).await;
                                (index, record)
                            }
                            .boxed(),
                        );
                    }
                    next = pending.next();
                }
            }
        }

        if interrupted {
            tracing::warn!(
                in_flight = in_flight.len(),
                not_submitted = requests.len() - records.len() - in_flight.len(),
                drain_timeout_secs = self.options.drain_timeout.as_secs_f64(),
                "Interrupted, draining in-flight requests"
            );

            let drain = async {
                while let Some((index, record)) = in_flight.next().await {
                    outstanding.remove(&index);
                    records.push(record);
                }
            };
            if tokio::time::timeout(self.options.drain_timeout, drain).await.is_err() {
                tracing::warn!(abandoned = outstanding.len(), "Drain timed out, abandoning requests");
            }
            drop(in_flight);

            let abandoned_at = run_start.elapsed();
            let mut abandoned: Vec<_> = outstanding.into_iter().collect();
            abandoned.sort_by_key(|(index, _)| *index);
            records.extend(
                abandoned
                    .into_iter()
                    .map(|(_, (id, submitted, input))| RequestRecord::abandoned(id, submitted, abandoned_at, input)),
            );
        }

        let duration = run_start.elapsed();
        let ended_at = Utc::now();
        if attached {
            self.backend.detach_iteration_stats().await;
        }

        let result = BenchmarkRunResult {
            run_id: Uuid::new_v4(),
            records,
            workload_size: requests.len(),
            started_at,
            ended_at,
            duration,
            interrupted,
            peak_in_flight: gate.peak(),
            host: None,
        };

        tracing::info!(
            completed = result.completed(),
            failed = result.failed(),
            duration_secs = duration.as_secs_f64(),
            peak_in_flight = result.peak_in_flight,
            "Dispatch finished"
        );

        result
    }
}

/// Run one request to its terminal state. The gate slot is held until the
/// response has been fully consumed.
async fn execute(
    backend: &dyn InferenceBackend,
    request: &Request,
    streaming: bool,
    run_start: Instant,
    permit: GatePermit,
) -> RequestRecord {
    let submitted_at = run_start.elapsed();
    let known_input = request.input_len();

    let fail = |reason: String| {
        tracing::debug!(request_id = request.id, "Request failed: {}", reason);
        RequestRecord::failed(request.id, submitted_at, run_start.elapsed(), known_input, reason)
    };

    let mut stream = match backend.submit(request, streaming).await {
        Ok(stream) => stream,
        Err(e) => return fail(e.to_string()),
    };

    let mut first_token_at = None;
    let mut output_tokens = 0u32;
    let mut prompt_tokens = None;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return fail(e.to_string()),
        };
        if streaming && first_token_at.is_none() && chunk.new_tokens > 0 {
            first_token_at = Some(run_start.elapsed());
        }
        output_tokens += chunk.new_tokens;
        if chunk.prompt_tokens.is_some() {
            prompt_tokens = chunk.prompt_tokens;
        }
    }

    let completed_at = run_start.elapsed();
    drop(permit);

    RequestRecord {
        request_id: request.id,
        submitted_at,
        first_token_at,
        completed_at,
        input_tokens: prompt_tokens.unwrap_or(known_input),
        reported_input_tokens: prompt_tokens,
        output_tokens,
        outcome: RequestOutcome::Completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SimulatedBackend, SimulationConfig};
    use crate::bench::config::tests::runtime_config;
    use std::collections::HashSet;
    use tokio::sync::mpsc;
    use tokio_test::{assert_pending, assert_ready};

    fn engine(max_batch_size: u32, config: SimulationConfig) -> SimulatedBackend {
        let mut runtime = runtime_config();
        runtime.max_batch_size = max_batch_size;
        SimulatedBackend::new(&runtime, config)
    }

    fn workload(count: u64, output_tokens: u32) -> Vec<Request> {
        (0..count).map(|id| Request::new(id, vec![1; 16], output_tokens)).collect()
    }

    fn options(streaming: bool, limit: Option<usize>) -> DispatchOptions {
        DispatchOptions {
            streaming,
            concurrency_limit: limit,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    #[tokio::test]
    async fn test_gate_blocks_at_limit() {
        let gate = ConcurrencyGate::new(Some(2));
        let first = gate.acquire().await;
        let _second = gate.acquire().await;
        assert_eq!(gate.in_flight(), 2);

        let mut third = tokio_test::task::spawn(gate.acquire());
        assert_pending!(third.poll());

        drop(first);
        assert!(third.is_woken());
        let _third = assert_ready!(third.poll());
        assert_eq!(gate.peak(), 2);
    }

    #[tokio::test]
    async fn test_unbounded_gate_never_blocks() {
        let gate = ConcurrencyGate::new(None);
        let permits: Vec<_> = futures::future::join_all((0..100).map(|_| gate.acquire())).await;
        assert_eq!(gate.in_flight(), 100);
        drop(permits);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.peak(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_is_respected() {
        let backend = engine(8, SimulationConfig::default());
        let requests = workload(10, 4);
        let dispatcher = Dispatcher::new(&backend, options(false, Some(2)), CancellationToken::new());

        let result = dispatcher.run(&requests, None).await;

        assert_eq!(result.records.len(), 10);
        assert_eq!(result.completed(), 10);
        assert_eq!(result.peak_in_flight, 2);
        assert!(backend.peak_active() <= 2);
        assert!(!result.is_truncated());
        assert!(result.records.iter().all(|r| r.first_token_at.is_none()));
        assert!(result.records.iter().all(|r| r.output_tokens == 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_dispatch() {
        let backend = engine(16, SimulationConfig::default());
        let requests = workload(6, 2);
        let dispatcher = Dispatcher::new(&backend, options(false, None), CancellationToken::new());

        let result = dispatcher.run(&requests, None).await;
        assert_eq!(result.completed(), 6);
        assert_eq!(result.peak_in_flight, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_records_first_token() {
        let backend = engine(4, SimulationConfig::default());
        let requests = workload(4, 8);
        let dispatcher = Dispatcher::new(&backend, options(true, Some(4)), CancellationToken::new());

        let result = dispatcher.run(&requests, None).await;

        for record in &result.records {
            let ttft = record.time_to_first_token().unwrap();
            assert!(ttft < record.end_to_end());
            assert_eq!(record.output_tokens, 8);
            assert_eq!(record.input_tokens, 16);
            assert!(record.inter_token_latency().is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_failure_does_not_abort_run() {
        let config = SimulationConfig {
            fail_request_ids: HashSet::from([3]),
            ..Default::default()
        };
        let backend = engine(4, config);
        let requests = workload(10, 2);
        let dispatcher = Dispatcher::new(&backend, options(true, Some(3)), CancellationToken::new());

        let result = dispatcher.run(&requests, None).await;

        assert_eq!(result.records.len(), 10);
        assert_eq!(result.completed(), 9);
        assert_eq!(result.failed(), 1);
        let failed = result.records.iter().find(|r| !r.is_success()).unwrap();
        assert_eq!(failed.request_id, 3);
        assert!(matches!(failed.outcome, RequestOutcome::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_abandons_after_drain_timeout() {
        let backend = engine(8, SimulationConfig::default());
        let requests = workload(20, 100);
        let cancel = CancellationToken::new();
        let opts = DispatchOptions {
            drain_timeout: Duration::from_millis(10),
            ..options(false, Some(4))
        };
        let dispatcher = Dispatcher::new(&backend, opts, cancel.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        let result = dispatcher.run(&requests, None).await;
        trigger.await.unwrap();

        assert!(result.interrupted);
        assert!(result.is_truncated());
        assert_eq!(result.records.len(), 4);
        assert_eq!(result.completed(), 0);
        assert!(result
            .records
            .iter()
            .all(|r| r.outcome == RequestOutcome::Abandoned));
        assert!(result.completed() + result.failed() <= requests.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_drains_in_flight_requests() {
        let backend = engine(8, SimulationConfig::default());
        let requests = workload(20, 100);
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(&backend, options(false, Some(4)), cancel.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        let result = dispatcher.run(&requests, None).await;
        trigger.await.unwrap();

        assert!(result.interrupted);
        assert_eq!(result.records.len(), 4);
        assert_eq!(result.completed(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_submits_nothing() {
        let backend = engine(8, SimulationConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let dispatcher = Dispatcher::new(&backend, options(false, None), cancel);

        let result = dispatcher.run(&workload(5, 1), None).await;
        assert!(result.records.is_empty());
        assert!(result.interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_iteration_sink_detached_after_run() {
        let backend = engine(4, SimulationConfig::default());
        let requests = workload(4, 10);
        let dispatcher = Dispatcher::new(&backend, options(true, None), CancellationToken::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatcher.run(&requests, Some(tx)).await;

        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert!(received > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_request_ids_each_get_a_record() {
        let backend = engine(4, SimulationConfig::default());
        let requests = vec![Request::new(1, vec![1], 2), Request::new(1, vec![1], 2)];
        let dispatcher = Dispatcher::new(&backend, options(false, Some(1)), CancellationToken::new());

        let result = dispatcher.run(&requests, None).await;
        assert_eq!(result.records.len(), 2);
    }
}
