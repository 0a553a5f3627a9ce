//! In-process simulated inference engine.
//!
//! Models the parts of a real engine the benchmark observes: a fixed number of
//! batch slots (an admitted request keeps its slot until it finishes, no
//! eviction), a prefill cost proportional to the prompt, a fixed decode step
//! per output token and a scheduler that reports one statistics record per
//! iteration while a sink is attached.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{BackendError, GenerationChunk, InferenceBackend, IterationSink, IterationStats, ResponseStream};
use crate::bench::config::RuntimeConfig;
use crate::dataset::{Modality, Request};
use crate::tokenizer;

/// Frames sampled from one video item
const VIDEO_FRAMES: u32 = 8;

/// Tunables of the simulated engine
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Prefill cost per prompt token
    pub prefill_per_token: Duration,
    /// Time between two output tokens of one request
    pub decode_interval: Duration,
    /// Scheduler iteration period for statistics reporting
    pub iteration_interval: Duration,
    /// Probability (0.0 to 1.0) that a submission is rejected
    pub error_rate: f64,
    /// Requests that are always rejected
    pub fail_request_ids: HashSet<u64>,
    /// Vision tokens per image (and per video frame)
    pub vision_tokens_per_item: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            prefill_per_token: Duration::from_micros(10),
            decode_interval: Duration::from_millis(5),
            iteration_interval: Duration::from_millis(10),
            error_rate: 0.0,
            fail_request_ids: HashSet::new(),
            vision_tokens_per_item: 576,
        }
    }
}

#[derive(Default)]
struct EngineCounters {
    queued: AtomicU64,
    active: AtomicU64,
    peak_active: AtomicU64,
    completed: AtomicU64,
    generated_tokens: AtomicU64,
    shutdown: AtomicBool,
    shutdown_calls: AtomicUsize,
}

/// Counts a request as queued until dropped
struct QueuedGuard(Arc<EngineCounters>);

impl QueuedGuard {
    fn enter(counters: &Arc<EngineCounters>) -> Self {
        counters.queued.fetch_add(1, Ordering::SeqCst);
        Self(counters.clone())
    }
}

impl Drop for QueuedGuard {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Counts a request as holding a batch slot until dropped
struct ActiveGuard(Arc<EngineCounters>);

impl ActiveGuard {
    fn enter(counters: &Arc<EngineCounters>) -> Self {
        let active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_active.fetch_max(active, Ordering::SeqCst);
        Self(counters.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Simulated engine sized from a [`RuntimeConfig`]
pub struct SimulatedBackend {
    config: SimulationConfig,
    slots: Arc<Semaphore>,
    beam_width: u32,
    counters: Arc<EngineCounters>,
    stats_task: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedBackend {
    /// Create a simulated engine with `runtime.max_batch_size` slots
    pub fn new(runtime: &RuntimeConfig, config: SimulationConfig) -> Self {
        tracing::info!(
            max_batch_size = runtime.max_batch_size,
            beam_width = runtime.beam_width,
            decode_interval_ms = config.decode_interval.as_secs_f64() * 1000.0,
            "Starting simulated engine"
        );

        Self {
            config,
            slots: Arc::new(Semaphore::new(runtime.max_batch_size.max(1) as usize)),
            beam_width: runtime.beam_width.max(1),
            counters: Arc::new(EngineCounters::default()),
            stats_task: Mutex::new(None),
        }
    }

    /// Number of times `shutdown` was called
    pub fn shutdown_count(&self) -> usize {
        self.counters.shutdown_calls.load(Ordering::SeqCst)
    }

    /// Highest number of requests that held a batch slot at once
    pub fn peak_active(&self) -> u64 {
        self.counters.peak_active.load(Ordering::SeqCst)
    }

    /// Requests that ran to completion
    pub fn completed_count(&self) -> u64 {
        self.counters.completed.load(Ordering::SeqCst)
    }

    /// Spawn the scheduler statistics task, replacing any running one
    pub(crate) fn start_stats(&self, sink: IterationSink) {
        self.stop_stats();

        let counters = self.counters.clone();
        let period = self.config.iteration_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut iter = 0u64;
            let mut last_tick = Instant::now();
            let mut last_generated = counters.generated_tokens.load(Ordering::SeqCst);
            let mut last_completed = counters.completed.load(Ordering::SeqCst);

            loop {
                ticker.tick().await;

                let active = counters.active.load(Ordering::SeqCst);
                let queued = counters.queued.load(Ordering::SeqCst);
                let generated = counters.generated_tokens.load(Ordering::SeqCst);
                let completed = counters.completed.load(Ordering::SeqCst);
                // An idle tick is not an iteration, but it closes the window
                if active == 0 && queued == 0 {
                    last_tick = Instant::now();
                    last_generated = generated;
                    last_completed = completed;
                    continue;
                }

                let stats = IterationStats {
                    iter,
                    timestamp: Some(chrono::Utc::now().to_rfc3339()),
                    iter_latency_ms: last_tick.elapsed().as_secs_f64() * 1000.0,
                    num_active_requests: active,
                    num_queued_requests: queued,
                    num_completed_requests: completed.saturating_sub(last_completed),
                    num_generated_tokens: generated.saturating_sub(last_generated),
                    extra: serde_json::Map::new(),
                };

                if sink.send(stats).is_err() {
                    break;
                }

                iter += 1;
                last_tick = Instant::now();
                last_generated = generated;
                last_completed = completed;
            }
        });

        if let Ok(mut task) = self.stats_task.lock() {
            *task = Some(handle);
        }
    }

    pub(crate) fn stop_stats(&self) {
        if let Ok(mut task) = self.stats_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }

    fn should_fail(&self, request_id: u64) -> bool {
        if self.config.fail_request_ids.contains(&request_id) {
            return true;
        }
        self.config.error_rate > 0.0 && rand::thread_rng().gen::<f64>() < self.config.error_rate
    }

    /// Prompt tokens the engine will actually consume
    fn prompt_tokens(&self, request: &Request) -> Result<u32, BackendError> {
        let Some(payload) = &request.multimodal else {
            return Ok(request.input_len());
        };

        let text_tokens = tokenizer::count_tokens(&payload.prompt)
            .map_err(|e| BackendError::Rejected(e.to_string()))? as u32;
        let per_item = match payload.modality {
            Modality::Image => self.config.vision_tokens_per_item,
            Modality::Video => self.config.vision_tokens_per_item * VIDEO_FRAMES,
        };
        Ok(text_tokens + per_item * payload.media_paths.len().max(1) as u32)
    }
}

#[async_trait]
impl InferenceBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn submit(&self, request: &Request, streaming: bool) -> Result<ResponseStream, BackendError> {
        if self.counters.shutdown.load(Ordering::SeqCst) {
            return Err(BackendError::Shutdown);
        }
        if self.should_fail(request.id) {
            return Err(BackendError::Rejected(format!(
                "simulated failure for request {}",
                request.id
            )));
        }

        let prompt_tokens = self.prompt_tokens(request)?;
        let output_tokens = request.output_tokens;
        let prefill = self.config.prefill_per_token * prompt_tokens;
        let decode = self.config.decode_interval * self.beam_width;
        let slots = self.slots.clone();
        let counters = self.counters.clone();

        let stream = async_stream::try_stream! {
            let queued = QueuedGuard::enter(&counters);
            let _slot = slots.acquire_owned().await.map_err(|_| BackendError::Shutdown)?;
            drop(queued);
            let _active = ActiveGuard::enter(&counters);

            tokio::time::sleep(prefill).await;

            let mut pending = 0u32;
            for i in 0..output_tokens {
                if i > 0 {
                    tokio::time::sleep(decode).await;
                }
                counters.generated_tokens.fetch_add(1, Ordering::SeqCst);

                if streaming {
                    yield GenerationChunk {
                        new_tokens: 1,
                        prompt_tokens: (i == 0).then_some(prompt_tokens),
                        finished: i + 1 == output_tokens,
                    };
                } else {
                    pending += 1;
                }
            }

            if !streaming {
                yield GenerationChunk {
                    new_tokens: pending,
                    prompt_tokens: Some(prompt_tokens),
                    finished: true,
                };
            }

            counters.completed.fetch_add(1, Ordering::SeqCst);
        };

        Ok(Box::pin(stream))
    }

    async fn attach_iteration_stats(&self, sink: IterationSink) {
        self.start_stats(sink);
    }

    async fn detach_iteration_stats(&self) {
        self.stop_stats();
    }

    async fn shutdown(&self) {
        self.counters.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        if self.counters.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_stats();
        self.slots.close();
        tracing::info!(
            completed = self.completed_count(),
            "Simulated engine shut down"
        );
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        self.stop_stats();
    }
}
