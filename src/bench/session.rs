//! One complete benchmark session: reconcile, warm up, measure, report.
//!
//! The backend is created only after reconciliation succeeded, and is shut
//! down exactly once on every exit path, including panics and interrupts.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::config::{reconcile, ReconcileInput, RuntimeConfig};
use super::iteration::IterationWriter;
use super::report::BenchmarkReport;
use super::resources::ResourceSampler;
use super::runner::{DispatchOptions, Dispatcher, DEFAULT_DRAIN_TIMEOUT};
use crate::backend::InferenceBackend;
use crate::dataset::{generate_warmup_dataset, DatasetMetadata, Request};
use crate::error::Result;

/// Where results go and how long an interrupt may drain
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub report_json: Option<PathBuf>,
    pub iteration_log: Option<PathBuf>,
    pub drain_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            report_json: None,
            iteration_log: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// How a session ended
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    /// Report written (if requested) and printed
    Completed(BenchmarkReport),
    /// Operator interrupt; the truncated report was neither written nor printed
    Interrupted(BenchmarkReport),
}

impl SessionOutcome {
    pub fn report(&self) -> &BenchmarkReport {
        match self {
            SessionOutcome::Completed(report) | SessionOutcome::Interrupted(report) => report,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, SessionOutcome::Interrupted(_))
    }
}

/// A reconciled, ready-to-run benchmark
#[derive(Debug)]
pub struct ThroughputBenchmark {
    config: Arc<RuntimeConfig>,
    dataset: DatasetMetadata,
    requests: Vec<Request>,
    options: SessionOptions,
}

impl ThroughputBenchmark {
    /// Reconcile the configuration. Fails without touching any backend.
    pub fn prepare(input: &ReconcileInput<'_>, requests: Vec<Request>, options: SessionOptions) -> Result<Self> {
        let config = reconcile(input)?;
        Ok(Self {
            config: Arc::new(config),
            dataset: input.dataset.clone(),
            requests,
            options,
        })
    }

    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    /// Create the backend with `make_backend`, run the session and shut the backend down
    pub async fn run<B, F, Fut>(self, cancel: CancellationToken, make_backend: F) -> Result<SessionOutcome>
    where
        B: InferenceBackend,
        F: FnOnce(Arc<RuntimeConfig>) -> Fut,
        Fut: Future<Output = Result<B>>,
    {
        // Multimodal lengths are estimates until the run has finished
        if self.dataset.modality.is_none() {
            tracing::info!("{}", self.dataset.summary());
        }

        let backend = make_backend(self.config.clone()).await?;
        tracing::info!(backend = backend.name(), "Backend ready");

        let outcome = AssertUnwindSafe(self.execute(&backend, &cancel)).catch_unwind().await;
        backend.shutdown().await;

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn execute(&self, backend: &dyn InferenceBackend, cancel: &CancellationToken) -> Result<SessionOutcome> {
        if self.config.warmup_count > 0 {
            let warmup = generate_warmup_dataset(&self.requests, self.config.warmup_count);
            tracing::info!(requests = warmup.len(), "Running warmup");

            let options = DispatchOptions {
                streaming: false,
                ..DispatchOptions::from_runtime(&self.config, self.options.drain_timeout)
            };
            let discarded = Dispatcher::new(backend, options, cancel.clone()).run(&warmup, None).await;
            tracing::debug!(completed = discarded.completed(), "Warmup finished");
        }

        let capture = IterationWriter::new(self.options.iteration_log.clone()).capture()?;
        let sampler = ResourceSampler::start();

        let dispatcher = Dispatcher::new(
            backend,
            DispatchOptions::from_runtime(&self.config, self.options.drain_timeout),
            cancel.clone(),
        );
        let mut result = dispatcher.run(&self.requests, capture.sink()).await;

        result.host = sampler.stop().await;
        match capture.finish().await {
            Ok(0) => {}
            Ok(iterations) => tracing::info!(iterations, "Iteration log written"),
            Err(e) => tracing::warn!("Iteration log incomplete: {}", e),
        }

        let dataset = if self.config.modality.is_some() {
            self.dataset.corrected_from(&result.records)
        } else {
            self.dataset.clone()
        };
        let report = BenchmarkReport::build(&result, &dataset, &self.config)?;

        if result.interrupted {
            tracing::warn!(
                completed = report.completed_requests,
                failed = report.failed_requests,
                "Benchmark interrupted, skipping report output"
            );
            return Ok(SessionOutcome::Interrupted(report));
        }

        if self.config.modality.is_some() {
            tracing::info!("{}", dataset.summary());
        }

        if let Some(path) = &self.options.report_json {
            match report.write_json(path) {
                Ok(()) => tracing::info!(path = %path.display(), "Report written"),
                Err(e) => tracing::warn!("{}", e),
            }
        }
        report.print_table();

        Ok(SessionOutcome::Completed(report))
    }
}
