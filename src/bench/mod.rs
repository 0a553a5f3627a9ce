//! Throughput benchmark core.
//!
//! - Configuration reconciliation into one immutable runtime plan
//! - Concurrency-bounded dispatcher with streaming and interrupt support
//! - Iteration log for backend scheduler statistics
//! - HdrHistogram-based statistics and report generation
//! - Mock OpenAI-compatible server for standalone runs

pub mod config;
pub mod iteration;
pub mod metrics;
pub mod mock_server;
pub mod record;
pub mod report;
pub mod resources;
pub mod runner;
pub mod session;

pub use config::{reconcile, BackendKind, ReconcileInput, RuntimeConfig, SchedulerPolicy, UserOverrides};
pub use iteration::{IterationCapture, IterationWriter};
pub use metrics::{PercentileStats, RecordStatistics};
pub use mock_server::MockInferenceServer;
pub use record::{BenchmarkRunResult, RequestOutcome, RequestRecord};
pub use report::{BenchmarkReport, REPORT_SCHEMA_VERSION};
pub use resources::{HostSummary, ResourceSampler};
pub use runner::{ConcurrencyGate, DispatchOptions, Dispatcher, DEFAULT_DRAIN_TIMEOUT};
pub use session::{SessionOptions, SessionOutcome, ThroughputBenchmark};
