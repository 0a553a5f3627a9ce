use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::SimulationConfig;
use crate::bench::config::{BackendKind, ReconcileInput, UserOverrides};
use crate::bench::session::{SessionOptions, ThroughputBenchmark};
use crate::dataset::{load_dataset, DatasetOptions, Modality};
use crate::engine::EngineCapabilities;
use crate::error::{BenchError, Result};

/// LLM Throughput Benchmark
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Benchmark an OpenAI-compatible inference server
    Run(RunArgs),
    /// Benchmark the in-process simulated engine
    Simulate(SimulateArgs),
    /// Start a mock server on the simulated engine and benchmark it over HTTP
    Standalone(StandaloneArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Base URL of the inference server
    #[arg(long, env = "BENCH_BASE_URL", default_value = "http://localhost:8000")]
    pub base_url: String,

    /// Model name sent with every request
    #[arg(long, env = "BENCH_MODEL", default_value = "default")]
    pub model: String,

    #[command(flatten)]
    pub bench: BenchArgs,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub engine: SimulationArgs,

    #[command(flatten)]
    pub bench: BenchArgs,
}

#[derive(Args, Debug)]
pub struct StandaloneArgs {
    /// Mock server port (0 for random)
    #[arg(long, default_value = "0")]
    pub port: u16,

    #[command(flatten)]
    pub engine: SimulationArgs,

    #[command(flatten)]
    pub bench: BenchArgs,
}

/// Flags shared by every benchmark mode
#[derive(Args, Debug, Clone)]
pub struct BenchArgs {
    /// JSON-lines dataset; reads stdin when omitted
    #[arg(long, env = "BENCH_DATASET")]
    pub dataset: Option<String>,

    /// Backend family the runtime is configured for
    #[arg(long, value_enum, default_value_t = BackendKind::PyTorch)]
    pub backend: BackendKind,

    /// Directory of a compiled engine (contains config.json)
    #[arg(long)]
    pub engine_dir: Option<String>,

    /// YAML/TOML/JSON file with additional runtime options
    #[arg(long)]
    pub extra_options: Option<String>,

    #[arg(long)]
    pub max_batch_size: Option<u32>,

    #[arg(long)]
    pub max_num_tokens: Option<u32>,

    #[arg(long)]
    pub max_seq_len: Option<u32>,

    #[arg(long)]
    pub beam_width: Option<u32>,

    /// Fraction of free GPU memory reserved for the KV cache (default 0.90)
    #[arg(long)]
    pub kv_cache_free_gpu_mem_fraction: Option<f64>,

    /// Treat the dataset as multimodal
    #[arg(long, value_enum)]
    pub modality: Option<Modality>,

    /// Estimated input length of a multimodal request
    #[arg(long, default_value = "4096")]
    pub max_input_seq_len_for_multimodal: u32,

    /// Number of requests to read from the dataset (0 = all)
    #[arg(long, default_value = "0")]
    pub num_requests: usize,

    /// Warmup requests before measuring (default 2)
    #[arg(long)]
    pub warmup: Option<usize>,

    #[arg(long)]
    pub target_input_len: Option<u32>,

    #[arg(long)]
    pub target_output_len: Option<u32>,

    /// Maximum in-flight requests; zero or negative is unbounded (default -1)
    #[arg(long, allow_hyphen_values = true)]
    pub concurrency: Option<i64>,

    /// Stream responses and measure time to first token
    #[arg(long)]
    pub streaming: bool,

    /// Write the JSON report here
    #[arg(long, env = "BENCH_REPORT_JSON")]
    pub report_json: Option<String>,

    /// Write per-iteration backend statistics here (JSON lines)
    #[arg(long)]
    pub iteration_log: Option<String>,

    /// Seconds in-flight requests may finish after an interrupt
    #[arg(long, default_value = "10")]
    pub drain_timeout_secs: u64,
}

/// Tunables of the simulated engine
#[derive(Args, Debug, Clone)]
pub struct SimulationArgs {
    /// Prefill cost per prompt token in microseconds
    #[arg(long, default_value = "10")]
    pub sim_prefill_us: u64,

    /// Time between output tokens in milliseconds
    #[arg(long, default_value = "5")]
    pub sim_decode_ms: u64,

    /// Scheduler iteration period in milliseconds
    #[arg(long, default_value = "10")]
    pub sim_iteration_ms: u64,

    /// Probability (0.0 to 1.0) that a request is rejected
    #[arg(long, default_value = "0.0")]
    pub sim_error_rate: f64,

    /// Request ids that are always rejected
    #[arg(long, value_delimiter = ',')]
    pub sim_fail_ids: Vec<u64>,

    /// Vision tokens per image or video frame
    #[arg(long, default_value = "576")]
    pub sim_vision_tokens: u32,
}

impl SimulationArgs {
    pub fn to_config(&self) -> SimulationConfig {
        SimulationConfig {
            prefill_per_token: Duration::from_micros(self.sim_prefill_us),
            decode_interval: Duration::from_millis(self.sim_decode_ms),
            iteration_interval: Duration::from_millis(self.sim_iteration_ms.max(1)),
            error_rate: self.sim_error_rate.clamp(0.0, 1.0),
            fail_request_ids: self.sim_fail_ids.iter().copied().collect(),
            vision_tokens_per_item: self.sim_vision_tokens,
        }
    }
}

/// Typed contents of the `--extra-options` file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtraOptions {
    pub max_batch_size: Option<u32>,
    pub max_num_tokens: Option<u32>,
    pub max_seq_len: Option<u32>,
    pub kv_cache_free_gpu_mem_fraction: Option<f64>,
    pub beam_width: Option<u32>,
    pub concurrency: Option<i64>,
    pub streaming: Option<bool>,
    pub target_input_len: Option<u32>,
    pub target_output_len: Option<u32>,
    pub warmup: Option<usize>,
}

impl From<ExtraOptions> for UserOverrides {
    fn from(options: ExtraOptions) -> Self {
        UserOverrides {
            max_batch_size: options.max_batch_size,
            max_num_tokens: options.max_num_tokens,
            max_seq_len: options.max_seq_len,
            kv_cache_fraction: options.kv_cache_free_gpu_mem_fraction,
            beam_width: options.beam_width,
            concurrency: options.concurrency,
            streaming: options.streaming,
            target_input_len: options.target_input_len,
            target_output_len: options.target_output_len,
            warmup: options.warmup,
        }
    }
}

/// Load the extra options file; the format follows the file extension
pub fn load_extra_options(path: &Path) -> Result<ExtraOptions> {
    let settings = ::config::Config::builder()
        .add_source(::config::File::from(path))
        .build()
        .map_err(|e| BenchError::config(format!("Failed to read extra options {}: {}", path.display(), e)))?;

    settings
        .try_deserialize::<ExtraOptions>()
        .map_err(|e| BenchError::config(format!("Invalid extra options {}: {}", path.display(), e)))
}

impl BenchArgs {
    /// Overrides given on the command line
    pub fn overrides(&self) -> UserOverrides {
        UserOverrides {
            max_batch_size: self.max_batch_size,
            max_num_tokens: self.max_num_tokens,
            max_seq_len: self.max_seq_len,
            kv_cache_fraction: self.kv_cache_free_gpu_mem_fraction,
            beam_width: self.beam_width,
            concurrency: self.concurrency,
            streaming: self.streaming.then_some(true),
            target_input_len: self.target_input_len,
            target_output_len: self.target_output_len,
            warmup: self.warmup,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            report_json: self.report_json.as_deref().map(expand_tilde),
            iteration_log: self.iteration_log.as_deref().map(expand_tilde),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
        }
    }

    fn dataset_options(&self) -> DatasetOptions {
        DatasetOptions {
            num_requests: self.num_requests,
            modality: self.modality,
            max_input_seq_len_for_multimodal: self.max_input_seq_len_for_multimodal,
        }
    }

    /// Load the dataset, engine limits and extra options, then reconcile
    pub fn prepare(&self) -> Result<ThroughputBenchmark> {
        let options = self.dataset_options();
        let dataset_path = self.dataset.as_deref().map(expand_tilde);

        let (mut metadata, requests) = match &dataset_path {
            Some(path) => {
                let file = File::open(path).map_err(|e| {
                    BenchError::Dataset(format!("Failed to open {}: {}", path.display(), e))
                })?;
                load_dataset(BufReader::new(file), &options)?
            }
            None => {
                tracing::info!("Reading dataset from stdin");
                load_dataset(std::io::stdin().lock(), &options)?
            }
        };
        metadata.dataset_path = dataset_path;

        let engine = self
            .engine_dir
            .as_deref()
            .map(|dir| EngineCapabilities::from_engine_dir(&expand_tilde(dir)))
            .transpose()?;

        let extra_options_path = self.extra_options.as_deref().map(expand_tilde);
        let file_overrides = match &extra_options_path {
            Some(path) => load_extra_options(path)?.into(),
            None => UserOverrides::default(),
        };
        let overrides = UserOverrides::layered(&self.overrides(), &file_overrides)?;

        let input = ReconcileInput {
            backend: self.backend,
            engine,
            dataset: &metadata,
            overrides: &overrides,
            extra_options_path,
        };
        ThroughputBenchmark::prepare(&input, requests, self.session_options())
    }
}

/// Expand tilde (~) in file paths to user's home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
