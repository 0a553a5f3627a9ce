//! Configuration reconciliation for benchmark runs.
//!
//! Engine limits, dataset statistics and user overrides are merged into one
//! [`RuntimeConfig`] before any backend exists. Everything downstream reads
//! the reconciled struct and never re-derives a setting.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::PathBuf;

use crate::dataset::{DatasetMetadata, Modality};
use crate::engine::EngineCapabilities;
use crate::error::{BenchError, Result};

pub const DEFAULT_KV_CACHE_FRACTION: f64 = 0.90;
pub const DEFAULT_BEAM_WIDTH: u32 = 1;
pub const DEFAULT_WARMUP: usize = 2;
/// Non-positive concurrency means unbounded
pub const DEFAULT_CONCURRENCY: i64 = -1;

/// Backend family selected by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Pre-compiled engine artifact with fixed limits
    Engine,
    /// Runtime-built backend sized from heuristics
    #[value(name = "pytorch")]
    PyTorch,
    #[value(name = "autodeploy")]
    AutoDeploy,
}

impl BackendKind {
    /// Whether the backend builds its runtime on the fly
    pub fn is_dynamic(&self) -> bool {
        !matches!(self, BackendKind::Engine)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Engine => write!(f, "engine"),
            BackendKind::PyTorch => write!(f, "pytorch"),
            BackendKind::AutoDeploy => write!(f, "autodeploy"),
        }
    }
}

/// Scheduler admission policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPolicy {
    /// An admitted request keeps its resources until it finishes
    #[default]
    GuaranteedNoEvict,
}

/// Settings supplied by the user, from flags or the extra options file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserOverrides {
    pub max_batch_size: Option<u32>,
    pub max_num_tokens: Option<u32>,
    pub max_seq_len: Option<u32>,
    pub kv_cache_fraction: Option<f64>,
    pub beam_width: Option<u32>,
    pub concurrency: Option<i64>,
    pub streaming: Option<bool>,
    pub target_input_len: Option<u32>,
    pub target_output_len: Option<u32>,
    pub warmup: Option<usize>,
}

fn merge_field<T: PartialEq + Copy + Debug>(name: &str, cli: Option<T>, file: Option<T>) -> Result<Option<T>> {
    match (cli, file) {
        (Some(a), Some(b)) if a != b => Err(BenchError::config(format!(
            "{} is {:?} on the command line but {:?} in the extra options file",
            name, a, b
        ))),
        (a, b) => Ok(a.or(b)),
    }
}

impl UserOverrides {
    /// Merge command-line and file overrides.
    ///
    /// A field set in both places must agree.
    pub fn layered(cli: &UserOverrides, file: &UserOverrides) -> Result<UserOverrides> {
        Ok(UserOverrides {
            max_batch_size: merge_field("max_batch_size", cli.max_batch_size, file.max_batch_size)?,
            max_num_tokens: merge_field("max_num_tokens", cli.max_num_tokens, file.max_num_tokens)?,
            max_seq_len: merge_field("max_seq_len", cli.max_seq_len, file.max_seq_len)?,
            kv_cache_fraction: merge_field(
                "kv_cache_free_gpu_mem_fraction",
                cli.kv_cache_fraction,
                file.kv_cache_fraction,
            )?,
            beam_width: merge_field("beam_width", cli.beam_width, file.beam_width)?,
            concurrency: merge_field("concurrency", cli.concurrency, file.concurrency)?,
            streaming: merge_field("streaming", cli.streaming, file.streaming)?,
            target_input_len: merge_field("target_input_len", cli.target_input_len, file.target_input_len)?,
            target_output_len: merge_field("target_output_len", cli.target_output_len, file.target_output_len)?,
            warmup: merge_field("warmup", cli.warmup, file.warmup)?,
        })
    }
}

/// Authoritative settings for one benchmark run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub backend_kind: BackendKind,
    pub max_batch_size: u32,
    pub max_num_tokens: u32,
    pub max_seq_len: u32,
    pub beam_width: u32,
    pub kv_cache_fraction: f64,
    /// `None` means unbounded
    pub concurrency_limit: Option<usize>,
    pub streaming: bool,
    pub warmup_count: usize,
    pub scheduler_policy: SchedulerPolicy,
    /// The backend may retune batch composition at runtime
    pub dynamic_batch_size: bool,
    pub target_input_len: u32,
    pub target_output_len: u32,
    pub modality: Option<Modality>,
    pub extra_options_path: Option<PathBuf>,
}

impl RuntimeConfig {
    /// Map a user concurrency value to a limit; zero or negative is unbounded
    pub fn concurrency_limit_from(value: i64) -> Option<usize> {
        if value > 0 {
            Some(value as usize)
        } else {
            None
        }
    }
}

/// Everything the reconciler looks at
#[derive(Debug, Clone)]
pub struct ReconcileInput<'a> {
    pub backend: BackendKind,
    /// Limits read from an engine artifact, if one was given
    pub engine: Option<EngineCapabilities>,
    pub dataset: &'a DatasetMetadata,
    pub overrides: &'a UserOverrides,
    pub extra_options_path: Option<PathBuf>,
}

fn require_positive(name: &str, value: Option<u32>) -> Result<()> {
    match value {
        Some(0) => Err(BenchError::config(format!("{} must be at least 1", name))),
        _ => Ok(()),
    }
}

fn target_length(name: &str, explicit: Option<u32>, average: f64) -> Result<u32> {
    match explicit {
        Some(0) => Err(BenchError::config(format!("{} must be at least 1", name))),
        Some(value) => Ok(value),
        None => Ok((average.round() as u32).max(1)),
    }
}

/// Build the runtime configuration, rejecting infeasible combinations
pub fn reconcile(input: &ReconcileInput<'_>) -> Result<RuntimeConfig> {
    let overrides = input.overrides;
    let dataset = input.dataset;

    let kv_cache_fraction = overrides.kv_cache_fraction.unwrap_or(DEFAULT_KV_CACHE_FRACTION);
    if !(kv_cache_fraction > 0.0 && kv_cache_fraction <= 1.0) {
        return Err(BenchError::config(format!(
            "kv_cache_free_gpu_mem_fraction must be in (0, 1], got {}",
            kv_cache_fraction
        )));
    }

    require_positive("beam_width", overrides.beam_width)?;
    require_positive("max_batch_size", overrides.max_batch_size)?;
    require_positive("max_num_tokens", overrides.max_num_tokens)?;
    require_positive("max_seq_len", overrides.max_seq_len)?;

    let target_input_len = target_length("target_input_len", overrides.target_input_len, dataset.avg_isl)?;
    let target_output_len = target_length("target_output_len", overrides.target_output_len, dataset.avg_osl)?;

    let (capabilities, max_seq_len) = if input.backend.is_dynamic() {
        let capabilities = input.engine.unwrap_or_else(|| {
            EngineCapabilities::from_heuristics(target_input_len, target_output_len, kv_cache_fraction)
        });
        let max_seq_len = overrides
            .max_seq_len
            .or(capabilities.max_seq_len)
            .unwrap_or(dataset.max_sequence_length);
        (capabilities, max_seq_len)
    } else {
        let capabilities = input.engine.ok_or_else(|| {
            BenchError::config("The engine backend requires an engine directory (--engine-dir)")
        })?;
        if overrides.max_seq_len.is_some() {
            return Err(BenchError::config(
                "max_seq_len is fixed when the engine is built and cannot be set for the engine backend",
            ));
        }
        let max_seq_len = capabilities
            .max_seq_len
            .ok_or_else(|| BenchError::config("Engine build configuration has no max_seq_len"))?;

        for (name, requested, compiled) in [
            ("max_batch_size", overrides.max_batch_size, capabilities.max_batch_size),
            ("max_num_tokens", overrides.max_num_tokens, capabilities.max_num_tokens),
        ] {
            if let Some(requested) = requested.filter(|&r| r > compiled) {
                return Err(BenchError::config(format!(
                    "{} {} exceeds the engine's compiled limit of {}",
                    name, requested, compiled
                )));
            }
        }
        (capabilities, max_seq_len)
    };

    if dataset.max_sequence_length > max_seq_len {
        return Err(BenchError::config(format!(
            "Dataset max sequence length {} exceeds the backend maximum of {}",
            dataset.max_sequence_length, max_seq_len
        )));
    }

    let config = RuntimeConfig {
        backend_kind: input.backend,
        max_batch_size: overrides.max_batch_size.unwrap_or(capabilities.max_batch_size),
        max_num_tokens: overrides.max_num_tokens.unwrap_or(capabilities.max_num_tokens),
        max_seq_len,
        beam_width: overrides.beam_width.unwrap_or(DEFAULT_BEAM_WIDTH),
        kv_cache_fraction,
        concurrency_limit: RuntimeConfig::concurrency_limit_from(
            overrides.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
        ),
        streaming: overrides.streaming.unwrap_or(false),
        warmup_count: overrides.warmup.unwrap_or(DEFAULT_WARMUP),
        scheduler_policy: SchedulerPolicy::GuaranteedNoEvict,
        dynamic_batch_size: true,
        target_input_len,
        target_output_len,
        modality: dataset.modality,
        extra_options_path: input.extra_options_path.clone(),
    };

    tracing::info!(
        backend = %config.backend_kind,
        max_batch_size = config.max_batch_size,
        max_num_tokens = config.max_num_tokens,
        max_seq_len = config.max_seq_len,
        concurrency = ?config.concurrency_limit,
        streaming = config.streaming,
        "Reconciled runtime configuration"
    );

    Ok(config)
}
