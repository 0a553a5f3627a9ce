// Engine capability descriptor
// Limits reported by a compiled engine artifact, or synthesized for
// backends that build their runtime on the fly

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{BenchError, Result};

/// Token budget a dynamic backend is sized against before the KV-cache fraction is applied
const KV_TOKEN_POOL: f64 = 1_048_576.0;

/// Minimum per-iteration token budget for dynamic backends
const MIN_MAX_NUM_TOKENS: u32 = 8192;

/// Upper bound on the synthesized batch size
const MAX_HEURISTIC_BATCH_SIZE: u32 = 2048;

/// Capability limits of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCapabilities {
    pub max_batch_size: u32,
    pub max_num_tokens: u32,
    /// Absent for dynamic backends
    pub max_seq_len: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct EngineConfigFile {
    build_config: BuildConfig,
}

#[derive(Debug, Deserialize)]
struct BuildConfig {
    max_batch_size: u32,
    max_num_tokens: u32,
    max_seq_len: u32,
}

impl EngineCapabilities {
    /// Read the limits a compiled engine was built with (`<dir>/config.json`)
    pub fn from_engine_dir(dir: &Path) -> Result<Self> {
        let path = dir.join("config.json");
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            BenchError::config(format!("Failed to read engine config {}: {}", path.display(), e))
        })?;

        let config: EngineConfigFile = serde_json::from_str(&contents).map_err(|e| {
            BenchError::config(format!("Invalid engine config {}: {}", path.display(), e))
        })?;

        let build = config.build_config;
        tracing::debug!(
            max_batch_size = build.max_batch_size,
            max_num_tokens = build.max_num_tokens,
            max_seq_len = build.max_seq_len,
            "Loaded engine build configuration"
        );

        Ok(Self {
            max_batch_size: build.max_batch_size,
            max_num_tokens: build.max_num_tokens,
            max_seq_len: Some(build.max_seq_len),
        })
    }

    /// Synthesize limits for a dynamic backend from the target request shape
    pub fn from_heuristics(target_isl: u32, target_osl: u32, kv_cache_fraction: f64) -> Self {
        let seq_len = (target_isl.max(1) as f64) + (target_osl.max(1) as f64);
        let batch = (KV_TOKEN_POOL * kv_cache_fraction / seq_len).floor() as u32;

        Self {
            max_batch_size: batch.clamp(1, MAX_HEURISTIC_BATCH_SIZE),
            max_num_tokens: MIN_MAX_NUM_TOKENS.max(target_isl.max(1).next_power_of_two()),
            max_seq_len: None,
        }
    }
}
