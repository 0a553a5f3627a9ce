//! Report generation for benchmark results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use uuid::Uuid;

use super::config::RuntimeConfig;
use super::metrics::{PercentileStats, RecordStatistics};
use super::record::BenchmarkRunResult;
use super::resources::HostSummary;
use crate::dataset::DatasetMetadata;
use crate::error::{BenchError, Result};

/// Bumped whenever a field is renamed or removed
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Complete benchmark report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: f64,
    /// Requests the run was asked to execute
    pub total_requests: usize,
    pub completed_requests: usize,
    /// Failed and abandoned requests
    pub failed_requests: usize,
    /// Interrupted, or fewer records than requests
    pub truncated: bool,
    pub request_throughput: f64,
    pub output_token_throughput: f64,
    pub input_token_throughput: f64,
    pub total_token_throughput: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub latency_percentiles: PercentileStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttft_percentiles: Option<PercentileStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub itl_percentiles: Option<PercentileStats>,
    pub peak_in_flight: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostSummary>,
    pub config_snapshot: RuntimeConfig,
    pub dataset_summary: DatasetMetadata,
}

fn per_second(value: f64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        value / seconds
    } else {
        0.0
    }
}

impl BenchmarkReport {
    /// Build the report from one measured run.
    ///
    /// Depends only on its arguments, so the same run always yields the same report.
    pub fn build(result: &BenchmarkRunResult, dataset: &DatasetMetadata, config: &RuntimeConfig) -> Result<Self> {
        let stats = RecordStatistics::from_records(&result.records)?;
        let seconds = result.duration.as_secs_f64();
        let completed = result.completed();

        Ok(Self {
            schema_version: REPORT_SCHEMA_VERSION,
            run_id: result.run_id,
            started_at: result.started_at,
            ended_at: result.ended_at,
            duration_seconds: seconds,
            total_requests: result.workload_size,
            completed_requests: completed,
            failed_requests: result.failed(),
            truncated: result.is_truncated(),
            request_throughput: per_second(completed as f64, seconds),
            output_token_throughput: per_second(stats.total_output_tokens as f64, seconds),
            input_token_throughput: per_second(stats.total_input_tokens as f64, seconds),
            total_token_throughput: per_second(
                (stats.total_input_tokens + stats.total_output_tokens) as f64,
                seconds,
            ),
            total_input_tokens: stats.total_input_tokens,
            total_output_tokens: stats.total_output_tokens,
            latency_percentiles: stats.latency.unwrap_or_default(),
            ttft_percentiles: if config.streaming { stats.time_to_first_token } else { None },
            itl_percentiles: if config.streaming { stats.inter_token_latency } else { None },
            peak_in_flight: result.peak_in_flight,
            host: result.host.clone(),
            config_snapshot: config.clone(),
            dataset_summary: dataset.clone(),
        })
    }

    /// Export the report as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Write the JSON artifact
    pub fn write_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()).map_err(|source| BenchError::ReportWrite {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Render the human-readable summary
    pub fn render_table(&self) -> String {
        let config = &self.config_snapshot;
        let dataset = &self.dataset_summary;
        let mut out = String::new();

        let row = |out: &mut String, label: &str, value: String| {
            let _ = writeln!(out, "│ {:<34} │ {:>24} │", label, value);
        };
        let rule = |out: &mut String, left: char, right: char| {
            let _ = writeln!(out, "{}{}┼{}{}", left, "─".repeat(36), "─".repeat(26), right);
        };
        let section = |out: &mut String, title: &str| {
            let _ = writeln!(out, "│ {:<61} │", title);
        };
        let percentiles = |out: &mut String, name: &str, stats: &PercentileStats| {
            let _ = writeln!(
                out,
                "│ {:<10} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} │",
                name, stats.avg, stats.p50, stats.p90, stats.p95, stats.p99, stats.max
            );
        };

        let _ = writeln!(out);
        let _ = writeln!(out, "╔═══════════════════════════════════════════════════════════════╗");
        let _ = writeln!(out, "║                 THROUGHPUT BENCHMARK RESULTS                  ║");
        let _ = writeln!(out, "╚═══════════════════════════════════════════════════════════════╝");
        let _ = writeln!(out, "┌────────────────────────────────────┬──────────────────────────┐");

        section(&mut out, "RUNTIME");
        rule(&mut out, '├', '┤');
        row(&mut out, "Backend", config.backend_kind.to_string());
        row(&mut out, "Max batch size", config.max_batch_size.to_string());
        row(&mut out, "Max num tokens", config.max_num_tokens.to_string());
        row(&mut out, "Max sequence length", config.max_seq_len.to_string());
        row(&mut out, "Beam width", config.beam_width.to_string());
        row(&mut out, "KV cache fraction", format!("{:.2}", config.kv_cache_fraction));
        row(
            &mut out,
            "Concurrency",
            config
                .concurrency_limit
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unbounded".to_string()),
        );
        row(&mut out, "Streaming", config.streaming.to_string());
        rule(&mut out, '├', '┤');

        section(&mut out, "DATASET");
        rule(&mut out, '├', '┤');
        row(&mut out, "Requests", dataset.num_requests.to_string());
        row(&mut out, "Average ISL / OSL", format!("{:.1} / {:.1}", dataset.avg_isl, dataset.avg_osl));
        row(&mut out, "Max ISL / OSL", format!("{} / {}", dataset.max_isl, dataset.max_osl));
        row(&mut out, "Max sequence length", dataset.max_sequence_length.to_string());
        rule(&mut out, '├', '┤');

        section(&mut out, "PERFORMANCE");
        rule(&mut out, '├', '┤');
        row(&mut out, "Completed / failed", format!("{} / {}", self.completed_requests, self.failed_requests));
        row(&mut out, "Duration (s)", format!("{:.2}", self.duration_seconds));
        row(&mut out, "Request throughput (req/s)", format!("{:.4}", self.request_throughput));
        row(&mut out, "Output throughput (tok/s)", format!("{:.4}", self.output_token_throughput));
        row(&mut out, "Total throughput (tok/s)", format!("{:.4}", self.total_token_throughput));
        row(&mut out, "Total input / output tokens", format!("{} / {}", self.total_input_tokens, self.total_output_tokens));
        row(&mut out, "Peak in-flight", self.peak_in_flight.to_string());
        let _ = writeln!(out, "├────────────────────────────────────┴──────────────────────────┤");

        section(&mut out, "LATENCY (ms)       avg      p50      p90      p95      p99      max");
        percentiles(&mut out, "Request", &self.latency_percentiles);
        if let Some(ttft) = &self.ttft_percentiles {
            percentiles(&mut out, "TTFT", ttft);
        }
        if let Some(itl) = &self.itl_percentiles {
            percentiles(&mut out, "ITL", itl);
        }
        let _ = writeln!(out, "└───────────────────────────────────────────────────────────────┘");

        if self.truncated {
            let _ = writeln!(
                out,
                "Run truncated: {} of {} requests recorded",
                self.completed_requests + self.failed_requests,
                self.total_requests
            );
        }
        if let Some(host) = &self.host {
            let _ = writeln!(
                out,
                "Host: {} ({} CPUs, avg CPU {:.1}%, peak memory {:.0} MB)",
                host.hostname,
                host.cpu_count,
                host.avg_cpu_percent,
                host.peak_memory_bytes as f64 / (1024.0 * 1024.0)
            );
        }
        out
    }

    /// Print the report as a table
    pub fn print_table(&self) {
        println!("{}", self.render_table());
    }
}
