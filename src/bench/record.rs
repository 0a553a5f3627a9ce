//! Per-request timing records and the result of one dispatcher run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::resources::HostSummary;

/// Terminal state of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestOutcome {
    Completed,
    Failed { reason: String },
    /// Still in flight when the drain grace period ran out
    Abandoned,
}

/// Timing of one dispatched request.
///
/// All instants are offsets from the start of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: u64,
    pub submitted_at: Duration,
    /// Only recorded in streaming mode
    pub first_token_at: Option<Duration>,
    pub completed_at: Duration,
    /// Prompt tokens consumed: the backend's count, else the dataset length
    pub input_tokens: u32,
    /// Prompt tokens as counted by the backend, when it reported them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_input_tokens: Option<u32>,
    pub output_tokens: u32,
    pub outcome: RequestOutcome,
}

impl RequestRecord {
    pub fn failed(request_id: u64, submitted_at: Duration, completed_at: Duration, input_tokens: u32, reason: String) -> Self {
        Self {
            request_id,
            submitted_at,
            first_token_at: None,
            completed_at,
            input_tokens,
            reported_input_tokens: None,
            output_tokens: 0,
            outcome: RequestOutcome::Failed { reason },
        }
    }

    pub fn abandoned(request_id: u64, submitted_at: Duration, abandoned_at: Duration, input_tokens: u32) -> Self {
        Self {
            request_id,
            submitted_at,
            first_token_at: None,
            completed_at: abandoned_at,
            input_tokens,
            reported_input_tokens: None,
            output_tokens: 0,
            outcome: RequestOutcome::Abandoned,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RequestOutcome::Completed
    }

    pub fn end_to_end(&self) -> Duration {
        self.completed_at.saturating_sub(self.submitted_at)
    }

    pub fn time_to_first_token(&self) -> Option<Duration> {
        self.first_token_at.map(|t| t.saturating_sub(self.submitted_at))
    }

    /// Mean gap between output tokens after the first one
    pub fn inter_token_latency(&self) -> Option<Duration> {
        let first = self.first_token_at?;
        if self.output_tokens < 2 {
            return None;
        }
        Some(self.completed_at.saturating_sub(first) / (self.output_tokens - 1))
    }
}

/// Everything one measured dispatcher invocation produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkRunResult {
    pub run_id: Uuid,
    /// One record per dispatched request, ordered by completion
    pub records: Vec<RequestRecord>,
    /// Number of requests the run was asked to execute
    pub workload_size: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
    /// Stopped early by an operator interrupt
    pub interrupted: bool,
    pub peak_in_flight: usize,
    pub host: Option<HostSummary>,
}

impl BenchmarkRunResult {
    pub fn completed(&self) -> usize {
        self.records.iter().filter(|r| r.is_success()).count()
    }

    /// Failed and abandoned requests
    pub fn failed(&self) -> usize {
        self.records.len() - self.completed()
    }

    /// Fewer records than requested
    pub fn is_truncated(&self) -> bool {
        self.interrupted || self.records.len() < self.workload_size
    }
}
