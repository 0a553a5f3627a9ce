//! Latency statistics using HdrHistogram for accurate percentile calculations.

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::record::RequestRecord;
use crate::error::Result;

/// Percentile summary of one latency series, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentileStats {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

/// Histogram of durations in microseconds, up to 10 minutes at 3 significant figures
struct LatencyHistogram(Histogram<u64>);

impl LatencyHistogram {
    fn new() -> Result<Self> {
        Ok(Self(Histogram::new_with_bounds(1, 600_000_000, 3)?))
    }

    fn record(&mut self, value: Duration) {
        let micros = value.as_micros().min(u64::MAX as u128) as u64;
        self.0.saturating_record(micros.max(1));
    }

    fn summarize(&self) -> Option<PercentileStats> {
        if self.0.is_empty() {
            return None;
        }
        let ms = |micros: u64| micros as f64 / 1000.0;
        Some(PercentileStats {
            p50: ms(self.0.value_at_quantile(0.50)),
            p90: ms(self.0.value_at_quantile(0.90)),
            p95: ms(self.0.value_at_quantile(0.95)),
            p99: ms(self.0.value_at_quantile(0.99)),
            min: ms(self.0.min()),
            max: ms(self.0.max()),
            avg: self.0.mean() / 1000.0,
        })
    }
}

/// Latency distributions and token totals over the successful records
#[derive(Debug, Clone, PartialEq)]
pub struct RecordStatistics {
    pub latency: Option<PercentileStats>,
    pub time_to_first_token: Option<PercentileStats>,
    pub inter_token_latency: Option<PercentileStats>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub completed: usize,
}

impl RecordStatistics {
    /// Aggregate successful records; failed and abandoned ones are skipped
    pub fn from_records(records: &[RequestRecord]) -> Result<Self> {
        let mut latency = LatencyHistogram::new()?;
        let mut ttft = LatencyHistogram::new()?;
        let mut itl = LatencyHistogram::new()?;
        let mut total_input_tokens = 0u64;
        let mut total_output_tokens = 0u64;
        let mut completed = 0usize;

        for record in records.iter().filter(|r| r.is_success()) {
            completed += 1;
            total_input_tokens += record.input_tokens as u64;
            total_output_tokens += record.output_tokens as u64;

            latency.record(record.end_to_end());
            if let Some(value) = record.time_to_first_token() {
                ttft.record(value);
            }
            if let Some(value) = record.inter_token_latency() {
                itl.record(value);
            }
        }

        Ok(Self {
            latency: latency.summarize(),
            time_to_first_token: ttft.summarize(),
            inter_token_latency: itl.summarize(),
            total_input_tokens,
            total_output_tokens,
            completed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::record::RequestOutcome;

    fn record(latency_ms: u64, ttft_ms: Option<u64>, output_tokens: u32) -> RequestRecord {
        RequestRecord {
            request_id: 0,
            submitted_at: Duration::ZERO,
            first_token_at: ttft_ms.map(Duration::from_millis),
            completed_at: Duration::from_millis(latency_ms),
            input_tokens: 100,
            reported_input_tokens: Some(100),
            output_tokens,
            outcome: RequestOutcome::Completed,
        }
    }

    #[test]
    fn test_percentiles_from_records() {
        let records: Vec<_> = (1..=100).map(|i| record(i * 10, None, 10)).collect();
        let stats = RecordStatistics::from_records(&records).unwrap();
        let latency = stats.latency.unwrap();

        assert_eq!(stats.completed, 100);
        assert_eq!(stats.total_input_tokens, 10_000);
        assert_eq!(stats.total_output_tokens, 1_000);
        assert!((latency.p50 - 500.0).abs() < 1.0);
        assert!((latency.p99 - 990.0).abs() < 1.0);
        assert!((latency.min - 10.0).abs() < 0.1);
        assert!((latency.max - 1000.0).abs() < 1.0);
        assert!((latency.avg - 505.0).abs() < 1.0);
        assert!(stats.time_to_first_token.is_none());
        assert!(stats.inter_token_latency.is_none());
    }

    #[test]
    fn test_streaming_series() {
        let records = vec![record(100, Some(20), 9), record(200, Some(40), 9)];
        let stats = RecordStatistics::from_records(&records).unwrap();

        let ttft = stats.time_to_first_token.unwrap();
        assert!((ttft.min - 20.0).abs() < 0.1);
        assert!((ttft.max - 40.0).abs() < 0.1);

        let itl = stats.inter_token_latency.unwrap();
        assert!((itl.min - 10.0).abs() < 0.1);
        assert!((itl.max - 20.0).abs() < 0.1);
    }

    #[test]
    fn test_failures_excluded() {
        let mut failed = record(5000, None, 0);
        failed.outcome = RequestOutcome::Failed {
            reason: "boom".to_string(),
        };
        let stats = RecordStatistics::from_records(&[record(100, None, 5), failed]).unwrap();

        assert_eq!(stats.completed, 1);
        assert!((stats.latency.unwrap().max - 100.0).abs() < 0.5);
    }

    #[test]
    fn test_empty_records() {
        let stats = RecordStatistics::from_records(&[]).unwrap();
        assert_eq!(stats.completed, 0);
        assert!(stats.latency.is_none());
    }
}
