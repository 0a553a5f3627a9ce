//! Host resource sampling during the measured run.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Host the benchmark ran on, with CPU/memory usage observed during the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSummary {
    pub hostname: String,
    pub cpu_count: usize,
    pub total_memory_bytes: u64,
    pub avg_cpu_percent: f32,
    pub peak_cpu_percent: f32,
    pub peak_memory_bytes: u64,
    pub samples: usize,
}

#[derive(Default)]
struct Samples {
    cpu_total: f64,
    cpu_peak: f32,
    memory_peak: u64,
    count: usize,
}

impl Samples {
    fn take(&mut self, sys: &mut System) {
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu = sys.global_cpu_usage();
        self.cpu_total += cpu as f64;
        self.cpu_peak = self.cpu_peak.max(cpu);
        self.memory_peak = self.memory_peak.max(sys.used_memory());
        self.count += 1;
    }
}

/// Background sampler, started when measurement begins
pub struct ResourceSampler {
    cancel: CancellationToken,
    handle: JoinHandle<(System, Samples)>,
}

impl ResourceSampler {
    pub fn start() -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut sys = System::new();
            let mut samples = Samples::default();
            // First CPU reading is a baseline; usage needs two refreshes
            sys.refresh_cpu_usage();

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(SAMPLE_INTERVAL) => samples.take(&mut sys),
                }
            }
            (sys, samples)
        });

        Self { cancel, handle }
    }

    /// Stop sampling and summarize. Returns `None` if the sampler task died.
    pub async fn stop(self) -> Option<HostSummary> {
        self.cancel.cancel();
        let (mut sys, mut samples) = match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Resource sampler failed: {}", e);
                return None;
            }
        };

        if samples.count == 0 {
            samples.take(&mut sys);
        }

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Some(HostSummary {
            hostname,
            cpu_count: sys.cpus().len(),
            total_memory_bytes: sys.total_memory(),
            avg_cpu_percent: (samples.cpu_total / samples.count as f64) as f32,
            peak_cpu_percent: samples.cpu_peak,
            peak_memory_bytes: samples.memory_peak,
            samples: samples.count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sampler_summary() {
        let sampler = ResourceSampler::start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let summary = sampler.stop().await.unwrap();

        assert!(!summary.hostname.is_empty());
        assert!(summary.samples >= 1);
        assert!(summary.total_memory_bytes > 0);
        assert!(summary.peak_memory_bytes <= summary.total_memory_bytes);
    }
}
