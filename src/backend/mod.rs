//! Inference backends the benchmark can drive.
//!
//! A backend accepts a [`Request`] and answers with a stream of
//! [`GenerationChunk`]s. Non-streaming submissions yield a single final chunk.
//! While an [`IterationSink`] is attached, the backend forwards its
//! per-scheduler-iteration statistics to it.

pub mod openai;
pub mod simulated;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::dataset::Request;

pub use openai::OpenAiBackend;
pub use simulated::{SimulatedBackend, SimulationConfig};

/// Failure of a single request (or of the backend handle itself)
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Backend has been shut down")]
    Shutdown,
}

/// Incremental output of one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationChunk {
    /// Tokens produced since the previous chunk
    pub new_tokens: u32,
    /// Prompt tokens actually consumed, when the backend reports it
    pub prompt_tokens: Option<u32>,
    pub finished: bool,
}

pub type ResponseStream = BoxStream<'static, Result<GenerationChunk, BackendError>>;

/// Statistics of one backend scheduling iteration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationStats {
    pub iter: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, alias = "iterLatencyMS")]
    pub iter_latency_ms: f64,
    #[serde(default)]
    pub num_active_requests: u64,
    #[serde(default)]
    pub num_queued_requests: u64,
    #[serde(default)]
    pub num_completed_requests: u64,
    #[serde(default)]
    pub num_generated_tokens: u64,
    /// Backend-specific fields passed through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Destination for iteration statistics, created fresh for each run
pub type IterationSink = mpsc::UnboundedSender<IterationStats>;

/// Handle to an inference engine.
///
/// Implementations must accept concurrent `submit` calls through `&self`.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Submit a request; `streaming` selects incremental or single-chunk delivery
    async fn submit(&self, request: &Request, streaming: bool) -> Result<ResponseStream, BackendError>;

    /// Start forwarding iteration statistics to `sink`, replacing any previous sink.
    ///
    /// Iterations that ran before this call are never forwarded.
    async fn attach_iteration_stats(&self, sink: IterationSink);

    /// Forward whatever the attached period still holds, then drop the sink
    async fn detach_iteration_stats(&self);

    /// Release backend resources. Further submissions fail with [`BackendError::Shutdown`].
    async fn shutdown(&self);
}

#[async_trait]
impl<T: InferenceBackend + ?Sized> InferenceBackend for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn submit(&self, request: &Request, streaming: bool) -> Result<ResponseStream, BackendError> {
        (**self).submit(request, streaming).await
    }

    async fn attach_iteration_stats(&self, sink: IterationSink) {
        (**self).attach_iteration_stats(sink).await
    }

    async fn detach_iteration_stats(&self) {
        (**self).detach_iteration_stats().await
    }

    async fn shutdown(&self) {
        (**self).shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_stats_accepts_camel_case_and_extra_fields() {
        let json = r#"{
            "iter": 12,
            "iterLatencyMS": 3.5,
            "numActiveRequests": 4,
            "numGeneratedTokens": 4,
            "gpuMemUsage": 1024
        }"#;
        let stats: IterationStats = serde_json::from_str(json).unwrap();
        assert_eq!(stats.iter, 12);
        assert!((stats.iter_latency_ms - 3.5).abs() < f64::EPSILON);
        assert_eq!(stats.num_active_requests, 4);
        assert_eq!(stats.num_generated_tokens, 4);
        assert!(stats.extra.contains_key("gpuMemUsage"));
    }

    #[test]
    fn test_backend_error_messages() {
        let err = BackendError::Status {
            status: 503,
            message: "overloaded".to_string(),
        };
        assert_eq!(err.to_string(), "Backend returned 503: overloaded");
        assert_eq!(BackendError::Shutdown.to_string(), "Backend has been shut down");
    }
}
