//! Backend for OpenAI-compatible inference servers.
//!
//! Text requests go to `/v1/completions` with token-id prompts, multimodal
//! requests to `/v1/chat/completions`. Streaming responses are Server-Sent
//! Events; every event carrying a choice counts as one token and the final
//! `usage` block corrects the totals. Iteration statistics are polled from
//! `GET /metrics` while a sink is attached: the history present at attach time
//! is skipped and one last poll runs at detach.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use super::{BackendError, GenerationChunk, InferenceBackend, IterationSink, IterationStats, ResponseStream};
use crate::bench::config::RuntimeConfig;
use crate::dataset::Request;
use crate::tokenizer;

/// How often `/metrics` is polled while attached
const METRICS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound on one `/metrics` request
const METRICS_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    delta: Option<Message>,
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    finish_reason: Option<String>,
}

impl Choice {
    fn content(&self) -> Option<&str> {
        self.text
            .as_deref()
            .or_else(|| self.delta.as_ref().and_then(|d| d.content.as_deref()))
            .or_else(|| self.message.as_ref().and_then(|m| m.content.as_deref()))
    }
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Incremental Server-Sent Events decoder
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed raw bytes, returning the `data:` payloads of every completed line
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}

/// OpenAI-compatible HTTP backend
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    beam_width: u32,
    closed: AtomicBool,
    stats_task: Mutex<Option<StatsPoller>>,
}

/// Background `/metrics` poller of one attachment
struct StatsPoller {
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

/// Passes only iterations newer than the attach point
#[derive(Debug)]
struct IterationFilter {
    last_iter: Option<u64>,
    not_before: DateTime<Utc>,
}

impl IterationFilter {
    fn new(history: &[IterationStats], not_before: DateTime<Utc>) -> Self {
        Self {
            last_iter: history.iter().map(|s| s.iter).max(),
            not_before,
        }
    }

    fn accepts(&mut self, stats: &IterationStats) -> bool {
        if self.last_iter.is_some_and(|last| stats.iter <= last) {
            return false;
        }
        self.last_iter = Some(stats.iter);

        // Timestamps in other formats are not comparable; `iter` decides alone
        let stamped = stats
            .timestamp
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok());
        stamped.map_or(true, |t| t.with_timezone(&Utc) >= self.not_before)
    }
}

async fn fetch_iteration_stats(client: &reqwest::Client, url: &str) -> Option<Vec<IterationStats>> {
    let response = match client.get(url).timeout(METRICS_REQUEST_TIMEOUT).send().await {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            tracing::debug!(status = %resp.status(), "Metrics endpoint unavailable");
            return None;
        }
        Err(e) => {
            tracing::debug!("Failed to poll iteration statistics: {}", e);
            return None;
        }
    };

    match response.json::<Vec<IterationStats>>().await {
        Ok(batch) => Some(batch),
        Err(e) => {
            tracing::debug!("Invalid iteration statistics: {}", e);
            None
        }
    }
}

impl OpenAiBackend {
    /// Create a backend for the server at `base_url`
    pub fn new(base_url: &str, model: &str, runtime: &RuntimeConfig) -> Result<Self, BackendError> {
        let pool = runtime.concurrency_limit.unwrap_or(512);
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(pool)
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            beam_width: runtime.beam_width.max(1),
            closed: AtomicBool::new(false),
            stats_task: Mutex::new(None),
        })
    }

    /// Endpoint path and JSON body for a request
    fn build_request_body(&self, request: &Request, streaming: bool) -> (&'static str, Value) {
        let mut body = match &request.multimodal {
            Some(payload) => {
                let mut content = vec![json!({"type": "text", "text": payload.prompt})];
                content.extend(payload.media_paths.iter().map(|path| {
                    let kind = format!("{}_url", payload.modality);
                    let mut item = serde_json::Map::new();
                    item.insert("type".to_string(), json!(kind));
                    item.insert(kind, json!({"url": path}));
                    Value::Object(item)
                }));
                json!({
                    "model": self.model,
                    "messages": [{"role": "user", "content": content}],
                    "max_tokens": request.output_tokens,
                })
            }
            None => json!({
                "model": self.model,
                "prompt": request.input_ids,
                "max_tokens": request.output_tokens,
            }),
        };

        body["stream"] = json!(streaming);
        body["ignore_eos"] = json!(true);
        if self.beam_width > 1 {
            body["best_of"] = json!(self.beam_width);
            body["use_beam_search"] = json!(true);
        }
        if streaming {
            body["stream_options"] = json!({"include_usage": true});
        }

        let path = if request.is_multimodal() {
            "/v1/chat/completions"
        } else {
            "/v1/completions"
        };
        (path, body)
    }
}

/// Turn one decoded event into a chunk, given the tokens already counted
fn chunk_from_event(event: &CompletionChunk, counted: u32) -> GenerationChunk {
    let has_content = event
        .choices
        .iter()
        .any(|c| c.content().is_some_and(|s| !s.is_empty()));
    let mut chunk = GenerationChunk {
        new_tokens: u32::from(has_content),
        prompt_tokens: None,
        finished: event.choices.iter().any(|c| c.finish_reason.is_some()),
    };

    if let Some(usage) = &event.usage {
        chunk.new_tokens = usage.completion_tokens.saturating_sub(counted);
        chunk.prompt_tokens = Some(usage.prompt_tokens);
        chunk.finished = true;
    }
    chunk
}

#[async_trait]
impl InferenceBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn submit(&self, request: &Request, streaming: bool) -> Result<ResponseStream, BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Shutdown);
        }

        let (path, body) = self.build_request_body(request, streaming);
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                message,
            });
        }

        if !streaming {
            let completion: CompletionChunk = response.json().await?;
            let new_tokens = match &completion.usage {
                Some(usage) => usage.completion_tokens,
                None => {
                    let text: String = completion.choices.iter().filter_map(|c| c.content()).collect();
                    tokenizer::count_tokens(&text).map_err(|e| BackendError::Stream(e.to_string()))? as u32
                }
            };
            let chunk = GenerationChunk {
                new_tokens,
                prompt_tokens: completion.usage.as_ref().map(|u| u.prompt_tokens),
                finished: true,
            };
            return Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })));
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut decoder = SseDecoder::default();
            let mut counted = 0u32;
            let mut done = false;

            while !done {
                let Some(next) = bytes.next().await else { break };
                let data = next.map_err(BackendError::from)?;

                for payload in decoder.push(&data) {
                    if payload == "[DONE]" {
                        done = true;
                        break;
                    }

                    let event: CompletionChunk = serde_json::from_str(&payload)
                        .map_err(|e| BackendError::Stream(format!("invalid event: {}", e)))?;
                    let chunk = chunk_from_event(&event, counted);
                    counted += chunk.new_tokens;

                    if chunk.new_tokens > 0 || chunk.prompt_tokens.is_some() {
                        yield chunk;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn attach_iteration_stats(&self, sink: IterationSink) {
        self.detach_iteration_stats().await;

        let client = self.client.clone();
        let url = format!("{}/metrics", self.base_url);

        // Whatever the server already holds belongs to earlier iterations
        let attached_at = Utc::now();
        let history = fetch_iteration_stats(&client, &url).await.unwrap_or_default();
        let mut filter = IterationFilter::new(&history, attached_at);
        tracing::debug!(baseline = ?filter.last_iter, "Attached to metrics endpoint");

        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + METRICS_POLL_INTERVAL, METRICS_POLL_INTERVAL);

            loop {
                let last_poll = tokio::select! {
                    _ = stopped.cancelled() => true,
                    _ = ticker.tick() => false,
                };

                for stats in fetch_iteration_stats(&client, &url).await.unwrap_or_default() {
                    if filter.accepts(&stats) && sink.send(stats).is_err() {
                        return;
                    }
                }
                if last_poll {
                    return;
                }
            }
        });

        if let Ok(mut task) = self.stats_task.lock() {
            *task = Some(StatsPoller { handle, stop });
        }
    }

    async fn detach_iteration_stats(&self) {
        let poller = self.stats_task.lock().ok().and_then(|mut task| task.take());
        let Some(poller) = poller else { return };

        poller.stop.cancel();
        if let Err(e) = poller.handle.await {
            tracing::warn!("Metrics poller ended abnormally: {}", e);
        }
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.detach_iteration_stats().await;
        tracing::info!(base_url = %self.base_url, "Closed OpenAI-compatible backend");
    }
}

impl Drop for OpenAiBackend {
    fn drop(&mut self) {
        if let Ok(mut task) = self.stats_task.lock() {
            if let Some(poller) = task.take() {
                poller.handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::config::tests::runtime_config;
    use crate::dataset::{Modality, MultimodalPayload};
    use tokio::sync::mpsc;

    fn backend(url: &str) -> OpenAiBackend {
        OpenAiBackend::new(url, "test-model", &runtime_config()).unwrap()
    }

    fn image_request(id: u64) -> Request {
        Request {
            id,
            input_ids: Vec::new(),
            output_tokens: 8,
            multimodal: Some(MultimodalPayload {
                modality: Modality::Image,
                prompt: "what is this".to_string(),
                media_paths: vec!["http://host/cat.png".to_string()],
            }),
        }
    }

    /// `/metrics` body holding iterations `range`
    fn iterations(range: std::ops::RangeInclusive<u64>) -> String {
        let items: Vec<Value> = range
            .map(|iter| json!({"iter": iter, "numActiveRequests": 1, "numGeneratedTokens": 4}))
            .collect();
        Value::Array(items).to_string()
    }

    fn stats(iter: u64, timestamp: Option<&str>) -> IterationStats {
        IterationStats {
            iter,
            timestamp: timestamp.map(str::to_string),
            ..Default::default()
        }
    }

    async fn collect(stream: ResponseStream) -> Vec<Result<GenerationChunk, BackendError>> {
        stream.collect().await
    }

    #[test]
    fn test_sse_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        assert_eq!(decoder.push(b": 1}\n\n"), vec!["{\"a\": 1}".to_string()]);
        assert_eq!(
            decoder.push(b"event: ping\ndata: [DONE]\r\n"),
            vec!["[DONE]".to_string()]
        );
    }

    #[test]
    fn test_build_text_request() {
        let backend = backend("http://localhost:8000/");
        let (path, body) = backend.build_request_body(&Request::new(1, vec![10, 20], 32), true);

        assert_eq!(path, "/v1/completions");
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["prompt"], json!([10, 20]));
        assert_eq!(body["max_tokens"], 32);
        assert_eq!(body["stream"], true);
        assert_eq!(body["ignore_eos"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(body.get("best_of").is_none());
    }

    #[test]
    fn test_build_multimodal_request() {
        let backend = backend("http://localhost:8000");
        let (path, body) = backend.build_request_body(&image_request(1), false);

        assert_eq!(path, "/v1/chat/completions");
        let content = &body["messages"][0]["content"];
        assert_eq!(content[0]["text"], "what is this");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], "http://host/cat.png");
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn test_usage_corrects_token_count() {
        let event: CompletionChunk = serde_json::from_str(
            r#"{"choices": [], "usage": {"prompt_tokens": 12, "completion_tokens": 5}}"#,
        )
        .unwrap();
        let chunk = chunk_from_event(&event, 3);
        assert_eq!(chunk.new_tokens, 2);
        assert_eq!(chunk.prompt_tokens, Some(12));
        assert!(chunk.finished);
    }

    #[tokio::test]
    async fn test_non_streaming_completion() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices": [{"text": "hello world", "finish_reason": "length"}],
                    "usage": {"prompt_tokens": 2, "completion_tokens": 4}}"#,
            )
            .create_async()
            .await;

        let backend = backend(&server.url());
        let stream = backend.submit(&Request::new(1, vec![1, 2], 4), false).await.unwrap();
        let chunks = collect(stream).await;

        mock.assert_async().await;
        assert_eq!(chunks.len(), 1);
        let chunk = chunks[0].as_ref().unwrap();
        assert_eq!(chunk.new_tokens, 4);
        assert_eq!(chunk.prompt_tokens, Some(2));
    }

    #[tokio::test]
    async fn test_streaming_completion() {
        let mut server = mockito::Server::new_async().await;
        let body = [
            r#"data: {"choices": [{"text": "a"}]}"#,
            r#"data: {"choices": [{"text": "b"}]}"#,
            r#"data: {"choices": [{"text": "c", "finish_reason": "length"}]}"#,
            r#"data: {"choices": [], "usage": {"prompt_tokens": 2, "completion_tokens": 3}}"#,
            "data: [DONE]",
        ]
        .join("\n\n");
        server
            .mock("POST", "/v1/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body + "\n\n")
            .create_async()
            .await;

        let backend = backend(&server.url());
        let stream = backend.submit(&Request::new(1, vec![1, 2], 3), true).await.unwrap();
        let chunks: Vec<GenerationChunk> = collect(stream).await.into_iter().map(|c| c.unwrap()).collect();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(|c| c.new_tokens).sum::<u32>(), 3);
        assert!(chunks[2].finished);
    }

    #[tokio::test]
    async fn test_error_status_is_request_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/completions")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let backend = backend(&server.url());
        let result = backend.submit(&Request::new(1, vec![1], 1), false).await;
        match result {
            Err(BackendError::Status { status, message }) => {
                assert_eq!(status, 503);
                assert_eq!(message, "overloaded");
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_shutdown_rejects_submissions() {
        let backend = backend("http://127.0.0.1:9");
        backend.shutdown().await;
        let result = backend.submit(&Request::new(1, vec![1], 1), true).await;
        assert!(matches!(result, Err(BackendError::Shutdown)));
    }

    #[tokio::test]
    async fn test_multimodal_without_usage_reports_no_prompt_tokens() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices": [{"message": {"content": "a cat"}, "finish_reason": "stop"}]}"#)
            .create_async()
            .await;

        let backend = backend(&server.url());
        let stream = backend.submit(&image_request(3), false).await.unwrap();
        let chunks = collect(stream).await;

        let chunk = chunks[0].as_ref().unwrap();
        assert!(chunk.new_tokens > 0);
        assert_eq!(chunk.prompt_tokens, None);
    }

    #[test]
    fn test_iteration_filter_skips_history_and_stale_timestamps() {
        let attached_at = Utc::now();
        let mut filter = IterationFilter::new(&[stats(3, None), stats(9, None)], attached_at);

        assert!(!filter.accepts(&stats(9, None)));
        assert!(filter.accepts(&stats(10, None)));
        assert!(!filter.accepts(&stats(10, None)));

        let stale = (attached_at - chrono::Duration::seconds(5)).to_rfc3339();
        let fresh = (attached_at + chrono::Duration::seconds(1)).to_rfc3339();
        assert!(!filter.accepts(&stats(11, Some(&stale))));
        assert!(filter.accepts(&stats(12, Some(&fresh))));
        assert!(filter.accepts(&stats(13, Some("10-16-2026 12:00:00"))));
    }

    #[tokio::test]
    async fn test_metrics_history_skipped_and_tail_flushed_on_detach() {
        let mut server = mockito::Server::new_async().await;
        let history = server
            .mock("GET", "/metrics")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(iterations(0..=4))
            .create_async()
            .await;

        let backend = backend(&server.url());
        let (tx, mut rx) = mpsc::unbounded_channel();
        backend.attach_iteration_stats(tx).await;
        history.assert_async().await;
        history.remove_async().await;

        // Iterations 5..=7 ran after attach, well inside one poll interval
        server
            .mock("GET", "/metrics")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(iterations(0..=7))
            .create_async()
            .await;
        backend.detach_iteration_stats().await;

        let mut received = Vec::new();
        while let Some(stats) = rx.recv().await {
            received.push(stats.iter);
        }
        assert_eq!(received, vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn test_metrics_unavailable_forwards_everything_after_attach() {
        let mut server = mockito::Server::new_async().await;
        let missing = server
            .mock("GET", "/metrics")
            .with_status(404)
            .create_async()
            .await;

        let backend = backend(&server.url());
        let (tx, mut rx) = mpsc::unbounded_channel();
        backend.attach_iteration_stats(tx).await;
        missing.remove_async().await;

        server
            .mock("GET", "/metrics")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(iterations(0..=1))
            .create_async()
            .await;
        backend.shutdown().await;

        let mut received = Vec::new();
        while let Some(stats) = rx.recv().await {
            received.push(stats.iter);
        }
        assert_eq!(received, vec![0, 1]);
    }
}
