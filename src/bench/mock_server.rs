//! Mock OpenAI-compatible inference server backed by the simulated engine.

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use crate::backend::{InferenceBackend, IterationStats, ResponseStream, SimulatedBackend};
use crate::dataset::{Modality, MultimodalPayload, Request};
use crate::error::Result;
use crate::tokenizer;

/// Iteration records kept for `/metrics`
const METRICS_HISTORY: usize = 1000;

struct ServerState {
    backend: Arc<SimulatedBackend>,
    next_id: AtomicU64,
    iterations: Mutex<VecDeque<IterationStats>>,
}

/// Mock inference server for standalone benchmarking
pub struct MockInferenceServer {
    backend: Arc<SimulatedBackend>,
    requested_port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    port: u16,
}

impl MockInferenceServer {
    /// Create a server for `backend`; port 0 picks a free port
    pub fn new(backend: Arc<SimulatedBackend>, port: u16) -> Self {
        Self {
            backend,
            requested_port: port,
            shutdown_tx: None,
            port: 0,
        }
    }

    /// Start the mock server and return the actual port
    pub async fn start(&mut self) -> Result<u16> {
        let addr = format!("127.0.0.1:{}", self.requested_port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        self.port = port;

        let state = Arc::new(ServerState {
            backend: self.backend.clone(),
            next_id: AtomicU64::new(0),
            iterations: Mutex::new(VecDeque::with_capacity(METRICS_HISTORY)),
        });

        let (stats_tx, mut stats_rx) = mpsc::unbounded_channel();
        self.backend.start_stats(stats_tx);
        let collector = state.clone();
        tokio::spawn(async move {
            while let Some(stats) = stats_rx.recv().await {
                if let Ok(mut history) = collector.iterations.lock() {
                    if history.len() == METRICS_HISTORY {
                        history.pop_front();
                    }
                    history.push_back(stats);
                }
            }
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let app = Router::new()
            .route("/v1/completions", post(handle_completions))
            .route("/v1/chat/completions", post(handle_chat_completions))
            .route("/metrics", get(handle_metrics))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        tracing::info!(port, "Mock inference server listening");
        Ok(port)
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Stop the mock server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            self.backend.stop_stats();
        }
    }
}

impl Drop for MockInferenceServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PromptInput {
    Ids(Vec<u32>),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<Value>),
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: MessageContent,
}

#[derive(Debug, Deserialize)]
struct CompletionRequest {
    #[serde(default)]
    prompt: Option<PromptInput>,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
    #[serde(default)]
    stream: bool,
}

fn default_max_tokens() -> u32 {
    16
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, message.into()).into_response()
}

async fn handle_completions(State(state): State<Arc<ServerState>>, Json(body): Json<CompletionRequest>) -> Response {
    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    let input_ids = match body.prompt {
        Some(PromptInput::Ids(ids)) => ids,
        Some(PromptInput::Text(text)) => match tokenizer::encode(&text) {
            Ok(ids) => ids,
            Err(e) => return bad_request(e.to_string()),
        },
        None => return bad_request("prompt is required"),
    };

    let request = Request::new(id, input_ids, body.max_tokens.max(1));
    generate(&state, request, body.stream, false).await
}

async fn handle_chat_completions(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CompletionRequest>,
) -> Response {
    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    let mut prompt = String::new();
    let mut media_paths = Vec::new();
    let mut modality = None;

    for message in body.messages {
        match message.content {
            MessageContent::Text(text) => prompt.push_str(&text),
            MessageContent::Parts(parts) => {
                for part in parts {
                    match part["type"].as_str() {
                        Some("text") => prompt.push_str(part["text"].as_str().unwrap_or_default()),
                        Some("image_url") => {
                            modality = Some(Modality::Image);
                            media_paths.extend(part["image_url"]["url"].as_str().map(String::from));
                        }
                        Some("video_url") => {
                            modality = Some(Modality::Video);
                            media_paths.extend(part["video_url"]["url"].as_str().map(String::from));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    let request = match modality {
        Some(modality) => Request {
            id,
            input_ids: Vec::new(),
            output_tokens: body.max_tokens.max(1),
            multimodal: Some(MultimodalPayload {
                modality,
                prompt,
                media_paths,
            }),
        },
        None => match tokenizer::encode(&prompt) {
            Ok(ids) => Request::new(id, ids, body.max_tokens.max(1)),
            Err(e) => return bad_request(e.to_string()),
        },
    };

    generate(&state, request, body.stream, true).await
}

async fn handle_metrics(State(state): State<Arc<ServerState>>) -> Response {
    let history: Vec<IterationStats> = state
        .iterations
        .lock()
        .map(|history| history.iter().cloned().collect())
        .unwrap_or_default();
    Json(history).into_response()
}

async fn generate(state: &ServerState, request: Request, streaming: bool, chat: bool) -> Response {
    let known_input = request.input_len();
    let response = match state.backend.submit(&request, streaming).await {
        Ok(response) => response,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    if streaming {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/event-stream")],
            Body::from_stream(sse_stream(response, chat, known_input)),
        )
            .into_response();
    }

    let mut response = response;
    let mut completion_tokens = 0u32;
    let mut prompt_tokens = known_input;
    while let Some(chunk) = response.next().await {
        match chunk {
            Ok(chunk) => {
                completion_tokens += chunk.new_tokens;
                prompt_tokens = chunk.prompt_tokens.unwrap_or(prompt_tokens);
            }
            Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }

    let text = generate_content(completion_tokens as usize);
    let choice = if chat {
        json!({"index": 0, "message": {"role": "assistant", "content": text}, "finish_reason": "length"})
    } else {
        json!({"index": 0, "text": text, "finish_reason": "length"})
    };
    Json(json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "choices": [choice],
        "usage": usage(prompt_tokens, completion_tokens),
    }))
    .into_response()
}

fn usage(prompt_tokens: u32, completion_tokens: u32) -> Value {
    json!({
        "prompt_tokens": prompt_tokens,
        "completion_tokens": completion_tokens,
        "total_tokens": prompt_tokens + completion_tokens,
    })
}

fn sse_event(value: &Value) -> Bytes {
    Bytes::from(format!("data: {}\n\n", value))
}

/// One SSE event per generated token, then usage and `[DONE]`
fn sse_stream(
    mut response: ResponseStream,
    chat: bool,
    known_input: u32,
) -> impl futures::Stream<Item = std::result::Result<Bytes, std::io::Error>> {
    async_stream::stream! {
        let mut prompt_tokens = known_input;
        let mut completion_tokens = 0u32;
        let mut failed = false;

        while let Some(chunk) = response.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
                    failed = true;
                    break;
                }
            };
            prompt_tokens = chunk.prompt_tokens.unwrap_or(prompt_tokens);

            for i in 0..chunk.new_tokens {
                completion_tokens += 1;
                let finish_reason = (chunk.finished && i + 1 == chunk.new_tokens).then_some("length");
                let text = generate_content(1);
                let choice = if chat {
                    json!({"index": 0, "delta": {"content": text}, "finish_reason": finish_reason})
                } else {
                    json!({"index": 0, "text": text, "finish_reason": finish_reason})
                };
                yield Ok(sse_event(&json!({"choices": [choice]})));
            }
        }

        if !failed {
            yield Ok(sse_event(&json!({"choices": [], "usage": usage(prompt_tokens, completion_tokens)})));
            yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
        }
    }
}

/// Random words, one per token
fn generate_content(tokens: usize) -> String {
    const WORDS: &[&str] = &[
        "the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog", "hello", "world", "rust",
        "benchmark", "token", "latency", "throughput", "stream", "batch", "engine",
    ];

    let mut rng = rand::thread_rng();
    (0..tokens)
        .map(|_| WORDS[rng.gen_range(0..WORDS.len())])
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{OpenAiBackend, SimulationConfig};
    use crate::bench::config::tests::runtime_config;
    use std::time::Duration;

    fn fast_engine() -> Arc<SimulatedBackend> {
        let config = SimulationConfig {
            prefill_per_token: Duration::from_micros(1),
            decode_interval: Duration::from_millis(1),
            iteration_interval: Duration::from_millis(1),
            ..Default::default()
        };
        Arc::new(SimulatedBackend::new(&runtime_config(), config))
    }

    #[tokio::test]
    async fn test_mock_server_serves_completions() {
        let mut server = MockInferenceServer::new(fast_engine(), 0);
        let port = server.start().await.unwrap();
        assert!(port > 0);

        let client = OpenAiBackend::new(&server.url(), "mock", &runtime_config()).unwrap();
        let request = Request::new(1, vec![1, 2, 3, 4], 6);

        let chunks: Vec<_> = client.submit(&request, true).await.unwrap().collect().await;
        let streamed: u32 = chunks.iter().map(|c| c.as_ref().unwrap().new_tokens).sum();
        assert_eq!(streamed, 6);
        let prompt = chunks.iter().find_map(|c| c.as_ref().unwrap().prompt_tokens);
        assert_eq!(prompt, Some(4));

        let chunks: Vec<_> = client.submit(&request, false).await.unwrap().collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap().new_tokens, 6);

        server.stop();
    }

    #[tokio::test]
    async fn test_metrics_endpoint_returns_iterations() {
        let mut server = MockInferenceServer::new(fast_engine(), 0);
        server.start().await.unwrap();

        let client = OpenAiBackend::new(&server.url(), "mock", &runtime_config()).unwrap();
        let request = Request::new(1, vec![1; 8], 20);
        let _: Vec<_> = client.submit(&request, true).await.unwrap().collect().await;

        let history: Vec<IterationStats> = reqwest::get(format!("{}/metrics", server.url()))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!history.is_empty());

        server.stop();
    }

    #[test]
    fn test_generate_content_word_count() {
        assert_eq!(generate_content(5).split(' ').count(), 5);
        assert!(generate_content(0).is_empty());
    }
}
