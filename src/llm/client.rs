//! HTTP client for the Ollama chat API.
//!
//! Single-model-at-a-time client with line-delimited JSON streaming,
//! thinking-trace separation, token metrics capture, and cooperative
//! cancellation. Base URL and API key are fixed at construction from the
//! [`LlmConfig`](crate::config::LlmConfig) the harness built; model,
//! context override, and think mode are mutable through setters.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    build_think_value, is_thinking_capable, lookup_model_context_size, ChatMessage, ChatOptions,
    ChatRequest, ChatResponse, ModelInfo, StreamChunk, TagsResponse, ThinkMode, TokenMetrics,
    ToolSchema,
};
use crate::config::LlmConfig;
use crate::error::{BrewolError, Result};

/// Default HTTP timeout for non-streaming requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Serialized request bodies above this size are refused pre-send.
const MAX_REQUEST_BYTES: usize = 50_000;

/// Maximum buffered bytes while scanning for a line boundary.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Capacity of the per-stream chunk channel.
const STREAM_CHANNEL_CAPACITY: usize = 100;

/// Elapsed threshold below which tokens/sec is suppressed as noise.
const RATE_SUPPRESS_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct ClientState {
    model: Option<String>,
    num_ctx: Option<u32>,
    think_mode: ThinkMode,
}

/// Ollama API client.
///
/// Cheap to share behind an `Arc`; all interior state is lock-guarded and
/// no lock is held across a network wait.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
    state: RwLock<ClientState>,
    last_metrics: Arc<Mutex<Option<TokenMetrics>>>,
}

impl Client {
    /// Create a client from a resolved configuration.
    #[must_use]
    pub fn new(cfg: LlmConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key,
            http,
            state: RwLock::new(ClientState {
                model: cfg.model,
                num_ctx: cfg.num_ctx,
                think_mode: cfg.think_mode,
            }),
            last_metrics: Arc::new(Mutex::new(None)),
        }
    }

    /// Get the configured base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Set the current model.
    pub fn set_model(&self, model: impl Into<String>) {
        self.state.write().expect("client lock").model = Some(model.into());
    }

    /// Get the current model, if one is selected.
    #[must_use]
    pub fn model(&self) -> Option<String> {
        self.state.read().expect("client lock").model.clone()
    }

    /// Set an explicit context-window override.
    pub fn set_num_ctx(&self, num_ctx: u32) {
        if num_ctx > 0 {
            self.state.write().expect("client lock").num_ctx = Some(num_ctx);
        }
    }

    /// Get the explicit context-window override, if set.
    #[must_use]
    pub fn num_ctx(&self) -> Option<u32> {
        self.state.read().expect("client lock").num_ctx
    }

    /// Effective context size: the override when set, otherwise the model
    /// lookup table.
    #[must_use]
    pub fn model_context_size(&self) -> u32 {
        let state = self.state.read().expect("client lock");
        if let Some(num_ctx) = state.num_ctx {
            return num_ctx;
        }
        lookup_model_context_size(state.model.as_deref().unwrap_or(""))
    }

    /// Set the thinking mode.
    pub fn set_think_mode(&self, mode: ThinkMode) {
        self.state.write().expect("client lock").think_mode = mode;
    }

    /// Get the thinking mode.
    #[must_use]
    pub fn think_mode(&self) -> ThinkMode {
        self.state.read().expect("client lock").think_mode
    }

    /// Check whether the current model supports thinking traces.
    #[must_use]
    pub fn is_thinking_capable(&self) -> bool {
        let state = self.state.read().expect("client lock");
        state.model.as_deref().is_some_and(is_thinking_capable)
    }

    /// Token metrics from the most recent completed request.
    #[must_use]
    pub fn last_metrics(&self) -> Option<TokenMetrics> {
        *self.last_metrics.lock().expect("metrics lock")
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Build the chat request body, stripping thinking traces from every
    /// message and refusing oversized bodies before they hit the wire.
    fn build_request(
        &self,
        messages: &[ChatMessage],
        tools: Option<Vec<ToolSchema>>,
        stream: bool,
    ) -> Result<Vec<u8>> {
        let state = self.state.read().expect("client lock");
        let model = state.model.clone().ok_or(BrewolError::NoModel)?;

        let request = ChatRequest {
            think: build_think_value(state.think_mode, &model),
            options: state.num_ctx.map(|num_ctx| ChatOptions { num_ctx }),
            model,
            messages: messages.iter().map(ChatMessage::to_outgoing).collect(),
            stream,
            tools,
        };
        drop(state);

        let body = serde_json::to_vec(&request)?;
        if body.len() > MAX_REQUEST_BYTES {
            return Err(BrewolError::RequestTooLarge { size: body.len() });
        }

        Ok(body)
    }

    /// Fetch the installed models from `/api/tags`.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .map_err(|e| BrewolError::transport(format!("failed to fetch models: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BrewolError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let tags: TagsResponse = resp
            .json()
            .await
            .map_err(|e| BrewolError::transport(format!("failed to decode response: {e}")))?;
        Ok(tags.models)
    }

    /// Check if the runtime is reachable.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        let req = self
            .authorized(self.http.get(&url))
            .timeout(Duration::from_secs(5));
        matches!(req.send().await, Ok(resp) if resp.status().is_success())
    }

    /// Send a streaming chat request.
    ///
    /// Returns a receiver of [`StreamChunk`]s. The producer task feeds the
    /// channel until the terminal `done: true` chunk, a scanner failure, or
    /// cancellation; a fired `cancel` token yields exactly one final chunk
    /// carrying [`BrewolError::Cancelled`]. Decode failures on individual
    /// lines produce error chunks without ending the stream.
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let body = self.build_request(messages, tools, true)?;

        let url = format!("{}/api/chat", self.base_url);
        let resp = self
            .authorized(self.http.post(&url))
            .header("Content-Type", "application/json")
            .body(body)
            // Streams outlive the default timeout; cancellation bounds them.
            .timeout(Duration::from_secs(3600))
            .send()
            .await
            .map_err(|e| BrewolError::transport(format!("failed to send request: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BrewolError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let metrics_slot = Arc::clone(&self.last_metrics);

        tokio::spawn(async move {
            run_stream(resp, tx, cancel, metrics_slot).await;
        });

        Ok(rx)
    }

    /// Send a non-streaming chat request. Used for probes and tests;
    /// follows the same no-model and thinking-strip rules as the stream.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<Vec<ToolSchema>>,
    ) -> Result<ChatResponse> {
        let body = self.build_request(messages, tools, false)?;

        let url = format!("{}/api/chat", self.base_url);
        let resp = self
            .authorized(self.http.post(&url))
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| BrewolError::transport(format!("failed to send request: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BrewolError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = resp
            .json()
            .await
            .map_err(|e| BrewolError::transport(format!("failed to decode response: {e}")))?;

        *self.last_metrics.lock().expect("metrics lock") = Some(TokenMetrics {
            prompt_eval_count: chat.prompt_eval_count,
            eval_count: chat.eval_count,
            prompt_eval_duration: chat.prompt_eval_duration,
            eval_duration: chat.eval_duration,
            total_duration: chat.total_duration,
            tokens_per_sec: 0.0,
        });

        Ok(chat)
    }
}

/// Drive the HTTP byte stream, splitting it into newline-delimited JSON
/// chunks and forwarding them to the consumer.
async fn run_stream(
    resp: reqwest::Response,
    tx: mpsc::Sender<StreamChunk>,
    cancel: CancellationToken,
    metrics_slot: Arc<Mutex<Option<TokenMetrics>>>,
) {
    let mut stream = resp.bytes_stream();
    let mut buffer = String::new();
    let mut chunks_received: u64 = 0;
    let mut first_chunk_at: Option<Instant> = None;

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(StreamChunk::from_error(BrewolError::Cancelled)).await;
                return;
            }
            item = stream.next() => item,
        };

        let bytes = match item {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                let _ = tx
                    .send(StreamChunk::from_error(BrewolError::transport(format!(
                        "stream read failed: {e}"
                    ))))
                    .await;
                return;
            }
            None => return,
        };

        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(newline) = buffer.find('\n') {
            let line: String = buffer.drain(..=newline).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }

            let response: ChatResponse = match serde_json::from_str(line) {
                Ok(response) => response,
                Err(e) => {
                    warn!("undecodable stream line ({e})");
                    let _ = tx
                        .send(StreamChunk::from_error(BrewolError::Decode {
                            message: e.to_string(),
                        }))
                        .await;
                    continue;
                }
            };

            chunks_received += 1;
            let started = *first_chunk_at.get_or_insert_with(Instant::now);
            let elapsed = started.elapsed();
            let tokens_per_sec = if elapsed < RATE_SUPPRESS_WINDOW {
                0.0
            } else {
                chunks_received as f64 / elapsed.as_secs_f64()
            };

            let done = response.done;
            let mut chunk = StreamChunk {
                tokens_per_sec,
                ..StreamChunk::default()
            };

            if let Some(thinking) = response.message.thinking.clone().filter(|t| !t.is_empty()) {
                chunk.thinking_content = Some(thinking);
                chunk.is_thinking = true;
            }

            if done {
                let metrics = TokenMetrics {
                    prompt_eval_count: response.prompt_eval_count,
                    eval_count: response.eval_count,
                    prompt_eval_duration: response.prompt_eval_duration,
                    eval_duration: response.eval_duration,
                    total_duration: response.total_duration,
                    tokens_per_sec,
                };
                chunk.metrics = Some(metrics);
                *metrics_slot.lock().expect("metrics lock") = Some(metrics);
                debug!(
                    prompt_tokens = metrics.prompt_eval_count,
                    eval_tokens = metrics.eval_count,
                    "stream complete"
                );
            }

            chunk.response = response;

            if tx.send(chunk).await.is_err() {
                return;
            }
            if done {
                return;
            }
        }

        if buffer.len() > MAX_LINE_BYTES {
            let _ = tx
                .send(StreamChunk::from_error(BrewolError::Decode {
                    message: format!("line exceeds {MAX_LINE_BYTES} byte scan buffer"),
                }))
                .await;
            return;
        }
    }
}
