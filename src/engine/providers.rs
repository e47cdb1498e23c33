// Keystone Engine — Model Backends
// Direct HTTP calls to model runtimes with SSE streaming. One wire shape
// covers the OpenAI-compatible family (llama.cpp server, vLLM, transformers
// serving, Groq, OpenAI); Gemini gets its own adapter; embeddings speak the
// Ollama protocol.
//
// Every backend sanitizes messages and clamps sampling parameters before a
// request leaves the process, and logs token usage and duration after it
// returns.

use crate::atoms::config::{BackendKind, ModelConfig};
use crate::atoms::constants::{MAX_TOKENS_CEILING, MAX_TOKENS_FLOOR};
use crate::atoms::error::{EngineError, EngineResult};
use crate::shared::client::CircuitBreaker;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

// ── Request / response types ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage { role: "system".into(), content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage { role: "user".into(), content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage { role: "assistant".into(), content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        ChatRequest { messages, temperature: None, top_p: None, max_tokens: None }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// One streamed increment. The final chunk usually carries usage.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub delta_text: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

// ── Sanitization & clamps ──────────────────────────────────────────────────

/// Coerce a message list into what every cloud API accepts: known roles,
/// string content, no empty non-system messages, at least one user message.
pub fn sanitize_messages(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        let role = match msg.role.as_str() {
            "system" | "user" | "assistant" => msg.role.clone(),
            // Tool/function roles collapse into user context
            _ => "user".to_string(),
        };
        if role != "system" && msg.content.trim().is_empty() {
            continue;
        }
        out.push(ChatMessage { role, content: msg.content.clone() });
    }
    if !out.iter().any(|m| m.role == "user") {
        out.push(ChatMessage::user("Continue."));
    }
    out
}

/// Clamp sampling parameters into API-safe ranges.
pub fn clamp_params(req: &mut ChatRequest) {
    if let Some(t) = req.temperature {
        req.temperature = Some(t.clamp(0.0, 2.0));
    }
    if let Some(p) = req.top_p {
        req.top_p = Some(p.clamp(0.0, 1.0));
    }
    if let Some(m) = req.max_tokens {
        req.max_tokens = Some(m.clamp(MAX_TOKENS_FLOOR, MAX_TOKENS_CEILING));
    }
}

// ── Backend trait ──────────────────────────────────────────────────────────

/// Closed variant set behind one interface; construction goes through
/// `build_backend`.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Stable pool name for this backend instance.
    fn name(&self) -> &str;

    /// Whether this backend occupies local GPU memory.
    fn gpu_backed(&self) -> bool;

    /// Lazy readiness check; idempotent.
    async fn ensure_loaded(&self) -> EngineResult<()>;

    /// Stream a completion into `tx`. Returns final usage once the stream
    /// closes. Dropping the receiver cancels generation cooperatively.
    async fn chat_stream(
        &self,
        req: ChatRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> EngineResult<TokenUsage>;

    /// Convenience non-streaming call used by selectors and reviewers.
    async fn chat(&self, req: ChatRequest) -> EngineResult<String> {
        let (tx, mut rx) = mpsc::channel(32);
        let name = self.name().to_string();
        let fut = self.chat_stream(req, tx);
        let collector = async move {
            let mut text = String::new();
            while let Some(chunk) = rx.recv().await {
                if let Some(delta) = chunk.delta_text {
                    text.push_str(&delta);
                }
            }
            text
        };
        let (usage, text) = tokio::join!(fut, collector);
        usage?;
        debug!("[pool] {} non-streaming call returned {} chars", name, text.len());
        Ok(text)
    }
}

/// Embedding interface, injected wherever vectors are produced (probe,
/// intent classifier, knowledge ingestion, session indexing).
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;
}

// ── OpenAI-compatible backend ──────────────────────────────────────────────
// Works for: llama.cpp server (local), vLLM, transformers serving, Groq,
// OpenAI — anything speaking /chat/completions with SSE.

pub struct OpenAiCompatBackend {
    name: String,
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model_id: String,
    gpu_backed: bool,
    breaker: CircuitBreaker,
}

impl OpenAiCompatBackend {
    pub fn new(name: &str, cfg: &ModelConfig) -> Self {
        let api_key = if cfg.api_key_env.is_empty() {
            None
        } else {
            std::env::var(&cfg.api_key_env).ok()
        };
        OpenAiCompatBackend {
            name: name.to_string(),
            client: Client::new(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            model_id: cfg.model_id.clone(),
            gpu_backed: cfg.gpu_backed,
            breaker: CircuitBreaker::new(),
        }
    }

    /// Parse a single SSE data line from an OpenAI-compatible stream.
    fn parse_sse_data(data: &str) -> Option<StreamChunk> {
        if data == "[DONE]" {
            return None;
        }
        let v: Value = serde_json::from_str(data).ok()?;
        let choice = v["choices"].get(0);
        let delta_text = choice
            .and_then(|c| c["delta"]["content"].as_str())
            .map(|s| s.to_string());
        let finish_reason = choice
            .and_then(|c| c["finish_reason"].as_str())
            .map(|s| s.to_string());
        let usage = v.get("usage").and_then(|u| {
            let input = u["prompt_tokens"].as_u64().unwrap_or(0);
            let output = u["completion_tokens"].as_u64().unwrap_or(0);
            if input > 0 || output > 0 {
                Some(TokenUsage {
                    input_tokens: input,
                    output_tokens: output,
                    total_tokens: u["total_tokens"].as_u64().unwrap_or(input + output),
                })
            } else {
                None
            }
        });
        Some(StreamChunk { delta_text, finish_reason, usage })
    }

    fn request_body(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();
        let mut body = json!({
            "model": self.model_id,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(m) = req.max_tokens {
            body["max_tokens"] = json!(m);
        }
        body
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn gpu_backed(&self) -> bool {
        self.gpu_backed
    }

    async fn ensure_loaded(&self) -> EngineResult<()> {
        // A models listing doubles as a liveness probe on every
        // OpenAI-compatible runtime.
        let url = format!("{}/models", self.base_url);
        let resp = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| EngineError::provider(&self.name, format!("not reachable: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::provider(&self.name, format!("HTTP {}", resp.status().as_u16())))
        }
    }

    async fn chat_stream(
        &self,
        mut req: ChatRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> EngineResult<TokenUsage> {
        if self.breaker.is_open() {
            return Err(EngineError::provider(&self.name, "circuit breaker open"));
        }
        req.messages = sanitize_messages(&req.messages);
        clamp_params(&mut req);

        let url = format!("{}/chat/completions", self.base_url);
        let started = Instant::now();

        let mut builder = self.client.post(&url).json(&self.request_body(&req));
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                self.breaker.record_failure();
                return Err(EngineError::provider(&self.name, format!("request failed: {e}")));
            }
        };
        if !response.status().is_success() {
            self.breaker.record_failure();
            return Err(EngineError::provider(
                &self.name,
                format!("HTTP {}", response.status().as_u16()),
            ));
        }

        let mut usage = TokenUsage::default();
        let mut char_count = 0u64;
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        'outer: while let Some(item) = stream.next().await {
            let bytes = match item {
                Ok(b) => b,
                Err(e) => {
                    self.breaker.record_failure();
                    return Err(EngineError::provider(&self.name, format!("stream broke: {e}")));
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                let Some(data) = line.strip_prefix("data: ") else { continue };
                let Some(chunk) = Self::parse_sse_data(data) else { continue };
                if let Some(u) = &chunk.usage {
                    usage = u.clone();
                }
                if let Some(d) = &chunk.delta_text {
                    char_count += d.len() as u64;
                }
                // Receiver gone ⇒ caller cancelled (observer BLOCK); stop
                // pulling tokens.
                if tx.send(chunk).await.is_err() {
                    debug!("[pool] {} stream cancelled by receiver", self.name);
                    break 'outer;
                }
            }
        }

        if usage.total_tokens == 0 {
            // Runtime sent no usage — estimate so metrics stay populated.
            usage.output_tokens = char_count / 4;
            usage.total_tokens = usage.output_tokens;
        }
        self.breaker.record_success();
        info!(
            "[pool] {} completed in {}ms ({} in / {} out tokens)",
            self.name,
            started.elapsed().as_millis(),
            usage.input_tokens,
            usage.output_tokens
        );
        Ok(usage)
    }
}

// ── Gemini backend ─────────────────────────────────────────────────────────

pub struct GeminiBackend {
    name: String,
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model_id: String,
}

impl GeminiBackend {
    pub fn new(name: &str, cfg: &ModelConfig) -> Self {
        let api_key = if cfg.api_key_env.is_empty() {
            None
        } else {
            std::env::var(&cfg.api_key_env).ok()
        };
        GeminiBackend {
            name: name.to_string(),
            client: Client::new(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            model_id: cfg.model_id.clone(),
        }
    }
}

#[async_trait]
impl ModelBackend for GeminiBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn gpu_backed(&self) -> bool {
        false
    }

    async fn ensure_loaded(&self) -> EngineResult<()> {
        if self.api_key.is_none() {
            return Err(EngineError::provider(&self.name, "no API key configured"));
        }
        Ok(())
    }

    async fn chat_stream(
        &self,
        mut req: ChatRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> EngineResult<TokenUsage> {
        req.messages = sanitize_messages(&req.messages);
        clamp_params(&mut req);
        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| EngineError::provider(&self.name, "no API key configured"))?;

        // Gemini separates the system instruction from the turn contents.
        let system: Vec<&str> = req
            .messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect();
        let contents: Vec<Value> = req
            .messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| {
                let role = if m.role == "assistant" { "model" } else { "user" };
                json!({"role": role, "parts": [{"text": m.content}]})
            })
            .collect();

        let mut body = json!({"contents": contents});
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system.join("\n")}]});
        }
        let mut gen_cfg = json!({});
        if let Some(t) = req.temperature {
            gen_cfg["temperature"] = json!(t);
        }
        if let Some(m) = req.max_tokens {
            gen_cfg["maxOutputTokens"] = json!(m);
        }
        body["generationConfig"] = gen_cfg;

        let url = format!("{}/models/{}:generateContent", self.base_url, self.model_id);
        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::provider(&self.name, format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::provider(
                &self.name,
                format!("HTTP {}", response.status().as_u16()),
            ));
        }
        let v: Value = response
            .json()
            .await
            .map_err(|e| EngineError::provider(&self.name, format!("bad response: {e}")))?;

        let text = v["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        let usage = TokenUsage {
            input_tokens: v["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
            output_tokens: v["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0),
            total_tokens: v["usageMetadata"]["totalTokenCount"].as_u64().unwrap_or(0),
        };

        let _ = tx
            .send(StreamChunk {
                delta_text: Some(text),
                finish_reason: Some("stop".into()),
                usage: Some(usage.clone()),
            })
            .await;
        info!(
            "[pool] {} completed in {}ms ({} in / {} out tokens)",
            self.name,
            started.elapsed().as_millis(),
            usage.input_tokens,
            usage.output_tokens
        );
        Ok(usage)
    }
}

// ── Embedding backend (Ollama protocol) ────────────────────────────────────

pub struct EmbedBackend {
    name: String,
    client: Client,
    base_url: String,
    model_id: String,
}

impl EmbedBackend {
    pub fn new(name: &str, cfg: &ModelConfig) -> Self {
        EmbedBackend {
            name: name.to_string(),
            client: Client::new(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model_id: cfg.model_id.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Liveness check against the runtime's version endpoint.
    pub async fn is_reachable(&self) -> bool {
        let url = format!("{}/api/version", self.base_url);
        matches!(
            self.client.get(&url).timeout(Duration::from_secs(2)).send().await,
            Ok(r) if r.status().is_success()
        )
    }
}

#[async_trait]
impl TextEmbedder for EmbedBackend {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let body = json!({"model": self.model_id, "prompt": text});
        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(30))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::provider(&self.name, format!("embed failed: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::provider(
                &self.name,
                format!("embed HTTP {}", response.status().as_u16()),
            ));
        }
        let v: Value = response
            .json()
            .await
            .map_err(|e| EngineError::provider(&self.name, format!("bad embed response: {e}")))?;
        let vector = v["embedding"]
            .as_array()
            .ok_or_else(|| EngineError::provider(&self.name, "no embedding in response"))?
            .iter()
            .filter_map(|x| x.as_f64().map(|f| f as f32))
            .collect::<Vec<f32>>();
        if vector.is_empty() {
            return Err(EngineError::provider(&self.name, "empty embedding"));
        }
        Ok(vector)
    }
}

// ── Factory ────────────────────────────────────────────────────────────────

/// Tagged construction over the closed backend set. Embedder entries are
/// not chat backends and are built separately.
pub fn build_backend(name: &str, cfg: &ModelConfig) -> EngineResult<Arc<dyn ModelBackend>> {
    match cfg.backend {
        BackendKind::Local | BackendKind::Vllm | BackendKind::Hf => {
            Ok(Arc::new(OpenAiCompatBackend::new(name, cfg)))
        }
        BackendKind::Api => match cfg.flavor.as_str() {
            "gemini" => Ok(Arc::new(GeminiBackend::new(name, cfg))),
            "groq" | "openai" | "" => Ok(Arc::new(OpenAiCompatBackend::new(name, cfg))),
            other => {
                warn!("[pool] unknown api flavor '{}' for {}, using openai-compatible", other, name);
                Ok(Arc::new(OpenAiCompatBackend::new(name, cfg)))
            }
        },
        BackendKind::Embedder => Err(EngineError::Config(format!(
            "{name}: embedder entries are not chat backends"
        ))),
    }
}

// ── Test support ───────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Backend that replays scripted responses; records every request.
    pub struct ScriptedBackend {
        name: String,
        responses: Mutex<Vec<String>>,
        pub requests: Mutex<Vec<ChatRequest>>,
        pub fail: bool,
        gpu: bool,
    }

    impl ScriptedBackend {
        pub fn new(name: &str, responses: Vec<&str>) -> Self {
            ScriptedBackend {
                name: name.to_string(),
                responses: Mutex::new(responses.into_iter().map(String::from).rev().collect()),
                requests: Mutex::new(Vec::new()),
                fail: false,
                gpu: false,
            }
        }

        pub fn failing(name: &str) -> Self {
            ScriptedBackend {
                name: name.to_string(),
                responses: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
                fail: true,
                gpu: false,
            }
        }

        pub fn gpu(mut self) -> Self {
            self.gpu = true;
            self
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        fn name(&self) -> &str {
            &self.name
        }

        fn gpu_backed(&self) -> bool {
            self.gpu
        }

        async fn ensure_loaded(&self) -> EngineResult<()> {
            if self.fail {
                Err(EngineError::provider(&self.name, "scripted failure"))
            } else {
                Ok(())
            }
        }

        async fn chat_stream(
            &self,
            req: ChatRequest,
            tx: mpsc::Sender<StreamChunk>,
        ) -> EngineResult<TokenUsage> {
            if self.fail {
                return Err(EngineError::provider(&self.name, "scripted failure"));
            }
            self.requests.lock().push(req);
            let text = self.responses.lock().pop().unwrap_or_else(|| "ok".to_string());
            // Stream word by word so observers see multiple chunks
            for word in text.split_inclusive(' ') {
                if tx
                    .send(StreamChunk {
                        delta_text: Some(word.to_string()),
                        finish_reason: None,
                        usage: None,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let usage =
                TokenUsage { input_tokens: 10, output_tokens: 20, total_tokens: 30 };
            let _ = tx
                .send(StreamChunk {
                    delta_text: None,
                    finish_reason: Some("stop".into()),
                    usage: Some(usage.clone()),
                })
                .await;
            Ok(usage)
        }
    }

    /// Deterministic embedder: hashes tokens into a small dense vector.
    pub struct HashEmbedder;

    #[async_trait]
    impl TextEmbedder for HashEmbedder {
        async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
            let mut v = vec![0.0f32; 8];
            for (i, b) in text.bytes().enumerate() {
                v[(i + b as usize) % 8] += (b % 17) as f32 / 16.0;
            }
            Ok(v)
        }
    }
}
