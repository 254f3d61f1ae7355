use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::pin::Pin;

use crate::core::config::{Config, LlmProvider};

/// Incremental text fragments of one chat completion.
pub type FragmentStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn from_config(config: &Config, system: &str, user: &str) -> Self {
        Self {
            model: config.llm.model.clone(),
            system: system.to_string(),
            user: user.to_string(),
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn stream_chat(&self, request: &CompletionRequest) -> Result<FragmentStream>;
}

pub fn create_llm(config: &Config) -> Result<Box<dyn LlmClient>> {
    let provider = config.llm.provider;
    let api_key = config.llm.resolve_api_key();
    if let Some(env) = provider.api_key_env() {
        if api_key.is_none() {
            return Err(anyhow!(
                "No API key for LLM provider '{}'. Set llm.api_key or {}",
                provider.as_str(),
                env
            ));
        }
    }
    Ok(Box::new(ChatCompletionsClient::new(
        provider,
        &config.llm.base_url(),
        api_key,
    )))
}

// --- OpenAI-compatible chat completions (Gemini, DeepSeek, Ollama, OpenAI) ---

#[derive(Debug)]
struct ChatCompletionsClient {
    provider: LlmProvider,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ChatCompletionsClient {
    fn new(provider: LlmProvider, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

#[async_trait]
impl LlmClient for ChatCompletionsClient {
    async fn stream_chat(&self, request: &CompletionRequest) -> Result<FragmentStream> {
        let url = format!("{}/chat/completions", self.base_url);

        let body = ChatRequest {
            model: &request.model,
            messages: vec![
                ChatMessage { role: "system", content: &request.system },
                ChatMessage { role: "user", content: &request.user },
            ],
            stream: true,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        log::debug!(
            "Requesting streaming completion from {} ({})",
            self.provider.as_str(),
            request.model
        );
        let resp = builder
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(anyhow!(
                "{} API error ({}): {}",
                self.provider.as_str(),
                status,
                error_text
            ));
        }

        Ok(sse_fragments(resp.bytes_stream()))
    }
}

// --- Server-sent events ---

enum SseEvent {
    Fragment(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseEvent> {
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(SseEvent::Skip);
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(SseEvent::Skip);
    }
    if payload == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let chunk: ChatChunk = serde_json::from_str(payload)
        .map_err(|e| anyhow!("Malformed completion chunk: {}. Body: {}", e, payload))?;
    if let Some(err) = chunk.error {
        return Err(anyhow!("Completion stream returned error: {}", err.message));
    }

    let content = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .unwrap_or_default();
    if content.is_empty() {
        Ok(SseEvent::Skip)
    } else {
        Ok(SseEvent::Fragment(content))
    }
}

/// Splits a byte stream into lines without breaking multi-byte characters
/// that straddle chunk boundaries.
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(decode_line(&line));
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = decode_line(&self.buf);
        self.buf.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}

struct SseState<S> {
    bytes: Pin<Box<S>>,
    lines: LineBuffer,
    pending: VecDeque<Result<String>>,
    finished: bool,
}

impl<S> SseState<S> {
    /// Queues the events of `lines`; returns false once the stream is over.
    fn absorb(&mut self, lines: Vec<String>) -> bool {
        for line in lines {
            match parse_sse_line(&line) {
                Ok(SseEvent::Fragment(text)) => self.pending.push_back(Ok(text)),
                Ok(SseEvent::Skip) => {}
                Ok(SseEvent::Done) => return false,
                Err(e) => {
                    self.pending.push_back(Err(e));
                    return false;
                }
            }
        }
        true
    }
}

/// Turns the raw body of a streaming chat completion into text fragments.
pub fn sse_fragments<S, B, E>(bytes: S) -> FragmentStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    let state = SseState {
        bytes: Box::pin(bytes),
        lines: LineBuffer::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let lines = state.lines.push(chunk.as_ref());
                    state.finished = !state.absorb(lines);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    let err: anyhow::Error = e.into();
                    state.pending.push_back(Err(err.context("Completion stream interrupted")));
                }
                None => {
                    let tail = state.lines.finish().into_iter().collect();
                    state.absorb(tail);
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({ "choices": [{ "index": 0, "delta": { "content": content } }] })
        )
    }

    async fn collect(parts: Vec<Vec<u8>>) -> Vec<Result<String>> {
        let bytes = stream::iter(parts.into_iter().map(Ok::<_, std::io::Error>));
        sse_fragments(bytes).collect().await
    }

    #[tokio::test]
    async fn test_fragments_in_order_until_done() {
        let body = format!(
            "{}{}: keep-alive\n\ndata: {{\"choices\":[{{\"delta\":{{\"role\":\"assistant\"}}}}]}}\n\n{}data: [DONE]\n\n{}",
            chunk("Once"),
            chunk(" upon"),
            chunk(" a time."),
            chunk("ignored after done")
        );
        let results = collect(vec![body.into_bytes()]).await;
        let fragments: Vec<String> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(fragments, vec!["Once", " upon", " a time."]);
    }

    #[tokio::test]
    async fn test_chunk_boundaries_inside_lines_and_characters() {
        let body = chunk("Érase una vez\n\n").into_bytes();
        // Split inside the two-byte 'É' and inside the JSON.
        let (first, rest) = body.split_at(body.iter().position(|b| *b == 0xC3).unwrap() + 1);
        let (second, third) = rest.split_at(10);
        let results = collect(vec![first.to_vec(), second.to_vec(), third.to_vec()]).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), "Érase una vez\n\n");
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_read() {
        let body = format!("data: {}", serde_json::json!({ "choices": [{ "delta": { "content": "end" } }] }));
        let results = collect(vec![body.into_bytes()]).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), "end");
    }

    #[tokio::test]
    async fn test_error_event_ends_stream() {
        let body = format!(
            "{}data: {{\"error\":{{\"message\":\"quota exceeded\"}}}}\n\n{}",
            chunk("Hi"),
            chunk("never")
        );
        let results = collect(vec![body.into_bytes()]).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), "Hi");
        let err = results[1].as_ref().unwrap_err().to_string();
        assert!(err.contains("quota exceeded"));
    }

    #[test]
    fn test_malformed_chunk_is_an_error() {
        assert!(parse_sse_line("data: {not json").is_err());
        assert!(matches!(parse_sse_line("event: ping"), Ok(SseEvent::Skip)));
    }

    #[test]
    fn test_create_llm_requires_key_for_hosted_providers() {
        let mut config = Config::default();
        config.llm.provider = LlmProvider::Ollama;
        assert!(create_llm(&config).is_ok());

        config.llm.provider = LlmProvider::Deepseek;
        config.llm.api_key = Some("sk-test".to_string());
        assert!(create_llm(&config).is_ok());
    }
}
