//! OpenAI-compatible chat-completion backend.
//!
//! Works with: OpenAI, OpenRouter, DeepSeek, Groq, Ollama, vLLM, llama.cpp
//! server, and any other endpoint exposing `/v1/chat/completions`.
//!
//! Supports:
//! - Batch and streaming (SSE) completions
//! - Multiple candidates per request (`n`), surfaced as extra swipes
//! - Tool calling, reasoning text, and inline images
//! - Structured output via `response_format`

use crate::sse::{SseDecoder, SseEvent, check_status, network_error};
use async_trait::async_trait;
use futures::StreamExt;
use promptloom_core::backend::*;
use promptloom_core::error::BackendError;
use promptloom_core::message::{MessageToolCall, PromptMessage, PromptRole};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// An OpenAI-compatible chat backend.
pub struct OpenAiCompatBackend {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatBackend {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key)
    }

    fn to_api_messages(messages: &[PromptMessage]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.as_str().into(),
                content: Some(m.content.clone()),
                name: m.name.clone(),
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|tc| ApiToolCall {
                                id: tc.id.clone(),
                                r#type: "function".into(),
                                function: ApiFunction {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: m.tool_call_id.clone(),
            })
            .collect()
    }

    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn request_body(request: &ChatRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": stream,
        });

        if request.n > 1 {
            body["n"] = serde_json::json!(request.n);
        }
        if !request.stop.is_empty() {
            body["stop"] = serde_json::json!(request.stop);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }
        if let Some(schema) = &request.json_schema {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": { "name": "response", "strict": true, "schema": schema },
            });
        }
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }

    fn chat_request(request: BackendRequest) -> Result<ChatRequest, BackendError> {
        match request {
            BackendRequest::Chat(req) => Ok(req),
            BackendRequest::Text(_) => Err(BackendError::Unsupported {
                backend: "openai".into(),
                reason: "text-completion prompts require a text backend".into(),
            }),
        }
    }

    async fn post(
        &self,
        body: &serde_json::Value,
        stream: bool,
    ) -> Result<reqwest::Response, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        let response = builder.json(body).send().await.map_err(network_error)?;
        check_status(response, &self.name).await
    }
}

fn parse_response(api_response: ApiResponse) -> Result<BackendResponse, BackendError> {
    if api_response.choices.is_empty() {
        return Err(BackendError::InvalidResponse("No choices in response".into()));
    }

    let mut indexed: Vec<_> = api_response.choices.into_iter().collect();
    indexed.sort_by_key(|c| c.index);

    let choices = indexed
        .into_iter()
        .map(|choice| ChatChoice {
            content: choice.message.content.unwrap_or_default(),
            reasoning: choice
                .message
                .reasoning_content
                .or(choice.message.reasoning)
                .filter(|r| !r.is_empty()),
            tool_calls: choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| MessageToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments: tc.function.arguments,
                })
                .collect(),
            image: choice
                .message
                .images
                .and_then(|images| images.into_iter().next())
                .map(|img| img.image_url.url),
        })
        .collect();

    Ok(BackendResponse::OpenAi {
        model: api_response.model,
        choices,
        usage: api_response.usage.map(Usage::from),
    })
}

/// Streaming accumulation state: cumulative text per candidate index.
#[derive(Default)]
struct StreamState {
    texts: BTreeMap<u32, String>,
    reasoning: String,
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
}

impl StreamState {
    /// Fold one SSE payload in. Returns `Some(usage)` when the payload was
    /// the trailing usage report.
    fn apply(&mut self, resp: StreamResponse) -> (Vec<TokenLogprob>, Option<Usage>) {
        let mut logprobs = Vec::new();

        for choice in resp.choices {
            let delta = choice.delta;
            if let Some(content) = delta.content {
                self.texts.entry(choice.index).or_default().push_str(&content);
            }
            if choice.index == 0 {
                if let Some(r) = delta.reasoning_content.or(delta.reasoning) {
                    self.reasoning.push_str(&r);
                }
                if let Some(lp) = choice.logprobs {
                    logprobs.extend(lp.content.into_iter().map(|t| TokenLogprob {
                        token: t.token,
                        logprob: t.logprob,
                    }));
                }
                for tc_delta in delta.tool_calls.unwrap_or_default() {
                    let acc = self.tool_calls.entry(tc_delta.index).or_default();
                    if let Some(id) = tc_delta.id {
                        acc.id = id;
                    }
                    if let Some(func) = tc_delta.function {
                        if let Some(name) = func.name {
                            acc.name = name;
                        }
                        if let Some(args) = func.arguments {
                            acc.arguments.push_str(&args);
                        }
                    }
                }
            }
        }

        (logprobs, resp.usage.map(Usage::from))
    }

    fn chunk(&self, logprobs: Vec<TokenLogprob>, done: bool, usage: Option<Usage>) -> StreamChunk {
        StreamChunk {
            text: self.texts.get(&0).cloned().unwrap_or_default(),
            swipes: self
                .texts
                .iter()
                .filter(|(index, _)| **index > 0)
                .map(|(_, text)| text.clone())
                .collect(),
            logprobs,
            tool_calls: if done {
                self.tool_calls.values().map(ToolCallAccumulator::to_tool_call).collect()
            } else {
                Vec::new()
            },
            reasoning: Some(self.reasoning.clone()).filter(|r| !r.is_empty()),
            done,
            usage,
        }
    }
}

#[async_trait]
impl Backend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> BackendFamily {
        BackendFamily::OpenAi
    }

    async fn generate(&self, request: BackendRequest) -> Result<BackendResponse, BackendError> {
        let request = Self::chat_request(request)?;
        let body = Self::request_body(&request, false);

        debug!(backend = %self.name, model = %request.model, n = request.n, "Sending chat completion request");

        let response = self.post(&body, false).await?;
        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        parse_response(api_response)
    }

    async fn stream(&self, request: BackendRequest) -> Result<ChunkReceiver, BackendError> {
        let request = Self::chat_request(request)?;
        let body = Self::request_body(&request, true);

        debug!(backend = %self.name, model = %request.model, "Sending streaming chat request");

        let response = self.post(&body, true).await?;
        let (tx, rx) = mpsc::channel(64);
        let backend_name = self.name.clone();

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut state = StreamState::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(BackendError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for event in decoder.push(&bytes) {
                    let data = match event {
                        SseEvent::Done => {
                            let _ = tx.send(Ok(state.chunk(Vec::new(), true, None))).await;
                            return;
                        }
                        SseEvent::Data(data) => data,
                    };

                    match serde_json::from_str::<StreamResponse>(&data) {
                        Ok(resp) => {
                            let has_choices = !resp.choices.is_empty();
                            let (logprobs, usage) = state.apply(resp);

                            // usage arrives in its own trailing chunk
                            if usage.is_some() && !has_choices {
                                let _ = tx.send(Ok(state.chunk(logprobs, true, usage))).await;
                                return;
                            }
                            if tx.send(Ok(state.chunk(logprobs, false, None))).await.is_err() {
                                return; // receiver dropped
                            }
                        }
                        Err(e) => {
                            trace!(backend = %backend_name, data = %data, error = %e, "Ignoring unparseable SSE chunk");
                        }
                    }
                }
            }

            // Stream ended without [DONE]
            let _ = tx.send(Ok(state.chunk(Vec::new(), true, None))).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<bool, BackendError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(network_error)?;

        Ok(response.status().is_success())
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    #[serde(default)]
    index: u32,
    message: ApiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default)]
    images: Option<Vec<ApiImage>>,
}

#[derive(Debug, Deserialize)]
struct ApiImage {
    image_url: ApiImageUrl,
}

#[derive(Debug, Deserialize)]
struct ApiImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

// --- Streaming SSE types ---

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    index: u32,
    delta: StreamDelta,
    #[serde(default)]
    logprobs: Option<StreamLogprobs>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct StreamLogprobs {
    #[serde(default)]
    content: Vec<StreamTokenLogprob>,
}

#[derive(Debug, Deserialize)]
struct StreamTokenLogprob {
    token: String,
    logprob: f32,
}

/// A tool call delta. Arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn to_tool_call(&self) -> MessageToolCall {
        MessageToolCall {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![
                PromptMessage::system("Be Seraphina."),
                PromptMessage::user("Hi").with_name("Alice"),
            ],
            max_tokens: 300,
            temperature: 0.7,
            stop: vec!["\nAlice:".into()],
            n: 2,
            stream: false,
            tools: vec![],
            json_schema: None,
        }
    }

    #[test]
    fn openrouter_constructor() {
        let backend = OpenAiCompatBackend::openrouter("sk-test");
        assert_eq!(backend.name(), "openrouter");
        assert!(backend.base_url.contains("openrouter.ai"));
        assert_eq!(backend.family(), BackendFamily::OpenAi);
    }

    #[test]
    fn message_conversion_keeps_names() {
        let api = OpenAiCompatBackend::to_api_messages(&request().messages);
        assert_eq!(api[0].role, "system");
        assert_eq!(api[1].role, "user");
        assert_eq!(api[1].name.as_deref(), Some("Alice"));
    }

    #[test]
    fn message_conversion_tool_response() {
        let msg = PromptMessage::tool_result("call_1", "result data");
        let api = OpenAiCompatBackend::to_api_messages(&[msg]);
        assert_eq!(api[0].role, PromptRole::Tool.as_str());
        assert_eq!(api[0].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn body_includes_n_stop_and_schema() {
        let mut req = request();
        req.json_schema = Some(serde_json::json!({"type": "object"}));
        let body = OpenAiCompatBackend::request_body(&req, true);
        assert_eq!(body["n"], 2);
        assert_eq!(body["stop"][0], "\nAlice:");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn text_request_is_rejected() {
        let req = BackendRequest::Text(TextRequest {
            model: "m".into(),
            prompt: "p".into(),
            max_tokens: 1,
            max_context: 10,
            temperature: 1.0,
            stop: vec![],
            n: 1,
            stream: false,
            negative_prompt: None,
            guidance_scale: None,
            json_schema: None,
        });
        assert!(matches!(
            OpenAiCompatBackend::chat_request(req),
            Err(BackendError::Unsupported { .. })
        ));
    }

    #[test]
    fn parse_batch_response_with_candidates() {
        let data = r#"{
            "model": "gpt-4o-mini",
            "choices": [
                {"index": 1, "message": {"role": "assistant", "content": "Second"}},
                {"index": 0, "message": {"role": "assistant", "content": "First", "reasoning_content": "hmm",
                  "images": [{"image_url": {"url": "data:image/png;base64,AAA"}}]}}
            ],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let parsed = parse_response(serde_json::from_str(data).unwrap()).unwrap();
        assert_eq!(parsed.message(), "First");
        assert_eq!(parsed.multi_swipes(), vec!["Second"]);
        assert_eq!(parsed.reasoning(), "hmm");
        assert_eq!(parsed.image().as_deref(), Some("data:image/png;base64,AAA"));
    }

    #[test]
    fn parse_batch_response_without_choices_fails() {
        let data = r#"{"model": "x", "choices": []}"#;
        assert!(parse_response(serde_json::from_str(data).unwrap()).is_err());
    }

    #[test]
    fn stream_state_accumulates_cumulative_text() {
        let mut state = StreamState::default();
        for data in [
            r#"{"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"index":1,"delta":{"content":"Hey"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":"lo"}}]}"#,
        ] {
            state.apply(serde_json::from_str(data).unwrap());
        }
        let chunk = state.chunk(vec![], false, None);
        assert_eq!(chunk.text, "Hello");
        assert_eq!(chunk.swipes, vec!["Hey"]);
        assert!(!chunk.done);
    }

    #[test]
    fn stream_state_assembles_tool_calls_on_done() {
        let mut state = StreamState::default();
        for data in [
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_abc","function":{"name":"roll","arguments":"{\"sides\""}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":": 20}"}}]}}]}"#,
        ] {
            state.apply(serde_json::from_str(data).unwrap());
        }
        assert!(state.chunk(vec![], false, None).tool_calls.is_empty());
        let done = state.chunk(vec![], true, None);
        assert_eq!(done.tool_calls.len(), 1);
        assert_eq!(done.tool_calls[0].name, "roll");
        assert_eq!(done.tool_calls[0].arguments, "{\"sides\": 20}");
    }

    #[test]
    fn stream_state_collects_reasoning_and_logprobs() {
        let mut state = StreamState::default();
        let (logprobs, usage) = state.apply(
            serde_json::from_str(
                r#"{"choices":[{"index":0,"delta":{"reasoning_content":"think"},"logprobs":{"content":[{"token":"Hi","logprob":-0.5}]}}]}"#,
            )
            .unwrap(),
        );
        assert_eq!(logprobs.len(), 1);
        assert!(usage.is_none());
        assert_eq!(state.chunk(vec![], false, None).reasoning.as_deref(), Some("think"));
    }

    #[test]
    fn stream_usage_chunk() {
        let mut state = StreamState::default();
        let (_, usage) = state.apply(
            serde_json::from_str(
                r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
            )
            .unwrap(),
        );
        assert_eq!(usage.unwrap().total_tokens, 15);
    }
}
