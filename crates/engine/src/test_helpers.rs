//! Shared test helpers: scripted backends and a predictable tokenizer.

use promptloom_core::backend::{
    Backend, BackendFamily, BackendRequest, BackendResponse, ChatChoice, ChunkReceiver, StreamChunk,
};
use promptloom_core::error::BackendError;
use promptloom_core::message::MessageToolCall;
use promptloom_core::tokenizer::TokenCounter;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// One token per whitespace-separated word.
pub struct WordCounter;

impl TokenCounter for WordCounter {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// A mock backend that returns a sequence of scripted batch responses.
///
/// Each call to `generate` returns the next response in the queue.
/// Panics if more calls are made than responses provided.
pub struct SequentialMockBackend {
    family: BackendFamily,
    responses: Mutex<Vec<Result<BackendResponse, BackendError>>>,
    requests: Mutex<Vec<BackendRequest>>,
}

impl SequentialMockBackend {
    pub fn new(family: BackendFamily, responses: Vec<Result<BackendResponse, BackendError>>) -> Self {
        Self {
            family,
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A text-completion backend answering once with `text`.
    pub fn single_text(text: &str) -> Self {
        Self::new(BackendFamily::TextGen, vec![Ok(make_text_response(&[text]))])
    }

    /// A chat backend that first returns tool calls, then a final answer.
    pub fn tool_then_answer(tool_calls: Vec<MessageToolCall>, thought: &str, answer: &str) -> Self {
        Self::new(
            BackendFamily::OpenAi,
            vec![
                Ok(make_tool_call_response(tool_calls, thought)),
                Ok(make_chat_response(answer)),
            ],
        )
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Backend for SequentialMockBackend {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    fn family(&self) -> BackendFamily {
        self.family
    }

    async fn generate(&self, request: BackendRequest) -> Result<BackendResponse, BackendError> {
        let mut requests = self.requests.lock().unwrap();
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            panic!(
                "SequentialMockBackend: no more responses (call #{})",
                requests.len()
            );
        }
        requests.push(request);
        responses.remove(0)
    }
}

/// A mock backend that streams scripted cumulative chunks.
///
/// Each call to `stream` plays the next script; chunks are spaced by `delay`.
pub struct ScriptedStreamBackend {
    family: BackendFamily,
    scripts: Mutex<Vec<Vec<Result<StreamChunk, BackendError>>>>,
    delay: Duration,
    requests: Mutex<Vec<BackendRequest>>,
}

impl ScriptedStreamBackend {
    pub fn new(family: BackendFamily, scripts: Vec<Vec<Result<StreamChunk, BackendError>>>) -> Self {
        Self {
            family,
            scripts: Mutex::new(scripts),
            delay: Duration::from_millis(5),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Text chunks, the last one marked final.
    pub fn chunks(texts: &[&str]) -> Self {
        let last = texts.len().saturating_sub(1);
        let script = texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                Ok(StreamChunk {
                    done: i == last,
                    ..StreamChunk::text(*t)
                })
            })
            .collect();
        Self::new(BackendFamily::TextGen, vec![script])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Backend for ScriptedStreamBackend {
    fn name(&self) -> &str {
        "scripted_stream"
    }

    fn family(&self) -> BackendFamily {
        self.family
    }

    async fn generate(&self, _request: BackendRequest) -> Result<BackendResponse, BackendError> {
        Err(BackendError::Unsupported {
            backend: "scripted_stream".into(),
            reason: "batch generation".into(),
        })
    }

    async fn stream(&self, request: BackendRequest) -> Result<ChunkReceiver, BackendError> {
        self.requests.lock().unwrap().push(request);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                panic!("ScriptedStreamBackend: no more scripts");
            }
            scripts.remove(0)
        };

        let (tx, rx) = mpsc::channel(16);
        let delay = self.delay;
        tokio::spawn(async move {
            for chunk in script {
                tokio::time::sleep(delay).await;
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// A text-completion response; the first text is primary, the rest are extra candidates.
pub fn make_text_response(texts: &[&str]) -> BackendResponse {
    BackendResponse::TextGen {
        model: "mock-model".into(),
        choices: texts.iter().map(|t| t.to_string()).collect(),
        usage: None,
    }
}

/// A chat-completion response with plain content.
pub fn make_chat_response(text: &str) -> BackendResponse {
    BackendResponse::OpenAi {
        model: "mock-model".into(),
        choices: vec![ChatChoice {
            content: text.into(),
            ..ChatChoice::default()
        }],
        usage: None,
    }
}

/// A chat-completion response carrying tool calls and optional visible text.
pub fn make_tool_call_response(tool_calls: Vec<MessageToolCall>, thought: &str) -> BackendResponse {
    BackendResponse::OpenAi {
        model: "mock-model".into(),
        choices: vec![ChatChoice {
            content: thought.into(),
            tool_calls,
            ..ChatChoice::default()
        }],
        usage: None,
    }
}

/// Helper to create a tool call.
pub fn make_tool_call(name: &str, args: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments: serde_json::to_string(&args).unwrap(),
    }
}
