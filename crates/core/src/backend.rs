//! Backend trait: the abstraction over language-model inference servers.
//!
//! A backend knows how to send an assembled prompt to a model and get the
//! result back, either as a complete response or as a stream of cumulative
//! text chunks.
//!
//! Request and response shapes differ per backend family. They are modeled as
//! closed tagged unions (`BackendRequest`, `BackendResponse`) so the engine
//! never inspects untyped JSON; adapters map to and from their wire formats.

use crate::error::BackendError;
use crate::message::{MessageToolCall, PromptMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;

/// The family of backend an adapter talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendFamily {
    /// KoboldAI / KoboldCpp text generation
    Kobold,
    /// text-generation-webui and other OpenAI-style `/v1/completions` servers
    #[default]
    TextGen,
    /// NovelAI hosted text generation
    Novel,
    /// OpenAI-compatible chat completions
    OpenAi,
}

impl BackendFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kobold => "kobold",
            Self::TextGen => "textgen",
            Self::Novel => "novel",
            Self::OpenAi => "openai",
        }
    }

    /// Chat-completion backends take role-tagged messages instead of a flat prompt.
    pub fn is_chat(&self) -> bool {
        matches!(self, Self::OpenAi)
    }
}

impl fmt::Display for BackendFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kobold" | "koboldcpp" => Ok(Self::Kobold),
            "textgen" | "textgenerationwebui" | "ooba" => Ok(Self::TextGen),
            "novel" | "novelai" => Ok(Self::Novel),
            "openai" | "chat" => Ok(Self::OpenAi),
            other => Err(format!("unknown backend family '{other}'")),
        }
    }
}

/// A tool definition sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A flat-prompt request for text-completion backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRequest {
    pub model: String,
    pub prompt: String,
    /// Maximum tokens to generate
    pub max_tokens: u32,
    /// Context window the prompt was assembled for
    pub max_context: u32,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    /// Number of candidates to generate
    #[serde(default = "default_n")]
    pub n: u32,
    #[serde(default)]
    pub stream: bool,
    /// Classifier-free guidance negative prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f32>,
    /// Structured-output schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<serde_json::Value>,
}

/// A role-tagged request for chat-completion backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default = "default_n")]
    pub n: u32,
    #[serde(default)]
    pub stream: bool,
    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<serde_json::Value>,
}

fn default_n() -> u32 {
    1
}

/// A generation request, keyed by prompt shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendRequest {
    Text(TextRequest),
    Chat(ChatRequest),
}

impl BackendRequest {
    pub fn is_stream(&self) -> bool {
        match self {
            Self::Text(r) => r.stream,
            Self::Chat(r) => r.stream,
        }
    }

    pub fn set_stream(&mut self, stream: bool) {
        match self {
            Self::Text(r) => r.stream = stream,
            Self::Chat(r) => r.stream = stream,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Self::Text(r) => &r.model,
            Self::Chat(r) => &r.model,
        }
    }

    pub fn stop(&self) -> &[String] {
        match self {
            Self::Text(r) => &r.stop,
            Self::Chat(r) => &r.stop,
        }
    }
}

/// Token usage information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One candidate of a chat-completion response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// A complete (batch) response, keyed by backend family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum BackendResponse {
    Kobold {
        results: Vec<String>,
    },
    TextGen {
        model: String,
        choices: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Novel {
        output: String,
    },
    OpenAi {
        model: String,
        choices: Vec<ChatChoice>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
}

impl BackendResponse {
    pub fn family(&self) -> BackendFamily {
        match self {
            Self::Kobold { .. } => BackendFamily::Kobold,
            Self::TextGen { .. } => BackendFamily::TextGen,
            Self::Novel { .. } => BackendFamily::Novel,
            Self::OpenAi { .. } => BackendFamily::OpenAi,
        }
    }

    /// Text of the primary candidate.
    pub fn message(&self) -> String {
        match self {
            Self::Kobold { results } => results.first().cloned().unwrap_or_default(),
            Self::TextGen { choices, .. } => choices.first().cloned().unwrap_or_default(),
            Self::Novel { output } => output.clone(),
            Self::OpenAi { choices, .. } => {
                choices.first().map(|c| c.content.clone()).unwrap_or_default()
            }
        }
    }

    /// Texts of the additional candidates (`n > 1`), primary excluded.
    pub fn multi_swipes(&self) -> Vec<String> {
        match self {
            Self::Kobold { results } => results.iter().skip(1).cloned().collect(),
            Self::TextGen { choices, .. } => choices.iter().skip(1).cloned().collect(),
            Self::Novel { .. } => Vec::new(),
            Self::OpenAi { choices, .. } => {
                choices.iter().skip(1).map(|c| c.content.clone()).collect()
            }
        }
    }

    /// Reasoning text of the primary candidate (empty when none).
    pub fn reasoning(&self) -> String {
        match self {
            Self::OpenAi { choices, .. } => choices
                .first()
                .and_then(|c| c.reasoning.clone())
                .unwrap_or_default(),
            _ => String::new(),
        }
    }

    /// Image attached to the primary candidate, if any.
    pub fn image(&self) -> Option<String> {
        match self {
            Self::OpenAi { choices, .. } => choices.first().and_then(|c| c.image.clone()),
            _ => None,
        }
    }

    /// Tool calls requested by the primary candidate.
    pub fn tool_calls(&self) -> Vec<MessageToolCall> {
        match self {
            Self::OpenAi { choices, .. } => choices
                .first()
                .map(|c| c.tool_calls.clone())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Model identifier reported by the backend, if it reports one.
    pub fn model(&self) -> Option<&str> {
        match self {
            Self::TextGen { model, .. } | Self::OpenAi { model, .. } => Some(model),
            _ => None,
        }
    }
}

/// Log-probability of a single generated token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenLogprob {
    pub token: String,
    pub logprob: f32,
}

/// One step of a streaming response.
///
/// Unlike wire-level deltas, `text` is **cumulative**: every chunk carries the
/// whole reply generated so far. Adapters accumulate deltas before sending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Cumulative text of the primary candidate
    #[serde(default)]
    pub text: String,

    /// Cumulative texts of additional candidates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub swipes: Vec<String>,

    /// Log-probabilities of tokens received in this step
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logprobs: Vec<TokenLogprob>,

    /// Tool calls assembled so far
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// Cumulative reasoning text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamChunk {
    /// A cumulative text chunk.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// Receiving half of a streaming response.
///
/// Dropping the receiver cancels the request: the adapter's reader task stops
/// as soon as its next send fails.
pub type ChunkReceiver = mpsc::Receiver<Result<StreamChunk, BackendError>>;

/// The core Backend trait.
///
/// Every inference backend implements this trait. Exactly one adapter is
/// active at a time; the pipeline calls `generate()` or `stream()` without
/// knowing which one it is.
#[async_trait]
pub trait Backend: Send + Sync {
    /// A human-readable name for this adapter (e.g., "koboldcpp", "openrouter").
    fn name(&self) -> &str;

    /// Which family this adapter speaks.
    fn family(&self) -> BackendFamily;

    /// Send a request and get a complete response.
    async fn generate(&self, request: BackendRequest) -> Result<BackendResponse, BackendError>;

    /// Send a request and get a stream of cumulative chunks.
    ///
    /// Default implementation calls `generate()` and wraps the result as a
    /// single final chunk.
    async fn stream(&self, request: BackendRequest) -> Result<ChunkReceiver, BackendError> {
        let response = self.generate(request).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx
            .send(Ok(StreamChunk {
                text: response.message(),
                swipes: response.multi_swipes(),
                tool_calls: response.tool_calls(),
                reasoning: Some(response.reasoning()).filter(|r| !r.is_empty()),
                done: true,
                ..StreamChunk::default()
            }))
            .await;
        Ok(rx)
    }

    fn extract_message(&self, response: &BackendResponse) -> String {
        response.message()
    }

    fn extract_multi_swipes(&self, response: &BackendResponse) -> Vec<String> {
        response.multi_swipes()
    }

    fn extract_reasoning(&self, response: &BackendResponse) -> String {
        response.reasoning()
    }

    fn extract_image(&self, response: &BackendResponse) -> Option<String> {
        response.image()
    }

    /// Health check: can we reach the backend?
    async fn health_check(&self) -> Result<bool, BackendError> {
        Ok(true)
    }
}
