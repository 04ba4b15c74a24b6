//! Text-completion backends: flat prompt in, continuation out.
//!
//! One adapter covers three wire flavors:
//! - **KoboldAI / KoboldCpp**: `/api/v1/generate`, streaming via `/api/extra/generate/stream`
//! - **text-generation-webui** and other `/v1/completions` servers
//! - **NovelAI**: `/ai/generate`, streaming via `/ai/generate-stream`
//!
//! All three stream deltas over SSE; the adapter turns them into cumulative
//! [`StreamChunk`]s.

use crate::sse::{SseDecoder, SseEvent, check_status, network_error};
use async_trait::async_trait;
use futures::StreamExt;
use promptloom_core::backend::*;
use promptloom_core::error::BackendError;
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A text-completion backend of one of the flat-prompt families.
pub struct TextCompletionBackend {
    family: BackendFamily,
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl TextCompletionBackend {
    /// Create an adapter for `family`. Returns `Unsupported` for chat families.
    pub fn new(
        family: BackendFamily,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, BackendError> {
        if family.is_chat() {
            return Err(BackendError::Unsupported {
                backend: family.to_string(),
                reason: "chat-completion family needs the OpenAI-compatible adapter".into(),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .expect("Failed to create HTTP client");

        Ok(Self {
            family,
            name: family.as_str().to_string(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    pub fn koboldcpp(base_url: Option<&str>) -> Result<Self, BackendError> {
        Self::new(
            BackendFamily::Kobold,
            base_url.unwrap_or("http://127.0.0.1:5001"),
            "",
        )
    }

    pub fn textgen(base_url: Option<&str>) -> Result<Self, BackendError> {
        Self::new(
            BackendFamily::TextGen,
            base_url.unwrap_or("http://127.0.0.1:5000"),
            "",
        )
    }

    pub fn novelai(api_key: impl Into<String>) -> Result<Self, BackendError> {
        Self::new(BackendFamily::Novel, "https://api.novelai.net", api_key)
    }

    fn text_request(&self, request: BackendRequest) -> Result<TextRequest, BackendError> {
        match request {
            BackendRequest::Text(req) => Ok(req),
            BackendRequest::Chat(_) => Err(BackendError::Unsupported {
                backend: self.name.clone(),
                reason: "role-tagged chat prompts".into(),
            }),
        }
    }

    fn endpoint(&self, stream: bool) -> String {
        let path = match (self.family, stream) {
            (BackendFamily::Kobold, false) => "/api/v1/generate",
            (BackendFamily::Kobold, true) => "/api/extra/generate/stream",
            (BackendFamily::Novel, false) => "/ai/generate",
            (BackendFamily::Novel, true) => "/ai/generate-stream",
            _ => "/v1/completions",
        };
        format!("{}{}", self.base_url, path)
    }

    /// Build the family-specific request body.
    fn request_body(&self, request: &TextRequest, stream: bool) -> serde_json::Value {
        match self.family {
            BackendFamily::Kobold => {
                let mut body = serde_json::json!({
                    "prompt": request.prompt,
                    "max_length": request.max_tokens,
                    "max_context_length": request.max_context,
                    "temperature": request.temperature,
                    "stop_sequence": request.stop,
                    "n": request.n,
                    "use_default_badwordsids": false,
                });
                if let Some(schema) = &request.json_schema {
                    body["json_schema"] = schema.clone();
                }
                body
            }
            BackendFamily::Novel => {
                let mut parameters = serde_json::json!({
                    "max_length": request.max_tokens,
                    "temperature": request.temperature,
                    "stop_sequences": request.stop,
                    "use_string": true,
                    "generate_until_sentence": true,
                });
                if let (Some(negative), Some(scale)) = (&request.negative_prompt, request.guidance_scale)
                {
                    parameters["cfg_uc"] = serde_json::json!(negative);
                    parameters["cfg_scale"] = serde_json::json!(scale);
                }
                serde_json::json!({
                    "input": request.prompt,
                    "model": request.model,
                    "parameters": parameters,
                })
            }
            _ => {
                let mut body = serde_json::json!({
                    "prompt": request.prompt,
                    "max_tokens": request.max_tokens,
                    "truncation_length": request.max_context,
                    "temperature": request.temperature,
                    "stop": request.stop,
                    "n": request.n,
                    "stream": stream,
                });
                if !request.model.is_empty() {
                    body["model"] = serde_json::json!(request.model);
                }
                if let (Some(negative), Some(scale)) = (&request.negative_prompt, request.guidance_scale)
                {
                    body["negative_prompt"] = serde_json::json!(negative);
                    body["guidance_scale"] = serde_json::json!(scale);
                }
                if let Some(schema) = &request.json_schema {
                    body["json_schema"] = schema.clone();
                }
                body
            }
        }
    }

    async fn post(
        &self,
        body: &serde_json::Value,
        stream: bool,
    ) -> Result<reqwest::Response, BackendError> {
        let mut builder = self
            .client
            .post(self.endpoint(stream))
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

    fn parse_response(&self, raw: serde_json::Value) -> Result<BackendResponse, BackendError> {
        let invalid = |e: serde_json::Error| BackendError::InvalidResponse(e.to_string());
        match self.family {
            BackendFamily::Kobold => {
                let resp: KoboldResponse = serde_json::from_value(raw).map_err(invalid)?;
                Ok(BackendResponse::Kobold {
                    results: resp.results.into_iter().map(|r| r.text).collect(),
                })
            }
            BackendFamily::Novel => {
                let resp: NovelResponse = serde_json::from_value(raw).map_err(invalid)?;
                Ok(BackendResponse::Novel {
                    output: resp.output,
                })
            }
            _ => {
                let mut resp: CompletionResponse = serde_json::from_value(raw).map_err(invalid)?;
                resp.choices.sort_by_key(|c| c.index);
                Ok(BackendResponse::TextGen {
                    model: resp.model,
                    choices: resp.choices.into_iter().map(|c| c.text).collect(),
                    usage: resp.usage.map(|u| Usage {
                        prompt_tokens: u.prompt_tokens,
                        completion_tokens: u.completion_tokens,
                        total_tokens: u.total_tokens,
                    }),
                })
            }
        }
    }
}

/// Fold one streamed payload into the per-candidate accumulators.
///
/// Returns `true` when the payload marks the end of the stream.
fn apply_stream_payload(
    family: BackendFamily,
    data: &str,
    texts: &mut BTreeMap<u32, String>,
    logprobs: &mut Vec<TokenLogprob>,
) -> Result<bool, serde_json::Error> {
    match family {
        BackendFamily::Kobold => {
            let event: KoboldStreamEvent = serde_json::from_str(data)?;
            texts.entry(0).or_default().push_str(&event.token);
            Ok(event.finish_reason.is_some_and(|r| r != "null"))
        }
        BackendFamily::Novel => {
            let event: NovelStreamEvent = serde_json::from_str(data)?;
            texts.entry(0).or_default().push_str(&event.token);
            Ok(event.r#final)
        }
        _ => {
            let event: CompletionStreamEvent = serde_json::from_str(data)?;
            for choice in event.choices {
                texts.entry(choice.index).or_default().push_str(&choice.text);
                if choice.index == 0
                    && let Some(lp) = choice.logprobs
                {
                    for (token, logprob) in lp.tokens.into_iter().zip(lp.token_logprobs) {
                        logprobs.push(TokenLogprob { token, logprob });
                    }
                }
            }
            Ok(false)
        }
    }
}

fn cumulative_chunk(
    texts: &BTreeMap<u32, String>,
    logprobs: Vec<TokenLogprob>,
    done: bool,
) -> StreamChunk {
    StreamChunk {
        text: texts.get(&0).cloned().unwrap_or_default(),
        swipes: texts
            .iter()
            .filter(|(index, _)| **index > 0)
            .map(|(_, text)| text.clone())
            .collect(),
        logprobs,
        done,
        ..StreamChunk::default()
    }
}

#[async_trait]
impl Backend for TextCompletionBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> BackendFamily {
        self.family
    }

    async fn generate(&self, request: BackendRequest) -> Result<BackendResponse, BackendError> {
        let request = self.text_request(request)?;
        let body = self.request_body(&request, false);

        debug!(
            backend = %self.name,
            prompt_chars = request.prompt.len(),
            max_tokens = request.max_tokens,
            "Sending text completion request"
        );

        let response = self.post(&body, false).await?;
        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        self.parse_response(raw)
    }

    async fn stream(&self, request: BackendRequest) -> Result<ChunkReceiver, BackendError> {
        let request = self.text_request(request)?;
        let body = self.request_body(&request, true);

        debug!(backend = %self.name, "Sending streaming text completion request");

        let response = self.post(&body, true).await?;
        let (tx, rx) = mpsc::channel(64);
        let family = self.family;
        let backend_name = self.name.clone();

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut texts: BTreeMap<u32, String> = BTreeMap::new();

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
                            let _ = tx.send(Ok(cumulative_chunk(&texts, Vec::new(), true))).await;
                            return;
                        }
                        SseEvent::Data(data) => data,
                    };

                    let mut logprobs = Vec::new();
                    match apply_stream_payload(family, &data, &mut texts, &mut logprobs) {
                        Ok(true) => {
                            let _ = tx.send(Ok(cumulative_chunk(&texts, logprobs, true))).await;
                            return;
                        }
                        Ok(false) => {
                            if tx
                                .send(Ok(cumulative_chunk(&texts, logprobs, false)))
                                .await
                                .is_err()
                            {
                                return; // receiver dropped
                            }
                        }
                        Err(e) => {
                            trace!(backend = %backend_name, data = %data, error = %e, "Ignoring unparseable SSE chunk");
                        }
                    }
                }
            }

            let _ = tx.send(Ok(cumulative_chunk(&texts, Vec::new(), true))).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<bool, BackendError> {
        let path = match self.family {
            BackendFamily::Kobold => "/api/v1/model",
            BackendFamily::Novel => "/user/subscription",
            _ => "/v1/models",
        };
        let mut builder = self.client.get(format!("{}{}", self.base_url, path));
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        let response = builder.send().await.map_err(network_error)?;
        Ok(response.status().is_success())
    }
}

// --- Wire types (internal) ---

#[derive(Debug, Deserialize)]
struct KoboldResponse {
    results: Vec<KoboldResult>,
}

#[derive(Debug, Deserialize)]
struct KoboldResult {
    text: String,
}

#[derive(Debug, Deserialize)]
struct KoboldStreamEvent {
    #[serde(default)]
    token: String,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NovelResponse {
    output: String,
}

#[derive(Debug, Deserialize)]
struct NovelStreamEvent {
    #[serde(default)]
    token: String,
    #[serde(default)]
    r#final: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: String,
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionStreamEvent {
    #[serde(default)]
    choices: Vec<CompletionStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionStreamChoice {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    text: String,
    #[serde(default)]
    logprobs: Option<CompletionLogprobs>,
}

#[derive(Debug, Deserialize)]
struct CompletionLogprobs {
    #[serde(default)]
    tokens: Vec<String>,
    #[serde(default)]
    token_logprobs: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TextRequest {
        TextRequest {
            model: "kayra-v1".into(),
            prompt: "Seraphina: Hello!\nAlice:".into(),
            max_tokens: 120,
            max_context: 4096,
            temperature: 0.8,
            stop: vec!["\nAlice:".into()],
            n: 1,
            stream: false,
            negative_prompt: Some("bad prose".into()),
            guidance_scale: Some(1.5),
            json_schema: None,
        }
    }

    #[test]
    fn chat_family_is_rejected() {
        assert!(TextCompletionBackend::new(BackendFamily::OpenAi, "http://x", "").is_err());
    }

    #[test]
    fn endpoints_per_family() {
        let kobold = TextCompletionBackend::koboldcpp(None).unwrap();
        assert_eq!(kobold.endpoint(false), "http://127.0.0.1:5001/api/v1/generate");
        assert_eq!(
            kobold.endpoint(true),
            "http://127.0.0.1:5001/api/extra/generate/stream"
        );
        let novel = TextCompletionBackend::novelai("key").unwrap();
        assert_eq!(novel.endpoint(true), "https://api.novelai.net/ai/generate-stream");
        let textgen = TextCompletionBackend::textgen(Some("http://box:5000/")).unwrap();
        assert_eq!(textgen.endpoint(true), "http://box:5000/v1/completions");
    }

    #[test]
    fn kobold_body_shape() {
        let kobold = TextCompletionBackend::koboldcpp(None).unwrap();
        let body = kobold.request_body(&request(), false);
        assert_eq!(body["max_length"], 120);
        assert_eq!(body["max_context_length"], 4096);
        assert_eq!(body["stop_sequence"][0], "\nAlice:");
    }

    #[test]
    fn novel_body_carries_guidance() {
        let novel = TextCompletionBackend::novelai("key").unwrap();
        let body = novel.request_body(&request(), false);
        assert_eq!(body["input"], "Seraphina: Hello!\nAlice:");
        assert_eq!(body["parameters"]["cfg_uc"], "bad prose");
        assert_eq!(body["parameters"]["cfg_scale"], 1.5);
    }

    #[test]
    fn textgen_body_carries_guidance_and_truncation() {
        let textgen = TextCompletionBackend::textgen(None).unwrap();
        let body = textgen.request_body(&request(), true);
        assert_eq!(body["negative_prompt"], "bad prose");
        assert_eq!(body["truncation_length"], 4096);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn chat_request_is_rejected() {
        let textgen = TextCompletionBackend::textgen(None).unwrap();
        let req = BackendRequest::Chat(ChatRequest {
            model: "m".into(),
            messages: vec![],
            max_tokens: 1,
            temperature: 1.0,
            stop: vec![],
            n: 1,
            stream: false,
            tools: vec![],
            json_schema: None,
        });
        assert!(textgen.text_request(req).is_err());
    }

    #[test]
    fn parse_batch_responses() {
        let kobold = TextCompletionBackend::koboldcpp(None).unwrap();
        let resp = kobold
            .parse_response(serde_json::json!({"results": [{"text": " Hi!"}, {"text": " Hey!"}]}))
            .unwrap();
        assert_eq!(resp.message(), " Hi!");
        assert_eq!(resp.multi_swipes(), vec![" Hey!"]);

        let textgen = TextCompletionBackend::textgen(None).unwrap();
        let resp = textgen
            .parse_response(serde_json::json!({
                "model": "mistral",
                "choices": [{"index": 1, "text": "b"}, {"index": 0, "text": "a"}]
            }))
            .unwrap();
        assert_eq!(resp.message(), "a");
        assert_eq!(resp.model(), Some("mistral"));

        let novel = TextCompletionBackend::novelai("k").unwrap();
        let resp = novel
            .parse_response(serde_json::json!({"output": "story"}))
            .unwrap();
        assert_eq!(resp.message(), "story");
    }

    #[test]
    fn stream_payloads_accumulate() {
        let mut texts = BTreeMap::new();
        let mut logprobs = Vec::new();

        assert!(!apply_stream_payload(BackendFamily::Kobold, r#"{"token":"Hel"}"#, &mut texts, &mut logprobs).unwrap());
        assert!(!apply_stream_payload(BackendFamily::Kobold, r#"{"token":"lo"}"#, &mut texts, &mut logprobs).unwrap());
        assert_eq!(cumulative_chunk(&texts, vec![], false).text, "Hello");

        let mut texts = BTreeMap::new();
        assert!(apply_stream_payload(BackendFamily::Novel, r#"{"token":"End","final":true}"#, &mut texts, &mut logprobs).unwrap());

        let mut texts = BTreeMap::new();
        apply_stream_payload(
            BackendFamily::TextGen,
            r#"{"choices":[{"index":0,"text":"A","logprobs":{"tokens":["A"],"token_logprobs":[-0.1]}},{"index":1,"text":"B"}]}"#,
            &mut texts,
            &mut logprobs,
        )
        .unwrap();
        let chunk = cumulative_chunk(&texts, vec![], false);
        assert_eq!(chunk.text, "A");
        assert_eq!(chunk.swipes, vec!["B"]);
        assert_eq!(logprobs.len(), 1);
    }
}
