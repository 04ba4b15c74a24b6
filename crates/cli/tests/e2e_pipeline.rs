//! End-to-end tests for the generation pipeline.
//!
//! These exercise the full path from a character card and a chat file to a
//! committed reply: assembly, dispatch, streaming, swipes, tool recursion and
//! persistence.

use std::sync::{Arc, Mutex};

use promptloom_config::AppConfig;
use promptloom_core::backend::{Backend, BackendFamily, BackendRequest, BackendResponse, ChatChoice};
use promptloom_core::character::{CharacterCard, Persona};
use promptloom_core::error::{BackendError, ToolError};
use promptloom_core::event::PipelineEvent;
use promptloom_core::message::{ChatMessage, MessageToolCall};
use promptloom_core::session::{GenerationType, Session};
use promptloom_core::store::ChatStore;
use promptloom_core::tool::{Tool, ToolRegistry, ToolResult};
use promptloom_engine::swipe::{SwipeDirection, SwipeNavigation, navigate};
use promptloom_engine::{GenerationOutcome, GenerationPipeline, GenerationRequest, JsonlChatStore, ensure_greeting};

// ── Mock Backend ─────────────────────────────────────────────────────────

/// A mock backend that returns scripted responses in sequence.
struct ScriptedBackend {
    family: BackendFamily,
    responses: Mutex<Vec<BackendResponse>>,
    requests: Mutex<Vec<BackendRequest>>,
}

impl ScriptedBackend {
    fn new(family: BackendFamily, responses: Vec<BackendResponse>) -> Self {
        Self {
            family,
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn text(replies: &[&str]) -> Self {
        Self::new(
            BackendFamily::Kobold,
            replies
                .iter()
                .map(|r| BackendResponse::Kobold {
                    results: vec![r.to_string()],
                })
                .collect(),
        )
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn last_request(&self) -> BackendRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait::async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    fn family(&self) -> BackendFamily {
        self.family
    }

    async fn generate(&self, request: BackendRequest) -> Result<BackendResponse, BackendError> {
        let mut responses = self.responses.lock().unwrap();
        let mut requests = self.requests.lock().unwrap();
        if responses.is_empty() {
            panic!("ScriptedBackend exhausted: call #{}", requests.len());
        }
        requests.push(request);
        Ok(responses.remove(0))
    }
}

fn chat_response(content: &str, tool_calls: Vec<MessageToolCall>) -> BackendResponse {
    BackendResponse::OpenAi {
        model: "gpt-test".into(),
        choices: vec![ChatChoice {
            content: content.into(),
            tool_calls,
            ..ChatChoice::default()
        }],
        usage: None,
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────

const CARD_V2: &str = r#"{
    "spec": "chara_card_v2",
    "spec_version": "2.0",
    "data": {
        "name": "Seraphina",
        "description": "{{char}} guards the forest.",
        "personality": "gentle",
        "scenario": "{{user}} is lost.",
        "first_mes": "*Seraphina smiles.* Welcome, {{user}}.",
        "mes_example": "<START>\n{{user}}: Who are you?\n{{char}}: A guardian.",
        "alternate_greetings": ["You are safe here, {{user}}."],
        "extensions": {
            "depth_prompt": {"prompt": "[Seraphina is calm]", "depth": 0, "role": "system"}
        }
    }
}"#;

fn session() -> Session {
    let card = CharacterCard::from_json(CARD_V2).unwrap();
    let mut s = Session::new(card, Persona::named("Alice")).with_chat_id("forest");
    ensure_greeting(&mut s);
    s
}

fn batch_config() -> Arc<AppConfig> {
    let mut config = AppConfig::default();
    config.streaming.enabled = false;
    Arc::new(config)
}

fn prompt_text(request: &BackendRequest) -> String {
    match request {
        BackendRequest::Text(r) => r.prompt.clone(),
        BackendRequest::Chat(r) => r
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_reply_is_persisted_and_reloaded() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonlChatStore::new(dir.path()));
    let backend = Arc::new(ScriptedBackend::text(&[" *She offers a hand.* Come with me.\nAlice: ok"]));
    let pipeline = GenerationPipeline::new(backend.clone(), batch_config()).with_store(store.clone());

    let mut s = session();
    pipeline
        .generate(&mut s, GenerationRequest::new(GenerationType::Normal))
        .await
        .unwrap();
    assert_eq!(s.chat[0].mes, "*Seraphina smiles.* Welcome, Alice.");

    let (header, messages) = store.load("forest").await.unwrap().unwrap();
    assert_eq!(header.character_name, "Seraphina");
    assert!(header.chat_metadata.tainted);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].mes, "*She offers a hand.* Come with me.");
    assert_eq!(messages[1].swipes.as_ref().map(Vec::len), Some(1));
    assert_eq!(messages[1].extra.api.as_deref(), Some("kobold"));

    let prompt = prompt_text(&backend.last_request());
    assert!(prompt.starts_with("Seraphina guards the forest.\nSeraphina's personality: gentle\nScenario: Alice is lost.\n"));
    assert!(prompt.contains("Alice: Who are you?\nSeraphina: A guardian.\n"));
    assert!(prompt.ends_with("[Seraphina is calm]\nSeraphina:"), "{prompt:?}");
}

#[tokio::test]
async fn e2e_swipe_navigation_round_trip() {
    let backend = Arc::new(ScriptedBackend::text(&["First answer.", "Second answer."]));
    let pipeline = GenerationPipeline::new(backend.clone(), batch_config());
    let mut s = session();
    s.chat.push(ChatMessage::user("Alice", "Hello?"));

    pipeline
        .generate(&mut s, GenerationRequest::new(GenerationType::Normal))
        .await
        .unwrap();

    // right past the last swipe asks for a new one
    assert_eq!(navigate(&mut s, SwipeDirection::Right), SwipeNavigation::Generate);
    pipeline
        .generate(&mut s, GenerationRequest::new(GenerationType::Swipe))
        .await
        .unwrap();
    assert_eq!(s.chat[2].mes, "Second answer.");
    assert_eq!(s.chat[2].swipe_id, Some(1));

    assert_eq!(navigate(&mut s, SwipeDirection::Left), SwipeNavigation::Moved { index: 0 });
    assert_eq!(s.chat[2].mes, "First answer.");
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn e2e_streamed_reply_emits_chunks() {
    let backend = Arc::new(ScriptedBackend::text(&["A streamed reply."]));
    let pipeline = GenerationPipeline::new(backend.clone(), Arc::new(AppConfig::default()));
    let mut events = pipeline.event_bus().subscribe();
    let mut s = session();
    s.chat.push(ChatMessage::user("Alice", "Hi"));

    let outcome = pipeline
        .generate(&mut s, GenerationRequest::new(GenerationType::Normal))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        GenerationOutcome::Committed {
            message_index: 2,
            text: "A streamed reply.".into()
        }
    );
    assert!(matches!(backend.last_request(), BackendRequest::Text(ref r) if r.stream));

    let mut committed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::ChunkCommitted { text, .. } = event.as_ref() {
            committed.push(text.clone());
        }
    }
    assert_eq!(committed.last().map(String::as_str), Some("A streamed reply."));
}

struct Weather;

#[async_trait::async_trait]
impl Tool for Weather {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn display_name(&self) -> &str {
        "Weather"
    }

    fn description(&self) -> &str {
        "Current weather in the forest"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        Ok(ToolResult {
            call_id: String::new(),
            success: true,
            output: "Light rain".into(),
        })
    }
}

#[tokio::test]
async fn e2e_tool_call_then_answer() {
    let backend = Arc::new(ScriptedBackend::new(
        BackendFamily::OpenAi,
        vec![
            chat_response(
                "",
                vec![MessageToolCall {
                    id: "call_1".into(),
                    name: "get_weather".into(),
                    arguments: "{}".into(),
                }],
            ),
            chat_response("It is raining softly.", Vec::new()),
        ],
    ));
    let mut config = AppConfig::default();
    config.streaming.enabled = false;
    config.tools.enabled = true;
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(Weather));
    let pipeline = GenerationPipeline::new(backend.clone(), Arc::new(config)).with_tools(Arc::new(registry));

    let mut s = session();
    s.chat.push(ChatMessage::user("Alice", "How is the weather?"));
    let outcome = pipeline
        .generate(&mut s, GenerationRequest::new(GenerationType::Normal))
        .await
        .unwrap();

    assert_eq!(backend.calls(), 2);
    assert!(matches!(outcome, GenerationOutcome::Committed { message_index: 3, .. }));
    assert_eq!(s.chat[2].extra.tool_invocations[0].display_name, "Weather");
    assert_eq!(s.chat[3].mes, "It is raining softly.");
    assert!(prompt_text(&backend.last_request()).contains("Light rain"));
}

#[tokio::test]
async fn e2e_backend_failure_keeps_chat_intact() {
    struct Down;

    #[async_trait::async_trait]
    impl Backend for Down {
        fn name(&self) -> &str {
            "down"
        }
        fn family(&self) -> BackendFamily {
            BackendFamily::TextGen
        }
        async fn generate(&self, _request: BackendRequest) -> Result<BackendResponse, BackendError> {
            Err(BackendError::Api {
                status_code: 503,
                message: "overloaded".into(),
            })
        }
    }

    let pipeline = GenerationPipeline::new(Arc::new(Down), batch_config());
    let mut events = pipeline.event_bus().subscribe();
    let mut s = session();
    s.chat.push(ChatMessage::user("Alice", "Hi"));

    let err = pipeline
        .generate(&mut s, GenerationRequest::new(GenerationType::Normal))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("overloaded"));
    assert_eq!(s.chat.len(), 2);

    let mut errored = false;
    while let Ok(event) = events.try_recv() {
        errored |= matches!(event.as_ref(), PipelineEvent::Errored { .. });
    }
    assert!(errored);
}
