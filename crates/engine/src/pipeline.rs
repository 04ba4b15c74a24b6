//! The generation pipeline.
//!
//! One call to [`GenerationPipeline::generate`] runs a trampoline:
//!
//! 1. **Prepare**: place the greeting, register extension prompts, scan world
//!    info, assemble the context and trim it to the budget
//! 2. **Dispatch** the request to the active backend (batch or stream)
//! 3. **Reconcile** the response into the reply slot
//! 4. **If tool calls**: run them, record the invocations, and loop back to
//!    step 1 with `depth + 1` while the recursion ceiling allows
//!
//! A pipeline runs one generation at a time; a second `generate` call while
//! one is in flight is rejected with [`EngineError::AlreadyGenerating`].

use crate::assembler::{AssembledPrompt, AssemblyInput, ContextAssembler, ensure_greeting};
use crate::budget::{FitReport, compute_budget, fit_to_budget};
use crate::cleanup::{CleanupOptions, clean_up_message};
use crate::error::EngineError;
use crate::injection::{
    AUTHORS_NOTE_KEY, DEPTH_PROMPT_KEY, ExtensionPrompt, InjectionRegistry, PERSONA_DESCRIPTION_KEY,
    QUIET_PROMPT_KEY, depth_world_info_key,
};
use crate::macros::MacroContext;
use crate::reply::{ReplyMeta, ReplyTarget, discard_empty_slot, finalize_reply, open_slot, write_reply};
use crate::stop_strings::custom_stopping_strings;
use crate::streaming::{StreamOutcome, StreamState, StreamingProcessor};
use crate::tool_calls::{ToolCallCoordinator, invocation_message, is_placeholder};
use chrono::Utc;
use promptloom_config::AppConfig;
use promptloom_core::abort::AbortSignal;
use promptloom_core::backend::{Backend, BackendRequest, ChatRequest, TextRequest};
use promptloom_core::character::PersonaPosition;
use promptloom_core::error::BackendError;
use promptloom_core::event::{EventBus, PipelineEvent};
use promptloom_core::message::{ChatMessage, InjectionPosition, PromptRole};
use promptloom_core::session::{GenerationType, Session};
use promptloom_core::store::ChatStore;
use promptloom_core::tokenizer::{HeuristicTokenizer, TokenCounter};
use promptloom_core::tool::ToolRegistry;
use promptloom_core::world_info::{NoWorldInfo, WorldInfoProvider};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// ── Request / outcome ────────────────────────────────────────────────────

/// One top-level generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub generation_type: GenerationType,
    /// Always write the speaker name on the prompt line
    pub force_name: bool,
    /// Group member that should speak
    pub force_character: Option<String>,
    pub abort: AbortSignal,
    /// Recursion depth of this pass (0 for user-initiated runs)
    pub depth: u32,
    /// Structured-output schema passed through to the backend
    pub json_schema: Option<serde_json::Value>,
    /// Instruction for a quiet run
    pub quiet_prompt: Option<String>,
}

impl GenerationRequest {
    pub fn new(generation_type: GenerationType) -> Self {
        Self {
            generation_type,
            ..Self::default()
        }
    }

    /// A background request answering `prompt`.
    pub fn quiet(prompt: impl Into<String>) -> Self {
        Self {
            quiet_prompt: Some(prompt.into()),
            ..Self::new(GenerationType::Quiet)
        }
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_force_name(mut self, force: bool) -> Self {
        self.force_name = force;
        self
    }

    pub fn with_character(mut self, name: impl Into<String>) -> Self {
        self.force_character = Some(name.into());
        self
    }

    pub fn with_json_schema(mut self, schema: serde_json::Value) -> Self {
        self.json_schema = Some(schema);
        self
    }
}

/// How a generation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    /// A reply was written into the chat
    Committed { message_index: usize, text: String },
    /// Impersonate / quiet result, not written into the chat
    Detached { text: String },
    /// Aborted; partial text (if any) was kept
    Stopped { message_index: Option<usize>, text: String },
    /// Tool calls ended the generation without a visible reply
    ToolsOnly { invocations: usize, errors: Vec<String> },
    /// The backend produced no text; the reply slot was rolled back
    Empty,
}

/// A prompt ready to send, plus what trimming did to it.
#[derive(Debug, Clone)]
pub struct PreparedPrompt {
    pub prompt: AssembledPrompt,
    pub report: FitReport,
    pub speaker: String,
    pub macros: MacroContext,
}

enum PassResult {
    Done(GenerationOutcome),
    Recurse,
}

/// Holds the in-progress flag for the duration of one generation.
struct GenerationGuard(Arc<AtomicBool>);

impl GenerationGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// Orchestrates assembly, dispatch, reconciliation and tool recursion.
pub struct GenerationPipeline {
    /// The active backend adapter
    backend: Arc<dyn Backend>,

    config: Arc<AppConfig>,

    /// Tokenizer oracle for budgeting and token counts
    tokenizer: Arc<dyn TokenCounter>,

    world_info: Arc<dyn WorldInfoProvider>,

    /// Present when tools are registered
    tools: Option<ToolCallCoordinator>,

    /// Optional persistence collaborator
    store: Option<Arc<dyn ChatStore>>,

    /// Extension prompts, shared with callers between runs
    injections: Mutex<InjectionRegistry>,

    /// Event bus for lifecycle events
    event_bus: Arc<EventBus>,

    generating: Arc<AtomicBool>,
}

impl GenerationPipeline {
    pub fn new(backend: Arc<dyn Backend>, config: Arc<AppConfig>) -> Self {
        Self {
            backend,
            config,
            tokenizer: Arc::new(HeuristicTokenizer),
            world_info: Arc::new(NoWorldInfo),
            tools: None,
            store: None,
            injections: Mutex::new(InjectionRegistry::new()),
            event_bus: Arc::new(EventBus::default()),
            generating: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn TokenCounter>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn with_world_info(mut self, world_info: Arc<dyn WorldInfoProvider>) -> Self {
        self.world_info = world_info;
        self
    }

    /// Offer `registry` to the model, bounded by the configured recursion limit.
    pub fn with_tools(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.tools = Some(ToolCallCoordinator::new(registry, self.config.tools.recurse_limit));
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ChatStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The extension-prompt table. Lock it to register prompts before a run.
    pub fn injections(&self) -> &Mutex<InjectionRegistry> {
        &self.injections
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    fn tools_for(&self, generation_type: GenerationType) -> Option<&ToolCallCoordinator> {
        self.tools.as_ref().filter(|t| {
            self.config.tools.enabled && t.is_supported(self.backend.family(), generation_type)
        })
    }

    // ── Prepare ──────────────────────────────────────────────────────────

    fn speaker(&self, session: &Session, request: &GenerationRequest) -> String {
        let Some(group) = &session.group else {
            return session.character.name.clone();
        };
        let enabled = |name: &str| group.members.iter().any(|m| m.enabled && m.name == name);
        match request.force_character.as_deref() {
            Some(name) if enabled(name) => name.to_string(),
            _ => group
                .members
                .iter()
                .find(|m| m.enabled)
                .map(|m| m.name.clone())
                .unwrap_or_else(|| session.character.name.clone()),
        }
    }

    fn register_session_prompts(registry: &mut InjectionRegistry, session: &Session, request: &GenerationRequest) {
        let md = &session.metadata;
        let users = session.user_message_count() as u32;
        let note_due = md.note_interval > 0 && users % md.note_interval == 0;
        if note_due && !md.note_prompt.trim().is_empty() {
            registry.set(AUTHORS_NOTE_KEY, md.note_prompt.clone(), md.note_position, md.note_depth, true, md.note_role);
        } else {
            registry.remove(AUTHORS_NOTE_KEY);
        }

        let depth_prompt = &session.character.depth_prompt;
        if depth_prompt.prompt.trim().is_empty() {
            registry.remove(DEPTH_PROMPT_KEY);
        } else {
            registry.set(
                DEPTH_PROMPT_KEY,
                depth_prompt.prompt.clone(),
                InjectionPosition::InChat,
                depth_prompt.depth,
                true,
                depth_prompt.role,
            );
        }

        let persona = &session.persona;
        if persona.position == PersonaPosition::AtDepth && !persona.description.trim().is_empty() {
            registry.set(
                PERSONA_DESCRIPTION_KEY,
                persona.description.clone(),
                InjectionPosition::InChat,
                persona.depth,
                true,
                persona.role,
            );
        } else {
            registry.remove(PERSONA_DESCRIPTION_KEY);
        }

        match request.quiet_prompt.as_deref() {
            Some(quiet) if request.generation_type == GenerationType::Quiet => registry.insert(
                QUIET_PROMPT_KEY,
                ExtensionPrompt::new(quiet, InjectionPosition::None, 0, true, PromptRole::System).transient(),
            ),
            _ => {
                registry.remove(QUIET_PROMPT_KEY);
            }
        }
    }

    /// Assemble and trim the prompt for `request` without calling the backend.
    ///
    /// Places the greeting into an empty chat and records which message is the
    /// oldest one still in context.
    pub async fn prepare_prompt(&self, session: &mut Session, request: &GenerationRequest) -> PreparedPrompt {
        ensure_greeting(session);
        let speaker = self.speaker(session, request);
        let macros = MacroContext::for_session(session, &speaker);
        let family = self.backend.family();

        let (snapshot, world_info) = {
            let mut registry = self.injections.lock().await;
            Self::register_session_prompts(&mut registry, session, request);

            let mut scan_input: Vec<String> = session
                .chat
                .iter()
                .rev()
                .filter(|m| !m.extra.is_small_sys)
                .map(|m| m.mes.clone())
                .collect();
            scan_input.extend(registry.scan_input());
            let max_context = if family.is_chat() {
                self.config.chat_completion.max_context
            } else {
                self.config.context.max_context
            };
            let world_info = self.world_info.scan(&scan_input, max_context as usize).await;

            let mut depth_groups: BTreeMap<(u32, PromptRole), Vec<&str>> = BTreeMap::new();
            for entry in &world_info.depth_entries {
                depth_groups
                    .entry((entry.depth, entry.role))
                    .or_default()
                    .push(entry.content.as_str());
            }
            for ((depth, role), contents) in depth_groups {
                registry.insert(
                    depth_world_info_key(depth, role),
                    ExtensionPrompt::new(contents.join("\n"), InjectionPosition::InChat, depth, false, role)
                        .transient(),
                );
            }

            let snapshot = registry.snapshot().await;
            let cleared = registry.clear_transient();
            debug!(entries = snapshot.entries().len(), cleared, "Injection snapshot taken");
            (snapshot, world_info)
        };

        let assembler = ContextAssembler::new(&self.config, family);
        let input = AssemblyInput {
            session,
            generation_type: request.generation_type,
            speaker: &speaker,
            macros: &macros,
            injections: &snapshot,
            world_info: &world_info,
            quiet_prompt: request.quiet_prompt.as_deref(),
            force_name: request.force_name,
        };
        let mut prompt = assembler.assemble(&input);

        let budget = compute_budget(&self.config, family, &self.config.model, self.tokenizer.as_ref());
        let mut report = fit_to_budget(&mut prompt, budget, self.tokenizer.as_ref());
        // first sequences change the oldest turns, so the result is measured again
        loop {
            assembler.apply_first_sequences(&mut prompt, &input);
            let tokens = prompt.token_count(self.tokenizer.as_ref());
            if tokens <= budget || report.over_budget {
                report.final_tokens = tokens;
                break;
            }
            report.absorb(fit_to_budget(&mut prompt, budget, self.tokenizer.as_ref()));
        }

        session.metadata.last_in_context_message_id = prompt.oldest_source_index();
        PreparedPrompt {
            prompt,
            report,
            speaker,
            macros,
        }
    }

    fn build_request(&self, prepared: &PreparedPrompt, request: &GenerationRequest) -> BackendRequest {
        let config = &self.config;
        let n = match request.generation_type {
            GenerationType::Normal | GenerationType::Swipe | GenerationType::Regenerate => {
                config.context.swipes_per_request.max(1)
            }
            _ => 1,
        };
        let stream = config.streaming.enabled;

        if self.backend.family().is_chat() {
            let tools = self
                .tools_for(request.generation_type)
                .filter(|t| t.can_recurse(request.depth))
                .map(ToolCallCoordinator::definitions)
                .unwrap_or_default();
            return BackendRequest::Chat(ChatRequest {
                model: config.model.clone(),
                messages: prepared.prompt.render_messages(),
                max_tokens: config.chat_completion.max_tokens,
                temperature: config.temperature,
                stop: custom_stopping_strings(config, &prepared.macros),
                n,
                stream,
                tools,
                json_schema: request.json_schema.clone(),
            });
        }

        let guidance = config.cfg.is_active();
        BackendRequest::Text(TextRequest {
            model: config.model.clone(),
            prompt: prepared.prompt.render_text(),
            max_tokens: config.context.response_length,
            max_context: config.context.max_context,
            temperature: config.temperature,
            stop: prepared.prompt.stop_strings.clone(),
            n,
            stream,
            negative_prompt: guidance.then(|| prepared.macros.substitute(&config.cfg.negative_prompt)),
            guidance_scale: guidance.then_some(config.cfg.guidance_scale),
            json_schema: request.json_schema.clone(),
        })
    }

    // ── Generate ─────────────────────────────────────────────────────────

    /// Run a generation to completion, following tool calls.
    pub async fn generate(
        &self,
        session: &mut Session,
        request: GenerationRequest,
    ) -> Result<GenerationOutcome, EngineError> {
        let _guard = GenerationGuard::acquire(&self.generating).ok_or(EngineError::AlreadyGenerating)?;

        let mut generation_type = request.generation_type;
        match generation_type {
            GenerationType::Continue => match session.chat.last() {
                None => return Err(EngineError::NothingToContinue),
                Some(last) if !last.is_character_reply() => generation_type = GenerationType::Normal,
                Some(_) => {}
            },
            GenerationType::Regenerate => {
                // a lone greeting has nothing to answer
                if !session.chat.iter().any(|m| m.is_user) {
                    return Err(EngineError::NothingToRegenerate);
                }
                if session.chat.last().is_some_and(ChatMessage::is_character_reply) {
                    session.chat.pop();
                    debug!("Removed last reply for regeneration");
                }
            }
            _ => {}
        }

        let mut depth = request.depth;
        loop {
            if request.abort.is_aborted() {
                info!(depth, "Generation aborted before pass");
                self.event_bus.publish(PipelineEvent::Stopped {
                    message_index: None,
                    text: String::new(),
                });
                return Ok(GenerationOutcome::Stopped {
                    message_index: None,
                    text: String::new(),
                });
            }

            self.event_bus.publish(PipelineEvent::Started {
                generation_type,
                depth,
                timestamp: Utc::now(),
            });
            let pass = GenerationRequest {
                generation_type,
                depth,
                ..request.clone()
            };

            match self.run_pass(session, &pass).await {
                Ok(PassResult::Done(outcome)) => return Ok(outcome),
                Ok(PassResult::Recurse) => {
                    depth += 1;
                    generation_type = GenerationType::Normal;
                    info!(depth, "Tool calls triggered another pass");
                }
                Err(e) => {
                    warn!(error = %e, depth, "Generation failed");
                    self.event_bus.publish(PipelineEvent::Errored { error: e.to_string() });
                    return Err(e);
                }
            }
        }
    }

    async fn run_pass(&self, session: &mut Session, request: &GenerationRequest) -> Result<PassResult, EngineError> {
        let generation_type = request.generation_type;
        let prepared = self.prepare_prompt(session, request).await;
        let backend_request = self.build_request(&prepared, request);
        info!(
            generation_type = %generation_type,
            depth = request.depth,
            backend = self.backend.name(),
            tokens = prepared.report.final_tokens,
            budget = prepared.report.budget,
            "Dispatching generation"
        );

        let target = open_slot(session, generation_type, &prepared.speaker);
        let bias = match generation_type {
            GenerationType::Normal | GenerationType::Swipe | GenerationType::Regenerate => {
                prepared.macros.substitute(&self.config.context.user_prompt_bias)
            }
            _ => String::new(),
        };
        let user = session.persona.name.clone();
        let speaker = if generation_type == GenerationType::Impersonate {
            user.clone()
        } else {
            prepared.speaker.clone()
        };
        let cleanup = CleanupOptions {
            context: &self.config.context,
            stop_strings: &prepared.prompt.stop_strings,
            user: &user,
            speaker: &speaker,
            prompt_bias: &bias,
            is_impersonate: generation_type == GenerationType::Impersonate,
            is_continue: generation_type == GenerationType::Continue,
        };
        let mut processor = StreamingProcessor::new(cleanup.clone(), self.config.streaming.fps);

        let mut image = None;
        let mut model = None;
        let outcome = if backend_request.is_stream() {
            match self.backend.stream(backend_request).await {
                Ok(chunks) => {
                    processor
                        .run(chunks, &request.abort, session, &target, &self.event_bus)
                        .await
                }
                Err(e) => {
                    discard_empty_slot(session, &target);
                    return Err(e.into());
                }
            }
        } else {
            let response = tokio::select! {
                biased;
                _ = request.abort.aborted() => None,
                response = self.backend.generate(backend_request) => Some(response),
            };
            match response {
                None => StreamOutcome {
                    state: StreamState::Stopped,
                    ..StreamOutcome::default()
                },
                Some(Err(e)) => {
                    discard_empty_slot(session, &target);
                    return Err(e.into());
                }
                Some(Ok(response)) => {
                    let raw = self.backend.extract_message(&response);
                    let text = processor.process_batch(&raw, session, &target, &self.event_bus);
                    image = self.backend.extract_image(&response);
                    model = response.model().map(str::to_string);
                    StreamOutcome {
                        state: StreamState::Finished,
                        text,
                        swipes: self
                            .backend
                            .extract_multi_swipes(&response)
                            .iter()
                            .map(|s| clean_up_message(s, &cleanup, true))
                            .collect(),
                        tool_calls: response.tool_calls(),
                        reasoning: Some(self.backend.extract_reasoning(&response)).filter(|r| !r.is_empty()),
                        error: None,
                    }
                }
            }
        };

        let meta = ReplyMeta {
            api: self.backend.family().as_str().to_string(),
            model: model.or_else(|| Some(self.config.model.clone()).filter(|m| !m.is_empty())),
            bias: Some(bias.clone()),
            image,
            reasoning: outcome.reasoning.clone(),
        };

        match outcome.state {
            StreamState::Stopped => {
                let kept = !discard_empty_slot(session, &target) && target.message_index().is_some();
                if kept {
                    finalize_reply(session, &target, &meta, &[], self.tokenizer.as_ref());
                    self.commit(session).await?;
                }
                let message_index = target.message_index().filter(|_| kept);
                self.event_bus.publish(PipelineEvent::Stopped {
                    message_index,
                    text: outcome.text.clone(),
                });
                return Ok(PassResult::Done(GenerationOutcome::Stopped {
                    message_index,
                    text: outcome.text,
                }));
            }
            StreamState::Errored => {
                if !discard_empty_slot(session, &target) && target.message_index().is_some() {
                    finalize_reply(session, &target, &meta, &[], self.tokenizer.as_ref());
                    // already logged; the transport error is what ended the run
                    let _ = self.commit(session).await;
                }
                let error = outcome
                    .error
                    .unwrap_or_else(|| BackendError::StreamInterrupted("stream ended with an error".into()));
                return Err(error.into());
            }
            _ => {}
        }

        if !outcome.tool_calls.is_empty()
            && let Some(tools) = self.tools_for(generation_type)
        {
            return self
                .handle_tool_calls(session, request, tools, &target, &meta, &outcome)
                .await;
        }

        if outcome.text.is_empty() && outcome.swipes.iter().all(|s| s.trim().is_empty()) {
            discard_empty_slot(session, &target);
            info!("Backend returned an empty reply");
            return Ok(PassResult::Done(match target {
                ReplyTarget::Detached => GenerationOutcome::Detached { text: String::new() },
                ReplyTarget::Slot { .. } => GenerationOutcome::Empty,
            }));
        }

        let Some(message_index) = target.message_index() else {
            self.event_bus.publish(PipelineEvent::Finished {
                message_index: None,
                text: outcome.text.clone(),
                timestamp: Utc::now(),
            });
            return Ok(PassResult::Done(GenerationOutcome::Detached { text: outcome.text }));
        };

        finalize_reply(session, &target, &meta, &outcome.swipes, self.tokenizer.as_ref());
        self.commit(session).await?;
        let text = session.chat[message_index].mes.clone();
        self.event_bus.publish(PipelineEvent::Finished {
            message_index: Some(message_index),
            text: text.clone(),
            timestamp: Utc::now(),
        });
        info!(message_index, len = text.len(), "Generation committed");
        Ok(PassResult::Done(GenerationOutcome::Committed { message_index, text }))
    }

    async fn handle_tool_calls(
        &self,
        session: &mut Session,
        request: &GenerationRequest,
        tools: &ToolCallCoordinator,
        target: &ReplyTarget,
        meta: &ReplyMeta,
        outcome: &StreamOutcome,
    ) -> Result<PassResult, EngineError> {
        let placeholder = is_placeholder(&outcome.text);
        let mut placeholder_deleted = false;
        if placeholder {
            write_reply(session, target, "");
            placeholder_deleted = discard_empty_slot(session, target);
        } else {
            finalize_reply(session, target, meta, &outcome.swipes, self.tokenizer.as_ref());
        }

        let handled = tools.handle_response(&outcome.tool_calls).await;
        if !handled.invocations.is_empty() {
            session.chat.push(invocation_message(&handled.invocations));
        }
        self.event_bus.publish(PipelineEvent::ToolsInvoked {
            invocations: handled.invocations.len(),
            stealth: handled.stealth_calls.len(),
            errors: handled.errors.clone(),
        });
        self.commit(session).await?;

        let can_recurse = tools.can_recurse(request.depth);
        if !handled.should_stop_generation && can_recurse {
            return Ok(PassResult::Recurse);
        }
        if !can_recurse {
            info!(depth = request.depth, limit = tools.recurse_limit(), "Tool recursion ceiling reached");
        }

        let visible = target.message_index().filter(|_| !placeholder_deleted);
        let result = match visible {
            Some(message_index) => {
                let text = session.chat[message_index].mes.clone();
                self.event_bus.publish(PipelineEvent::Finished {
                    message_index: Some(message_index),
                    text: text.clone(),
                    timestamp: Utc::now(),
                });
                GenerationOutcome::Committed { message_index, text }
            }
            None => GenerationOutcome::ToolsOnly {
                invocations: handled.invocations.len(),
                errors: handled.errors,
            },
        };
        Ok(PassResult::Done(result))
    }

    /// Mark the chat as generated-into and persist it.
    async fn commit(&self, session: &mut Session) -> Result<(), EngineError> {
        session.metadata.tainted = true;
        let Some(store) = &self.store else {
            return Ok(());
        };
        store
            .save(&session.chat_id, &session.header(), &session.chat)
            .await
            .map_err(|e| {
                warn!(store = store.name(), error = %e, "Failed to save chat");
                EngineError::Store(e)
            })
    }
}
