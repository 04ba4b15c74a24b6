//! Context assembler: turns a session into a model-ready prompt.
//!
//! The assembler is a pure function of its inputs. It reads the session, the
//! card, the world-info bundle and an [`InjectionSnapshot`], and produces an
//! [`AssembledPrompt`]: the prompt split into removable units so the budget
//! manager can trim it without re-assembling.
//!
//! Two shapes come out of the same pass:
//! - **Text** (KoboldAI, text-generation-webui, NovelAI): one flat string,
//!   turns rendered as `Name: text` lines or wrapped in instruct sequences.
//! - **Chat** (OpenAI-compatible): role-tagged messages.
//!
//! Layout, oldest to newest:
//!
//! ```text
//! header       before-story injections, story string, after-story injections
//! examples     one unit per example block
//! chat_start   separator / "[Start a new Chat]"
//! history      one unit per message or injected entry
//! tail         post-history instructions, quiet prompt, prompt line / nudge
//! ```

use crate::examples::{parse_turns, split_blocks};
use crate::injection::InjectionSnapshot;
use crate::instruct::{InstructFormatter, PromptLine, SequenceSlot, Speaker};
use crate::macros::MacroContext;
use crate::stop_strings::{StopStringContext, stopping_strings};
use crate::story::{StoryParams, render_story_string};
use promptloom_config::AppConfig;
use promptloom_core::backend::BackendFamily;
use promptloom_core::character::PersonaPosition;
use promptloom_core::message::{
    ChatMessage, InjectionPosition, MessageToolCall, PromptMessage, PromptRole,
};
use promptloom_core::session::{GenerationType, Session};
use promptloom_core::tokenizer::TokenCounter;
use promptloom_core::world_info::{ExamplePosition, WorldInfoBundle};
use tracing::debug;

/// Sentinel marking where the already-written part of a continued message
/// ends. It is stripped from message text before formatting, so it can never
/// collide with real content.
pub const FORMAT_TOKEN: &str = "\u{0}\u{fffc}\u{0}\u{fffd}";

// ── Types ────────────────────────────────────────────────────────────────

/// Which prompt form the active backend consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PromptShape {
    #[default]
    Text,
    Chat,
}

impl PromptShape {
    pub fn for_family(family: BackendFamily) -> Self {
        if family.is_chat() { Self::Chat } else { Self::Text }
    }
}

/// A piece of the prompt: text for the text shape, messages for the chat shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptUnit {
    pub text: String,
    pub messages: Vec<PromptMessage>,
}

impl PromptUnit {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            messages: Vec::new(),
        }
    }

    pub fn messages(messages: Vec<PromptMessage>) -> Self {
        Self {
            text: String::new(),
            messages,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.messages.is_empty()
    }

    pub fn token_count(&self, counter: &dyn TokenCounter) -> usize {
        let text = if self.text.is_empty() { 0 } else { counter.count(&self.text) };
        text + counter.count_messages(&self.messages)
    }
}

/// One example-dialogue block.
#[derive(Debug, Clone, PartialEq)]
pub struct ExampleBlock {
    pub unit: PromptUnit,
    /// Pinned blocks are never trimmed
    pub pinned: bool,
}

/// One history unit: a chat message, or an injected extension prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub unit: PromptUnit,
    pub injected: bool,
    /// Index of the chat message this entry renders (`None` for injections)
    pub source_index: Option<usize>,
}

/// The assembled prompt, still split into trimmable units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledPrompt {
    pub shape: PromptShape,
    pub header: PromptUnit,
    pub examples: Vec<ExampleBlock>,
    pub chat_start: PromptUnit,
    /// Oldest first
    pub history: Vec<HistoryEntry>,
    pub tail: PromptUnit,
    pub stop_strings: Vec<String>,
    /// Text already present in a continued message
    pub continue_prefix: Option<String>,
}

impl AssembledPrompt {
    fn units(&self) -> impl Iterator<Item = &PromptUnit> {
        std::iter::once(&self.header)
            .chain(self.examples.iter().map(|b| &b.unit))
            .chain(std::iter::once(&self.chat_start))
            .chain(self.history.iter().map(|h| &h.unit))
            .chain(std::iter::once(&self.tail))
    }

    /// Token count of the whole prompt (sum of its units).
    pub fn token_count(&self, counter: &dyn TokenCounter) -> usize {
        self.units().map(|u| u.token_count(counter)).sum()
    }

    /// Positions in `history` that hold injected entries.
    ///
    /// Computed from the entries themselves, so it stays correct after any
    /// removal.
    pub fn injected_indices(&self) -> Vec<usize> {
        self.history
            .iter()
            .enumerate()
            .filter(|(_, h)| h.injected)
            .map(|(i, _)| i)
            .collect()
    }

    /// Chat index of the oldest message still in the prompt.
    pub fn oldest_source_index(&self) -> Option<usize> {
        self.history.iter().find_map(|h| h.source_index)
    }

    /// Flat text prompt.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for unit in self.units() {
            out.push_str(&unit.text);
        }
        out
    }

    /// Role-tagged message list.
    pub fn render_messages(&self) -> Vec<PromptMessage> {
        self.units()
            .flat_map(|u| u.messages.iter().cloned())
            .collect()
    }
}

/// Everything one assembly reads.
pub struct AssemblyInput<'a> {
    pub session: &'a Session,
    pub generation_type: GenerationType,
    /// Name of the character replying
    pub speaker: &'a str,
    pub macros: &'a MacroContext,
    pub injections: &'a InjectionSnapshot,
    pub world_info: &'a WorldInfoBundle,
    pub quiet_prompt: Option<&'a str>,
    /// Always write the speaker name on the instruct prompt line
    pub force_name: bool,
}

impl AssemblyInput<'_> {
    fn user(&self) -> &str {
        &self.session.persona.name
    }

    fn is_continue(&self) -> bool {
        self.generation_type == GenerationType::Continue
    }

    /// Messages that form the history: a re-rolled slot is left out.
    fn history_end(&self) -> usize {
        let chat = &self.session.chat;
        match chat.last() {
            Some(last) if self.generation_type == GenerationType::Swipe && last.is_character_reply() => {
                chat.len() - 1
            }
            _ => chat.len(),
        }
    }
}

// ── Greeting ─────────────────────────────────────────────────────────────

/// Place the card greeting into an empty chat.
///
/// All greetings become swipes of one slot, macro-substituted in place.
pub fn ensure_greeting(session: &mut Session) -> bool {
    if !session.chat.is_empty() {
        return false;
    }
    let macros = MacroContext::for_session(session, &session.character.name);
    let greetings: Vec<String> = session
        .character
        .greetings()
        .iter()
        .map(|g| macros.substitute(g))
        .collect();
    let placed = session.place_greeting(greetings);
    if placed {
        debug!(swipes = session.chat[0].swipe_count(), "Placed greeting");
    }
    placed
}

// ── Assembler ────────────────────────────────────────────────────────────

pub struct ContextAssembler<'a> {
    config: &'a AppConfig,
    shape: PromptShape,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(config: &'a AppConfig, family: BackendFamily) -> Self {
        Self {
            config,
            shape: PromptShape::for_family(family),
        }
    }

    pub fn shape(&self) -> PromptShape {
        self.shape
    }

    fn formatter<'b>(&'b self, input: &'b AssemblyInput<'_>) -> InstructFormatter<'b> {
        InstructFormatter::new(
            &self.config.instruct,
            input.macros,
            input.session.group.is_some(),
        )
    }

    fn instruct(&self) -> bool {
        self.shape == PromptShape::Text && self.config.instruct.enabled
    }

    /// Build the untrimmed prompt.
    pub fn assemble(&self, input: &AssemblyInput<'_>) -> AssembledPrompt {
        let examples = self.examples(input);
        let joined_examples: String = examples.iter().map(|b| b.unit.text.as_str()).collect();
        let macros = input.macros.clone().with_mes_examples(joined_examples);

        let history = self.history(input);
        let session = input.session;

        let stop_strings = stopping_strings(&StopStringContext {
            config: self.config,
            macros: input.macros,
            user: input.user(),
            speaker: input.speaker,
            group: session.group.as_ref(),
            is_impersonate: input.generation_type == GenerationType::Impersonate,
        });

        let continue_prefix = input
            .is_continue()
            .then(|| session.chat.last().map(|m| m.mes.clone()))
            .flatten();

        let prompt = AssembledPrompt {
            shape: self.shape,
            header: self.header(input, &macros),
            examples,
            chat_start: self.chat_start(input),
            history,
            tail: self.tail(input),
            stop_strings,
            continue_prefix,
        };

        debug!(
            shape = ?prompt.shape,
            history = prompt.history.len(),
            examples = prompt.examples.len(),
            injected = prompt.injected_indices().len(),
            "Assembled context"
        );
        prompt
    }

    // ── Header ───────────────────────────────────────────────────────────

    fn system_prompt(&self, input: &AssemblyInput<'_>) -> String {
        let card = &input.session.character.system_prompt;
        let default: &str = match self.shape {
            PromptShape::Chat => &self.config.chat_completion.main_prompt,
            PromptShape::Text if self.config.instruct.enabled => &self.config.instruct.system_prompt,
            PromptShape::Text => "",
        };
        if card.trim().is_empty() {
            input.macros.substitute(default)
        } else {
            input
                .macros
                .clone()
                .with_original(input.macros.substitute(default))
                .substitute(card)
        }
    }

    fn story_string(&self, input: &AssemblyInput<'_>, macros: &MacroContext, system: &str) -> String {
        let persona = match input.session.persona.position {
            PersonaPosition::InPrompt => macros.persona.as_str(),
            _ => "",
        };
        let params = StoryParams::new()
            .set("system", system)
            .set("description", macros.description.as_str())
            .set("personality", macros.personality.as_str())
            .set("scenario", macros.scenario.as_str())
            .set("persona", persona)
            .set("wiBefore", input.world_info.before.as_str())
            .set("wiAfter", input.world_info.after.as_str())
            .set("mesExamples", macros.mes_examples.as_str())
            .set("char", input.speaker)
            .set("user", input.user());
        let story = macros.substitute(&render_story_string(
            &self.config.context.story_string,
            &params,
        ));
        if self.instruct() {
            self.formatter(input).format_story_string(&story)
        } else {
            story
        }
    }

    fn header(&self, input: &AssemblyInput<'_>, macros: &MacroContext) -> PromptUnit {
        let before = input
            .injections
            .get(InjectionPosition::BeforePrompt, None, None, "\n", true, macros);
        let before = before.trim_start();
        let after = input
            .injections
            .get(InjectionPosition::InPrompt, None, None, "\n", true, macros);

        match self.shape {
            PromptShape::Text => {
                let system = self.system_prompt(input);
                let story = self.story_string(input, macros, &system);
                PromptUnit::text(format!("{before}{story}{after}"))
            }
            PromptShape::Chat => {
                let mut messages = Vec::new();
                let main = self.system_prompt(input);
                if !main.trim().is_empty() {
                    messages.push(PromptMessage::system(main));
                }
                let story = self.story_string(input, macros, "");
                let combined = format!("{before}{story}{after}");
                if !combined.trim().is_empty() {
                    messages.push(PromptMessage::system(combined.trim()));
                }
                PromptUnit::messages(messages)
            }
        }
    }

    // ── Examples ─────────────────────────────────────────────────────────

    fn example_blocks(&self, input: &AssemblyInput<'_>) -> Vec<String> {
        let wi = |position: ExamplePosition| -> Vec<String> {
            input
                .world_info
                .examples
                .iter()
                .filter(|e| e.position == position)
                .flat_map(|e| split_blocks(&input.macros.substitute(&e.content)))
                .collect()
        };

        let mut blocks = wi(ExamplePosition::Before);
        blocks.extend(split_blocks(
            &input.macros.substitute(&input.session.character.mes_example),
        ));
        blocks.extend(wi(ExamplePosition::After));
        blocks
    }

    fn examples(&self, input: &AssemblyInput<'_>) -> Vec<ExampleBlock> {
        let blocks = self.example_blocks(input);
        let pinned = self.config.context.pin_examples;
        let user = input.user();
        let block = |unit: PromptUnit| ExampleBlock { unit, pinned };

        match self.shape {
            PromptShape::Text => {
                let separator = &self.config.context.example_separator;
                let heading = if separator.is_empty() {
                    String::new()
                } else {
                    format!("{}\n", input.macros.substitute(separator))
                };
                if self.instruct() {
                    self.formatter(input)
                        .format_examples(&blocks, &heading, user, input.speaker)
                        .into_iter()
                        .map(|text| block(PromptUnit::text(text)))
                        .collect()
                } else {
                    blocks
                        .iter()
                        .map(|b| block(PromptUnit::text(format!("{heading}{b}\n"))))
                        .collect()
                }
            }
            PromptShape::Chat => {
                let heading = &self.config.chat_completion.new_example_chat_prompt;
                blocks
                    .iter()
                    .map(|b| {
                        let mut messages = Vec::new();
                        if !heading.is_empty() {
                            messages.push(PromptMessage::system(input.macros.substitute(heading)));
                        }
                        messages.extend(parse_turns(b, user, input.speaker).into_iter().map(|t| {
                            let name = if t.is_user { "example_user" } else { "example_assistant" };
                            PromptMessage::system(t.content).with_name(name)
                        }));
                        block(PromptUnit::messages(messages))
                    })
                    .collect()
            }
        }
    }

    // ── Chat start ───────────────────────────────────────────────────────

    fn chat_start(&self, input: &AssemblyInput<'_>) -> PromptUnit {
        match self.shape {
            PromptShape::Text => {
                let start = &self.config.context.chat_start;
                if start.is_empty() {
                    PromptUnit::default()
                } else {
                    PromptUnit::text(format!("{}\n", input.macros.substitute(start)))
                }
            }
            PromptShape::Chat => {
                let start = &self.config.chat_completion.new_chat_prompt;
                if start.is_empty() {
                    PromptUnit::default()
                } else {
                    PromptUnit::messages(vec![PromptMessage::system(input.macros.substitute(start))])
                }
            }
        }
    }

    // ── History ──────────────────────────────────────────────────────────

    fn format_turn(&self, input: &AssemblyInput<'_>, name: &str, mes: &str, speaker: Speaker, slot: SequenceSlot) -> String {
        if self.instruct() {
            return self.formatter(input).format_chat(name, mes, speaker, slot);
        }
        match speaker {
            Speaker::Narrator => format!("{mes}\n"),
            _ => format!("{name}: {mes}\n"),
        }
    }

    fn message_name<'m>(&self, input: &'m AssemblyInput<'_>, message: &'m ChatMessage) -> &'m str {
        if message.name.is_empty() && !message.is_user {
            input.speaker
        } else {
            &message.name
        }
    }

    /// Text-shape rendering of chat message `index`.
    fn turn_text(&self, input: &AssemblyInput<'_>, index: usize, slot: SequenceSlot) -> String {
        let message = &input.session.chat[index];
        let mes = input.macros.substitute(&message.mes.replace(FORMAT_TOKEN, ""));
        let speaker = if message.is_system {
            Speaker::Narrator
        } else if message.is_user {
            Speaker::User
        } else {
            Speaker::Character
        };
        let name = self.message_name(input, message);

        let is_tail = input.is_continue() && index + 1 == input.session.chat.len();
        if !is_tail {
            return self.format_turn(input, name, &mes, speaker, slot);
        }

        // cut right where the written part ends, dropping suffixes
        let mut text = self.format_turn(input, name, &format!("{mes}{FORMAT_TOKEN}"), speaker, slot);
        if let Some(pos) = text.find(FORMAT_TOKEN) {
            text.truncate(pos);
        }
        text
    }

    fn turn_messages(&self, input: &AssemblyInput<'_>, message: &ChatMessage) -> Vec<PromptMessage> {
        if message.extra.is_small_sys {
            if message.extra.tool_invocations.is_empty() {
                return Vec::new();
            }
            let calls = message
                .extra
                .tool_invocations
                .iter()
                .map(|inv| MessageToolCall {
                    id: inv.id.clone(),
                    name: inv.name.clone(),
                    arguments: inv.parameters.clone(),
                })
                .collect();
            let mut messages = vec![PromptMessage {
                tool_calls: calls,
                ..PromptMessage::assistant("")
            }];
            messages.extend(
                message
                    .extra
                    .tool_invocations
                    .iter()
                    .map(|inv| PromptMessage::tool_result(inv.id.clone(), inv.result.clone())),
            );
            return messages;
        }

        let mes = input.macros.substitute(&message.mes.replace(FORMAT_TOKEN, ""));
        let name = self.message_name(input, message);
        let names_in_content = self.config.chat_completion.names_in_content;
        let content = if names_in_content && !message.is_system {
            format!("{name}: {mes}")
        } else {
            mes
        };
        let prompt = PromptMessage::new(message.role(), content);
        if input.session.group.is_some() && !names_in_content && !message.is_system {
            vec![prompt.with_name(sanitize_name(name))]
        } else {
            vec![prompt]
        }
    }

    fn injected_entry(&self, input: &AssemblyInput<'_>, role: PromptRole, text: String) -> HistoryEntry {
        let unit = match self.shape {
            PromptShape::Text => {
                let (name, speaker) = match role {
                    PromptRole::User => (input.user(), Speaker::User),
                    PromptRole::Assistant => (input.speaker, Speaker::Character),
                    PromptRole::System | PromptRole::Tool => ("System", Speaker::Narrator),
                };
                PromptUnit::text(self.format_turn(input, name, &text, speaker, SequenceSlot::Regular))
            }
            PromptShape::Chat => PromptUnit::messages(vec![PromptMessage::new(role, text)]),
        };
        HistoryEntry {
            unit,
            injected: true,
            source_index: None,
        }
    }

    fn history(&self, input: &AssemblyInput<'_>) -> Vec<HistoryEntry> {
        let chat = &input.session.chat;
        let end = input.history_end();
        let last_user = chat[..end].iter().rposition(|m| m.is_user && !m.is_system);
        let continue_tail = (input.is_continue() && end > 0).then(|| end - 1);

        let mut newest_first: Vec<HistoryEntry> = Vec::with_capacity(end);
        for index in (0..end).rev() {
            let message = &chat[index];
            let unit = match self.shape {
                PromptShape::Text => {
                    if message.extra.is_small_sys {
                        continue;
                    }
                    let slot = if Some(index) == continue_tail || Some(index) == last_user {
                        SequenceSlot::Last
                    } else {
                        SequenceSlot::Regular
                    };
                    PromptUnit::text(self.turn_text(input, index, slot))
                }
                PromptShape::Chat => {
                    let messages = self.turn_messages(input, message);
                    if messages.is_empty() {
                        continue;
                    }
                    PromptUnit::messages(messages)
                }
            };
            newest_first.push(HistoryEntry {
                unit,
                injected: false,
                source_index: Some(index),
            });
        }

        input.injections.inject(
            &mut newest_first,
            input.is_continue(),
            input.macros,
            |role, text| self.injected_entry(input, role, text),
        );

        newest_first.reverse();
        newest_first
    }

    /// Re-render the oldest user and character turns left after trimming with
    /// the "first" sequences, when those are configured.
    pub fn apply_first_sequences(&self, prompt: &mut AssembledPrompt, input: &AssemblyInput<'_>) {
        let cfg = &self.config.instruct;
        if !self.instruct() || (cfg.first_input_sequence.is_empty() && cfg.first_output_sequence.is_empty()) {
            return;
        }
        let chat = &input.session.chat;
        let continue_tail = input.is_continue().then(|| chat.len().saturating_sub(1));

        for want_user in [true, false] {
            let sequence = if want_user { &cfg.first_input_sequence } else { &cfg.first_output_sequence };
            if sequence.is_empty() {
                continue;
            }
            let found = prompt.history.iter_mut().find(|h| {
                h.source_index
                    .is_some_and(|i| chat[i].is_user == want_user && !chat[i].is_system)
            });
            if let Some(entry) = found
                && let Some(index) = entry.source_index
                && Some(index) != continue_tail
            {
                entry.unit.text = self.turn_text(input, index, SequenceSlot::First);
            }
        }
    }

    // ── Tail ─────────────────────────────────────────────────────────────

    fn tail(&self, input: &AssemblyInput<'_>) -> PromptUnit {
        let card = &input.session.character;
        let jailbreak = input
            .macros
            .clone()
            .with_original("")
            .substitute(&card.post_history_instructions);
        let quiet = match (input.generation_type, input.quiet_prompt) {
            (GenerationType::Quiet, Some(q)) if !q.trim().is_empty() => Some(input.macros.substitute(q)),
            _ => None,
        };

        match self.shape {
            PromptShape::Text => {
                let mut text = String::new();
                if !jailbreak.trim().is_empty() {
                    text.push_str(&self.format_turn(input, "System", &jailbreak, Speaker::Narrator, SequenceSlot::Regular));
                }
                if let Some(quiet) = &quiet {
                    text.push_str(&self.format_turn(input, input.user(), quiet, Speaker::Narrator, SequenceSlot::Regular));
                }
                text.push_str(&self.prompt_line(input));
                PromptUnit::text(text)
            }
            PromptShape::Chat => {
                let chat_cfg = &self.config.chat_completion;
                let mut messages = Vec::new();
                if !jailbreak.trim().is_empty() {
                    messages.push(PromptMessage::system(jailbreak));
                }
                let trailing = match input.generation_type {
                    GenerationType::Continue => Some(input.macros.substitute(&chat_cfg.continue_nudge_prompt)),
                    GenerationType::Impersonate => Some(input.macros.substitute(&chat_cfg.impersonation_prompt)),
                    GenerationType::Quiet => quiet,
                    _ => None,
                };
                if let Some(text) = trailing.filter(|t| !t.trim().is_empty()) {
                    messages.push(PromptMessage::system(text));
                }
                PromptUnit::messages(messages)
            }
        }
    }

    fn prompt_line(&self, input: &AssemblyInput<'_>) -> String {
        let line = match input.generation_type {
            GenerationType::Continue => return String::new(),
            GenerationType::Impersonate => PromptLine::Impersonate,
            GenerationType::Quiet => PromptLine::Quiet,
            _ => PromptLine::Reply,
        };
        let name = if line == PromptLine::Impersonate {
            input.user()
        } else {
            input.speaker
        };
        let bias = if line == PromptLine::Reply {
            input.macros.substitute(&self.config.context.user_prompt_bias)
        } else {
            String::new()
        };

        if self.instruct() {
            return self
                .formatter(input)
                .format_prompt_line(name, line, &bias, input.force_name);
        }
        match line {
            PromptLine::Quiet => String::new(),
            _ if bias.trim().is_empty() => format!("{name}:"),
            _ => format!("{name}: {}", bias.trim_start()),
        }
    }
}

/// Restrict a speaker name to what chat APIs accept in `name`.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}
