//! `promptloom chat`: interactive or single-message chat.

use super::{CliResult, load_card, load_config, open_session};
use promptloom_core::abort::AbortSignal;
use promptloom_core::event::PipelineEvent;
use promptloom_core::message::ChatMessage;
use promptloom_core::session::{GenerationType, Session};
use promptloom_engine::swipe::{SwipeDirection, SwipeNavigation, delete_swipe, navigate};
use promptloom_engine::{EngineError, GenerationOutcome, GenerationPipeline, GenerationRequest, ensure_greeting};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Say(String),
    Swipe,
    Regenerate,
    Continue,
    Impersonate,
    Left,
    Right,
    DeleteSwipe,
    Help,
    Quit,
    Unknown(String),
}

impl ChatCommand {
    /// Parse a line; blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Some(Self::Say(line.to_string()));
        };
        Some(match command.to_ascii_lowercase().as_str() {
            "swipe" => Self::Swipe,
            "regen" | "regenerate" => Self::Regenerate,
            "continue" | "cont" => Self::Continue,
            "impersonate" | "imp" => Self::Impersonate,
            "left" => Self::Left,
            "right" => Self::Right,
            "delswipe" => Self::DeleteSwipe,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => Self::Unknown(other.to_string()),
        })
    }
}

/// Renders committed chunks as a growing line of text.
#[derive(Debug, Default)]
pub struct ChunkPrinter {
    printed: String,
    speaker: String,
}

impl ChunkPrinter {
    pub fn new(speaker: impl Into<String>) -> Self {
        Self {
            printed: String::new(),
            speaker: speaker.into(),
        }
    }

    pub fn on_event(&mut self, event: &PipelineEvent, out: &mut impl Write) -> std::io::Result<()> {
        match event {
            PipelineEvent::ChunkCommitted { text, .. } => {
                if self.printed.is_empty() {
                    write!(out, "  {} > ", self.speaker)?;
                }
                match text.strip_prefix(self.printed.as_str()) {
                    Some(delta) => write!(out, "{delta}")?,
                    // cleanup rewrote already printed text
                    None => write!(out, "\n  {} > {text}", self.speaker)?,
                }
                self.printed = text.clone();
                out.flush()?;
            }
            PipelineEvent::Finished { .. } | PipelineEvent::Stopped { .. } => {
                if !self.printed.is_empty() {
                    writeln!(out)?;
                }
                self.printed.clear();
            }
            PipelineEvent::ToolsInvoked { invocations, errors, .. } => {
                writeln!(out, "  [{invocations} tool call(s)]")?;
                for error in errors {
                    writeln!(out, "  [tool error] {error}")?;
                }
            }
            PipelineEvent::Started { .. } | PipelineEvent::Errored { .. } => {}
        }
        Ok(())
    }
}

/// Run one generation while echoing its events to stdout.
///
/// Ctrl+C during the run stops it and keeps the partial reply.
async fn generate_and_print(
    pipeline: &GenerationPipeline,
    session: &mut Session,
    request: GenerationRequest,
) -> Result<GenerationOutcome, EngineError> {
    let mut printer = ChunkPrinter::new(session.character.name.clone());
    let mut events = pipeline.event_bus().subscribe();
    let abort = AbortSignal::new();
    let watcher = {
        let abort = abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                abort.abort();
            }
        })
    };

    let generation = pipeline.generate(session, request.with_abort(abort));
    tokio::pin!(generation);
    let mut stdout = std::io::stdout();
    let result = loop {
        tokio::select! {
            result = &mut generation => break result,
            Ok(event) = events.recv() => {
                let _ = printer.on_event(&event, &mut stdout);
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        let _ = printer.on_event(&event, &mut stdout);
    }
    watcher.abort();
    result
}

fn print_last(session: &Session) {
    if let Some(message) = session.chat.last() {
        let position = match (message.swipe_id, message.swipe_count()) {
            (Some(id), count) if count > 1 => format!(" [{}/{count}]", id + 1),
            _ => String::new(),
        };
        println!("  {}{position} > {}", message.name, message.mes);
    }
}

fn report(outcome: Result<GenerationOutcome, EngineError>) {
    match outcome {
        Ok(GenerationOutcome::Detached { text }) => println!("  (suggested) > {text}"),
        Ok(GenerationOutcome::Empty) => println!("  [The backend returned an empty reply]"),
        Ok(GenerationOutcome::Stopped { .. }) => println!("  [Stopped]"),
        Ok(GenerationOutcome::ToolsOnly { errors, .. }) if !errors.is_empty() => {
            println!("  [Tools finished with {} error(s)]", errors.len());
        }
        Ok(_) => {}
        Err(e) => eprintln!("  [Error] {e}"),
    }
}

/// Move through the last reply's swipes; `Some` when a new one must be generated.
fn swipe_or_generate(session: &mut Session, direction: SwipeDirection) -> Option<GenerationType> {
    match navigate(session, direction) {
        SwipeNavigation::Generate => Some(GenerationType::Swipe),
        SwipeNavigation::Moved { .. } | SwipeNavigation::Wrapped { .. } => {
            print_last(session);
            None
        }
        SwipeNavigation::Unchanged => {
            println!("  [Nothing to swipe]");
            None
        }
    }
}

async fn handle(pipeline: &GenerationPipeline, session: &mut Session, command: ChatCommand) -> bool {
    let user = session.persona.name.clone();
    let generation = match command {
        ChatCommand::Quit => return false,
        ChatCommand::Help => {
            println!("  /swipe /regen /continue /impersonate /left /right /delswipe /quit");
            return true;
        }
        ChatCommand::Unknown(name) => {
            println!("  Unknown command: /{name} (try /help)");
            return true;
        }
        ChatCommand::Say(text) => {
            session.chat.push(ChatMessage::user(user, text));
            GenerationType::Normal
        }
        ChatCommand::Swipe => GenerationType::Swipe,
        ChatCommand::Regenerate => GenerationType::Regenerate,
        ChatCommand::Continue => GenerationType::Continue,
        ChatCommand::Impersonate => GenerationType::Impersonate,
        ChatCommand::Left => match swipe_or_generate(session, SwipeDirection::Left) {
            Some(generation) => generation,
            None => return true,
        },
        ChatCommand::Right => match swipe_or_generate(session, SwipeDirection::Right) {
            Some(generation) => generation,
            None => return true,
        },
        ChatCommand::DeleteSwipe => {
            let deleted = match session.chat.last_mut() {
                Some(m) if !m.is_user => m.swipe_id.is_some_and(|id| delete_swipe(m, id)),
                _ => false,
            };
            if deleted {
                print_last(session);
            } else {
                println!("  [Cannot delete the only swipe]");
            }
            return true;
        }
    };

    report(generate_and_print(pipeline, session, GenerationRequest::new(generation)).await);
    true
}

pub async fn run(character: &Path, chat: Option<&Path>, message: Option<String>, user: &str) -> CliResult {
    let config = load_config()?;
    let card = load_card(character).await?;
    let (mut session, store) = open_session(&config, card, chat, user).await?;
    let backend = promptloom_providers::build_from_config(&config)?;

    let model = if config.model.is_empty() { "(backend default)".to_string() } else { config.model.clone() };
    let mut pipeline = GenerationPipeline::new(backend.clone(), Arc::new(config));
    if let Some(store) = store {
        pipeline = pipeline.with_store(store);
    }

    ensure_greeting(&mut session);

    if let Some(message) = message {
        handle(&pipeline, &mut session, ChatCommand::Say(message)).await;
        return Ok(());
    }

    println!();
    println!("  PromptLoom: chatting with {}", session.character.name);
    println!("  Backend:   {} ({})", backend.name(), backend.family());
    println!("  Model:     {model}");
    println!("  Chat:      {}", session.chat_id);
    println!("  Type a message, or /help for commands. Ctrl+D quits.");
    println!();
    print_last(&session);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  {} > ", session.persona.name);
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let Some(command) = ChatCommand::parse(&line) else {
            continue;
        };
        if !handle(&pipeline, &mut session, command).await {
            break;
        }
    }

    println!();
    println!("  Goodbye!");
    Ok(())
}
