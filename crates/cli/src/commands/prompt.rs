//! `promptloom prompt`: dry-run assembly.
//!
//! Builds the prompt exactly as a normal reply would, then prints it together
//! with the token budget report. The backend is never contacted.

use super::{CliResult, load_card, load_config, open_session};
use promptloom_core::session::GenerationType;
use promptloom_engine::{GenerationPipeline, GenerationRequest, PreparedPrompt, PromptShape};
use std::path::Path;
use std::sync::Arc;

/// Human-readable rendering of a prepared prompt.
pub fn render(prepared: &PreparedPrompt) -> String {
    let report = &prepared.report;
    let mut out = String::new();
    if prepared.prompt.shape == PromptShape::Chat {
        for message in prepared.prompt.render_messages() {
            let name = message.name.as_deref().map(|n| format!(" ({n})")).unwrap_or_default();
            out.push_str(&format!("[{}{name}]\n{}\n\n", message.role.as_str(), message.content));
        }
    } else {
        out.push_str(&prepared.prompt.render_text());
        out.push_str("\n\n");
    }

    out.push_str(&format!("Speaker:          {}\n", prepared.speaker));
    out.push_str(&format!("Budget:           {} tokens\n", report.budget));
    out.push_str(&format!(
        "Prompt:           {} tokens (before trimming: {})\n",
        report.final_tokens, report.initial_tokens
    ));
    out.push_str(&format!(
        "Trimmed:          {} example block(s), {} history entry(ies)\n",
        report.removed_examples, report.removed_history
    ));
    if report.over_budget {
        out.push_str("Warning:          the prompt still exceeds the budget\n");
    }
    let stops: Vec<String> = prepared.prompt.stop_strings.iter().map(|s| format!("{s:?}")).collect();
    out.push_str(&format!("Stop strings:     {}\n", stops.join(", ")));
    out
}

pub async fn run(character: &Path, chat: Option<&Path>, user: &str) -> CliResult {
    let config = load_config()?;
    let card = load_card(character).await?;
    let (mut session, _) = open_session(&config, card, chat, user).await?;
    let backend = promptloom_providers::build_from_config(&config)?;

    let pipeline = GenerationPipeline::new(backend, Arc::new(config));
    let prepared = pipeline
        .prepare_prompt(&mut session, &GenerationRequest::new(GenerationType::Normal))
        .await;
    print!("{}", render(&prepared));
    Ok(())
}
