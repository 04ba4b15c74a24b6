//! Example dialogue parsing.
//!
//! Cards carry example chats as `<START>`-separated blocks of
//! `Name: text` lines. Blocks are the unit the budget manager trims.

use regex_lite::Regex;
use std::sync::OnceLock;

fn start_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<START>").expect("example start regex"))
}

/// One speaker turn inside an example block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExampleTurn {
    pub is_user: bool,
    pub content: String,
}

/// Split example dialogue into trimmed, non-empty blocks.
pub fn split_blocks(examples: &str) -> Vec<String> {
    let text = examples.replace('\r', "");
    start_regex()
        .split(&text)
        .map(str::trim)
        .filter(|block| !block.is_empty())
        .map(str::to_string)
        .collect()
}

/// Break a block into speaker turns.
///
/// Lines prefixed `user:` or `character:` start a new turn; other lines
/// continue the current one. Text before the first speaker is carried into
/// the first turn.
pub fn parse_turns(block: &str, user: &str, character: &str) -> Vec<ExampleTurn> {
    let user_prefix = format!("{user}:");
    let char_prefix = format!("{character}:");

    let mut turns = Vec::new();
    let mut current: Option<bool> = None;
    let mut lines: Vec<&str> = Vec::new();

    let mut flush = |speaker: Option<bool>, lines: &mut Vec<&str>| {
        if let Some(is_user) = speaker {
            let content = lines.join("\n").trim().to_string();
            if !content.is_empty() {
                turns.push(ExampleTurn { is_user, content });
            }
            lines.clear();
        }
    };

    for line in block.lines() {
        let (speaker, body) = if let Some(rest) = line.strip_prefix(&user_prefix) {
            (Some(true), rest)
        } else if let Some(rest) = line.strip_prefix(&char_prefix) {
            (Some(false), rest)
        } else {
            (None, line)
        };

        if speaker.is_some() {
            flush(current, &mut lines);
            current = speaker;
        }
        lines.push(body);
    }
    flush(current, &mut lines);

    turns
}
