//! Response cleanup.
//!
//! Raw model output is cumulative and noisy: it may run past a stop string,
//! echo the speaker's name, or stop mid-sentence. [`clean_up_message`] turns it
//! into the text that is written into the chat. It is applied to every
//! streamed chunk (with `is_final = false`) and once more to the final text.

use promptloom_config::ContextConfig;
use regex_lite::Regex;
use std::sync::OnceLock;

fn newlines_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n+").expect("newline regex"))
}

fn trailing_space_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)[ \t]+$").expect("trailing space regex"))
}

fn emphasis_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*([^*\n]+)\*").expect("emphasis regex"))
}

/// Characters a sentence may end with.
const SENTENCE_END: &[char] = &[
    '.', '!', '?', '*', '"', ')', '}', '`', ']', '$', '。', '！', '？', '”', '）', '】', '’', '」', '_',
];

/// What cleanup needs to know about the run.
#[derive(Debug, Clone)]
pub struct CleanupOptions<'a> {
    pub context: &'a ContextConfig,
    pub stop_strings: &'a [String],
    pub user: &'a str,
    pub speaker: &'a str,
    /// Already macro-substituted; empty when no bias applies
    pub prompt_bias: &'a str,
    pub is_impersonate: bool,
    pub is_continue: bool,
}

/// Clean raw (cumulative) model output.
pub fn clean_up_message(raw: &str, opts: &CleanupOptions<'_>, is_final: bool) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let ctx = opts.context;

    let mut text = if !opts.prompt_bias.is_empty() && !opts.is_impersonate && !opts.is_continue {
        format!("{}{raw}", opts.prompt_bias)
    } else {
        raw.to_string()
    };

    if ctx.collapse_newlines {
        text = newlines_regex().replace_all(&text, "\n").into_owned();
    }
    text = trailing_space_regex().replace_all(&text, "").into_owned();

    if !opts.is_continue {
        let name = if opts.is_impersonate { opts.user } else { opts.speaker };
        if (opts.is_impersonate || !ctx.allow_name2_display) && !name.is_empty() {
            text = strip_name_prefix(&text, name);
        }
    }

    let user_turn = format!("\n{}:", opts.user);
    let mut cut_at: Option<usize> = None;
    let extra = (!ctx.allow_name1_display && !opts.is_impersonate).then_some(user_turn.as_str());
    for stop in opts.stop_strings.iter().map(String::as_str).chain(extra) {
        if stop.is_empty() {
            continue;
        }
        if let Some(pos) = text.find(stop) {
            cut_at = Some(cut_at.map_or(pos, |c| c.min(pos)));
        }
    }
    if let Some(pos) = cut_at {
        text.truncate(pos);
    }

    for stop in opts.stop_strings {
        strip_partial_stop(&mut text, stop);
    }

    if ctx.auto_fix_markdown {
        text = fix_markdown(&text);
    }

    if is_final && ctx.trim_sentences {
        text = trim_to_end_sentence(&text);
    }

    if ctx.trim_spaces {
        text = if opts.is_continue {
            text.trim_end().to_string()
        } else {
            text.trim().to_string()
        };
    }

    if !is_final {
        text = balance_markdown(&text);
    }

    text
}

fn strip_name_prefix(text: &str, name: &str) -> String {
    let leading = text.trim_start();
    match leading.strip_prefix(name).and_then(|r| r.strip_prefix(':')) {
        Some(rest) => rest.trim_start().to_string(),
        None => text.to_string(),
    }
}

/// Drop a tail that is the beginning of `stop` (the model was about to emit it).
fn strip_partial_stop(text: &mut String, stop: &str) {
    if stop.is_empty() {
        return;
    }
    let ends: Vec<usize> = stop
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .collect();
    for &end in ends.iter().rev() {
        if text.ends_with(&stop[..end]) {
            let new_len = text.len() - end;
            text.truncate(new_len);
            return;
        }
    }
}

/// Remove stray spaces just inside `*emphasis*` markers.
pub fn fix_markdown(text: &str) -> String {
    emphasis_regex()
        .replace_all(text, |caps: &regex_lite::Captures<'_>| {
            format!("*{}*", caps[1].trim())
        })
        .into_owned()
}

/// Close unterminated code fences, emphasis, and quotes in partial output.
pub fn balance_markdown(text: &str) -> String {
    if text.matches("```").count() % 2 == 1 {
        return format!("{text}\n```");
    }
    let mut out = text.to_string();
    if out.matches('*').count() % 2 == 1 {
        out.push('*');
    }
    if out.matches('"').count() % 2 == 1 {
        out.push('"');
    }
    out
}

/// Cut after the last sentence-ending character.
pub fn trim_to_end_sentence(text: &str) -> String {
    let Some((idx, ch)) = text.char_indices().rev().find(|(_, c)| SENTENCE_END.contains(c)) else {
        return text.trim_end().to_string();
    };
    // a closing mark preceded by whitespace belongs to the next sentence
    let preceded_by_space = text[..idx].chars().next_back().is_some_and(char::is_whitespace);
    let end = if preceded_by_space {
        idx
    } else {
        idx + ch.len_utf8()
    };
    text[..end].trim_end().to_string()
}
