//! Instruct-mode formatting.
//!
//! Instruction-tuned models expect each turn wrapped in explicit delimiter
//! sequences (`### Instruction:` / `### Response:` and friends) instead of
//! plain `Name: text` lines. [`InstructFormatter`] applies those sequences to
//! chat turns, example dialogue, the story string, and the final prompt line,
//! and derives the stop strings the sequences imply.

use crate::examples::parse_turns;
use crate::macros::MacroContext;
use promptloom_config::{InstructConfig, NamesBehavior};
use regex_lite::{NoExpand, Regex};
use std::sync::OnceLock;

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\{\{name\}\}").expect("name macro regex"))
}

/// Who speaks a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Character,
    Narrator,
}

/// Which sequence variant a turn uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SequenceSlot {
    #[default]
    Regular,
    /// Oldest turn of its kind in the context
    First,
    /// Newest turn of its kind in the context
    Last,
}

/// What the final prompt line asks the model to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptLine {
    Reply,
    Impersonate,
    Quiet,
}

pub struct InstructFormatter<'a> {
    config: &'a InstructConfig,
    macros: &'a MacroContext,
    in_group: bool,
}

impl<'a> InstructFormatter<'a> {
    pub fn new(config: &'a InstructConfig, macros: &'a MacroContext, in_group: bool) -> Self {
        Self {
            config,
            macros,
            in_group,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn separator(&self) -> &'static str {
        if self.config.wrap { "\n" } else { "" }
    }

    /// Substitute macros and `{{name}}` in a sequence.
    fn expand(&self, sequence: &str, name: &str) -> String {
        if !self.config.macro_substitution || sequence.is_empty() {
            return sequence.to_string();
        }
        let name = if name.is_empty() { "System" } else { name };
        let substituted = self.macros.substitute(sequence);
        name_regex()
            .replace_all(&substituted, NoExpand(name))
            .into_owned()
    }

    fn prefix(&self, speaker: Speaker, slot: SequenceSlot) -> &'a str {
        let c = self.config;
        let pick = |first: &'a str, last: &'a str, regular: &'a str| match slot {
            SequenceSlot::First if !first.is_empty() => first,
            SequenceSlot::Last if !last.is_empty() => last,
            _ => regular,
        };
        match speaker {
            Speaker::Narrator if c.system_same_as_user => c.input_sequence.as_str(),
            Speaker::Narrator => c.system_sequence.as_str(),
            Speaker::User => pick(
                c.first_input_sequence.as_str(),
                c.last_input_sequence.as_str(),
                c.input_sequence.as_str(),
            ),
            Speaker::Character => pick(
                c.first_output_sequence.as_str(),
                c.last_output_sequence.as_str(),
                c.output_sequence.as_str(),
            ),
        }
    }

    fn suffix(&self, speaker: Speaker) -> &'a str {
        let c = self.config;
        match speaker {
            Speaker::Narrator if c.system_same_as_user => c.input_suffix.as_str(),
            Speaker::Narrator => c.system_suffix.as_str(),
            Speaker::User => c.input_suffix.as_str(),
            Speaker::Character => c.output_suffix.as_str(),
        }
    }

    fn names_forced(&self) -> bool {
        match self.config.names_behavior {
            NamesBehavior::Always => true,
            NamesBehavior::Force => self.in_group,
            NamesBehavior::None => false,
        }
    }

    fn include_names(&self, speaker: Speaker) -> bool {
        match speaker {
            Speaker::Narrator => false,
            Speaker::User => self.config.names_behavior == NamesBehavior::Always,
            Speaker::Character => self.names_forced(),
        }
    }

    /// Wrap one chat turn in its sequences.
    pub fn format_chat(&self, name: &str, mes: &str, speaker: Speaker, slot: SequenceSlot) -> String {
        let prefix = self.expand(self.prefix(speaker, slot), name);
        let mut suffix = self.expand(self.suffix(speaker), name);
        if suffix.is_empty() && self.config.wrap {
            suffix.push('\n');
        }

        let body = if self.include_names(speaker) && !name.is_empty() {
            format!("{name}: {mes}{suffix}")
        } else {
            format!("{mes}{suffix}")
        };

        if prefix.is_empty() {
            body
        } else {
            format!("{prefix}{}{body}", self.separator())
        }
    }

    /// The line that hands the turn to the model.
    pub fn format_prompt_line(&self, name: &str, line: PromptLine, bias: &str, force_name: bool) -> String {
        let c = self.config;
        let include_names = !name.is_empty() && (force_name || self.names_forced());
        let sequence = match line {
            PromptLine::Impersonate if !c.last_input_sequence.is_empty() => &c.last_input_sequence,
            PromptLine::Impersonate => &c.input_sequence,
            PromptLine::Quiet if !c.last_system_sequence.is_empty() => &c.last_system_sequence,
            PromptLine::Reply | PromptLine::Quiet if !c.last_output_sequence.is_empty() => {
                &c.last_output_sequence
            }
            PromptLine::Reply | PromptLine::Quiet => &c.output_sequence,
        };
        let sequence = self.expand(sequence, name);
        let sep = self.separator();

        let mut text = if include_names {
            format!("{sep}{sequence}{sep}{name}:")
        } else {
            format!("{sep}{sequence}")
        };

        // the quiet prompt already ends with a newline
        if line == PromptLine::Quiet && !sep.is_empty() {
            text.replace_range(..sep.len(), "");
        }

        if line != PromptLine::Impersonate && !bias.is_empty() {
            if include_names {
                text.push(' ');
                text.push_str(bias.trim_start());
            } else {
                text.push_str(sep);
                text.push_str(bias.trim_start());
            }
        }

        let mut text = if c.wrap {
            text.trim_end().to_string()
        } else {
            text
        };
        if !include_names {
            text.push_str(sep);
        }
        text
    }

    /// Wrap the story string in the system sequence.
    pub fn format_story_string(&self, story: &str) -> String {
        let sequence = self.expand(&self.config.system_sequence, "System");
        let suffix = self.expand(&self.config.system_suffix, "System");
        if sequence.is_empty() && suffix.is_empty() {
            return story.to_string();
        }

        let sep = self.separator();
        let mut out = String::with_capacity(story.len() + sequence.len() + suffix.len() + 2);
        if !sequence.is_empty() {
            out.push_str(&sequence);
            out.push_str(sep);
        }
        out.push_str(story);
        if !suffix.is_empty() {
            out.push_str(&suffix);
            out.push_str(sep);
        }
        out
    }

    /// Re-wrap example blocks turn by turn; one string per block.
    ///
    /// With `skip_examples` (or when a block has no recognizable turns) the
    /// raw block is kept under its heading.
    pub fn format_examples(&self, blocks: &[String], heading: &str, user: &str, character: &str) -> Vec<String> {
        let raw = |block: &String| format!("{heading}{block}\n");
        if self.config.skip_examples {
            return blocks.iter().map(raw).collect();
        }

        blocks
            .iter()
            .map(|block| {
                let turns = parse_turns(block, user, character);
                if turns.is_empty() {
                    return raw(block);
                }
                let mut out = heading.to_string();
                for turn in turns {
                    let (speaker, name) = if turn.is_user {
                        (Speaker::User, user)
                    } else {
                        (Speaker::Character, character)
                    };
                    let content = if self.names_forced() {
                        format!("{name}: {}", turn.content)
                    } else {
                        turn.content
                    };
                    out.push_str(&self.format_turn_unnamed(name, &content, speaker));
                }
                out
            })
            .collect()
    }

    fn format_turn_unnamed(&self, name: &str, content: &str, speaker: Speaker) -> String {
        let prefix = self.expand(self.prefix(speaker, SequenceSlot::Regular), name);
        let mut suffix = self.expand(self.suffix(speaker), name);
        if suffix.is_empty() && self.config.wrap {
            suffix.push('\n');
        }
        if prefix.is_empty() {
            format!("{content}{suffix}")
        } else {
            format!("{prefix}{}{content}{suffix}", self.separator())
        }
    }

    /// Stop strings implied by the sequences.
    ///
    /// The explicit stop sequence is always included; the turn sequences only
    /// when `sequences_as_stop_strings` is set. Whitespace-only sequences are
    /// skipped.
    pub fn stop_sequences(&self, user: &str, character: &str) -> Vec<String> {
        if !self.config.enabled {
            return Vec::new();
        }
        let c = self.config;
        let mut candidates = vec![c.stop_sequence.clone()];
        if c.sequences_as_stop_strings {
            candidates.extend([
                self.expand(&c.input_sequence, user),
                self.expand(&c.output_sequence, character),
                self.expand(&c.first_output_sequence, character),
                self.expand(&c.last_output_sequence, character),
                self.expand(&c.system_sequence, "System"),
                self.expand(&c.last_system_sequence, "System"),
            ]);
        }

        let mut out: Vec<String> = Vec::new();
        for sequence in candidates.iter().flat_map(|s| s.split('\n')) {
            if sequence.trim().is_empty() {
                continue;
            }
            let mut wrapped = if c.wrap {
                format!("\n{sequence}")
            } else {
                sequence.to_string()
            };
            if c.macro_substitution {
                wrapped = self.macros.substitute(&wrapped);
            }
            if !out.contains(&wrapped) {
                out.push(wrapped);
            }
        }
        out
    }
}
