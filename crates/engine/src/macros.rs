//! Macro substitution for prompt text.
//!
//! Macros are `{{name}}` tokens, matched case-insensitively, plus the legacy
//! `<USER>`, `<BOT>` and `<CHAR>` placeholders. Unknown macros are left as
//! written so later passes (or the backend) see them untouched.
//!
//! There are deliberately no clock- or random-based macros: the same session
//! must always assemble to the same prompt.

use promptloom_core::session::Session;
use regex_lite::{Captures, Regex};
use std::sync::OnceLock;

fn macro_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]*)\}\}").expect("macro regex"))
}

fn legacy_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<(USER|BOT|CHAR)>").expect("legacy macro regex"))
}

fn trim_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(?:\r?\n)*\{\{trim\}\}(?:\r?\n)*").expect("trim regex"))
}

/// Values available to macro substitution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacroContext {
    /// `{{user}}`, `<USER>`
    pub user: String,
    /// `{{char}}`, `<BOT>`, `<CHAR>`
    pub character: String,
    /// `{{group}}`
    pub group: String,
    pub char_if_not_group: String,
    pub description: String,
    pub personality: String,
    pub scenario: String,
    /// `{{persona}}`: the user persona description
    pub persona: String,
    pub mes_examples: String,
    /// `{{original}}`: the text an override replaces
    pub original: String,
    pub last_chat_message: String,
}

impl MacroContext {
    /// Names only; every other value empty.
    pub fn with_names(user: impl Into<String>, character: impl Into<String>) -> Self {
        let character = character.into();
        Self {
            user: user.into(),
            group: character.clone(),
            char_if_not_group: character.clone(),
            character,
            ..Self::default()
        }
    }

    /// Build the context for `speaker` replying in `session`.
    ///
    /// Card fields are substituted once against the names, so a description
    /// mentioning `{{char}}` expands correctly wherever `{{description}}` lands.
    pub fn for_session(session: &Session, speaker: &str) -> Self {
        let mut ctx = Self::with_names(session.persona.name.clone(), speaker);
        if let Some(group) = &session.group {
            let names = group.member_names();
            ctx.group = names.clone();
            ctx.char_if_not_group = names;
        }

        let card = &session.character;
        ctx.description = ctx.substitute(&card.description);
        ctx.personality = ctx.substitute(&card.personality);
        ctx.scenario = ctx.substitute(session.effective_scenario());
        ctx.persona = ctx.substitute(&session.persona.description);
        ctx.last_chat_message = session
            .chat
            .last()
            .map(|m| m.mes.clone())
            .unwrap_or_default();
        ctx
    }

    pub fn with_original(mut self, original: impl Into<String>) -> Self {
        self.original = original.into();
        self
    }

    pub fn with_mes_examples(mut self, examples: impl Into<String>) -> Self {
        self.mes_examples = examples.into();
        self
    }

    /// Replace every known macro in `text`.
    ///
    /// `{{original}}` expands only at its first occurrence; later occurrences
    /// become empty.
    pub fn substitute(&self, text: &str) -> String {
        if !text.contains("{{") && !text.contains('<') {
            return text.to_string();
        }

        let text = trim_regex().replace_all(text, "");

        let mut original_used = false;
        let text = macro_regex().replace_all(&text, |caps: &Captures<'_>| {
            let key = caps[1].trim().to_ascii_lowercase();
            if key.starts_with("//") {
                return String::new();
            }
            match key.as_str() {
                "user" => self.user.clone(),
                "char" => self.character.clone(),
                "group" => self.group.clone(),
                "charifnotgroup" => self.char_if_not_group.clone(),
                "description" => self.description.clone(),
                "personality" => self.personality.clone(),
                "scenario" => self.scenario.clone(),
                "persona" => self.persona.clone(),
                "mesexamples" => self.mes_examples.clone(),
                "lastchatmessage" => self.last_chat_message.clone(),
                "newline" => "\n".to_string(),
                "noop" => String::new(),
                "original" => {
                    if original_used {
                        String::new()
                    } else {
                        original_used = true;
                        self.original.clone()
                    }
                }
                _ => caps[0].to_string(),
            }
        });

        legacy_regex()
            .replace_all(&text, |caps: &Captures<'_>| {
                if caps[1].eq_ignore_ascii_case("user") {
                    self.user.clone()
                } else {
                    self.character.clone()
                }
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptloom_core::character::{CharacterCard, GroupChat, GroupMember, Persona};

    fn ctx() -> MacroContext {
        MacroContext::with_names("Alice", "Seraphina")
    }

    #[test]
    fn substitutes_names_case_insensitively() {
        assert_eq!(
            ctx().substitute("{{User}} waves at {{CHAR}}."),
            "Alice waves at Seraphina."
        );
    }

    #[test]
    fn legacy_placeholders() {
        assert_eq!(ctx().substitute("<USER> and <bot> and <CHAR>"), "Alice and Seraphina and Seraphina");
    }

    #[test]
    fn unknown_macro_left_verbatim() {
        assert_eq!(ctx().substitute("{{wiBefore}} {{name}}"), "{{wiBefore}} {{name}}");
    }

    #[test]
    fn original_expands_once() {
        let c = ctx().with_original("BASE");
        assert_eq!(c.substitute("{{original}} + {{original}}"), "BASE + ");
    }

    #[test]
    fn trim_comment_noop_newline() {
        let c = ctx();
        assert_eq!(c.substitute("a\n\n{{trim}}\nb"), "ab");
        assert_eq!(c.substitute("x{{// a note}}y{{noop}}z"), "xyz");
        assert_eq!(c.substitute("one{{newline}}two"), "one\ntwo");
    }

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(ctx().substitute("2 < 3 and 4 > 1"), "2 < 3 and 4 > 1");
    }

    #[test]
    fn session_context_expands_card_fields() {
        let mut card = CharacterCard::named("Seraphina");
        card.description = "{{char}} guards the forest.".into();
        card.scenario = "{{user}} is lost.".into();
        let mut persona = Persona::named("Alice");
        persona.description = "A traveler.".into();
        let session = Session::new(card, persona);

        let c = MacroContext::for_session(&session, "Seraphina");
        assert_eq!(c.description, "Seraphina guards the forest.");
        assert_eq!(c.scenario, "Alice is lost.");
        assert_eq!(c.substitute("{{persona}}"), "A traveler.");
    }

    #[test]
    fn group_macros_list_members() {
        let session = Session::new(CharacterCard::named("Aria"), Persona::named("Alice")).with_group(
            GroupChat {
                name: "Party".into(),
                members: vec![
                    GroupMember { name: "Aria".into(), enabled: true },
                    GroupMember { name: "Bram".into(), enabled: true },
                ],
            },
        );
        let c = MacroContext::for_session(&session, "Bram");
        assert_eq!(c.substitute("{{char}} in {{group}}"), "Bram in Aria, Bram");
    }
}
