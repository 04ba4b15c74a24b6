//! Character cards, user personas, and group chats.
//!
//! Cards are accepted in both the flat V1 layout and the V2 envelope
//! (`{"spec": "chara_card_v2", "data": {...}}`).

use crate::message::{InjectionPosition, PromptRole};
use serde::{Deserialize, Serialize};

/// Character's note injected into chat history at a fixed depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthPrompt {
    #[serde(default)]
    pub prompt: String,

    #[serde(default = "default_depth_prompt_depth")]
    pub depth: u32,

    #[serde(default = "default_depth_prompt_role")]
    pub role: PromptRole,
}

fn default_depth_prompt_depth() -> u32 {
    4
}
fn default_depth_prompt_role() -> PromptRole {
    PromptRole::System
}

impl Default for DepthPrompt {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            depth: default_depth_prompt_depth(),
            role: default_depth_prompt_role(),
        }
    }
}

/// A character card: the persona the AI plays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterCard {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub personality: String,

    #[serde(default)]
    pub scenario: String,

    /// Greeting placed into a fresh chat
    #[serde(default)]
    pub first_mes: String,

    /// Example dialogue, `<START>`-separated blocks
    #[serde(default)]
    pub mes_example: String,

    #[serde(default)]
    pub alternate_greetings: Vec<String>,

    /// Card-level system prompt override
    #[serde(default)]
    pub system_prompt: String,

    /// Post-history instructions ("jailbreak")
    #[serde(default)]
    pub post_history_instructions: String,

    #[serde(default)]
    pub depth_prompt: DepthPrompt,
}

#[derive(Deserialize)]
struct CardEnvelope {
    spec: String,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct CardExtensions {
    #[serde(default)]
    depth_prompt: Option<DepthPrompt>,
}

impl CharacterCard {
    /// Create a bare card with just a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parse a card from JSON, accepting both V1 (flat) and V2 (envelope) layouts.
    ///
    /// In V2 cards the depth prompt lives under `data.extensions.depth_prompt`.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(json)?;

        let data = match serde_json::from_value::<CardEnvelope>(value.clone()) {
            Ok(envelope) if envelope.spec.starts_with("chara_card_v") => envelope.data,
            _ => value,
        };

        let mut card: CharacterCard = serde_json::from_value(data.clone())?;
        if let Some(extensions) = data.get("extensions") {
            let ext: CardExtensions = serde_json::from_value(extensions.clone())?;
            if let Some(depth_prompt) = ext.depth_prompt {
                card.depth_prompt = depth_prompt;
            }
        }
        Ok(card)
    }

    /// All greetings in swipe order: `first_mes` followed by the alternates.
    pub fn greetings(&self) -> Vec<String> {
        std::iter::once(self.first_mes.clone())
            .chain(self.alternate_greetings.iter().cloned())
            .collect()
    }
}

/// Where the user persona description is placed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaPosition {
    /// Inside the story string (`{{persona}}`)
    #[default]
    InPrompt,
    /// Injected into chat history at `depth`
    AtDepth,
    /// Not sent at all
    None,
}

impl PersonaPosition {
    pub fn injection_position(&self) -> InjectionPosition {
        match self {
            Self::InPrompt => InjectionPosition::InPrompt,
            Self::AtDepth => InjectionPosition::InChat,
            Self::None => InjectionPosition::None,
        }
    }
}

/// The user's persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub position: PersonaPosition,

    #[serde(default = "default_depth_prompt_depth")]
    pub depth: u32,

    #[serde(default = "default_depth_prompt_role")]
    pub role: PromptRole,
}

impl Persona {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            position: PersonaPosition::InPrompt,
            depth: default_depth_prompt_depth(),
            role: default_depth_prompt_role(),
        }
    }
}

impl Default for Persona {
    fn default() -> Self {
        Self::named("User")
    }
}

/// A member of a group chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub name: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A group chat: several characters sharing one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupChat {
    pub name: String,

    #[serde(default)]
    pub members: Vec<GroupMember>,
}

impl GroupChat {
    /// Comma-separated member names (`{{group}}` macro).
    pub fn member_names(&self) -> String {
        self.members
            .iter()
            .map(|m| m.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Enabled members other than the one currently speaking.
    pub fn silent_members<'a>(&'a self, speaker: &'a str) -> impl Iterator<Item = &'a GroupMember> {
        self.members
            .iter()
            .filter(move |m| m.enabled && m.name != speaker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v1_card() {
        let card = CharacterCard::from_json(
            r#"{"name": "Seraphina", "first_mes": "Hello!", "alternate_greetings": ["Hi", "Hey"]}"#,
        )
        .unwrap();
        assert_eq!(card.name, "Seraphina");
        assert_eq!(card.greetings(), vec!["Hello!", "Hi", "Hey"]);
    }

    #[test]
    fn parses_v2_card_with_depth_prompt() {
        let card = CharacterCard::from_json(
            r#"{
                "spec": "chara_card_v2",
                "spec_version": "2.0",
                "data": {
                    "name": "Seraphina",
                    "description": "A guardian of the forest.",
                    "post_history_instructions": "Stay in character.",
                    "extensions": {"depth_prompt": {"prompt": "Be gentle.", "depth": 2, "role": "user"}}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(card.description, "A guardian of the forest.");
        assert_eq!(card.post_history_instructions, "Stay in character.");
        assert_eq!(card.depth_prompt.prompt, "Be gentle.");
        assert_eq!(card.depth_prompt.depth, 2);
        assert_eq!(card.depth_prompt.role, PromptRole::User);
    }

    #[test]
    fn silent_members_skip_speaker_and_disabled() {
        let group = GroupChat {
            name: "Party".into(),
            members: vec![
                GroupMember { name: "Aria".into(), enabled: true },
                GroupMember { name: "Bram".into(), enabled: false },
                GroupMember { name: "Cole".into(), enabled: true },
            ],
        };
        let names: Vec<_> = group.silent_members("Aria").map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Cole"]);
        assert_eq!(group.member_names(), "Aria, Bram, Cole");
    }
}
