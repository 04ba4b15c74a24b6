//! The chat session: all mutable state a generation run reads and writes.
//!
//! The engine never reads ambient globals. Every pipeline call takes a
//! `&mut Session`, which makes the engine the sole mutator for the duration of
//! a run; concurrent edits are serialized by the caller.

use crate::character::{CharacterCard, GroupChat, Persona};
use crate::message::{ChatMessage, ChatMetadata};
use crate::store::ChatHeader;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// What kind of generation a pipeline run performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationType {
    /// Append a new reply after the last message
    #[default]
    Normal,
    /// Extend the last message in place
    Continue,
    /// Generate another candidate for the last message
    Swipe,
    /// Drop the last reply and generate a fresh one
    Regenerate,
    /// Write the user's next message
    Impersonate,
    /// Background request; the result is returned, not shown as a turn
    Quiet,
}

impl GenerationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Continue => "continue",
            Self::Swipe => "swipe",
            Self::Regenerate => "regenerate",
            Self::Impersonate => "impersonate",
            Self::Quiet => "quiet",
        }
    }

    /// Types whose result is never committed as a chat turn.
    pub fn is_detached(&self) -> bool {
        matches!(self, Self::Impersonate | Self::Quiet)
    }
}

impl fmt::Display for GenerationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open chat with one character (or a group) and the user persona.
#[derive(Debug, Clone)]
pub struct Session {
    /// Ordered chat messages (oldest first)
    pub chat: Vec<ChatMessage>,

    /// Session-scoped metadata
    pub metadata: ChatMetadata,

    /// The active character card
    pub character: CharacterCard,

    /// The user's persona
    pub persona: Persona,

    /// Set when this is a group chat
    pub group: Option<GroupChat>,

    /// When the chat was first created
    pub create_date: DateTime<Utc>,

    /// Storage key of this chat
    pub chat_id: String,
}

impl Session {
    /// Start a new, empty chat.
    pub fn new(character: CharacterCard, persona: Persona) -> Self {
        let create_date = Utc::now();
        let chat_id = format!(
            "{} - {}",
            character.name,
            create_date.format("%Y-%m-%d@%Hh%Mm%Ss")
        );
        Self {
            chat: Vec::new(),
            metadata: ChatMetadata::default(),
            character,
            persona,
            group: None,
            create_date,
            chat_id,
        }
    }

    /// Store this chat under a different key.
    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = chat_id.into();
        self
    }

    /// Turn this session into a group chat.
    pub fn with_group(mut self, group: GroupChat) -> Self {
        self.group = Some(group);
        self
    }

    /// Rebuild a session from a persisted header and message list.
    pub fn restore(
        chat_id: impl Into<String>,
        header: ChatHeader,
        chat: Vec<ChatMessage>,
        character: CharacterCard,
        persona: Persona,
    ) -> Self {
        debug!(messages = chat.len(), character = %character.name, "Restoring chat session");
        Self {
            chat,
            metadata: header.chat_metadata,
            character,
            persona,
            group: None,
            create_date: header.create_date,
            chat_id: chat_id.into(),
        }
    }

    /// The header written in front of the messages when persisting.
    pub fn header(&self) -> ChatHeader {
        ChatHeader {
            user_name: self.persona.name.clone(),
            character_name: self.character.name.clone(),
            create_date: self.create_date,
            chat_metadata: self.metadata.clone(),
        }
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.chat.last()
    }

    pub fn last_message_mut(&mut self) -> Option<&mut ChatMessage> {
        self.chat.last_mut()
    }

    /// True when the chat holds nothing but the character's greeting slot.
    pub fn is_greeting_only(&self) -> bool {
        self.chat.len() == 1 && !self.chat[0].is_user && !self.chat[0].is_system
    }

    /// True when the greeting slot may still be recreated.
    pub fn is_untouched(&self) -> bool {
        self.chat.is_empty() || (self.is_greeting_only() && !self.metadata.tainted)
    }

    /// Scenario text: the chat-level override wins when non-empty.
    pub fn effective_scenario(&self) -> &str {
        match self.metadata.scenario.as_deref() {
            Some(s) if !s.trim().is_empty() => s,
            _ => &self.character.scenario,
        }
    }

    /// Number of user-authored messages (drives the author's note interval).
    pub fn user_message_count(&self) -> usize {
        self.chat.iter().filter(|m| m.is_user).count()
    }

    /// Place a greeting slot into an untouched chat.
    ///
    /// `greetings` must already be macro-substituted. Blank greetings are
    /// dropped and the first remaining one becomes the active text. Returns
    /// `false` (and changes nothing) when the chat has been written to, or
    /// when there is no greeting text at all.
    pub fn place_greeting(&mut self, mut greetings: Vec<String>) -> bool {
        if !self.is_untouched() {
            return false;
        }
        greetings.retain(|g| !g.trim().is_empty());
        let Some(first) = greetings.first().cloned() else {
            return false;
        };

        let mut message = ChatMessage::character(self.character.name.clone(), first);
        let info = message.active_info();
        message.swipe_info = Some(vec![info; greetings.len()]);
        message.swipes = Some(greetings);
        message.swipe_id = Some(0);

        self.chat.clear();
        self.chat.push(message);
        true
    }
}
