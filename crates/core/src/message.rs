//! Chat message, swipe, and metadata domain types.
//!
//! A chat session is an ordered `Vec<ChatMessage>`. Each message slot may carry
//! several alternative candidate completions ("swipes"); exactly one of them is
//! active and mirrored into `mes`.
//!
//! The serialized shape follows the conventional snake_case chat-file layout
//! (`mes`, `swipes`, `swipe_id`, `swipe_info`, `extra`) so that existing chat
//! logs load without conversion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of a role-tagged prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    /// System instructions, narrator text, injected notes
    System,
    /// The human user
    User,
    /// The character / AI assistant
    Assistant,
    /// Tool execution result
    Tool,
}

impl PromptRole {
    /// Injection priority order used when several roles share a depth.
    pub const INJECTION_ORDER: [PromptRole; 3] =
        [PromptRole::System, PromptRole::User, PromptRole::Assistant];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// Where an out-of-band text fragment is placed in the assembled prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionPosition {
    /// Not placed anywhere; only visible to world-info scanning.
    None,
    /// After the story string ("in prompt").
    #[default]
    InPrompt,
    /// Inside the chat history at a given depth.
    InChat,
    /// Before the story string.
    BeforePrompt,
}

/// A tool call embedded in an assistant prompt message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageToolCall {
    /// Unique ID for this tool call
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as JSON string
    pub arguments: String,
}

/// A completed tool invocation recorded on a chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub display_name: String,
    pub name: String,
    /// Arguments as JSON string
    pub parameters: String,
    pub result: String,
}

/// A single role-tagged message sent to a chat-completion backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,

    pub content: String,

    /// Optional speaker name (group chats, example dialogue)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl PromptMessage {
    pub fn new(role: PromptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(PromptRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(PromptRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(PromptRole::Assistant, content)
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(PromptRole::Tool, content)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Active metadata of a message (or of one swipe candidate).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageExtra {
    /// Backend family that produced the text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,

    /// Model identifier reported by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<usize>,

    /// Reasoning / thinking text returned alongside the reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,

    /// Attached media (URL or data URI)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Compact system notice (tool invocation records)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_small_sys: bool,

    /// Prompt bias that was prepended to this reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias: Option<String>,

    /// Anything else (extension data round-trips untouched)
    #[serde(default, flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

/// Per-candidate metadata, parallel to `ChatMessage::swipes`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwipeInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_date: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen_started: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen_finished: Option<DateTime<Utc>>,

    #[serde(default)]
    pub extra: MessageExtra,
}

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker name
    pub name: String,

    #[serde(default)]
    pub is_user: bool,

    /// Narrator / hidden system message
    #[serde(default)]
    pub is_system: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_date: Option<DateTime<Utc>>,

    /// The active text
    #[serde(default)]
    pub mes: String,

    /// All generated alternatives for this slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swipes: Option<Vec<String>>,

    /// Active index into `swipes`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swipe_id: Option<usize>,

    /// Per-candidate metadata, parallel to `swipes`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swipe_info: Option<Vec<SwipeInfo>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen_started: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen_finished: Option<DateTime<Utc>>,

    #[serde(default)]
    pub extra: MessageExtra,
}

impl ChatMessage {
    fn new(name: impl Into<String>, mes: impl Into<String>, is_user: bool, is_system: bool) -> Self {
        Self {
            name: name.into(),
            is_user,
            is_system,
            send_date: Some(Utc::now()),
            mes: mes.into(),
            swipes: None,
            swipe_id: None,
            swipe_info: None,
            gen_started: None,
            gen_finished: None,
            extra: MessageExtra::default(),
        }
    }

    /// Create a new user message.
    pub fn user(name: impl Into<String>, mes: impl Into<String>) -> Self {
        Self::new(name, mes, true, false)
    }

    /// Create a new character (assistant) message.
    pub fn character(name: impl Into<String>, mes: impl Into<String>) -> Self {
        Self::new(name, mes, false, false)
    }

    /// Create a narrator / system message.
    pub fn narrator(name: impl Into<String>, mes: impl Into<String>) -> Self {
        Self::new(name, mes, false, true)
    }

    /// The prompt role this message plays when rendered for a backend.
    pub fn role(&self) -> PromptRole {
        if self.is_system {
            PromptRole::System
        } else if self.is_user {
            PromptRole::User
        } else {
            PromptRole::Assistant
        }
    }

    /// A character turn: neither user input nor a narrator line.
    pub fn is_character_reply(&self) -> bool {
        !self.is_user && !self.is_system
    }

    /// Whether the swipe arrays are present and mutually consistent.
    ///
    /// Valid means: `swipes` is non-empty, `swipe_id` indexes into it, and
    /// `swipe_info` (when present) has the same length.
    pub fn has_valid_swipes(&self) -> bool {
        let (Some(swipes), Some(id)) = (&self.swipes, self.swipe_id) else {
            return false;
        };
        if swipes.is_empty() || id >= swipes.len() {
            return false;
        }
        match &self.swipe_info {
            Some(info) => info.len() == swipes.len(),
            None => false,
        }
    }

    /// Number of candidates (0 when the message was never swipe-initialized).
    pub fn swipe_count(&self) -> usize {
        self.swipes.as_ref().map_or(0, Vec::len)
    }

    /// Metadata snapshot of the active text, in `SwipeInfo` form.
    pub fn active_info(&self) -> SwipeInfo {
        SwipeInfo {
            send_date: self.send_date,
            gen_started: self.gen_started,
            gen_finished: self.gen_finished,
            extra: self.extra.clone(),
        }
    }

    /// Initialize or repair the swipe arrays around the active text.
    ///
    /// After this call `has_valid_swipes()` holds. Existing candidates are
    /// kept; missing metadata entries are filled with empty `SwipeInfo`s.
    pub fn ensure_swipes(&mut self) {
        let info = self.active_info();
        let swipes = self.swipes.get_or_insert_with(Vec::new);
        if swipes.is_empty() {
            swipes.push(self.mes.clone());
            self.swipe_id = Some(0);
            self.swipe_info = Some(vec![info]);
            return;
        }

        let len = swipes.len();
        let id = self.swipe_id.unwrap_or(0).min(len - 1);
        self.swipe_id = Some(id);

        let infos = self.swipe_info.get_or_insert_with(Vec::new);
        infos.truncate(len);
        while infos.len() < len {
            infos.push(SwipeInfo::default());
        }
    }
}

/// Session-scoped key/value metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMetadata {
    /// Set once any generation happened; gates greeting re-creation.
    #[serde(default)]
    pub tainted: bool,

    /// Opaque identifier guarding against concurrent overwrites of the chat file.
    #[serde(default = "new_integrity")]
    pub integrity: String,

    /// Chat-level scenario override (replaces the card scenario when non-empty)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,

    /// Index of the oldest message included by the most recent assembly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_in_context_message_id: Option<usize>,

    /// Author's note text
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note_prompt: String,

    /// Inject the note every N user messages (0 disables)
    #[serde(default = "default_note_interval")]
    pub note_interval: u32,

    #[serde(default = "default_note_depth")]
    pub note_depth: u32,

    #[serde(default = "default_note_position")]
    pub note_position: InjectionPosition,

    #[serde(default = "default_note_role")]
    pub note_role: PromptRole,

    #[serde(default, flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

fn new_integrity() -> String {
    Uuid::new_v4().to_string()
}
fn default_note_interval() -> u32 {
    1
}
fn default_note_depth() -> u32 {
    4
}
fn default_note_position() -> InjectionPosition {
    InjectionPosition::InChat
}
fn default_note_role() -> PromptRole {
    PromptRole::System
}

impl Default for ChatMetadata {
    fn default() -> Self {
        Self {
            tainted: false,
            integrity: new_integrity(),
            scenario: None,
            last_in_context_message_id: None,
            note_prompt: String::new(),
            note_interval: default_note_interval(),
            note_depth: default_note_depth(),
            note_position: default_note_position(),
            note_role: default_note_role(),
            other: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = ChatMessage::user("Alice", "Hello there");
        assert!(msg.is_user);
        assert_eq!(msg.role(), PromptRole::User);
        assert_eq!(msg.swipe_count(), 0);
        assert!(!msg.has_valid_swipes());
    }

    #[test]
    fn ensure_swipes_initializes_from_active_text() {
        let mut msg = ChatMessage::character("Seraphina", "Welcome back.");
        msg.ensure_swipes();
        assert!(msg.has_valid_swipes());
        assert_eq!(msg.swipes.as_deref(), Some(&["Welcome back.".to_string()][..]));
        assert_eq!(msg.swipe_id, Some(0));
    }

    #[test]
    fn ensure_swipes_repairs_malformed_arrays() {
        let mut msg = ChatMessage::character("Seraphina", "b");
        msg.swipes = Some(vec!["a".into(), "b".into(), "c".into()]);
        msg.swipe_id = Some(7);
        msg.swipe_info = Some(vec![SwipeInfo::default()]);
        assert!(!msg.has_valid_swipes());

        msg.ensure_swipes();
        assert!(msg.has_valid_swipes());
        assert_eq!(msg.swipe_id, Some(2));
        assert_eq!(msg.swipe_info.as_ref().map(Vec::len), Some(3));
    }

    #[test]
    fn chat_file_shape_deserializes() {
        let json = r#"{
            "name": "Seraphina",
            "is_user": false,
            "mes": "Hi",
            "swipes": ["Hi", "Hello"],
            "swipe_id": 0,
            "swipe_info": [{}, {}],
            "extra": {"api": "textgen", "custom_field": 3}
        }"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert!(msg.has_valid_swipes());
        assert_eq!(msg.extra.api.as_deref(), Some("textgen"));
        assert_eq!(msg.extra.other.get("custom_field"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn metadata_defaults_carry_integrity() {
        let a = ChatMetadata::default();
        let b = ChatMetadata::default();
        assert!(!a.tainted);
        assert_ne!(a.integrity, b.integrity);
        assert_eq!(a.note_position, InjectionPosition::InChat);
    }

    #[test]
    fn prompt_message_tool_result() {
        let msg = PromptMessage::tool_result("call_1", "42");
        assert_eq!(msg.role, PromptRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
    }
}
