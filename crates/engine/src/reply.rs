//! Reply slots: where generated text is written in the chat.

use crate::swipe::{add_swipe, delete_swipe, extra_candidate_info, sync_active_to_swipe, sync_swipe_to_active};
use chrono::Utc;
use promptloom_core::message::ChatMessage;
use promptloom_core::session::{GenerationType, Session};
use promptloom_core::tokenizer::TokenCounter;
use tracing::debug;

/// How a slot came to exist, which decides how it is rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotKind {
    /// A fresh message appended for this run
    NewMessage,
    /// A new candidate on an existing message; `previous` was active before
    NewSwipe { previous: usize },
    /// An existing message being extended
    Continue,
}

/// Where the text of one run goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyTarget {
    /// Impersonate and quiet runs never touch the chat
    Detached,
    Slot {
        index: usize,
        kind: SlotKind,
        /// Text already present before this run (continue)
        prefix: String,
    },
}

impl ReplyTarget {
    pub fn message_index(&self) -> Option<usize> {
        match self {
            Self::Detached => None,
            Self::Slot { index, .. } => Some(*index),
        }
    }
}

/// Metadata recorded on the committed candidate.
#[derive(Debug, Clone, Default)]
pub struct ReplyMeta {
    pub api: String,
    pub model: Option<String>,
    pub bias: Option<String>,
    pub image: Option<String>,
    pub reasoning: Option<String>,
}

/// Allocate (or select) the message this run writes into.
pub fn open_slot(session: &mut Session, generation_type: GenerationType, speaker: &str) -> ReplyTarget {
    if generation_type.is_detached() {
        return ReplyTarget::Detached;
    }

    let last_is_reply = session.chat.last().is_some_and(ChatMessage::is_character_reply);

    match generation_type {
        GenerationType::Continue if !session.chat.is_empty() => {
            let index = session.chat.len() - 1;
            let prefix = session.chat[index].mes.clone();
            ReplyTarget::Slot {
                index,
                kind: SlotKind::Continue,
                prefix,
            }
        }
        GenerationType::Swipe if last_is_reply => {
            let index = session.chat.len() - 1;
            let message = &mut session.chat[index];
            message.ensure_swipes();
            let previous = message.swipe_id.unwrap_or(0);
            let id = add_swipe(message, "");
            debug!(message_index = index, swipe_id = id, "Opened swipe slot");
            ReplyTarget::Slot {
                index,
                kind: SlotKind::NewSwipe { previous },
                prefix: String::new(),
            }
        }
        _ => {
            let mut message = ChatMessage::character(speaker, "");
            message.gen_started = Some(Utc::now());
            session.chat.push(message);
            let index = session.chat.len() - 1;
            debug!(message_index = index, "Opened reply slot");
            ReplyTarget::Slot {
                index,
                kind: SlotKind::NewMessage,
                prefix: String::new(),
            }
        }
    }
}

/// Write the current cleaned text into the slot.
pub fn write_reply(session: &mut Session, target: &ReplyTarget, text: &str) {
    if let ReplyTarget::Slot { index, prefix, .. } = target
        && let Some(message) = session.chat.get_mut(*index)
    {
        message.mes = format!("{prefix}{text}");
    }
}

/// Stamp metadata, store the text in its swipe slot and append extra candidates.
pub fn finalize_reply(
    session: &mut Session,
    target: &ReplyTarget,
    meta: &ReplyMeta,
    extra_swipes: &[String],
    counter: &dyn TokenCounter,
) {
    let ReplyTarget::Slot { index, .. } = target else {
        return;
    };
    let Some(message) = session.chat.get_mut(*index) else {
        return;
    };

    message.gen_finished = Some(Utc::now());
    message.extra.api = Some(meta.api.clone());
    message.extra.model = meta.model.clone();
    message.extra.token_count = Some(counter.count(&message.mes));
    message.extra.bias = meta.bias.clone().filter(|b| !b.is_empty());
    if meta.image.is_some() {
        message.extra.image = meta.image.clone();
    }
    if let Some(reasoning) = meta.reasoning.as_ref().filter(|r| !r.is_empty()) {
        message.extra.reasoning = Some(reasoning.clone());
    }

    message.ensure_swipes();
    sync_active_to_swipe(message);

    let primary = message.active_info();
    let extras: Vec<&String> = extra_swipes.iter().filter(|s| !s.trim().is_empty()).collect();
    if let (Some(swipes), Some(infos)) = (message.swipes.as_mut(), message.swipe_info.as_mut()) {
        for text in &extras {
            swipes.push((*text).clone());
            infos.push(extra_candidate_info(&primary));
        }
    }
    if !extras.is_empty() {
        debug!(message_index = index, extra = extras.len(), "Stored extra candidates");
    }
}

/// Roll back a slot that received no text. Returns `true` when something was removed.
pub fn discard_empty_slot(session: &mut Session, target: &ReplyTarget) -> bool {
    let ReplyTarget::Slot { index, kind, .. } = target else {
        return false;
    };
    let Some(message) = session.chat.get_mut(*index) else {
        return false;
    };
    if !message.mes.trim().is_empty() {
        return false;
    }

    match kind {
        SlotKind::NewMessage => {
            session.chat.remove(*index);
            true
        }
        SlotKind::NewSwipe { previous } => {
            let Some(current) = message.swipe_id else {
                return false;
            };
            delete_swipe(message, current) && sync_swipe_to_active(message, Some(*previous))
        }
        SlotKind::Continue => false,
    }
}
