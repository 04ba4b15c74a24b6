//! Swipe manager: the per-message candidate array.
//!
//! Every operation here keeps `swipes`, `swipe_id` and `swipe_info` mutually
//! consistent. Operations that find the arrays malformed return `false` and
//! leave the message alone.

use chrono::Utc;
use promptloom_core::message::{ChatMessage, MessageExtra, SwipeInfo};
use promptloom_core::session::Session;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwipeDirection {
    Left,
    Right,
}

/// What a navigation request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwipeNavigation {
    /// The active candidate changed to `index`
    Moved { index: usize },
    /// Wrapped around the greeting slot to `index`
    Wrapped { index: usize },
    /// Right past the last candidate: the caller should generate a new swipe
    Generate,
    /// Nothing navigable
    Unchanged,
}

/// Copy the active text and metadata into `swipes[swipe_id]`.
pub fn sync_active_to_swipe(message: &mut ChatMessage) -> bool {
    if !message.has_valid_swipes() {
        return false;
    }
    let info = message.active_info();
    let (Some(swipes), Some(infos), Some(id)) =
        (message.swipes.as_mut(), message.swipe_info.as_mut(), message.swipe_id)
    else {
        return false;
    };
    swipes[id] = message.mes.clone();
    infos[id] = info;
    true
}

/// Make candidate `index` (default: the current `swipe_id`) the active text.
pub fn sync_swipe_to_active(message: &mut ChatMessage, index: Option<usize>) -> bool {
    if !message.has_valid_swipes() {
        return false;
    }
    let (Some(swipes), Some(infos), Some(current)) =
        (message.swipes.as_ref(), message.swipe_info.as_ref(), message.swipe_id)
    else {
        return false;
    };
    let index = index.unwrap_or(current);
    let (Some(text), Some(info)) = (swipes.get(index), infos.get(index)) else {
        return false;
    };
    let (text, info) = (text.clone(), info.clone());

    message.swipe_id = Some(index);
    message.mes = text;
    message.send_date = info.send_date;
    message.gen_started = info.gen_started;
    message.gen_finished = info.gen_finished;
    message.extra = info.extra;
    true
}

/// Append a new candidate and make it active. Returns its index.
///
/// The previously active text is saved into its own slot first.
pub fn add_swipe(message: &mut ChatMessage, text: impl Into<String>) -> usize {
    message.ensure_swipes();
    sync_active_to_swipe(message);

    let now = Utc::now();
    let text = text.into();
    message.mes = text.clone();
    message.send_date = Some(now);
    message.gen_started = Some(now);
    message.gen_finished = None;
    message.extra = MessageExtra::default();

    let info = message.active_info();
    let swipes = message.swipes.get_or_insert_with(Vec::new);
    swipes.push(text);
    let index = swipes.len() - 1;
    message.swipe_info.get_or_insert_with(Vec::new).push(info);
    message.swipe_id = Some(index);
    index
}

/// Remove candidate `index`.
///
/// Rejected when it is the only candidate. Afterwards the candidate at
/// `min(index, len - 1)` is active.
pub fn delete_swipe(message: &mut ChatMessage, index: usize) -> bool {
    if !message.has_valid_swipes() || message.swipe_count() < 2 || index >= message.swipe_count() {
        return false;
    }
    sync_active_to_swipe(message);

    let (Some(swipes), Some(infos)) = (message.swipes.as_mut(), message.swipe_info.as_mut()) else {
        return false;
    };
    swipes.remove(index);
    infos.remove(index);
    let select = index.min(swipes.len() - 1);
    debug!(removed = index, selected = select, "Deleted swipe");
    sync_swipe_to_active(message, Some(select))
}

/// Move the active candidate of the last message.
///
/// Only the newest non-user message is navigable. Wrapping happens only on
/// the greeting slot of an untouched chat; moving right past the last
/// candidate of any other reply asks for a new generation.
pub fn navigate(session: &mut Session, direction: SwipeDirection) -> SwipeNavigation {
    let greeting_only = session.is_greeting_only();
    let untouched = session.is_untouched();
    let Some(message) = session.chat.last_mut() else {
        return SwipeNavigation::Unchanged;
    };
    if message.is_user || message.is_system {
        return SwipeNavigation::Unchanged;
    }

    message.ensure_swipes();
    sync_active_to_swipe(message);
    let len = message.swipe_count();
    let id = message.swipe_id.unwrap_or(0);

    let outcome = match direction {
        SwipeDirection::Left if id > 0 => SwipeNavigation::Moved { index: id - 1 },
        SwipeDirection::Left if greeting_only && untouched && len > 1 => {
            SwipeNavigation::Wrapped { index: len - 1 }
        }
        SwipeDirection::Left => SwipeNavigation::Unchanged,
        SwipeDirection::Right if id + 1 < len => SwipeNavigation::Moved { index: id + 1 },
        SwipeDirection::Right if greeting_only && untouched && len > 1 => {
            SwipeNavigation::Wrapped { index: 0 }
        }
        SwipeDirection::Right if greeting_only => SwipeNavigation::Unchanged,
        SwipeDirection::Right => SwipeNavigation::Generate,
    };

    if let SwipeNavigation::Moved { index } | SwipeNavigation::Wrapped { index } = outcome {
        sync_swipe_to_active(message, Some(index));
        debug!(from = id, to = index, "Swiped");
    }
    outcome
}

/// Metadata for a candidate that arrives with the primary reply.
pub(crate) fn extra_candidate_info(primary: &SwipeInfo) -> SwipeInfo {
    SwipeInfo {
        extra: MessageExtra {
            api: primary.extra.api.clone(),
            model: primary.extra.model.clone(),
            ..MessageExtra::default()
        },
        ..primary.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptloom_core::character::{CharacterCard, Persona};

    fn invariant(message: &ChatMessage) {
        let swipes = message.swipes.as_ref().expect("swipes");
        let id = message.swipe_id.expect("swipe_id");
        assert!(!swipes.is_empty());
        assert!(id < swipes.len());
        assert_eq!(message.swipe_info.as_ref().map(Vec::len), Some(swipes.len()));
    }

    fn greeting_session() -> Session {
        let mut s = Session::new(CharacterCard::named("Seraphina"), Persona::named("Alice"));
        s.place_greeting(vec!["One".into(), "Two".into(), "Three".into()]);
        s
    }

    fn reply_session() -> Session {
        let mut s = greeting_session();
        s.metadata.tainted = true;
        s.chat.push(ChatMessage::user("Alice", "Hi"));
        s.chat.push(ChatMessage::character("Seraphina", "First"));
        s
    }

    #[test]
    fn add_swipe_keeps_previous_text() {
        let mut msg = ChatMessage::character("Seraphina", "First");
        let idx = add_swipe(&mut msg, "Second");
        assert_eq!(idx, 1);
        assert_eq!(msg.mes, "Second");
        assert_eq!(msg.swipes, Some(vec!["First".into(), "Second".into()]));
        invariant(&msg);
    }

    #[test]
    fn deleting_only_swipe_is_rejected() {
        let mut msg = ChatMessage::character("Seraphina", "Only");
        msg.ensure_swipes();
        let before = msg.clone();
        assert!(!delete_swipe(&mut msg, 0));
        assert_eq!(msg, before);
    }

    #[test]
    fn delete_reselects_clamped_index() {
        let mut msg = ChatMessage::character("Seraphina", "a");
        add_swipe(&mut msg, "b");
        add_swipe(&mut msg, "c");
        assert!(delete_swipe(&mut msg, 2));
        assert_eq!(msg.swipe_id, Some(1));
        assert_eq!(msg.mes, "b");
        assert!(delete_swipe(&mut msg, 0));
        assert_eq!(msg.swipe_id, Some(0));
        assert_eq!(msg.mes, "b");
        invariant(&msg);
    }

    #[test]
    fn sync_roundtrip_is_idempotent() {
        let mut msg = ChatMessage::character("Seraphina", "a");
        add_swipe(&mut msg, "b");
        msg.mes = "b edited".into();
        msg.extra.token_count = Some(7);
        assert!(sync_active_to_swipe(&mut msg));
        let synced = msg.clone();
        assert!(sync_swipe_to_active(&mut msg, Some(1)));
        assert_eq!(msg, synced);
    }

    #[test]
    fn sync_on_malformed_arrays_is_noop() {
        let mut msg = ChatMessage::character("Seraphina", "a");
        msg.swipes = Some(vec!["a".into()]);
        msg.swipe_id = Some(4);
        let before = msg.clone();
        assert!(!sync_active_to_swipe(&mut msg));
        assert!(!sync_swipe_to_active(&mut msg, None));
        assert!(!delete_swipe(&mut msg, 0));
        assert_eq!(msg, before);
    }

    #[test]
    fn greeting_wraps_both_ways() {
        let mut s = greeting_session();
        assert_eq!(navigate(&mut s, SwipeDirection::Left), SwipeNavigation::Wrapped { index: 2 });
        assert_eq!(s.chat[0].mes, "Three");
        assert_eq!(navigate(&mut s, SwipeDirection::Right), SwipeNavigation::Wrapped { index: 0 });
        assert_eq!(s.chat[0].mes, "One");
        invariant(&s.chat[0]);
    }

    #[test]
    fn tainted_greeting_does_not_wrap() {
        let mut s = greeting_session();
        s.metadata.tainted = true;
        assert_eq!(navigate(&mut s, SwipeDirection::Left), SwipeNavigation::Unchanged);
        navigate(&mut s, SwipeDirection::Right);
        navigate(&mut s, SwipeDirection::Right);
        assert_eq!(navigate(&mut s, SwipeDirection::Right), SwipeNavigation::Unchanged);
        assert_eq!(s.chat[0].mes, "Three");
    }

    #[test]
    fn right_past_end_of_reply_requests_generation() {
        let mut s = reply_session();
        assert_eq!(navigate(&mut s, SwipeDirection::Right), SwipeNavigation::Generate);
        assert_eq!(navigate(&mut s, SwipeDirection::Left), SwipeNavigation::Unchanged);

        add_swipe(s.chat.last_mut().expect("reply"), "Second");
        assert_eq!(navigate(&mut s, SwipeDirection::Left), SwipeNavigation::Moved { index: 0 });
        assert_eq!(s.chat[2].mes, "First");
        invariant(&s.chat[2]);
    }

    #[test]
    fn user_message_is_not_navigable() {
        let mut s = reply_session();
        s.chat.push(ChatMessage::user("Alice", "More"));
        assert_eq!(navigate(&mut s, SwipeDirection::Right), SwipeNavigation::Unchanged);
        assert!(s.chat[3].swipes.is_none());
    }
}
