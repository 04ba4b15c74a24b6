//! Tokenizer oracle.
//!
//! The engine only relies on token counts being deterministic for a given
//! model and growing with text length. Real tokenizers plug in through
//! [`TokenCounter`]; [`HeuristicTokenizer`] is the fallback.

use crate::message::PromptMessage;

/// Per-message overhead of the chat-completion wire format.
pub const CHAT_MESSAGE_OVERHEAD: usize = 3;

pub trait TokenCounter: Send + Sync {
    /// Number of tokens `text` occupies for the active model.
    fn count(&self, text: &str) -> usize;

    /// Tokens for a role-tagged message list, including wire overhead.
    fn count_messages(&self, messages: &[PromptMessage]) -> usize {
        messages
            .iter()
            .map(|m| {
                let name = m.name.as_deref().map(|n| self.count(n)).unwrap_or(0);
                CHAT_MESSAGE_OVERHEAD + self.count(&m.content) + name
            })
            .sum()
    }
}

/// Character-based estimate: one token per four bytes, rounded up.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenizer;

impl TokenCounter for HeuristicTokenizer {
    fn count(&self, text: &str) -> usize {
        text.len().div_ceil(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(HeuristicTokenizer.count(""), 0);
    }

    #[test]
    fn rounds_up() {
        assert_eq!(HeuristicTokenizer.count("test"), 1);
        assert_eq!(HeuristicTokenizer.count("hello"), 2);
        assert_eq!(HeuristicTokenizer.count(&"a".repeat(100)), 25);
    }

    #[test]
    fn messages_include_overhead() {
        let msgs = vec![
            PromptMessage::user("test"),
            PromptMessage::assistant("hello").with_name("Bot"),
        ];
        // (3 + 1) + (3 + 2 + 1)
        assert_eq!(HeuristicTokenizer.count_messages(&msgs), 10);
    }
}
