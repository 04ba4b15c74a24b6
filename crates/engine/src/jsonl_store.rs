//! File-based chat store: one JSON-lines file per chat.
//!
//! Line 1 is the [`ChatHeader`]; every following line is one
//! [`ChatMessage`], oldest first. Saves write a temporary sibling file and
//! rename it over the old one, so a crash never leaves half a chat behind.
//!
//! Storage location: `~/.promptloom/chats/<chat id>.jsonl`

use async_trait::async_trait;
use promptloom_core::error::StoreError;
use promptloom_core::message::ChatMessage;
use promptloom_core::store::{ChatHeader, ChatStore};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct JsonlChatStore {
    dir: PathBuf,
}

impl JsonlChatStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a chat id maps to. Path separators and control characters are replaced.
    pub fn path_for(&self, chat_id: &str) -> PathBuf {
        let safe: String = chat_id
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect();
        let safe = safe.trim_matches('.');
        let name = if safe.is_empty() { "chat" } else { safe };
        self.dir.join(format!("{name}.jsonl"))
    }

    /// Serialize a chat to its JSONL form.
    pub fn encode(header: &ChatHeader, messages: &[ChatMessage]) -> Result<String, StoreError> {
        let corrupt = |e: serde_json::Error| StoreError::Corrupted(format!("serialize: {e}"));
        let mut content = serde_json::to_string(header).map_err(corrupt)?;
        content.push('\n');
        for message in messages {
            content.push_str(&serde_json::to_string(message).map_err(corrupt)?);
            content.push('\n');
        }
        Ok(content)
    }

    /// Parse JSONL content. Blank lines are ignored; any malformed line fails the load.
    pub fn decode(content: &str) -> Result<(ChatHeader, Vec<ChatMessage>), StoreError> {
        let mut lines = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty());

        let (_, first) = lines
            .next()
            .ok_or_else(|| StoreError::Corrupted("empty chat file".into()))?;
        let header: ChatHeader = serde_json::from_str(first)
            .map_err(|e| StoreError::Corrupted(format!("header: {e}")))?;

        let messages = lines
            .map(|(n, line)| {
                serde_json::from_str::<ChatMessage>(line)
                    .map_err(|e| StoreError::Corrupted(format!("line {}: {e}", n + 1)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((header, messages))
    }
}

#[async_trait]
impl ChatStore for JsonlChatStore {
    async fn save(
        &self,
        chat_id: &str,
        header: &ChatHeader,
        messages: &[ChatMessage],
    ) -> Result<(), StoreError> {
        let content = Self::encode(header, messages)?;
        let path = self.path_for(chat_id);
        tokio::fs::create_dir_all(&self.dir).await?;

        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), messages = messages.len(), "Chat saved");
        Ok(())
    }

    async fn load(
        &self,
        chat_id: &str,
    ) -> Result<Option<(ChatHeader, Vec<ChatMessage>)>, StoreError> {
        let path = self.path_for(chat_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let chat = Self::decode(&content)?;
        debug!(path = %path.display(), messages = chat.1.len(), "Chat loaded");
        Ok(Some(chat))
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use promptloom_core::message::ChatMetadata;

    fn header() -> ChatHeader {
        ChatHeader {
            user_name: "Alice".into(),
            character_name: "Seraphina".into(),
            create_date: Utc::now(),
            chat_metadata: ChatMetadata::default(),
        }
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlChatStore::new(dir.path());

        let mut reply = ChatMessage::character("Seraphina", "Welcome.");
        reply.ensure_swipes();
        reply.extra.other.insert("custom".into(), serde_json::json!({"kept": true}));
        let messages = vec![ChatMessage::user("Alice", "Hi"), reply];
        let header = header();

        store.save("Seraphina - 2025-01-01", &header, &messages).await.unwrap();
        let (loaded_header, loaded) = store
            .load("Seraphina - 2025-01-01")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded_header, header);
        assert_eq!(loaded, messages);
        assert!(!store.path_for("Seraphina - 2025-01-01").with_extension("jsonl.tmp").exists());
    }

    #[tokio::test]
    async fn missing_chat_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlChatStore::new(dir.path().join("not-yet-created"));
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupted_line_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlChatStore::new(dir.path());
        let mut content = JsonlChatStore::encode(&header(), &[]).unwrap();
        content.push_str("{not json}\n");
        std::fs::write(store.path_for("broken"), content).unwrap();

        let err = store.load("broken").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupted(ref m) if m.starts_with("line 2")));
    }

    #[test]
    fn chat_ids_are_sanitized() {
        let store = JsonlChatStore::new("/chats");
        assert_eq!(store.path_for("../etc/passwd"), PathBuf::from("/chats/_etc_passwd.jsonl"));
        assert_eq!(store.path_for("a:b"), PathBuf::from("/chats/a_b.jsonl"));
        assert_eq!(store.path_for(""), PathBuf::from("/chats/chat.jsonl"));
    }
}
