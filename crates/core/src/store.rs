//! Persistence collaborator.
//!
//! A store accepts the full ordered message list plus a metadata header and
//! reports success or failure. The engine never interprets storage errors
//! beyond handing them back to the caller.

use crate::error::StoreError;
use crate::message::{ChatMessage, ChatMetadata};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// The header persisted in front of a chat's messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatHeader {
    pub user_name: String,
    pub character_name: String,
    pub create_date: DateTime<Utc>,
    #[serde(default)]
    pub chat_metadata: ChatMetadata,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persist a chat under `chat_id`, replacing any previous version.
    async fn save(
        &self,
        chat_id: &str,
        header: &ChatHeader,
        messages: &[ChatMessage],
    ) -> Result<(), StoreError>;

    /// Load a chat. Returns `Ok(None)` when no chat exists under `chat_id`.
    async fn load(&self, chat_id: &str)
    -> Result<Option<(ChatHeader, Vec<ChatMessage>)>, StoreError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// In-memory store, for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryChatStore {
    chats: RwLock<HashMap<String, (ChatHeader, Vec<ChatMessage>)>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.chats.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.chats.read().await.is_empty()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn save(
        &self,
        chat_id: &str,
        header: &ChatHeader,
        messages: &[ChatMessage],
    ) -> Result<(), StoreError> {
        self.chats
            .write()
            .await
            .insert(chat_id.to_string(), (header.clone(), messages.to_vec()));
        Ok(())
    }

    async fn load(
        &self,
        chat_id: &str,
    ) -> Result<Option<(ChatHeader, Vec<ChatMessage>)>, StoreError> {
        Ok(self.chats.read().await.get(chat_id).cloned())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load() {
        let store = MemoryChatStore::new();
        let header = ChatHeader {
            user_name: "Alice".into(),
            character_name: "Seraphina".into(),
            create_date: Utc::now(),
            chat_metadata: ChatMetadata::default(),
        };
        let messages = vec![ChatMessage::user("Alice", "Hi there")];

        store.save("chat-1", &header, &messages).await.unwrap();
        let (loaded_header, loaded) = store.load("chat-1").await.unwrap().unwrap();
        assert_eq!(loaded_header, header);
        assert_eq!(loaded[0].mes, "Hi there");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn load_missing_is_none() {
        let store = MemoryChatStore::new();
        assert!(store.load("nope").await.unwrap().is_none());
    }
}
