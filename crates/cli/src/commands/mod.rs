pub mod chat;
pub mod config_cmd;
pub mod prompt;

use promptloom_config::AppConfig;
use promptloom_core::character::{CharacterCard, Persona};
use promptloom_core::session::Session;
use promptloom_core::store::ChatStore;
use promptloom_engine::JsonlChatStore;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub fn load_config() -> CliResult<AppConfig> {
    AppConfig::load().map_err(|e| format!("Failed to load config: {e}").into())
}

pub async fn load_card(path: &Path) -> CliResult<CharacterCard> {
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    let card = CharacterCard::from_json(&json)
        .map_err(|e| format!("Invalid character card {}: {e}", path.display()))?;
    Ok(card)
}

/// Resume the chat at `chat_path`, or start a new one.
///
/// Resumed chats are saved back to the same file; new chats go to the
/// configured chats directory when persistence is enabled.
pub async fn open_session(
    config: &AppConfig,
    card: CharacterCard,
    chat_path: Option<&Path>,
    user: &str,
) -> CliResult<(Session, Option<Arc<JsonlChatStore>>)> {
    let persona = Persona::named(user);

    let Some(path) = chat_path else {
        let session = Session::new(card, persona);
        let store = config
            .persistence
            .enabled
            .then(|| Arc::new(JsonlChatStore::new(config.persistence.chats_dir())));
        return Ok((session, store));
    };

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let chat_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| format!("Invalid chat file name: {}", path.display()))?
        .to_string();
    let store = Arc::new(JsonlChatStore::new(dir));

    let session = match store.load(&chat_id).await? {
        Some((header, messages)) => {
            info!(chat = %chat_id, messages = messages.len(), "Resuming chat");
            Session::restore(chat_id, header, messages, card, persona)
        }
        None => Session::new(card, persona).with_chat_id(chat_id),
    };
    Ok((session, Some(store)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptloom_core::message::ChatMessage;

    #[tokio::test]
    async fn resumes_existing_chat_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::default();
        let card = CharacterCard::named("Seraphina");

        let mut session = Session::new(card.clone(), Persona::named("Alice"));
        session.chat.push(ChatMessage::user("Alice", "Hi"));
        JsonlChatStore::new(dir.path())
            .save("forest", &session.header(), &session.chat)
            .await
            .unwrap();

        let path = dir.path().join("forest.jsonl");
        let (resumed, store) = open_session(&config, card, Some(&path), "Alice").await.unwrap();
        assert_eq!(resumed.chat_id, "forest");
        assert_eq!(resumed.chat.len(), 1);
        assert_eq!(store.unwrap().dir(), dir.path());
    }

    #[tokio::test]
    async fn missing_chat_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.jsonl");
        let (session, store) = open_session(&AppConfig::default(), CharacterCard::named("Seraphina"), Some(&path), "Bob")
            .await
            .unwrap();
        assert!(session.chat.is_empty());
        assert_eq!(session.chat_id, "new");
        assert_eq!(session.persona.name, "Bob");
        assert!(store.is_some());
    }
}
