//! Backend selection: builds the single active adapter from config.

use crate::openai_compat::OpenAiCompatBackend;
use crate::text_completion::TextCompletionBackend;
use promptloom_config::AppConfig;
use promptloom_core::backend::{Backend, BackendFamily};
use promptloom_core::error::BackendError;
use std::sync::Arc;
use tracing::info;

/// Build the backend selected by `config.main_api`.
pub fn build_from_config(config: &AppConfig) -> Result<Arc<dyn Backend>, BackendError> {
    let family = config.main_api;
    let base_url = config
        .api_url
        .clone()
        .unwrap_or_else(|| default_base_url(family).to_string());
    let api_key = config.api_key.clone().unwrap_or_default();

    if family == BackendFamily::Novel && api_key.is_empty() {
        return Err(BackendError::NotConfigured(
            "NovelAI requires an API key (set PROMPTLOOM_API_KEY)".into(),
        ));
    }

    info!(backend = %family, url = %base_url, "Using backend");

    let backend: Arc<dyn Backend> = match family {
        BackendFamily::OpenAi => {
            let name = if base_url.contains("openrouter.ai") {
                "openrouter"
            } else {
                "openai"
            };
            Arc::new(OpenAiCompatBackend::new(name, base_url, api_key))
        }
        _ => Arc::new(TextCompletionBackend::new(family, base_url, api_key)?),
    };

    Ok(backend)
}

/// Default base URL for each family.
pub fn default_base_url(family: BackendFamily) -> &'static str {
    match family {
        BackendFamily::Kobold => "http://127.0.0.1:5001",
        BackendFamily::TextGen => "http://127.0.0.1:5000",
        BackendFamily::Novel => "https://api.novelai.net",
        BackendFamily::OpenAi => "https://api.openai.com/v1",
    }
}
