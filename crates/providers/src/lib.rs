//! Backend adapters for promptloom.
//!
//! All adapters implement the `promptloom_core::Backend` trait. The router
//! builds the single active adapter from configuration.

pub mod openai_compat;
pub mod router;
pub mod sse;
pub mod text_completion;

pub use openai_compat::OpenAiCompatBackend;
pub use router::build_from_config;
pub use text_completion::TextCompletionBackend;
