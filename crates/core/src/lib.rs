//! # promptloom core
//!
//! Domain types, collaborator traits, and error definitions for the promptloom
//! chat orchestration engine. This crate performs **no I/O**. It defines the
//! model that the engine, the backend adapters, and the CLI implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (backend adapter, tokenizer, tool registry,
//! world-info retrieval, chat storage) is a trait here. Implementations live
//! in their respective crates or in the embedding application. This enables:
//! - Swapping the active backend via configuration
//! - Easy testing with scripted/mock collaborators
//! - A clean dependency graph (all crates depend inward on core)

pub mod abort;
pub mod backend;
pub mod character;
pub mod error;
pub mod event;
pub mod message;
pub mod session;
pub mod store;
pub mod tokenizer;
pub mod tool;
pub mod world_info;

// Re-export key types at crate root for ergonomics
pub use abort::AbortSignal;
pub use backend::{
    Backend, BackendFamily, BackendRequest, BackendResponse, ChatChoice, ChatRequest,
    ChunkReceiver, StreamChunk, TextRequest, TokenLogprob, ToolDefinition, Usage,
};
pub use character::{CharacterCard, DepthPrompt, GroupChat, GroupMember, Persona, PersonaPosition};
pub use error::{BackendError, Error, Result, StoreError, ToolError};
pub use event::{EventBus, PipelineEvent};
pub use message::{
    ChatMessage, ChatMetadata, InjectionPosition, MessageExtra, MessageToolCall, PromptMessage,
    PromptRole, SwipeInfo, ToolInvocation,
};
pub use session::{GenerationType, Session};
pub use store::{ChatHeader, ChatStore, MemoryChatStore};
pub use tokenizer::{CHAT_MESSAGE_OVERHEAD, HeuristicTokenizer, TokenCounter};
pub use tool::{Tool, ToolCall, ToolInvocationReport, ToolRegistry, ToolResult};
pub use world_info::{
    DepthEntry, ExampleEntry, ExamplePosition, NoWorldInfo, WorldInfoBundle, WorldInfoProvider,
};
