//! The generation engine: the heart of PromptLoom.
//!
//! A generation runs **Assemble → Dispatch → Reconcile**:
//!
//! 1. **Assemble** the prompt from the character card, persona, chat history,
//!    examples, world info and extension prompts, trimmed to the token budget
//! 2. **Dispatch** it to the active backend, batch or streamed
//! 3. **Reconcile** the response into the chat (new message, swipe, or
//!    continuation), committing streamed text as it arrives
//! 4. **If tool calls**: run them, record the invocations, and assemble again
//!
//! The loop ends on a plain reply, an abort, or the tool recursion ceiling.

pub mod assembler;
pub mod budget;
pub mod cleanup;
pub mod error;
pub mod examples;
pub mod injection;
pub mod instruct;
pub mod jsonl_store;
pub mod macros;
pub mod pipeline;
pub mod reply;
pub mod stop_strings;
pub mod story;
pub mod streaming;
pub mod swipe;
pub mod tool_calls;

#[cfg(test)]
mod test_helpers;

pub use assembler::{AssembledPrompt, AssemblyInput, ContextAssembler, PromptShape, ensure_greeting};
pub use budget::{FitReport, compute_budget, fit_to_budget};
pub use cleanup::{CleanupOptions, clean_up_message};
pub use error::EngineError;
pub use injection::{ExtensionPrompt, InjectionRegistry, InjectionSnapshot, PromptFilter};
pub use jsonl_store::JsonlChatStore;
pub use macros::MacroContext;
pub use pipeline::{GenerationOutcome, GenerationPipeline, GenerationRequest, PreparedPrompt};
pub use reply::{ReplyTarget, SlotKind};
pub use streaming::{StreamOutcome, StreamState, StreamingProcessor};
pub use swipe::{SwipeDirection, SwipeNavigation, add_swipe, delete_swipe, navigate};
pub use tool_calls::{ToolCallCoordinator, ToolCallOutcome};
