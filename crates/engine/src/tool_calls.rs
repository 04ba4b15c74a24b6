//! Tool-call coordinator.
//!
//! Runs the tool calls a response asked for and decides whether the pipeline
//! makes another pass. The pass itself is driven by the pipeline's trampoline
//! loop; this module only answers "run these" and "may we go deeper".

use promptloom_core::backend::{BackendFamily, ToolDefinition};
use promptloom_core::message::{ChatMessage, MessageToolCall, ToolInvocation};
use promptloom_core::session::GenerationType;
use promptloom_core::tool::{ToolCall, ToolRegistry};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What running a response's tool calls produced.
#[derive(Debug, Clone, Default)]
pub struct ToolCallOutcome {
    /// End the generation instead of making another pass
    pub should_stop_generation: bool,
    pub invocations: Vec<ToolInvocation>,
    pub stealth_calls: Vec<String>,
    pub errors: Vec<String>,
}

pub struct ToolCallCoordinator {
    registry: Arc<ToolRegistry>,
    recurse_limit: u32,
}

impl ToolCallCoordinator {
    pub fn new(registry: Arc<ToolRegistry>, recurse_limit: u32) -> Self {
        Self {
            registry,
            recurse_limit,
        }
    }

    pub fn recurse_limit(&self) -> u32 {
        self.recurse_limit
    }

    /// Whether a pass at `depth` may still trigger another pass.
    pub fn can_recurse(&self, depth: u32) -> bool {
        depth < self.recurse_limit
    }

    /// Tools are offered to chat backends on regular replies only.
    pub fn is_supported(&self, family: BackendFamily, generation_type: GenerationType) -> bool {
        family.is_chat()
            && !self.registry.is_empty()
            && !matches!(
                generation_type,
                GenerationType::Impersonate | GenerationType::Quiet | GenerationType::Continue
            )
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    /// Execute `calls` and classify the results.
    ///
    /// Unparseable arguments and failing tools are reported as errors and
    /// never stop the remaining calls. Generation only continues when at least
    /// one visible invocation produced something for the next pass to read.
    pub async fn handle_response(&self, calls: &[MessageToolCall]) -> ToolCallOutcome {
        let mut errors = Vec::new();
        let mut parsed = Vec::with_capacity(calls.len());
        for call in calls {
            match ToolCall::try_from(call) {
                Ok(call) => parsed.push(call),
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "Skipping tool call with bad arguments");
                    errors.push(e.to_string());
                }
            }
        }

        let report = self.registry.invoke(&parsed).await;
        errors.extend(report.errors.iter().map(ToString::to_string));

        let should_stop_generation = report.invocations.is_empty() || !report.stealth_calls.is_empty();

        info!(
            invocations = report.invocations.len(),
            stealth = report.stealth_calls.len(),
            errors = errors.len(),
            stop = should_stop_generation,
            "Tool calls handled"
        );

        ToolCallOutcome {
            should_stop_generation,
            invocations: report.invocations,
            stealth_calls: report.stealth_calls,
            errors,
        }
    }
}

/// Text the model sends alongside tool calls when it has nothing to say.
pub fn is_placeholder(text: &str) -> bool {
    matches!(text.trim(), "" | "...")
}

/// The chat record of a batch of invocations.
pub fn invocation_message(invocations: &[ToolInvocation]) -> ChatMessage {
    let names: Vec<&str> = invocations.iter().map(|i| i.display_name.as_str()).collect();
    let mut message = ChatMessage::narrator("Tool", format!("Tool calls: {}", names.join(", ")));
    message.extra.is_small_sys = true;
    message.extra.tool_invocations = invocations.to_vec();
    debug!(count = invocations.len(), "Recorded tool invocations");
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::make_tool_call;
    use async_trait::async_trait;
    use promptloom_core::error::ToolError;
    use promptloom_core::tool::{Tool, ToolResult};

    struct Dice;

    #[async_trait]
    impl Tool for Dice {
        fn name(&self) -> &str {
            "roll_dice"
        }
        fn display_name(&self) -> &str {
            "Dice"
        }
        fn description(&self) -> &str {
            "Roll a die"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"sides": {"type": "integer"}}})
        }
        async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
            let sides = arguments["sides"].as_u64().unwrap_or(6);
            Ok(ToolResult {
                call_id: String::new(),
                success: true,
                output: format!("rolled {sides}"),
            })
        }
    }

    struct Mood;

    #[async_trait]
    impl Tool for Mood {
        fn name(&self) -> &str {
            "set_mood"
        }
        fn description(&self) -> &str {
            "Change expression"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn stealth(&self) -> bool {
            true
        }
        async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
            Ok(ToolResult {
                call_id: String::new(),
                success: true,
                output: String::new(),
            })
        }
    }

    fn coordinator(limit: u32) -> ToolCallCoordinator {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(Dice));
        registry.register(Box::new(Mood));
        ToolCallCoordinator::new(Arc::new(registry), limit)
    }

    #[test]
    fn recursion_ceiling() {
        let c = coordinator(2);
        assert!(c.can_recurse(0));
        assert!(c.can_recurse(1));
        assert!(!c.can_recurse(2));
        assert!(!coordinator(0).can_recurse(0));
    }

    #[test]
    fn support_depends_on_family_and_type() {
        let c = coordinator(5);
        assert!(c.is_supported(BackendFamily::OpenAi, GenerationType::Normal));
        assert!(c.is_supported(BackendFamily::OpenAi, GenerationType::Swipe));
        assert!(!c.is_supported(BackendFamily::OpenAi, GenerationType::Quiet));
        assert!(!c.is_supported(BackendFamily::Kobold, GenerationType::Normal));
        let empty = ToolCallCoordinator::new(Arc::new(ToolRegistry::new()), 5);
        assert!(!empty.is_supported(BackendFamily::OpenAi, GenerationType::Normal));
    }

    #[tokio::test]
    async fn visible_invocations_continue_generation() {
        let c = coordinator(5);
        let calls = vec![make_tool_call("roll_dice", serde_json::json!({"sides": 20}))];
        let outcome = c.handle_response(&calls).await;
        assert!(!outcome.should_stop_generation);
        assert_eq!(outcome.invocations.len(), 1);
        assert_eq!(outcome.invocations[0].result, "rolled 20");
    }

    #[tokio::test]
    async fn stealth_call_stops_generation() {
        let c = coordinator(5);
        let calls = vec![
            make_tool_call("roll_dice", serde_json::json!({})),
            make_tool_call("set_mood", serde_json::json!({"mood": "happy"})),
        ];
        let outcome = c.handle_response(&calls).await;
        assert!(outcome.should_stop_generation);
        assert_eq!(outcome.stealth_calls, vec!["set_mood"]);
        assert_eq!(outcome.invocations.len(), 1);
    }

    #[tokio::test]
    async fn errors_are_collected() {
        let c = coordinator(5);
        let calls = vec![
            MessageToolCall {
                id: "bad".into(),
                name: "roll_dice".into(),
                arguments: "{not json".into(),
            },
            make_tool_call("missing_tool", serde_json::json!({})),
            make_tool_call("roll_dice", serde_json::json!({"sides": 4})),
        ];
        let outcome = c.handle_response(&calls).await;
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(outcome.invocations.len(), 1);
        assert!(!outcome.should_stop_generation);
    }

    #[tokio::test]
    async fn all_calls_failing_stops_generation() {
        let c = coordinator(5);
        let calls = vec![
            make_tool_call("missing_tool", serde_json::json!({})),
            MessageToolCall {
                id: "bad".into(),
                name: "roll_dice".into(),
                arguments: "{not json".into(),
            },
        ];
        let outcome = c.handle_response(&calls).await;
        assert!(outcome.invocations.is_empty());
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.should_stop_generation);
    }

    #[test]
    fn records_invocations() {
        assert!(is_placeholder(" ... "));
        assert!(!is_placeholder("Let me roll."));
        let inv = ToolInvocation {
            id: "call_1".into(),
            display_name: "Dice".into(),
            name: "roll_dice".into(),
            parameters: "{}".into(),
            result: "4".into(),
        };
        let msg = invocation_message(&[inv]);
        assert_eq!(msg.mes, "Tool calls: Dice");
        assert!(msg.is_system && msg.extra.is_small_sys);
    }
}
