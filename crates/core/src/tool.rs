//! Tool trait: functions the model may ask the engine to call.
//!
//! Tools are registered in a [`ToolRegistry`]. When a response carries tool
//! calls, the registry executes them and reports which ones produced visible
//! invocations, which were "stealth" (run silently, end generation), and
//! which failed.

use crate::backend::ToolDefinition;
use crate::error::ToolError;
use crate::message::{MessageToolCall, ToolInvocation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// A request to execute a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the model's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

impl TryFrom<&MessageToolCall> for ToolCall {
    type Error = ToolError;

    /// Parse the raw argument string the model produced.
    fn try_from(call: &MessageToolCall) -> Result<Self, Self::Error> {
        let arguments = if call.arguments.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&call.arguments).map_err(|e| {
                ToolError::InvalidArguments(format!("{}: {e}", call.name))
            })?
        };
        Ok(Self {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments,
        })
    }
}

/// The result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    /// Whether the tool executed successfully
    pub success: bool,

    /// The output content
    pub output: String,
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "roll_dice").
    fn name(&self) -> &str;

    /// Name shown to the user in invocation reports.
    fn display_name(&self) -> &str {
        self.name()
    }

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Stealth tools run without recording an invocation, and calling one
    /// ends the generation instead of triggering another pass.
    fn stealth(&self) -> bool {
        false
    }

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Outcome of invoking a batch of tool calls.
#[derive(Debug, Clone, Default)]
pub struct ToolInvocationReport {
    /// Visible invocations, in call order
    pub invocations: Vec<ToolInvocation>,

    /// Names of stealth tools that were called
    pub stealth_calls: Vec<String>,

    /// Per-call failures; they never abort the other calls
    pub errors: Vec<ToolError>,
}

impl ToolInvocationReport {
    pub fn is_empty(&self) -> bool {
        self.invocations.is_empty() && self.stealth_calls.is_empty() && self.errors.is_empty()
    }
}

/// A registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions sorted by name, so requests are stable across runs.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a single tool call.
    pub async fn execute(&self, call: &ToolCall) -> Result<ToolResult, ToolError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        tool.execute(call.arguments.clone()).await
    }

    /// Execute every call in order and classify the outcomes.
    pub async fn invoke(&self, calls: &[ToolCall]) -> ToolInvocationReport {
        let mut report = ToolInvocationReport::default();

        for call in calls {
            let Some(tool) = self.tools.get(&call.name) else {
                warn!(tool = %call.name, "Model requested an unknown tool");
                report.errors.push(ToolError::NotFound(call.name.clone()));
                continue;
            };

            debug!(tool = %call.name, call_id = %call.id, "Invoking tool");
            let result = match tool.execute(call.arguments.clone()).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "Tool execution failed");
                    report.errors.push(e);
                    continue;
                }
            };

            if tool.stealth() {
                report.stealth_calls.push(call.name.clone());
                continue;
            }

            report.invocations.push(ToolInvocation {
                id: call.id.clone(),
                display_name: tool.display_name().to_string(),
                name: call.name.clone(),
                parameters: call.arguments.to_string(),
                result: result.output,
            });
        }

        report
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
