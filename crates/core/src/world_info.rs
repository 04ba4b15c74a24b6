//! World-info collaborator.
//!
//! Lorebook retrieval is not part of the engine. The engine hands a provider
//! the scan input (recent chat text plus scannable extension prompts) and
//! places whatever comes back.

use crate::message::PromptRole;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A lore entry to be injected into chat history at a depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthEntry {
    pub depth: u32,
    pub role: PromptRole,
    pub content: String,
}

/// Where an example-dialogue entry goes relative to the card examples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamplePosition {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleEntry {
    pub position: ExamplePosition,
    pub content: String,
}

/// Everything a world-info scan activated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldInfoBundle {
    /// Text placed before the character description
    #[serde(default)]
    pub before: String,

    /// Text placed after the scenario
    #[serde(default)]
    pub after: String,

    #[serde(default)]
    pub depth_entries: Vec<DepthEntry>,

    #[serde(default)]
    pub examples: Vec<ExampleEntry>,
}

impl WorldInfoBundle {
    pub fn is_empty(&self) -> bool {
        self.before.is_empty()
            && self.after.is_empty()
            && self.depth_entries.is_empty()
            && self.examples.is_empty()
    }
}

#[async_trait]
pub trait WorldInfoProvider: Send + Sync {
    /// Scan `scan_input` (newest text first) and return activated entries.
    async fn scan(&self, scan_input: &[String], max_context: usize) -> WorldInfoBundle;
}

/// A provider that never activates anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWorldInfo;

#[async_trait]
impl WorldInfoProvider for NoWorldInfo {
    async fn scan(&self, _scan_input: &[String], _max_context: usize) -> WorldInfoBundle {
        WorldInfoBundle::default()
    }
}
