//! The injection registry: out-of-band prompt fragments.
//!
//! Extension prompts are keyed text fragments (author's note, persona at
//! depth, depth-placed world info, the quiet prompt) that land outside the
//! normal chat flow: before or after the story string, or inside the history
//! at a depth counted from the newest message.
//!
//! Filters are async and are evaluated exactly once per assembly, when a
//! [`InjectionSnapshot`] is taken; everything downstream reads the snapshot.

use crate::macros::MacroContext;
use async_trait::async_trait;
use promptloom_core::message::{InjectionPosition, PromptRole};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Deepest position an in-chat entry may request.
pub const MAX_INJECTION_DEPTH: u32 = 1000;

/// Chat-level author's note.
pub const AUTHORS_NOTE_KEY: &str = "2_floating_prompt";
/// Character's depth note.
pub const DEPTH_PROMPT_KEY: &str = "DEPTH_PROMPT";
/// Persona description placed at depth.
pub const PERSONA_DESCRIPTION_KEY: &str = "PERSONA_DESCRIPTION";
/// Carrier for the quiet prompt (scanned by world info, never placed).
pub const QUIET_PROMPT_KEY: &str = "QUIET_PROMPT";

/// Key for a depth-placed world-info entry.
pub fn depth_world_info_key(depth: u32, role: PromptRole) -> String {
    format!("customDepthWI_{depth}_{}", role.as_str())
}

/// Gate deciding whether an entry is placed in the current assembly.
#[async_trait]
pub trait PromptFilter: Send + Sync {
    async fn allows(&self) -> bool;
}

/// Adapts a plain closure into a [`PromptFilter`].
pub struct FnFilter<F>(pub F);

#[async_trait]
impl<F> PromptFilter for FnFilter<F>
where
    F: Fn() -> bool + Send + Sync,
{
    async fn allows(&self) -> bool {
        (self.0)()
    }
}

/// One registered fragment.
#[derive(Clone)]
pub struct ExtensionPrompt {
    pub value: String,
    pub position: InjectionPosition,
    /// Distance from the newest message (in-chat entries only)
    pub depth: u32,
    /// Whether world-info scanning sees this text
    pub scan: bool,
    pub role: PromptRole,
    pub filter: Option<Arc<dyn PromptFilter>>,
    /// Cleared after the assembly that consumes it
    pub transient: bool,
}

impl fmt::Debug for ExtensionPrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionPrompt")
            .field("value", &self.value)
            .field("position", &self.position)
            .field("depth", &self.depth)
            .field("scan", &self.scan)
            .field("role", &self.role)
            .field("filtered", &self.filter.is_some())
            .field("transient", &self.transient)
            .finish()
    }
}

impl ExtensionPrompt {
    pub fn new(
        value: impl Into<String>,
        position: InjectionPosition,
        depth: u32,
        scan: bool,
        role: PromptRole,
    ) -> Self {
        Self {
            value: value.into(),
            position,
            depth: depth.min(MAX_INJECTION_DEPTH),
            scan,
            role,
            filter: None,
            transient: false,
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn PromptFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }
}

/// Keyed table of extension prompts.
#[derive(Debug, Clone, Default)]
pub struct InjectionRegistry {
    entries: BTreeMap<String, ExtensionPrompt>,
}

impl InjectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert an entry.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        position: InjectionPosition,
        depth: u32,
        scan: bool,
        role: PromptRole,
    ) {
        self.insert(key, ExtensionPrompt::new(value, position, depth, scan, role));
    }

    /// Upsert a fully built entry (filters, transience).
    pub fn insert(&mut self, key: impl Into<String>, prompt: ExtensionPrompt) {
        self.entries.insert(key.into(), prompt);
    }

    pub fn remove(&mut self, key: &str) -> Option<ExtensionPrompt> {
        self.entries.remove(key)
    }

    pub fn entry(&self, key: &str) -> Option<&ExtensionPrompt> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Values visible to world-info scanning.
    ///
    /// Filters gate placement only, so they are not consulted here.
    pub fn scan_input(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.scan && !e.value.is_empty())
            .map(|e| e.value.clone())
            .collect()
    }

    /// Empty every transient entry. Returns how many were cleared.
    pub fn clear_transient(&mut self) -> usize {
        let mut cleared = 0;
        for entry in self.entries.values_mut() {
            if entry.transient && !entry.value.is_empty() {
                entry.value.clear();
                cleared += 1;
            }
        }
        cleared
    }

    /// Evaluate filters once and freeze the placeable entries.
    pub async fn snapshot(&self) -> InjectionSnapshot {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (key, entry) in &self.entries {
            if entry.value.is_empty() {
                continue;
            }
            if let Some(filter) = &entry.filter
                && !filter.allows().await
            {
                debug!(key = %key, "Extension prompt filtered out");
                continue;
            }
            entries.push(SnapshotEntry {
                key: key.clone(),
                value: entry.value.clone(),
                position: entry.position,
                depth: entry.depth,
                scan: entry.scan,
                role: entry.role,
            });
        }
        InjectionSnapshot { entries }
    }
}

/// A frozen, filter-passed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub key: String,
    pub value: String,
    pub position: InjectionPosition,
    pub depth: u32,
    pub scan: bool,
    pub role: PromptRole,
}

/// The registry as seen by one assembly (key order).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InjectionSnapshot {
    entries: Vec<SnapshotEntry>,
}

impl InjectionSnapshot {
    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    /// Joined values for a position (and optionally a depth and role).
    ///
    /// Values are trimmed and joined with `separator`. With `wrap` the result
    /// is surrounded by the separator. The joined text is macro-substituted.
    pub fn get(
        &self,
        position: InjectionPosition,
        depth: Option<u32>,
        role: Option<PromptRole>,
        separator: &str,
        wrap: bool,
        macros: &MacroContext,
    ) -> String {
        let mut text = self
            .entries
            .iter()
            .filter(|e| e.position == position)
            .filter(|e| depth.is_none_or(|d| e.depth == d))
            .filter(|e| role.is_none_or(|r| e.role == r))
            .map(|e| e.value.trim())
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join(separator);

        if text.is_empty() {
            return text;
        }
        if wrap && !text.starts_with(separator) {
            text.insert_str(0, separator);
        }
        if wrap && !text.ends_with(separator) {
            text.push_str(separator);
        }
        macros.substitute(&text)
    }

    /// Distinct in-chat depths, ascending.
    pub fn in_chat_depths(&self) -> Vec<u32> {
        let mut depths: Vec<u32> = self
            .entries
            .iter()
            .filter(|e| e.position == InjectionPosition::InChat)
            .map(|e| e.depth)
            .collect();
        depths.sort_unstable();
        depths.dedup();
        depths
    }

    /// Splice in-chat entries into a newest-first list.
    ///
    /// For each depth, roles are visited in [`PromptRole::INJECTION_ORDER`];
    /// each non-empty value becomes one item built by `make`. A depth's group
    /// lands at `depth + previously_inserted`. When continuing, depth 0 is
    /// treated as depth 1 so the partial tail message stays last.
    ///
    /// Returns the newest-first positions of the inserted items.
    pub fn inject<T>(
        &self,
        newest_first: &mut Vec<T>,
        is_continue: bool,
        macros: &MacroContext,
        mut make: impl FnMut(PromptRole, String) -> T,
    ) -> Vec<usize> {
        let mut injected = Vec::new();
        let mut total_inserted = 0usize;

        for depth in self.in_chat_depths() {
            let group: Vec<T> = PromptRole::INJECTION_ORDER
                .iter()
                .filter_map(|role| {
                    let text = self.get(
                        InjectionPosition::InChat,
                        Some(depth),
                        Some(*role),
                        "\n",
                        false,
                        macros,
                    );
                    let text = text.trim_start();
                    (!text.is_empty()).then(|| make(*role, text.to_string()))
                })
                .collect();
            if group.is_empty() {
                continue;
            }

            let effective = if is_continue && depth == 0 { 1 } else { depth };
            let at = (effective as usize + total_inserted).min(newest_first.len());
            let count = group.len();
            newest_first.splice(at..at, group);
            injected.extend(at..at + count);
            total_inserted += count;
        }

        injected
    }
}
