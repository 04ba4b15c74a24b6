//! Token budget manager.
//!
//! [`compute_budget`] decides how many prompt tokens the active backend can
//! take; [`fit_to_budget`] removes one unit at a time (unpinned examples
//! first, then the oldest history entry) until the prompt fits. A prompt that
//! cannot be made to fit is returned as it is: the backend enforces the limit.

use crate::assembler::AssembledPrompt;
use promptloom_config::AppConfig;
use promptloom_core::backend::BackendFamily;
use promptloom_core::tokenizer::TokenCounter;
use tracing::{debug, warn};

/// Hosted NovelAI tiers whose window is fixed regardless of configuration.
const NOVEL_CONTEXT_CAPS: &[(&str, u32)] = &[("clio", 8192), ("kayra", 8192)];

/// Maximum prompt size in tokens for the active backend.
pub fn compute_budget(
    config: &AppConfig,
    family: BackendFamily,
    model: &str,
    counter: &dyn TokenCounter,
) -> usize {
    if family.is_chat() {
        let cc = &config.chat_completion;
        return cc.max_context.saturating_sub(cc.max_tokens) as usize;
    }

    let ctx = &config.context;
    let mut max_context = ctx.max_context;
    if family == BackendFamily::Novel {
        let model = model.to_ascii_lowercase();
        if let Some((_, cap)) = NOVEL_CONTEXT_CAPS.iter().find(|(tier, _)| model.contains(tier)) {
            max_context = max_context.min(*cap);
        }
    }

    let mut budget = max_context
        .saturating_sub(ctx.response_length)
        .saturating_sub(ctx.token_padding) as usize;

    if config.cfg.is_active() {
        let negative = counter.count(&config.cfg.negative_prompt);
        budget = budget.saturating_sub(negative);
        debug!(negative_tokens = negative, "CFG negative prompt reduces budget");
    }
    budget
}

/// What trimming did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FitReport {
    pub budget: usize,
    pub initial_tokens: usize,
    pub final_tokens: usize,
    pub removed_examples: usize,
    pub removed_history: usize,
    pub iterations: usize,
    /// Nothing removable was left and the prompt is still too large
    pub over_budget: bool,
}

impl FitReport {
    /// Fold a follow-up trimming pass over the same prompt into this report.
    pub fn absorb(&mut self, next: FitReport) {
        self.removed_examples += next.removed_examples;
        self.removed_history += next.removed_history;
        self.iterations += next.iterations;
        self.final_tokens = next.final_tokens;
        self.over_budget = next.over_budget;
    }
}

/// Trim `prompt` until it fits in `budget` tokens.
///
/// Each iteration removes exactly one unit and re-measures, so the token
/// count never increases and the loop ends after at most as many iterations
/// as there are removable units. Calling it again on a fitted prompt is a
/// no-op.
pub fn fit_to_budget(prompt: &mut AssembledPrompt, budget: usize, counter: &dyn TokenCounter) -> FitReport {
    let fixed = prompt.header.token_count(counter)
        + prompt.chat_start.token_count(counter)
        + prompt.tail.token_count(counter);
    let mut example_costs: Vec<usize> = prompt
        .examples
        .iter()
        .map(|b| b.unit.token_count(counter))
        .collect();
    let mut history_costs: Vec<usize> = prompt
        .history
        .iter()
        .map(|h| h.unit.token_count(counter))
        .collect();

    let measure = |examples: &[usize], history: &[usize]| -> usize {
        fixed + examples.iter().sum::<usize>() + history.iter().sum::<usize>()
    };

    let mut report = FitReport {
        budget,
        initial_tokens: measure(&example_costs, &history_costs),
        ..FitReport::default()
    };
    let mut tokens = report.initial_tokens;

    while tokens > budget {
        if let Some(pos) = prompt.examples.iter().rposition(|b| !b.pinned) {
            prompt.examples.remove(pos);
            example_costs.remove(pos);
            report.removed_examples += 1;
        } else if !prompt.history.is_empty() {
            prompt.history.remove(0);
            history_costs.remove(0);
            report.removed_history += 1;
        } else {
            report.over_budget = true;
            break;
        }
        report.iterations += 1;

        let next = measure(&example_costs, &history_costs);
        debug_assert!(next <= tokens);
        tokens = next;
    }

    report.final_tokens = tokens;
    if report.over_budget {
        warn!(tokens, budget, "Prompt exceeds budget after trimming everything removable");
    } else if report.iterations > 0 {
        debug!(
            tokens,
            budget,
            removed_examples = report.removed_examples,
            removed_history = report.removed_history,
            "Trimmed prompt to budget"
        );
    }
    report
}
