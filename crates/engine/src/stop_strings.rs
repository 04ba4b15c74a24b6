//! Stop-string collection.

use crate::instruct::InstructFormatter;
use crate::macros::MacroContext;
use promptloom_config::AppConfig;
use promptloom_core::character::GroupChat;

/// Inputs that decide which stop strings apply to a run.
pub struct StopStringContext<'a> {
    pub config: &'a AppConfig,
    pub macros: &'a MacroContext,
    pub user: &'a str,
    pub speaker: &'a str,
    pub group: Option<&'a GroupChat>,
    pub is_impersonate: bool,
}

/// Custom stop strings from config, macro-substituted.
pub fn custom_stopping_strings(config: &AppConfig, macros: &MacroContext) -> Vec<String> {
    config
        .context
        .custom_stopping_strings
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| macros.substitute(s))
        .collect()
}

/// Every stop string for the run, de-duplicated in first-seen order.
pub fn stopping_strings(ctx: &StopStringContext<'_>) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();

    if ctx.config.context.names_as_stop_strings {
        let char_string = format!("\n{}:", ctx.speaker);
        let user_string = format!("\n{}:", ctx.user);
        result.push(if ctx.is_impersonate { char_string } else { user_string.clone() });
        result.push(user_string);
        if let Some(group) = ctx.group {
            let speaker = if ctx.is_impersonate { "" } else { ctx.speaker };
            result.extend(group.silent_members(speaker).map(|m| format!("\n{}:", m.name)));
        }
    }

    let instruct = InstructFormatter::new(&ctx.config.instruct, ctx.macros, ctx.group.is_some());
    result.extend(instruct.stop_sequences(ctx.user, ctx.speaker));
    result.extend(custom_stopping_strings(ctx.config, ctx.macros));

    if ctx.config.context.single_line {
        result.insert(0, "\n".to_string());
    }

    let mut unique: Vec<String> = Vec::with_capacity(result.len());
    for s in result {
        if !s.is_empty() && !unique.contains(&s) {
            unique.push(s);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptloom_core::character::GroupMember;

    fn ctx<'a>(config: &'a AppConfig, macros: &'a MacroContext) -> StopStringContext<'a> {
        StopStringContext {
            config,
            macros,
            user: "Alice",
            speaker: "Seraphina",
            group: None,
            is_impersonate: false,
        }
    }

    #[test]
    fn names_and_custom_strings() {
        let mut config = AppConfig::default();
        config.context.custom_stopping_strings = vec!["{{char}} sighs".into(), "".into()];
        let macros = MacroContext::with_names("Alice", "Seraphina");
        let stops = stopping_strings(&ctx(&config, &macros));
        assert_eq!(stops, vec!["\nAlice:", "Seraphina sighs"]);
    }

    #[test]
    fn group_members_and_single_line() {
        let mut config = AppConfig::default();
        config.context.single_line = true;
        let macros = MacroContext::with_names("Alice", "Aria");
        let group = GroupChat {
            name: "Party".into(),
            members: vec![
                GroupMember { name: "Aria".into(), enabled: true },
                GroupMember { name: "Bram".into(), enabled: true },
                GroupMember { name: "Cole".into(), enabled: false },
            ],
        };
        let mut c = ctx(&config, &macros);
        c.speaker = "Aria";
        c.group = Some(&group);
        assert_eq!(stopping_strings(&c), vec!["\n", "\nAlice:", "\nBram:"]);
    }

    #[test]
    fn instruct_sequences_included() {
        let mut config = AppConfig::default();
        config.instruct.enabled = true;
        let macros = MacroContext::with_names("Alice", "Seraphina");
        let stops = stopping_strings(&ctx(&config, &macros));
        assert_eq!(stops, vec!["\nAlice:", "\n### Instruction:", "\n### Response:"]);
    }
}
