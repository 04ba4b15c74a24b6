//! Configuration loading, validation, and management for promptloom.
//!
//! Loads configuration from `~/.promptloom/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use promptloom_core::BackendFamily;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The default story-string template (Handlebars subset).
pub const DEFAULT_STORY_STRING: &str = "{{#if system}}{{system}}\n{{/if}}{{#if wiBefore}}{{wiBefore}}\n{{/if}}{{#if description}}{{description}}\n{{/if}}{{#if personality}}{{char}}'s personality: {{personality}}\n{{/if}}{{#if scenario}}Scenario: {{scenario}}\n{{/if}}{{#if wiAfter}}{{wiAfter}}\n{{/if}}{{#if persona}}{{persona}}\n{{/if}}";

/// The root configuration structure.
///
/// Maps directly to `~/.promptloom/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Which backend family is active
    #[serde(default)]
    pub main_api: BackendFamily,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of the backend (family default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Model identifier sent to the backend
    #[serde(default)]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub instruct: InstructConfig,

    #[serde(default)]
    pub chat_completion: ChatCompletionConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub cfg: CfgConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_true() -> bool {
    true
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("main_api", &self.main_api)
            .field(
                "api_key",
                &if self.api_key.is_some() { "[REDACTED]" } else { "None" },
            )
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("context", &self.context)
            .field("instruct", &self.instruct)
            .field("chat_completion", &self.chat_completion)
            .field("streaming", &self.streaming)
            .field("tools", &self.tools)
            .field("cfg", &self.cfg)
            .field("persistence", &self.persistence)
            .finish()
    }
}

// ── Text-completion context ─────────────────────────────────────────────

/// Prompt shaping shared by every backend family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Context window of text-completion backends, in tokens
    #[serde(default = "default_max_context")]
    pub max_context: u32,

    /// Tokens reserved for the reply
    #[serde(default = "default_response_length")]
    pub response_length: u32,

    /// Safety margin subtracted from text-completion budgets
    #[serde(default = "default_token_padding")]
    pub token_padding: u32,

    /// Never trim example dialogue
    #[serde(default)]
    pub pin_examples: bool,

    /// Heading placed before each example block
    #[serde(default = "default_separator")]
    pub example_separator: String,

    /// Line placed between the examples and the chat
    #[serde(default = "default_separator")]
    pub chat_start: String,

    #[serde(default = "default_story_string")]
    pub story_string: String,

    /// Stop on `\n{name}:` lines
    #[serde(default = "default_true")]
    pub names_as_stop_strings: bool,

    #[serde(default)]
    pub custom_stopping_strings: Vec<String>,

    /// Stop at the first newline
    #[serde(default)]
    pub single_line: bool,

    /// Collapse runs of blank lines in replies
    #[serde(default)]
    pub collapse_newlines: bool,

    /// Cut replies back to the last complete sentence
    #[serde(default)]
    pub trim_sentences: bool,

    #[serde(default = "default_true")]
    pub trim_spaces: bool,

    /// Close unbalanced `*` and `"` in replies
    #[serde(default = "default_true")]
    pub auto_fix_markdown: bool,

    /// Keep `\n{user}:` lines in replies instead of cutting there
    #[serde(default)]
    pub allow_name1_display: bool,

    /// Keep a leading `{char}:` in replies
    #[serde(default)]
    pub allow_name2_display: bool,

    /// Candidates requested per generation
    #[serde(default = "default_swipes_per_request")]
    pub swipes_per_request: u32,

    /// Text prepended to the model's reply ("start reply with")
    #[serde(default)]
    pub user_prompt_bias: String,
}

fn default_max_context() -> u32 {
    4096
}
fn default_response_length() -> u32 {
    300
}
fn default_token_padding() -> u32 {
    64
}
fn default_separator() -> String {
    "***".into()
}
fn default_story_string() -> String {
    DEFAULT_STORY_STRING.into()
}
fn default_swipes_per_request() -> u32 {
    1
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context: default_max_context(),
            response_length: default_response_length(),
            token_padding: default_token_padding(),
            pin_examples: false,
            example_separator: default_separator(),
            chat_start: default_separator(),
            story_string: default_story_string(),
            names_as_stop_strings: true,
            custom_stopping_strings: vec![],
            single_line: false,
            collapse_newlines: false,
            trim_sentences: false,
            trim_spaces: true,
            auto_fix_markdown: true,
            allow_name1_display: false,
            allow_name2_display: false,
            swipes_per_request: default_swipes_per_request(),
            user_prompt_bias: String::new(),
        }
    }
}

// ── Instruct mode ───────────────────────────────────────────────────────

/// When speaker names are written into instruct-formatted turns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamesBehavior {
    /// Never
    None,
    /// Only in group chats, or for messages not from the user or the character
    #[default]
    Force,
    /// Always
    Always,
}

/// Instruct-mode sequences. Defaults follow the Alpaca layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Instruct-mode system prompt, `{{system}}` in the story string
    #[serde(default)]
    pub system_prompt: String,

    #[serde(default = "default_input_sequence")]
    pub input_sequence: String,
    #[serde(default)]
    pub input_suffix: String,

    #[serde(default = "default_output_sequence")]
    pub output_sequence: String,
    #[serde(default)]
    pub output_suffix: String,

    #[serde(default)]
    pub system_sequence: String,
    #[serde(default)]
    pub system_suffix: String,

    #[serde(default)]
    pub first_input_sequence: String,
    #[serde(default)]
    pub last_input_sequence: String,
    #[serde(default)]
    pub first_output_sequence: String,
    #[serde(default)]
    pub last_output_sequence: String,
    #[serde(default)]
    pub last_system_sequence: String,

    #[serde(default)]
    pub stop_sequence: String,

    /// Put sequences on their own lines
    #[serde(default = "default_true")]
    pub wrap: bool,

    #[serde(default = "default_true")]
    pub macro_substitution: bool,

    #[serde(default)]
    pub names_behavior: NamesBehavior,

    /// Render system turns with the user sequences
    #[serde(default)]
    pub system_same_as_user: bool,

    #[serde(default = "default_true")]
    pub sequences_as_stop_strings: bool,

    /// Leave example dialogue unformatted
    #[serde(default)]
    pub skip_examples: bool,
}

fn default_input_sequence() -> String {
    "### Instruction:".into()
}
fn default_output_sequence() -> String {
    "### Response:".into()
}

impl Default for InstructConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            system_prompt: String::new(),
            input_sequence: default_input_sequence(),
            input_suffix: String::new(),
            output_sequence: default_output_sequence(),
            output_suffix: String::new(),
            system_sequence: String::new(),
            system_suffix: String::new(),
            first_input_sequence: String::new(),
            last_input_sequence: String::new(),
            first_output_sequence: String::new(),
            last_output_sequence: String::new(),
            last_system_sequence: String::new(),
            stop_sequence: String::new(),
            wrap: true,
            macro_substitution: true,
            names_behavior: NamesBehavior::Force,
            system_same_as_user: false,
            sequences_as_stop_strings: true,
            skip_examples: false,
        }
    }
}

// ── Chat completion ─────────────────────────────────────────────────────

/// Settings for the role-tagged (chat-completion) prompt shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionConfig {
    #[serde(default = "default_chat_max_context")]
    pub max_context: u32,

    #[serde(default = "default_response_length")]
    pub max_tokens: u32,

    /// System prompt placed before the story string
    #[serde(default = "default_main_prompt")]
    pub main_prompt: String,

    #[serde(default = "default_new_chat_prompt")]
    pub new_chat_prompt: String,

    #[serde(default = "default_new_example_chat_prompt")]
    pub new_example_chat_prompt: String,

    #[serde(default = "default_continue_nudge_prompt")]
    pub continue_nudge_prompt: String,

    #[serde(default = "default_impersonation_prompt")]
    pub impersonation_prompt: String,

    /// Prefix message content with the speaker name instead of using the `name` field
    #[serde(default)]
    pub names_in_content: bool,
}

fn default_chat_max_context() -> u32 {
    8192
}
fn default_main_prompt() -> String {
    "Write {{char}}'s next reply in a fictional chat between {{char}} and {{user}}.".into()
}
fn default_new_chat_prompt() -> String {
    "[Start a new Chat]".into()
}
fn default_new_example_chat_prompt() -> String {
    "[Example Chat]".into()
}
fn default_continue_nudge_prompt() -> String {
    "[Continue the following message. Do not include ANY parts of the original message. Use capitalization and punctuation as if your reply is a part of the original message: {{lastChatMessage}}]".into()
}
fn default_impersonation_prompt() -> String {
    "[Write your next reply from the point of view of {{user}}, using the chat history so far as a guideline for the writing style of {{user}}. Don't write as {{char}} or system. Don't describe actions of {{char}}.]".into()
}

impl Default for ChatCompletionConfig {
    fn default() -> Self {
        Self {
            max_context: default_chat_max_context(),
            max_tokens: default_response_length(),
            main_prompt: default_main_prompt(),
            new_chat_prompt: default_new_chat_prompt(),
            new_example_chat_prompt: default_new_example_chat_prompt(),
            continue_nudge_prompt: default_continue_nudge_prompt(),
            impersonation_prompt: default_impersonation_prompt(),
            names_in_content: false,
        }
    }
}

// ── Streaming, tools, guidance, persistence ─────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum message commits per second while streaming
    #[serde(default = "default_fps")]
    pub fps: u32,
}

fn default_fps() -> u32 {
    30
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fps: default_fps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Maximum number of tool-triggered follow-up passes
    #[serde(default = "default_recurse_limit")]
    pub recurse_limit: u32,
}

fn default_recurse_limit() -> u32 {
    5
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            recurse_limit: default_recurse_limit(),
        }
    }
}

/// Classifier-free guidance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CfgConfig {
    #[serde(default)]
    pub negative_prompt: String,

    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f32,
}

fn default_guidance_scale() -> f32 {
    1.0
}

impl CfgConfig {
    /// Guidance only does anything with a negative prompt and a scale other than 1.
    pub fn is_active(&self) -> bool {
        !self.negative_prompt.trim().is_empty() && (self.guidance_scale - 1.0).abs() > f32::EPSILON
    }
}

impl Default for CfgConfig {
    fn default() -> Self {
        Self {
            negative_prompt: String::new(),
            guidance_scale: default_guidance_scale(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory holding `.jsonl` chat files (`~/.promptloom/chats` when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chats_dir: Option<PathBuf>,
}

impl PersistenceConfig {
    pub fn chats_dir(&self) -> PathBuf {
        self.chats_dir
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("chats"))
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chats_dir: None,
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from the default path (~/.promptloom/config.toml).
    ///
    /// Environment overrides, highest priority first:
    /// - `PROMPTLOOM_API_KEY`, then `OPENAI_API_KEY` (only when the file has no key)
    /// - `PROMPTLOOM_MAIN_API`
    /// - `PROMPTLOOM_MODEL`
    /// - `PROMPTLOOM_API_URL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if self.api_key.is_none() {
            self.api_key = std::env::var("PROMPTLOOM_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(api) = std::env::var("PROMPTLOOM_MAIN_API") {
            self.main_api = api
                .parse()
                .map_err(|e: String| ConfigError::ValidationError(e))?;
        }

        if let Ok(model) = std::env::var("PROMPTLOOM_MODEL") {
            self.model = model;
        }

        if let Ok(url) = std::env::var("PROMPTLOOM_API_URL") {
            self.api_url = Some(url);
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".promptloom")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.context.response_length >= self.context.max_context {
            return Err(ConfigError::ValidationError(
                "context.response_length must be smaller than context.max_context".into(),
            ));
        }

        if self.chat_completion.max_tokens >= self.chat_completion.max_context {
            return Err(ConfigError::ValidationError(
                "chat_completion.max_tokens must be smaller than chat_completion.max_context"
                    .into(),
            ));
        }

        if self.context.swipes_per_request == 0 {
            return Err(ConfigError::ValidationError(
                "context.swipes_per_request must be at least 1".into(),
            ));
        }

        if self.streaming.fps == 0 {
            return Err(ConfigError::ValidationError(
                "streaming.fps must be at least 1".into(),
            ));
        }

        Ok(())
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            main_api: BackendFamily::default(),
            api_key: None,
            api_url: None,
            model: String::new(),
            temperature: default_temperature(),
            context: ContextConfig::default(),
            instruct: InstructConfig::default(),
            chat_completion: ChatCompletionConfig::default(),
            streaming: StreamingConfig::default(),
            tools: ToolsConfig::default(),
            cfg: CfgConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.main_api, BackendFamily::TextGen);
        assert_eq!(config.context.max_context, 4096);
        assert_eq!(config.context.token_padding, 64);
        assert_eq!(config.tools.recurse_limit, 5);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.main_api, config.main_api);
        assert_eq!(parsed.context.story_string, DEFAULT_STORY_STRING);
        assert_eq!(parsed.instruct.input_sequence, "### Instruction:");
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            temperature: 5.0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn response_length_must_fit_context() {
        let mut config = AppConfig::default();
        config.context.response_length = 4096;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("response_length"));
    }

    #[test]
    fn zero_swipes_rejected() {
        let mut config = AppConfig::default();
        config.context.swipes_per_request = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.chat_completion.max_context, 8192);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
main_api = "openai"
model = "gpt-4o-mini"

[instruct]
enabled = true
names_behavior = "always"

[streaming]
fps = 10
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.main_api, BackendFamily::OpenAi);
        assert_eq!(config.model, "gpt-4o-mini");
        assert!(config.instruct.enabled);
        assert_eq!(config.instruct.names_behavior, NamesBehavior::Always);
        assert_eq!(config.streaming.fps, 10);
        assert!(config.streaming.enabled);
        assert_eq!(config.context.response_length, 300);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "main_api = [oops").unwrap();
        assert!(matches!(
            AppConfig::load_from(file.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn cfg_requires_prompt_and_scale() {
        let mut cfg = CfgConfig::default();
        assert!(!cfg.is_active());
        cfg.negative_prompt = "bad writing".into();
        assert!(!cfg.is_active());
        cfg.guidance_scale = 1.5;
        assert!(cfg.is_active());
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = AppConfig {
            api_key: Some("sk-secret".into()),
            ..AppConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("main_api = \"textgen\""));
        assert!(toml_str.contains("[instruct]"));
    }
}
