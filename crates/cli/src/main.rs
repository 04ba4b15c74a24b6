//! PromptLoom CLI, the main entry point.
//!
//! Commands:
//! - `chat`    Interactive or one-shot chat with a character card
//! - `prompt`  Print the assembled prompt without calling the backend
//! - `config`  Create, show or locate the configuration file

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "promptloom",
    about = "PromptLoom: chat prompt orchestration for language models",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with a character
    Chat {
        /// Character card (Tavern V1 or V2 JSON)
        #[arg(short, long)]
        character: PathBuf,

        /// Chat file to resume (`.jsonl`); a new chat is started when omitted
        #[arg(long)]
        chat: Option<PathBuf>,

        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Your name in the chat
        #[arg(short, long, default_value = "User")]
        user: String,
    },

    /// Print the assembled prompt and budget report
    Prompt {
        #[arg(short, long)]
        character: PathBuf,

        #[arg(long)]
        chat: Option<PathBuf>,

        #[arg(short, long, default_value = "User")]
        user: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Chat {
            character,
            chat,
            message,
            user,
        } => commands::chat::run(&character, chat.as_deref(), message, &user).await?,
        Commands::Prompt { character, chat, user } => {
            commands::prompt::run(&character, chat.as_deref(), &user).await?
        }
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => commands::config_cmd::init(force).await?,
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
        },
    }

    Ok(())
}
