use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use wa_llm_autoreply::app::{init_tracing, run_list_chats_mode, run_reply_mode};
use wa_llm_autoreply::config::{ConfigMode, load_config_for_mode};
use wa_llm_autoreply::session::ReplyRuntimeOptions;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Answers unread WhatsApp Web chats with replies from an OpenAI model.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch for unread chats and reply to them (default).
    Run {
        /// Generate replies and log them without sending.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the chat names visible in the chat list.
    ListChats {
        /// Case-insensitive substring filter.
        #[arg(short, long)]
        query: Option<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run { dry_run: false }) {
        Command::Run { dry_run } => {
            let config = load_config_for_mode(&cli.config, ConfigMode::Reply)?;
            run_reply_mode(&config, &cli.config, ReplyRuntimeOptions::from_env(dry_run)).await
        }
        Command::ListChats { query } => {
            let config = load_config_for_mode(&cli.config, ConfigMode::ListChats)?;
            run_list_chats_mode(&config, query.as_deref()).await
        }
    }
}
