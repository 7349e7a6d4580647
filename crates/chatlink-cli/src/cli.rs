use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chatlink")]
#[command(version, about = "Chatlink - chat sessions, account linking and conversation context")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to $CHATLINK_CONFIG, then ./chatlink.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Chat from the terminal as a platform user
    Chat(ChatArgs),

    /// Configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ChatArgs {
    /// Platform user id to chat as
    #[arg(long, default_value = "console-user")]
    pub user: String,

    /// Workspace id
    #[arg(long, default_value = "console")]
    pub workspace: String,

    /// Email reported by the platform directory; links automatically when
    /// a matching account exists
    #[arg(long)]
    pub email: Option<String>,

    /// Seed an existing account with this email
    #[arg(long)]
    pub seed_account: Option<String>,

    /// Persist the conversation log to this redb file (in-memory when omitted)
    #[arg(long, env = "CHATLINK_DB_PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the configuration
    Check,
}
