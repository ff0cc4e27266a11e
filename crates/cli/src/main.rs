//! Parley CLI, the main entry point.
//!
//! Commands:
//! - `chat`: interactive chat or single-message mode
//! - `sessions`: list or delete saved sessions
//! - `config`: show, validate, or print the default configuration

use anyhow::Context;
use clap::{Parser, Subcommand};
use parley_config::AppConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Parley: chat with an LLM from your terminal",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file (defaults to ~/.parley/config.toml)
    #[arg(short, long, global = true, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write JSON logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the configured backend
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Use the offline echo service (no backend, tools, or persistence)
        #[arg(long)]
        offline: bool,

        /// Disable tool use for this session
        #[arg(long)]
        no_tools: bool,

        /// Use flat context selection instead of time tiers
        #[arg(long)]
        flat: bool,

        /// Start a fresh session instead of resuming the latest one
        #[arg(long)]
        fresh: bool,
    },

    /// Manage saved sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum SessionsAction {
    /// List saved sessions, most recently updated first
    List,
    /// Delete a saved session
    Delete {
        /// Session ID as shown by `parley sessions list`
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the default configuration
    Default,
    /// Print the config file path
    Path,
    /// Load and validate the configuration
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_file.as_deref())?;

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));

    match cli.command {
        Commands::Chat {
            message,
            offline,
            no_tools,
            flat,
            fresh,
        } => {
            let options = commands::chat::ChatOptions {
                message,
                offline,
                no_tools,
                flat,
                fresh,
            };
            commands::chat::run(&config_path, options).await?
        }
        Commands::Sessions { action } => {
            let config = load_config(&config_path)?;
            match action {
                SessionsAction::List => commands::sessions::list(&config).await?,
                SessionsAction::Delete { id } => commands::sessions::delete(&config, &id).await?,
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(&config_path)?,
            ConfigAction::Default => commands::config_cmd::print_default(),
            ConfigAction::Path => commands::config_cmd::path(&config_path),
            ConfigAction::Validate => commands::config_cmd::validate(&config_path)?,
        },
    }

    Ok(())
}

/// Logs go to stderr (the REPL owns stdout), or as JSON lines to `log_file`.
fn init_tracing(verbose: bool, log_file: Option<&Path>) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

pub(crate) fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    AppConfig::load_with_env(path).with_context(|| format!("loading config from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_message_chat() {
        let cli = Cli::try_parse_from(["parley", "chat", "-m", "hello", "--no-tools", "--flat"]).unwrap();
        match cli.command {
            Commands::Chat {
                message,
                no_tools,
                flat,
                offline,
                fresh,
            } => {
                assert_eq!(message.as_deref(), Some("hello"));
                assert!(no_tools && flat);
                assert!(!offline && !fresh);
            }
            _ => panic!("expected chat"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "parley",
            "sessions",
            "delete",
            "abc",
            "-v",
            "--config",
            "/tmp/parley.toml",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/parley.toml")));
        assert!(matches!(
            cli.command,
            Commands::Sessions {
                action: SessionsAction::Delete { ref id }
            } if id == "abc"
        ));
    }

    #[test]
    fn sessions_requires_action() {
        assert!(Cli::try_parse_from(["parley", "sessions"]).is_err());
    }
}
