//! Tether CLI
//!
//! Command-line interface for Tether - network health checks, engine
//! configuration and a scripted simulation of the sync engine.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tether_core::Config;

mod commands;
mod output;

use commands::simulate::SimulateOptions;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Tether - resilient sync engine for peer messaging clients")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level for tether crates (overrides log_filter and TETHER_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Probe the configured endpoints
    Health {
        /// Also wait up to this many milliseconds for a stable network
        #[arg(long)]
        wait_ms: Option<u64>,
    },
    /// Run the engine against a scripted in-memory peer
    Simulate {
        /// Messages to deliver once the stream is active
        #[arg(long, default_value_t = 5)]
        messages: usize,
        /// Race-condition failures when opening the stream
        #[arg(long, default_value_t = 1)]
        race_errors: usize,
        /// Fatal crashes when opening the stream
        #[arg(long, default_value_t = 0)]
        crashes: usize,
        /// Undecodable messages delivered after the clean ones
        #[arg(long, default_value_t = 1)]
        decode_errors: usize,
        /// Conversations known to the peer
        #[arg(long, default_value_t = 6)]
        conversations: usize,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (log_filter or a dotted path like stream.max_restarts)
        key: String,
        /// Configuration value
        value: String,
    },
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands work even when the config file is broken
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), config_path, &output);
    }

    let config = Config::load_with_cli_override(config_path)?;
    init_logging(cli.log_level.as_deref(), &config);

    match cli.command {
        Commands::Config { .. } => unreachable!(), // Handled above
        Commands::Health { wait_ms } => commands::health::check(&config, wait_ms, &output).await,
        Commands::Simulate {
            messages,
            race_errors,
            crashes,
            decode_errors,
            conversations,
        } => {
            let options = SimulateOptions {
                messages,
                race_errors,
                crashes,
                decode_errors,
                conversations,
            };
            commands::simulate::run(&config, options, &output).await
        }
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
        Some(ConfigCommands::Path) => commands::config::path(config_path, output),
    }
}

/// Initialize logging to stderr
///
/// `--log-level` wins over the configured filter (which TETHER_LOG
/// overrides); without either only warnings are shown.
fn init_logging(log_level: Option<&str>, config: &Config) {
    let env_filter = match (log_level, config.log_filter.as_deref()) {
        (Some(level), _) => EnvFilter::new(format!("tether_core={},tether_cli={}", level, level)),
        (None, Some(filter)) => EnvFilter::new(filter),
        (None, None) => EnvFilter::new("warn"),
    };

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
