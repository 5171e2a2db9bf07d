//! guestctl - guest control broker harness
//!
//! Replays scripted guest and host traffic through the broker and inspects
//! its configuration and context ids.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;
mod script;

/// guestctl - guest control broker harness
#[derive(Parser, Debug)]
#[command(name = "guestctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a broker configuration file (defaults apply when absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a JSON script through a fresh broker and print one JSON event per
    /// line
    Replay {
        /// Script file
        script: PathBuf,

        /// Exit non-zero if any step failed
        #[arg(long)]
        strict: bool,
    },

    /// Broker configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Context id helpers
    #[command(subcommand)]
    Context(ContextCommands),
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the default configuration as TOML
    Default,

    /// Load and validate the configuration given by --config
    Check,
}

#[derive(Subcommand, Debug)]
enum ContextCommands {
    /// Split a context id into session, object and count
    Decode {
        /// Context id (decimal or 0x-prefixed hex)
        #[arg(value_parser = commands::context::parse_u32)]
        ctx: u32,
    },

    /// Build a context id
    Make {
        /// Session id
        #[arg(long)]
        session: u32,

        /// Object id
        #[arg(long, default_value_t = 0)]
        object: u32,

        /// Message count
        #[arg(long, default_value_t = 0)]
        count: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the JSON events
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.command {
        Commands::Replay { script, strict } => {
            let failed = commands::replay::run(cli.config.as_deref(), &script)?;
            if strict && failed {
                std::process::exit(1);
            }
            Ok(())
        },
        Commands::Config(config_cmd) => match config_cmd {
            ConfigCommands::Default => commands::config::show_default(),
            ConfigCommands::Check => commands::config::check(cli.config.as_deref()),
        },
        Commands::Context(context_cmd) => match context_cmd {
            ContextCommands::Decode { ctx } => commands::context::decode(ctx),
            ContextCommands::Make {
                session,
                object,
                count,
            } => commands::context::make(session, object, count),
        },
    }
}
