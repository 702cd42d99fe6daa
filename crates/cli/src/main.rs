//! Parley CLI: the main entry point.
//!
//! Commands:
//! - `config`: Show the effective configuration or validate a file
//! - `chat`: Run turns offline against a scripted provider

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod script;
mod store;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Parley: conversational orchestration core",
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
    /// Print the effective configuration as TOML
    Config {
        /// Validate and print this file instead of ~/.parley/config.toml
        #[arg(long)]
        path: Option<PathBuf>,

        /// Print a starter config with every default filled in
        #[arg(long, conflicts_with = "path")]
        default: bool,
    },

    /// Run one or more turns against a scripted provider
    Chat {
        /// JSON file with the provider's replies, consumed in order
        #[arg(short, long)]
        script: PathBuf,

        /// User message; repeat for several turns in one conversation
        #[arg(short, long = "message", required = true)]
        messages: Vec<String>,

        /// Conversation id (defaults to a fresh UUID)
        #[arg(long)]
        session: Option<String>,

        /// Summary of earlier conversation to carry forward
        #[arg(long)]
        summary: Option<String>,

        /// Config file to use instead of ~/.parley/config.toml
        #[arg(long, env = "PARLEY_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Config { path, default } => {
            if default {
                commands::config_cmd::starter()
            } else {
                commands::config_cmd::show(path.as_deref())?
            }
        }
        Commands::Chat {
            script,
            messages,
            session,
            summary,
            config,
        } => {
            commands::chat::run(commands::chat::ChatArgs {
                script,
                messages,
                session,
                summary,
                config,
            })
            .await?
        }
    }

    Ok(())
}
