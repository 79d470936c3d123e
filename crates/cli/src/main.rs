//! MetricChat CLI: the main entry point.
//!
//! Commands:
//! - `run`: Run a session against a replay script, streaming events
//! - `resume`: Continue a persisted session
//! - `tools`: Print the tool catalog of a script
//! - `trace`: Show persisted sessions and their iterations
//! - `config`: Show or initialise configuration

use clap::{Parser, Subcommand, ValueEnum};
use metricchat_config::AppConfig;
use std::path::PathBuf;

mod commands;
mod replay;

#[derive(Parser)]
#[command(
    name = "metricchat",
    about = "MetricChat: analytics agent execution core",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.metricchat/config.toml)
    #[arg(long, global = true, env = "METRICCHAT_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    Memory,
    Jsonl,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question against a replay script
    Run {
        /// Replay script (TOML)
        #[arg(short, long)]
        script: PathBuf,

        /// Override the script's question
        #[arg(short, long)]
        question: Option<String>,

        /// Override the iteration budget
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Snapshot backend (defaults to the configured one)
        #[arg(long, value_enum)]
        store: Option<StoreKind>,
    },

    /// Continue a persisted session at its next iteration
    Resume {
        #[arg(short, long)]
        script: PathBuf,

        #[arg(long)]
        session: String,
    },

    /// Print the tool catalog declared by a script
    Tools {
        #[arg(short, long)]
        script: PathBuf,
    },

    /// List persisted sessions, or print one session's iterations
    Trace {
        #[arg(long)]
        session: Option<String>,

        /// Print full iteration records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write the default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));

    // `config init` must work even when the current file does not parse.
    let config = match &cli.command {
        Commands::Config {
            action: ConfigAction::Init { .. },
        } => AppConfig::default(),
        _ => AppConfig::load_with_env(&config_path)
            .map_err(|e| format!("Failed to load config: {e}"))?,
    };

    init_tracing(&config, cli.verbose);

    match cli.command {
        Commands::Run {
            script,
            question,
            max_iterations,
            store,
        } => commands::run::run(&config, &script, question, max_iterations, store).await?,
        Commands::Resume { script, session } => {
            commands::run::resume(&config, &script, &session).await?
        }
        Commands::Tools { script } => commands::tools::run(&script)?,
        Commands::Trace { session, json } => {
            commands::trace::run(&config, session.as_deref(), json).await?
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(&config)?,
            ConfigAction::Init { force } => commands::config_cmd::init(&config_path, force)?,
        },
    }

    Ok(())
}

/// Logs go to stderr; stdout carries the event stream.
fn init_tracing(config: &AppConfig, verbose: bool) {
    let fallback = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
