//! # Mindlog CLI
//!
//! Operator tooling for the Mindlog sync engine: inspect the durable queue,
//! enqueue a full refresh, cancel a record's work and drive sync passes.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use mindlog_core::{Config, ConfigLoader, TaskState};
use tracing::{error, info};

mod commands;

/// CLI structure
#[derive(Parser, Debug)]
#[command(name = "mindlog")]
#[command(about = "Mindlog - offline-first journal sync")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./mindlog.toml or the user config dir)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Output JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Main commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue counts by state
    Status,

    /// List queued sync tasks
    Tasks {
        /// Only tasks in this state
        #[arg(long, short, value_enum)]
        state: Option<StateArg>,
        /// Maximum rows to show
        #[arg(long, short, default_value_t = 50)]
        limit: usize,
    },

    /// Enqueue a full refresh from the backend
    Pull,

    /// Cancel every outstanding task of a record
    Cancel {
        /// Local id of the record
        local_id: i64,
    },

    /// Delete finished tasks
    Cleanup {
        /// Age threshold; defaults to the configured retention
        #[arg(long)]
        older_than_hours: Option<u64>,
    },

    /// Run the sync engine
    Sync {
        /// Run one pass and exit instead of staying in the foreground
        #[arg(long)]
        once: bool,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Task state filter
#[derive(ValueEnum, Clone, Copy, Debug)]
enum StateArg {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl From<StateArg> for TaskState {
    fn from(s: StateArg) -> Self {
        match s {
            StateArg::Pending => TaskState::Pending,
            StateArg::Running => TaskState::Running,
            StateArg::Completed => TaskState::Completed,
            StateArg::Failed => TaskState::Failed,
            StateArg::Cancelled => TaskState::Cancelled,
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    info!("Running command: {:?}", cli.command);

    match run_command(cli).await {
        Ok(_) => {
            info!("Command completed successfully");
        }
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("{}", commands::format_error(&e));
            std::process::exit(1);
        }
    }
}

fn loader(path: Option<PathBuf>) -> ConfigLoader {
    match path {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    Ok(loader(path).load()?)
}

async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let json = cli.json;
    match cli.command {
        Commands::Status => {
            let config = load_config(cli.config)?;
            commands::queue::show_status(&config, json).await
        }
        Commands::Tasks { state, limit } => {
            let config = load_config(cli.config)?;
            commands::queue::list_tasks(&config, state.map(Into::into), limit, json).await
        }
        Commands::Pull => {
            let config = load_config(cli.config)?;
            commands::queue::enqueue_pull(&config, json).await
        }
        Commands::Cancel { local_id } => {
            let config = load_config(cli.config)?;
            commands::queue::cancel_record(&config, local_id, json).await
        }
        Commands::Cleanup { older_than_hours } => {
            let config = load_config(cli.config)?;
            commands::queue::cleanup(&config, older_than_hours, json).await
        }
        Commands::Sync { once } => {
            let config = load_config(cli.config)?;
            if once {
                commands::sync::run_once(&config, json).await
            } else {
                commands::sync::run_foreground(&config).await
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = load_config(cli.config)?;
                commands::config::show(&config, json)
            }
            ConfigAction::Init { force } => commands::config::init(&loader(cli.config), force),
        },
    }
}
