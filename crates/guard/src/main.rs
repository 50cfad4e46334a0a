//! SAMGUARD - resilience guard for outbound tool calls

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

mod commands;

use commands::{
    breakers_reset_command, breakers_status_command, errors_command, limits_info_command,
    limits_reset_command, maintenance_command, status_command,
};

/// SAMGUARD - rate limits, retries and circuit breakers in front of tool calls
#[derive(Parser)]
#[command(name = "samguard")]
#[command(about = "◆ Resilience guard for outbound tool calls")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Config file location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show component health, recent errors and circuit state
    Status,
    /// Show error archive statistics
    Errors {
        /// Trailing window in hours
        #[arg(long, default_value_t = 24)]
        hours: u32,
        /// Emit raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and reset rate limit buckets
    Limits {
        #[command(subcommand)]
        command: LimitsCommands,
    },
    /// Inspect and reset circuit breakers
    Breakers {
        #[command(subcommand)]
        command: BreakersCommands,
    },
    /// Purge old errors and compact the archive
    Maintenance {
        /// Retention in days (defaults to the configured retention)
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Subcommand)]
enum LimitsCommands {
    /// Show the bucket for an identifier
    Info {
        /// Wallet, user or session the bucket belongs to
        identifier: String,
        /// Action category
        #[arg(long, default_value = "default")]
        category: String,
    },
    /// Drop the bucket for an identifier
    Reset {
        /// Wallet, user or session the bucket belongs to
        identifier: String,
        /// Action category
        #[arg(long, default_value = "default")]
        category: String,
    },
}

#[derive(Subcommand)]
enum BreakersCommands {
    /// Show circuit snapshots
    Status {
        /// Emit raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Force circuits closed (one by name, or all)
    Reset {
        /// Circuit name; every circuit is reset when omitted
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt().with_env_filter("debug").init();
    } else {
        tracing_subscriber::fmt::init();
    }

    let config = cli.config;
    match cli.command {
        Commands::Status => {
            if let Err(e) = status_command(config).await {
                error!("Status failed: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Errors { hours, json } => {
            if let Err(e) = errors_command(config, hours, json).await {
                error!("Error report failed: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Limits { command } => match command {
            LimitsCommands::Info {
                identifier,
                category,
            } => {
                if let Err(e) = limits_info_command(config, identifier, category).await {
                    error!("Limits info failed: {}", e);
                    std::process::exit(1);
                }
            }
            LimitsCommands::Reset {
                identifier,
                category,
            } => {
                if let Err(e) = limits_reset_command(config, identifier, category).await {
                    error!("Limits reset failed: {}", e);
                    std::process::exit(1);
                }
            }
        },
        Commands::Breakers { command } => match command {
            BreakersCommands::Status { json } => {
                if let Err(e) = breakers_status_command(config, json).await {
                    error!("Breakers status failed: {}", e);
                    std::process::exit(1);
                }
            }
            BreakersCommands::Reset { name } => {
                if let Err(e) = breakers_reset_command(config, name).await {
                    error!("Breakers reset failed: {}", e);
                    std::process::exit(1);
                }
            }
        },
        Commands::Maintenance { days } => {
            if let Err(e) = maintenance_command(config, days).await {
                error!("Maintenance failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}
