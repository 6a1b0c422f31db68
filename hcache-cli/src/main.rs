//! hcache - 缓存目录管理工具
//!
//! 对配置文件中声明的缓存执行统计、清空与回收。

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "hcache")]
#[command(about = "Inspect and maintain persistent cache directories")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $HCACHE_CONFIG, ./hcache.toml, ~/.config/hcache/config.toml)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Output JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show disk usage of each cache
    Stats {
        /// Cache names (all configured caches when empty)
        names: Vec<String>,
    },

    /// Remove every entry from the given caches
    Flush {
        /// Cache names
        names: Vec<String>,

        /// Flush all configured caches
        #[arg(long, conflicts_with = "names")]
        all: bool,
    },

    /// Evict least recently accessed entries until each cache fits its disk limit
    Prune {
        /// Cache names (all configured caches when empty)
        names: Vec<String>,
    },
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
        Ok(()) => {
            info!("Command completed successfully");
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Stats { names } => commands::stats(config, &names, cli.json).await,
        Commands::Flush { names, all } => {
            if !all && names.is_empty() {
                anyhow::bail!("name at least one cache or pass --all");
            }
            commands::flush(config, &names, cli.json).await
        }
        Commands::Prune { names } => commands::prune(config, &names, cli.json).await,
    }
}
