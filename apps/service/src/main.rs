use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use modelwatch::Config;
use modelwatch::Orchestrator;
use modelwatch::pool::open_pool;

/// Headless prober: elects a leader, probes due targets, records history
#[derive(Parser, Debug)]
#[command(name = "modelwatch-service")]
#[command(version, about, long_about = None)]
#[command(after_help = r#"ENVIRONMENT VARIABLES:
    MODELWATCH_POLL_INTERVAL_SECONDS             Global interval (15-600, default 60)
    MODELWATCH_MAX_CONCURRENCY                   Concurrent probes (1-20, default 5)
    MODELWATCH_HISTORY_RETENTION_DAYS            Retention (7-365, default 30)
    MODELWATCH_OFFICIAL_STATUS_INTERVAL_SECONDS  Status feed interval (60-3600, default 300)
    MODELWATCH_NODE_ID                           Lease owner id (default node-<uuid>)
    MODELWATCH_DATABASE_PATH                     SQLite file (default modelwatch.db)
    MODELWATCH_HISTORY_WINDOW                    Outcomes per target in snapshots (1-500, default 60)
    MODELWATCH_OFFICIAL_STATUS_ENABLED           Poll vendor status pages (default true)
    MODELWATCH_BIND                              Server listen address (default 0.0.0.0:8080)
    RUST_LOG / RUST_LOG_FORMAT                   Log filter / "json" output
"#)]
struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/modelwatch/config.toml)
    #[arg(short, long, env = "MODELWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler until interrupted (default)
    Run,
    /// Run one leader-gated batch and print the outcomes
    Check,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Config => {
            println!("{config}");
            Ok(())
        }
        Commands::Check => check(config).await,
        Commands::Run => {
            info!("{}", config);
            let pool = open_pool(&config.database.path, config.database.max_connections).await?;
            Orchestrator::start(config, pool).await
        }
    }
}

async fn check(config: Config) -> Result<()> {
    let pool = open_pool(&config.database.path, config.database.max_connections).await?;
    let mut orchestrator = Orchestrator::new(config, pool).await?;

    let Some(outcomes) = orchestrator.check_once().await else {
        println!("Another instance holds the scheduler lease; nothing checked.");
        orchestrator.shutdown().await;
        return Ok(());
    };

    for outcome in &outcomes {
        let latency = outcome.latency_ms.map(|ms| format!("{ms} ms")).unwrap_or_else(|| "-".into());
        println!(
            "{:<24} {:<10} {:<18} {:>9}  {}",
            outcome.name, outcome.vendor, outcome.status, latency, outcome.message
        );
    }
    println!("{} target(s) checked", outcomes.len());

    orchestrator.shutdown().await;
    Ok(())
}
