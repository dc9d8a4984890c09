use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepchain_core::config::AppConfig;
use stepchain_engine::RunLifecycle;

#[derive(Parser)]
#[command(name = "stepchain", version, about = "Chained, time-boxed step runner with a kill switch")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepchain.toml", env = "STEPCHAIN_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway (default)
    Serve {
        /// Override `[gateway] bind`
        #[arg(long)]
        bind: Option<String>,
    },
    /// Show current configuration
    Config,
    /// List recent runs from the store
    Runs {
        #[arg(long)]
        limit: Option<String>,
        /// chained, sequential, or race
        #[arg(long)]
        scenario: Option<String>,
    },
    /// Show one run with all of its steps
    Status {
        run_id: String,
    },
    /// Fail a run and all of its unfinished steps
    Kill {
        run_id: String,
        /// Reason recorded on the run
        #[arg(long, short)]
        message: Option<String>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stepchain=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "stepchain", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = load_config(&cli.config)?;

    match cli.command {
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Some(Commands::Runs { limit, scenario }) => {
            let lifecycle = open_lifecycle(&config)?;
            let runs = lifecycle
                .list_runs(limit.as_deref(), scenario.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
        }
        Some(Commands::Status { run_id }) => {
            let lifecycle = open_lifecycle(&config)?;
            let run = lifecycle.get_status(Some(&run_id)).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Some(Commands::Kill { run_id, message }) => {
            let lifecycle = open_lifecycle(&config)?;
            let run = lifecycle.kill(&run_id, message.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Some(Commands::Completions { .. }) => unreachable!("handled before config load"),
        Some(Commands::Serve { bind }) => {
            if let Some(bind) = bind {
                config.gateway.bind = bind;
            }
            serve(config).await?;
        }
        None => serve(config).await?,
    }

    Ok(())
}

/// Explicit path first, then `~/.stepchain/config.toml`, then defaults.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    let home_config = dirs_home().map(|h| h.join(".stepchain").join("config.toml"));
    match home_config {
        Some(ref home) if home.exists() => {
            info!(path = %home.display(), "Loading config from home directory");
            Ok(AppConfig::load(home)?)
        }
        _ => {
            info!(path = %path.display(), "No config file found, using defaults");
            let config = AppConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn open_lifecycle(config: &AppConfig) -> anyhow::Result<RunLifecycle> {
    if config.store_path().is_none() {
        warn!("In-memory store selected; a separate process sees no runs");
    }
    let store = stepchain_store::open_store(config)?;
    Ok(RunLifecycle::new(store, config.runs.clone()))
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let store = stepchain_store::open_store(&config)?;
    info!(
        bind = %config.gateway.bind,
        steps = config.runs.total_steps,
        "Starting stepchain gateway"
    );
    let server = stepchain_gateway::GatewayServer::new(config, store);

    let cancel = tokio_util::sync::CancellationToken::new();
    let cancel_clone = cancel.clone();

    // Graceful shutdown on Ctrl-C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down gateway...");
        cancel_clone.cancel();
    });

    server.run(cancel).await
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
