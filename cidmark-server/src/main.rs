mod config;
mod server;

use anyhow::Context;
use cidmark_core::{SyncController, SyncPhase, SyncSnapshot};
use clap::{Parser, Subcommand};
use config::Config;
use server::{ServerState, run_server};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "cidmark")]
#[command(about = "Publish a file to a content store and record its pointer in an ownership ledger")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "cidmark.yaml")]
        config: String,
    },
    /// Publish a single file and exit
    Publish {
        #[arg(short, long, default_value = "cidmark.yaml")]
        config: String,

        /// File to publish
        file: PathBuf,

        /// Name recorded with the content (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the current pointer and exit
    Show {
        #[arg(short, long, default_value = "cidmark.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cidmark=info,cidmark_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Err(error) = run(cli).await {
        tracing::error!("{:#}", error);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting Cidmark server with config: {}", config);
            let (cfg, controller) = start_session(&config, true).await?;
            let identity = cfg.identity()?;

            let state = Arc::new(ServerState {
                controller,
                identity,
                config: cfg,
            });
            run_server(state).await.context("server error")?;
        }
        Commands::Publish { config, file, name } => {
            let (cfg, controller) = start_session(&config, false).await?;
            let identity = cfg.identity()?;

            let body = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let name = name.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "upload".to_string())
            });

            let cid = controller.publish(&identity, body, &name).await?;
            println!("{}", cid);
            println!("{}", cfg.link_for(&cid));
        }
        Commands::Show { config } => {
            let (cfg, controller) = start_session(&config, false).await?;
            print_snapshot(&cfg, &controller.snapshot().await);
        }
    }

    Ok(())
}

/// Build the clients from configuration and start the controller for the
/// configured identity. With `tolerate_ledger`, a failed initial pointer load
/// is logged and left for a later reload instead of aborting.
async fn start_session(
    path: &str,
    tolerate_ledger: bool,
) -> anyhow::Result<(Config, Arc<SyncController>)> {
    let cfg = Config::from_file(path).context("failed to load config")?;
    let identity = cfg.identity()?;
    let keyring = Arc::new(cfg.keyring()?);

    let store = cfg.store_builder().build()?;
    let ledger = cfg
        .ledger_builder(keyring)
        .build()
        .await
        .context("failed to connect to ledger")?;

    tracing::info!(
        identity = %identity,
        ledger = ledger.backend_name(),
        "building sync controller"
    );

    let controller = Arc::new(SyncController::new(Arc::new(store), Arc::new(ledger)));
    if let Err(error) = controller.start(identity).await {
        if !tolerate_ledger || controller.phase().await != SyncPhase::Ready {
            return Err(error).context("failed to start sync session");
        }
        tracing::warn!("session ready but pointer not loaded: {}", error);
    }

    Ok((cfg, controller))
}

fn print_snapshot(cfg: &Config, snapshot: &SyncSnapshot) {
    match &snapshot.current_pointer {
        Some(cid) => {
            println!("{}", cid);
            println!("{}", cfg.link_for(cid));
        }
        None => println!("No user file set yet"),
    }
}
