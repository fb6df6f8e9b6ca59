use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orgreg_sync::{Pipeline, SyncConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "orgreg-cli")]
#[command(about = "Organization registry mirror")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download the dataset (chunked, with single-stream fallback) and import it.
    Refresh,
    /// Chunked download only; the import still follows a successful merge.
    Download,
    /// Import an extracted csv into the registry tables.
    Import {
        /// Csv to import; defaults to the one extracted under the working directory.
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Apply database migrations.
    Migrate,
    /// Run the refresh on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Refresh) {
        Commands::Refresh => {
            let summary = orgreg_sync::run_refresh_once_from_env().await?;
            println!(
                "refresh complete: entries={} settings={} elapsed={}s",
                summary.entries,
                summary.settings,
                (summary.finished_at - summary.started_at).num_seconds()
            );
        }
        Commands::Download => {
            let pipeline = Pipeline::connect(SyncConfig::from_env()?).await?;
            pipeline.enqueue_download().await.context("enqueueing download")?;
            pipeline.wait_idle().await;
            let counts = pipeline.counts().await?;
            println!(
                "download complete: entries={} settings={}",
                counts.entries, counts.settings
            );
        }
        Commands::Import { csv } => {
            let pipeline = Pipeline::connect(SyncConfig::from_env()?).await?;
            let csv = pipeline.enqueue_import(csv).await?;
            pipeline.wait_idle().await;
            let counts = pipeline.counts().await?;
            println!(
                "import of {} complete: entries={} settings={}",
                csv.display(),
                counts.entries,
                counts.settings
            );
        }
        Commands::Migrate => {
            let pool = orgreg_sync::connect_pool(&SyncConfig::from_env()?.database_url).await?;
            orgreg_sync::migrate(&pool).await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..SyncConfig::from_env()?
            };
            let cron = config.refresh_cron.clone();
            let pipeline = Pipeline::connect(config).await?;
            let mut sched = pipeline
                .maybe_build_scheduler()
                .await?
                .context("scheduler disabled")?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            pipeline.wait_idle().await;
        }
    }

    Ok(())
}
