//! Download, reassembly and incremental import of the organization registry dataset.

pub mod config;
pub mod coordination;
mod download;
pub mod error;
pub mod exec_log;
mod fallback;
mod import;
pub mod job;
mod merge;
pub mod queue;
pub mod store;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use orgreg_storage::HttpFetcher;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{error, info};

pub use config::{load_column_map, SyncConfig};
pub use coordination::{
    ChunkBatchState, CoordinationStore, LockToken, MemoryCoordinationStore, PgCoordinationStore,
};
pub use error::PipelineError;
pub use exec_log::{ExecutionLog, FileExecutionLog, LogLevel, MemoryExecutionLog, TracingExecutionLog};
pub use import::read_row_range;
pub use job::{
    BatchCallbacks, BatchId, BatchStatus, Continuation, DownloadDatasetJob, FetchChunkJob,
    ImportDatasetJob, ImportRowsJob, Job, JobContext, JobOutcome, PendingBatch, SyncFallbackJob,
};
pub use queue::{JobHandler, JobQueue, LocalQueue, QueuePolicy};
pub use store::{
    connect_pool, migrate, MemoryRegistryStore, PgRegistryStore, ReconcileStats, RegistryCounts,
    RegistryStore,
};
pub use worker::Worker;

pub const CRATE_NAME: &str = "orgreg-sync";

#[derive(Debug, Clone)]
pub struct RefreshSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entries: u64,
    pub settings: u64,
}

/// A worker plus the in-process queue that feeds it.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<SyncConfig>,
    queue: LocalQueue,
    registry: Arc<dyn RegistryStore>,
}

impl Pipeline {
    /// Postgres-backed coordination and registry stores from `config.database_url`.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let pool = connect_pool(&config.database_url).await?;
        let log: Arc<dyn ExecutionLog> = match &config.execution_log_path {
            Some(path) => Arc::new(FileExecutionLog::new(path)),
            None => Arc::new(TracingExecutionLog),
        };
        Self::with_parts(
            config,
            Arc::new(PgCoordinationStore::new(pool.clone())),
            Arc::new(PgRegistryStore::new(pool)),
            log,
        )
    }

    pub fn with_parts(
        config: SyncConfig,
        coordination: Arc<dyn CoordinationStore>,
        registry: Arc<dyn RegistryStore>,
        log: Arc<dyn ExecutionLog>,
    ) -> Result<Self> {
        config.validate()?;
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        let policy = config.queue_policy();
        let config = Arc::new(config);
        let worker = Worker::new(config.clone(), fetcher, coordination, registry.clone(), log);
        let queue = LocalQueue::new(Arc::new(worker), policy);
        Ok(Self {
            config,
            queue,
            registry,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &LocalQueue {
        &self.queue
    }

    fn download_job(&self) -> DownloadDatasetJob {
        DownloadDatasetJob {
            url: self.config.dataset_url.clone(),
            csv_filter: self.config.csv_filter.clone(),
            work_prefix: self.config.work_prefix.clone(),
        }
    }

    fn fallback_job(&self) -> SyncFallbackJob {
        SyncFallbackJob {
            url: self.config.dataset_url.clone(),
            csv_filter: self.config.csv_filter.clone(),
            work_prefix: self.config.work_prefix.clone(),
        }
    }

    /// Chunked download only.
    pub async fn enqueue_download(&self) -> Result<(), PipelineError> {
        self.queue.dispatch(Job::DownloadDataset(self.download_job())).await
    }

    /// Chunked download plus a delayed single-stream companion.
    pub async fn enqueue_refresh(&self) -> Result<(), PipelineError> {
        self.enqueue_download().await?;
        self.queue
            .dispatch_after(
                Job::SyncFallback(self.fallback_job()),
                self.config.fallback_defer_delay(),
            )
            .await
    }

    /// Import `csv_path`, or the csv already extracted under the working directory.
    pub async fn enqueue_import(&self, csv_path: Option<PathBuf>) -> Result<PathBuf> {
        let layout = self.config.layout();
        let csv_path = match csv_path {
            Some(path) => path,
            None => layout
                .find_csv(&self.config.csv_filter)
                .await?
                .ok_or_else(|| {
                    anyhow!(
                        "no csv matching {:?} under {}",
                        self.config.csv_filter,
                        layout.extract_dir().display()
                    )
                })?,
        };
        // The import removes its csv and extract directory when done, so a file from
        // outside the working directory is imported from a private copy.
        let extract_dir = layout.extract_dir();
        let csv_path = if csv_path.starts_with(&extract_dir) {
            csv_path
        } else {
            let file_name = csv_path
                .file_name()
                .ok_or_else(|| anyhow!("{} is not a file", csv_path.display()))?;
            let copy = extract_dir.join(file_name);
            tokio::fs::create_dir_all(&extract_dir)
                .await
                .with_context(|| format!("creating {}", extract_dir.display()))?;
            tokio::fs::copy(&csv_path, &copy)
                .await
                .with_context(|| format!("copying {} into {}", csv_path.display(), extract_dir.display()))?;
            copy
        };
        self.queue
            .dispatch(Job::ImportDataset(ImportDatasetJob {
                csv_path: csv_path.clone(),
                extract_dir,
            }))
            .await?;
        Ok(csv_path)
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    pub async fn counts(&self) -> Result<RegistryCounts, PipelineError> {
        self.registry.counts().await
    }

    /// Enqueue a refresh and wait until every job it spawned has finished.
    pub async fn run_refresh_once(&self) -> Result<RefreshSummary> {
        let started_at = Utc::now();
        self.enqueue_refresh().await.context("enqueueing refresh")?;
        self.wait_idle().await;
        let counts = self.counts().await.context("reading registry counts")?;
        Ok(RefreshSummary {
            started_at,
            finished_at: Utc::now(),
            entries: counts.entries,
            settings: counts.settings,
        })
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.refresh_cron.clone();
        let pipeline = self.clone();
        let job = CronJob::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                info!("scheduled registry refresh triggered");
                if let Err(err) = pipeline.enqueue_refresh().await {
                    error!(error = %err, "failed to enqueue scheduled refresh");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_refresh_once_from_env() -> Result<RefreshSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = Pipeline::connect(config).await?;
    pipeline.run_refresh_once().await
}
