use std::sync::Arc;

use async_trait::async_trait;
use orgreg_storage::{HttpFetcher, WorkDir};

use crate::config::SyncConfig;
use crate::coordination::CoordinationStore;
use crate::error::PipelineError;
use crate::exec_log::ExecutionLog;
use crate::job::{BatchStatus, Continuation, Job, JobContext, JobOutcome};
use crate::queue::JobHandler;
use crate::store::RegistryStore;

/// Stateless executor for every pipeline job. All shared state lives behind the
/// coordination store, the registry store and the working directory.
pub struct Worker {
    pub(crate) config: Arc<SyncConfig>,
    pub(crate) fetcher: HttpFetcher,
    pub(crate) coordination: Arc<dyn CoordinationStore>,
    pub(crate) registry: Arc<dyn RegistryStore>,
    pub(crate) log: Arc<dyn ExecutionLog>,
}

impl Worker {
    pub fn new(
        config: Arc<SyncConfig>,
        fetcher: HttpFetcher,
        coordination: Arc<dyn CoordinationStore>,
        registry: Arc<dyn RegistryStore>,
        log: Arc<dyn ExecutionLog>,
    ) -> Self {
        Self {
            config,
            fetcher,
            coordination,
            registry,
            log,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn layout_for(&self, work_prefix: &str) -> WorkDir {
        WorkDir::new(&self.config.work_dir, work_prefix)
    }
}

#[async_trait]
impl JobHandler for Worker {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<JobOutcome, PipelineError> {
        match job {
            Job::DownloadDataset(job) => self.download_dataset(job, ctx).await,
            Job::FetchChunk(job) => self.fetch_chunk(job, ctx).await,
            Job::SyncFallback(job) => self.sync_fallback(job, ctx).await,
            Job::ImportDataset(job) => self.import_dataset(job, ctx).await,
            Job::ImportRows(job) => self.import_rows(job, ctx).await,
        }
    }

    async fn resume(
        &self,
        continuation: &Continuation,
        batch: &BatchStatus,
        ctx: &JobContext,
    ) -> Result<(), PipelineError> {
        match continuation {
            Continuation::MergeChunks {
                work_prefix,
                csv_filter,
                expected_chunks,
            } => {
                self.merge_chunk_batch(work_prefix, csv_filter, *expected_chunks, ctx)
                    .await
            }
            Continuation::ReportChunkFailure { url } => {
                self.report_chunk_failure(url, batch).await;
                Ok(())
            }
            Continuation::FinishChunkBatch { work_prefix } => {
                self.finish_chunk_batch(work_prefix).await
            }
            Continuation::ImportSucceeded {
                csv_path,
                extract_dir,
            } => self.import_succeeded(csv_path, extract_dir, batch).await,
            Continuation::ReportImportFailure { csv_path } => {
                self.report_import_failure(csv_path, batch).await;
                Ok(())
            }
            Continuation::FinishImport {
                csv_path,
                extract_dir,
            } => self.finish_import(csv_path, extract_dir).await,
        }
    }
}
