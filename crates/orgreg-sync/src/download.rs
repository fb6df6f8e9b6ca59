//! Chunked download path: the orchestrator that plans a batch of ranged fetches,
//! the per-chunk fetcher, and the continuations run when the batch finishes.

use std::path::PathBuf;

use orgreg_storage::{ByteRange, WorkDir};
use tracing::{debug, info, warn};

use crate::coordination::{
    clear_chunk_batch_state, read_chunk_batch_state, write_chunk_batch_state, ChunkBatchState,
    LockGuard,
};
use crate::error::PipelineError;
use crate::job::{
    BatchCallbacks, BatchStatus, Continuation, DownloadDatasetJob, FetchChunkJob, ImportDatasetJob,
    Job, JobContext, JobOutcome, PendingBatch, DOWNLOAD_DATASET_BUDGET,
};
use crate::worker::Worker;

fn workdir_lock_key(work_prefix: &str) -> String {
    format!("workdir:{work_prefix}")
}

impl Worker {
    /// Probe the remote archive and fan out one ranged fetch per chunk.
    pub(crate) async fn download_dataset(
        &self,
        job: &DownloadDatasetJob,
        ctx: &JobContext,
    ) -> Result<JobOutcome, PipelineError> {
        let state = read_chunk_batch_state(self.coordination.as_ref(), &job.work_prefix).await?;
        if state == Some(ChunkBatchState::InFlight) {
            self.log
                .notice(&format!(
                    "chunked download for {} already in flight; not starting another",
                    job.work_prefix
                ))
                .await;
            return Ok(JobOutcome::Skipped);
        }

        let Some(lock) = LockGuard::acquire(
            &self.coordination,
            &workdir_lock_key(&job.work_prefix),
            DOWNLOAD_DATASET_BUDGET,
        )
        .await?
        else {
            self.log
                .notice(&format!(
                    "working directory {} is locked by another download",
                    job.work_prefix
                ))
                .await;
            return Ok(JobOutcome::Skipped);
        };

        let result = self.plan_chunk_batch(job, ctx).await;
        lock.release().await;
        result
    }

    async fn plan_chunk_batch(
        &self,
        job: &DownloadDatasetJob,
        ctx: &JobContext,
    ) -> Result<JobOutcome, PipelineError> {
        let layout = self.layout_for(&job.work_prefix);
        layout.clean_chunk_artifacts().await?;
        clear_chunk_batch_state(self.coordination.as_ref(), &job.work_prefix).await?;

        let probe = match self.fetcher.probe(&job.url).await {
            Ok(probe) => probe,
            Err(err) => {
                warn!(url = %job.url, error = %err, "range probe failed");
                self.log
                    .notice(&format!(
                        "probe of {} failed ({err}); leaving the download to the single-stream path",
                        job.url
                    ))
                    .await;
                return Ok(JobOutcome::Skipped);
            }
        };
        let Some(total_bytes) = probe.ranged_size() else {
            self.log
                .notice(&format!(
                    "{} does not report a size with byte-range support (status {}); leaving the download to the single-stream path",
                    job.url, probe.status
                ))
                .await;
            return Ok(JobOutcome::Skipped);
        };

        let ranges = ByteRange::split(total_bytes, self.config.chunk_size_bytes);
        let expected_chunks = ranges.len() as u64;
        let jobs = ranges
            .into_iter()
            .enumerate()
            .map(|(index, range)| {
                Job::FetchChunk(FetchChunkJob {
                    url: job.url.clone(),
                    index: index as u64,
                    range,
                    csv_filter: job.csv_filter.clone(),
                    work_prefix: job.work_prefix.clone(),
                })
            })
            .collect();
        let batch = PendingBatch {
            name: format!("download {}", job.work_prefix),
            jobs,
            callbacks: BatchCallbacks {
                then: vec![Continuation::MergeChunks {
                    work_prefix: job.work_prefix.clone(),
                    csv_filter: job.csv_filter.clone(),
                    expected_chunks,
                }],
                catch: vec![Continuation::ReportChunkFailure {
                    url: job.url.clone(),
                }],
                finally: vec![Continuation::FinishChunkBatch {
                    work_prefix: job.work_prefix.clone(),
                }],
            },
        };

        write_chunk_batch_state(
            self.coordination.as_ref(),
            &job.work_prefix,
            ChunkBatchState::InFlight,
        )
        .await?;
        match ctx.queue.dispatch_batch(batch).await {
            Ok(batch_id) => {
                info!(%batch_id, chunks = expected_chunks, total_bytes, "dispatched chunk batch");
                self.log
                    .notice(&format!(
                        "downloading {total_bytes} bytes of {} in {expected_chunks} chunks (batch {batch_id})",
                        job.url
                    ))
                    .await;
                Ok(JobOutcome::Completed)
            }
            Err(err) => {
                self.log
                    .error(&format!("dispatching chunk batch for {} failed: {err}", job.url))
                    .await;
                if let Err(cleanup) = layout.clean_chunk_artifacts().await {
                    warn!(error = %cleanup, "artifact cleanup after failed dispatch failed");
                }
                clear_chunk_batch_state(self.coordination.as_ref(), &job.work_prefix).await?;
                Err(err)
            }
        }
    }

    /// Download one byte range into its chunk file.
    pub(crate) async fn fetch_chunk(
        &self,
        job: &FetchChunkJob,
        ctx: &JobContext,
    ) -> Result<JobOutcome, PipelineError> {
        if ctx.batch_cancelled().await? {
            debug!(index = job.index, "chunk batch cancelled; skipping");
            return Ok(JobOutcome::Skipped);
        }

        let layout = self.layout_for(&job.work_prefix);
        if let Some(csv) = layout.find_csv(&job.csv_filter).await? {
            self.log
                .notice(&format!(
                    "{} already extracted; cancelling chunk batch",
                    csv.display()
                ))
                .await;
            ctx.cancel_batch().await?;
            return Ok(JobOutcome::Skipped);
        }

        let dest = layout.chunk_path(job.index);
        match self.fetcher.fetch_range_to_file(&job.url, job.range, &dest).await {
            Ok(written) => {
                if !tokio::fs::try_exists(&dest).await.unwrap_or(false) {
                    return Err(PipelineError::integrity(format!(
                        "chunk {} reported {written} bytes but {} is missing",
                        job.index,
                        dest.display()
                    )));
                }
                debug!(index = job.index, range = %job.range, written, "chunk downloaded");
                Ok(JobOutcome::Completed)
            }
            Err(err) => {
                self.log
                    .error(&format!(
                        "chunk {} (bytes {}) of {} failed: {err}",
                        job.index, job.range, job.url
                    ))
                    .await;
                Err(err.into())
            }
        }
    }

    /// Runs in the worker that finishes a successful chunk batch.
    pub(crate) async fn merge_chunk_batch(
        &self,
        work_prefix: &str,
        csv_filter: &str,
        expected_chunks: u64,
        ctx: &JobContext,
    ) -> Result<(), PipelineError> {
        let layout = self.layout_for(work_prefix);
        let indices = layout.chunk_indices().await?;
        if !indices.iter().copied().eq(0..expected_chunks) {
            let missing = (0..expected_chunks).find(|index| indices.binary_search(index).is_err());
            self.log
                .error(&format!(
                    "expected chunk files 0..{expected_chunks} in {}, found {} (first missing: {}); not merging",
                    layout.chunk_dir().display(),
                    indices.len(),
                    missing.map_or_else(|| "none".to_string(), |index| index.to_string())
                ))
                .await;
            return Ok(());
        }

        let csv_path = self.merge_and_extract(&layout, csv_filter).await?;
        write_chunk_batch_state(self.coordination.as_ref(), work_prefix, ChunkBatchState::Merged)
            .await?;
        self.log
            .completed(&format!(
                "assembled {expected_chunks} chunks into {}",
                csv_path.display()
            ))
            .await;
        self.dispatch_import(&layout, csv_path, ctx).await
    }

    pub(crate) async fn report_chunk_failure(&self, url: &str, batch: &BatchStatus) {
        self.log
            .error(&format!(
                "chunked download of {url} failed at {}% ({} of {} chunks failed)",
                batch.progress(),
                batch.failed_jobs,
                batch.total_jobs
            ))
            .await;
    }

    /// Always-run cleanup of a chunk batch.
    pub(crate) async fn finish_chunk_batch(&self, work_prefix: &str) -> Result<(), PipelineError> {
        let layout = self.layout_for(work_prefix);
        let cleaned = layout.clean_chunk_artifacts().await;

        let state = read_chunk_batch_state(self.coordination.as_ref(), work_prefix).await?;
        if state != Some(ChunkBatchState::Merged) {
            write_chunk_batch_state(
                self.coordination.as_ref(),
                work_prefix,
                ChunkBatchState::Completed,
            )
            .await?;
        }
        cleaned?;
        Ok(())
    }

    pub(crate) async fn dispatch_import(
        &self,
        layout: &WorkDir,
        csv_path: PathBuf,
        ctx: &JobContext,
    ) -> Result<(), PipelineError> {
        ctx.queue
            .dispatch(Job::ImportDataset(ImportDatasetJob {
                csv_path,
                extract_dir: layout.extract_dir(),
            }))
            .await
    }
}
