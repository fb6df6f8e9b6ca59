use std::path::PathBuf;

use orgreg_storage::{extract_archive, WorkDir};
use tracing::{info, warn};

use crate::coordination::{read_chunk_batch_state, ChunkBatchState, LockGuard};
use crate::error::PipelineError;
use crate::job::{JobContext, JobOutcome, SyncFallbackJob, SYNC_FALLBACK_BUDGET};
use crate::worker::Worker;

impl Worker {
    /// Whole-archive download used when ranges are unsupported or the chunk path fails.
    pub(crate) async fn sync_fallback(
        &self,
        job: &SyncFallbackJob,
        ctx: &JobContext,
    ) -> Result<JobOutcome, PipelineError> {
        let layout = self.layout_for(&job.work_prefix);
        if let Some(csv) = layout.find_csv(&job.csv_filter).await? {
            self.log
                .notice(&format!(
                    "{} already extracted; skipping single-stream download",
                    csv.display()
                ))
                .await;
            return Ok(JobOutcome::Skipped);
        }

        match read_chunk_batch_state(self.coordination.as_ref(), &job.work_prefix).await? {
            Some(ChunkBatchState::InFlight) if ctx.attempt <= self.config.fallback_max_defers => {
                let delay = self.config.fallback_defer_delay();
                info!(attempt = ctx.attempt, ?delay, "chunk batch in flight; deferring fallback");
                return Ok(JobOutcome::Released { delay });
            }
            Some(ChunkBatchState::Merged) => {
                self.log
                    .notice("chunked download already delivered the dataset; skipping single-stream download")
                    .await;
                return Ok(JobOutcome::Skipped);
            }
            _ => {}
        }

        let zip_path = layout.fallback_zip_path();
        let Some(lock) = LockGuard::acquire(
            &self.coordination,
            &format!("fallback:{}", zip_path.display()),
            SYNC_FALLBACK_BUDGET,
        )
        .await?
        else {
            self.log
                .notice(&format!(
                    "{} is being downloaded by another worker",
                    zip_path.display()
                ))
                .await;
            return Ok(JobOutcome::Skipped);
        };
        let result = self.download_whole_archive(job, &layout).await;
        lock.release().await;

        let csv_path = result?;
        self.log
            .completed(&format!(
                "downloaded {} in one stream and extracted {}",
                job.url,
                csv_path.display()
            ))
            .await;
        self.dispatch_import(&layout, csv_path, ctx).await?;
        Ok(JobOutcome::Completed)
    }

    async fn download_whole_archive(
        &self,
        job: &SyncFallbackJob,
        layout: &WorkDir,
    ) -> Result<PathBuf, PipelineError> {
        let result = self.fetch_and_extract(job, layout).await;
        if let Err(err) = &result {
            self.log
                .error(&format!("single-stream download of {} failed: {err}", job.url))
                .await;
            for cleanup in [layout.remove_fallback_zip().await, layout.remove_extracted().await] {
                if let Err(cleanup) = cleanup {
                    warn!(error = %cleanup, "artifact cleanup failed");
                }
            }
        }
        result
    }

    async fn fetch_and_extract(
        &self,
        job: &SyncFallbackJob,
        layout: &WorkDir,
    ) -> Result<PathBuf, PipelineError> {
        let zip_path = layout.fallback_zip_path();
        layout.remove_fallback_zip().await?;
        layout.remove_extracted().await?;

        let bytes = self.fetcher.fetch_to_file(&job.url, &zip_path).await?;
        if !tokio::fs::try_exists(&zip_path).await.unwrap_or(false) {
            return Err(PipelineError::integrity(format!(
                "{} missing after download",
                zip_path.display()
            )));
        }
        info!(bytes, path = %zip_path.display(), "downloaded whole archive");

        extract_archive(&zip_path, &layout.extract_dir()).await?;
        let csv_path = layout.find_csv(&job.csv_filter).await?.ok_or_else(|| {
            PipelineError::integrity(format!(
                "no csv matching {:?} in {}",
                job.csv_filter,
                layout.extract_dir().display()
            ))
        })?;
        layout.remove_fallback_zip().await?;
        Ok(csv_path)
    }
}
