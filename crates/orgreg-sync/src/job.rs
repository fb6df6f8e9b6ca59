//! Serializable job payloads, batch continuations and the context a job runs in.
//!
//! Everything here is plain data: a job or continuation can be persisted by any
//! queue backend and resumed by a different worker process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use orgreg_core::{ColumnMap, RowRange};
use orgreg_storage::ByteRange;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::queue::JobQueue;

pub const DOWNLOAD_DATASET_BUDGET: Duration = Duration::from_secs(120);
pub const FETCH_CHUNK_BUDGET: Duration = Duration::from_secs(300);
pub const SYNC_FALLBACK_BUDGET: Duration = Duration::from_secs(1_800);
pub const IMPORT_DATASET_BUDGET: Duration = Duration::from_secs(300);
pub const IMPORT_ROWS_BUDGET: Duration = Duration::from_secs(900);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDatasetJob {
    pub url: String,
    pub csv_filter: String,
    pub work_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchChunkJob {
    pub url: String,
    pub index: u64,
    pub range: ByteRange,
    pub csv_filter: String,
    pub work_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFallbackJob {
    pub url: String,
    pub csv_filter: String,
    pub work_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportDatasetJob {
    pub csv_path: PathBuf,
    pub extract_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRowsJob {
    pub csv_path: PathBuf,
    pub range: RowRange,
    pub columns: ColumnMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    DownloadDataset(DownloadDatasetJob),
    FetchChunk(FetchChunkJob),
    SyncFallback(SyncFallbackJob),
    ImportDataset(ImportDatasetJob),
    ImportRows(ImportRowsJob),
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::DownloadDataset(_) => "download_dataset",
            Job::FetchChunk(_) => "fetch_chunk",
            Job::SyncFallback(_) => "sync_fallback",
            Job::ImportDataset(_) => "import_dataset",
            Job::ImportRows(_) => "import_rows",
        }
    }

    /// Wall-clock budget for one attempt.
    pub fn timeout(&self) -> Duration {
        match self {
            Job::DownloadDataset(_) => DOWNLOAD_DATASET_BUDGET,
            Job::FetchChunk(_) => FETCH_CHUNK_BUDGET,
            Job::SyncFallback(_) => SYNC_FALLBACK_BUDGET,
            Job::ImportDataset(_) => IMPORT_DATASET_BUDGET,
            Job::ImportRows(_) => IMPORT_ROWS_BUDGET,
        }
    }

    /// No job is terminally failed by a timeout alone; the retry policy decides.
    pub fn fail_on_timeout(&self) -> bool {
        false
    }
}

/// Follow-up work run by whichever worker finishes a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Continuation {
    MergeChunks {
        work_prefix: String,
        csv_filter: String,
        expected_chunks: u64,
    },
    ReportChunkFailure {
        url: String,
    },
    FinishChunkBatch {
        work_prefix: String,
    },
    ImportSucceeded {
        csv_path: PathBuf,
        extract_dir: PathBuf,
    },
    ReportImportFailure {
        csv_path: PathBuf,
    },
    FinishImport {
        csv_path: PathBuf,
        extract_dir: PathBuf,
    },
}

impl Continuation {
    pub fn name(&self) -> &'static str {
        match self {
            Continuation::MergeChunks { .. } => "merge_chunks",
            Continuation::ReportChunkFailure { .. } => "report_chunk_failure",
            Continuation::FinishChunkBatch { .. } => "finish_chunk_batch",
            Continuation::ImportSucceeded { .. } => "import_succeeded",
            Continuation::ReportImportFailure { .. } => "report_import_failure",
            Continuation::FinishImport { .. } => "finish_import",
        }
    }
}

/// `then` runs when every job succeeded and the batch was not cancelled, `catch`
/// when any job failed for good, `finally` always.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCallbacks {
    pub then: Vec<Continuation>,
    pub catch: Vec<Continuation>,
    pub finally: Vec<Continuation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBatch {
    pub name: String,
    pub jobs: Vec<Job>,
    pub callbacks: BatchCallbacks,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub id: BatchId,
    pub name: String,
    pub total_jobs: usize,
    pub pending_jobs: usize,
    pub failed_jobs: usize,
    pub cancelled: bool,
    pub finished: bool,
}

impl BatchStatus {
    /// Share of jobs that have finished, in percent.
    pub fn progress(&self) -> u8 {
        if self.total_jobs == 0 {
            return 100;
        }
        let done = self.total_jobs - self.pending_jobs;
        ((done * 100) / self.total_jobs) as u8
    }

    pub fn has_failures(&self) -> bool {
        self.failed_jobs > 0
    }
}

/// What a job asks the queue to do after it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Skipped,
    /// Put the job back on the queue and run it again after `delay`.
    Released { delay: Duration },
}

/// Runtime handle passed to a running job.
#[derive(Clone)]
pub struct JobContext {
    pub queue: Arc<dyn JobQueue>,
    pub batch_id: Option<BatchId>,
    pub attempt: u32,
}

impl JobContext {
    pub async fn batch_cancelled(&self) -> Result<bool, PipelineError> {
        let Some(id) = self.batch_id else {
            return Ok(false);
        };
        Ok(self
            .queue
            .batch_status(id)
            .await?
            .is_some_and(|status| status.cancelled))
    }

    pub async fn cancel_batch(&self) -> Result<(), PipelineError> {
        match self.batch_id {
            Some(id) => self.queue.cancel_batch(id).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_serialize_as_tagged_plain_data() {
        let job = Job::FetchChunk(FetchChunkJob {
            url: "https://example.test/registry.zip".into(),
            index: 10,
            range: ByteRange { start: 30, end: 32 },
            csv_filter: "schema_v2".into(),
            work_prefix: "registry".into(),
        });
        let json = serde_json::to_value(&job).expect("serialize");
        assert_eq!(json["type"], "fetch_chunk");
        assert_eq!(json["range"]["start"], 30);
        let back: Job = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, job);
    }

    #[test]
    fn progress_counts_finished_jobs() {
        let status = BatchStatus {
            id: BatchId::new(),
            name: "chunks".into(),
            total_jobs: 8,
            pending_jobs: 6,
            failed_jobs: 1,
            cancelled: true,
            finished: false,
        };
        assert_eq!(status.progress(), 25);
        assert!(status.has_failures());
    }

    #[test]
    fn network_jobs_are_not_fatal_on_timeout() {
        let job = Job::SyncFallback(SyncFallbackJob {
            url: "https://example.test/registry.zip".into(),
            csv_filter: "csv".into(),
            work_prefix: "registry".into(),
        });
        assert!(!job.fail_on_timeout());
        assert_eq!(job.timeout(), SYNC_FALLBACK_BUDGET);
    }
}
