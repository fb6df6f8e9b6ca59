//! Partitioned import: row counting and fan-out, and the per-range staging reconcile.

use std::path::{Path, PathBuf};
use std::time::Duration;

use orgreg_core::{ColumnMap, RowRange, StagingRow};
use orgreg_storage::{count_data_rows, ArtifactError};
use tracing::{debug, info, warn};

use crate::coordination::LockGuard;
use crate::error::PipelineError;
use crate::job::{
    BatchCallbacks, BatchStatus, Continuation, ImportDatasetJob, ImportRowsJob, Job,
    JobContext, JobOutcome, PendingBatch, IMPORT_ROWS_BUDGET,
};
use crate::store::{staging_table_name, with_staging};
use crate::worker::Worker;

/// Delay before retrying a row range whose staging table is locked by another attempt.
const STAGING_BUSY_DELAY: Duration = Duration::from_secs(30);
/// Outlasts the staging lock's TTL, after which a busy range counts as failed.
const STAGING_BUSY_MAX_ATTEMPTS: u32 = 40;

impl Worker {
    /// Count the csv rows and dispatch one importer per fixed-size row range.
    pub(crate) async fn import_dataset(
        &self,
        job: &ImportDatasetJob,
        ctx: &JobContext,
    ) -> Result<JobOutcome, PipelineError> {
        if !tokio::fs::try_exists(&job.extract_dir).await.unwrap_or(false) {
            return Err(PipelineError::integrity(format!(
                "extract directory {} does not exist",
                job.extract_dir.display()
            )));
        }
        if !tokio::fs::try_exists(&job.csv_path).await.unwrap_or(false) {
            return Err(PipelineError::integrity(format!(
                "csv {} does not exist",
                job.csv_path.display()
            )));
        }

        let total_rows = count_data_rows(&job.csv_path).await?;
        if total_rows == 0 {
            return Err(PipelineError::integrity(format!(
                "csv {} has no data rows",
                job.csv_path.display()
            )));
        }

        let ranges = RowRange::partition(total_rows, self.config.import_batch_rows);
        let range_count = ranges.len();
        let jobs = ranges
            .into_iter()
            .map(|range| {
                Job::ImportRows(ImportRowsJob {
                    csv_path: job.csv_path.clone(),
                    range,
                    columns: self.config.columns.clone(),
                })
            })
            .collect();
        let batch = PendingBatch {
            name: format!("import {}", job.csv_path.display()),
            jobs,
            callbacks: BatchCallbacks {
                then: vec![Continuation::ImportSucceeded {
                    csv_path: job.csv_path.clone(),
                    extract_dir: job.extract_dir.clone(),
                }],
                catch: vec![Continuation::ReportImportFailure {
                    csv_path: job.csv_path.clone(),
                }],
                finally: vec![Continuation::FinishImport {
                    csv_path: job.csv_path.clone(),
                    extract_dir: job.extract_dir.clone(),
                }],
            },
        };

        let batch_id = ctx.queue.dispatch_batch(batch).await?;
        self.log
            .notice(&format!(
                "importing {total_rows} rows from {} in {range_count} ranges (batch {batch_id})",
                job.csv_path.display()
            ))
            .await;
        Ok(JobOutcome::Completed)
    }

    /// Parse one row range into a private staging table and reconcile it.
    pub(crate) async fn import_rows(
        &self,
        job: &ImportRowsJob,
        ctx: &JobContext,
    ) -> Result<JobOutcome, PipelineError> {
        let staging = staging_table_name(ctx.batch_id.unwrap_or_default(), job.range);
        if ctx.batch_cancelled().await? {
            debug!(range = %job.range, "import batch cancelled; skipping range");
            // An earlier attempt of this range may have been abandoned mid-import.
            self.registry.drop_staging(&staging).await?;
            return Ok(JobOutcome::Skipped);
        }

        let Some(lock) = LockGuard::acquire(
            &self.coordination,
            &format!("staging:{staging}"),
            IMPORT_ROWS_BUDGET,
        )
        .await?
        else {
            if ctx.attempt >= STAGING_BUSY_MAX_ATTEMPTS {
                return Err(PipelineError::Staging(format!(
                    "{staging} still locked after {} attempts",
                    ctx.attempt
                )));
            }
            debug!(%staging, attempt = ctx.attempt, "staging table busy; releasing");
            return Ok(JobOutcome::Released {
                delay: STAGING_BUSY_DELAY,
            });
        };

        let registry = &self.registry;
        let result = with_staging(registry, &staging, || async {
            let rows = read_row_range(&job.csv_path, job.range, &job.columns).await?;
            registry.insert_staging(&staging, &rows).await?;
            registry.reconcile_staging(&staging).await
        })
        .await;
        lock.release().await;

        match result {
            Ok(stats) => {
                info!(
                    range = %job.range,
                    entries_changed = stats.entries_changed,
                    settings_pruned = stats.settings_pruned,
                    settings_changed = stats.settings_changed,
                    "row range reconciled"
                );
                Ok(JobOutcome::Completed)
            }
            Err(err) => {
                self.log
                    .error(&format!(
                        "import of rows {} from {} failed: {err}",
                        job.range,
                        job.csv_path.display()
                    ))
                    .await;
                Err(err)
            }
        }
    }

    pub(crate) async fn import_succeeded(
        &self,
        csv_path: &Path,
        extract_dir: &Path,
        batch: &BatchStatus,
    ) -> Result<(), PipelineError> {
        remove_import_artifacts(csv_path, extract_dir).await?;
        self.log
            .completed(&format!(
                "imported {} in {} ranges",
                csv_path.display(),
                batch.total_jobs
            ))
            .await;
        Ok(())
    }

    pub(crate) async fn report_import_failure(&self, csv_path: &Path, batch: &BatchStatus) {
        self.log
            .error(&format!(
                "import of {} failed at {}% ({} of {} ranges failed)",
                csv_path.display(),
                batch.progress(),
                batch.failed_jobs,
                batch.total_jobs
            ))
            .await;
    }

    pub(crate) async fn finish_import(
        &self,
        csv_path: &Path,
        extract_dir: &Path,
    ) -> Result<(), PipelineError> {
        remove_import_artifacts(csv_path, extract_dir).await
    }
}

async fn remove_import_artifacts(csv_path: &Path, extract_dir: &Path) -> Result<(), PipelineError> {
    match tokio::fs::remove_file(csv_path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %csv_path.display(), error = %err, "failed to remove csv"),
    }
    match tokio::fs::remove_dir_all(extract_dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ArtifactError::Io {
            action: "removing extract directory",
            path: extract_dir.to_path_buf(),
            source,
        }
        .into()),
    }
}

/// Stream the csv from the start and collect staging rows for data rows in `range`.
pub async fn read_row_range(
    csv_path: &Path,
    range: RowRange,
    columns: &ColumnMap,
) -> Result<Vec<StagingRow>, PipelineError> {
    let csv_path: PathBuf = csv_path.to_path_buf();
    let columns = columns.clone();
    tokio::task::spawn_blocking(move || -> Result<Vec<StagingRow>, PipelineError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&csv_path)?;
        let resolved = columns.resolve(reader.headers()?.iter())?;

        let mut staged = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let row_number = index as u64 + 1;
            if row_number > range.end {
                break;
            }
            if !range.contains(row_number) {
                continue;
            }
            let record = record?;
            if let Some(parsed) = resolved.derive(|i| record.get(i)) {
                staged.extend(parsed.staging_rows());
            }
        }
        Ok(staged)
    })
    .await
    .map_err(ArtifactError::from)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgreg_core::NO_LOCALE;
    use tempfile::tempdir;

    const CSV: &str = "id,name,names,locale,status\n\
R1,Alpha,en:Alpha;fr:Alphaa,en,active\n\
R2,Beta,\"de:Beta GmbH\",en,inactive\n\
R3,Gamma,en:Gamma,en,ACTIVE\n";

    #[tokio::test]
    async fn reads_only_rows_inside_range() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("registry.csv");
        std::fs::write(&path, CSV).expect("write");

        let rows = read_row_range(&path, RowRange::new(2, 3).expect("range"), &ColumnMap::default())
            .await
            .expect("read");
        let ids: Vec<&str> = rows.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(ids, vec!["R2", "R2", "R3"]);

        let fallback = rows
            .iter()
            .find(|r| r.identifier == "R2" && r.locale == NO_LOCALE)
            .expect("display-name fallback");
        assert_eq!(fallback.setting_value, "Beta");
        assert!(!fallback.is_active);
        assert!(rows.iter().filter(|r| r.identifier == "R3").all(|r| r.is_active));
    }

    #[tokio::test]
    async fn missing_column_is_a_schema_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("registry.csv");
        std::fs::write(&path, "id,name,names,status\nR1,Alpha,en:Alpha,active\n").expect("write");

        let err = read_row_range(&path, RowRange::new(1, 1).expect("range"), &ColumnMap::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Schema(_)));
        assert!(!err.is_retryable());
    }
}
