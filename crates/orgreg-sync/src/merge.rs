use std::path::PathBuf;

use orgreg_storage::{extract_archive, merge_chunks, WorkDir};
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::worker::Worker;

impl Worker {
    /// Concatenate the chunk files in numeric order, unpack the archive and
    /// locate the dataset csv. On failure every artifact of the run is removed.
    pub async fn merge_and_extract(
        &self,
        layout: &WorkDir,
        csv_filter: &str,
    ) -> Result<PathBuf, PipelineError> {
        let result = assemble(layout, csv_filter).await;
        if let Err(err) = &result {
            error!(root = %layout.root().display(), error = %err, "merge/extract failed");
            self.log
                .error(&format!(
                    "merging chunks under {} failed: {err}",
                    layout.root().display()
                ))
                .await;
            discard_run_artifacts(layout).await;
        }
        result
    }
}

async fn assemble(layout: &WorkDir, csv_filter: &str) -> Result<PathBuf, PipelineError> {
    let zip_path = layout.zip_path();
    let report = merge_chunks(&layout.chunk_dir(), &zip_path).await?;
    info!(
        chunks = report.chunks,
        bytes = report.bytes,
        sha256 = %report.sha256,
        "merged chunk files"
    );

    let extract_dir = layout.extract_dir();
    let entries = extract_archive(&zip_path, &extract_dir).await?;
    if !tokio::fs::try_exists(&extract_dir).await.unwrap_or(false) {
        return Err(PipelineError::integrity(format!(
            "extract directory {} missing after unpacking {entries} entries",
            extract_dir.display()
        )));
    }

    let csv_path = layout.find_csv(csv_filter).await?.ok_or_else(|| {
        PipelineError::integrity(format!(
            "no csv matching {csv_filter:?} in {}",
            extract_dir.display()
        ))
    })?;
    layout.remove_chunks().await?;
    Ok(csv_path)
}

async fn discard_run_artifacts(layout: &WorkDir) {
    for result in [
        layout.remove_chunks().await,
        layout.remove_zip().await,
        layout.remove_extracted().await,
    ] {
        if let Err(err) = result {
            warn!(error = %err, "artifact cleanup failed");
        }
    }
}
