use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::archive::{chunk_file_name, chunk_index, ArtifactError};

/// Artifact layout for one dataset under the private working directory:
///
/// ```text
/// <base>/<prefix>/chunks/chunk_<n>
/// <base>/<prefix>/dataset.zip        assembled from chunks
/// <base>/<prefix>/dataset-full.zip   single-stream download
/// <base>/<prefix>/extracted/...      unpacked archive holding the csv
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(base: impl AsRef<Path>, prefix: &str) -> Self {
        Self {
            root: base.as_ref().join(prefix),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_dir(&self) -> PathBuf {
        self.root.join("chunks")
    }

    pub fn chunk_path(&self, index: u64) -> PathBuf {
        self.chunk_dir().join(chunk_file_name(index))
    }

    pub fn zip_path(&self) -> PathBuf {
        self.root.join("dataset.zip")
    }

    pub fn fallback_zip_path(&self) -> PathBuf {
        self.root.join("dataset-full.zip")
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.root.join("extracted")
    }

    /// First `.csv` under the extracted directory whose file name contains `filter`.
    pub async fn find_csv(&self, filter: &str) -> Result<Option<PathBuf>, ArtifactError> {
        find_csv_in(&self.extract_dir(), filter).await
    }

    /// Indices of completed chunk files on disk, ascending; in-progress temp files are skipped.
    pub async fn chunk_indices(&self) -> Result<Vec<u64>, ArtifactError> {
        let dir = self.chunk_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(ArtifactError::io("reading chunk directory", &dir, err)),
        };
        let mut indices = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ArtifactError::io("reading chunk directory", &dir, e))?
        {
            if let Some(index) = chunk_index(&entry.path()) {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    pub async fn remove_chunks(&self) -> Result<(), ArtifactError> {
        remove_dir_if_exists(&self.chunk_dir()).await
    }

    pub async fn remove_zip(&self) -> Result<(), ArtifactError> {
        remove_file_if_exists(&self.zip_path()).await
    }

    pub async fn remove_fallback_zip(&self) -> Result<(), ArtifactError> {
        remove_file_if_exists(&self.fallback_zip_path()).await
    }

    pub async fn remove_extracted(&self) -> Result<(), ArtifactError> {
        remove_dir_if_exists(&self.extract_dir()).await
    }

    /// Chunk files and the archive assembled from them.
    pub async fn clean_chunk_artifacts(&self) -> Result<(), ArtifactError> {
        self.remove_chunks().await?;
        self.remove_zip().await
    }
}

pub(crate) async fn find_csv_in(dir: &Path, filter: &str) -> Result<Option<PathBuf>, ArtifactError> {
    let filter = filter.to_ascii_lowercase();
    let mut pending = vec![dir.to_path_buf()];
    let mut matches = Vec::new();

    while let Some(current) = pending.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(ArtifactError::io("reading extract directory", &current, err)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ArtifactError::io("reading extract directory", &current, e))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| ArtifactError::io("inspecting", &path, e))?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
            if file_type.is_file() && name.ends_with(".csv") && name.contains(&filter) {
                matches.push(path);
            }
        }
    }

    matches.sort();
    Ok(matches.into_iter().next())
}

pub(crate) async fn remove_dir_if_exists(path: &Path) -> Result<(), ArtifactError> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ArtifactError::io("removing directory", path, err)),
    }
}

pub(crate) async fn remove_file_if_exists(path: &Path) -> Result<(), ArtifactError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ArtifactError::io("removing file", path, err)),
    }
}
