use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const CHUNK_PREFIX: &str = "chunk_";
const READ_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no chunk files found in {}", dir.display())]
    NoChunks { dir: PathBuf },
    #[error("archive {} could not be read: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ArtifactError {
    pub(crate) fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        ArtifactError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result of concatenating chunk files into one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub chunks: usize,
    pub bytes: u64,
    pub sha256: String,
}

pub fn chunk_file_name(index: u64) -> String {
    format!("{CHUNK_PREFIX}{index}")
}

/// Numeric suffix of a `chunk_<n>` file name.
pub fn chunk_index(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(CHUNK_PREFIX)?
        .parse()
        .ok()
}

/// Chunk files in `dir`, ordered by their numeric index (`chunk_2` before `chunk_10`).
pub async fn sorted_chunk_files(dir: &Path) -> Result<Vec<PathBuf>, ArtifactError> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| ArtifactError::io("reading chunk directory", dir, e))?;

    let mut chunks = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ArtifactError::io("reading chunk directory", dir, e))?
    {
        let path = entry.path();
        if let Some(index) = chunk_index(&path) {
            chunks.push((index, path));
        }
    }
    chunks.sort_by_key(|(index, _)| *index);
    Ok(chunks.into_iter().map(|(_, path)| path).collect())
}

/// Concatenate every chunk in `chunk_dir`, in numeric order, into `dest`.
pub async fn merge_chunks(chunk_dir: &Path, dest: &Path) -> Result<MergeReport, ArtifactError> {
    let chunks = sorted_chunk_files(chunk_dir).await?;
    if chunks.is_empty() {
        return Err(ArtifactError::NoChunks {
            dir: chunk_dir.to_path_buf(),
        });
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| ArtifactError::io("creating archive directory", parent, e))?;
    }
    let mut out = fs::File::create(dest)
        .await
        .map_err(|e| ArtifactError::io("creating archive", dest, e))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_BYTES];
    let mut bytes = 0u64;
    for chunk in &chunks {
        let mut input = fs::File::open(chunk)
            .await
            .map_err(|e| ArtifactError::io("opening chunk", chunk, e))?;
        loop {
            let read = input
                .read(&mut buffer)
                .await
                .map_err(|e| ArtifactError::io("reading chunk", chunk, e))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            out.write_all(&buffer[..read])
                .await
                .map_err(|e| ArtifactError::io("writing archive", dest, e))?;
            bytes += read as u64;
        }
    }
    out.flush()
        .await
        .map_err(|e| ArtifactError::io("flushing archive", dest, e))?;

    Ok(MergeReport {
        chunks: chunks.len(),
        bytes,
        sha256: hex::encode(hasher.finalize()),
    })
}

/// Unpack `archive` into `dest`, returning the number of entries.
pub async fn extract_archive(archive: &Path, dest: &Path) -> Result<usize, ArtifactError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = File::open(&archive).map_err(|e| ArtifactError::io("opening archive", &archive, e))?;
        let mut zip = zip::ZipArchive::new(file).map_err(|source| ArtifactError::Archive {
            path: archive.clone(),
            source,
        })?;
        std::fs::create_dir_all(&dest)
            .map_err(|e| ArtifactError::io("creating extract directory", &dest, e))?;
        zip.extract(&dest).map_err(|source| ArtifactError::Archive {
            path: archive.clone(),
            source,
        })?;
        Ok(zip.len())
    })
    .await?
}

/// Count data rows in a CSV by counting newline bytes, minus the header line.
/// A final line without a trailing newline still counts.
pub async fn count_data_rows(csv: &Path) -> Result<u64, ArtifactError> {
    let csv = csv.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = File::open(&csv).map_err(|e| ArtifactError::io("opening csv", &csv, e))?;
        let mut buffer = vec![0u8; READ_BUFFER_BYTES];
        let mut lines = 0u64;
        let mut last_byte = None;
        loop {
            let read = file
                .read(&mut buffer)
                .map_err(|e| ArtifactError::io("reading csv", &csv, e))?;
            if read == 0 {
                break;
            }
            lines += memchr::memchr_iter(b'\n', &buffer[..read]).count() as u64;
            last_byte = Some(buffer[read - 1]);
        }
        if matches!(last_byte, Some(byte) if byte != b'\n') {
            lines += 1;
        }
        Ok(lines.saturating_sub(1))
    })
    .await?
}
