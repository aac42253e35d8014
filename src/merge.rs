// Slipstream Downloader - merge.rs

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metadata::Segment;

const MERGE_BUF_CAPACITY: usize = 4 * 1024 * 1024;
const HASH_BUF_CAPACITY: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Segment {0} is missing from the staging area")]
    MissingSegment(usize),
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Merge cancelled")]
    Cancelled,
}

/// Concatenates segment files into the final output.
///
/// Segments are copied in strict index order; completion order during the
/// fetch phase is irrelevant here. The bytes land in `<output>.tmp` first and
/// the temp file is renamed over the output only once fully written, so a
/// torn merge never masquerades as a finished download.
pub struct Merger {
    segments: Vec<Segment>,
    output_path: PathBuf,
}

impl Merger {
    pub fn new(segments: Vec<Segment>, output_path: PathBuf) -> Self {
        Self {
            segments,
            output_path,
        }
    }

    /// Runs the merge protocol and returns the number of bytes written.
    /// On any failure the temp file is unlinked.
    pub async fn merge(&self, cancel: &CancellationToken) -> Result<u64, MergeError> {
        for segment in &self.segments {
            if !segment.path.exists() {
                return Err(MergeError::MissingSegment(segment.index));
            }
        }

        let tmp = tmp_path(&self.output_path);
        let result = self.write_and_swap(&tmp, cancel).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result
    }

    async fn write_and_swap(&self, tmp: &Path, cancel: &CancellationToken) -> Result<u64, MergeError> {
        let file = File::create(tmp).await?;
        let mut writer = BufWriter::with_capacity(MERGE_BUF_CAPACITY, file);
        let mut total = 0u64;

        for segment in &self.segments {
            if cancel.is_cancelled() {
                return Err(MergeError::Cancelled);
            }
            debug!(index = segment.index, "merging segment");
            let input = File::open(&segment.path).await?;
            let mut reader = BufReader::with_capacity(MERGE_BUF_CAPACITY, input);
            total += tokio::io::copy_buf(&mut reader, &mut writer).await?;
        }

        writer.flush().await?;
        drop(writer);

        match tokio::fs::remove_file(&self.output_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tokio::fs::rename(tmp, &self.output_path).await?;

        info!(output = %self.output_path.display(), bytes = total, "merge complete");
        Ok(total)
    }
}

fn tmp_path(output: &Path) -> PathBuf {
    let mut os = output.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Streaming SHA-256 of a file on disk. The file is read through a bounded
/// buffer and never held in memory whole.
pub async fn compute_sha256(path: &Path, cancel: &CancellationToken) -> Result<String, MergeError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::with_capacity(HASH_BUF_CAPACITY, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_CAPACITY];

    loop {
        if cancel.is_cancelled() {
            return Err(MergeError::Cancelled);
        }
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Hex digests compare case-insensitively.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}

/// Removes the staging directory and everything in it. Already-absent
/// staging is fine, so a second run over the same output path never trips.
pub async fn cleanup_staging(staging_dir: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::remove_dir_all(staging_dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
