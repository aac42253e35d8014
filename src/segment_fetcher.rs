// Slipstream Downloader - segment_fetcher.rs

use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metadata::{Segment, SegmentStatus};

/// Fixed pause between attempts on the same segment.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Write-side buffer for streaming a response body to disk.
const STREAM_BUF_CAPACITY: usize = 1024 * 1024;

/// How long a chaos-mode hang is allowed to run before the attempt is
/// abandoned.
const CHAOS_HANG_TIMEOUT: Duration = Duration::from_secs(5);

/// Custom error types for a segment fetch attempt.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Server returned an unsuccessful status code: {0}")]
    Unsuccessful(StatusCode),
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Segment {index} landed with {actual} bytes, expected {expected}")]
    SizeMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },
    #[error("Attempt timed out after {0:?}")]
    AttemptTimedOut(Duration),
    #[error("Fetch cancelled")]
    Cancelled,
}

/// A downloader for a single segment.
///
/// One instance is shared per run; each spawned fetch task calls `fetch` for
/// the segment it owns. The status slot for that index is written only here.
#[derive(Clone)]
pub struct SegmentFetcher {
    client: Client,
    url: String,
    max_retries: u32,
    chaos: bool,
}

impl SegmentFetcher {
    pub fn new(client: Client, url: &str, max_retries: u32, chaos: bool) -> Self {
        Self {
            client,
            url: url.to_string(),
            // The retry loop needs at least one attempt to make progress.
            max_retries: max_retries.max(1),
            chaos,
        }
    }

    /// Downloads one segment to its staging file, retrying on any fault up to
    /// the configured budget with a fixed backoff in between.
    ///
    /// The slot transitions `Pending -> (Retrying)* -> Succeeded | Failed`.
    /// Cancellation aborts between attempts, mid-stream, and during backoff,
    /// leaving the slot in `Retrying`.
    pub async fn fetch(
        &self,
        segment: &Segment,
        slot: &Mutex<SegmentStatus>,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        for attempt in 0..self.max_retries {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            match self.attempt(segment, attempt, cancel).await {
                Ok(()) => {
                    slot.lock().mark_succeeded(attempt);
                    debug!(index = segment.index, retries = attempt, "segment complete");
                    return Ok(());
                }
                Err(FetchError::Cancelled) => {
                    slot.lock().mark_retrying(attempt, "cancelled".to_string());
                    return Err(FetchError::Cancelled);
                }
                Err(err) => {
                    let failures = attempt + 1;
                    if failures == self.max_retries {
                        slot.lock().mark_failed(failures, err.to_string());
                        return Err(err);
                    }
                    warn!(
                        index = segment.index,
                        attempt = failures,
                        error = %err,
                        "segment fetch failed, retrying"
                    );
                    slot.lock().mark_retrying(failures, err.to_string());
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }
        unreachable!("retry loop always returns before the budget runs out");
    }

    /// A single attempt: issue the range request, stream the body to the
    /// segment file, and validate the on-disk length.
    async fn attempt(
        &self,
        segment: &Segment,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        if self.chaos && segment.index == 0 && attempt == 0 {
            return Err(FetchError::Unsuccessful(StatusCode::INTERNAL_SERVER_ERROR));
        }
        if self.chaos && segment.index == 1 {
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = sleep(CHAOS_HANG_TIMEOUT) => {
                    return Err(FetchError::AttemptTimedOut(CHAOS_HANG_TIMEOUT));
                }
            }
        }

        // A previous attempt may have left a partial file behind.
        match tokio::fs::remove_file(&segment.path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let range_header = format!("bytes={}-{}", segment.start, segment.end);
        debug!(index = segment.index, range = %range_header, "requesting segment");

        let response = self
            .client
            .get(&self.url)
            .header("Range", range_header)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Unsuccessful(response.status()));
        }

        let file = tokio::fs::File::create(&segment.path).await?;
        let mut writer = BufWriter::with_capacity(STREAM_BUF_CAPACITY, file);
        let mut stream = response.bytes_stream();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    writer.flush().await.ok();
                    return Err(FetchError::Cancelled);
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => writer.write_all(&bytes).await?,
                    Some(Err(err)) => return Err(err.into()),
                    None => break,
                }
            }
        }
        writer.flush().await?;
        drop(writer);

        let actual = tokio::fs::metadata(&segment.path).await?.len();
        let expected = segment.len();
        if actual != expected {
            return Err(FetchError::SizeMismatch {
                index: segment.index,
                expected,
                actual,
            });
        }

        Ok(())
    }
}
