// Slipstream Downloader - engine.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures::future::join_all;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::merge::{cleanup_staging, compute_sha256, digests_match, MergeError, Merger};
use crate::metadata::{new_status_table, plan_segments, SegmentState};
use crate::probe::{probe, ProbeError};
use crate::progress::ProgressView;
use crate::segment_fetcher::SegmentFetcher;

/// Hard ceiling on concurrent segment fetches.
pub const MAX_PARALLELISM: u32 = 64;

/// Everything the engine needs to know about one download. Immutable once
/// handed to the engine.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub output_path: PathBuf,
    pub parallelism: u32,
    pub max_retries: u32,
    pub expected_digest: Option<String>,
    pub verify: bool,
    pub keep_segments: bool,
    pub chaos: bool,
    pub progress: bool,
}

impl DownloadRequest {
    pub fn new(url: &str, output_path: impl Into<PathBuf>, parallelism: u32) -> Self {
        Self {
            url: url.to_string(),
            output_path: output_path.into(),
            parallelism,
            max_retries: 3,
            expected_digest: None,
            verify: false,
            keep_segments: false,
            chaos: false,
            progress: true,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Supplying a digest implies verification.
    pub fn with_expected_digest(mut self, digest: &str) -> Self {
        self.expected_digest = Some(digest.to_lowercase());
        self.verify = true;
        self
    }

    /// Compute the local digest even without an expected one to compare to.
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_keep_segments(mut self, keep: bool) -> Self {
        self.keep_segments = keep;
        self
    }

    pub fn with_chaos(mut self, chaos: bool) -> Self {
        self.chaos = chaos;
        self
    }

    /// Disable the terminal progress view; library consumers usually want
    /// this off.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(EngineError::ParallelismOutOfRange(self.parallelism));
        }
        if self.max_retries == 0 {
            return Err(EngineError::RetriesOutOfRange);
        }
        if let Some(digest) = &self.expected_digest {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(EngineError::InvalidDigest(digest.clone()));
            }
        }
        Ok(())
    }
}

/// A stage of the pipeline whose wall time is worth reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Merge,
    Verify,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Fetch => write!(f, "fetch"),
            Stage::Merge => write!(f, "merge"),
            Stage::Verify => write!(f, "verify"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub started_at: SystemTime,
    pub duration: Duration,
}

struct StageClock {
    stage: Stage,
    started_at: SystemTime,
    started: Instant,
}

impl StageClock {
    fn start(stage: Stage) -> Self {
        Self {
            stage,
            started_at: SystemTime::now(),
            started: Instant::now(),
        }
    }

    fn finish(self) -> StageTiming {
        StageTiming {
            stage: self.stage,
            started_at: self.started_at,
            duration: self.started.elapsed(),
        }
    }
}

/// Final state of one segment, as it appears in the report.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentOutcome {
    pub index: usize,
    pub state: SegmentState,
    pub retries: u32,
}

/// What a finished run looks like. Timings cover exactly the stages that
/// actually executed.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub url: String,
    pub output_path: PathBuf,
    pub parallelism: u32,
    pub total_bytes: u64,
    pub timings: Vec<StageTiming>,
    pub segments: Vec<SegmentOutcome>,
    pub local_digest: Option<String>,
    pub expected_digest: Option<String>,
    pub verified: Option<bool>,
}

/// A segment that burned through its whole retry budget.
#[derive(Debug, Clone)]
pub struct SegmentFailure {
    pub index: usize,
    pub retries: u32,
    pub last_error: String,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),
    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Server does not support range requests: {0}")]
    RangeRequestsNotSupported(String),
    #[error("Parallelism must be between 1 and {MAX_PARALLELISM}, got {0}")]
    ParallelismOutOfRange(u32),
    #[error("Retry budget must be at least 1")]
    RetriesOutOfRange,
    #[error("Expected digest must be 64 hex characters, got {0:?}")]
    InvalidDigest(String),
    #[error(
        "{} segment(s) exhausted their retry budget; consider a budget of {suggested_retries}",
        failures.len()
    )]
    SegmentFetchExhausted {
        failures: Vec<SegmentFailure>,
        suggested_retries: u32,
    },
    #[error("Merge failed: {0}")]
    Merge(#[from] MergeError),
    #[error("Digest mismatch: expected {expected}, computed {actual}")]
    VerificationFailed { expected: String, actual: String },
    #[error("Download cancelled")]
    Cancelled,
}

/// Shared HTTP client tuned for many concurrent range fetches against one
/// host: Nagle off, and enough pooled connections that `N` parallel GETs
/// don't serialize behind each other.
pub fn build_client(parallelism: u32) -> Result<Client, reqwest::Error> {
    Client::builder()
        .tcp_nodelay(true)
        .pool_max_idle_per_host(parallelism as usize * 2)
        .connect_timeout(Duration::from_secs(30))
        .build()
}

/// Orchestrates one download: probe, plan, fetch in parallel, merge, verify.
pub struct DownloadEngine {
    request: DownloadRequest,
}

impl DownloadEngine {
    pub fn new(request: DownloadRequest) -> Self {
        Self { request }
    }

    /// Where per-segment files live for this request: `.segments/` next to
    /// the output file. Removed when the run succeeds, preserved on failure
    /// so the wreckage can be inspected.
    pub fn staging_dir(&self) -> PathBuf {
        output_parent(&self.request.output_path).join(".segments")
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<DownloadReport, EngineError> {
        self.request.validate()?;
        let client = build_client(self.request.parallelism)?;

        let source = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = probe(&client, &self.request.url) => result?,
        };
        if !source.accepts_ranges {
            return Err(EngineError::RangeRequestsNotSupported(self.request.url.clone()));
        }

        let staging = self.staging_dir();
        tokio::fs::create_dir_all(output_parent(&self.request.output_path)).await?;
        // A stale staging area from an interrupted run is worthless without
        // cross-invocation resume, so start clean.
        cleanup_staging(&staging).await?;
        tokio::fs::create_dir_all(&staging).await?;

        let segments = Arc::new(plan_segments(source.length, self.request.parallelism, &staging));
        let statuses = Arc::new(new_status_table(segments.len()));

        info!(
            url = %self.request.url,
            length = source.length,
            segments = segments.len(),
            "starting segmented fetch"
        );

        let mut timings = Vec::new();
        let fetch_clock = StageClock::start(Stage::Fetch);

        let fetcher = SegmentFetcher::new(
            client,
            &self.request.url,
            self.request.max_retries,
            self.request.chaos,
        );

        let ui_cancel = cancel.child_token();
        let ui_task = self.request.progress.then(|| {
            let view = ProgressView::new(
                Arc::clone(&segments),
                Arc::clone(&statuses),
                source.length,
            );
            tokio::spawn(view.run(ui_cancel.clone()))
        });

        let mut tasks = Vec::new();
        for segment in segments.iter().cloned() {
            let fetcher = fetcher.clone();
            let statuses = Arc::clone(&statuses);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let slot = &statuses[segment.index];
                fetcher.fetch(&segment, slot, &cancel).await
            }));
        }
        join_all(tasks).await;

        ui_cancel.cancel();
        if let Some(task) = ui_task {
            task.await.ok();
        }

        timings.push(fetch_clock.finish());

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let outcomes: Vec<SegmentOutcome> = statuses
            .iter()
            .map(|slot| {
                let status = slot.lock();
                SegmentOutcome {
                    index: status.index,
                    state: status.state,
                    retries: status.retries,
                }
            })
            .collect();

        let failures: Vec<SegmentFailure> = statuses
            .iter()
            .filter_map(|slot| {
                let status = slot.lock();
                (status.state != SegmentState::Succeeded).then(|| SegmentFailure {
                    index: status.index,
                    retries: status.retries,
                    last_error: status
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "did not complete".to_string()),
                })
            })
            .collect();
        if !failures.is_empty() {
            warn!(failed = failures.len(), "fetch phase failed, staging preserved");
            return Err(EngineError::SegmentFetchExhausted {
                failures,
                suggested_retries: self.request.max_retries.saturating_mul(2),
            });
        }

        let merge_clock = StageClock::start(Stage::Merge);
        let merger = Merger::new((*segments).clone(), self.request.output_path.clone());
        let total_bytes = match merger.merge(cancel).await {
            Ok(bytes) => bytes,
            Err(MergeError::Cancelled) => return Err(EngineError::Cancelled),
            Err(err) => return Err(err.into()),
        };
        timings.push(merge_clock.finish());

        if !self.request.keep_segments {
            cleanup_staging(&staging).await?;
        }

        let mut local_digest = None;
        let mut verified = None;
        if self.request.verify {
            let verify_clock = StageClock::start(Stage::Verify);
            let digest = match compute_sha256(&self.request.output_path, cancel).await {
                Ok(digest) => digest,
                Err(MergeError::Cancelled) => return Err(EngineError::Cancelled),
                Err(err) => return Err(err.into()),
            };
            timings.push(verify_clock.finish());

            if let Some(expected) = &self.request.expected_digest {
                if !digests_match(expected, &digest) {
                    // The merged file stays on disk for inspection.
                    return Err(EngineError::VerificationFailed {
                        expected: expected.clone(),
                        actual: digest,
                    });
                }
                verified = Some(true);
            }
            local_digest = Some(digest);
        }

        info!(output = %self.request.output_path.display(), total_bytes, "download complete");

        Ok(DownloadReport {
            url: self.request.url.clone(),
            output_path: self.request.output_path.clone(),
            parallelism: self.request.parallelism,
            total_bytes,
            timings,
            segments: outcomes,
            local_digest,
            expected_digest: self.request.expected_digest.clone(),
            verified,
        })
    }
}

fn output_parent(output: &Path) -> &Path {
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::mock;
    use tempfile::TempDir;

    fn request(path: &str, output: &Path, parallelism: u32) -> DownloadRequest {
        DownloadRequest::new(
            &format!("{}{}", mockito::server_url(), path),
            output,
            parallelism,
        )
        .with_progress(false)
    }

    #[tokio::test]
    async fn happy_path_fetches_merges_and_cleans_up() -> anyhow::Result<()> {
        let _head = mock("HEAD", "/e2e.img")
            .with_status(200)
            .with_header("content-length", "10")
            .create();
        let _first = mock("GET", "/e2e.img")
            .match_header("range", "bytes=0-4")
            .with_status(206)
            .with_body("hello")
            .create();
        let _second = mock("GET", "/e2e.img")
            .match_header("range", "bytes=5-9")
            .with_status(206)
            .with_body("world")
            .create();

        let dir = TempDir::new()?;
        let output = dir.path().join("e2e.img");
        let engine = DownloadEngine::new(request("/e2e.img", &output, 2));

        let report = engine.run(&CancellationToken::new()).await?;

        assert_eq!(std::fs::read(&output)?, b"helloworld");
        assert_eq!(report.total_bytes, 10);
        assert_eq!(report.parallelism, 2);
        assert_eq!(report.segments.len(), 2);
        for outcome in &report.segments {
            assert_eq!(outcome.state, SegmentState::Succeeded);
            assert_eq!(outcome.retries, 0);
        }
        let stages: Vec<_> = report.timings.iter().map(|t| t.stage).collect();
        assert_eq!(stages, vec![Stage::Fetch, Stage::Merge]);
        assert_eq!(report.verified, None);
        assert!(!engine.staging_dir().exists());
        Ok(())
    }

    #[tokio::test]
    async fn verification_success_reports_digests() -> anyhow::Result<()> {
        let _head = mock("HEAD", "/ver.img")
            .with_status(200)
            .with_header("content-length", "5")
            .create();
        let _body = mock("GET", "/ver.img")
            .match_header("range", "bytes=0-4")
            .with_status(206)
            .with_body("hello")
            .create();

        let hello_sha = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        let dir = TempDir::new()?;
        let output = dir.path().join("ver.img");
        let engine = DownloadEngine::new(
            // Uppercase on purpose: comparison is case-insensitive.
            request("/ver.img", &output, 1).with_expected_digest(&hello_sha.to_uppercase()),
        );

        let report = engine.run(&CancellationToken::new()).await?;

        assert_eq!(report.verified, Some(true));
        assert_eq!(report.local_digest.as_deref(), Some(hello_sha));
        assert_eq!(report.expected_digest.as_deref(), Some(hello_sha));
        let stages: Vec<_> = report.timings.iter().map(|t| t.stage).collect();
        assert_eq!(stages, vec![Stage::Fetch, Stage::Merge, Stage::Verify]);
        Ok(())
    }

    #[tokio::test]
    async fn verification_mismatch_retains_the_merged_file() -> anyhow::Result<()> {
        let _head = mock("HEAD", "/mismatch.img")
            .with_status(200)
            .with_header("content-length", "5")
            .create();
        let _body = mock("GET", "/mismatch.img")
            .match_header("range", "bytes=0-4")
            .with_status(206)
            .with_body("hello")
            .create();

        let dir = TempDir::new()?;
        let output = dir.path().join("mismatch.img");
        let engine = DownloadEngine::new(
            request("/mismatch.img", &output, 1).with_expected_digest(&"0".repeat(64)),
        );

        let result = engine.run(&CancellationToken::new()).await;

        match result {
            Err(EngineError::VerificationFailed { expected, actual }) => {
                assert_eq!(expected, "0".repeat(64));
                assert_eq!(
                    actual,
                    "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
                );
            }
            other => panic!("expected VerificationFailed, got {:?}", other.map(|_| ())),
        }
        assert_eq!(std::fs::read(&output)?, b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_segment_fails_the_run_and_preserves_staging() -> anyhow::Result<()> {
        let _head = mock("HEAD", "/flaky.img")
            .with_status(200)
            .with_header("content-length", "10")
            .create();
        let _broken = mock("GET", "/flaky.img")
            .match_header("range", "bytes=0-4")
            .with_status(500)
            .expect_at_least(2)
            .create();
        let _fine = mock("GET", "/flaky.img")
            .match_header("range", "bytes=5-9")
            .with_status(206)
            .with_body("world")
            .create();

        let dir = TempDir::new()?;
        let output = dir.path().join("flaky.img");
        let engine = DownloadEngine::new(request("/flaky.img", &output, 2).with_retries(2));

        let result = engine.run(&CancellationToken::new()).await;

        match result {
            Err(EngineError::SegmentFetchExhausted {
                failures,
                suggested_retries,
            }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].index, 0);
                assert_eq!(failures[0].retries, 2);
                assert!(failures[0].last_error.contains("500"));
                assert_eq!(suggested_retries, 4);
            }
            other => panic!("expected SegmentFetchExhausted, got {:?}", other.map(|_| ())),
        }
        assert!(engine.staging_dir().exists());
        assert!(!output.exists());
        Ok(())
    }

    #[tokio::test]
    async fn chaos_transient_fault_recovers_within_budget() -> anyhow::Result<()> {
        let _head = mock("HEAD", "/chaos-e2e.img")
            .with_status(200)
            .with_header("content-length", "5")
            .create();
        let _body = mock("GET", "/chaos-e2e.img")
            .match_header("range", "bytes=0-4")
            .with_status(206)
            .with_body("hello")
            .create();

        let dir = TempDir::new()?;
        let output = dir.path().join("chaos-e2e.img");
        let engine =
            DownloadEngine::new(request("/chaos-e2e.img", &output, 1).with_chaos(true));

        let report = engine.run(&CancellationToken::new()).await?;

        assert_eq!(report.segments[0].state, SegmentState::Succeeded);
        assert_eq!(report.segments[0].retries, 1);
        assert_eq!(std::fs::read(&output)?, b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_before_any_work_short_circuits() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let output = dir.path().join("early-cancel.img");
        let engine = DownloadEngine::new(request("/early-cancel.img", &output, 2));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = engine.run(&cancel).await;

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(!output.exists());
        assert!(!engine.staging_dir().exists());
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_mid_fetch_aborts_without_output() -> anyhow::Result<()> {
        let _head = mock("HEAD", "/cancel.img")
            .with_status(200)
            .with_header("content-length", "10")
            .create();

        let dir = TempDir::new()?;
        let output = dir.path().join("cancel.img");
        // Chaos keeps both segments busy: segment 0 is in its backoff sleep
        // and segment 1 is hanging when the cancel fires.
        let engine = DownloadEngine::new(request("/cancel.img", &output, 2).with_chaos(true));

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });
        let result = engine.run(&cancel).await;

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(!output.exists());
        // Staging stays behind on a cancelled run, same as any failure.
        assert!(engine.staging_dir().exists());
        Ok(())
    }

    #[tokio::test]
    async fn keep_segments_retains_staging_after_success() -> anyhow::Result<()> {
        let _head = mock("HEAD", "/keep.img")
            .with_status(200)
            .with_header("content-length", "5")
            .create();
        let _body = mock("GET", "/keep.img")
            .match_header("range", "bytes=0-4")
            .with_status(206)
            .with_body("hello")
            .create();

        let dir = TempDir::new()?;
        let output = dir.path().join("keep.img");
        let engine =
            DownloadEngine::new(request("/keep.img", &output, 1).with_keep_segments(true));

        engine.run(&CancellationToken::new()).await?;

        let staging = engine.staging_dir();
        assert!(staging.exists());
        assert_eq!(std::fs::read(staging.join("segment_0"))?, b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn stale_staging_is_removed_on_start() -> anyhow::Result<()> {
        let _head = mock("HEAD", "/restart.img")
            .with_status(200)
            .with_header("content-length", "5")
            .create();
        let _body = mock("GET", "/restart.img")
            .match_header("range", "bytes=0-4")
            .with_status(206)
            .with_body("hello")
            .create();

        let dir = TempDir::new()?;
        let output = dir.path().join("restart.img");
        let engine = DownloadEngine::new(request("/restart.img", &output, 1));

        let staging = engine.staging_dir();
        std::fs::create_dir_all(&staging)?;
        std::fs::write(staging.join("segment_7"), "debris from a dead run")?;

        engine.run(&CancellationToken::new()).await?;

        assert_eq!(std::fs::read(&output)?, b"hello");
        assert!(!staging.exists());
        Ok(())
    }

    #[tokio::test]
    async fn explicit_range_refusal_fails_before_any_work() -> anyhow::Result<()> {
        let _head = mock("HEAD", "/norange-e2e.img")
            .with_status(200)
            .with_header("content-length", "10")
            .with_header("accept-ranges", "none")
            .create();

        let dir = TempDir::new()?;
        let output = dir.path().join("norange-e2e.img");
        let engine = DownloadEngine::new(request("/norange-e2e.img", &output, 2));

        let result = engine.run(&CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(EngineError::RangeRequestsNotSupported(_))
        ));
        assert!(!engine.staging_dir().exists());
        Ok(())
    }

    #[tokio::test]
    async fn requests_are_validated_before_any_network_io() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("x.img");

        let zero = DownloadEngine::new(DownloadRequest::new("http://unused.invalid/x", &output, 0));
        assert!(matches!(
            zero.run(&CancellationToken::new()).await,
            Err(EngineError::ParallelismOutOfRange(0))
        ));

        let oversized =
            DownloadEngine::new(DownloadRequest::new("http://unused.invalid/x", &output, 65));
        assert!(matches!(
            oversized.run(&CancellationToken::new()).await,
            Err(EngineError::ParallelismOutOfRange(65))
        ));

        let no_budget = DownloadEngine::new(
            DownloadRequest::new("http://unused.invalid/x", &output, 1).with_retries(0),
        );
        assert!(matches!(
            no_budget.run(&CancellationToken::new()).await,
            Err(EngineError::RetriesOutOfRange)
        ));

        let bad_digest = DownloadEngine::new(
            DownloadRequest::new("http://unused.invalid/x", &output, 1)
                .with_expected_digest("not-a-digest"),
        );
        assert!(matches!(
            bad_digest.run(&CancellationToken::new()).await,
            Err(EngineError::InvalidDigest(_))
        ));
    }
}
