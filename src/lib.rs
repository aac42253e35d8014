//! Parallel segmented downloads for large disk images.
//!
//! The target file is probed with a HEAD request, partitioned into byte
//! ranges, fetched concurrently into a staging area, reassembled in index
//! order, and optionally verified against a published SHA-256 digest.
//!
//! ```no_run
//! use slipstream::{DownloadEngine, DownloadRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), slipstream::EngineError> {
//!     let request = DownloadRequest::new("https://example.com/disk.img", "disk.img", 8);
//!     let report = DownloadEngine::new(request)
//!         .run(&CancellationToken::new())
//!         .await?;
//!     println!("downloaded {} bytes", report.total_bytes);
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod merge;
pub mod metadata;
pub mod probe;
pub mod progress;
pub mod segment_fetcher;

pub use engine::{
    build_client, DownloadEngine, DownloadReport, DownloadRequest, EngineError, SegmentFailure,
    SegmentOutcome, Stage, StageTiming, MAX_PARALLELISM,
};
pub use merge::{MergeError, Merger};
pub use metadata::{plan_segments, Segment, SegmentState, SegmentStatus};
pub use probe::{fetch_digest_sidecar, probe, ProbeError, SourceInfo};
pub use segment_fetcher::{FetchError, SegmentFetcher};
