// Slipstream Downloader - metadata.rs

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Represents the state of a single segment. Terminal states are never left.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Pending,
    Retrying,
    Succeeded,
    Failed,
}

impl SegmentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SegmentState::Succeeded | SegmentState::Failed)
    }
}

/// A contiguous byte interval of the origin file, fetched independently.
/// `start..=end` is inclusive; `path` is where the segment lands on disk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub path: PathBuf,
}

impl Segment {
    /// Number of bytes this segment covers.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Live status of one segment, written only by the fetcher that owns the
/// matching index and read by the progress aggregator.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SegmentStatus {
    pub index: usize,
    pub state: SegmentState,
    pub retries: u32,
    pub last_error: Option<String>,
}

impl SegmentStatus {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: SegmentState::Pending,
            retries: 0,
            last_error: None,
        }
    }

    pub fn mark_retrying(&mut self, retries: u32, error: String) {
        if self.state.is_terminal() {
            return;
        }
        self.state = SegmentState::Retrying;
        self.retries = retries;
        self.last_error = Some(error);
    }

    pub fn mark_succeeded(&mut self, retries: u32) {
        if self.state.is_terminal() {
            return;
        }
        self.state = SegmentState::Succeeded;
        self.retries = retries;
    }

    pub fn mark_failed(&mut self, retries: u32, error: String) {
        if self.state.is_terminal() {
            return;
        }
        self.state = SegmentState::Failed;
        self.retries = retries;
        self.last_error = Some(error);
    }
}

/// One status slot per segment index. Slot `i` is locked briefly by fetcher
/// `i` to publish a transition and by readers to snapshot it; there is no
/// lock spanning the whole table.
pub type StatusTable = Vec<Mutex<SegmentStatus>>;

pub fn new_status_table(count: usize) -> StatusTable {
    (0..count).map(|i| Mutex::new(SegmentStatus::new(i))).collect()
}

/// Splits `[0, length)` into at most `parallelism` contiguous, non-overlapping
/// segments. The segment size is `ceil(length / parallelism)`, the last
/// segment absorbs the remainder, and `parallelism` is clamped to `length` so
/// no segment is ever empty.
pub fn plan_segments(length: u64, parallelism: u32, staging_dir: &Path) -> Vec<Segment> {
    let count = u64::from(parallelism).min(length);
    let segment_size = length.div_ceil(count);

    let mut segments = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for index in 0..count {
        let end = (start + segment_size - 1).min(length - 1);
        segments.push(Segment {
            index: index as usize,
            start,
            end,
            path: staging_dir.join(format!("segment_{}", index)),
        });
        start = end + 1;
        if start >= length {
            break;
        }
    }
    segments
}
