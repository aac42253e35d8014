// Slipstream Downloader - progress.rs

use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use crate::metadata::{Segment, SegmentState, SegmentStatus, StatusTable};

const TICK: Duration = Duration::from_millis(500);
const GRID_COLUMNS: usize = 16;
const MIB: f64 = 1024.0 * 1024.0;

/// Below this rate the ETA is noise, so it is omitted.
const MIN_SPEED_FOR_ETA: f64 = 1024.0;

const GREEN: &str = "\x1B[32m";
const YELLOW: &str = "\x1B[33m";
const RED: &str = "\x1B[31m";
const DIM: &str = "\x1B[2m";
const RESET: &str = "\x1B[0m";

/// Live view over a running download. Purely observational: it stats the
/// segment files and snapshots the status table, and never mutates either.
pub struct ProgressView {
    segments: Arc<Vec<Segment>>,
    statuses: Arc<StatusTable>,
    total_bytes: u64,
}

impl ProgressView {
    pub fn new(segments: Arc<Vec<Segment>>, statuses: Arc<StatusTable>, total_bytes: u64) -> Self {
        Self {
            segments,
            statuses,
            total_bytes,
        }
    }

    /// Redraws the terminal on a fixed cadence until cancelled. The whole
    /// frame is cleared and rewritten each tick so the region stays stable
    /// no matter how the fetchers race.
    pub async fn run(self, cancel: CancellationToken) {
        let bar = ProgressBar::new(self.total_bytes);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{bar:40.cyan/blue}] {percent}% ({msg})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        let started = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(TICK) => {}
            }

            let bytes = sample_on_disk_bytes(&self.segments, self.total_bytes).await;
            let snapshot = snapshot_statuses(&self.statuses);
            self.draw(&bar, bytes, &snapshot, started.elapsed());
        }
        bar.finish_and_clear();
    }

    fn draw(&self, bar: &ProgressBar, bytes: u64, snapshot: &[SegmentStatus], elapsed: Duration) {
        let speed = average_speed(bytes, elapsed);
        let eta = eta(self.total_bytes - bytes, speed);

        print!("\x1B[2J\x1B[1;1H");
        println!("--- Slipstream Downloader ---");
        bar.set_position(bytes);
        bar.set_message(format!(
            "{:.2}/{:.2} MiB at {:.2} MiB/s{}",
            bytes as f64 / MIB,
            self.total_bytes as f64 / MIB,
            speed / MIB,
            match eta {
                Some(eta) => format!(", ETA {}", format_duration(eta)),
                None => String::new(),
            }
        ));
        println!();
        println!("Segments ({} total, retries per cell):", snapshot.len());
        for line in render_grid(snapshot, GRID_COLUMNS) {
            println!("{}", line);
        }
    }
}

/// Sums the current on-disk length of every segment file, clamped to the
/// expected total. Files that are missing or mid-deletion by a retrying
/// fetcher simply count zero for this tick.
pub async fn sample_on_disk_bytes(segments: &[Segment], total_bytes: u64) -> u64 {
    let mut sum = 0u64;
    for segment in segments {
        sum += tokio::fs::metadata(&segment.path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
    }
    sum.min(total_bytes)
}

fn snapshot_statuses(statuses: &StatusTable) -> Vec<SegmentStatus> {
    statuses.iter().map(|slot| slot.lock().clone()).collect()
}

/// Moving average over the whole elapsed wall time, in bytes per second.
pub fn average_speed(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}

/// Remaining time at the current average speed, or `None` when the rate is
/// too low to extrapolate from.
pub fn eta(remaining_bytes: u64, speed: f64) -> Option<Duration> {
    if speed < MIN_SPEED_FOR_ETA {
        return None;
    }
    Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
}

pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// One colored cell per segment, `columns` cells per row. The digit is the
/// slot's retry count; the color is its state.
pub fn render_grid(snapshot: &[SegmentStatus], columns: usize) -> Vec<String> {
    snapshot
        .chunks(columns.max(1))
        .map(|row| row.iter().map(cell).collect::<Vec<_>>().join(" "))
        .collect()
}

fn cell(status: &SegmentStatus) -> String {
    let color = match status.state {
        SegmentState::Succeeded => GREEN,
        SegmentState::Retrying => YELLOW,
        SegmentState::Failed => RED,
        SegmentState::Pending => DIM,
    };
    format!("{}[{:>2}]{}", color, status.retries, RESET)
}
