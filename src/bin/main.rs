// Slipstream Downloader - src/bin/main.rs
//
// This is the entry point for the command-line tool. Its job is to parse
// arguments, hand a request to the DownloadEngine, and render the report.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

use slipstream::{
    build_client, fetch_digest_sidecar, DownloadEngine, DownloadReport, DownloadRequest,
    EngineError, SegmentState,
};

const MIB: f64 = 1024.0 * 1024.0;

/// A parallel segmented downloader for large disk images.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of the file to download.
    url: String,

    /// Optional output file name (derived from the URL when omitted).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of concurrent segment connections.
    #[arg(short, long, default_value_t = 8)]
    connections: u32,

    /// Attempts per segment before the download is abandoned.
    #[arg(short, long, default_value_t = 3)]
    retries: u32,

    /// Expected SHA-256 of the final file. Looked up from `<url>.sha256`
    /// when omitted.
    #[arg(long)]
    hash: Option<String>,

    /// Skip digest verification entirely.
    #[arg(long)]
    no_verify: bool,

    /// Keep the per-segment staging files after a successful merge.
    #[arg(long)]
    keep_segments: bool,

    /// Inject deterministic faults into segments 0 and 1.
    #[arg(long)]
    chaos: bool,

    /// Print the final report as JSON instead of the summary table.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();

    let output_path = match args.output.clone().or_else(|| output_from_url(&args.url)) {
        Some(path) => path,
        None => {
            eprintln!("Could not derive an output name from the URL; pass --output.");
            return ExitCode::FAILURE;
        }
    };

    let mut request = DownloadRequest::new(&args.url, &output_path, args.connections)
        .with_retries(args.retries)
        .with_keep_segments(args.keep_segments)
        .with_chaos(args.chaos);

    if !args.no_verify {
        match resolve_digest(&args).await {
            Some(digest) => request = request.with_expected_digest(&digest),
            None => println!("No digest published for this URL; skipping verification."),
        }
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    println!("Initializing download...");
    match DownloadEngine::new(request).run(&cancel).await {
        Ok(report) => {
            if args.json {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{}", json),
                    Err(err) => {
                        eprintln!("Could not serialize the report: {}", err);
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                print_summary(&report);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            print_failure(&err);
            ExitCode::FAILURE
        }
    }
}

/// Filename from the last path component of the URL, same as every other
/// downloader does it.
fn output_from_url(url: &str) -> Option<PathBuf> {
    let parsed = Url::parse(url).ok()?;
    Path::new(parsed.path())
        .file_name()
        .map(PathBuf::from)
        .filter(|name| !name.as_os_str().is_empty())
}

/// `--hash` wins; otherwise try the `.sha256` sidecar next to the URL.
async fn resolve_digest(args: &Args) -> Option<String> {
    if let Some(hash) = &args.hash {
        return Some(hash.clone());
    }
    let client = build_client(args.connections).ok()?;
    fetch_digest_sidecar(&client, &args.url).await
}

fn print_summary(report: &DownloadReport) {
    println!("\n--- Download Summary ---");
    println!("URL:        {}", report.url);
    println!("Output:     {}", report.output_path.display());
    println!(
        "Size:       {:.2} MiB across {} segments ({} connections requested)",
        report.total_bytes as f64 / MIB,
        report.segments.len(),
        report.parallelism
    );

    println!("Stages:");
    for timing in &report.timings {
        println!("  {:<8} {:>8.2}s", timing.stage.to_string(), timing.duration.as_secs_f64());
    }

    println!("Segments:");
    for outcome in &report.segments {
        println!(
            "  #{:<3} {:?} ({} retries)",
            outcome.index, outcome.state, outcome.retries
        );
    }
    let retried = report
        .segments
        .iter()
        .filter(|outcome| outcome.retries > 0 || outcome.state != SegmentState::Succeeded)
        .count();
    if retried == 0 {
        println!("  All segments completed on the first attempt.");
    }

    match (&report.local_digest, report.verified) {
        (Some(digest), Some(true)) => println!("Digest:     {} (verified)", digest),
        (Some(digest), _) => println!("Digest:     {} (no published digest to compare)", digest),
        _ => {}
    }
}

fn print_failure(err: &EngineError) {
    eprintln!("\nAn error occurred during download: {}", err);
    match err {
        EngineError::SegmentFetchExhausted { failures, .. } => {
            for failure in failures {
                eprintln!(
                    "  segment {}: {} (after {} attempts)",
                    failure.index, failure.last_error, failure.retries
                );
            }
            eprintln!("  The staging directory was kept for inspection.");
        }
        EngineError::VerificationFailed { .. } => {
            eprintln!("  The merged file was kept on disk for inspection.");
        }
        _ => {}
    }
}
