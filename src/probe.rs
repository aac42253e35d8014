// Slipstream Downloader - probe.rs

use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use tracing::{debug, info};

/// What the origin told us about the file before any byte is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub length: u64,
    pub accepts_ranges: bool,
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Server returned an unsuccessful status code: {0}")]
    HttpStatus(StatusCode),
    #[error("Could not get content length from server: {0}")]
    NoContentLength(String),
}

/// Issues a HEAD request and returns the total length plus whether the origin
/// is willing to serve byte ranges.
///
/// A missing or zero `Content-Length` is fatal: without a length there is
/// nothing to partition, and falling back to an unsegmented download is not
/// this engine's job. Range support is assumed unless the origin explicitly
/// advertises `Accept-Ranges: none`; the first range fetch proves it either
/// way.
pub async fn probe(client: &Client, url: &str) -> Result<SourceInfo, ProbeError> {
    let response = client.head(url).send().await?;
    if !response.status().is_success() {
        return Err(ProbeError::HttpStatus(response.status()));
    }

    let length: u64 = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|val| val.to_str().ok())
        .and_then(|s| s.parse().ok())
        .filter(|len| *len > 0)
        .ok_or_else(|| ProbeError::NoContentLength(url.to_string()))?;

    let accepts_ranges = response
        .headers()
        .get(header::ACCEPT_RANGES)
        .and_then(|val| val.to_str().ok())
        .map_or(true, |val| !val.eq_ignore_ascii_case("none"));

    info!(url, length, accepts_ranges, "probed origin");

    Ok(SourceInfo {
        length,
        accepts_ranges,
    })
}

/// Fetches the sibling `<url>.sha256` resource and extracts the published
/// digest from it. Returns `None` on any failure; a missing sidecar simply
/// means there is nothing to verify against.
pub async fn fetch_digest_sidecar(client: &Client, url: &str) -> Option<String> {
    let sidecar_url = format!("{}.sha256", url);
    let response = client.get(&sidecar_url).send().await.ok()?;
    if !response.status().is_success() {
        debug!(url = %sidecar_url, status = %response.status(), "no digest sidecar");
        return None;
    }
    let body = response.text().await.ok()?;
    parse_digest(&body)
}

/// First whitespace-delimited token that looks like a SHA-256 hex digest,
/// lowercased. Sidecar files are typically `<digest>  <filename>` lines as
/// produced by `sha256sum`.
pub fn parse_digest(text: &str) -> Option<String> {
    text.split_whitespace()
        .find(|token| token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_lowercase)
}
