//! Retrieval of monthly trip-record files.

mod basic;
mod client;

pub use basic::BasicClient;
pub use client::HttpClient;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub const DEFAULT_BASE_URL: &str = "https://d37ci6vzurychx.cloudfront.net/trip-data/";

/// File name of the yellow-cab archive for one month.
pub fn trip_data_file_name(year: i32, month: u32) -> String {
    format!("yellow_tripdata_{year}-{month:02}.parquet")
}

pub fn trip_data_url(base_url: &str, year: i32, month: u32) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        trip_data_file_name(year, month)
    )
}

/// Streams the body at `url` into `dest`.
///
/// The body is written under a `.part` name and renamed once complete, so an
/// interrupted download never looks like a source file.
#[tracing::instrument(skip(client, dest), fields(dest = %dest.display()))]
pub async fn download_to_file<C: HttpClient>(client: &C, url: &str, dest: &Path) -> Result<u64> {
    let req = reqwest::Request::new(reqwest::Method::GET, url.parse()?);
    let mut resp = client
        .execute(req)
        .await
        .with_context(|| format!("requesting {url}"))?
        .error_for_status()?;

    let part = partial_path(dest);
    let mut file = tokio::fs::File::create(&part)
        .await
        .with_context(|| format!("creating {}", part.display()))?;

    let mut written = 0u64;
    while let Some(chunk) = resp.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&part, dest)
        .await
        .with_context(|| format!("moving {} into place", part.display()))?;

    debug!(bytes = written, "Download complete");
    Ok(written)
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Downloads one month's file into `dir`, returning its path.
pub async fn download_month<C: HttpClient>(
    client: &C,
    base_url: &str,
    year: i32,
    month: u32,
    dir: &Path,
) -> Result<PathBuf> {
    let url = trip_data_url(base_url, year, month);
    let dest = dir.join(trip_data_file_name(year, month));
    let bytes = download_to_file(client, &url, &dest).await?;
    info!(url = %url, bytes, "Downloaded trip data");
    Ok(dest)
}
