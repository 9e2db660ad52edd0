//! Streams an export file to disk.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use reqwest::Client;
use std::io::Write;
use std::path::Path;

use crate::runtime::Runtime;

/// Downloads `url` into `dest` and returns the number of bytes written.
///
/// The URL is pre-signed, so no credential headers are sent. A partially
/// written file is removed when the transfer fails.
#[tracing::instrument(skip(runtime, client))]
pub async fn download_file<R: Runtime>(
    runtime: &R,
    client: &Client,
    url: &str,
    dest: &Path,
) -> Result<u64> {
    info!("Starting file download...");

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to start download request")?
        .error_for_status()
        .context("Download URL returned an error status")?;

    let mut writer = runtime.create_file(dest)?;

    match stream_to(response, &mut writer).await {
        Ok(bytes) => {
            drop(writer);
            info!("Saved to {:?}", dest);
            Ok(bytes)
        }
        Err(e) => {
            drop(writer);
            if let Err(cleanup) = runtime.remove_file(dest) {
                warn!("Failed to remove partial download {:?}: {}", dest, cleanup);
            }
            Err(e)
        }
    }
}

async fn stream_to(mut response: reqwest::Response, writer: &mut impl Write) -> Result<u64> {
    let mut downloaded_bytes: u64 = 0;

    while let Some(chunk) = response
        .chunk()
        .await
        .context("Failed to read chunk from download stream")?
    {
        writer
            .write_all(&chunk)
            .context("Failed to write chunk to file")?;
        downloaded_bytes += chunk.len() as u64;
    }
    writer.flush().context("Failed to flush downloaded file")?;

    debug!(
        "Downloaded {:.2} MB",
        downloaded_bytes as f64 / (1024.0 * 1024.0)
    );

    Ok(downloaded_bytes)
}
