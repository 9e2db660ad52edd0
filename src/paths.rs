use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::runtime::Runtime;

/// Directory the export is saved into when `--output-dir` is not given.
#[tracing::instrument(skip(runtime))]
pub fn default_download_dir<R: Runtime>(runtime: &R) -> Result<PathBuf> {
    platform_download_dir(runtime)
}

#[cfg(target_os = "windows")]
fn platform_download_dir<R: Runtime>(runtime: &R) -> Result<PathBuf> {
    let home = runtime
        .home_dir()
        .context("Could not find home directory")?;
    Ok(home.join("Downloads"))
}

#[cfg(target_os = "linux")]
fn platform_download_dir<R: Runtime>(runtime: &R) -> Result<PathBuf> {
    let home = runtime
        .home_dir()
        .context("Could not find home directory")?;
    Ok(home.join("downloads"))
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
fn platform_download_dir<R: Runtime>(runtime: &R) -> Result<PathBuf> {
    runtime.current_dir()
}
