//! Removal of previously downloaded export files.

use anyhow::{Context, Result};
use glob::Pattern;
use log::{debug, info};
use std::path::Path;

use crate::runtime::Runtime;

/// File-name pattern of every file this tool downloads.
pub const DOWNLOAD_PATTERN: &str = "SureDone_*";

/// Removes every file under `dir` (recursively) whose file name matches the
/// glob `pattern`. Returns the number of files removed.
#[tracing::instrument(skip(runtime))]
pub fn purge<R: Runtime>(runtime: &R, dir: &Path, pattern: &str) -> Result<usize> {
    let pattern =
        Pattern::new(pattern).with_context(|| format!("Invalid purge pattern {:?}", pattern))?;

    if !runtime.is_dir(dir) {
        debug!("Nothing to purge, {:?} is not a directory", dir);
        return Ok(0);
    }

    let removed = purge_dir(runtime, dir, &pattern)?;
    info!("Purged {} existing file(s) from {:?}", removed, dir);
    Ok(removed)
}

fn purge_dir<R: Runtime>(runtime: &R, dir: &Path, pattern: &Pattern) -> Result<usize> {
    let mut removed = 0;

    for entry in runtime.read_dir(dir)? {
        if runtime.is_dir(&entry) {
            removed += purge_dir(runtime, &entry, pattern)?;
            continue;
        }

        let matches = entry
            .file_name()
            .map(|name| pattern.matches(&name.to_string_lossy()))
            .unwrap_or(false);
        if matches {
            debug!("Removing {:?}", entry);
            runtime.remove_file(&entry)?;
            removed += 1;
        }
    }

    Ok(removed)
}
