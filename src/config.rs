//! Credential loading from `suredone.yaml`.

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::runtime::Runtime;

/// File name searched for in the default locations.
pub const CONFIG_FILE_NAME: &str = "suredone.yaml";

/// API user and token. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub token: String,
}

#[derive(Deserialize)]
struct ConfigFile {
    user: Option<String>,
    token: Option<String>,
}

/// Parses credentials from YAML text.
pub fn parse_credentials(text: &str) -> Result<Credentials> {
    let file: ConfigFile = serde_yaml::from_str(text).context("Invalid YAML in configuration")?;

    match (file.user, file.token) {
        (Some(user), Some(token)) => Ok(Credentials { user, token }),
        (None, _) => Err(anyhow!("`user` not found in configuration")),
        (_, None) => Err(anyhow!("`token` not found in configuration")),
    }
}

/// Resolves the configuration file and loads credentials from it.
///
/// `explicit` is honoured only if it names an existing `.yaml` file;
/// otherwise the default locations are searched.
#[tracing::instrument(skip(runtime))]
pub fn load_credentials<R: Runtime>(runtime: &R, explicit: Option<&Path>) -> Result<Credentials> {
    let path = resolve_config_path(runtime, explicit)?;
    info!("Configuration path: {:?}", path);

    let text = runtime.read_to_string(&path)?;
    let credentials =
        parse_credentials(&text).with_context(|| format!("Failed to load {:?}", path))?;
    debug!("Loaded credentials for user {}", credentials.user);
    Ok(credentials)
}

/// Picks the configuration file to read.
pub fn resolve_config_path<R: Runtime>(runtime: &R, explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if is_valid_config_path(runtime, path) {
            return Ok(path.to_path_buf());
        }
        warn!("Looking for configuration file in default locations...");
    }

    default_config_path(runtime)
}

fn is_valid_config_path<R: Runtime>(runtime: &R, path: &Path) -> bool {
    if !path.to_string_lossy().ends_with("yaml") {
        warn!("Configuration file {:?} must have a .yaml extension", path);
        return false;
    }
    if !runtime.exists(path) {
        warn!("Configuration file {:?} does not exist", path);
        return false;
    }
    true
}

fn default_config_path<R: Runtime>(runtime: &R) -> Result<PathBuf> {
    let mut candidates = vec![runtime.current_dir()?.join(CONFIG_FILE_NAME)];

    let platform_dir = if cfg!(windows) {
        runtime.data_local_dir()
    } else {
        runtime.home_dir()
    };
    if let Some(dir) = platform_dir {
        candidates.push(dir.join(CONFIG_FILE_NAME));
    }

    candidates
        .into_iter()
        .find(|candidate| runtime.exists(candidate))
        .ok_or_else(|| {
            anyhow!(
                "{} was not found in the default locations. Specify a path with --file.",
                CONFIG_FILE_NAME
            )
        })
}
