//! Bulk export workflow: request an export job, poll until the file is
//! ready, then stream it to disk.

use anyhow::{Result, anyhow, bail};
use log::{info, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::api::{ApiClient, Method, Payload};
use crate::download::download_file;
use crate::purge::{DOWNLOAD_PATTERN, purge};
use crate::runtime::Runtime;

/// Endpoint that starts an export job and, suffixed with the file name,
/// reports on it.
pub const EXPORTS_ENDPOINT: &str = "bulk/exports";

/// Prefix of every downloaded file name.
pub const DOWNLOAD_PREFIX: &str = "SureDone_";

const EXPORT_FIELDS: &str = "guid,stock,price,msrp,cost,title,longdescription,condition,brand,upc,\
media1,weight,datesold,totalsold,manufacturerpartnumber,warranty,mpn,ebayid,ebaysku,ebaycatid,\
ebaystoreid,ebayprice,ebaytitle,ebaystarttime,ebayendtime,ebaysiteid,ebaysubtitle,\
ebaypaymentprofileid,ebayreturnprofileid,ebayshippingprofileid,ebaybestofferenabled,\
ebaybestofferminimumprice,ebaybestofferautoacceptprice,ebaybuyitnow,ebayupcnot,ebayskip,amznsku,\
amznasin,amznprice,amznskip,walmartskip,walmartprice,walmartcategory,walmartdescription,\
walmartislisted,walmartinprogress,walmartstatus,walmarturl,total_stock";

const SUCCESS: &str = "success";

/// Bounds on polling for the export file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    /// Unsuccessful polls tolerated before giving up.
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(30),
        }
    }
}

/// Response to the export request.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ExportStarted {
    pub result: String,
    #[serde(default)]
    pub export_file: Option<String>,
}

/// Response to a poll for the export file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ExportStatus {
    pub result: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// Field list sent with the export request, trimmed and de-duplicated in
/// first-seen order.
pub fn export_fields() -> String {
    dedup_fields(EXPORT_FIELDS)
}

fn dedup_fields(fields: &str) -> String {
    let mut seen = std::collections::HashSet::new();
    fields
        .split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty() && seen.insert(*field))
        .collect::<Vec<_>>()
        .join(",")
}

/// Accepts a server-supplied export file name only if it is a single plain
/// path component, so joining it onto the output directory stays inside it.
pub fn validate_export_file(file_name: &str) -> Result<&str> {
    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == file_name => Ok(file_name),
        _ => bail!(
            "Refusing export file name {:?}: it must be a plain file name",
            file_name
        ),
    }
}

/// Endpoint reporting on `file_name`, with the name percent-encoded as a
/// single path segment.
pub fn poll_endpoint(file_name: &str) -> Result<String> {
    let mut url = url::Url::parse("http://localhost/")?;
    url.path_segments_mut()
        .map_err(|()| anyhow!("Cannot build poll endpoint for {:?}", file_name))?
        .pop_if_empty()
        .extend(EXPORTS_ENDPOINT.split('/'))
        .push(file_name);
    Ok(url.path().trim_start_matches('/').to_string())
}

/// Payload for the export request.
pub fn export_payload() -> Payload {
    let mut payload = Payload::new();
    payload.insert("type".to_string(), Value::from("items"));
    payload.insert("mode".to_string(), Value::from("include"));
    payload.insert("fields".to_string(), Value::from(export_fields()));
    payload
}

pub struct ExportWorkflow<R: Runtime> {
    runtime: R,
    api: ApiClient,
    http: Client,
    poll: PollPolicy,
}

impl<R: Runtime> ExportWorkflow<R> {
    pub fn new(runtime: R, api: ApiClient, http: Client) -> Self {
        Self {
            runtime,
            api,
            http,
            poll: PollPolicy::default(),
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Runs the whole export and returns the path of the saved file.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self, output_dir: &Path) -> Result<PathBuf> {
        let file_name = self.request_export().await?;
        let file_name = validate_export_file(&file_name)?;

        if !self.runtime.is_dir(output_dir) {
            self.runtime.create_dir_all(output_dir)?;
        }
        purge(&self.runtime, output_dir, DOWNLOAD_PATTERN)?;

        let url = self.wait_for_export(file_name).await?;
        let dest = output_dir.join(format!("{}{}", DOWNLOAD_PREFIX, file_name));
        download_file(&self.runtime, &self.http, &url, &dest).await?;
        Ok(dest)
    }

    /// Starts the export job and returns the name of the file it produces.
    pub async fn request_export(&self) -> Result<String> {
        let payload = export_payload();
        let started: ExportStarted = self
            .api
            .call_as(Method::Get, EXPORTS_ENDPOINT, Some(&payload))
            .await?;

        match started {
            ExportStarted {
                result,
                export_file: Some(file),
            } if result == SUCCESS => {
                info!("Export requested: {}", file);
                Ok(file)
            }
            other => bail!("Export was not accepted: {:?}", other),
        }
    }

    /// Polls until the export reports a download URL.
    pub async fn wait_for_export(&self, file_name: &str) -> Result<String> {
        let endpoint = poll_endpoint(file_name)?;
        let empty = Payload::new();
        let mut failures = 0;

        loop {
            let status: ExportStatus = self
                .api
                .call_as(Method::Get, &endpoint, Some(&empty))
                .await?;

            if status.result == SUCCESS {
                if let Some(url) = &status.url {
                    return Ok(url.clone());
                }
            }

            failures += 1;
            if failures > self.poll.max_attempts {
                bail!(
                    "Cannot download {}: export not ready after {} polls (last: {:?})",
                    file_name,
                    failures,
                    status
                );
            }
            warn!(
                "Export {} not ready (attempt {}): {:?}, polling again in {:?}",
                file_name, failures, status, self.poll.delay
            );
            if !self.poll.delay.is_zero() {
                tokio::time::sleep(self.poll.delay).await;
            }
        }
    }
}
