//! Groups eBay fitment rows by item GUID into SureDone bulk `edit` rows.
//!
//! The input is a CSV with a header row whose first three columns are the
//! item GUID, the fitment EPID and an optional note. Rows are sorted by GUID
//! then EPID, and every GUID becomes one output row whose `ebayepid` column
//! lists its EPIDs as `epid::note*epid*...`. At most `max_iterations` EPIDs
//! are kept per GUID; rows past that are counted but dropped.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use csv::{ReaderBuilder, WriterBuilder};
use log::{debug, info, warn};
use std::cmp::Ordering;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::runtime::Runtime;

/// EPIDs kept per GUID unless told otherwise.
pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

/// Value of the `action` column of every output row.
pub const EDIT_ACTION: &str = "edit";

const OUTPUT_HEADER: [&str; 3] = ["action", "guid", "ebayepid"];
const ENTRY_SEPARATOR: &str = "*";
const NOTE_SEPARATOR: &str = "::";

/// Which GUIDs the iteration log lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No log file is written.
    #[default]
    Off,
    /// Only GUIDs that reached the iteration cap.
    OverLimit,
    /// Every GUID.
    All,
}

impl LogLevel {
    /// Maps the numeric `--log` level. Unknown levels fall back to
    /// [`LogLevel::OverLimit`] with a warning.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => LogLevel::Off,
            1 => LogLevel::OverLimit,
            2 => LogLevel::All,
            other => {
                warn!(
                    "Unknown log level {}. Permitted levels are 0, 1 and 2. Using 1.",
                    other
                );
                LogLevel::OverLimit
            }
        }
    }
}

/// Iteration cap from the command line. Anything below 1 means the default.
pub fn max_iterations(value: i64) -> usize {
    match usize::try_from(value) {
        Ok(n) if n >= 1 => n,
        _ => DEFAULT_MAX_ITERATIONS,
    }
}

/// One input row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitmentRow {
    pub guid: String,
    pub epid: String,
    pub note: Option<String>,
}

impl FitmentRow {
    fn entry(&self) -> String {
        match &self.note {
            Some(note) => format!("{}{}{}", self.epid, NOTE_SEPARATOR, note),
            None => self.epid.clone(),
        }
    }
}

/// One output row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRow {
    pub guid: String,
    pub ebayepid: String,
}

/// Rows seen for one GUID, including those past the cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidIterations {
    pub guid: String,
    pub iterations: usize,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Grouped {
    pub rows: Vec<EditRow>,
    pub iterations: Vec<GuidIterations>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RearrangeOptions {
    pub max_iterations: usize,
    pub log_level: LogLevel,
}

impl Default for RearrangeOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            log_level: LogLevel::Off,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RearrangeSummary {
    pub rows_read: usize,
    pub guids: usize,
    /// GUIDs that had rows dropped by the cap.
    pub capped: usize,
    pub log_file: Option<PathBuf>,
}

/// Parses the input CSV. The header row is skipped and columns are taken by
/// position, so the header names do not matter.
pub fn read_rows(text: &str) -> Result<Vec<FitmentRow>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        // Line 1 is the header.
        let line = index + 2;
        let record = record.with_context(|| format!("Failed to parse CSV line {}", line))?;
        let (Some(guid), Some(epid)) = (record.get(0), record.get(1)) else {
            bail!("CSV line {} needs at least a guid and an EPID column", line);
        };
        let note = record
            .get(2)
            .map(str::trim)
            .filter(|note| !note.is_empty())
            .map(str::to_string);
        rows.push(FitmentRow {
            guid: guid.to_string(),
            epid: epid.to_string(),
            note,
        });
    }
    Ok(rows)
}

/// Sorts by GUID then EPID. Values that are both numbers compare
/// numerically, and numbers sort before text.
pub fn sort_rows(rows: &mut [FitmentRow]) {
    rows.sort_by(|a, b| {
        compare_values(&a.guid, &b.guid).then_with(|| compare_values(&a.epid, &b.epid))
    });
}

fn compare_values(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Groups consecutive rows with the same GUID. `rows` must already be
/// sorted; every group produces exactly one output row and one iteration
/// count, the last group included.
pub fn group_rows(rows: &[FitmentRow], max_iterations: usize) -> Grouped {
    let mut grouped = Grouped::default();
    let mut current: Option<(&str, Vec<String>, usize)> = None;
    let step = (rows.len() / 100).max(1);

    for (index, row) in rows.iter().enumerate() {
        let same_guid = matches!(&current, Some((guid, _, _)) if *guid == row.guid);
        if !same_guid {
            if let Some(group) = current.take() {
                grouped.push(group);
            }
            current = Some((row.guid.as_str(), Vec::new(), 0));
        }

        if let Some((_, entries, iterations)) = current.as_mut() {
            *iterations += 1;
            if entries.len() < max_iterations {
                entries.push(row.entry());
            }
            if (index + 1) % step == 0 {
                debug!(
                    "Completed: {}% | Iterations of current GUID: {}",
                    (index + 1) * 100 / rows.len(),
                    iterations
                );
            }
        }
    }
    if let Some(group) = current {
        grouped.push(group);
    }
    grouped
}

impl Grouped {
    fn push(&mut self, (guid, entries, iterations): (&str, Vec<String>, usize)) {
        self.rows.push(EditRow {
            guid: guid.to_string(),
            ebayepid: entries.join(ENTRY_SEPARATOR),
        });
        self.iterations.push(GuidIterations {
            guid: guid.to_string(),
            iterations,
        });
    }
}

/// Writes the `action,guid,ebayepid` header and one `edit` row per GUID.
pub fn write_edit_rows<W: Write>(writer: W, rows: &[EditRow]) -> Result<()> {
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(writer);
    writer.write_record(OUTPUT_HEADER)?;
    for row in rows {
        writer.write_record([EDIT_ACTION, row.guid.as_str(), row.ebayepid.as_str()])?;
    }
    writer.flush().context("Failed to write output CSV")?;
    Ok(())
}

/// Renders the iteration log, or `None` when `level` is [`LogLevel::Off`].
pub fn format_iteration_log(
    iterations: &[GuidIterations],
    max_iterations: usize,
    level: LogLevel,
) -> Option<String> {
    let include: fn(&GuidIterations, usize) -> bool = match level {
        LogLevel::Off => return None,
        LogLevel::OverLimit => |entry, max| entry.iterations >= max,
        LogLevel::All => |_, _| true,
    };

    let mut log = String::from("\tGUIDS\t\t|\tIterations\n");
    log.push_str("========================|========================\n");
    for entry in iterations.iter().filter(|e| include(e, max_iterations)) {
        log.push_str(&format!("\t{}\t|\t{}\n", entry.guid, entry.iterations));
    }
    Some(log)
}

fn timestamp(now: &DateTime<Local>) -> String {
    now.format("%Y_%-m_%-d-%-H-%-M-%-S").to_string()
}

/// Output file used when none is given: `_ExportSureDoneEPID_<timestamp>.csv`.
pub fn default_output_file(now: &DateTime<Local>) -> PathBuf {
    PathBuf::from(format!("_ExportSureDoneEPID_{}.csv", timestamp(now)))
}

/// Iteration log file: `exportsuredoneepid-log_<timestamp>.csv.log`.
pub fn default_log_file(now: &DateTime<Local>) -> PathBuf {
    PathBuf::from(format!("exportsuredoneepid-log_{}.csv.log", timestamp(now)))
}

fn is_csv(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "csv")
}

/// Reads `input`, writes the grouped rows to `output` and, unless logging is
/// off, the iteration log to `log_file`.
#[tracing::instrument(skip(runtime, options))]
pub fn rearrange<R: Runtime>(
    runtime: &R,
    input: &Path,
    output: &Path,
    log_file: &Path,
    options: &RearrangeOptions,
) -> Result<RearrangeSummary> {
    if !is_csv(input) {
        bail!("Only CSV files are allowed (.csv): {:?}", input);
    }
    if !runtime.exists(input) {
        bail!("The input file {:?} does not exist", input);
    }
    if !is_csv(output) {
        bail!("Only CSV files are allowed (.csv): {:?}", output);
    }

    let text = runtime.read_to_string(input)?;
    let mut rows = read_rows(&text).with_context(|| format!("Failed to read {:?}", input))?;
    sort_rows(&mut rows);
    info!("Read {} rows from {:?}", rows.len(), input);

    let grouped = group_rows(&rows, options.max_iterations);
    let capped = grouped
        .iterations
        .iter()
        .filter(|entry| entry.iterations > options.max_iterations)
        .count();
    if capped > 0 {
        warn!(
            "{} GUIDs had more than {} EPIDs, extra rows were dropped",
            capped, options.max_iterations
        );
    }

    write_edit_rows(runtime.create_file(output)?, &grouped.rows)
        .with_context(|| format!("Failed to write {:?}", output))?;
    info!("Wrote {} GUIDs to {:?}", grouped.rows.len(), output);

    let log_written =
        match format_iteration_log(&grouped.iterations, options.max_iterations, options.log_level) {
            Some(log) => {
                let mut writer = runtime.create_file(log_file)?;
                writer
                    .write_all(log.as_bytes())
                    .and_then(|_| writer.flush())
                    .with_context(|| format!("Failed to write log file {:?}", log_file))?;
                Some(log_file.to_path_buf())
            }
            None => None,
        };

    Ok(RearrangeSummary {
        rows_read: rows.len(),
        guids: grouped.rows.len(),
        capped,
        log_file: log_written,
    })
}
