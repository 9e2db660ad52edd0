use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::time::Duration;
use suredone_dl::api::{API_ENDPOINT, ApiClient, RetryPolicy};
use suredone_dl::config::load_credentials;
use suredone_dl::export::ExportWorkflow;
use suredone_dl::paths::default_download_dir;
use suredone_dl::rearrange::{
    DEFAULT_MAX_ITERATIONS, LogLevel, RearrangeOptions, default_log_file, default_output_file,
    max_iterations, rearrange,
};
use suredone_dl::runtime::RealRuntime;

/// suredone-dl - SureDone bulk downloader
///
/// Requests a bulk export of store items, waits for the export file to be
/// prepared and saves it as SureDone_<file> in the download directory.
/// Earlier SureDone_* downloads in that directory are removed first.
///
/// Credentials are read from suredone.yaml (keys `user` and `token`), looked
/// up in the current directory and then in the home directory
/// (%LOCALAPPDATA% on Windows).
///
/// `suredone-dl rearrange` instead turns a fitment CSV into SureDone bulk
/// edit rows; see `suredone-dl rearrange --help`.
#[derive(Parser, Debug)]
#[command(
    author,
    version = env!("SUREDONE_DL_VERSION"),
    about,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Seconds to wait for each API response before timing out
    #[arg(
        short = 'w',
        long = "wait",
        value_name = "SECONDS",
        default_value_t = 15.0,
        value_parser = parse_wait
    )]
    wait: f64,

    /// Path to the suredone.yaml configuration file
    #[arg(short = 'f', long = "file", env = "SUREDONE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory the export is saved into
    #[arg(short = 'o', long = "output-dir", value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Write log output to this file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// SureDone API URL (defaults to https://api.suredone.com/v1/)
    #[arg(long = "api-url", env = "SUREDONE_API_URL", value_name = "URL")]
    api_url: Option<String>,

    /// Give up after this many rate-limit waits in a single call (default: wait forever)
    #[arg(long = "max-rate-limit-waits", value_name = "N")]
    max_rate_limit_waits: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Group a fitment CSV by GUID into SureDone `edit` rows
    ///
    /// Reads a CSV whose first three columns are guid, EPID and an optional
    /// note, and writes `action,guid,ebayepid` rows where ebayepid lists the
    /// GUID's EPIDs as `epid::note*epid*...`.
    Rearrange(RearrangeArgs),
}

#[derive(Args, Debug)]
struct RearrangeArgs {
    /// Source CSV file
    #[arg(short = 'f', long = "file", value_name = "CSV")]
    file: PathBuf,

    /// Output CSV file (default: _ExportSureDoneEPID_<timestamp>.csv)
    #[arg(short = 'o', long = "output-file", alias = "output_file", value_name = "CSV")]
    output_file: Option<PathBuf>,

    /// EPIDs kept per GUID; values below 1 use the default
    #[arg(
        short = 'i',
        long = "max-iterations",
        alias = "max_iterations",
        value_name = "N",
        default_value_t = DEFAULT_MAX_ITERATIONS as i64,
        allow_negative_numbers = true
    )]
    max_iterations: i64,

    /// Report progress while grouping
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Iteration log: 0 none, 1 GUIDs over the limit, 2 every GUID
    #[arg(short = 'l', long = "log", value_name = "LEVEL", default_value_t = 0)]
    log: u8,
}

fn parse_wait(value: &str) -> Result<f64, String> {
    let seconds: f64 = value
        .parse()
        .map_err(|_| format!("{} is not a number of seconds", value))?;
    if seconds > 0.0 {
        Ok(seconds)
    } else {
        Err(format!("{} must be greater than zero", value))
    }
}

impl Cli {
    fn timeout(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.wait)
            .with_context(|| format!("Invalid wait time: {}", self.wait))
    }
}

fn init_logging(log_file: Option<&PathBuf>, default_filter: &str) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter));
    if let Some(path) = log_file {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to open log file {:?}", path))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Some(Command::Rearrange(args)) = &cli.command {
        return run_rearrange(args);
    }
    run_export(cli).await
}

fn run_rearrange(args: &RearrangeArgs) -> Result<()> {
    init_logging(None, if args.verbose { "debug" } else { "info" })?;

    let now = Local::now();
    let output = args
        .output_file
        .clone()
        .unwrap_or_else(|| default_output_file(&now));
    let options = RearrangeOptions {
        max_iterations: max_iterations(args.max_iterations),
        log_level: LogLevel::from_level(args.log),
    };
    info!(
        "Rearranging {:?} into {:?} (max iterations per GUID: {}, log: {:?})",
        args.file, output, options.max_iterations, options.log_level
    );

    let summary = rearrange(
        &RealRuntime,
        &args.file,
        &output,
        &default_log_file(&now),
        &options,
    )?;

    println!("Saved {} GUIDs to {}", summary.guids, output.display());
    if let Some(log_file) = summary.log_file {
        println!("Iteration log saved to {}", log_file.display());
    }
    Ok(())
}

async fn run_export(cli: Cli) -> Result<()> {
    init_logging(cli.log_file.as_ref(), "info")?;

    let timeout = cli.timeout()?;
    info!("SureDone bulk downloader");
    info!("Wait time: {:?}", timeout);

    let runtime = RealRuntime;
    let credentials = load_credentials(&runtime, cli.config.as_deref())?;

    let policy = RetryPolicy {
        max_rate_limit_waits: cli.max_rate_limit_waits,
        ..RetryPolicy::default()
    };
    let api = ApiClient::new(&credentials, timeout)?
        .with_base_url(cli.api_url.as_deref().unwrap_or(API_ENDPOINT))
        .with_policy(policy);

    let output_dir = match cli.output_dir {
        Some(dir) => dir,
        None => default_download_dir(&runtime)?,
    };

    let http = reqwest::Client::builder()
        .build()
        .context("Failed to build download client")?;
    let saved = ExportWorkflow::new(runtime, api, http)
        .run(&output_dir)
        .await?;

    println!("Saved to {}", saved.display());
    Ok(())
}
