//! Command-line front end for the ardtrack job tracker.

use anyhow::{Context, Result};
use ardtrack_core::config::AppConfig;
use ardtrack_core::{
    DateRange, JobParameters, JobStatus, RecordFilter, SensorId, TileId, TrackingName,
    TrackingRecord,
};
use ardtrack_tracker::{BatchReport, CleanOptions, RecordAction, SubmitOutcome, Tracker};
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::path::{Path, PathBuf};
use time::Date;
use time::format_description::BorrowedFormatItem;
use time::macros::{date, format_description};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

#[derive(Parser)]
#[command(name = "ardtrack")]
#[command(about = "Submit and track satellite imagery processing jobs")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(
        long,
        env = "ARDTRACK_CONFIG",
        default_value = "ardtrack.toml",
        global = true
    )]
    config: PathBuf,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit one job per sensor, tile and period
    Submit(SubmitArgs),
    /// Reconcile open jobs with the remote service
    Update {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// List tracking records
    List {
        #[command(flatten)]
        filter: FilterArgs,
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show record counts per status
    Status {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Copy completed outputs to their destination
    Download {
        #[command(flatten)]
        filter: FilterArgs,
        /// Fetch again even if already downloaded
        #[arg(long)]
        overwrite: bool,
    },
    /// Remove finished tracking records
    Clean {
        #[command(flatten)]
        filter: FilterArgs,
        /// Also delete staged outputs
        #[arg(long)]
        remove_artifacts: bool,
    },
    /// Cancel unfinished jobs
    Cancel {
        #[command(flatten)]
        filter: FilterArgs,
    },
}

#[derive(Args)]
struct SubmitArgs {
    /// Tile id (repeatable)
    #[arg(long = "tile", value_parser = parse_tile)]
    tiles: Vec<TileId>,

    /// Grid tile as H,V, rendered as hHHHvVVV (repeatable)
    #[arg(long = "grid", value_parser = parse_grid)]
    grids: Vec<TileId>,

    /// First acquisition date (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    from: Date,

    /// Last acquisition date (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    to: Date,

    /// Sensor or image collection id (repeatable)
    #[arg(long = "sensor", value_parser = parse_sensor)]
    sensors: Vec<SensorId>,

    /// Split the date range into periods of this many months, one job each
    #[arg(long, value_name = "MONTHS")]
    period_months: Option<u32>,

    /// Band to export (repeatable)
    #[arg(long = "band")]
    bands: Vec<String>,

    /// Destination path template, e.g. "{tile}/{name}.tif"
    #[arg(long)]
    destination: Option<String>,

    /// Export option as KEY=VALUE; VALUE is parsed as JSON when possible (repeatable)
    #[arg(long = "option", value_parser = parse_option)]
    options: Vec<(String, serde_json::Value)>,

    /// Replace existing records and their remote jobs
    #[arg(long)]
    overwrite: bool,
}

#[derive(Args, Clone, Default)]
struct FilterArgs {
    /// Only records with this status (repeatable)
    #[arg(long = "status", value_parser = parse_status)]
    statuses: Vec<JobStatus>,

    /// Only records for this tile
    #[arg(long, value_parser = parse_tile)]
    tile: Option<TileId>,

    /// Only records for this sensor
    #[arg(long, value_parser = parse_sensor)]
    sensor: Option<SensorId>,

    /// Only records whose date range ends on or after this date (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    from: Option<Date>,

    /// Only records whose date range starts on or before this date (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    to: Option<Date>,

    /// Only the record with this name (repeatable)
    #[arg(long = "name", value_parser = parse_name)]
    names: Vec<TrackingName>,
}

impl FilterArgs {
    fn to_filter(&self) -> Result<RecordFilter> {
        let mut filter = RecordFilter::all();
        for status in &self.statuses {
            filter = filter.with_status(*status);
        }
        for name in &self.names {
            filter = filter.with_name(name.clone());
        }
        if let Some(tile) = &self.tile {
            filter = filter.with_tile(tile.clone());
        }
        if let Some(sensor) = &self.sensor {
            filter = filter.with_sensor(sensor.clone());
        }
        if self.from.is_some() || self.to.is_some() {
            let start = self.from.unwrap_or(date!(0001 - 01 - 01));
            let end = self.to.unwrap_or(date!(9999 - 12 - 31));
            let range = DateRange::new(start, end).context("invalid --from/--to range")?;
            filter = filter.with_date_range(range);
        }
        Ok(filter)
    }
}

fn parse_date(s: &str) -> Result<Date, String> {
    Date::parse(s, DATE_FORMAT).map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

fn parse_tile(s: &str) -> Result<TileId, String> {
    TileId::new(s).map_err(|e| e.to_string())
}

fn parse_grid(s: &str) -> Result<TileId, String> {
    let (h, v) = s
        .split_once(',')
        .ok_or_else(|| format!("expected H,V, got {s:?}"))?;
    let h = h.trim().parse().map_err(|e| format!("invalid horizontal index: {e}"))?;
    let v = v.trim().parse().map_err(|e| format!("invalid vertical index: {e}"))?;
    Ok(TileId::from_grid(h, v))
}

fn parse_sensor(s: &str) -> Result<SensorId, String> {
    SensorId::new(s).map_err(|e| e.to_string())
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    s.parse().map_err(|e: ardtrack_core::Error| e.to_string())
}

fn parse_name(s: &str) -> Result<TrackingName, String> {
    TrackingName::new(s).map_err(|e| e.to_string())
}

fn parse_option(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    if key.is_empty() {
        return Err("option key cannot be empty".to_string());
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Load configuration: optional TOML file, then `ARDTRACK_` environment overrides.
fn load_config(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if path.exists() {
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!(path = %path.display(), "Config file not found, using defaults and environment");
    }
    figment = figment.merge(Env::prefixed("ARDTRACK_").split("__"));

    let config: AppConfig = figment
        .extract()
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        config,
        verbose,
        command,
    } = Cli::parse();
    init_tracing(verbose);

    let config = load_config(&config)?;
    let tracker = ardtrack_tracker::from_config(&config)
        .await
        .context("failed to initialize tracker")?;

    match command {
        Commands::Submit(args) => handle_submit(&tracker, args).await,
        Commands::Update { filter } => {
            let report = tracker.update(&filter.to_filter()?).await?;
            print_report("update", &report)
        }
        Commands::List { filter, json } => {
            let records = tracker.list(&filter.to_filter()?).await?;
            print_records(&records, json)
        }
        Commands::Status { filter } => {
            let summary = tracker.summary(&filter.to_filter()?).await?;
            println!("{summary}");
            Ok(())
        }
        Commands::Download { filter, overwrite } => {
            let report = tracker.download(&filter.to_filter()?, overwrite).await?;
            print_report("download", &report)
        }
        Commands::Clean {
            filter,
            remove_artifacts,
        } => {
            let options = CleanOptions { remove_artifacts };
            let report = tracker.clean(&filter.to_filter()?, options).await?;
            print_report("clean", &report)
        }
        Commands::Cancel { filter } => {
            let report = tracker.cancel(&filter.to_filter()?).await?;
            print_report("cancel", &report)
        }
    }
}

/// Expand submit arguments into one parameter set per sensor, tile and period.
fn expand_jobs(args: &SubmitArgs) -> Result<Vec<JobParameters>> {
    let tiles: Vec<&TileId> = args.tiles.iter().chain(&args.grids).collect();
    if tiles.is_empty() {
        anyhow::bail!("at least one --tile or --grid is required");
    }
    let range = DateRange::new(args.from, args.to).context("invalid --from/--to range")?;
    let periods = match args.period_months {
        Some(months) => range
            .split_months(months)
            .context("invalid --period-months")?,
        None => vec![range],
    };
    let sensors: Vec<Option<&SensorId>> = if args.sensors.is_empty() {
        vec![None]
    } else {
        args.sensors.iter().map(Some).collect()
    };

    let mut jobs = Vec::with_capacity(sensors.len() * tiles.len() * periods.len());
    for sensor in &sensors {
        for tile in &tiles {
            for period in &periods {
                let mut params = JobParameters::new((*tile).clone(), *period)
                    .with_bands(args.bands.iter().cloned());
                if let Some(sensor) = sensor {
                    params = params.with_sensor((*sensor).clone());
                }
                if let Some(template) = &args.destination {
                    params = params.with_destination_template(template.clone());
                }
                for (key, value) in &args.options {
                    params = params.with_export_option(key.clone(), value.clone());
                }
                jobs.push(params);
            }
        }
    }
    Ok(jobs)
}

async fn handle_submit(tracker: &Tracker, args: SubmitArgs) -> Result<()> {
    let jobs = expand_jobs(&args)?;

    let mut failures = 0usize;
    for params in jobs {
        let label = format!("{} {}", params.tile, params.date_range);
        match tracker.submit(params, args.overwrite).await {
            Ok(SubmitOutcome::Submitted(record)) => {
                println!("submitted {} (job {})", record.name, record.remote_job_id);
            }
            Ok(SubmitOutcome::Replaced { record, previous }) => {
                println!(
                    "resubmitted {} (job {}, was {previous})",
                    record.name, record.remote_job_id
                );
            }
            Ok(SubmitOutcome::Existing(record)) => {
                println!("exists {} ({})", record.name, record.status);
            }
            Err(e) if e.is_fatal() => {
                return Err(anyhow::anyhow!(e).context("submission aborted"));
            }
            Err(e) => {
                eprintln!("{label}: error: {e}");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} submission(s) failed");
    }
    Ok(())
}

fn describe(action: &RecordAction) -> String {
    match action {
        RecordAction::Transitioned { from, to } => format!("{from} -> {to}"),
        RecordAction::MarkedMissing => "missing from remote service".to_string(),
        RecordAction::Unchanged => "unchanged".to_string(),
        RecordAction::Stale => "skipped (changed concurrently)".to_string(),
        RecordAction::Downloaded {
            destination,
            files: 1,
            bytes,
        } => format!("downloaded {bytes} bytes to {destination}"),
        RecordAction::Downloaded {
            destination,
            files,
            bytes,
        } => format!("downloaded {files} files ({bytes} bytes) alongside {destination}"),
        RecordAction::Recovered { destination } => format!("verified existing {destination}"),
        RecordAction::Cancelled => "cancelled".to_string(),
        RecordAction::Removed { artifact_removed } => {
            if *artifact_removed {
                "removed with staged output".to_string()
            } else {
                "removed".to_string()
            }
        }
    }
}

fn print_report(verb: &str, report: &BatchReport) -> Result<()> {
    for (name, action) in &report.succeeded {
        println!("{name}: {}", describe(action));
    }
    for failure in &report.failed {
        eprintln!("{}: error: {}", failure.name, failure.error);
    }
    println!(
        "{verb}: {} succeeded, {} failed",
        report.succeeded.len(),
        report.failed.len()
    );
    if !report.is_success() {
        anyhow::bail!("{verb} failed for {} record(s)", report.failed.len());
    }
    Ok(())
}

fn print_records(records: &[TrackingRecord], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No tracking records");
        return Ok(());
    }

    let width = records
        .iter()
        .map(|r| r.name.as_str().len())
        .max()
        .unwrap_or(0)
        .max(4);
    println!(
        "{:<width$}  {:<10}  {:<19}  {:<19}  JOB",
        "NAME", "STATUS", "SUBMITTED", "UPDATED"
    );
    for record in records {
        println!(
            "{:<width$}  {:<10}  {:<19}  {:<19}  {}",
            record.name.as_str(),
            record.status.as_str(),
            format_timestamp(record.submitted_at),
            format_timestamp(record.updated_at),
            record.remote_job_id,
        );
    }
    Ok(())
}

fn format_timestamp(ts: time::OffsetDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT)
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
}
