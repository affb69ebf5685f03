use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ridesync_core::{DateWindow, Granularity, PartitionKey};
use ridesync_engine::{
    DatasetRegistry, EngineConfig, LogProgress, PlanFilter, ProgressSink, SyncEngine,
};
use ridesync_soda::{
    RemoteSource, SodaClient, SodaCredentials, DEFAULT_PAGE_SIZE, DEFAULT_TIMEOUT,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ridesync")]
#[command(about = "Synchronize partitioned SODA datasets into local CSV files")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// Root directory for canonical CSV files and sync state.
    #[arg(long, default_value = "data/raw")]
    data_root: PathBuf,

    /// JSON file mapping years to dataset ids.
    #[arg(long, default_value = "datasets.json")]
    registry: PathBuf,

    /// Time column the datasets are partitioned and ordered by.
    #[arg(long, default_value = "transit_timestamp")]
    ts_column: String,

    /// Columns pinned to the front of the CSV header when present.
    #[arg(long = "column")]
    columns: Vec<String>,

    /// Extra `$order` columns between the time column and `:id`.
    #[arg(long = "tie-breaker")]
    tie_breakers: Vec<String>,

    /// Socrata application token; falls back to SOCRATA_APP_TOKEN.
    #[arg(long)]
    app_token: Option<String>,

    /// Socrata secret token; falls back to SOCRATA_SECRET_TOKEN.
    #[arg(long)]
    secret_token: Option<String>,

    /// Rows per page request.
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Concurrent partition workers; defaults to the CPU count minus one.
    #[arg(long)]
    max_workers: Option<usize>,

    /// Plain log output instead of progress bars.
    #[arg(long)]
    plain: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync month partitions against the remote counts.
    Monthly(SyncArgs),
    /// Sync year partitions; the newest registered year grows incrementally.
    Yearly(SyncArgs),
    /// One-off export of a day, month, or year window to a CSV file.
    Fetch(FetchArgs),
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Years to sync; all registered years when omitted.
    #[arg(long = "year")]
    years: Vec<i32>,

    /// Months to sync; all twelve when omitted. Ignored for yearly runs.
    #[arg(long = "month")]
    months: Vec<u32>,

    /// Re-download partitions whose local row count already matches.
    #[arg(long)]
    force: bool,

    /// Audit each download for exact duplicate rows before committing.
    #[arg(long)]
    verify_duplicates: bool,
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// Dataset id to export from.
    #[arg(long)]
    dataset: String,

    #[arg(long)]
    year: i32,

    #[arg(long)]
    month: Option<u32>,

    /// Day of the month; requires --month.
    #[arg(long, requires = "month")]
    day: Option<u32>,

    /// Output CSV path.
    #[arg(long)]
    output: PathBuf,
}

/// One indicatif bar per partition, shared across the scheduler's workers.
struct BarProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<PartitionKey, ProgressBar>>,
}

impl BarProgress {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bars(&self) -> MutexGuard<'_, HashMap<PartitionKey, ProgressBar>> {
        match self.bars.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn bar(&self, key: PartitionKey) -> ProgressBar {
        self.bars()
            .entry(key)
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_prefix(key.to_string());
                bar.set_style(
                    ProgressStyle::with_template("{prefix:>8} {spinner} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                bar
            })
            .clone()
    }

    fn finish_all(&self) {
        for bar in self.bars().values() {
            bar.finish();
        }
        let _ = self.multi.clear();
    }
}

impl ProgressSink for BarProgress {
    fn status(&self, key: PartitionKey, phase: &str) {
        self.bar(key).set_message(phase.to_string());
    }

    fn rows(&self, key: PartitionKey, fetched: u64, expected: u64) {
        let bar = self.bar(key);
        if bar.length() != Some(expected) {
            bar.set_length(expected);
            bar.set_style(
                ProgressStyle::with_template("{prefix:>8} {bar:30} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
        }
        bar.set_position(fetched);
    }

    fn note(&self, message: &str) {
        let _ = self.multi.println(message);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn default_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

fn build_engine(
    common: &CommonArgs,
    registry: DatasetRegistry,
    remote: Arc<dyn RemoteSource>,
    args: &SyncArgs,
) -> (SyncEngine, Option<Arc<BarProgress>>) {
    let mut config = EngineConfig::new(&common.data_root, &common.ts_column);
    config.preferred_columns = common.columns.clone();
    config.tie_breakers = common.tie_breakers.clone();
    config.page_size = common.page_size;
    config.max_workers = common.max_workers.unwrap_or_else(default_workers);
    config.force = args.force;
    config.verify_duplicates = args.verify_duplicates;

    let bars = if common.plain {
        None
    } else {
        Some(Arc::new(BarProgress::new()))
    };
    let progress: Arc<dyn ProgressSink> = match &bars {
        Some(bars) => Arc::clone(bars) as Arc<dyn ProgressSink>,
        None => Arc::new(LogProgress),
    };
    (SyncEngine::new(config, registry, remote, progress), bars)
}

async fn run_sync(
    common: &CommonArgs,
    remote: Arc<dyn RemoteSource>,
    granularity: Granularity,
    args: &SyncArgs,
) -> Result<bool> {
    let registry = DatasetRegistry::load(&common.registry)?;
    let (engine, bars) = build_engine(common, registry, remote, args);
    let filter = PlanFilter {
        years: (!args.years.is_empty()).then(|| args.years.clone()),
        months: (!args.months.is_empty()).then(|| args.months.clone()),
    };

    let summary = engine.run(granularity, &filter).await?;
    if let Some(bars) = bars {
        bars.finish_all();
    }

    println!(
        "run {}: downloaded {}, skipped {}, incomplete {}, errors {}",
        summary.run_id, summary.downloaded, summary.skipped, summary.incomplete, summary.errors
    );
    for report in summary.reports.iter().filter(|r| r.mode.is_error()) {
        eprintln!("{}: {}", report.partition.key, report.message);
    }
    Ok(summary.is_success())
}

async fn run_fetch(
    common: &CommonArgs,
    remote: Arc<dyn RemoteSource>,
    args: &FetchArgs,
) -> Result<bool> {
    let window = match (args.month, args.day) {
        (Some(month), Some(day)) => DateWindow::day(args.year, month, day)?,
        (Some(month), None) => DateWindow::month(args.year, month)?,
        (None, _) => DateWindow::year(args.year)?,
    };

    // No registry file needed for a one-off export.
    let mut datasets = BTreeMap::new();
    datasets.insert(args.year, args.dataset.clone());
    let sync_defaults = SyncArgs {
        years: Vec::new(),
        months: Vec::new(),
        force: false,
        verify_duplicates: false,
    };
    let (engine, bars) = build_engine(common, DatasetRegistry::new(datasets), remote, &sync_defaults);
    let rows = engine
        .fetch_window(&args.dataset, &window, &args.output)
        .await?;
    if let Some(bars) = bars {
        bars.finish_all();
    }
    if rows == 0 {
        println!("no rows in the requested window; nothing written");
    } else {
        println!("wrote {rows} rows to {}", args.output.display());
    }
    Ok(true)
}

async fn run() -> Result<bool> {
    let cli = Cli::parse();
    init_tracing();

    let credentials = SodaCredentials::from_env()
        .with_overrides(cli.common.app_token.clone(), cli.common.secret_token.clone());
    let remote: Arc<dyn RemoteSource> = Arc::new(SodaClient::new(&credentials, DEFAULT_TIMEOUT)?);

    match &cli.command {
        Commands::Monthly(args) => run_sync(&cli.common, remote, Granularity::Month, args).await,
        Commands::Yearly(args) => run_sync(&cli.common, remote, Granularity::Year, args).await,
        Commands::Fetch(args) => run_fetch(&cli.common, remote, args).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
