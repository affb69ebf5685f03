//! Sync orchestration: task planning, completeness verification, paginated
//! download into staged CSV files, and the bounded concurrent scheduler.

use std::cmp;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use ridesync_core::{
    days_in_month, DateWindow, Granularity, OutcomeMode, Partition, PartitionKey, SyncState,
};
use ridesync_soda::{
    order_clause, where_after, where_window, PageQuery, RemoteSource, DEFAULT_BASE_URL,
    DEFAULT_PAGE_SIZE,
};
use ridesync_store::{
    audit_duplicates, commit_temp, count_data_rows, read_csv_header, read_last_timestamp,
    remove_if_present, update_metadata, CsvSink, MetadataEntry, PartitionLayout, SinkReport,
    StateStore, DEFAULT_DUPLICATE_SAMPLE_LIMIT,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ridesync-engine";

/// Public landing page for a dataset.
pub fn dataset_url(dataset_id: &str) -> String {
    format!("{DEFAULT_BASE_URL}/d/{dataset_id}")
}

/// Year to dataset-id mapping loaded from a JSON object. Non-numeric year
/// keys are logged and ignored; a registry with no usable entries is an
/// error.
#[derive(Debug, Clone, Default)]
pub struct DatasetRegistry {
    datasets: BTreeMap<i32, String>,
}

impl DatasetRegistry {
    pub fn new(datasets: BTreeMap<i32, String>) -> Self {
        Self { datasets }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let raw: BTreeMap<String, String> =
            serde_json::from_str(text).context("dataset registry is not a JSON string map")?;
        let mut datasets = BTreeMap::new();
        for (year, dataset_id) in raw {
            let Ok(year) = year.parse::<i32>() else {
                warn!(key = %year, "ignoring non-numeric year key in dataset registry");
                continue;
            };
            datasets.insert(year, dataset_id);
        }
        if datasets.is_empty() {
            bail!("dataset registry contains no usable year entries");
        }
        Ok(Self { datasets })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading dataset registry {}", path.display()))?;
        Self::from_json_str(&text)
    }

    pub fn dataset_for(&self, year: i32) -> Option<&str> {
        self.datasets.get(&year).map(String::as_str)
    }

    /// Registered years in ascending order.
    pub fn years(&self) -> Vec<i32> {
        self.datasets.keys().copied().collect()
    }

    /// The newest registered year, the only one synced incrementally.
    pub fn current_year(&self) -> Option<i32> {
        self.datasets.keys().next_back().copied()
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_root: PathBuf,
    pub ts_column: String,
    /// Columns pinned to the front of the CSV header when present.
    pub preferred_columns: Vec<String>,
    /// Extra `$order` columns between the time column and `:id`.
    pub tie_breakers: Vec<String>,
    pub page_size: usize,
    pub max_workers: usize,
    /// Re-download partitions whose local row count already matches.
    pub force: bool,
    pub verify_duplicates: bool,
    pub duplicate_sample_limit: usize,
}

impl EngineConfig {
    pub fn new(data_root: impl Into<PathBuf>, ts_column: impl Into<String>) -> Self {
        Self {
            data_root: data_root.into(),
            ts_column: ts_column.into(),
            preferred_columns: Vec::new(),
            tie_breakers: Vec::new(),
            page_size: DEFAULT_PAGE_SIZE,
            max_workers: 4,
            force: false,
            verify_duplicates: false,
            duplicate_sample_limit: DEFAULT_DUPLICATE_SAMPLE_LIMIT,
        }
    }
}

/// Where per-task progress goes. The CLI renders progress bars; everything
/// else funnels into the log stream via [`LogProgress`].
pub trait ProgressSink: Send + Sync {
    /// Short human-readable phase for one partition.
    fn status(&self, key: PartitionKey, phase: &str);

    /// Rows fetched so far against the remote count.
    fn rows(&self, key: PartitionKey, fetched: u64, expected: u64);

    /// Out-of-band message not tied to one partition's progress display.
    fn note(&self, message: &str);
}

#[derive(Debug, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn status(&self, key: PartitionKey, phase: &str) {
        info!(partition = %key, phase, "sync");
    }

    fn rows(&self, key: PartitionKey, fetched: u64, expected: u64) {
        debug!(partition = %key, fetched, expected, "progress");
    }

    fn note(&self, message: &str) {
        info!("{message}");
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanFilter {
    pub years: Option<Vec<i32>>,
    pub months: Option<Vec<u32>>,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub tasks: Vec<Partition>,
    /// Partitions dropped because they start after `today`.
    pub skipped_future: usize,
}

/// Expand the registry and filters into an ordered task list. Pure: no
/// network, no filesystem. Requested years missing from the registry and
/// out-of-range months fail before anything is scheduled.
pub fn plan_tasks(
    registry: &DatasetRegistry,
    granularity: Granularity,
    filter: &PlanFilter,
    today: NaiveDate,
) -> Result<Plan> {
    let years = match &filter.years {
        Some(requested) => {
            let mut years = requested.clone();
            years.sort_unstable();
            years.dedup();
            for year in &years {
                if registry.dataset_for(*year).is_none() {
                    bail!("no dataset registered for year {year}");
                }
            }
            years
        }
        None => registry.years(),
    };
    let months: Vec<u32> = match (granularity, &filter.months) {
        (Granularity::Year, _) => Vec::new(),
        (Granularity::Month, Some(requested)) => {
            let mut months = requested.clone();
            months.sort_unstable();
            months.dedup();
            for month in &months {
                if !(1..=12).contains(month) {
                    bail!("invalid month {month}");
                }
            }
            months
        }
        (Granularity::Month, None) => (1..=12).collect(),
    };

    let mut tasks = Vec::new();
    let mut skipped_future = 0;
    for year in years {
        let Some(dataset_id) = registry.dataset_for(year) else {
            continue;
        };
        let keys: Vec<PartitionKey> = match granularity {
            Granularity::Year => vec![PartitionKey::year(year)],
            Granularity::Month => months
                .iter()
                .map(|&month| PartitionKey::month(year, month))
                .collect(),
        };
        for key in keys {
            if key.starts_after(today) {
                skipped_future += 1;
                continue;
            }
            tasks.push(Partition::new(dataset_id, key));
        }
    }
    Ok(Plan {
        tasks,
        skipped_future,
    })
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub partition: Partition,
    pub mode: OutcomeMode,
    pub rows_added: u64,
    pub row_count: u64,
    pub last_ts: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub downloaded: usize,
    pub skipped: usize,
    pub incomplete: usize,
    pub errors: usize,
    pub reports: Vec<TaskReport>,
}

impl RunSummary {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            downloaded: 0,
            skipped: 0,
            incomplete: 0,
            errors: 0,
            reports: Vec::new(),
        }
    }

    fn absorb(&mut self, report: TaskReport) {
        match report.mode {
            OutcomeMode::Downloaded | OutcomeMode::Incremental | OutcomeMode::FullRefresh => {
                self.downloaded += 1
            }
            OutcomeMode::Skipped | OutcomeMode::Match | OutcomeMode::NoNewRows => self.skipped += 1,
            OutcomeMode::Empty | OutcomeMode::Incomplete => self.incomplete += 1,
            OutcomeMode::Errors => self.errors += 1,
        }
        self.reports.push(report);
    }

    pub fn is_success(&self) -> bool {
        self.errors == 0
    }
}

/// Day-level coverage of a month window on the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletenessReport {
    pub first_day_rows: u64,
    pub last_day_rows: u64,
    pub days_observed: u64,
    pub days_expected: u32,
}

impl CompletenessReport {
    pub fn is_complete(&self) -> bool {
        self.first_day_rows > 0
            && self.last_day_rows > 0
            && self.days_observed == u64::from(self.days_expected)
    }

    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.first_day_rows == 0 {
            issues.push("no rows on the first day".to_string());
        }
        if self.last_day_rows == 0 {
            issues.push("no rows on the last day".to_string());
        }
        if self.days_observed != u64::from(self.days_expected) {
            issues.push(format!(
                "{} of {} days have rows",
                self.days_observed, self.days_expected
            ));
        }
        issues
    }
}

/// Probe first-day and last-day counts plus distinct-day coverage. Cheap
/// heuristic: it catches a month the remote has only partially loaded without
/// scanning any rows.
pub async fn verify_month(
    remote: &dyn RemoteSource,
    dataset_id: &str,
    ts_column: &str,
    year: i32,
    month: u32,
) -> Result<CompletenessReport> {
    let days_expected = days_in_month(year, month)?;
    let first = DateWindow::day(year, month, 1)?;
    let last = DateWindow::day(year, month, days_expected)?;
    let whole = DateWindow::month(year, month)?;
    let first_day_rows = remote
        .count(dataset_id, &where_window(ts_column, &first))
        .await?;
    let last_day_rows = remote
        .count(dataset_id, &where_window(ts_column, &last))
        .await?;
    let days_observed = remote
        .distinct_days(dataset_id, ts_column, &where_window(ts_column, &whole))
        .await?;
    Ok(CompletenessReport {
        first_day_rows,
        last_day_rows,
        days_observed,
        days_expected,
    })
}

/// Drives a full run: plans tasks, executes them on a bounded number of
/// concurrent workers, persists per-partition state after every attempt, and
/// rolls yearly results into the metadata file.
#[derive(Clone)]
pub struct SyncEngine {
    config: EngineConfig,
    registry: DatasetRegistry,
    remote: Arc<dyn RemoteSource>,
    progress: Arc<dyn ProgressSink>,
    layout: PartitionLayout,
    state: StateStore,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        registry: DatasetRegistry,
        remote: Arc<dyn RemoteSource>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        let layout = PartitionLayout::new(config.data_root.clone());
        let state = StateStore::new(layout.clone());
        Self {
            config,
            registry,
            remote,
            progress,
            layout,
            state,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }

    pub fn plan(
        &self,
        granularity: Granularity,
        filter: &PlanFilter,
        today: NaiveDate,
    ) -> Result<Plan> {
        plan_tasks(&self.registry, granularity, filter, today)
    }

    pub async fn run(&self, granularity: Granularity, filter: &PlanFilter) -> Result<RunSummary> {
        let plan = self.plan(granularity, filter, Utc::now().date_naive())?;
        self.run_plan(plan).await
    }

    pub async fn run_plan(&self, plan: Plan) -> Result<RunSummary> {
        let mut summary = RunSummary::new();
        summary.skipped += plan.skipped_future;
        if plan.tasks.is_empty() {
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        let permits = cmp::min(self.config.max_workers.max(1), plan.tasks.len());
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut join_set = JoinSet::new();
        for partition in plan.tasks {
            let engine = self.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return TaskReport {
                        partition,
                        mode: OutcomeMode::Errors,
                        rows_added: 0,
                        row_count: 0,
                        last_ts: None,
                        message: "scheduler semaphore closed".to_string(),
                    };
                };
                engine.run_task(partition).await
            });
        }
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(report) => summary.absorb(report),
                Err(err) => {
                    warn!("sync task aborted: {err}");
                    summary.errors += 1;
                }
            }
        }
        summary.finished_at = Utc::now();
        self.write_metadata(&summary)?;
        info!(
            downloaded = summary.downloaded,
            skipped = summary.skipped,
            incomplete = summary.incomplete,
            errors = summary.errors,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn run_task(&self, partition: Partition) -> TaskReport {
        let key = partition.key;
        let result = match key.granularity() {
            Granularity::Month => self.sync_month(&partition).await,
            Granularity::Year => self.sync_year(&partition).await,
        };
        let report = match result {
            Ok(report) => report,
            Err(err) => {
                let _ = remove_if_present(&self.layout.temp_path(&key));
                self.progress.status(key, "error");
                warn!(partition = %key, "sync task failed: {err:#}");
                TaskReport {
                    partition: partition.clone(),
                    mode: OutcomeMode::Errors,
                    rows_added: 0,
                    row_count: count_data_rows(&self.layout.canonical_path(&key)).unwrap_or(0),
                    last_ts: None,
                    message: format!("{err:#}"),
                }
            }
        };

        // The state record is rewritten after every attempt, errors included.
        let state = SyncState {
            dataset_id: report.partition.dataset_id.clone(),
            partition: key.to_string(),
            ts_column: self.config.ts_column.clone(),
            last_ts: report.last_ts.clone(),
            rows_added: report.rows_added,
            row_count: report.row_count,
            last_retrieved: Utc::now(),
            mode: report.mode,
        };
        if let Err(err) = self.state.save(&key, &state) {
            warn!(partition = %key, "failed to persist sync state: {err:#}");
        }
        report
    }

    async fn sync_month(&self, partition: &Partition) -> Result<TaskReport> {
        let key = partition.key;
        let Some(month) = key.month else {
            bail!("month task without a month component");
        };
        let ts = self.config.ts_column.as_str();
        let window = key.window()?;
        let where_clause = where_window(ts, &window);
        let canonical = self.layout.canonical_path(&key);
        let temp = self.layout.temp_path(&key);

        self.progress.status(key, "counting remote rows");
        let remote_rows = self.remote.count(&partition.dataset_id, &where_clause).await?;
        if remote_rows == 0 {
            remove_if_present(&temp)?;
            remove_if_present(&canonical)?;
            self.progress.status(key, "no data");
            return Ok(self.report(
                partition,
                OutcomeMode::Empty,
                0,
                0,
                None,
                "no rows in the remote window",
            ));
        }

        self.progress.status(key, "checking completeness");
        let completeness =
            verify_month(self.remote.as_ref(), &partition.dataset_id, ts, key.year, month).await?;
        if !completeness.is_complete() {
            // A partially loaded month must not linger locally looking whole.
            remove_if_present(&temp)?;
            remove_if_present(&canonical)?;
            self.progress.status(key, "incomplete");
            return Ok(self.report(
                partition,
                OutcomeMode::Incomplete,
                0,
                0,
                None,
                completeness.issues().join("; "),
            ));
        }

        if !self.config.force && canonical.is_file() {
            self.progress.status(key, "validating local copy");
            let local_rows = count_data_rows(&canonical)?;
            if local_rows == remote_rows {
                self.progress.status(key, "up to date");
                return Ok(self.report(
                    partition,
                    OutcomeMode::Skipped,
                    0,
                    local_rows,
                    read_last_timestamp(&canonical, ts).ok().flatten(),
                    "local row count matches the remote",
                ));
            }
            info!(partition = %key, local_rows, remote_rows, "row count drift, re-downloading");
        }

        self.progress.status(key, "downloading");
        self.progress.rows(key, 0, remote_rows);
        remove_if_present(&temp)?;
        let sink = CsvSink::create(&temp, ts, &self.config.preferred_columns)?;
        let fetched = self
            .fetch_pages(&partition.dataset_id, &where_clause, sink, key, remote_rows)
            .await?;
        if fetched.rows_written == 0 {
            remove_if_present(&temp)?;
            remove_if_present(&canonical)?;
            return Ok(self.report(
                partition,
                OutcomeMode::Incomplete,
                0,
                0,
                None,
                "remote returned no rows despite a non-zero count",
            ));
        }
        if fetched.rows_written != remote_rows {
            remove_if_present(&temp)?;
            bail!(
                "fetched {} rows but the remote reported {remote_rows}",
                fetched.rows_written
            );
        }
        if self.config.verify_duplicates {
            self.progress.status(key, "auditing duplicates");
            self.audit_staged(&temp, key, fetched.rows_written).await?;
        }
        commit_temp(&temp, &canonical)?;
        self.progress.status(key, "done");
        Ok(self.report(
            partition,
            OutcomeMode::Downloaded,
            fetched.rows_written,
            fetched.rows_written,
            fetched.last_ts,
            "downloaded",
        ))
    }

    async fn sync_year(&self, partition: &Partition) -> Result<TaskReport> {
        let key = partition.key;
        let ts = self.config.ts_column.as_str();
        let window = DateWindow::year(key.year)?;
        let canonical = self.layout.canonical_path(&key);
        let temp = self.layout.temp_path(&key);
        let local_rows = count_data_rows(&canonical)?;
        let csv_exists = canonical.is_file() && local_rows > 0;
        let header = if csv_exists {
            let header = read_csv_header(&canonical)?;
            if !header.iter().any(|column| column == ts) {
                bail!("{} has no '{ts}' column", canonical.display());
            }
            header
        } else {
            Vec::new()
        };

        if self.registry.current_year() == Some(key.year) && !self.config.force {
            return self
                .sync_year_incremental(partition, &window, &canonical, &temp, local_rows, header)
                .await;
        }

        // A closed-out year, or an explicit refresh of the current one.
        self.progress.status(key, "counting remote rows");
        let where_clause = where_window(ts, &window);
        let remote_rows = self.remote.count(&partition.dataset_id, &where_clause).await?;
        if !self.config.force && remote_rows > 0 && remote_rows == local_rows {
            self.progress.status(key, "up to date");
            return Ok(self.report(
                partition,
                OutcomeMode::Match,
                0,
                local_rows,
                read_last_timestamp(&canonical, ts).ok().flatten(),
                "local row count matches the remote",
            ));
        }
        if remote_rows == 0 {
            // Keep an empty canonical file so the year reads as synced.
            if let Some(parent) = temp.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            fs::write(&temp, b"").with_context(|| format!("truncating {}", temp.display()))?;
            commit_temp(&temp, &canonical)?;
            self.progress.status(key, "no data");
            return Ok(self.report(
                partition,
                OutcomeMode::Empty,
                0,
                0,
                None,
                "remote window is empty",
            ));
        }

        self.progress.status(key, "downloading");
        self.progress.rows(key, 0, remote_rows);
        remove_if_present(&temp)?;
        let sink = CsvSink::create(&temp, ts, &self.config.preferred_columns)?;
        let fetched = self
            .fetch_pages(&partition.dataset_id, &where_clause, sink, key, remote_rows)
            .await?;
        if fetched.rows_written != remote_rows {
            remove_if_present(&temp)?;
            bail!(
                "fetched {} rows but the remote reported {remote_rows}",
                fetched.rows_written
            );
        }
        if self.config.verify_duplicates {
            self.progress.status(key, "auditing duplicates");
            self.audit_staged(&temp, key, fetched.rows_written).await?;
        }
        commit_temp(&temp, &canonical)?;
        self.progress.status(key, "done");
        Ok(self.report(
            partition,
            OutcomeMode::FullRefresh,
            fetched.rows_written,
            fetched.rows_written,
            fetched.last_ts,
            "refreshed the whole year",
        ))
    }

    async fn sync_year_incremental(
        &self,
        partition: &Partition,
        window: &DateWindow,
        canonical: &Path,
        temp: &Path,
        local_rows: u64,
        header: Vec<String>,
    ) -> Result<TaskReport> {
        let key = partition.key;
        let ts = self.config.ts_column.as_str();
        let csv_exists = canonical.is_file() && local_rows > 0;

        // Trust the recorded cursor only when it describes this exact file;
        // otherwise recover it from the file's own last line.
        let recorded = self.state.load(&key)?;
        let last_ts = match recorded {
            Some(state)
                if state.dataset_id == partition.dataset_id
                    && state.ts_column == ts
                    && state.partition == key.to_string() =>
            {
                state.last_ts
            }
            _ if csv_exists => read_last_timestamp(canonical, ts)?,
            _ => None,
        };
        let where_clause = match &last_ts {
            Some(cursor) => where_after(ts, cursor, &window.end_ts(), false),
            None => where_after(ts, &window.start_ts(), &window.end_ts(), true),
        };

        self.progress.status(key, "counting new rows");
        let new_rows = self.remote.count(&partition.dataset_id, &where_clause).await?;
        if new_rows == 0 {
            self.progress.status(key, "up to date");
            return Ok(self.report(
                partition,
                OutcomeMode::NoNewRows,
                0,
                local_rows,
                last_ts,
                "no rows past the cursor",
            ));
        }

        self.progress.status(key, "downloading new rows");
        self.progress.rows(key, 0, new_rows);
        remove_if_present(temp)?;
        let sink = if csv_exists {
            // Append on a staged copy so the canonical file never carries a
            // partial tail.
            fs::copy(canonical, temp)
                .with_context(|| format!("staging {}", canonical.display()))?;
            CsvSink::append(temp, ts, header)?
        } else {
            CsvSink::create(temp, ts, &self.config.preferred_columns)?
        };
        let fetched = self
            .fetch_pages(&partition.dataset_id, &where_clause, sink, key, new_rows)
            .await?;
        if fetched.rows_written != new_rows {
            remove_if_present(temp)?;
            bail!(
                "fetched {} new rows but the remote reported {new_rows}",
                fetched.rows_written
            );
        }
        commit_temp(temp, canonical)?;
        self.progress.status(key, "done");
        let cursor = fetched.last_ts.or(last_ts);
        Ok(self.report(
            partition,
            OutcomeMode::Incremental,
            fetched.rows_written,
            local_rows + fetched.rows_written,
            cursor,
            "appended new rows",
        ))
    }

    /// One-off export of an arbitrary window, outside the planner and the
    /// state store. Same staging and count validation as a partition sync.
    pub async fn fetch_window(
        &self,
        dataset_id: &str,
        window: &DateWindow,
        output: &Path,
    ) -> Result<u64> {
        let ts = self.config.ts_column.as_str();
        let key = PartitionKey::month(window.start.year(), window.start.month());
        let where_clause = where_window(ts, window);
        let remote_rows = self.remote.count(dataset_id, &where_clause).await?;
        if remote_rows == 0 {
            info!(dataset_id, "no rows in the requested window");
            return Ok(0);
        }
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let mut temp = output.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        remove_if_present(&temp)?;
        let sink = CsvSink::create(&temp, ts, &self.config.preferred_columns)?;
        self.progress.rows(key, 0, remote_rows);
        let fetched = match self
            .fetch_pages(dataset_id, &where_clause, sink, key, remote_rows)
            .await
        {
            Ok(fetched) => fetched,
            Err(err) => {
                let _ = remove_if_present(&temp);
                return Err(err);
            }
        };
        if fetched.rows_written != remote_rows {
            remove_if_present(&temp)?;
            bail!(
                "fetched {} rows but the remote reported {remote_rows}",
                fetched.rows_written
            );
        }
        if let Err(err) = commit_temp(&temp, output) {
            let _ = remove_if_present(&temp);
            return Err(err);
        }
        Ok(fetched.rows_written)
    }

    async fn fetch_pages(
        &self,
        dataset_id: &str,
        where_clause: &str,
        mut sink: CsvSink,
        key: PartitionKey,
        expected: u64,
    ) -> Result<SinkReport> {
        let order = order_clause(&self.config.ts_column, &self.config.tie_breakers);
        let mut offset = 0u64;
        loop {
            let query = PageQuery {
                where_clause: where_clause.to_string(),
                order_clause: order.clone(),
                limit: self.config.page_size,
                offset,
            };
            let page = self.remote.page(dataset_id, &query).await?;
            if page.is_empty() {
                break;
            }
            let received = page.len();
            sink.write_page(&page)?;
            offset += received as u64;
            self.progress.rows(key, sink.rows_written(), expected);
            if received < self.config.page_size {
                break;
            }
        }
        sink.finish()
    }

    async fn audit_staged(&self, temp: &Path, key: PartitionKey, rows_written: u64) -> Result<()> {
        let path = temp.to_path_buf();
        let sample_limit = self.config.duplicate_sample_limit;
        let audit = tokio::task::spawn_blocking(move || audit_duplicates(&path, sample_limit))
            .await
            .context("duplicate audit task aborted")??;
        if audit.rows_scanned != rows_written {
            bail!(
                "duplicate audit scanned {} rows but {rows_written} were written",
                audit.rows_scanned
            );
        }
        if audit.duplicate_rows > 0 {
            warn!(
                partition = %key,
                duplicates = audit.duplicate_rows,
                "exact duplicate rows in the downloaded data"
            );
            for sample in &audit.samples {
                let mut object = serde_json::Map::new();
                for (column, value) in audit.header.iter().zip(sample) {
                    object.insert(column.clone(), serde_json::Value::String(value.clone()));
                }
                self.progress
                    .note(&format!("duplicate row: {}", serde_json::Value::Object(object)));
            }
        }
        Ok(())
    }

    /// Roll yearly results into `metadata.yaml`. Month partitions are not
    /// listed there; error outcomes keep whatever entry was last recorded.
    fn write_metadata(&self, summary: &RunSummary) -> Result<()> {
        let Some(current_year) = self.registry.current_year() else {
            return Ok(());
        };
        let mut entries = Vec::new();
        for report in &summary.reports {
            if report.partition.key.month.is_some() || report.mode.is_error() {
                continue;
            }
            let canonical = self.layout.canonical_path(&report.partition.key);
            if !canonical.is_file() {
                continue;
            }
            entries.push(MetadataEntry {
                file_name: format!("{}.csv", report.partition.key.year),
                dataset_id: report.partition.dataset_id.clone(),
                data_url: dataset_url(&report.partition.dataset_id),
                retrieval_date: Utc::now().format("%Y-%m-%d").to_string(),
                rows: report.row_count,
            });
        }
        if entries.is_empty() {
            return Ok(());
        }
        update_metadata(&self.layout.metadata_path(), current_year, &entries)
    }

    fn report(
        &self,
        partition: &Partition,
        mode: OutcomeMode,
        rows_added: u64,
        row_count: u64,
        last_ts: Option<String>,
        message: impl Into<String>,
    ) -> TaskReport {
        TaskReport {
            partition: partition.clone(),
            mode,
            rows_added,
            row_count,
            last_ts,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ridesync_core::RemoteRow;
    use ridesync_soda::SodaError;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    const TS: &str = "transit_timestamp";

    #[derive(Default)]
    struct MockRemote {
        counts: Mutex<HashMap<String, u64>>,
        days: Mutex<HashMap<String, u64>>,
        data: Mutex<HashMap<String, Vec<RemoteRow>>>,
        failing: Mutex<Vec<String>>,
        page_calls: AtomicUsize,
    }

    impl MockRemote {
        fn set_count(&self, dataset: &str, where_clause: &str, count: u64) {
            self.counts
                .lock()
                .unwrap()
                .insert(format!("{dataset}|{where_clause}"), count);
        }

        fn set_days(&self, dataset: &str, where_clause: &str, days: u64) {
            self.days
                .lock()
                .unwrap()
                .insert(format!("{dataset}|{where_clause}"), days);
        }

        fn set_rows(&self, dataset: &str, rows: Vec<RemoteRow>) {
            self.data.lock().unwrap().insert(dataset.to_string(), rows);
        }

        fn fail_pages(&self, dataset: &str) {
            self.failing.lock().unwrap().push(dataset.to_string());
        }

        fn pages_served(&self) -> usize {
            self.page_calls.load(Ordering::SeqCst)
        }

        /// Count probes plus distinct-day coverage for a fully loaded month.
        fn prime_complete_month(&self, dataset: &str, year: i32, month: u32, total: u64) {
            let window = DateWindow::month(year, month).unwrap();
            let days = days_in_month(year, month).unwrap();
            self.set_count(dataset, &where_window(TS, &window), total);
            self.set_count(
                dataset,
                &where_window(TS, &DateWindow::day(year, month, 1).unwrap()),
                1,
            );
            self.set_count(
                dataset,
                &where_window(TS, &DateWindow::day(year, month, days).unwrap()),
                1,
            );
            self.set_days(dataset, &where_window(TS, &window), u64::from(days));
        }
    }

    #[async_trait]
    impl RemoteSource for MockRemote {
        async fn count(&self, dataset_id: &str, where_clause: &str) -> Result<u64, SodaError> {
            self.counts
                .lock()
                .unwrap()
                .get(&format!("{dataset_id}|{where_clause}"))
                .copied()
                .ok_or_else(|| SodaError::UnexpectedShape {
                    detail: format!("unprimed count query: {where_clause}"),
                })
        }

        async fn distinct_days(
            &self,
            dataset_id: &str,
            _ts_column: &str,
            where_clause: &str,
        ) -> Result<u64, SodaError> {
            self.days
                .lock()
                .unwrap()
                .get(&format!("{dataset_id}|{where_clause}"))
                .copied()
                .ok_or_else(|| SodaError::UnexpectedShape {
                    detail: format!("unprimed day query: {where_clause}"),
                })
        }

        async fn page(
            &self,
            dataset_id: &str,
            query: &PageQuery,
        ) -> Result<Vec<RemoteRow>, SodaError> {
            if self.failing.lock().unwrap().iter().any(|d| d == dataset_id) {
                return Err(SodaError::HttpStatus {
                    status: 503,
                    url: format!("mock://{dataset_id}"),
                });
            }
            self.page_calls.fetch_add(1, Ordering::SeqCst);
            let data = self.data.lock().unwrap();
            let rows = data.get(dataset_id).cloned().unwrap_or_default();
            let start = query.offset as usize;
            if start >= rows.len() {
                return Ok(Vec::new());
            }
            let end = (start + query.limit).min(rows.len());
            Ok(rows[start..end].to_vec())
        }
    }

    fn row(ts: &str, station: &str, riders: &str) -> RemoteRow {
        match json!({
            "transit_timestamp": ts,
            "station_complex_id": station,
            "ridership": riders,
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn test_engine(
        root: &Path,
        remote: Arc<MockRemote>,
        years: &[(i32, &str)],
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> SyncEngine {
        let mut datasets = BTreeMap::new();
        for (year, dataset_id) in years {
            datasets.insert(*year, dataset_id.to_string());
        }
        let mut config = EngineConfig::new(root, TS);
        config.preferred_columns = vec![
            "transit_timestamp".to_string(),
            "station_complex_id".to_string(),
            "ridership".to_string(),
        ];
        config.max_workers = 2;
        tweak(&mut config);
        SyncEngine::new(
            config,
            DatasetRegistry::new(datasets),
            remote,
            Arc::new(LogProgress),
        )
    }

    fn month_filter(year: i32, month: u32) -> PlanFilter {
        PlanFilter {
            years: Some(vec![year]),
            months: Some(vec![month]),
        }
    }

    fn year_filter(year: i32) -> PlanFilter {
        PlanFilter {
            years: Some(vec![year]),
            months: None,
        }
    }

    #[test]
    fn registry_skips_bad_keys_and_rejects_empty() {
        let registry =
            DatasetRegistry::from_json_str(r#"{"2023": "wujg-7c2s", "latest": "xxxx"}"#).unwrap();
        assert_eq!(registry.years(), vec![2023]);
        assert_eq!(registry.dataset_for(2023), Some("wujg-7c2s"));
        assert!(DatasetRegistry::from_json_str(r#"{"latest": "xxxx"}"#).is_err());
    }

    #[test]
    fn plan_orders_tasks_and_drops_future_months() {
        let mut datasets = BTreeMap::new();
        datasets.insert(2024, "d24".to_string());
        datasets.insert(2025, "d25".to_string());
        let registry = DatasetRegistry::new(datasets);
        let today = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let plan = plan_tasks(&registry, Granularity::Month, &PlanFilter::default(), today)
            .unwrap();
        assert_eq!(plan.tasks.len(), 15);
        assert_eq!(plan.skipped_future, 9);
        assert_eq!(plan.tasks[0].key, PartitionKey::month(2024, 1));
        assert_eq!(plan.tasks[14].key, PartitionKey::month(2025, 3));
        let mut sorted = plan.tasks.clone();
        sorted.sort_by_key(|task| task.key);
        assert_eq!(sorted, plan.tasks);
    }

    #[test]
    fn plan_rejects_unregistered_year_and_bad_month() {
        let mut datasets = BTreeMap::new();
        datasets.insert(2024, "d24".to_string());
        let registry = DatasetRegistry::new(datasets);
        let today = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let missing = plan_tasks(
            &registry,
            Granularity::Month,
            &PlanFilter {
                years: Some(vec![1999]),
                months: None,
            },
            today,
        );
        assert!(missing.unwrap_err().to_string().contains("1999"));
        let bad_month = plan_tasks(
            &registry,
            Granularity::Month,
            &PlanFilter {
                years: Some(vec![2024]),
                months: Some(vec![13]),
            },
            today,
        );
        assert!(bad_month.unwrap_err().to_string().contains("13"));
    }

    #[tokio::test]
    async fn month_with_no_remote_rows_removes_local_file() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::default());
        let window = DateWindow::month(2023, 5).unwrap();
        remote.set_count("d23", &where_window(TS, &window), 0);
        let engine = test_engine(dir.path(), Arc::clone(&remote), &[(2023, "d23")], |_| {});

        let canonical = engine.layout().canonical_path(&PartitionKey::month(2023, 5));
        fs::create_dir_all(canonical.parent().unwrap()).unwrap();
        fs::write(&canonical, "transit_timestamp\n2023-05-01T00:00:00\n").unwrap();

        let summary = engine
            .run(Granularity::Month, &month_filter(2023, 5))
            .await
            .unwrap();
        assert_eq!(summary.incomplete, 1);
        assert_eq!(summary.reports[0].mode, OutcomeMode::Empty);
        assert!(!canonical.exists());

        let state = StateStore::new(PartitionLayout::new(dir.path()))
            .load(&PartitionKey::month(2023, 5))
            .unwrap()
            .unwrap();
        assert_eq!(state.mode, OutcomeMode::Empty);
        assert_eq!(state.row_count, 0);
    }

    #[tokio::test]
    async fn month_with_matching_counts_is_skipped_without_fetching() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::default());
        remote.prime_complete_month("d23", 2023, 5, 2);
        let engine = test_engine(dir.path(), Arc::clone(&remote), &[(2023, "d23")], |_| {});

        let canonical = engine.layout().canonical_path(&PartitionKey::month(2023, 5));
        fs::create_dir_all(canonical.parent().unwrap()).unwrap();
        fs::write(
            &canonical,
            "transit_timestamp,station_complex_id,ridership\n\
             2023-05-01T00:00:00,S1,5\n\
             2023-05-31T23:00:00,S2,7\n",
        )
        .unwrap();

        let summary = engine
            .run(Granularity::Month, &month_filter(2023, 5))
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.reports[0].mode, OutcomeMode::Skipped);
        assert_eq!(summary.reports[0].row_count, 2);
        assert_eq!(
            summary.reports[0].last_ts.as_deref(),
            Some("2023-05-31T23:00:00")
        );
        assert_eq!(remote.pages_served(), 0);
    }

    #[tokio::test]
    async fn month_missing_last_day_is_incomplete_and_clears_stale_copy() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::default());
        let window = DateWindow::month(2023, 5).unwrap();
        remote.set_count("d23", &where_window(TS, &window), 10);
        remote.set_count(
            "d23",
            &where_window(TS, &DateWindow::day(2023, 5, 1).unwrap()),
            1,
        );
        remote.set_count(
            "d23",
            &where_window(TS, &DateWindow::day(2023, 5, 31).unwrap()),
            0,
        );
        remote.set_days("d23", &where_window(TS, &window), 30);
        let engine = test_engine(dir.path(), Arc::clone(&remote), &[(2023, "d23")], |_| {});

        let canonical = engine.layout().canonical_path(&PartitionKey::month(2023, 5));
        fs::create_dir_all(canonical.parent().unwrap()).unwrap();
        fs::write(&canonical, "transit_timestamp\n2023-05-01T00:00:00\n").unwrap();

        let summary = engine
            .run(Granularity::Month, &month_filter(2023, 5))
            .await
            .unwrap();
        assert_eq!(summary.incomplete, 1);
        let report = &summary.reports[0];
        assert_eq!(report.mode, OutcomeMode::Incomplete);
        assert!(report.message.contains("last day"));
        assert!(report.message.contains("30 of 31 days"));
        assert!(!canonical.exists());
        assert_eq!(remote.pages_served(), 0);
    }

    #[tokio::test]
    async fn month_download_commits_rows_and_records_state() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::default());
        remote.prime_complete_month("d23", 2023, 5, 3);
        remote.set_rows(
            "d23",
            vec![
                row("2023-05-01T00:00:00", "S1", "5"),
                row("2023-05-15T12:00:00", "S1", "8"),
                row("2023-05-31T23:00:00", "S2", "2"),
            ],
        );
        let engine = test_engine(dir.path(), Arc::clone(&remote), &[(2023, "d23")], |_| {});

        let summary = engine
            .run(Granularity::Month, &month_filter(2023, 5))
            .await
            .unwrap();
        assert_eq!(summary.downloaded, 1);
        assert!(summary.is_success());
        let report = &summary.reports[0];
        assert_eq!(report.mode, OutcomeMode::Downloaded);
        assert_eq!(report.rows_added, 3);

        let canonical = engine.layout().canonical_path(&PartitionKey::month(2023, 5));
        let text = fs::read_to_string(&canonical).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "transit_timestamp,station_complex_id,ridership");
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("2023-05-01T00:00:00"));
        assert!(lines[3].starts_with("2023-05-31T23:00:00"));
        assert!(!engine
            .layout()
            .temp_path(&PartitionKey::month(2023, 5))
            .exists());

        let state = StateStore::new(PartitionLayout::new(dir.path()))
            .load(&PartitionKey::month(2023, 5))
            .unwrap()
            .unwrap();
        assert_eq!(state.mode, OutcomeMode::Downloaded);
        assert_eq!(state.row_count, 3);
        assert_eq!(state.last_ts.as_deref(), Some("2023-05-31T23:00:00"));
    }

    #[tokio::test]
    async fn second_run_skips_what_the_first_downloaded() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::default());
        remote.prime_complete_month("d23", 2023, 5, 1);
        remote.set_rows("d23", vec![row("2023-05-10T00:00:00", "S1", "4")]);
        let engine = test_engine(dir.path(), Arc::clone(&remote), &[(2023, "d23")], |_| {});

        let first = engine
            .run(Granularity::Month, &month_filter(2023, 5))
            .await
            .unwrap();
        assert_eq!(first.downloaded, 1);
        let pages_after_first = remote.pages_served();

        let second = engine
            .run(Granularity::Month, &month_filter(2023, 5))
            .await
            .unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(remote.pages_served(), pages_after_first);
    }

    #[tokio::test]
    async fn force_redownloads_a_matching_month() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::default());
        remote.prime_complete_month("d23", 2023, 5, 1);
        remote.set_rows("d23", vec![row("2023-05-10T00:00:00", "S9", "41")]);
        let engine = test_engine(dir.path(), Arc::clone(&remote), &[(2023, "d23")], |config| {
            config.force = true;
        });

        let canonical = engine.layout().canonical_path(&PartitionKey::month(2023, 5));
        fs::create_dir_all(canonical.parent().unwrap()).unwrap();
        fs::write(
            &canonical,
            "transit_timestamp,station_complex_id,ridership\n2023-05-10T00:00:00,S1,4\n",
        )
        .unwrap();

        let summary = engine
            .run(Granularity::Month, &month_filter(2023, 5))
            .await
            .unwrap();
        assert_eq!(summary.reports[0].mode, OutcomeMode::Downloaded);
        let text = fs::read_to_string(&canonical).unwrap();
        assert!(text.contains("S9,41"));
        assert!(!text.contains("S1,4"));
    }

    #[tokio::test]
    async fn failing_task_does_not_poison_siblings() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::default());
        remote.prime_complete_month("d22", 2022, 1, 1);
        remote.set_rows("d22", vec![row("2022-01-15T00:00:00", "S1", "3")]);
        remote.prime_complete_month("d23", 2023, 1, 1);
        remote.fail_pages("d23");
        let engine = test_engine(
            dir.path(),
            Arc::clone(&remote),
            &[(2022, "d22"), (2023, "d23")],
            |_| {},
        );

        let summary = engine
            .run(
                Granularity::Month,
                &PlanFilter {
                    years: Some(vec![2022, 2023]),
                    months: Some(vec![1]),
                },
            )
            .await
            .unwrap();
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.errors, 1);
        assert!(!summary.is_success());

        let good = engine.layout().canonical_path(&PartitionKey::month(2022, 1));
        assert!(good.is_file());
        let bad_key = PartitionKey::month(2023, 1);
        assert!(!engine.layout().canonical_path(&bad_key).exists());
        assert!(!engine.layout().temp_path(&bad_key).exists());
        let state = StateStore::new(PartitionLayout::new(dir.path()))
            .load(&bad_key)
            .unwrap()
            .unwrap();
        assert_eq!(state.mode, OutcomeMode::Errors);
    }

    #[tokio::test]
    async fn duplicate_rows_are_reported_but_still_committed() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::default());
        remote.prime_complete_month("d23", 2023, 5, 2);
        remote.set_rows(
            "d23",
            vec![
                row("2023-05-01T00:00:00", "S1", "5"),
                row("2023-05-01T00:00:00", "S1", "5"),
            ],
        );
        let engine = test_engine(dir.path(), Arc::clone(&remote), &[(2023, "d23")], |config| {
            config.verify_duplicates = true;
        });

        let summary = engine
            .run(Granularity::Month, &month_filter(2023, 5))
            .await
            .unwrap();
        assert_eq!(summary.reports[0].mode, OutcomeMode::Downloaded);
        let canonical = engine.layout().canonical_path(&PartitionKey::month(2023, 5));
        assert_eq!(count_data_rows(&canonical).unwrap(), 2);
    }

    #[tokio::test]
    async fn current_year_appends_past_the_recorded_cursor() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::default());
        let window = DateWindow::year(2024).unwrap();
        let after = where_after(TS, "2024-01-01T00:00:00", &window.end_ts(), false);
        remote.set_count("dy", &after, 2);
        remote.set_rows(
            "dy",
            vec![
                row("2024-01-01T01:00:00", "S1", "6"),
                row("2024-01-01T02:00:00", "S2", "9"),
            ],
        );
        let engine = test_engine(dir.path(), Arc::clone(&remote), &[(2024, "dy")], |_| {});

        let key = PartitionKey::year(2024);
        let canonical = engine.layout().canonical_path(&key);
        fs::create_dir_all(canonical.parent().unwrap()).unwrap();
        fs::write(
            &canonical,
            "transit_timestamp,station_complex_id,ridership\n2024-01-01T00:00:00,S1,5\n",
        )
        .unwrap();
        let store = StateStore::new(PartitionLayout::new(dir.path()));
        store
            .save(
                &key,
                &SyncState {
                    dataset_id: "dy".into(),
                    partition: "2024".into(),
                    ts_column: TS.into(),
                    last_ts: Some("2024-01-01T00:00:00".into()),
                    rows_added: 1,
                    row_count: 1,
                    last_retrieved: Utc::now(),
                    mode: OutcomeMode::Downloaded,
                },
            )
            .unwrap();

        let summary = engine
            .run(Granularity::Year, &year_filter(2024))
            .await
            .unwrap();
        let report = &summary.reports[0];
        assert_eq!(report.mode, OutcomeMode::Incremental);
        assert_eq!(report.rows_added, 2);
        assert_eq!(report.row_count, 3);
        assert_eq!(count_data_rows(&canonical).unwrap(), 3);
        let text = fs::read_to_string(&canonical).unwrap();
        assert!(text.contains("2024-01-01T00:00:00,S1,5"));
        assert!(text.ends_with("2024-01-01T02:00:00,S2,9\n"));

        let state = store.load(&key).unwrap().unwrap();
        assert_eq!(state.mode, OutcomeMode::Incremental);
        assert_eq!(state.last_ts.as_deref(), Some("2024-01-01T02:00:00"));
        assert_eq!(state.row_count, 3);
    }

    #[tokio::test]
    async fn current_year_recovers_cursor_from_the_file_without_state() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::default());
        let window = DateWindow::year(2024).unwrap();
        let after = where_after(TS, "2024-03-05T10:00:00", &window.end_ts(), false);
        remote.set_count("dy", &after, 0);
        let engine = test_engine(dir.path(), Arc::clone(&remote), &[(2024, "dy")], |_| {});

        let key = PartitionKey::year(2024);
        let canonical = engine.layout().canonical_path(&key);
        fs::create_dir_all(canonical.parent().unwrap()).unwrap();
        fs::write(
            &canonical,
            "transit_timestamp,station_complex_id,ridership\n2024-03-05T10:00:00,S1,5\n",
        )
        .unwrap();

        let summary = engine
            .run(Granularity::Year, &year_filter(2024))
            .await
            .unwrap();
        let report = &summary.reports[0];
        assert_eq!(report.mode, OutcomeMode::NoNewRows);
        assert_eq!(report.row_count, 1);
        assert_eq!(report.last_ts.as_deref(), Some("2024-03-05T10:00:00"));
        assert_eq!(remote.pages_served(), 0);
    }

    #[tokio::test]
    async fn closed_year_with_matching_counts_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::default());
        let window = DateWindow::year(2023).unwrap();
        remote.set_count("d23", &where_window(TS, &window), 2);
        let engine = test_engine(
            dir.path(),
            Arc::clone(&remote),
            &[(2023, "d23"), (2024, "d24")],
            |_| {},
        );

        let key = PartitionKey::year(2023);
        let canonical = engine.layout().canonical_path(&key);
        fs::create_dir_all(canonical.parent().unwrap()).unwrap();
        fs::write(
            &canonical,
            "transit_timestamp,station_complex_id,ridership\n\
             2023-06-01T00:00:00,S1,5\n\
             2023-12-31T23:00:00,S2,7\n",
        )
        .unwrap();

        let summary = engine
            .run(Granularity::Year, &year_filter(2023))
            .await
            .unwrap();
        let report = &summary.reports[0];
        assert_eq!(report.mode, OutcomeMode::Match);
        assert_eq!(report.row_count, 2);
        assert_eq!(remote.pages_served(), 0);
    }

    #[tokio::test]
    async fn closed_year_gone_empty_truncates_the_local_file() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::default());
        remote.set_count("d23", &where_window(TS, &DateWindow::year(2023).unwrap()), 0);
        let engine = test_engine(
            dir.path(),
            Arc::clone(&remote),
            &[(2023, "d23"), (2024, "d24")],
            |_| {},
        );

        let key = PartitionKey::year(2023);
        let canonical = engine.layout().canonical_path(&key);
        fs::create_dir_all(canonical.parent().unwrap()).unwrap();
        fs::write(
            &canonical,
            "transit_timestamp,station_complex_id,ridership\n2023-06-01T00:00:00,S1,5\n",
        )
        .unwrap();

        let summary = engine
            .run(Granularity::Year, &year_filter(2023))
            .await
            .unwrap();
        assert_eq!(summary.reports[0].mode, OutcomeMode::Empty);
        assert!(canonical.is_file());
        assert_eq!(fs::metadata(&canonical).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn closed_year_count_drift_triggers_full_refresh_and_metadata() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::default());
        remote.set_count("d23", &where_window(TS, &DateWindow::year(2023).unwrap()), 2);
        remote.set_rows(
            "d23",
            vec![
                row("2023-06-01T00:00:00", "S1", "5"),
                row("2023-12-31T23:00:00", "S2", "7"),
            ],
        );
        let engine = test_engine(
            dir.path(),
            Arc::clone(&remote),
            &[(2023, "d23"), (2024, "d24")],
            |_| {},
        );

        let key = PartitionKey::year(2023);
        let canonical = engine.layout().canonical_path(&key);
        fs::create_dir_all(canonical.parent().unwrap()).unwrap();
        fs::write(
            &canonical,
            "transit_timestamp,station_complex_id,ridership\n2023-06-01T00:00:00,S1,5\n",
        )
        .unwrap();

        let summary = engine
            .run(Granularity::Year, &year_filter(2023))
            .await
            .unwrap();
        let report = &summary.reports[0];
        assert_eq!(report.mode, OutcomeMode::FullRefresh);
        assert_eq!(report.row_count, 2);
        assert_eq!(count_data_rows(&canonical).unwrap(), 2);

        let metadata = fs::read_to_string(engine.layout().metadata_path()).unwrap();
        assert!(metadata.contains("2023.csv"));
        assert!(metadata.contains("d23"));
    }

    #[tokio::test]
    async fn fetch_window_exports_one_off_slices() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::default());
        let window = DateWindow::day(2023, 5, 10).unwrap();
        remote.set_count("adhoc", &where_window(TS, &window), 1);
        remote.set_rows("adhoc", vec![row("2023-05-10T08:00:00", "S1", "2")]);
        let engine = test_engine(dir.path(), Arc::clone(&remote), &[(2023, "adhoc")], |_| {});

        let output = dir.path().join("exports").join("day.csv");
        let rows = engine.fetch_window("adhoc", &window, &output).await.unwrap();
        assert_eq!(rows, 1);
        assert_eq!(count_data_rows(&output).unwrap(), 1);

        let empty = DateWindow::day(2023, 5, 11).unwrap();
        remote.set_count("adhoc", &where_window(TS, &empty), 0);
        let missing = dir.path().join("exports").join("empty.csv");
        assert_eq!(
            engine.fetch_window("adhoc", &empty, &missing).await.unwrap(),
            0
        );
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn fetch_window_cleans_up_after_a_failed_download() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::default());
        let window = DateWindow::day(2023, 5, 10).unwrap();
        remote.set_count("adhoc", &where_window(TS, &window), 3);
        remote.fail_pages("adhoc");
        let engine = test_engine(dir.path(), Arc::clone(&remote), &[(2023, "adhoc")], |_| {});

        let output = dir.path().join("exports").join("day.csv");
        let result = engine.fetch_window("adhoc", &window, &output).await;
        assert!(result.is_err());
        assert!(!output.exists());
        let temp = PathBuf::from(format!("{}.tmp", output.display()));
        assert!(!temp.exists());
    }

    /// Appends a stray data line to the staged file right before the audit
    /// phase, so the file holds more rows than the sink reported writing.
    struct RowInjector {
        temp: PathBuf,
    }

    impl ProgressSink for RowInjector {
        fn status(&self, _key: PartitionKey, phase: &str) {
            if phase == "auditing duplicates" {
                let mut file = fs::OpenOptions::new()
                    .append(true)
                    .open(&self.temp)
                    .unwrap();
                use std::io::Write;
                writeln!(file, "2023-05-31T23:59:00,S3,1").unwrap();
            }
        }

        fn rows(&self, _key: PartitionKey, _fetched: u64, _expected: u64) {}

        fn note(&self, _message: &str) {}
    }

    #[tokio::test]
    async fn audit_scan_mismatch_fails_the_task_and_aborts_commit() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::default());
        remote.prime_complete_month("d23", 2023, 5, 2);
        remote.set_rows(
            "d23",
            vec![
                row("2023-05-01T00:00:00", "S1", "5"),
                row("2023-05-31T23:00:00", "S2", "7"),
            ],
        );

        let mut datasets = BTreeMap::new();
        datasets.insert(2023, "d23".to_string());
        let mut config = EngineConfig::new(dir.path(), TS);
        config.preferred_columns = vec![
            "transit_timestamp".to_string(),
            "station_complex_id".to_string(),
            "ridership".to_string(),
        ];
        config.verify_duplicates = true;
        let key = PartitionKey::month(2023, 5);
        let layout = PartitionLayout::new(dir.path());
        let engine = SyncEngine::new(
            config,
            DatasetRegistry::new(datasets),
            Arc::clone(&remote) as Arc<dyn RemoteSource>,
            Arc::new(RowInjector {
                temp: layout.temp_path(&key),
            }),
        );

        let summary = engine
            .run(Granularity::Month, &month_filter(2023, 5))
            .await
            .unwrap();
        assert_eq!(summary.errors, 1);
        let report = &summary.reports[0];
        assert_eq!(report.mode, OutcomeMode::Errors);
        assert!(report.message.contains("duplicate audit scanned 3"));
        assert!(!layout.temp_path(&key).exists());
        assert!(!layout.canonical_path(&key).exists());

        let state = StateStore::new(layout).load(&key).unwrap().unwrap();
        assert_eq!(state.mode, OutcomeMode::Errors);
    }
}
