//! Local filesystem side of ridesync: partition path layout, the CSV sink
//! with temp-sibling + atomic rename, sync-state records, the dataset
//! metadata roll-up, and the disk-backed duplicate audit.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ridesync_core::{merge_header, normalize_row, PartitionKey, RemoteRow, SyncState};
use rusqlite::{params_from_iter, Connection};
use tracing::debug;

pub const CRATE_NAME: &str = "ridesync-store";

const LINE_COUNT_CHUNK_SIZE: usize = 1024 * 1024;
const TAIL_SCAN_CHUNK_SIZE: u64 = 1024;

pub const DEFAULT_DUPLICATE_SAMPLE_LIMIT: usize = 5;

/// Deterministic paths for one dataset root: `<root>/<year>/<month>.csv` for
/// month partitions, `<root>/<year>.csv` for year partitions, state records
/// under `<root>/auto/`.
#[derive(Debug, Clone)]
pub struct PartitionLayout {
    root: PathBuf,
}

impl PartitionLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn canonical_path(&self, key: &PartitionKey) -> PathBuf {
        match key.month {
            Some(month) => self
                .root
                .join(key.year.to_string())
                .join(format!("{month}.csv")),
            None => self.root.join(format!("{}.csv", key.year)),
        }
    }

    /// Temp sibling next to the canonical file, never visible to readers of
    /// the canonical path.
    pub fn temp_path(&self, key: &PartitionKey) -> PathBuf {
        append_extension(&self.canonical_path(key), "tmp")
    }

    pub fn state_path(&self, key: &PartitionKey) -> PathBuf {
        let name = match key.month {
            Some(month) => format!("{}-{month:02}.yaml", key.year),
            None => format!("{}.yaml", key.year),
        };
        self.root.join("auto").join(name)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join("metadata.yaml")
    }
}

fn append_extension(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push('.');
    name.push_str(suffix);
    path.with_file_name(name)
}

/// Remove a file if it exists; missing files are not an error.
pub fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
    }
}

/// Atomically publish a fully validated temp file at the canonical path.
pub fn commit_temp(temp: &Path, canonical: &Path) -> Result<()> {
    if let Some(parent) = canonical.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating partition directory {}", parent.display()))?;
    }
    fs::rename(temp, canonical).with_context(|| {
        format!(
            "renaming {} over {}",
            temp.display(),
            canonical.display()
        )
    })
}

/// What the sink saw over a whole fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkReport {
    pub rows_written: u64,
    pub last_ts: Option<String>,
    pub header: Vec<String>,
}

/// Streaming CSV writer for one fetch. The header is discovered from the
/// first non-empty page; rows missing the time column are dropped and not
/// counted as written.
pub struct CsvSink {
    writer: csv::Writer<File>,
    header: Vec<String>,
    preferred: Vec<String>,
    ts_column: String,
    rows_written: u64,
    last_ts: Option<String>,
    header_pending: bool,
}

impl CsvSink {
    /// Truncate-create a sink at `path` (normally the temp sibling).
    pub fn create(path: &Path, ts_column: &str, preferred: &[String]) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating partition directory {}", parent.display()))?;
        }
        let file =
            File::create(path).with_context(|| format!("creating {}", path.display()))?;
        Ok(Self {
            writer: csv::Writer::from_writer(file),
            header: Vec::new(),
            preferred: preferred.to_vec(),
            ts_column: ts_column.to_string(),
            rows_written: 0,
            last_ts: None,
            header_pending: true,
        })
    }

    /// Open a sink appending to an existing file whose header is already
    /// fixed. Used for cursor-based incremental fetches.
    pub fn append(path: &Path, ts_column: &str, header: Vec<String>) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("opening {} for append", path.display()))?;
        Ok(Self {
            writer: csv::Writer::from_writer(file),
            header,
            preferred: Vec::new(),
            ts_column: ts_column.to_string(),
            rows_written: 0,
            last_ts: None,
            header_pending: false,
        })
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Write one page of remote rows; returns how many were kept.
    pub fn write_page(&mut self, rows: &[RemoteRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        if self.header.is_empty() {
            self.header = merge_header(&self.preferred, rows);
        }
        if self.header_pending && !self.header.is_empty() {
            self.writer
                .write_record(&self.header)
                .context("writing CSV header")?;
            self.header_pending = false;
        }

        let mut written = 0usize;
        for row in rows {
            let ts_value = match row.get(&self.ts_column) {
                Some(value) => match value.as_str() {
                    Some(text) if !text.is_empty() => text.to_string(),
                    _ => continue,
                },
                None => continue,
            };
            self.writer
                .write_record(normalize_row(row, &self.header))
                .context("writing CSV row")?;
            self.last_ts = Some(ts_value);
            written += 1;
        }
        self.rows_written += written as u64;
        Ok(written)
    }

    pub fn finish(mut self) -> Result<SinkReport> {
        self.writer.flush().context("flushing CSV sink")?;
        Ok(SinkReport {
            rows_written: self.rows_written,
            last_ts: self.last_ts,
            header: self.header,
        })
    }
}

/// Count data rows (excluding the header line) without loading the file.
pub fn count_data_rows(path: &Path) -> Result<u64> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err).with_context(|| format!("opening {}", path.display())),
    };

    let mut newline_count: u64 = 0;
    let mut saw_any_bytes = false;
    let mut last_byte = 0u8;
    let mut buffer = vec![0u8; LINE_COUNT_CHUNK_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("reading {}", path.display()))?;
        if read == 0 {
            break;
        }
        saw_any_bytes = true;
        newline_count += buffer[..read].iter().filter(|b| **b == b'\n').count() as u64;
        last_byte = buffer[read - 1];
    }

    if !saw_any_bytes {
        return Ok(0);
    }
    if last_byte != b'\n' {
        newline_count += 1;
    }
    Ok(newline_count.saturating_sub(1))
}

/// Read the header row of an existing partition file.
pub fn read_csv_header(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let header = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?;
    Ok(header.iter().map(str::to_string).collect())
}

/// Recover the cursor from an existing file: the time-column value on the
/// last non-empty line.
pub fn read_last_timestamp(path: &Path, ts_column: &str) -> Result<Option<String>> {
    let header = read_csv_header(path)?;
    let Some(index) = header.iter().position(|column| column == ts_column) else {
        anyhow::bail!(
            "time column '{ts_column}' not present in {}",
            path.display()
        );
    };

    let Some(line) = read_last_nonempty_line(path)? else {
        return Ok(None);
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(line.as_bytes());
    let mut record = csv::StringRecord::new();
    if !reader
        .read_record(&mut record)
        .with_context(|| format!("parsing last line of {}", path.display()))?
    {
        return Ok(None);
    }
    // A header-only file has no cursor.
    if record.iter().eq(header.iter().map(String::as_str)) {
        return Ok(None);
    }
    Ok(record
        .get(index)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string))
}

/// Scan backwards in fixed-size chunks for the last line with any content,
/// so large partition files never load fully into memory.
fn read_last_nonempty_line(path: &Path) -> Result<Option<String>> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut pos = file
        .seek(SeekFrom::End(0))
        .with_context(|| format!("seeking {}", path.display()))?;
    if pos == 0 {
        return Ok(None);
    }

    let mut buffer: Vec<u8> = Vec::new();
    while pos > 0 {
        let step = TAIL_SCAN_CHUNK_SIZE.min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos))
            .with_context(|| format!("seeking {}", path.display()))?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)
            .with_context(|| format!("reading {}", path.display()))?;
        chunk.extend_from_slice(&buffer);
        buffer = chunk;

        // Anything after the first newline in the buffer is a complete line.
        if let Some(first_newline) = buffer.iter().position(|b| *b == b'\n') {
            if let Some(line) = buffer[first_newline + 1..]
                .split(|b| *b == b'\n')
                .rev()
                .find(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
            {
                return Ok(Some(String::from_utf8_lossy(line).into_owned()));
            }
        }
    }

    let head = trim_ascii(&buffer);
    if head.is_empty() {
        Ok(None)
    } else {
        Ok(Some(String::from_utf8_lossy(head).into_owned()))
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// YAML sync-state records under `<root>/auto/`, one per partition.
#[derive(Debug, Clone)]
pub struct StateStore {
    layout: PartitionLayout,
}

impl StateStore {
    pub fn new(layout: PartitionLayout) -> Self {
        Self { layout }
    }

    pub fn load(&self, key: &PartitionKey) -> Result<Option<SyncState>> {
        let path = self.layout.state_path(key);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let state = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(state))
    }

    /// Overwrite the record unconditionally; every attempt leaves a record
    /// behind, including no-op outcomes.
    pub fn save(&self, key: &PartitionKey, state: &SyncState) -> Result<()> {
        let path = self.layout.state_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating state directory {}", parent.display()))?;
        }
        let text = serde_yaml::to_string(state).context("serializing sync state")?;
        fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), mode = %state.mode, "state record saved");
        Ok(())
    }
}

/// One partition file's entry in the dataset metadata roll-up.
#[derive(Debug, Clone)]
pub struct MetadataEntry {
    pub file_name: String,
    pub dataset_id: String,
    pub data_url: String,
    pub retrieval_date: String,
    pub rows: u64,
}

/// Rewrite `metadata.yaml` with the run's entries, preserving any keys this
/// run did not touch.
pub fn update_metadata(path: &Path, current_year: i32, entries: &[MetadataEntry]) -> Result<()> {
    let mut document: serde_yaml::Mapping = match fs::read_to_string(path) {
        Ok(text) => serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => serde_yaml::Mapping::new(),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };

    document.insert("current_year".into(), i64::from(current_year).into());
    for entry in entries {
        let mut block = serde_yaml::Mapping::new();
        block.insert("data_url".into(), entry.data_url.clone().into());
        block.insert("retrieval_date".into(), entry.retrieval_date.clone().into());
        block.insert("dataset_id".into(), entry.dataset_id.clone().into());
        block.insert("rows".into(), entry.rows.into());
        document.insert(
            entry.file_name.clone().into(),
            serde_yaml::Value::Mapping(block),
        );
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let body = serde_yaml::to_string(&document).context("serializing metadata")?;
    fs::write(path, body).with_context(|| format!("writing {}", path.display()))
}

/// Result of a duplicate scan over a freshly fetched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateAudit {
    pub rows_scanned: u64,
    pub duplicate_rows: u64,
    pub header: Vec<String>,
    /// Up to `sample_limit` duplicated rows, in file order.
    pub samples: Vec<Vec<String>>,
}

/// Count exact-duplicate rows with a disk-backed multiset so memory stays
/// bounded regardless of file size. Never mutates the data file; the sqlite
/// scratch file is removed before returning.
pub fn audit_duplicates(csv_path: &Path, sample_limit: usize) -> Result<DuplicateAudit> {
    let scratch = append_extension(csv_path, "dupecheck.sqlite");
    remove_if_present(&scratch)?;
    let result = scan_for_duplicates(csv_path, &scratch, sample_limit);
    let _ = fs::remove_file(&scratch);
    result
}

fn scan_for_duplicates(
    csv_path: &Path,
    scratch: &Path,
    sample_limit: usize,
) -> Result<DuplicateAudit> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("opening {}", csv_path.display()))?;
    let header: Vec<String> = reader
        .headers()
        .with_context(|| format!("reading header of {}", csv_path.display()))?
        .iter()
        .map(str::to_string)
        .collect();
    if header.is_empty() {
        return Ok(DuplicateAudit {
            rows_scanned: 0,
            duplicate_rows: 0,
            header,
            samples: Vec::new(),
        });
    }

    let columns: Vec<String> = (0..header.len()).map(|i| format!("c{i}")).collect();
    let column_sql = columns.join(", ");
    let placeholder_sql = vec!["?"; columns.len()].join(", ");
    let table_sql = format!(
        "CREATE TABLE rows (seq INTEGER PRIMARY KEY AUTOINCREMENT, {}, seen_count INTEGER NOT NULL DEFAULT 1, UNIQUE ({column_sql}))",
        columns
            .iter()
            .map(|name| format!("{name} TEXT"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let upsert_sql = format!(
        "INSERT INTO rows ({column_sql}, seen_count) VALUES ({placeholder_sql}, 1) \
         ON CONFLICT ({column_sql}) DO UPDATE SET seen_count = seen_count + 1"
    );

    let conn = Connection::open(scratch)
        .with_context(|| format!("opening scratch db {}", scratch.display()))?;
    conn.pragma_update(None, "journal_mode", "OFF")
        .context("disabling journal")?;
    conn.pragma_update(None, "synchronous", "OFF")
        .context("disabling synchronous writes")?;
    conn.execute(&table_sql, [])
        .context("creating multiset table")?;

    let mut rows_scanned: u64 = 0;
    {
        let mut upsert = conn.prepare(&upsert_sql).context("preparing upsert")?;
        for record in reader.records() {
            let record =
                record.with_context(|| format!("reading {}", csv_path.display()))?;
            rows_scanned += 1;
            let mut fields: Vec<String> =
                record.iter().map(str::to_string).collect();
            fields.resize(columns.len(), String::new());
            upsert
                .execute(params_from_iter(fields.iter()))
                .context("recording row occurrence")?;
        }
    }

    let duplicate_rows: i64 = conn
        .query_row("SELECT COALESCE(SUM(seen_count - 1), 0) FROM rows", [], |r| {
            r.get(0)
        })
        .context("counting duplicates")?;

    let mut samples = Vec::new();
    if sample_limit > 0 && duplicate_rows > 0 {
        let sample_sql = format!(
            "SELECT {column_sql} FROM rows WHERE seen_count > 1 ORDER BY seq ASC LIMIT ?"
        );
        let mut stmt = conn.prepare(&sample_sql).context("preparing sample query")?;
        let mut rows = stmt
            .query([sample_limit as i64])
            .context("sampling duplicates")?;
        while let Some(row) = rows.next().context("sampling duplicates")? {
            let mut sample = Vec::with_capacity(columns.len());
            for index in 0..columns.len() {
                let value: Option<String> = row.get(index).context("reading sample cell")?;
                sample.push(value.unwrap_or_default());
            }
            samples.push(sample);
        }
    }

    Ok(DuplicateAudit {
        rows_scanned,
        duplicate_rows: duplicate_rows.max(0) as u64,
        header,
        samples,
    })
}
