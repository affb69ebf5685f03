//! Core domain model for ridesync: partitions, calendar windows, sync
//! outcomes, and row canonicalization.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "ridesync-core";

/// One row as returned by the remote API: an ordered JSON object.
pub type RemoteRow = Map<String, JsonValue>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid calendar year {year}")]
    InvalidYear { year: i32 },
    #[error("invalid calendar month {month} in year {year}")]
    InvalidMonth { year: i32, month: u32 },
    #[error("invalid calendar day {year}-{month:02}-{day:02}")]
    InvalidDay { year: i32, month: u32, day: u32 },
}

/// Half-open calendar range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn year(year: i32) -> Result<Self, DomainError> {
        let start =
            NaiveDate::from_ymd_opt(year, 1, 1).ok_or(DomainError::InvalidYear { year })?;
        let end = NaiveDate::from_ymd_opt(year + 1, 1, 1)
            .ok_or(DomainError::InvalidYear { year })?;
        Ok(Self { start, end })
    }

    pub fn month(year: i32, month: u32) -> Result<Self, DomainError> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or(DomainError::InvalidMonth { year, month })?;
        let end = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)
        }
        .ok_or(DomainError::InvalidMonth { year, month })?;
        Ok(Self { start, end })
    }

    pub fn day(year: i32, month: u32, day: u32) -> Result<Self, DomainError> {
        let start = NaiveDate::from_ymd_opt(year, month, day)
            .ok_or(DomainError::InvalidDay { year, month, day })?;
        let end = start
            .succ_opt()
            .ok_or(DomainError::InvalidDay { year, month, day })?;
        Ok(Self { start, end })
    }

    /// Inclusive lower bound as a SODA floating timestamp.
    pub fn start_ts(&self) -> String {
        format!("{}T00:00:00", self.start)
    }

    /// Exclusive upper bound as a SODA floating timestamp.
    pub fn end_ts(&self) -> String {
        format!("{}T00:00:00", self.end)
    }

    pub fn day_count(&self) -> u32 {
        (self.end - self.start).num_days().max(0) as u32
    }
}

/// Number of days in a calendar month.
pub fn days_in_month(year: i32, month: u32) -> Result<u32, DomainError> {
    Ok(DateWindow::month(year, month)?.day_count())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Month,
    Year,
}

/// Identifies one calendar slice of a dataset: a month or a whole year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub year: i32,
    pub month: Option<u32>,
}

impl PartitionKey {
    pub fn year(year: i32) -> Self {
        Self { year, month: None }
    }

    pub fn month(year: i32, month: u32) -> Self {
        Self {
            year,
            month: Some(month),
        }
    }

    pub fn granularity(&self) -> Granularity {
        if self.month.is_some() {
            Granularity::Month
        } else {
            Granularity::Year
        }
    }

    pub fn window(&self) -> Result<DateWindow, DomainError> {
        match self.month {
            Some(month) => DateWindow::month(self.year, month),
            None => DateWindow::year(self.year),
        }
    }

    /// True when the partition's start date is strictly after `today`, i.e.
    /// the remote cannot yet have complete data for it.
    pub fn starts_after(&self, today: NaiveDate) -> bool {
        let start_month = self.month.unwrap_or(1);
        (self.year, start_month) > (today.year(), today.month())
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.month {
            Some(month) => write!(f, "{}/{:02}", self.year, month),
            None => write!(f, "{}", self.year),
        }
    }
}

/// The unit of synchronization: one calendar slice of one remote dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub dataset_id: String,
    pub key: PartitionKey,
}

impl Partition {
    pub fn new(dataset_id: impl Into<String>, key: PartitionKey) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            key,
        }
    }
}

/// Terminal classification of one sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeMode {
    NoNewRows,
    Incremental,
    Match,
    Empty,
    FullRefresh,
    Downloaded,
    Skipped,
    Incomplete,
    Errors,
}

impl OutcomeMode {
    pub fn is_error(&self) -> bool {
        matches!(self, OutcomeMode::Errors)
    }
}

impl fmt::Display for OutcomeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OutcomeMode::NoNewRows => "no_new_rows",
            OutcomeMode::Incremental => "incremental",
            OutcomeMode::Match => "match",
            OutcomeMode::Empty => "empty",
            OutcomeMode::FullRefresh => "full_refresh",
            OutcomeMode::Downloaded => "downloaded",
            OutcomeMode::Skipped => "skipped",
            OutcomeMode::Incomplete => "incomplete",
            OutcomeMode::Errors => "errors",
        };
        f.write_str(label)
    }
}

/// Per-partition record persisted after every sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub dataset_id: String,
    pub partition: String,
    pub ts_column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ts: Option<String>,
    pub rows_added: u64,
    pub row_count: u64,
    pub last_retrieved: DateTime<Utc>,
    pub mode: OutcomeMode,
}

/// Reserved Socrata system fields carry a `:` prefix and never reach CSV.
pub fn is_reserved_column(name: &str) -> bool {
    name.starts_with(':')
}

/// Build the CSV header from the first non-empty page: preferred columns that
/// actually occur come first, any other columns follow in first-seen order.
pub fn merge_header(preferred: &[String], rows: &[RemoteRow]) -> Vec<String> {
    let mut header: Vec<String> = Vec::new();
    for column in preferred {
        if rows.iter().any(|row| row.contains_key(column)) {
            header.push(column.clone());
        }
    }
    for row in rows {
        for key in row.keys() {
            if is_reserved_column(key) || header.iter().any(|h| h == key) {
                continue;
            }
            header.push(key.clone());
        }
    }
    header
}

/// Flatten one remote row against a fixed header. Missing columns become
/// empty strings; nested values are serialized as compact JSON.
pub fn normalize_row(row: &RemoteRow, header: &[String]) -> Vec<String> {
    header
        .iter()
        .map(|column| match row.get(column) {
            None | Some(JsonValue::Null) => String::new(),
            Some(JsonValue::String(text)) => text.clone(),
            Some(JsonValue::Number(number)) => number.to_string(),
            Some(JsonValue::Bool(flag)) => flag.to_string(),
            Some(value) => serde_json::to_string(value).unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: JsonValue) -> RemoteRow {
        match value {
            JsonValue::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn month_window_rolls_over_december() {
        let window = DateWindow::month(2023, 12).unwrap();
        assert_eq!(window.start_ts(), "2023-12-01T00:00:00");
        assert_eq!(window.end_ts(), "2024-01-01T00:00:00");
        assert_eq!(window.day_count(), 31);
    }

    #[test]
    fn leap_february_has_29_days() {
        assert_eq!(days_in_month(2024, 2).unwrap(), 29);
        assert_eq!(days_in_month(2023, 2).unwrap(), 28);
    }

    #[test]
    fn invalid_month_is_rejected() {
        assert_eq!(
            DateWindow::month(2023, 13).unwrap_err(),
            DomainError::InvalidMonth {
                year: 2023,
                month: 13
            }
        );
    }

    #[test]
    fn partition_key_future_check_is_month_granular() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
        assert!(!PartitionKey::month(2025, 6).starts_after(today));
        assert!(PartitionKey::month(2025, 7).starts_after(today));
        assert!(!PartitionKey::year(2025).starts_after(today));
        assert!(PartitionKey::year(2026).starts_after(today));
    }

    #[test]
    fn partition_key_display() {
        assert_eq!(PartitionKey::month(2023, 5).to_string(), "2023/05");
        assert_eq!(PartitionKey::year(2023).to_string(), "2023");
    }

    #[test]
    fn merge_header_prefers_known_columns_and_drops_reserved() {
        let preferred = vec!["transit_timestamp".to_string(), "ridership".to_string()];
        let rows = vec![
            row(json!({"ridership": "10", ":id": "abc", "extra": "x"})),
            row(json!({"transit_timestamp": "2023-01-01T00:00:00", "other": "y"})),
        ];
        let header = merge_header(&preferred, &rows);
        assert_eq!(
            header,
            vec!["transit_timestamp", "ridership", "extra", "other"]
        );
    }

    #[test]
    fn normalize_row_flattens_nested_values() {
        let header = vec![
            "transit_timestamp".to_string(),
            "georeference".to_string(),
            "missing".to_string(),
        ];
        let record = row(json!({
            "transit_timestamp": "2023-01-01T00:00:00",
            "georeference": {"coordinates": [-73.9, 40.7], "type": "Point"},
        }));
        let fields = normalize_row(&record, &header);
        assert_eq!(fields[0], "2023-01-01T00:00:00");
        assert_eq!(fields[1], r#"{"coordinates":[-73.9,40.7],"type":"Point"}"#);
        assert_eq!(fields[2], "");
    }

    #[test]
    fn outcome_mode_serde_names_are_stable() {
        let json = serde_json::to_string(&OutcomeMode::FullRefresh).unwrap();
        assert_eq!(json, "\"full_refresh\"");
        let parsed: OutcomeMode = serde_json::from_str("\"no_new_rows\"").unwrap();
        assert_eq!(parsed, OutcomeMode::NoNewRows);
        assert_eq!(OutcomeMode::Match.to_string(), "match");
    }

    #[test]
    fn sync_state_round_trips() {
        let state = SyncState {
            dataset_id: "5wq4-mkjj".into(),
            partition: "2023".into(),
            ts_column: "transit_timestamp".into(),
            last_ts: Some("2023-12-31T23:00:00".into()),
            rows_added: 120,
            row_count: 4500,
            last_retrieved: Utc::now(),
            mode: OutcomeMode::Incremental,
        };
        let text = serde_json::to_string(&state).unwrap();
        let parsed: SyncState = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, state);
    }
}
