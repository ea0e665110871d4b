/// Core data types for the visit monitoring pipeline.
///
/// This module defines the shared domain model imported by all other modules:
/// raw input rows, canonical temporal records, time buckets, outlier flags
/// and description vectors. It contains no pipeline logic.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Field names and labels
// ---------------------------------------------------------------------------

/// Minutes the patient waited before service started.
pub const FIELD_WAIT_TIME: &str = "wait_time";

/// Minutes spent in service.
pub const FIELD_SERVICE_TIME: &str = "service_time";

/// Label assigned when a description cannot be matched to the vocabulary.
pub const UNKNOWN_LABEL: &str = "unknown";

// ---------------------------------------------------------------------------
// Input boundary
// ---------------------------------------------------------------------------

/// Timestamp as delivered by the data-access collaborator: either text in
/// one of the accepted formats or seconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Epoch(i64),
    Text(String),
}

/// One untyped row as read from the relational store or a CSV export.
///
/// Every field is optional here; the normalizer decides what is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub id: Option<String>,
    pub timestamp: Option<RawTimestamp>,
    pub branch: Option<String>,
    #[serde(default)]
    pub durations: BTreeMap<String, Option<f64>>,
    pub description: Option<String>,
    pub status: Option<String>,
}

// ---------------------------------------------------------------------------
// Canonical records
// ---------------------------------------------------------------------------

/// A visit or service event after normalization.
///
/// `timestamp` is always present. Duration values are non-negative or `None`
/// when the value is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub branch: String,
    pub duration_fields: BTreeMap<String, Option<f64>>,
    pub description: String,
    pub status: String,
}

impl TemporalRecord {
    /// Value of a duration field, `None` when absent or missing.
    pub fn duration(&self, field: &str) -> Option<f64> {
        self.duration_fields.get(field).copied().flatten()
    }
}

/// Why a raw row was not turned into a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    BadTimestamp,
    MissingRequiredField,
    /// The timestamp parsed but lies before the configured cutoff.
    BeforeCutoff,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::BadTimestamp => write!(f, "bad_timestamp"),
            RejectReason::MissingRequiredField => write!(f, "missing_required_field"),
            RejectReason::BeforeCutoff => write!(f, "before_cutoff"),
        }
    }
}

/// A raw row that was rejected during normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRow {
    /// Position of the row in the input sequence.
    pub row_index: usize,
    pub id: Option<String>,
    pub reason: RejectReason,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Time buckets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Weekday,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Hour => write!(f, "hour"),
            Granularity::Day => write!(f, "day"),
            Granularity::Weekday => write!(f, "weekday"),
        }
    }
}

/// Aggregation key derived from a timestamp and a granularity.
///
/// Hour and day buckets are real calendar intervals. Weekday buckets fold
/// every week onto the reference week starting Monday 1970-01-05 UTC, so all
/// Mondays in the data share one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeBucket {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub granularity: Granularity,
}

impl TimeBucket {
    /// Returns the bucket containing `ts`. The interval is half-open:
    /// `period_start <= ts < period_end` (after weekday folding).
    pub fn containing(ts: DateTime<Utc>, granularity: Granularity) -> Self {
        let day_start = Utc
            .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), 0, 0, 0)
            .single()
            .unwrap_or(ts);

        let (period_start, length) = match granularity {
            Granularity::Hour => (day_start + Duration::hours(ts.hour() as i64), Duration::hours(1)),
            Granularity::Day => (day_start, Duration::days(1)),
            Granularity::Weekday => {
                let offset = ts.weekday().num_days_from_monday() as i64;
                (reference_monday() + Duration::days(offset), Duration::days(1))
            }
        };

        TimeBucket {
            period_start,
            period_end: period_start + length,
            granularity,
        }
    }

    /// Human-readable bucket label used in report tables.
    pub fn label(&self) -> String {
        match self.granularity {
            Granularity::Hour => self.period_start.format("%Y-%m-%dT%H:00Z").to_string(),
            Granularity::Day => self.period_start.format("%Y-%m-%d").to_string(),
            Granularity::Weekday => weekday_name(self.period_start.weekday()).to_string(),
        }
    }
}

fn reference_monday() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + Duration::days(4)
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

// ---------------------------------------------------------------------------
// Outlier flags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineMethod {
    Zscore,
    Iqr,
    /// The bucket had too few observations to score.
    InsufficientData,
}

impl fmt::Display for BaselineMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaselineMethod::Zscore => write!(f, "zscore"),
            BaselineMethod::Iqr => write!(f, "iqr"),
            BaselineMethod::InsufficientData => write!(f, "insufficient_data"),
        }
    }
}

/// Statistical reference a value was scored against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f64,
    pub std: f64,
    pub method: BaselineMethod,
}

/// Result of evaluating one metric of one record against its bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierFlag {
    pub record_id: String,
    pub branch: String,
    pub bucket: TimeBucket,
    pub metric_name: String,
    pub observed_value: f64,
    pub baseline: Baseline,
    pub score: f64,
    pub is_outlier: bool,
}

// ---------------------------------------------------------------------------
// Description vectors
// ---------------------------------------------------------------------------

/// Embedding and vocabulary match for one record's description.
///
/// `embedding` is `None` for blank descriptions and for descriptions the
/// model could not embed; both carry the `unknown` label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionVector {
    pub record_id: String,
    pub embedding: Option<Vec<f32>>,
    pub nearest_label: String,
    pub similarity_score: f32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_hour_bucket_truncates_to_hour() {
        let bucket = TimeBucket::containing(at(2024, 5, 1, 9, 42), Granularity::Hour);
        assert_eq!(bucket.period_start, at(2024, 5, 1, 9, 0));
        assert_eq!(bucket.period_end, at(2024, 5, 1, 10, 0));
        assert_eq!(bucket.label(), "2024-05-01T09:00Z");
    }

    #[test]
    fn test_day_bucket_spans_midnight_to_midnight() {
        let bucket = TimeBucket::containing(at(2024, 5, 1, 23, 59), Granularity::Day);
        assert_eq!(bucket.period_start, at(2024, 5, 1, 0, 0));
        assert_eq!(bucket.period_end, at(2024, 5, 2, 0, 0));
    }

    #[test]
    fn test_weekday_bucket_folds_weeks_together() {
        // 2024-05-01 and 2024-05-08 are both Wednesdays.
        let a = TimeBucket::containing(at(2024, 5, 1, 8, 0), Granularity::Weekday);
        let b = TimeBucket::containing(at(2024, 5, 8, 17, 30), Granularity::Weekday);
        assert_eq!(a, b, "same weekday in different weeks must share a bucket");
        assert_eq!(a.label(), "Wednesday");
        assert_eq!(a.period_start, at(1970, 1, 7, 0, 0));
    }

    #[test]
    fn test_weekday_buckets_sort_monday_first() {
        let sunday = TimeBucket::containing(at(2024, 5, 5, 12, 0), Granularity::Weekday);
        let monday = TimeBucket::containing(at(2024, 5, 6, 12, 0), Granularity::Weekday);
        assert!(monday < sunday);
    }

    #[test]
    fn test_duration_lookup_treats_missing_as_none() {
        let mut fields = BTreeMap::new();
        fields.insert(FIELD_WAIT_TIME.to_string(), Some(4.0));
        fields.insert(FIELD_SERVICE_TIME.to_string(), None);
        let record = TemporalRecord {
            id: "1".to_string(),
            timestamp: at(2024, 5, 1, 9, 0),
            branch: "centro".to_string(),
            duration_fields: fields,
            description: String::new(),
            status: String::new(),
        };
        assert_eq!(record.duration(FIELD_WAIT_TIME), Some(4.0));
        assert_eq!(record.duration(FIELD_SERVICE_TIME), None);
        assert_eq!(record.duration("not_a_field"), None);
    }
}
