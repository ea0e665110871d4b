//! Raw row normalization.
//!
//! Turns untyped rows into `TemporalRecord`s. Rows without a usable id,
//! branch or timestamp are collected as `RejectedRow`s instead of failing
//! the run. Categorical fields are trimmed and lower-cased so that grouping
//! is consistent; no other coercion happens.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::{Stage, log_stage_summary};
use crate::model::{RawRow, RawTimestamp, RejectReason, RejectedRow, TemporalRecord};

/// Layouts with a trailing UTC offset that RFC 3339 does not cover, such as
/// Postgres `timestamptz` text (`2024-05-01 09:00:00.5+00`). `%.f` also
/// matches an absent fraction and `%#z` accepts `+00`, `+0530` and `+05:30`.
const OFFSET_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];

/// Naive datetime layouts, interpreted as UTC.
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];

/// Date-only layouts, interpreted as midnight UTC. `%Y%m%d` is the compact
/// form used by the visit tables' date column.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y%m%d"];

// ============================================================================
// Configuration
// ============================================================================

/// A duration field computed as the sum of other duration fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedField {
    pub name: String,
    pub components: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Rows strictly before this instant are rejected as `BeforeCutoff`.
    pub min_timestamp: Option<DateTime<Utc>>,
    pub derived: Vec<DerivedField>,
}

/// Output of a normalization pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub records: Vec<TemporalRecord>,
    pub rejected: Vec<RejectedRow>,
}

// ============================================================================
// Normalization
// ============================================================================

/// Normalize `rows` in input order.
pub fn normalize(rows: &[RawRow], config: &NormalizerConfig) -> Normalized {
    let mut out = Normalized::default();

    for (row_index, row) in rows.iter().enumerate() {
        match normalize_row(row, config) {
            Ok(record) => out.records.push(record),
            Err((reason, detail)) => {
                debug!(stage = %Stage::Normalize, row_index, %reason, "{detail}");
                out.rejected.push(RejectedRow {
                    row_index,
                    id: row.id.as_deref().map(str::trim).map(String::from),
                    reason,
                    detail,
                });
            }
        }
    }

    log_stage_summary(Stage::Normalize, rows.len(), out.records.len(), out.rejected.len());
    out
}

fn normalize_row(
    row: &RawRow,
    config: &NormalizerConfig,
) -> Result<TemporalRecord, (RejectReason, String)> {
    let id = required_text(row.id.as_deref(), "id")?;
    let branch = required_text(row.branch.as_deref(), "branch")?.to_lowercase();

    let raw_ts = row.timestamp.as_ref().ok_or_else(|| {
        (RejectReason::MissingRequiredField, "missing timestamp".to_string())
    })?;
    if let RawTimestamp::Text(text) = raw_ts {
        if text.trim().is_empty() {
            return Err((RejectReason::MissingRequiredField, "missing timestamp".to_string()));
        }
    }
    let timestamp = parse_timestamp(raw_ts)
        .ok_or_else(|| (RejectReason::BadTimestamp, format!("unparseable timestamp {:?}", raw_ts)))?;

    if let Some(cutoff) = config.min_timestamp {
        if timestamp < cutoff {
            return Err((
                RejectReason::BeforeCutoff,
                format!("timestamp {} is before cutoff {}", timestamp.to_rfc3339(), cutoff.to_rfc3339()),
            ));
        }
    }

    let mut duration_fields: std::collections::BTreeMap<String, Option<f64>> = row
        .durations
        .iter()
        .map(|(name, value)| (name.trim().to_string(), (*value).filter(|v| v.is_finite() && *v >= 0.0)))
        .collect();

    for derived in &config.derived {
        let total = derived
            .components
            .iter()
            .map(|c| duration_fields.get(c).copied().flatten())
            .sum::<Option<f64>>();
        duration_fields.insert(derived.name.clone(), total);
    }

    Ok(TemporalRecord {
        id,
        timestamp,
        branch,
        duration_fields,
        description: row.description.as_deref().unwrap_or_default().trim().to_string(),
        status: row.status.as_deref().unwrap_or_default().trim().to_lowercase(),
    })
}

fn required_text(value: Option<&str>, field: &str) -> Result<String, (RejectReason, String)> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err((RejectReason::MissingRequiredField, format!("missing {field}"))),
    }
}

/// Parse a raw timestamp into UTC. Returns `None` if no accepted format
/// matches.
pub fn parse_timestamp(raw: &RawTimestamp) -> Option<DateTime<Utc>> {
    match raw {
        RawTimestamp::Epoch(secs) => Utc.timestamp_opt(*secs, 0).single(),
        RawTimestamp::Text(text) => parse_timestamp_text(text.trim()),
    }
}

fn parse_timestamp_text(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in OFFSET_DATETIME_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

// ============================================================================
// Tests
// ============================================================================
