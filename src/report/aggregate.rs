//! Per (branch, bucket) report aggregation.
//!
//! Joins cleaned records with outlier flags and description vectors by
//! record id. Every record is counted: records without flags or without a
//! vector show up in `unflagged_records` and `unlabeled_records`.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::analysis::stats;
use crate::clean::CleanedDataset;
use crate::logging::Stage;
use crate::model::{DescriptionVector, FIELD_WAIT_TIME, Granularity, OutlierFlag, TemporalRecord, TimeBucket};

pub const DEFAULT_TOP_N_LABELS: usize = 3;

/// Service-level target: visits served within this many minutes.
pub const DEFAULT_SLA_MAX_MINUTES: f64 = 20.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    pub granularity: Granularity,
    pub metrics: Vec<String>,
    pub top_n_labels: usize,
    /// Field checked against `sla_max`. `None` disables the SLA column.
    pub sla_metric: Option<String>,
    pub sla_max: f64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            granularity: Granularity::Hour,
            metrics: vec![FIELD_WAIT_TIME.to_string()],
            top_n_labels: DEFAULT_TOP_N_LABELS,
            sla_metric: Some(FIELD_WAIT_TIME.to_string()),
            sla_max: DEFAULT_SLA_MAX_MINUTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub metric: String,
    /// Records with a value for the metric.
    pub count: usize,
    pub mean: Option<f64>,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCount {
    pub label: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub branch: String,
    pub bucket: TimeBucket,
    pub records: usize,
    /// Records with at least one metric flagged as an outlier.
    pub outlier_records: usize,
    pub outlier_rate: f64,
    pub unflagged_records: usize,
    pub unlabeled_records: usize,
    pub metrics: Vec<MetricSummary>,
    pub top_labels: Vec<LabelCount>,
    /// Share of records with the SLA metric at or under the limit.
    pub sla_compliance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub granularity: Granularity,
    pub metrics: Vec<String>,
    pub rows: Vec<SummaryRow>,
    pub total_records: usize,
    pub unflagged_records: usize,
    pub unlabeled_records: usize,
}

/// Build the summary. Rows are sorted by (branch, bucket).
pub fn aggregate(
    cleaned: &CleanedDataset,
    flags: &[OutlierFlag],
    vectors: &[DescriptionVector],
    config: &ReportConfig,
) -> ReportSummary {
    let mut outlier_by_record: HashMap<&str, bool> = HashMap::new();
    for flag in flags {
        *outlier_by_record.entry(flag.record_id.as_str()).or_default() |= flag.is_outlier;
    }
    let label_by_record: HashMap<&str, &str> = vectors
        .iter()
        .map(|v| (v.record_id.as_str(), v.nearest_label.as_str()))
        .collect();

    let mut groups: BTreeMap<(&str, TimeBucket), Vec<&TemporalRecord>> = BTreeMap::new();
    for record in &cleaned.records {
        let bucket = TimeBucket::containing(record.timestamp, config.granularity);
        groups.entry((record.branch.as_str(), bucket)).or_default().push(record);
    }

    let mut metrics = config.metrics.clone();
    metrics.sort();
    metrics.dedup();

    let rows: Vec<SummaryRow> = groups
        .into_iter()
        .map(|((branch, bucket), members)| {
            let mut outlier_records = 0;
            let mut unflagged_records = 0;
            let mut unlabeled_records = 0;
            let mut label_counts: BTreeMap<&str, usize> = BTreeMap::new();

            for record in &members {
                match outlier_by_record.get(record.id.as_str()) {
                    Some(true) => outlier_records += 1,
                    Some(false) => {}
                    None => unflagged_records += 1,
                }
                match label_by_record.get(record.id.as_str()) {
                    Some(&label) => *label_counts.entry(label).or_default() += 1,
                    None => unlabeled_records += 1,
                }
            }

            SummaryRow {
                branch: branch.to_string(),
                bucket,
                records: members.len(),
                outlier_records,
                outlier_rate: outlier_records as f64 / members.len() as f64,
                unflagged_records,
                unlabeled_records,
                metrics: metrics.iter().map(|m| summarize_metric(&members, m)).collect(),
                top_labels: top_labels(label_counts, config.top_n_labels),
                sla_compliance: config
                    .sla_metric
                    .as_deref()
                    .and_then(|m| sla_compliance(&members, m, config.sla_max)),
            }
        })
        .collect();

    let summary = ReportSummary {
        granularity: config.granularity,
        metrics,
        total_records: rows.iter().map(|r| r.records).sum(),
        unflagged_records: rows.iter().map(|r| r.unflagged_records).sum(),
        unlabeled_records: rows.iter().map(|r| r.unlabeled_records).sum(),
        rows,
    };
    info!(
        stage = %Stage::Report,
        rows = summary.rows.len(),
        records = summary.total_records,
        unflagged = summary.unflagged_records,
        unlabeled = summary.unlabeled_records,
        "report aggregated"
    );
    summary
}

fn summarize_metric(members: &[&TemporalRecord], metric: &str) -> MetricSummary {
    let mut values: Vec<f64> = members.iter().filter_map(|r| r.duration(metric)).collect();
    values.sort_by(f64::total_cmp);
    let present = !values.is_empty();
    MetricSummary {
        metric: metric.to_string(),
        count: values.len(),
        mean: stats::mean(&values),
        p50: present.then(|| stats::quantile_sorted(&values, 0.5)),
        p90: present.then(|| stats::quantile_sorted(&values, 0.9)),
    }
}

/// Most frequent labels first; equal counts ordered by label.
fn top_labels(counts: BTreeMap<&str, usize>, n: usize) -> Vec<LabelCount> {
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(n)
        .map(|(label, count)| LabelCount { label: label.to_string(), count })
        .collect()
}

fn sla_compliance(members: &[&TemporalRecord], metric: &str, max: f64) -> Option<f64> {
    let values: Vec<f64> = members.iter().filter_map(|r| r.duration(metric)).collect();
    if values.is_empty() {
        return None;
    }
    let within = values.iter().filter(|v| **v <= max).count();
    Some(within as f64 / values.len() as f64)
}
