/// Per-field data profile of a record set.
///
/// Run before and after cleaning so the effect of each rule is visible in
/// the diagnostics: how many values were missing, how many distinct values
/// remain and how the distribution moved.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::analysis::stats;
use crate::model::TemporalRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldProfile {
    pub field: String,
    /// Records considered, including those missing the field.
    pub count: usize,
    pub missing: usize,
    pub missing_pct: f64,
    pub n_unique: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub p25: Option<f64>,
    pub p50: Option<f64>,
    pub p75: Option<f64>,
    pub max: Option<f64>,
}

/// Profile every duration field seen in `records`, sorted by field name.
///
/// A field absent from a record's map counts as missing for that record.
pub fn profile(records: &[TemporalRecord]) -> Vec<FieldProfile> {
    let fields: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.duration_fields.keys().map(String::as_str))
        .collect();

    let mut values: BTreeMap<&str, Vec<f64>> = fields.iter().map(|f| (*f, Vec::new())).collect();
    for record in records {
        for (field, bucket) in values.iter_mut() {
            if let Some(v) = record.duration(field) {
                bucket.push(v);
            }
        }
    }

    values
        .into_iter()
        .map(|(field, mut present)| {
            present.sort_by(f64::total_cmp);
            let count = records.len();
            let missing = count - present.len();
            let n_unique = {
                let mut distinct = present.clone();
                distinct.dedup();
                distinct.len()
            };
            let quantile = |q| (!present.is_empty()).then(|| stats::quantile_sorted(&present, q));

            FieldProfile {
                field: field.to_string(),
                count,
                missing,
                missing_pct: if count == 0 { 0.0 } else { missing as f64 * 100.0 / count as f64 },
                n_unique,
                mean: stats::mean(&present),
                std: stats::std_dev(&present),
                min: present.first().copied(),
                p25: quantile(0.25),
                p50: quantile(0.5),
                p75: quantile(0.75),
                max: present.last().copied(),
            }
        })
        .collect()
}
