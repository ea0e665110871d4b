//! Deterministic cleaning rules for normalized records.
//!
//! A pass runs, in order: deduplication, drop-if-missing, range clipping and
//! median imputation. Every step is stable with respect to input order and
//! the pass is idempotent: cleaning an already-cleaned dataset returns the
//! same records.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::analysis::stats;
use crate::error::ConfigError;
use crate::logging::Stage;
use crate::model::TemporalRecord;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// One cleaning rule applied to a duration field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum FieldRule {
    /// Remove the whole record when the field is missing.
    DropIfMissing,
    /// Fill a missing value with the branch median, then the global median.
    ImputeMedian,
    /// Clamp present values into `[min, max]`.
    ClipToRange { min: f64, max: f64 },
}

/// Per-field cleaning rules. Built once, then only read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleaningPolicy {
    #[serde(default)]
    fields: BTreeMap<String, Vec<FieldRule>>,
}

impl CleaningPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule for `field`, returning the extended policy.
    pub fn with_rule(mut self, field: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.entry(field.into()).or_default().push(rule);
        self
    }

    pub fn rules(&self, field: &str) -> &[FieldRule] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    fn fields_with(&self, pred: impl Fn(&FieldRule) -> bool) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(_, rules)| rules.iter().any(&pred))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, rules) in &self.fields {
            for rule in rules {
                if let FieldRule::ClipToRange { min, max } = rule {
                    if !min.is_finite() || !max.is_finite() || min > max {
                        return Err(ConfigError::invalid(
                            format!("cleaning.fields.{field}"),
                            format!("clip range [{min}, {max}] is empty or not finite"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleaningCounters {
    pub duplicates_removed: usize,
    pub dropped_missing: usize,
    /// Clipping events per field.
    pub clipped: BTreeMap<String, usize>,
    /// Values filled by median imputation per field.
    pub imputed: BTreeMap<String, usize>,
    /// Values left missing because no median existed anywhere, per field.
    pub failed_imputations: BTreeMap<String, usize>,
}

impl CleaningCounters {
    pub fn total_clipped(&self) -> usize {
        self.clipped.values().sum()
    }

    pub fn total_imputed(&self) -> usize {
        self.imputed.values().sum()
    }

    pub fn total_failed_imputations(&self) -> usize {
        self.failed_imputations.values().sum()
    }
}

/// Cleaned records in input order plus what the pass did to them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanedDataset {
    pub records: Vec<TemporalRecord>,
    pub counters: CleaningCounters,
}

// ---------------------------------------------------------------------------
// Cleaning pass
// ---------------------------------------------------------------------------

pub fn clean(records: &[TemporalRecord], policy: &CleaningPolicy) -> CleanedDataset {
    let mut counters = CleaningCounters::default();

    let mut records = deduplicate(records, &mut counters);

    let required = policy.fields_with(|r| matches!(r, FieldRule::DropIfMissing));
    let before = records.len();
    records.retain(|r| required.iter().all(|f| r.duration(f).is_some()));
    counters.dropped_missing = before - records.len();

    for field in policy.fields() {
        for rule in policy.rules(field) {
            if let FieldRule::ClipToRange { min, max } = *rule {
                let clipped = clip_field(&mut records, field, min, max);
                if clipped > 0 {
                    *counters.clipped.entry(field.to_string()).or_default() += clipped;
                }
            }
        }
    }

    for field in policy.fields_with(|r| matches!(r, FieldRule::ImputeMedian)) {
        let (filled, failed) = impute_median(&mut records, field);
        if filled > 0 {
            counters.imputed.insert(field.to_string(), filled);
        }
        if failed > 0 {
            warn!(stage = %Stage::Clean, field, failed, "no observations to impute from, values left missing");
            counters.failed_imputations.insert(field.to_string(), failed);
        }
    }

    info!(
        stage = %Stage::Clean,
        kept = records.len(),
        duplicates = counters.duplicates_removed,
        dropped = counters.dropped_missing,
        clipped = counters.total_clipped(),
        imputed = counters.total_imputed(),
        "cleaning pass complete"
    );

    CleanedDataset { records, counters }
}

/// Keeps the first record of every duplicate group. Two records are
/// duplicates when they share an id, or share branch, timestamp truncated to
/// the minute, and description.
fn deduplicate(records: &[TemporalRecord], counters: &mut CleaningCounters) -> Vec<TemporalRecord> {
    let mut seen_ids: HashSet<&str> = HashSet::new();
    let mut seen_keys: HashSet<(&str, i64, &str)> = HashSet::new();
    let mut kept = Vec::with_capacity(records.len());

    for record in records {
        let key = (
            record.branch.as_str(),
            record.timestamp.timestamp().div_euclid(60),
            record.description.trim(),
        );
        if seen_ids.contains(record.id.as_str()) || seen_keys.contains(&key) {
            counters.duplicates_removed += 1;
            continue;
        }
        seen_ids.insert(record.id.as_str());
        seen_keys.insert(key);
        kept.push(record.clone());
    }
    kept
}

fn clip_field(records: &mut [TemporalRecord], field: &str, min: f64, max: f64) -> usize {
    let mut events = 0;
    for record in records.iter_mut() {
        if let Some(Some(value)) = record.duration_fields.get_mut(field) {
            let clamped = value.clamp(min, max);
            if clamped != *value {
                *value = clamped;
                events += 1;
            }
        }
    }
    events
}

/// Returns `(filled, failed)`.
fn impute_median(records: &mut [TemporalRecord], field: &str) -> (usize, usize) {
    let mut by_branch: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    let mut global = Vec::new();
    for record in records.iter() {
        if let Some(v) = record.duration(field) {
            by_branch.entry(record.branch.as_str()).or_default().push(v);
            global.push(v);
        }
    }

    let branch_medians: BTreeMap<String, f64> = by_branch
        .into_iter()
        .filter_map(|(branch, values)| stats::median(&values).map(|m| (branch.to_string(), m)))
        .collect();
    let global_median = stats::median(&global);

    let (mut filled, mut failed) = (0, 0);
    for record in records.iter_mut() {
        if record.duration(field).is_some() {
            continue;
        }
        match branch_medians.get(&record.branch).copied().or(global_median) {
            Some(m) => {
                record.duration_fields.insert(field.to_string(), Some(m));
                filled += 1;
            }
            None => {
                record.duration_fields.insert(field.to_string(), None);
                failed += 1;
            }
        }
    }
    (filled, failed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FIELD_WAIT_TIME;
    use chrono::{TimeZone, Utc};

    fn record(id: &str, branch: &str, minute: u32, wait: Option<f64>, description: &str) -> TemporalRecord {
        let mut fields = BTreeMap::new();
        fields.insert(FIELD_WAIT_TIME.to_string(), wait);
        TemporalRecord {
            id: id.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0).unwrap(),
            branch: branch.to_string(),
            duration_fields: fields,
            description: description.to_string(),
            status: "completed".to_string(),
        }
    }

    fn impute_policy() -> CleaningPolicy {
        CleaningPolicy::new().with_rule(FIELD_WAIT_TIME, FieldRule::ImputeMedian)
    }

    // --- Deduplication ------------------------------------------------------

    #[test]
    fn test_duplicate_ids_keep_first_occurrence() {
        let records = vec![
            record("1", "a", 0, Some(5.0), "lab"),
            record("1", "a", 30, Some(9.0), "x-ray"),
            record("2", "a", 10, Some(6.0), "lab"),
            record("1", "b", 45, Some(7.0), "vaccine"),
        ];
        let cleaned = clean(&records, &CleaningPolicy::new());
        assert_eq!(cleaned.records.len(), 2);
        assert_eq!(cleaned.records[0].duration(FIELD_WAIT_TIME), Some(5.0));
        assert_eq!(cleaned.counters.duplicates_removed, 2);
    }

    #[test]
    fn test_same_branch_minute_and_description_is_duplicate() {
        let mut second = record("2", "a", 0, Some(6.0), " lab ");
        second.timestamp += chrono::Duration::seconds(40);
        let records = vec![record("1", "a", 0, Some(5.0), "lab"), second, record("3", "b", 0, Some(6.0), "lab")];
        let cleaned = clean(&records, &CleaningPolicy::new());
        let ids: Vec<_> = cleaned.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"], "other branch with same minute is not a duplicate");
    }

    #[test]
    fn test_cleaning_is_idempotent() {
        let policy = CleaningPolicy::new()
            .with_rule(FIELD_WAIT_TIME, FieldRule::ClipToRange { min: 0.0, max: 60.0 })
            .with_rule(FIELD_WAIT_TIME, FieldRule::ImputeMedian);
        let records = vec![
            record("1", "a", 0, Some(5.0), "lab"),
            record("1", "a", 5, Some(6.0), "lab"),
            record("2", "a", 10, None, "x-ray"),
            record("3", "b", 15, Some(500.0), "lab"),
            record("4", "b", 15, Some(8.0), "lab"),
        ];
        let once = clean(&records, &policy);
        let twice = clean(&once.records, &policy);
        assert_eq!(once.records, twice.records);
        assert_eq!(twice.counters.duplicates_removed, 0);
        assert_eq!(twice.counters.total_clipped(), 0);
    }

    // --- Drop and clip ------------------------------------------------------

    #[test]
    fn test_drop_if_missing_removes_records() {
        let policy = CleaningPolicy::new().with_rule(FIELD_WAIT_TIME, FieldRule::DropIfMissing);
        let records = vec![record("1", "a", 0, None, "lab"), record("2", "a", 1, Some(3.0), "lab")];
        let cleaned = clean(&records, &policy);
        assert_eq!(cleaned.records.len(), 1);
        assert_eq!(cleaned.counters.dropped_missing, 1);
    }

    #[test]
    fn test_clipping_clamps_and_counts() {
        let policy = CleaningPolicy::new()
            .with_rule(FIELD_WAIT_TIME, FieldRule::ClipToRange { min: 1.0, max: 60.0 });
        let records = vec![
            record("1", "a", 0, Some(0.0), "a"),
            record("2", "a", 1, Some(30.0), "b"),
            record("3", "a", 2, Some(95.0), "c"),
        ];
        let cleaned = clean(&records, &policy);
        let values: Vec<_> = cleaned.records.iter().map(|r| r.duration(FIELD_WAIT_TIME)).collect();
        assert_eq!(values, vec![Some(1.0), Some(30.0), Some(60.0)]);
        assert_eq!(cleaned.counters.clipped.get(FIELD_WAIT_TIME), Some(&2));
    }

    // --- Imputation ---------------------------------------------------------

    #[test]
    fn test_imputation_uses_branch_median() {
        let records = vec![
            record("1", "a", 0, Some(2.0), "a"),
            record("2", "a", 1, Some(4.0), "b"),
            record("3", "a", 2, None, "c"),
            record("4", "b", 3, Some(100.0), "d"),
        ];
        let cleaned = clean(&records, &impute_policy());
        assert_eq!(cleaned.records[2].duration(FIELD_WAIT_TIME), Some(3.0));
        assert_eq!(cleaned.counters.imputed.get(FIELD_WAIT_TIME), Some(&1));
    }

    #[test]
    fn test_imputation_falls_back_to_global_median() {
        let records = vec![
            record("1", "a", 0, Some(2.0), "a"),
            record("2", "a", 1, Some(4.0), "b"),
            record("3", "b", 2, Some(9.0), "c"),
            record("4", "c", 3, None, "d"),
        ];
        let cleaned = clean(&records, &impute_policy());
        assert_eq!(cleaned.records[3].duration(FIELD_WAIT_TIME), Some(4.0));
    }

    #[test]
    fn test_imputation_never_fabricates_when_no_values_exist() {
        let records = vec![record("1", "a", 0, None, "a"), record("2", "b", 1, None, "b")];
        let cleaned = clean(&records, &impute_policy());
        assert!(cleaned.records.iter().all(|r| r.duration(FIELD_WAIT_TIME).is_none()));
        assert_eq!(cleaned.counters.failed_imputations.get(FIELD_WAIT_TIME), Some(&2));
        assert!(cleaned.counters.imputed.is_empty());
    }

    // --- Policy validation --------------------------------------------------

    #[test]
    fn test_inverted_clip_range_is_rejected() {
        let policy = CleaningPolicy::new()
            .with_rule(FIELD_WAIT_TIME, FieldRule::ClipToRange { min: 10.0, max: 1.0 });
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_policy_parses_from_toml() {
        let policy: CleaningPolicy = toml::from_str(
            r#"
            [fields]
            wait_time = [{ rule = "clip_to_range", min = 0.0, max = 240.0 }, { rule = "impute_median" }]
            service_time = [{ rule = "drop_if_missing" }]
            "#,
        )
        .expect("policy should parse");
        assert_eq!(policy.rules("wait_time").len(), 2);
        assert_eq!(policy.rules("service_time"), &[FieldRule::DropIfMissing]);
        assert!(policy.rules("total_time").is_empty());
    }
}
