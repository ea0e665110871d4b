//! Temporal outlier detection.
//!
//! Records are grouped by (branch, time bucket). For each configured metric
//! the bucket's observations form the baseline each record is scored
//! against. Output order is fully determined by sort keys: branch, bucket,
//! metric name, then record (timestamp, id).

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::analysis::stats;
use crate::clean::CleanedDataset;
use crate::error::ConfigError;
use crate::logging::Stage;
use crate::model::{
    Baseline, BaselineMethod, FIELD_SERVICE_TIME, FIELD_WAIT_TIME, Granularity, OutlierFlag,
    TemporalRecord, TimeBucket,
};

pub const DEFAULT_Z_THRESHOLD: f64 = 3.0;
pub const DEFAULT_MIN_BUCKET_SAMPLES: usize = 2;
pub const DEFAULT_IQR_K: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Zscore,
    Iqr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub granularity: Granularity,
    /// Duration fields to score. Kept sorted and unique after validation.
    pub metrics: Vec<String>,
    pub z_threshold: f64,
    pub min_bucket_samples: usize,
    pub method: DetectionMethod,
    /// Fence multiplier for the IQR method.
    pub iqr_k: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            granularity: Granularity::Hour,
            metrics: vec![FIELD_WAIT_TIME.to_string(), FIELD_SERVICE_TIME.to_string()],
            z_threshold: DEFAULT_Z_THRESHOLD,
            min_bucket_samples: DEFAULT_MIN_BUCKET_SAMPLES,
            method: DetectionMethod::Zscore,
            iqr_k: DEFAULT_IQR_K,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.z_threshold.is_finite() && self.z_threshold > 0.0) {
            return Err(ConfigError::invalid(
                "pipeline.z_threshold",
                format!("must be a finite number > 0, got {}", self.z_threshold),
            ));
        }
        if self.min_bucket_samples < 1 {
            return Err(ConfigError::invalid("pipeline.min_bucket_samples", "must be >= 1"));
        }
        if !(self.iqr_k.is_finite() && self.iqr_k > 0.0) {
            return Err(ConfigError::invalid(
                "pipeline.iqr_k",
                format!("must be a finite number > 0, got {}", self.iqr_k),
            ));
        }
        if self.metrics.iter().any(|m| m.trim().is_empty()) {
            return Err(ConfigError::invalid("pipeline.metrics", "metric names must not be blank"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Score every (record, metric) pair that has a value.
pub fn detect(cleaned: &CleanedDataset, config: &DetectorConfig) -> Vec<OutlierFlag> {
    let mut groups: BTreeMap<(&str, TimeBucket), Vec<&TemporalRecord>> = BTreeMap::new();
    for record in &cleaned.records {
        let bucket = TimeBucket::containing(record.timestamp, config.granularity);
        groups.entry((record.branch.as_str(), bucket)).or_default().push(record);
    }

    let metrics: BTreeSet<&str> = config.metrics.iter().map(String::as_str).collect();
    let mut flags = Vec::new();

    for ((branch, bucket), mut members) in groups {
        members.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        for metric in &metrics {
            let observed: Vec<(&TemporalRecord, f64)> = members
                .iter()
                .filter_map(|r| r.duration(metric).map(|v| (*r, v)))
                .collect();
            if observed.is_empty() {
                continue;
            }
            let values: Vec<f64> = observed.iter().map(|(_, v)| *v).collect();
            let scorer = Scorer::for_bucket(&values, config);

            if scorer.baseline.method == BaselineMethod::InsufficientData {
                debug!(stage = %Stage::Detect, branch, bucket = %bucket.label(), metric, samples = values.len(), "insufficient data");
            }

            for (record, value) in observed {
                let score = scorer.score(value);
                flags.push(OutlierFlag {
                    record_id: record.id.clone(),
                    branch: branch.to_string(),
                    bucket,
                    metric_name: metric.to_string(),
                    observed_value: value,
                    baseline: scorer.baseline,
                    score,
                    is_outlier: scorer.is_outlier(score),
                });
            }
        }
    }

    info!(
        stage = %Stage::Detect,
        evaluated = flags.len(),
        outliers = flags.iter().filter(|f| f.is_outlier).count(),
        insufficient_buckets = insufficient_buckets(&flags),
        "outlier detection complete"
    );
    flags
}

/// Number of distinct (branch, bucket, metric) groups that were not scored.
pub fn insufficient_buckets(flags: &[OutlierFlag]) -> usize {
    flags
        .iter()
        .filter(|f| f.baseline.method == BaselineMethod::InsufficientData)
        .map(|f| (f.branch.as_str(), f.bucket, f.metric_name.as_str()))
        .collect::<HashSet<_>>()
        .len()
}

/// Baseline and thresholds for one (bucket, metric) group.
struct Scorer {
    baseline: Baseline,
    z_threshold: f64,
    /// `(lower_fence, upper_fence, iqr)` for the IQR method.
    fences: Option<(f64, f64, f64)>,
}

impl Scorer {
    fn for_bucket(values: &[f64], config: &DetectorConfig) -> Self {
        let mean = stats::mean(values).unwrap_or(0.0);
        let std = stats::std_dev(values).unwrap_or(0.0);
        // Rounding in the mean leaves a tiny spread on uniform buckets.
        let std = if is_zero_spread(values, std, mean) { 0.0 } else { std };

        if values.len() < config.min_bucket_samples {
            return Scorer {
                baseline: Baseline { mean, std, method: BaselineMethod::InsufficientData },
                z_threshold: config.z_threshold,
                fences: None,
            };
        }

        match config.method {
            DetectionMethod::Zscore => Scorer {
                baseline: Baseline { mean, std, method: BaselineMethod::Zscore },
                z_threshold: config.z_threshold,
                fences: None,
            },
            DetectionMethod::Iqr => {
                let mut sorted = values.to_vec();
                sorted.sort_by(f64::total_cmp);
                let q1 = stats::quantile_sorted(&sorted, 0.25);
                let q3 = stats::quantile_sorted(&sorted, 0.75);
                let iqr = q3 - q1;
                Scorer {
                    baseline: Baseline { mean, std, method: BaselineMethod::Iqr },
                    z_threshold: config.z_threshold,
                    fences: Some((q1 - config.iqr_k * iqr, q3 + config.iqr_k * iqr, iqr)),
                }
            }
        }
    }

    fn score(&self, value: f64) -> f64 {
        match self.baseline.method {
            BaselineMethod::InsufficientData => 0.0,
            BaselineMethod::Zscore => {
                if self.baseline.std > 0.0 {
                    (value - self.baseline.mean) / self.baseline.std
                } else {
                    0.0
                }
            }
            BaselineMethod::Iqr => match self.fences {
                Some((lower, upper, iqr)) if iqr > 0.0 => {
                    if value < lower {
                        (value - lower) / iqr
                    } else if value > upper {
                        (value - upper) / iqr
                    } else {
                        0.0
                    }
                }
                _ => 0.0,
            },
        }
    }

    fn is_outlier(&self, score: f64) -> bool {
        match self.baseline.method {
            BaselineMethod::InsufficientData => false,
            BaselineMethod::Zscore => score.abs() >= self.z_threshold,
            BaselineMethod::Iqr => score != 0.0,
        }
    }
}

fn is_zero_spread(values: &[f64], std: f64, mean: f64) -> bool {
    let uniform = values.windows(2).all(|w| w[0] == w[1]);
    uniform || std <= f64::EPSILON * mean.abs().max(1.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
