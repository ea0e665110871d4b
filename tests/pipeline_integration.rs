/// End-to-end tests for the visit analysis pipeline
///
/// These tests drive the public API the way the CLI does: CSV text in,
/// `PipelineOutput` out. They use the deterministic hashed-term model, so
/// they need no network or database.
///
/// Run with: cargo test --test pipeline_integration

use std::time::Duration;

use visitmon_service::embed::{EmbeddingModel, HashedTermModel};
use visitmon_service::error::EmbeddingError;
use visitmon_service::ingest::ColumnMap;
use visitmon_service::ingest::csv_rows::parse_rows_csv;
use visitmon_service::model::{BaselineMethod, RawRow};
use visitmon_service::{Pipeline, PipelineConfig, PipelineOutput};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

const HEADER: &str = "id,timestamp,branch,wait_time,service_time,description,status";

fn rows(body: &str) -> Vec<RawRow> {
    let text = format!("{HEADER}\n{body}");
    parse_rows_csv(&text, &ColumnMap::default()).expect("fixture CSV should parse")
}

fn run(config_toml: &str, body: &str) -> PipelineOutput {
    let config = PipelineConfig::from_toml_str(config_toml).expect("fixture config should be valid");
    let pipeline = Pipeline::new(config, Box::new(HashedTermModel::new(128, 17))).expect("pipeline should build");
    pipeline.run(&rows(body))
}

/// A model whose service is always down.
struct UnavailableModel;

impl EmbeddingModel for UnavailableModel {
    fn embed(&self, _text: &str, timeout: Duration) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Timeout(timeout))
    }

    fn dimensions(&self) -> usize {
        128
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

// ---------------------------------------------------------------------------
// Outlier Detection
// ---------------------------------------------------------------------------

#[test]
fn test_hourly_scenario_not_flagged_at_two_sigma() {
    let out = run(
        "[pipeline]\ngranularity = \"hour\"\nmetrics = [\"wait_time\"]\nz_threshold = 2.0\n",
        "1,2024-05-01 09:00:00,A,5,10,blood test,attended\n\
         2,2024-05-01 09:10:00,A,6,12,flu vaccine,attended\n\
         3,2024-05-01 09:20:00,A,50,9,x-ray scan,attended\n",
    );

    assert_eq!(out.flags.len(), 3);
    let high = out.flags.iter().find(|f| f.record_id == "3").expect("flag for record 3");
    assert!(
        (high.score - 1.414).abs() < 0.01,
        "population std gives a score of about 1.41, got {}",
        high.score
    );
    assert!(!high.is_outlier, "1.41 < 2.0 must not be flagged");
    assert_eq!(out.diagnostics.outliers, 0);
}

#[test]
fn test_flags_identical_across_runs() {
    let body = "1,2024-05-01 09:00:00,A,5,10,blood test,attended\n\
                2,2024-05-01 09:10:00,B,6,12,flu vaccine,attended\n\
                3,2024-05-01 09:20:00,A,50,9,x-ray scan,attended\n\
                4,2024-05-01 10:20:00,B,7,9,pharmacy pick up,attended\n\
                5,2024-05-01 10:25:00,B,8,9,,attended\n";
    let first = run("", body);
    let second = run("", body);
    assert_eq!(first.flags, second.flags);
    assert_eq!(first.summary, second.summary);
}

#[test]
fn test_single_record_bucket_is_insufficient_data() {
    let out = run(
        "[pipeline]\nmetrics = [\"wait_time\"]\n",
        "1,2024-05-01 09:00:00,A,500,10,blood test,attended\n",
    );
    assert_eq!(out.flags.len(), 1);
    assert_eq!(out.flags[0].baseline.method, BaselineMethod::InsufficientData);
    assert!(!out.flags[0].is_outlier);
    assert_eq!(out.diagnostics.insufficient_buckets, 1);
}

// ---------------------------------------------------------------------------
// Normalization and Cleaning
// ---------------------------------------------------------------------------

#[test]
fn test_malformed_rows_are_reported_not_fatal() {
    let out = run(
        "",
        "1,2024-05-01 09:00:00,A,5,10,blood test,attended\n\
         2,yesterday,A,6,12,flu vaccine,attended\n\
         3,2024-05-01 09:20:00,,50,9,x-ray scan,attended\n\
         4,2024-05-01 09:30:00,A,-3,9,x-ray scan,attended\n",
    );
    let reasons = &out.diagnostics.rejected_by_reason;
    assert_eq!(reasons.get("bad_timestamp"), Some(&1));
    assert_eq!(reasons.get("missing_required_field"), Some(&1));
    assert_eq!(out.rejected.len(), 2);
    assert_eq!(out.rejected[0].row_index, 1);

    // Negative durations become missing rather than rejecting the row
    assert_eq!(out.diagnostics.records_cleaned, 2);
}

#[test]
fn test_multiline_description_and_postgres_timestamps_run() {
    let out = run(
        "",
        "1,2024-05-01 09:00:00+00,A,5,10,\"blood test\nfasting\",attended\n\
         2,2024-05-01 09:10:00.250000,A,6,12,flu vaccine,attended\n",
    );
    assert!(out.rejected.is_empty(), "no row should be rejected: {:?}", out.rejected);
    assert_eq!(out.diagnostics.rows_read, 2, "the embedded newline stays inside one row");
    assert_eq!(out.summary.total_records, 2);
}

#[test]
fn test_duplicate_ids_keep_first_record() {
    let out = run(
        "",
        "7,2024-05-01 09:00:00,A,5,10,blood test,attended\n\
         7,2024-05-01 11:00:00,A,99,10,flu vaccine,attended\n\
         8,2024-05-01 09:30:00,A,6,10,flu vaccine,attended\n",
    );
    assert_eq!(out.cleaning.duplicates_removed, 1);
    assert_eq!(out.summary.total_records, 2);
    let kept = out.vectors.iter().find(|v| v.record_id == "7").expect("record 7 kept");
    assert_eq!(kept.nearest_label, "laboratory", "first record's description is the one kept");
}

#[test]
fn test_imputation_falls_back_to_global_median() {
    let out = run(
        "[cleaning.fields]\nwait_time = [{ rule = \"impute_median\" }]\n",
        "1,2024-05-01 09:00:00,A,4,10,blood test,attended\n\
         2,2024-05-01 09:10:00,A,8,10,blood test,attended\n\
         3,2024-05-01 09:20:00,B,NA,10,blood test,attended\n",
    );
    assert_eq!(out.cleaning.imputed.get("wait_time"), Some(&1));
    let before = out.profile_before.iter().find(|p| p.field == "wait_time").unwrap();
    let after = out.profile_after.iter().find(|p| p.field == "wait_time").unwrap();
    assert_eq!(before.missing, 1);
    assert_eq!(after.missing, 0);
    assert_eq!(after.max, Some(8.0));
    assert_eq!(after.p50, Some(6.0), "imputed value is the global median of 4 and 8");
}

// ---------------------------------------------------------------------------
// Embedding
// ---------------------------------------------------------------------------

#[test]
fn test_empty_description_is_unknown() {
    let out = run("", "1,2024-05-01 09:00:00,A,5,10,,attended\n");
    let v = &out.vectors[0];
    assert_eq!(v.nearest_label, "unknown");
    assert_eq!(v.similarity_score, 0.0);
    assert!(v.embedding.is_none());
    assert_eq!(out.diagnostics.embedding.empty_descriptions, 1);
}

#[test]
fn test_unavailable_model_degrades_to_unknown() {
    let config = PipelineConfig::from_toml_str("").unwrap();
    let pipeline = Pipeline::new(config, Box::new(UnavailableModel)).unwrap();
    let out = pipeline.run(&rows(
        "1,2024-05-01 09:00:00,A,5,10,blood test,attended\n\
         2,2024-05-01 09:10:00,A,6,12,Blood Test,attended\n",
    ));

    assert!(out.vectors.iter().all(|v| v.nearest_label == "unknown"));
    assert_eq!(out.diagnostics.embedding.fallbacks, 2);
    assert_eq!(out.diagnostics.embedding.model_calls, 1, "failures are cached per run");
    assert_eq!(out.diagnostics.reference_labels, 0);
    assert!(out.diagnostics.reference_failures > 0);
    assert_eq!(out.summary.total_records, 2, "the run still completes");
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[test]
fn test_every_cleaned_record_is_in_the_report() {
    let out = run(
        "[pipeline]\nmetrics = [\"wait_time\"]\n",
        "1,2024-05-01 09:00:00,A,5,10,blood test,attended\n\
         2,2024-05-01 09:10:00,A,NA,12,flu vaccine,attended\n\
         3,2024-05-01 13:20:00,B,50,9,x-ray scan,attended\n",
    );
    assert_eq!(out.summary.total_records, out.diagnostics.records_cleaned);
    assert_eq!(out.summary.unflagged_records, 1, "record 2 has no wait_time and no flag");
    let per_row: usize = out.summary.rows.iter().map(|r| r.records).sum();
    assert_eq!(per_row, 3);
}

#[test]
fn test_csv_report_has_one_line_per_group() {
    let out = run(
        "",
        "1,2024-05-01 09:00:00,A,5,10,blood test,attended\n\
         2,2024-05-01 10:10:00,A,6,12,flu vaccine,attended\n",
    );
    let csv = out.summary.to_csv();
    assert_eq!(csv.lines().count(), 3, "header plus two hourly groups");
    assert!(csv.starts_with("branch,bucket,"));
}

#[test]
fn test_output_serializes_to_json() {
    let out = run("", "1,2024-05-01 09:00:00,A,5,10,blood test,attended\n");
    let json = serde_json::to_value(&out).expect("output should serialize");
    assert!(json["diagnostics"]["rows_read"].as_u64() == Some(1));
    assert!(json["summary"]["rows"].is_array());
    assert_eq!(json["flags"][0]["baseline"]["method"], "insufficient_data");
}
