/// Tabular rendering of a `ReportSummary`
///
/// One row per (branch, bucket). Metric columns follow the fixed columns in
/// sorted metric order, four per metric. Missing numbers render as empty
/// cells, labels as `label:count` joined by `;`.

use serde::{Deserialize, Serialize};

use crate::report::aggregate::{ReportSummary, SummaryRow};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

const FIXED_COLUMNS: &[&str] = &[
    "branch",
    "bucket",
    "period_start",
    "records",
    "outlier_records",
    "outlier_rate",
    "unflagged_records",
    "unlabeled_records",
    "sla_compliance",
    "top_labels",
];

impl ReportSummary {
    pub fn to_table(&self) -> Table {
        let mut columns: Vec<String> = FIXED_COLUMNS.iter().map(|c| c.to_string()).collect();
        for metric in &self.metrics {
            for stat in ["count", "mean", "p50", "p90"] {
                columns.push(format!("{metric}_{stat}"));
            }
        }

        let rows = self.rows.iter().map(|row| render_row(row, &self.metrics)).collect();
        Table { columns, rows }
    }

    /// RFC 4180 CSV with a header line and CRLF line endings.
    pub fn to_csv(&self) -> String {
        let table = self.to_table();
        let mut out = String::new();
        push_csv_line(&mut out, &table.columns);
        for row in &table.rows {
            push_csv_line(&mut out, row);
        }
        out
    }
}

fn render_row(row: &SummaryRow, metrics: &[String]) -> Vec<String> {
    let mut cells = vec![
        row.branch.clone(),
        row.bucket.label(),
        row.bucket.period_start.to_rfc3339(),
        row.records.to_string(),
        row.outlier_records.to_string(),
        format_number(Some(row.outlier_rate)),
        row.unflagged_records.to_string(),
        row.unlabeled_records.to_string(),
        format_number(row.sla_compliance),
        row.top_labels
            .iter()
            .map(|l| format!("{}:{}", l.label, l.count))
            .collect::<Vec<_>>()
            .join(";"),
    ];

    for metric in metrics {
        match row.metrics.iter().find(|m| &m.metric == metric) {
            Some(summary) => {
                cells.push(summary.count.to_string());
                cells.push(format_number(summary.mean));
                cells.push(format_number(summary.p50));
                cells.push(format_number(summary.p90));
            }
            None => cells.extend(std::iter::repeat_n(String::new(), 4)),
        }
    }
    cells
}

fn format_number(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.3}")).unwrap_or_default()
}

fn push_csv_line(out: &mut String, cells: &[String]) {
    let escaped: Vec<String> = cells.iter().map(|c| escape_csv(c)).collect();
    out.push_str(&escaped.join(","));
    out.push_str("\r\n");
}

/// Quotes a field when it contains a comma, quote or line break, doubling
/// embedded quotes.
fn escape_csv(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
