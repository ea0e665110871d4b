/// Reporting over a completed run.
///
/// Submodules:
/// - `aggregate`: per (branch, bucket) summary rows.
/// - `table`:     string table and CSV rendering of a summary.
/// - `demand`:    hourly arrival profile per branch for capacity planning.

pub mod aggregate;
pub mod demand;
pub mod table;

pub use aggregate::{LabelCount, MetricSummary, ReportConfig, ReportSummary, SummaryRow, aggregate};
pub use demand::{DemandPoint, demand_profile};
pub use table::Table;
