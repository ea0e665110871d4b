/// Statistical analysis over cleaned visit records.
///
/// Submodules:
/// - `stats`:    mean, population std and interpolated quantiles.
/// - `outliers`: per-branch, per-bucket outlier detection.
/// - `profile`:  per-field data profile (missingness and distribution).

pub mod outliers;
pub mod profile;
pub mod stats;
