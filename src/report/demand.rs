/// Hourly demand profile for capacity planning.
///
/// For each branch, arrivals are counted per hour of day and divided by the
/// number of distinct calendar days the branch appears in the data. A branch
/// that was closed on a given day is therefore not diluted by it.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{NaiveDate, Timelike};
use serde::{Deserialize, Serialize};

use crate::clean::CleanedDataset;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandPoint {
    pub branch: String,
    /// Hour of day, 0-23, UTC.
    pub hour: u32,
    pub avg_arrivals: f64,
}

/// All 24 hours for every branch, sorted by (branch, hour).
pub fn demand_profile(cleaned: &CleanedDataset) -> Vec<DemandPoint> {
    let mut days: BTreeMap<&str, BTreeSet<NaiveDate>> = BTreeMap::new();
    let mut arrivals: BTreeMap<&str, [usize; 24]> = BTreeMap::new();

    for record in &cleaned.records {
        let branch = record.branch.as_str();
        days.entry(branch).or_default().insert(record.timestamp.date_naive());
        arrivals.entry(branch).or_insert([0; 24])[record.timestamp.hour() as usize] += 1;
    }

    let mut profile = Vec::with_capacity(arrivals.len() * 24);
    for (branch, counts) in arrivals {
        let n_days = days.get(branch).map_or(1, BTreeSet::len).max(1) as f64;
        for (hour, count) in counts.iter().enumerate() {
            profile.push(DemandPoint {
                branch: branch.to_string(),
                hour: hour as u32,
                avg_arrivals: *count as f64 / n_days,
            });
        }
    }
    profile
}
