/// Reference vocabulary of service categories.
///
/// Defines the default labels that free-text service descriptions are
/// matched against, each with a short description that is embedded at the
/// start of a run. Deployments can replace the list through the
/// `[[embedding.vocabulary]]` config table; this registry is the fallback.

use serde::{Deserialize, Serialize};

use crate::model::UNKNOWN_LABEL;

// ---------------------------------------------------------------------------
// Label metadata
// ---------------------------------------------------------------------------

/// One entry of the reference vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLabel {
    /// Stable identifier reported in summaries, e.g. `"laboratory"`.
    pub id: String,
    /// Text embedded to produce the label's reference vector.
    pub description: String,
}

/// Built-in service categories, ordered roughly by visit volume.
pub static DEFAULT_VOCABULARY: &[(&str, &str)] = &[
    (
        "general_consultation",
        "general medical consultation appointment with a physician check up",
    ),
    (
        "laboratory",
        "laboratory sample collection blood test urine test analysis results",
    ),
    (
        "imaging",
        "imaging study x-ray ultrasound scan radiology mammography",
    ),
    (
        "vaccination",
        "vaccination immunization vaccine dose injection",
    ),
    (
        "pharmacy",
        "pharmacy prescription pick up medication dispensing",
    ),
    (
        "specialist_consultation",
        "specialist consultation cardiology dermatology pediatrics gynecology",
    ),
    (
        "administrative",
        "administrative procedure registration billing payment certificate records request",
    ),
];

/// Returns the built-in vocabulary as owned labels.
pub fn default_labels() -> Vec<ServiceLabel> {
    DEFAULT_VOCABULARY
        .iter()
        .map(|(id, description)| ServiceLabel {
            id: id.to_string(),
            description: description.to_string(),
        })
        .collect()
}

/// Checks that label ids are usable as report keys: non-blank, lowercase
/// snake_case, and not the reserved `unknown` label.
pub fn is_valid_label_id(id: &str) -> bool {
    !id.is_empty()
        && id != UNKNOWN_LABEL
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
