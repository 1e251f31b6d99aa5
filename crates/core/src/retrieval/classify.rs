//! Maps fetch failure messages onto recorded outcomes.

use crate::deals::FetchResult;

/// Substring -> outcome, checked in order against the lower-cased message.
const FETCH_ERROR_CLASSES: &[(&str, FetchResult)] = &[
    ("retrieval timed out after", FetchResult::Timeout),
    (
        "there is no unsealed piece containing payload cid",
        FetchResult::NoUnsealed,
    ),
    ("not found", FetchResult::NotFound),
];

/// Classifies a failed fetch. Anything unrecognised is `ERR`.
pub fn classify_fetch_error(message: &str) -> FetchResult {
    let message = message.to_ascii_lowercase();
    FETCH_ERROR_CLASSES
        .iter()
        .find(|(needle, _)| message.contains(needle))
        .map(|(_, class)| *class)
        .unwrap_or(FetchResult::Error)
}
