use serde::{Deserialize, Serialize};

/// Filter for one backfill run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillRequest {
    /// Providers to import. Empty falls back to the configured providers.
    #[serde(default)]
    pub providers: Vec<String>,
    /// Deals starting before this epoch are skipped.
    #[serde(default)]
    pub start_epoch: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillSummary {
    pub scanned: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub skipped_key: u64,
    pub skipped_malformed: u64,
    pub skipped_provider: u64,
    pub skipped_epoch: u64,
    pub skipped_label: u64,
    pub failed: u64,
}
