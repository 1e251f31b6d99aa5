use serde::{Deserialize, Serialize};

/// One manifest line describing an archived container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarInfo {
    /// Payload root expected inside the container.
    pub data_cid: String,
    #[serde(default)]
    pub piece_cid: String,
    #[serde(default)]
    pub piece_size: u64,
    #[serde(default)]
    pub car_size: u64,
    /// Object store key of the container.
    pub file_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerFetchSummary {
    pub entries: usize,
    pub malformed: usize,
    pub verified: usize,
    pub forwarded: usize,
    pub failed: usize,
}
