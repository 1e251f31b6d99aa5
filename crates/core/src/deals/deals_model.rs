//! Deal records and retrieval outcomes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Rows per page in the checked-deal listing.
pub const DEAL_LIST_PAGE_SIZE: i64 = 10;

/// Outcome of the content indexer lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexerResult {
    Ok,
    NotFound,
}

impl IndexerResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NotFound => "NOT_FOUND",
        }
    }
}

impl FromStr for IndexerResult {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(Self::Ok),
            "NOT_FOUND" => Ok(Self::NotFound),
            other => Err(Error::invalid_input(format!(
                "unknown indexer result '{other}'"
            ))),
        }
    }
}

/// Outcome of the block fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FetchResult {
    Ok,
    #[serde(rename = "ERR")]
    Error,
    Timeout,
    NotFound,
    NoUnsealed,
}

impl FetchResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Error => "ERR",
            Self::Timeout => "TIMEOUT",
            Self::NotFound => "NOTFOUND",
            Self::NoUnsealed => "NOUNSEALED",
        }
    }
}

impl fmt::Display for FetchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FetchResult {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "OK" => Ok(Self::Ok),
            "ERR" => Ok(Self::Error),
            "TIMEOUT" => Ok(Self::Timeout),
            "NOTFOUND" => Ok(Self::NotFound),
            "NOUNSEALED" => Ok(Self::NoUnsealed),
            other => Err(Error::invalid_input(format!("unknown fetch result '{other}'"))),
        }
    }
}

/// A tracked storage deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    pub deal_id: i64,
    pub payload_cid: String,
    pub client: String,
    pub provider: String,
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub indexer_result: Option<IndexerResult>,
    pub fetch_result: Option<FetchResult>,
    pub err_msg: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

/// A deal as discovered on chain or in a snapshot, before any attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDeal {
    pub deal_id: i64,
    pub payload_cid: String,
    pub client: String,
    pub provider: String,
    pub start_epoch: i64,
    pub end_epoch: i64,
}

/// Everything one retrieval attempt writes back to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalOutcome {
    pub indexer_result: Option<IndexerResult>,
    pub fetch_result: Option<FetchResult>,
    pub err_msg: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl RetrievalOutcome {
    pub fn success(indexer_result: Option<IndexerResult>) -> Self {
        Self {
            indexer_result,
            fetch_result: Some(FetchResult::Ok),
            err_msg: None,
            checked_at: Utc::now(),
        }
    }

    /// No candidate advertised the content. The fetch never ran.
    pub fn indexer_miss(message: impl Into<String>) -> Self {
        Self {
            indexer_result: Some(IndexerResult::NotFound),
            fetch_result: None,
            err_msg: Some(message.into()),
            checked_at: Utc::now(),
        }
    }

    pub fn failed(
        indexer_result: Option<IndexerResult>,
        fetch_result: FetchResult,
        message: impl Into<String>,
    ) -> Self {
        Self {
            indexer_result,
            fetch_result: Some(fetch_result),
            err_msg: Some(message.into()),
            checked_at: Utc::now(),
        }
    }

    /// The outcome bucket used in cycle summaries.
    pub fn label(&self) -> &'static str {
        match (self.fetch_result, self.indexer_result) {
            (Some(fetch), _) => fetch.as_str(),
            (None, Some(indexer)) => indexer.as_str(),
            (None, None) => "UNKNOWN",
        }
    }
}

/// Selects rows by their last recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OutcomeFilter {
    Fetch(FetchResult),
    Indexer(IndexerResult),
}

impl FromStr for OutcomeFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let s = s.trim().to_ascii_uppercase();
        if s == IndexerResult::NotFound.as_str() {
            return Ok(Self::Indexer(IndexerResult::NotFound));
        }
        s.parse::<FetchResult>().map(Self::Fetch)
    }
}

impl TryFrom<String> for OutcomeFilter {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Error> {
        value.parse()
    }
}

impl From<OutcomeFilter> for String {
    fn from(value: OutcomeFilter) -> Self {
        match value {
            OutcomeFilter::Fetch(fetch) => fetch.as_str().to_string(),
            OutcomeFilter::Indexer(indexer) => indexer.as_str().to_string(),
        }
    }
}

/// Which rows count as pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingFilter {
    /// Never attempted, or last attempted before the current UTC day.
    Due,
    /// Last outcome equals the filter, regardless of when it was recorded.
    Outcome(OutcomeFilter),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDealQuery {
    pub providers: Vec<String>,
    /// Per-provider cap. When set, rows are sampled at random.
    pub limit: Option<i64>,
    pub filter: PendingFilter,
    /// Reference instant for the `Due` rule.
    pub as_of: DateTime<Utc>,
}

impl PendingDealQuery {
    pub fn new(providers: Vec<String>, limit: Option<i64>, filter: PendingFilter) -> Self {
        Self {
            providers,
            limit: limit.filter(|l| *l > 0),
            filter,
            as_of: Utc::now(),
        }
    }
}

/// Page request for the checked-deal listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealListQuery {
    pub client: Option<String>,
    pub provider: Option<String>,
    /// 1-based.
    pub page: Option<i64>,
}

impl DealListQuery {
    pub fn offset(&self) -> i64 {
        (self.page.unwrap_or(1).max(1) - 1).saturating_mul(DEAL_LIST_PAGE_SIZE)
    }
}
