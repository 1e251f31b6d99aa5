use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;

use dealbot_core::deals::{Deal, NewDeal, RetrievalOutcome};

use crate::errors::StorageError;

#[derive(Queryable, Identifiable, Insertable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::deals)]
#[diesel(primary_key(deal_id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DealDB {
    pub deal_id: i64,
    pub payload_cid: String,
    pub client: String,
    pub provider: String,
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub indexer_result: Option<String>,
    pub fetch_result: Option<String>,
    pub err_msg: Option<String>,
    pub last_update: Option<String>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::deals)]
pub struct NewDealDB {
    pub deal_id: i64,
    pub payload_cid: String,
    pub client: String,
    pub provider: String,
    pub start_epoch: i64,
    pub end_epoch: i64,
}

/// The outcome columns, always written together.
#[derive(AsChangeset, Debug, Clone)]
#[diesel(table_name = crate::schema::deals)]
#[diesel(treat_none_as_null = true)]
pub struct OutcomeChangesetDB {
    pub indexer_result: Option<String>,
    pub fetch_result: Option<String>,
    pub err_msg: Option<String>,
    pub last_update: Option<String>,
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidValue(format!("last_update '{value}': {e}")))
}

impl From<NewDeal> for NewDealDB {
    fn from(deal: NewDeal) -> Self {
        Self {
            deal_id: deal.deal_id,
            payload_cid: deal.payload_cid,
            client: deal.client,
            provider: deal.provider,
            start_epoch: deal.start_epoch,
            end_epoch: deal.end_epoch,
        }
    }
}

impl From<RetrievalOutcome> for OutcomeChangesetDB {
    fn from(outcome: RetrievalOutcome) -> Self {
        Self {
            indexer_result: outcome.indexer_result.map(|r| r.as_str().to_string()),
            fetch_result: outcome.fetch_result.map(|r| r.as_str().to_string()),
            err_msg: outcome.err_msg,
            last_update: Some(format_timestamp(&outcome.checked_at)),
        }
    }
}

impl TryFrom<DealDB> for Deal {
    type Error = dealbot_core::Error;

    fn try_from(db: DealDB) -> Result<Self, Self::Error> {
        Ok(Deal {
            deal_id: db.deal_id,
            payload_cid: db.payload_cid,
            client: db.client,
            provider: db.provider,
            start_epoch: db.start_epoch,
            end_epoch: db.end_epoch,
            indexer_result: db.indexer_result.as_deref().map(str::parse).transpose()?,
            fetch_result: db.fetch_result.as_deref().map(str::parse).transpose()?,
            err_msg: db.err_msg,
            last_update: db
                .last_update
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}
