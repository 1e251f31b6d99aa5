use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveTime;
use diesel::prelude::*;
use diesel::r2d2::{self, Pool};
use diesel::SqliteConnection;
use log::debug;

use dealbot_core::deals::{
    Deal, DealListQuery, DealRepositoryTrait, NewDeal, OutcomeFilter, PendingDealQuery,
    PendingFilter, RetrievalOutcome, DEAL_LIST_PAGE_SIZE,
};
use dealbot_core::{Error, Result};

use super::model::{format_timestamp, DealDB, NewDealDB, OutcomeChangesetDB};
use crate::db::{get_connection, WriteHandle};
use crate::errors::StorageError;
use crate::schema::deals;
use crate::schema::deals::dsl::*;

pub struct DealRepository {
    pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
    writer: WriteHandle,
}

impl DealRepository {
    pub fn new(
        pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
        writer: WriteHandle,
    ) -> Self {
        DealRepository { pool, writer }
    }

    fn select_pending_for_provider(
        &self,
        conn: &mut SqliteConnection,
        provider_addr: &str,
        query: &PendingDealQuery,
    ) -> Result<Vec<DealDB>> {
        let mut sql = deals::table
            .filter(provider.eq(provider_addr.to_string()))
            .select(DealDB::as_select())
            .into_boxed();

        sql = match query.filter {
            PendingFilter::Due => {
                let day_start = query.as_of.date_naive().and_time(NaiveTime::MIN).and_utc();
                sql.filter(
                    last_update
                        .is_null()
                        .or(last_update.lt(format_timestamp(&day_start))),
                )
            }
            PendingFilter::Outcome(OutcomeFilter::Fetch(result)) => {
                sql.filter(fetch_result.eq(result.as_str()))
            }
            PendingFilter::Outcome(OutcomeFilter::Indexer(result)) => {
                sql.filter(indexer_result.eq(result.as_str()))
            }
        };

        if let Some(cap) = query.limit {
            sql = sql
                .order(diesel::dsl::sql::<diesel::sql_types::Integer>("RANDOM()"))
                .limit(cap);
        } else {
            sql = sql.order(deal_id.asc());
        }

        Ok(sql
            .load::<DealDB>(conn)
            .map_err(StorageError::from)?)
    }
}

fn into_deals(rows: Vec<DealDB>) -> Result<Vec<Deal>> {
    rows.into_iter().map(Deal::try_from).collect()
}

#[async_trait]
impl DealRepositoryTrait for DealRepository {
    async fn insert_if_absent(&self, deal: NewDeal) -> Result<bool> {
        let row: NewDealDB = deal.into();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<bool> {
                let written = diesel::insert_or_ignore_into(deals::table)
                    .values(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                if written == 0 {
                    debug!("[Registry] Deal {} already tracked", row.deal_id);
                }
                Ok(written > 0)
            })
            .await
    }

    fn select_pending(&self, query: &PendingDealQuery) -> Result<Vec<Deal>> {
        let mut conn = get_connection(&self.pool)?;
        let mut rows = Vec::new();
        for provider_addr in &query.providers {
            rows.extend(self.select_pending_for_provider(&mut conn, provider_addr, query)?);
        }
        into_deals(rows)
    }

    fn select_distinct_providers(&self) -> Result<Vec<String>> {
        let mut conn = get_connection(&self.pool)?;
        Ok(deals::table
            .select(provider)
            .distinct()
            .order(provider.asc())
            .load::<String>(&mut conn)
            .map_err(StorageError::from)?)
    }

    async fn update_outcome(&self, target_id: i64, outcome: RetrievalOutcome) -> Result<()> {
        let changes: OutcomeChangesetDB = outcome.into();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                let updated = diesel::update(deals::table.find(target_id))
                    .set(&changes)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                if updated == 0 {
                    return Err(Error::invalid_input(format!("unknown deal {target_id}")));
                }
                Ok(())
            })
            .await
    }

    fn get_deal(&self, target_id: i64) -> Result<Option<Deal>> {
        let mut conn = get_connection(&self.pool)?;
        deals::table
            .find(target_id)
            .select(DealDB::as_select())
            .first::<DealDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(Deal::try_from)
            .transpose()
    }

    fn list_checked(&self, query: &DealListQuery) -> Result<Vec<Deal>> {
        let mut conn = get_connection(&self.pool)?;
        let mut sql = deals::table
            .filter(last_update.is_not_null())
            .select(DealDB::as_select())
            .into_boxed();
        if let Some(needle) = query.client.as_deref().filter(|s| !s.is_empty()) {
            sql = sql.filter(client.like(format!("%{needle}%")));
        }
        if let Some(needle) = query.provider.as_deref().filter(|s| !s.is_empty()) {
            sql = sql.filter(provider.like(format!("%{needle}%")));
        }
        let rows = sql
            .order((last_update.desc(), deal_id.desc()))
            .offset(query.offset())
            .limit(DEAL_LIST_PAGE_SIZE)
            .load::<DealDB>(&mut conn)
            .map_err(StorageError::from)?;
        into_deals(rows)
    }
}
