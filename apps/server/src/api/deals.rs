use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};

use dealbot_core::deals::{Deal, DealListQuery};

use crate::error::{ApiError, ApiResult};
use crate::main_lib::AppState;

/// Checked deals, newest attempt first, ten per page.
async fn list_deals(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DealListQuery>,
) -> ApiResult<Json<Vec<Deal>>> {
    Ok(Json(state.repository.list_checked(&query)?))
}

async fn get_deal(
    State(state): State<Arc<AppState>>,
    Path(deal_id): Path<i64>,
) -> ApiResult<Json<Deal>> {
    state
        .repository
        .get_deal(deal_id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("deal {deal_id} not found")))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deals", get(list_deals))
        .route("/deals/:deal_id", get(get_deal))
}
