//! Manual triggers for the backfill, retrieval and container pipelines.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{error, info};

use dealbot_core::backfill::{BackfillRequest, BackfillSummary};
use dealbot_core::retrieval::{CycleSummary, RetrieveRequest};

use crate::error::{ApiError, ApiResult};
use crate::main_lib::AppState;

#[derive(Debug, Deserialize)]
struct ContainerFetchParams {
    path: PathBuf,
    parallel: Option<usize>,
}

async fn run_backfill(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BackfillRequest>,
) -> ApiResult<Json<BackfillSummary>> {
    let service = state
        .backfill
        .as_ref()
        .ok_or_else(|| ApiError::BadRequest("no deal snapshot configured".to_string()))?;
    info!(
        "[Backfill] Import requested (providers={:?}, startEpoch={})",
        request.providers, request.start_epoch
    );
    let summary = service.import(request, state.cancel.child_token()).await?;
    Ok(Json(summary))
}

async fn run_retrieve(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RetrieveRequest>,
) -> ApiResult<Json<CycleSummary>> {
    info!("[Retrieve] Manual cycle requested: {:?}", request);
    let cancel = state.cancel.child_token();
    let summary = state.retrieval.retrieve(request, &cancel).await?;
    Ok(Json(summary))
}

/// Starts a container fetch over a manifest and returns immediately.
async fn fetch_containers(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ContainerFetchParams>,
) -> ApiResult<StatusCode> {
    let service = state.containers.clone().ok_or_else(|| {
        ApiError::BadRequest("container fetch needs an object store and a sink".to_string())
    })?;
    if !params.path.is_file() {
        return Err(ApiError::BadRequest(format!(
            "manifest {} not found",
            params.path.display()
        )));
    }
    let parallel = params.parallel.unwrap_or(state.config.parallel).max(1);
    let cancel = state.cancel.child_token();

    info!("[Car] Processing manifest {} (parallel={})", params.path.display(), parallel);
    tokio::spawn(async move {
        match service.process_manifest(&params.path, parallel, cancel).await {
            Ok(summary) => info!("[Car] Manifest finished: {:?}", summary),
            Err(err) => error!("[Car] Manifest {} failed: {}", params.path.display(), err),
        }
    });

    Ok(StatusCode::ACCEPTED)
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/backfill", post(run_backfill))
        .route("/retrieve", post(run_retrieve))
        .route("/car", get(fetch_containers))
}
