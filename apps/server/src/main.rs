mod api;
mod error;
mod main_lib;

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use dealbot_core::config::BotConfig;
use main_lib::{init_tracing, AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = ServerConfig::from_env();
    init_tracing(settings.debug);

    let config = BotConfig::init_repo(&settings.repo)
        .with_context(|| format!("opening repository {}", settings.repo.display()))?;
    let state = AppState::build(config, &settings.repo)?;
    state.start_background().await;

    let app = api::app_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&settings.listen)
        .await
        .with_context(|| format!("binding {}", settings.listen))?;
    info!("dealbot listening on {}", settings.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.cancel.clone()))
        .await?;

    state.shutdown().await;
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            match res {
                Ok(()) => info!("Ctrl-C received, shutting down"),
                Err(e) => {
                    tracing::error!("Failed to listen for Ctrl-C: {}", e);
                    cancel.cancelled().await;
                }
            }
        }
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
}
