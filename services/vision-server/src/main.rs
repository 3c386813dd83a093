mod config;
mod error;
mod routes_analyze;
mod routes_models;
mod state;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::DefaultBodyLimit, routing::{get, post}, Router};
use modelops::{Device, GenerationParams, LoaderOptions, ModelManager, WorkerOptions, WorkerRuntime};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::state::{AppState, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = AppConfig::from_env()?;
    startup_checks(&cfg);

    let device = Device::detect(&cfg.device);
    info!(%device, "using device");

    let runtime = WorkerRuntime::new(WorkerOptions {
        python: cfg.worker_python.clone(),
        script: cfg.worker_script.clone(),
        load_timeout: cfg.load_timeout,
    });
    let manager = ModelManager::new(
        Box::new(runtime),
        LoaderOptions {
            models_dir: cfg.models_dir.clone(),
            device,
            evict_settle: cfg.evict_settle,
            generation: GenerationParams {
                max_new_tokens: cfg.max_new_tokens,
                min_new_tokens: cfg.min_new_tokens,
                ..GenerationParams::default()
            },
        },
    );

    let app_state = Arc::new(AppState::new(manager, cfg.clone()).context("Failed to build http client")?);

    if let Some(name) = cfg.default_model.clone() {
        let st = app_state.clone();
        tokio::spawn(async move {
            info!(model = %name, "loading default model");
            if let Err(e) = st.models.lock().await.load(&name).await {
                warn!(model = %name, "default model load failed: {e}");
            }
        });
    }

    let app = app(app_state.clone());

    let addr = cfg.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("vision-server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // let the worker exit cleanly before the process does
    if let Some(name) = app_state.models.lock().await.unload().await {
        info!(model = %name, "released model on shutdown");
    }

    Ok(())
}

pub(crate) fn app(state: SharedState) -> Router {
    let upload_limit = state.config.max_upload_bytes;
    Router::new()
        .route("/", get(routes_models::root))
        .route("/health", get(routes_models::health))
        .route("/models", get(routes_models::get_models))
        .route("/model-info", get(routes_models::get_model_info))
        .route("/load-model", post(routes_models::post_load_model))
        .route("/unload-model", post(routes_models::post_unload_model))
        .route("/analyze", post(routes_analyze::post_analyze))
        .route("/analyze-url", post(routes_analyze::post_analyze_url))
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn startup_checks(cfg: &AppConfig) {
    if !cfg.models_dir.is_dir() {
        warn!(models_dir = %cfg.models_dir.display(), "model directory missing, no models will be listed");
    }
    if !cfg.worker_script.is_file() {
        warn!(script = %cfg.worker_script.display(), "worker script not found, model loads will fail");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
