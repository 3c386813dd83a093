use axum::{extract::State, Json};
use modelops::{approx_size, list_available, LoadOutcome, ModelInfo};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::error::ApiError;
use crate::state::SharedState;

pub const SERVICE_NAME: &str = "Vision Analysis Server";

#[derive(Serialize)]
pub struct ModelItem {
    pub name: String,
    pub path: String,
    pub approx_bytes: Option<u64>,
    pub loaded: bool,
}

#[derive(Serialize)]
pub struct ModelsResponse {
    pub count: usize,
    pub items: Vec<ModelItem>,
    pub current_model: Option<String>,
    pub device: modelops::Device,
}

#[derive(Deserialize)]
pub struct LoadModelReq {
    pub model_name: String,
}

#[derive(Serialize)]
pub struct StatusResp {
    pub status: &'static str,
    pub message: String,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn root(State(st): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!({
        "name": SERVICE_NAME,
        "status": "running",
        "runtime": st.runtime,
        "health": "/health",
        "models": "/models",
        "model_info": "/model-info",
        "analyze": "/analyze",
        "analyze_url": "/analyze-url",
    }))
}

pub async fn get_models(State(st): State<SharedState>) -> Result<Json<ModelsResponse>, ApiError> {
    let (current_model, device) = {
        let mm = st.models.lock().await;
        (mm.current_model().map(str::to_string), mm.device())
    };

    // directory walks are blocking IO
    let root = st.config.models_dir.clone();
    let current = current_model.clone();
    let items = tokio::task::spawn_blocking(move || {
        list_available(&root)
            .into_iter()
            .map(|name| {
                let path = root.join(&name);
                ModelItem {
                    approx_bytes: approx_size(&path),
                    path: path.display().to_string(),
                    loaded: current.as_deref() == Some(name.as_str()),
                    name,
                }
            })
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|e| ApiError::internal(format!("model scan task failed: {e}")))?;

    Ok(Json(ModelsResponse {
        count: items.len(),
        items,
        current_model,
        device,
    }))
}

pub async fn get_model_info(State(st): State<SharedState>) -> Json<ModelInfo> {
    Json(st.models.lock().await.info())
}

pub async fn post_load_model(
    State(st): State<SharedState>,
    Json(req): Json<LoadModelReq>,
) -> Result<Json<StatusResp>, ApiError> {
    let outcome = st.models.lock().await.load(&req.model_name).await?;

    let message = match outcome {
        LoadOutcome::AlreadyLoaded => format!("Model {} already loaded", req.model_name),
        LoadOutcome::Loaded => format!("Model {} loaded successfully", req.model_name),
    };
    Ok(Json(StatusResp { status: "success", message }))
}

pub async fn post_unload_model(State(st): State<SharedState>) -> Json<StatusResp> {
    let message = match st.models.lock().await.unload().await {
        Some(name) => {
            info!(model = %name, "unloaded via api");
            format!("Model {name} unloaded successfully")
        }
        None => "No model currently loaded".to_string(),
    };
    Json(StatusResp { status: "success", message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{get, post_json, read_json, test_app, test_state};
    use axum::http::StatusCode;
    use std::time::Duration;

    #[tokio::test]
    async fn test_health() {
        let (app, _root) = test_app(Default::default());
        let resp = get(&app, "/health").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = read_json(resp).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], SERVICE_NAME);
    }

    #[tokio::test]
    async fn test_root_reports_runtime() {
        let (app, _root) = test_app(Default::default());
        let body = read_json(get(&app, "/").await).await;
        assert_eq!(body["runtime"]["name"], "fake");
        assert_eq!(body["analyze_url"], "/analyze-url");
    }

    #[tokio::test]
    async fn test_root_answers_while_slot_is_busy() {
        let (st, _root) = test_state(Default::default());
        let app = crate::app(st.clone());

        // a long load or analysis holds the slot lock
        let _busy = st.models.lock().await;
        let resp = tokio::time::timeout(Duration::from_secs(2), get(&app, "/"))
            .await
            .expect("index blocked on the model lock");
        assert_eq!(read_json(resp).await["runtime"]["name"], "fake");
    }

    #[tokio::test]
    async fn test_models_lists_valid_dirs() {
        let (app, _root) = test_app(Default::default());
        let body = read_json(get(&app, "/models").await).await;
        assert_eq!(body["count"], 2);
        assert_eq!(body["items"][0]["name"], "A");
        assert_eq!(body["items"][0]["approx_bytes"], 2);
        assert_eq!(body["items"][0]["loaded"], false);
        assert_eq!(body["items"][1]["name"], "C");
        assert!(body["current_model"].is_null());
        assert_eq!(body["device"], "cpu");
    }

    #[tokio::test]
    async fn test_load_then_unload() {
        let (app, _root) = test_app(Default::default());

        let resp = post_json(&app, "/load-model", json!({"model_name": "A"})).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(read_json(resp).await["message"], "Model A loaded successfully");

        let resp = post_json(&app, "/load-model", json!({"model_name": "A"})).await;
        assert_eq!(read_json(resp).await["message"], "Model A already loaded");

        let body = read_json(get(&app, "/models").await).await;
        assert_eq!(body["current_model"], "A");
        assert_eq!(body["items"][0]["loaded"], true);

        let resp = post_json(&app, "/unload-model", json!({})).await;
        assert_eq!(read_json(resp).await["message"], "Model A unloaded successfully");

        let resp = post_json(&app, "/unload-model", json!({})).await;
        assert_eq!(read_json(resp).await["message"], "No model currently loaded");

        let info = read_json(get(&app, "/model-info").await).await;
        assert_eq!(info["loaded"], false);
    }

    #[tokio::test]
    async fn test_load_unknown_model_is_bad_request() {
        let (app, _root) = test_app(Default::default());
        let resp = post_json(&app, "/load-model", json!({"model_name": "ghost"})).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(read_json(resp).await["error"].as_str().unwrap().contains("ghost"));
    }
}
