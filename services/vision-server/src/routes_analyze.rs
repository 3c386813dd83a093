use axum::extract::{Multipart, State};
use axum::Json;
use bytes::{Bytes, BytesMut};
use modelops::{decode_image, Analysis, ModelOpsError, DEFAULT_PROMPT};
use serde::{Deserialize, Serialize};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct AnalyzeUrlReq {
    pub image_url: String,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Serialize)]
pub struct AnalyzeResp {
    pub status: &'static str,
    pub request_id: Uuid,
    pub result: String,
    pub model_used: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub processing_time_seconds: f64,
}

impl AnalyzeResp {
    fn new(request_id: Uuid, analysis: Analysis, prompt: String) -> Self {
        Self {
            status: "success",
            request_id,
            result: analysis.text,
            model_used: analysis.model_name,
            prompt,
            filename: None,
            image_url: None,
            processing_time_seconds: analysis.elapsed.as_secs_f64(),
        }
    }
}

struct Upload {
    filename: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

fn is_image_type(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("image/"))
}

fn prompt_or_default(prompt: Option<String>) -> String {
    prompt
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_PROMPT.to_string())
}

async fn ensure_loaded(st: &SharedState) -> Result<(), ApiError> {
    if st.models.lock().await.is_loaded() {
        Ok(())
    } else {
        Err(ModelOpsError::NoModelLoaded.into())
    }
}

/// Reads a fetched body, refusing anything over `limit` bytes whether or not
/// the server announced a length.
async fn read_capped(mut resp: reqwest::Response, limit: usize) -> Result<Bytes, ApiError> {
    let too_large = || ApiError::payload_too_large(format!("Image larger than {limit} bytes"));
    if resp.content_length().is_some_and(|len| len > limit as u64) {
        return Err(too_large());
    }

    let mut body = BytesMut::new();
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| ApiError::bad_gateway(format!("Failed to read image body: {e}")))?
    {
        if body.len() + chunk.len() > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

async fn run_analysis(st: &SharedState, data: Bytes, prompt: &str) -> Result<Analysis, ApiError> {
    // decoding is CPU bound
    let image = tokio::task::spawn_blocking(move || decode_image(&data))
        .await
        .map_err(|e| ApiError::internal(format!("image decode task failed: {e}")))??;

    let analysis = st.models.lock().await.analyze(&image, prompt).await?;
    Ok(analysis)
}

pub async fn post_analyze(
    State(st): State<SharedState>,
    mut mp: Multipart,
) -> Result<Json<AnalyzeResp>, ApiError> {
    ensure_loaded(&st).await?;

    let mut prompt: Option<String> = None;
    let mut upload: Option<Upload> = None;

    while let Some(field) = mp.next_field().await.map_err(|e| ApiError::bad_request(e.to_string()))? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("prompt") => {
                prompt = Some(field.text().await.map_err(|e| ApiError::bad_request(e.to_string()))?)
            }
            Some("file") => {
                let filename = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(|e| ApiError::bad_request(e.to_string()))?;
                upload = Some(Upload { filename, content_type, data });
            }
            _ => {}
        }
    }

    let upload = upload.ok_or_else(|| ApiError::bad_request("Missing file"))?;
    if !is_image_type(upload.content_type.as_deref()) {
        return Err(ApiError::bad_request("File must be an image"));
    }
    let prompt = prompt_or_default(prompt);

    let request_id = Uuid::new_v4();
    let span = info_span!("analyze", %request_id, filename = ?upload.filename);
    let analysis = run_analysis(&st, upload.data, &prompt).instrument(span).await?;

    let mut resp = AnalyzeResp::new(request_id, analysis, prompt);
    resp.filename = upload.filename;
    Ok(Json(resp))
}

pub async fn post_analyze_url(
    State(st): State<SharedState>,
    Json(req): Json<AnalyzeUrlReq>,
) -> Result<Json<AnalyzeResp>, ApiError> {
    ensure_loaded(&st).await?;

    let url = reqwest::Url::parse(&req.image_url)
        .map_err(|e| ApiError::bad_request(format!("Invalid image_url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::bad_request("image_url must be http or https"));
    }

    let request_id = Uuid::new_v4();
    let span = info_span!("analyze_url", %request_id, image_url = %req.image_url);

    let resp = st
        .http
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| {
            warn!(%request_id, "image fetch failed: {e}");
            ApiError::bad_gateway(format!("Failed to fetch image: {e}"))
        })?;

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if !is_image_type(content_type.as_deref()) {
        return Err(ApiError::bad_request("URL must point to an image"));
    }

    let data = read_capped(resp, st.config.max_upload_bytes).await.map_err(|e| {
        warn!(%request_id, "image body rejected: {}", e.error);
        e
    })?;

    let prompt = prompt_or_default(req.prompt);
    let analysis = run_analysis(&st, data, &prompt).instrument(span).await?;

    let mut resp = AnalyzeResp::new(request_id, analysis, prompt);
    resp.image_url = Some(req.image_url);
    Ok(Json(resp))
}
