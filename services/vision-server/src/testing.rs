use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use modelops::{
    ChatMessage, Device, GenerationParams, LoadRequest, LoadedModel, LoaderOptions, ModelManager,
    RuntimeInfo, TokenizerInfo, VisionRuntime,
};
use tower::ServiceExt;

use crate::config::AppConfig;
use crate::state::{AppState, SharedState};

#[derive(Clone, Copy, Default)]
pub struct FakeOptions {
    pub fail_generation: bool,
}

struct FakeRuntime {
    opts: FakeOptions,
}

struct FakeModel {
    opts: FakeOptions,
    tokenizer: TokenizerInfo,
}

#[async_trait]
impl VisionRuntime for FakeRuntime {
    async fn load(&self, req: &LoadRequest) -> anyhow::Result<Box<dyn LoadedModel>> {
        if !req.dir.join("config.json").is_file() {
            anyhow::bail!("no config.json in {}", req.dir.display());
        }
        Ok(Box::new(FakeModel { opts: self.opts, tokenizer: TokenizerInfo::default() }))
    }

    fn info(&self) -> RuntimeInfo {
        RuntimeInfo { name: "fake".to_string(), command: "none".to_string() }
    }
}

#[async_trait]
impl LoadedModel for FakeModel {
    fn tokenizer(&self) -> &TokenizerInfo {
        &self.tokenizer
    }

    async fn set_inference_mode(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn chat(
        &mut self,
        _msgs: &[ChatMessage],
        _params: &GenerationParams,
    ) -> anyhow::Result<serde_json::Value> {
        if self.opts.fail_generation {
            anyhow::bail!("CUDA error: out of memory");
        }
        Ok(serde_json::json!(["<CLS>a red square</CLS>"]))
    }

    async fn offload(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn test_config(models_dir: PathBuf) -> AppConfig {
    AppConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        models_dir,
        device: "cpu".to_string(),
        worker_python: "python3".to_string(),
        worker_script: PathBuf::from("workers/vision_worker.py"),
        load_timeout: Duration::from_secs(5),
        evict_settle: Duration::ZERO,
        max_new_tokens: 1024,
        min_new_tokens: None,
        fetch_timeout: Duration::from_secs(5),
        max_upload_bytes: 1024 * 1024,
        default_model: None,
    }
}

/// State over a models root holding `A/` and `C/` (valid) and `B/` (no config).
pub fn test_state(opts: FakeOptions) -> (SharedState, tempfile::TempDir) {
    let root = tempfile::tempdir().unwrap();
    for name in ["A", "C"] {
        std::fs::create_dir(root.path().join(name)).unwrap();
        std::fs::write(root.path().join(name).join("config.json"), "{}").unwrap();
    }
    std::fs::create_dir(root.path().join("B")).unwrap();

    let cfg = test_config(root.path().to_path_buf());
    let manager = ModelManager::new(
        Box::new(FakeRuntime { opts }),
        LoaderOptions {
            models_dir: cfg.models_dir.clone(),
            device: Device::Cpu,
            evict_settle: cfg.evict_settle,
            generation: GenerationParams::default(),
        },
    );
    (Arc::new(AppState::new(manager, cfg).unwrap()), root)
}

pub fn test_app(opts: FakeOptions) -> (Router, tempfile::TempDir) {
    let (state, root) = test_state(opts);
    (crate::app(state), root)
}

pub fn png_bytes() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(4, 4, image::Rgb([255, 0, 0]));
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    let req = Request::get(uri).body(Body::empty()).unwrap();
    app.clone().oneshot(req).await.unwrap()
}

pub async fn post_json(app: &Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    let req = Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.clone().oneshot(req).await.unwrap()
}

pub async fn read_json(resp: Response<Body>) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

const BOUNDARY: &str = "vision-server-test-boundary";

pub fn multipart_request(
    uri: &str,
    content_type: Option<&str>,
    data: &[u8],
    prompt: Option<&str>,
) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"file\"; filename=\"cat.png\"\r\n");
    if let Some(ct) = content_type {
        body.extend_from_slice(format!("Content-Type: {ct}\r\n").as_bytes());
    }
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n");
    if let Some(p) = prompt {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"prompt\"\r\n\r\n");
        body.extend_from_slice(p.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::post(uri)
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}
