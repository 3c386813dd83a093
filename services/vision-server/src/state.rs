use std::sync::Arc;

use modelops::{ModelManager, RuntimeInfo};
use tokio::sync::Mutex;

use crate::config::AppConfig;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    /// The one model slot; load, unload and analyze serialize on this lock.
    pub models: Arc<Mutex<ModelManager>>,
    /// Fixed for the life of the process, so readable without the slot lock.
    pub runtime: RuntimeInfo,
    pub config: AppConfig,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(models: ModelManager, config: AppConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()?;
        Ok(Self {
            runtime: models.runtime_info(),
            models: Arc::new(Mutex::new(models)),
            config,
            http,
        })
    }
}
