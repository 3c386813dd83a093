use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::error::{ModelOpsError, Result};
use crate::inventory::{list_available, resolve_model_dir};
use crate::runtime::{GenerationParams, LoadRequest, LoadedModel, RuntimeInfo, TokenizerInfo, VisionRuntime};
use crate::schema::{Device, ModelInfo, Placement};

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub models_dir: PathBuf,
    pub device: Device,
    /// Pause between evicting a model and loading the next one.
    pub evict_settle: Duration,
    pub generation: GenerationParams,
}

/// The resident model. Name, device, model and tokenizer travel together,
/// so the slot is either fully populated or empty.
pub struct ActiveModel {
    pub name: String,
    /// Where the runtime actually put the weights.
    pub device: Device,
    pub tokenizer: TokenizerInfo,
    pub loaded_at: DateTime<Utc>,
    pub(crate) model: Box<dyn LoadedModel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    AlreadyLoaded,
    Loaded,
}

/// Owns the single model slot. Callers share it behind one mutex.
pub struct ModelManager {
    pub(crate) opts: LoaderOptions,
    runtime: Box<dyn VisionRuntime>,
    pub(crate) active: Option<ActiveModel>,
}

impl ModelManager {
    pub fn new(runtime: Box<dyn VisionRuntime>, opts: LoaderOptions) -> Self {
        info!(device = %opts.device, models_dir = %opts.models_dir.display(), "model manager: ready");
        Self {
            opts,
            runtime,
            active: None,
        }
    }

    /// Device of the resident model, or the configured one when the slot is empty.
    pub fn device(&self) -> Device {
        self.resident().map_or(self.opts.device, |a| a.device)
    }

    pub fn runtime_info(&self) -> RuntimeInfo {
        self.runtime.info()
    }

    pub fn list_available(&self) -> Vec<String> {
        list_available(&self.opts.models_dir)
    }

    /// The slot's occupant, unless its runtime died underneath it.
    fn resident(&self) -> Option<&ActiveModel> {
        self.active.as_ref().filter(|a| a.model.is_alive())
    }

    pub fn current_model(&self) -> Option<&str> {
        self.resident().map(|a| a.name.as_str())
    }

    pub fn is_loaded(&self) -> bool {
        self.resident().is_some()
    }

    pub fn info(&self) -> ModelInfo {
        let resident = self.resident();
        ModelInfo {
            loaded: resident.is_some(),
            model_name: resident.map(|a| a.name.clone()),
            device: self.device(),
            loaded_at: resident.map(|a| a.loaded_at),
            available_models: self.list_available(),
        }
    }

    /// Clears the slot when its model can no longer serve requests.
    pub(crate) async fn evict_dead(&mut self) {
        if self.active.as_ref().is_some_and(|a| !a.model.is_alive()) {
            if let Some(name) = self.unload().await {
                warn!(model = %name, "runtime for resident model is gone, slot cleared");
            }
        }
    }

    pub async fn load(&mut self, name: &str) -> Result<LoadOutcome> {
        self.evict_dead().await;
        if self.current_model() == Some(name) {
            info!(model = %name, "model already loaded");
            return Ok(LoadOutcome::AlreadyLoaded);
        }

        let Some(dir) = resolve_model_dir(&self.opts.models_dir, name) else {
            error!(model = %name, models_dir = %self.opts.models_dir.display(), "model path does not exist");
            return Err(ModelOpsError::ModelNotFound(name.to_string()));
        };

        if let Some(prev) = self.unload().await {
            info!(previous = %prev, next = %name, "evicted previous model");
            if !self.opts.evict_settle.is_zero() {
                tokio::time::sleep(self.opts.evict_settle).await;
            }
        }

        let placement = Placement::for_device(self.opts.device);
        info!(
            model = %name,
            dir = %dir.display(),
            precision = placement.precision.as_str(),
            device_map = placement.device_map.as_str(),
            "loading model"
        );

        let req = LoadRequest {
            name: name.to_string(),
            dir,
            placement,
        };
        let mut model = match self.runtime.load(&req).await {
            Ok(m) => m,
            Err(e) => {
                error!(model = %name, "failed to load model: {e:#}");
                self.runtime.reclaim_memory().await;
                return Err(ModelOpsError::Load {
                    name: name.to_string(),
                    reason: format!("{e:#}"),
                });
            }
        };

        let device = match model.device() {
            Some(actual) if actual != placement.device => {
                warn!(model = %name, requested = %placement.device, %actual, "runtime placed model on a different device");
                actual
            }
            Some(actual) => actual,
            None => placement.device,
        };

        if let Err(e) = model.set_inference_mode().await {
            error!(model = %name, "failed to switch model to inference mode: {e:#}");
            discard(self.runtime.as_ref(), device, name, model).await;
            return Err(ModelOpsError::Load {
                name: name.to_string(),
                reason: format!("{e:#}"),
            });
        }

        let tokenizer = model.tokenizer().clone();
        info!(model = %name, %device, tokenizer = ?tokenizer.kind, "model loaded");
        self.active = Some(ActiveModel {
            name: name.to_string(),
            device,
            tokenizer,
            loaded_at: Utc::now(),
            model,
        });
        Ok(LoadOutcome::Loaded)
    }

    /// Empties the slot. Returns the evicted model's name, `None` if nothing was loaded.
    pub async fn unload(&mut self) -> Option<String> {
        let active = self.active.take()?;
        info!(model = %active.name, "unloading model");
        discard(self.runtime.as_ref(), active.device, &active.name, active.model).await;
        info!(model = %active.name, "model unloaded and memory cleared");
        Some(active.name)
    }
}

/// Best effort teardown; failures are logged and never block the slot from clearing.
async fn discard(runtime: &dyn VisionRuntime, device: Device, name: &str, mut model: Box<dyn LoadedModel>) {
    if device == Device::Cuda && model.is_alive() {
        if let Err(e) = model.offload().await {
            warn!(model = %name, "offload before release failed: {e:#}");
        }
    }
    if let Err(e) = model.release().await {
        warn!(model = %name, "model release failed: {e:#}");
    }
    runtime.reclaim_memory().await;
}
