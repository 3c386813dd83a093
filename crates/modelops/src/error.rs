use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelOpsError {
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("no model loaded")]
    NoModelLoaded,
    #[error("failed to load model {name}: {reason}")]
    Load { name: String, reason: String },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("invalid image: {0}")]
    InvalidImage(String),
}

impl ModelOpsError {
    /// True when the caller, not the service, is at fault.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ModelOpsError::Inference(_))
    }
}

pub type Result<T> = std::result::Result<T, ModelOpsError>;
