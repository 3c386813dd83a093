use std::path::PathBuf;

use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::schema::{Device, Placement};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub name: String,
    pub command: String,
}

#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub name: String,
    pub dir: PathBuf,
    pub placement: Placement,
}

/// What the runtime reports about the tokenizer it loaded next to the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenizerInfo {
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
}

#[derive(Debug, Clone)]
pub enum ChatContent {
    Image(RgbImage),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ChatContent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub sampling: bool,
    pub max_new_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_new_tokens: Option<u32>,
    pub enable_thinking: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            sampling: false,
            max_new_tokens: 1024,
            min_new_tokens: None,
            enable_thinking: false,
        }
    }
}

/// The inference runtime: turns a model directory into a resident model.
#[async_trait]
pub trait VisionRuntime: Send + Sync {
    /// Loads tokenizer and weights from `req.dir` with the requested placement.
    async fn load(&self, req: &LoadRequest) -> anyhow::Result<Box<dyn LoadedModel>>;

    /// Drops cached device allocations after a model went away.
    async fn reclaim_memory(&self) {}

    fn info(&self) -> RuntimeInfo;
}

/// A resident model together with its tokenizer.
#[async_trait]
pub trait LoadedModel: Send {
    fn tokenizer(&self) -> &TokenizerInfo;

    /// Device the runtime actually placed the weights on, when it says.
    fn device(&self) -> Option<Device> {
        None
    }

    /// False once the backing runtime is gone and every call will fail.
    fn is_alive(&self) -> bool {
        true
    }

    async fn set_inference_mode(&mut self) -> anyhow::Result<()>;

    /// Raw generation output; may be a string, a list of strings or anything else.
    async fn chat(
        &mut self,
        msgs: &[ChatMessage],
        params: &GenerationParams,
    ) -> anyhow::Result<serde_json::Value>;

    /// Moves weights off the accelerator.
    async fn offload(&mut self) -> anyhow::Result<()>;

    async fn release(self: Box<Self>) -> anyhow::Result<()>;
}
