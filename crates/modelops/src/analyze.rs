use std::time::{Duration, Instant};

use image::DynamicImage;
use serde_json::Value;
use tracing::{error, info};

use crate::active::ModelManager;
use crate::error::{ModelOpsError, Result};
use crate::runtime::{ChatContent, ChatMessage, Role};

/// Control markers removed from generated text. Anything else passes through.
pub const SENTINEL_TOKENS: &[&str] = &["<CLS>", "</CLS>"];

pub const DEFAULT_PROMPT: &str = "Describe the content of this image in detail.";

#[derive(Debug, Clone)]
pub struct Analysis {
    pub text: String,
    pub model_name: String,
    pub elapsed: Duration,
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| ModelOpsError::InvalidImage(e.to_string()))
}

/// Collapses whatever the model returned into a single string.
pub fn normalize_output(raw: Value) -> String {
    match raw {
        Value::String(s) => s,
        Value::Array(items) => match items.into_iter().next() {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => String::new(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn strip_sentinels(text: &str) -> String {
    let mut out = text.to_string();
    for token in SENTINEL_TOKENS {
        out = out.replace(token, "");
    }
    out.trim().to_string()
}

/// One user turn: the image followed by the prompt.
pub fn build_messages(image: &DynamicImage, prompt: &str) -> Vec<ChatMessage> {
    vec![ChatMessage {
        role: Role::User,
        content: vec![
            ChatContent::Image(image.to_rgb8()),
            ChatContent::Text(prompt.to_string()),
        ],
    }]
}

impl ModelManager {
    pub async fn analyze(&mut self, image: &DynamicImage, prompt: &str) -> Result<Analysis> {
        self.evict_dead().await;
        let Some(active) = self.active.as_mut() else {
            error!("no model loaded");
            return Err(ModelOpsError::NoModelLoaded);
        };

        let msgs = build_messages(image, prompt);
        info!(model = %active.name, width = image.width(), height = image.height(), "starting image analysis");

        let started = Instant::now();
        let raw = match active.model.chat(&msgs, &self.opts.generation).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(model = %active.name, "failed to analyze image: {e:?}");
                // a crashed runtime must not keep the slot
                self.evict_dead().await;
                return Err(ModelOpsError::Inference(format!("{e:#}")));
            }
        };
        let elapsed = started.elapsed();

        let text = strip_sentinels(&normalize_output(raw));
        info!(model = %active.name, elapsed_ms = elapsed.as_millis() as u64, chars = text.chars().count(), "image analysis completed");

        Ok(Analysis {
            text,
            model_name: active.name.clone(),
            elapsed,
        })
    }
}
