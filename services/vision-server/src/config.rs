use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub models_dir: PathBuf,
    pub device: String,

    pub worker_python: String,
    pub worker_script: PathBuf,
    pub load_timeout: Duration,
    pub evict_settle: Duration,

    pub max_new_tokens: u32,
    pub min_new_tokens: Option<u32>,

    pub fetch_timeout: Duration,
    pub max_upload_bytes: usize,
    pub default_model: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_or("SERVER_PORT", 8207u16)?;
        let models_dir = PathBuf::from(std::env::var("MODEL_PATH").unwrap_or_else(|_| "./models".to_string()));
        let device = std::env::var("MODEL_DEVICE").unwrap_or_else(|_| "auto".to_string());

        let worker_python = std::env::var("WORKER_PYTHON").unwrap_or_else(|_| "python3".to_string());
        let worker_script = PathBuf::from(
            std::env::var("WORKER_SCRIPT").unwrap_or_else(|_| "workers/vision_worker.py".to_string()),
        );
        let load_timeout = Duration::from_secs(parse_or("LOAD_TIMEOUT_SECS", 600u64)?);
        let evict_settle = Duration::from_millis(parse_or("EVICT_SETTLE_MS", 2000u64)?);

        let max_new_tokens = parse_or("MAX_NEW_TOKENS", 1024u32)?;
        let min_new_tokens = parse_opt::<u32>("MIN_NEW_TOKENS")?;

        let fetch_timeout = Duration::from_secs(parse_or("FETCH_TIMEOUT_SECS", 30u64)?);
        let max_upload_bytes = parse_or("MAX_UPLOAD_MB", 20usize)? * 1024 * 1024;
        let default_model = std::env::var("DEFAULT_MODEL").ok().filter(|v| !v.trim().is_empty());

        let cfg = Self {
            host,
            port,
            models_dir,
            device,
            worker_python,
            worker_script,
            load_timeout,
            evict_settle,
            max_new_tokens,
            min_new_tokens,
            fetch_timeout,
            max_upload_bytes,
            default_model,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Tiny sanity checks (fail fast, fail loud)
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.device.to_ascii_lowercase().as_str(), "auto" | "cuda" | "gpu" | "cpu") {
            bail!("MODEL_DEVICE must be one of auto, cuda, cpu");
        }
        if self.max_new_tokens == 0 {
            bail!("MAX_NEW_TOKENS must be positive");
        }
        if let Some(min) = self.min_new_tokens {
            if min > self.max_new_tokens {
                bail!("MIN_NEW_TOKENS ({min}) exceeds MAX_NEW_TOKENS ({})", self.max_new_tokens);
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_opt<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("Invalid value for env var {key}: {v}")),
        _ => Ok(None),
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(parse_opt(key)?.unwrap_or(default))
}
