//! Runtime configuration for llm-chat-gate.
//!
//! Values come from an optional JSON file, then command-line flags and their
//! environment variables override them. Everything is read once at startup
//! and handed to the core as plain values.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::inference::handle::EngineConfig;
use crate::inference::llama_ffi::ChatFormat;

pub const DEFAULT_MODEL_PATH: &str = "models/tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf";

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "llm-chat-gate", about = "Admission-controlled local LLM chat server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address.
    #[arg(long, env = "LISTEN_ADDR")]
    pub listen: Option<String>,

    /// Path to the GGUF weights.
    #[arg(long, env = "LLAMA_MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// CPU threads for the engine.
    #[arg(long, env = "LLAMA_CPP_THREADS")]
    pub threads: Option<usize>,

    /// Requests admitted at once. Non-integer or non-positive values mean 1.
    #[arg(long, env = "LLAMA_MAX_CONCURRENCY")]
    pub max_concurrency: Option<String>,

    /// Seconds a request may wait for admission before being rejected.
    #[arg(long, env = "LLAMA_REQUEST_QUEUE_TIMEOUT")]
    pub queue_timeout: Option<f64>,

    /// Comma-separated list of allowed CORS origins.
    #[arg(long, env = "FRONTEND_ORIGINS")]
    pub allowed_origins: Option<String>,

    /// Directory with a static frontend to serve for unmatched GETs.
    #[arg(long, env = "STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Model configuration.
    pub model: ModelConfig,

    /// Admission control.
    pub admission: AdmissionConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8000").
    pub listen: String,

    /// Origins allowed to make cross-origin requests.
    pub allowed_origins: Vec<String>,

    /// Optional static frontend directory.
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            static_dir: None,
        }
    }
}

/// Model-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path to the GGUF model file.
    pub model_path: PathBuf,

    /// Number of CPU threads.
    pub n_threads: usize,

    /// Context size in tokens.
    pub context_size: usize,

    /// Prompt template.
    pub chat_format: ChatFormat,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            n_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            context_size: 4096,
            chat_format: ChatFormat::Chatml,
        }
    }
}

/// Admission gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Requests admitted concurrently.
    pub max_concurrency: usize,

    /// Maximum wait for admission, in seconds.
    pub queue_timeout_secs: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            queue_timeout_secs: 10.0,
        }
    }
}

impl AdmissionConfig {
    /// Negative or NaN means no waiting; values too large to represent wait
    /// indefinitely.
    pub fn queue_timeout(&self) -> Duration {
        let secs = self.queue_timeout_secs;
        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Parse a concurrency limit; anything missing, unparsable or below 1 is 1.
pub fn resolve_concurrency_limit(raw: Option<&str>) -> usize {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|n| *n > 0)
        .map(|n| n as usize)
        .unwrap_or(1)
}

/// Split a comma-separated origin list, dropping blanks.
pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line / environment overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(path) = &cli.model_path {
            self.model.model_path = path.clone();
        }
        if let Some(threads) = cli.threads {
            self.model.n_threads = threads;
        }
        if cli.max_concurrency.is_some() {
            self.admission.max_concurrency =
                resolve_concurrency_limit(cli.max_concurrency.as_deref());
        }
        if let Some(timeout) = cli.queue_timeout {
            self.admission.queue_timeout_secs = timeout;
        }
        if let Some(origins) = &cli.allowed_origins {
            let origins = parse_origins(origins);
            if !origins.is_empty() {
                self.server.allowed_origins = origins;
            }
        }
        if let Some(dir) = &cli.static_dir {
            self.server.static_dir = Some(dir.clone());
        }
        self.admission.max_concurrency = self.admission.max_concurrency.max(1);
    }

    /// Engine identity derived from the model section.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new(&self.model.model_path, self.model.n_threads)
            .with_context_size(self.model.context_size)
    }
}
