//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::{Error, Result};
use crate::orchestrator::OrchestratorConfig;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,

    /// OpenAI-compatible multimodal inference: verification + transcription.
    pub vision_api_key: SecretString,
    pub vision_endpoint: String,
    pub vision_model: String,
    pub whisper_endpoint: String,
    pub whisper_model: String,

    /// Empathic TTS for feedback audio.
    pub tts_api_key: SecretString,
    pub tts_endpoint: String,
    pub tts_voice: Option<String>,

    /// Where synthesized feedback audio files land.
    pub audio_dir: PathBuf,

    pub verify_timeout_secs: u64,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            vision_api_key: SecretString::from(required_var("VISION_API_KEY")?),
            vision_endpoint: var_or(
                "VISION_ENDPOINT",
                "https://api.sambanova.ai/v1/chat/completions",
            ),
            vision_model: var_or("VISION_MODEL", "Llama-4-Maverick-17B-128E-Instruct"),
            whisper_endpoint: var_or(
                "WHISPER_ENDPOINT",
                "https://api.sambanova.ai/v1/audio/transcriptions",
            ),
            whisper_model: var_or("WHISPER_MODEL", "Whisper-Large-v3"),
            tts_api_key: SecretString::from(required_var("TTS_API_KEY")?),
            tts_endpoint: var_or("TTS_ENDPOINT", "https://api.hume.ai/v0/tts/inference"),
            tts_voice: std::env::var("TTS_VOICE").ok(),
            audio_dir: PathBuf::from(var_or("AUDIO_DIR", "/var/lib/kakunin/audio")),
            verify_timeout_secs: var_or("VERIFY_TIMEOUT_SECS", "10")
                .parse()
                .map_err(|_| Error::Config("VERIFY_TIMEOUT_SECS must be an integer".into()))?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: var_or("LOG_LEVEL", "info"),
        })
    }

    /// Orchestrator deadlines derived from config, defaults elsewhere.
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            verify_timeout: Duration::from_secs(self.verify_timeout_secs),
            ..OrchestratorConfig::default()
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}
