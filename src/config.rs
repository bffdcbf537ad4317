//! Configuration management
//!
//! Layered the usual way: built-in defaults, then an optional TOML file in
//! the platform config directory, then the process-wide environment
//! overrides (`TTS_SESSION_RECYCLE_SENTENCES`, `ORT_INTRA_OP_THREADS`,
//! `ORT_INTER_OP_THREADS`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::tts::model::OrtOptions;
use crate::tts::EngineSettings;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listen address for the narration server
    #[serde(default)]
    pub server: ServerConfig,
    /// Acoustic model and voice pack settings
    #[serde(default)]
    pub tts: TtsConfig,
    /// Chapter source settings
    #[serde(default)]
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Path to the ONNX acoustic model
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    /// Path to the voice pack (.bin / .npz / .json)
    #[serde(default = "default_voices_path")]
    pub voices_path: PathBuf,
    /// Sentences synthesized before the inference session is rebuilt
    #[serde(default = "default_recycle_sentences")]
    pub recycle_sentences: usize,
    /// ONNX Runtime intra-op thread count (0 lets the runtime choose)
    #[serde(default)]
    pub intra_op_threads: usize,
    /// ONNX Runtime inter-op thread count
    #[serde(default = "default_inter_op_threads")]
    pub inter_op_threads: usize,
}

fn default_model_path() -> PathBuf {
    PathBuf::from("models/kokoro-v1.0.onnx")
}

fn default_voices_path() -> PathBuf {
    PathBuf::from("models/voices-v1.0.bin")
}

fn default_recycle_sentences() -> usize {
    crate::tts::recycle::DEFAULT_RECYCLE_SENTENCES
}

fn default_inter_op_threads() -> usize {
    1
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            voices_path: default_voices_path(),
            recycle_sentences: default_recycle_sentences(),
            intra_op_threads: 0,
            inter_op_threads: default_inter_op_threads(),
        }
    }
}

impl TtsConfig {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            model_path: self.model_path.clone(),
            voices_path: self.voices_path.clone(),
            recycle_sentences: self.recycle_sentences,
            ort: OrtOptions {
                intra_op_threads: self.intra_op_threads,
                inter_op_threads: self.inter_op_threads,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Seconds a scraped novel index stays cached
    #[serde(default = "default_index_cache_ttl")]
    pub index_cache_ttl_secs: u64,
}

fn default_index_cache_ttl() -> u64 {
    30 * 60
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            index_cache_ttl_secs: default_index_cache_ttl(),
        }
    }
}

impl Config {
    /// Load configuration from the platform config directory, falling back
    /// to defaults when no file exists. Environment overrides win.
    pub fn load() -> Result<Config> {
        let mut config = match config_path() {
            Ok(path) if path.exists() => {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            _ => Config::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from an explicit file.
    pub fn load_from(path: &std::path::Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_usize("TTS_SESSION_RECYCLE_SENTENCES") {
            self.tts.recycle_sentences = n;
        }
        if let Some(n) = env_usize("ORT_INTRA_OP_THREADS") {
            self.tts.intra_op_threads = n;
        }
        if let Some(n) = env_usize("ORT_INTER_OP_THREADS") {
            self.tts.inter_op_threads = n;
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "chaptercast", "chaptercast")
        .context("failed to resolve project directories")?;
    Ok(base.config_dir().join("config.toml"))
}
