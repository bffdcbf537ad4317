//! Streaming TTS engine
//!
//! Ties the pipeline together: sentence segmentation, serialized blocking
//! inference on the acoustic model, float32 post-processing, periodic
//! session recycling, and the bounded producer/consumer stream that feeds
//! the session controller.

pub mod audio;
pub mod model;
pub mod recycle;
pub mod segment;
pub mod stream;
pub mod voices;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::info;

use crate::error::SpeechError;
use audio::PausePolicy;
use model::{AcousticModel, ModelFactory, OnnxSynthesizer, OrtOptions};
use recycle::SessionRecycler;

pub use segment::SentenceSegment;
pub use stream::{AudioStream, CancelFlag, EmitMode, StreamEvent, StreamOptions};

/// Output sample rate of the acoustic model, mono.
pub const SAMPLE_RATE: u32 = 24_000;

/// Everything needed to build (and rebuild) the engine's model session.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub model_path: PathBuf,
    pub voices_path: PathBuf,
    pub recycle_sentences: usize,
    pub ort: OrtOptions,
}

pub struct TtsEngine {
    live: Arc<Mutex<Box<dyn AcousticModel>>>,
    factory: ModelFactory,
    recycler: tokio::sync::Mutex<SessionRecycler>,
    voices_path: PathBuf,
    catalog: OnceCell<Vec<String>>,
    pause_policy: PausePolicy,
    fade_ms: u32,
}

impl TtsEngine {
    /// Build the engine around an arbitrary model factory. The first model
    /// is built synchronously so a broken setup fails at startup.
    pub fn new(
        factory: ModelFactory,
        voices_path: impl Into<PathBuf>,
        recycle_sentences: usize,
    ) -> anyhow::Result<Self> {
        let initial = factory().context("failed to build initial model session")?;
        Ok(Self {
            live: Arc::new(Mutex::new(initial)),
            factory,
            recycler: tokio::sync::Mutex::new(SessionRecycler::new(recycle_sentences)),
            voices_path: voices_path.into(),
            catalog: OnceCell::new(),
            pause_policy: PausePolicy::default(),
            fade_ms: audio::DEFAULT_FADE_MS,
        })
    }

    /// Build the engine with the ONNX synthesizer described by `settings`.
    pub fn from_settings(settings: &EngineSettings) -> anyhow::Result<Self> {
        let model_path = settings.model_path.clone();
        let voices_path = settings.voices_path.clone();
        let ort = settings.ort;
        let factory: ModelFactory = Arc::new(move || {
            OnnxSynthesizer::load(&model_path, &voices_path, ort)
                .map(|m| Box::new(m) as Box<dyn AcousticModel>)
        });
        info!(
            "Initializing TTS engine: model={} voices={}",
            settings.model_path.display(),
            settings.voices_path.display()
        );
        Self::new(factory, settings.voices_path.clone(), settings.recycle_sentences)
    }

    /// Sorted voice IDs from the voice pack, read once per process.
    pub fn voices(&self) -> Result<&[String], SpeechError> {
        self.catalog
            .get_or_try_init(|| voices::load_voice_ids(&self.voices_path))
            .map(|v| v.as_slice())
    }

    /// Validate a requested voice against the catalog. A missing or unknown
    /// voice falls back to the first catalog entry; an empty catalog means
    /// the engine cannot speak at all.
    pub fn resolve_voice(&self, requested: Option<&str>) -> Result<String, SpeechError> {
        let voices = self.voices()?;
        let first = voices
            .first()
            .ok_or_else(|| SpeechError::TtsNotReady("voice catalog is empty".to_string()))?;
        match requested {
            Some(v) if voices.iter().any(|known| known == v) => Ok(v.to_string()),
            _ => Ok(first.clone()),
        }
    }

    /// Synthesize one sentence off the async path. The model mutex keeps at
    /// most one inference in flight; the recycler is notified on success.
    pub async fn synthesize_sentence(
        &self,
        text: &str,
        voice: &str,
        speed: f32,
    ) -> Result<Vec<f32>, SpeechError> {
        let live = self.live.clone();
        let sentence = text.to_string();
        let voice = voice.to_string();
        let joined = tokio::task::spawn_blocking(move || {
            live.lock().synthesize(&sentence, &voice, speed)
        })
        .await;

        match joined {
            Ok(Ok(samples)) => {
                self.recycler
                    .lock()
                    .await
                    .after_synthesis(&self.live, &self.factory)
                    .await;
                Ok(samples)
            }
            Ok(Err(e)) => Err(SpeechError::SynthesisFailed {
                sentence: text.to_string(),
                source: e,
            }),
            Err(e) => Err(SpeechError::SynthesisFailed {
                sentence: text.to_string(),
                source: anyhow::anyhow!("synthesis task panicked: {e}"),
            }),
        }
    }

    pub fn pause_policy(&self) -> &PausePolicy {
        &self.pause_policy
    }

    pub fn fade_ms(&self) -> u32 {
        self.fade_ms
    }

    pub fn voices_path(&self) -> &Path {
        &self.voices_path
    }
}
