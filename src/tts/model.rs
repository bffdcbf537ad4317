//! Acoustic model seam
//!
//! The pipeline treats the neural synthesizer as an opaque blocking call
//! behind [`AcousticModel`]; everything above it only sees float32 samples at
//! 24 kHz. The shipped implementation runs a Kokoro-style ONNX graph through
//! ONNX Runtime with voice style embeddings loaded from the voice pack.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ndarray::ArrayD;
use ndarray_npy::ReadNpyExt;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

/// A blocking text-to-waveform synthesizer. Implementations are not assumed
/// to be reentrant; the engine serializes calls through a mutex.
pub trait AcousticModel: Send {
    /// Synthesize one sentence into mono float32 samples at 24 kHz.
    fn synthesize(&mut self, text: &str, voice: &str, speed: f32) -> Result<Vec<f32>>;
}

/// Builds a fresh model instance; used at startup and by the session
/// recycler for background rebuilds.
pub type ModelFactory = Arc<dyn Fn() -> Result<Box<dyn AcousticModel>> + Send + Sync>;

/// ONNX Runtime session tuning, mirroring the process-wide configuration
/// knobs. Zero intra-op threads lets the runtime pick.
#[derive(Debug, Clone, Copy)]
pub struct OrtOptions {
    pub intra_op_threads: usize,
    pub inter_op_threads: usize,
}

impl Default for OrtOptions {
    fn default() -> Self {
        Self {
            intra_op_threads: 0,
            inter_op_threads: 1,
        }
    }
}

/// Per-voice style matrix; one row is selected per utterance by token count.
struct StyleMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StyleMatrix {
    fn from_array(array: ArrayD<f32>) -> Result<Self> {
        let shape = array.shape().to_vec();
        let rows = *shape.first().unwrap_or(&0);
        if rows == 0 {
            bail!("style matrix has no rows");
        }
        let data: Vec<f32> = array.iter().copied().collect();
        let cols = data.len() / rows;
        Ok(Self { rows, cols, data })
    }

    fn row(&self, index: usize) -> &[f32] {
        let i = index.min(self.rows - 1);
        &self.data[i * self.cols..(i + 1) * self.cols]
    }
}

/// Kokoro-style ONNX synthesizer.
///
/// Inputs: `input_ids` (`[1, n]` i64), `style` (`[1, d]` f32), `speed`
/// (`[1]` f32); output 0 is the waveform.
pub struct OnnxSynthesizer {
    session: Session,
    styles: HashMap<String, StyleMatrix>,
}

impl OnnxSynthesizer {
    /// Load the ONNX graph and the style embeddings from a zip-based voice
    /// pack (`.bin` or `.npz`).
    pub fn load(model_path: &Path, voices_path: &Path, options: OrtOptions) -> Result<Self> {
        let mut builder = Session::builder()
            .context("failed to create ONNX session builder")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("failed to set graph optimization level")?
            .with_inter_threads(options.inter_op_threads.max(1))
            .context("failed to set inter-op threads")?;
        if options.intra_op_threads > 0 {
            builder = builder
                .with_intra_threads(options.intra_op_threads)
                .context("failed to set intra-op threads")?;
        }
        let session = builder
            .commit_from_file(model_path)
            .with_context(|| format!("cannot load ONNX model: {}", model_path.display()))?;

        let styles = load_style_matrices(voices_path)?;
        info!(
            "Loaded acoustic model {} with {} voices",
            model_path.display(),
            styles.len()
        );

        Ok(Self { session, styles })
    }

    fn tokenize(text: &str) -> Vec<i64> {
        // Codepoint ids padded with the zero token on both ends.
        let mut ids = Vec::with_capacity(text.chars().count() + 2);
        ids.push(0);
        ids.extend(text.chars().map(|c| c as i64));
        ids.push(0);
        ids
    }
}

impl AcousticModel for OnnxSynthesizer {
    fn synthesize(&mut self, text: &str, voice: &str, speed: f32) -> Result<Vec<f32>> {
        let style = self
            .styles
            .get(voice)
            .with_context(|| format!("voice '{}' not present in voice pack", voice))?;

        let ids = Self::tokenize(text);
        let seq_len = ids.len();
        let style_row = style.row(seq_len);
        let style_dim = style_row.len();

        let t_input_ids = Tensor::<i64>::from_array(([1usize, seq_len], ids))
            .context("failed to build input_ids tensor")?;
        let t_style = Tensor::<f32>::from_array(([1usize, style_dim], style_row.to_vec()))
            .context("failed to build style tensor")?;
        let t_speed = Tensor::<f32>::from_array(([1usize], vec![speed]))
            .context("failed to build speed tensor")?;

        let outputs = self
            .session
            .run(ort::inputs![
                "input_ids" => t_input_ids,
                "style" => t_style,
                "speed" => t_speed,
            ])
            .context("ONNX inference failed")?;

        let (_shape, samples) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("failed to extract waveform tensor")?;
        Ok(samples.to_vec())
    }
}

/// Read every `<voice_id>.npy` entry of a zip-based voice pack into a style
/// matrix. JSON packs carry no embeddings and cannot drive the ONNX model.
fn load_style_matrices(voices_path: &Path) -> Result<HashMap<String, StyleMatrix>> {
    let extension = voices_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if extension != "bin" && extension != "npz" {
        bail!(
            "voice pack {} has no style embeddings (expected .bin or .npz)",
            voices_path.display()
        );
    }

    let file = File::open(voices_path)
        .with_context(|| format!("cannot open voice pack: {}", voices_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("voice pack is not a zip archive: {}", voices_path.display()))?;

    let mut styles = HashMap::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("corrupt voice pack entry")?;
        let name = entry.name().to_string();
        let Some(id) = name.strip_suffix(".npy") else {
            continue;
        };

        let mut raw = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut raw)
            .with_context(|| format!("cannot read voice entry {}", name))?;
        let array = ArrayD::<f32>::read_npy(raw.as_slice())
            .with_context(|| format!("voice entry {} is not an npy array", name))?;
        debug!("Voice {}: style shape {:?}", id, array.shape());
        styles.insert(id.to_string(), StyleMatrix::from_array(array)?);
    }

    if styles.is_empty() {
        bail!("voice pack {} contains no voices", voices_path.display());
    }
    Ok(styles)
}
