//! CLI interface for chaptercast

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::Config;
use crate::tts::segment::flatten;
use crate::tts::{
    voices, AudioStream, CancelFlag, EmitMode, StreamEvent, StreamOptions, TtsEngine, SAMPLE_RATE,
};

#[derive(Parser)]
#[command(name = "chaptercast")]
#[command(about = "Streaming text-to-speech narration server for web novel chapters", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a configuration file (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the narration server
    Serve {
        /// Listen host (overrides configuration)
        #[arg(long)]
        host: Option<String>,
        /// Listen port (overrides configuration)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List the voices available in the configured voice pack
    Voices {
        /// Voice pack path (overrides configuration)
        #[arg(long)]
        voices_path: Option<PathBuf>,
    },
    /// Synthesize text into a WAV file without running the server
    Speak {
        /// Text to narrate; reads from --file when omitted
        text: Option<String>,
        /// Read the text from a file instead
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Output WAV path
        #[arg(short, long, default_value = "narration.wav")]
        output: PathBuf,
        /// Voice ID (falls back to the first catalog voice)
        #[arg(long)]
        voice: Option<String>,
        /// Speaking speed multiplier
        #[arg(long, default_value_t = 1.0)]
        speed: f32,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = match cli.config.as_deref() {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Serve { host, port } => {
            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            crate::server::start(config).await
        }
        Commands::Voices { voices_path } => {
            let path = voices_path.unwrap_or(config.tts.voices_path);
            let ids = voices::load_voice_ids(&path)?;
            for id in &ids {
                println!("{id}");
            }
            info!("{} voices in {}", ids.len(), path.display());
            Ok(())
        }
        Commands::Speak {
            text,
            file,
            output,
            voice,
            speed,
        } => {
            let text = match (text, file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                (None, None) => bail!("provide text as an argument or via --file"),
            };
            speak_to_wav(&config, &text, voice, speed, &output).await
        }
    }
}

/// Offline narration: synthesize sentence-atomic chunks and write one WAV.
async fn speak_to_wav(
    config: &Config,
    text: &str,
    voice: Option<String>,
    speed: f32,
    output: &std::path::Path,
) -> Result<()> {
    let engine = Arc::new(TtsEngine::from_settings(&config.tts.engine_settings())?);
    let voice = engine.resolve_voice(voice.as_deref())?;

    let paragraphs: Vec<String> = text.lines().map(str::to_string).collect();
    let segments = flatten(&paragraphs);
    if segments.is_empty() {
        bail!("nothing to narrate");
    }
    let total = segments.len();

    let mut options = StreamOptions::new(voice);
    options.speed = speed;
    options.mode = EmitMode::Sentences;
    let mut stream = AudioStream::spawn(engine, segments, options, CancelFlag::new());

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(output, spec)
        .with_context(|| format!("cannot create {}", output.display()))?;

    let mut written: u64 = 0;
    let mut spoken = 0usize;
    while let Some(event) = stream.next_event().await {
        match event? {
            StreamEvent::SentenceStart(segment) => {
                spoken += 1;
                info!("[{}/{}] {}", spoken, total, segment.text);
            }
            StreamEvent::Audio(bytes) => {
                for sample in bytes.chunks_exact(2) {
                    writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?;
                    written += 1;
                }
            }
        }
    }
    stream.shutdown().await;
    writer.finalize().context("failed to finalize WAV")?;

    println!(
        "Wrote {} ({:.1}s of audio)",
        output.display(),
        written as f64 / SAMPLE_RATE as f64
    );
    Ok(())
}
