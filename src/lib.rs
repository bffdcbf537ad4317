//! Chaptercast - Streaming Chapter Narration Library
//!
//! Turns web novel chapters into a continuous spoken audio stream:
//! - Chapter scraping from NovelCool-style pages
//! - Sentence segmentation with character offsets for UI highlighting
//! - Kokoro-style ONNX synthesis with periodic session recycling
//! - A WebSocket control protocol (play/pause/resume/stop) streaming raw
//!   16-bit PCM frames interleaved with JSON marker events
//!
//! # Example
//!
//! ```ignore
//! use chaptercast::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     chaptercast::server::start(config).await
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod scraper;
pub mod server;
pub mod tts;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::SpeechError;
pub use server::{start as start_server, ServerState};
pub use tts::{TtsEngine, SAMPLE_RATE};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
