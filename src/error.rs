//! Error taxonomy for the narration pipeline
//!
//! Every failure that can reach a client maps onto one of these variants; the
//! session controller decides whether a variant ends the current stream or
//! only produces a single `error` event.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the TTS pipeline and the session controller.
#[derive(Debug, Error)]
pub enum SpeechError {
    /// Missing or invalid command arguments. The session stays idle.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The synthesizer failed to initialize or the voice catalog is empty.
    #[error("TTS engine not ready: {0}")]
    TtsNotReady(String),

    /// The chapter source could not be reached or parsed.
    #[error("chapter source unavailable: {0}")]
    SourceUnavailable(String),

    /// The acoustic model raised while synthesizing a sentence. Terminates
    /// the current play request.
    #[error("synthesis failed for \"{sentence}\": {source}")]
    SynthesisFailed {
        sentence: String,
        #[source]
        source: anyhow::Error,
    },

    /// The voice pack file exists but is not a recognized container.
    #[error("voice pack is not a recognized container: {}", path.display())]
    VoicePackInvalid { path: PathBuf },

    /// The client closed the channel mid-stream.
    #[error("client disconnected")]
    ClientGone,

    /// Malformed JSON or an unknown command on the control channel.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

impl SpeechError {
    /// True when the error should only produce a single `error` event while
    /// the session keeps accepting commands.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SpeechError::BadRequest(_)
                | SpeechError::TtsNotReady(_)
                | SpeechError::SourceUnavailable(_)
                | SpeechError::ProtocolViolation(_)
        )
    }
}
