//! WebSocket session controller
//!
//! One bidirectional channel carries JSON control messages and binary PCM
//! frames. The controller is a state machine over
//! `Idle → Playing ↔ Paused → (Completed | Cancelling → Closed)`: while a
//! stream is active the emission loop selects between the next inbound
//! message and the next outbound chunk, so there is never more than one
//! pending receive on the socket. Pausing drops back to a plain blocking
//! receive until `resume` or `stop` arrives; nothing is sent while paused.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::SpeechError;
use crate::scraper::Chapter;
use crate::server::ServerState;
use crate::tts::{
    segment::flatten_from, AudioStream, CancelFlag, EmitMode, SentenceSegment, StreamEvent,
    StreamOptions, TtsEngine, SAMPLE_RATE,
};

// ─── Wire protocol ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ClientCommand {
    Play(PlayArgs),
    Speak(SpeakArgs),
    Pause,
    Resume,
    Stop,
}

fn default_speed() -> f32 {
    1.0
}

fn default_prefetch() -> usize {
    3
}

fn default_frame_ms() -> u32 {
    200
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct PlayArgs {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default = "default_speed")]
    pub speed: f32,
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
    #[serde(default)]
    pub start_paragraph: usize,
    /// Pace frames to the audio clock so UI highlights track what is
    /// audible even when synthesis outruns playback.
    #[serde(default = "default_true")]
    pub realtime: bool,
    #[serde(default)]
    pub mode: EmitMode,
}

#[derive(Debug, Deserialize)]
pub struct SpeakArgs {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default = "default_speed")]
    pub speed: f32,
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
    #[serde(default)]
    pub realtime: bool,
    #[serde(default)]
    pub mode: EmitMode,
}

#[derive(Debug, Serialize)]
pub struct AudioParams {
    pub encoding: &'static str,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_ms: u32,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ChapterInfo {
        title: String,
        url: String,
        voice: String,
        next_url: Option<String>,
        prev_url: Option<String>,
        paragraphs: Vec<String>,
        start_paragraph: usize,
        sentence_total: usize,
        audio: AudioParams,
    },
    Sentence {
        text: String,
        paragraph_index: usize,
        sentence_index: usize,
        ms_start: u64,
    },
    ChapterComplete {
        next_url: Option<String>,
        prev_url: Option<String>,
    },
    SpeakComplete,
    Error {
        message: String,
    },
}

// ─── Session loop ────────────────────────────────────────────

type WsSink = SplitSink<WebSocket, Message>;
type WsSource = SplitStream<WebSocket>;

/// How an active stream ended.
enum StreamOutcome {
    Completed,
    Stopped,
    Failed(SpeechError),
    ClientGone,
}

/// What the session does after a request finishes.
enum Flow {
    /// Back to `Idle`; keep reading commands.
    Idle,
    /// `stop` drained the stream; close the channel.
    Close,
    ClientGone,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(|socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: ServerState) {
    info!("Narration session connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    while let Some(Ok(msg)) = ws_rx.next().await {
        let flow = match msg {
            Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(ClientCommand::Play(args)) => {
                    run_play(&state, &mut ws_tx, &mut ws_rx, args).await
                }
                Ok(ClientCommand::Speak(args)) => {
                    run_speak(&state, &mut ws_tx, &mut ws_rx, args).await
                }
                Ok(_) => {
                    // pause/resume/stop are only meaningful while a stream
                    // is active; in Idle they are argument errors.
                    report(
                        &mut ws_tx,
                        &SpeechError::BadRequest("no active stream".to_string()),
                    )
                    .await
                }
                Err(e) => {
                    debug!("Unparseable command: {e}");
                    report(
                        &mut ws_tx,
                        &SpeechError::ProtocolViolation(format!("invalid command: {e}")),
                    )
                    .await
                }
            },
            Message::Binary(_) => {
                report(
                    &mut ws_tx,
                    &SpeechError::ProtocolViolation("binary messages are not accepted".to_string()),
                )
                .await
            }
            Message::Close(_) => break,
            _ => Flow::Idle,
        };

        match flow {
            Flow::Idle => {}
            Flow::Close | Flow::ClientGone => break,
        }
    }

    info!("Narration session closed");
}

async fn send_event(ws_tx: &mut WsSink, event: &ServerEvent) -> Result<(), SpeechError> {
    let payload = serde_json::to_string(event).unwrap_or_default();
    ws_tx
        .send(Message::Text(payload.into()))
        .await
        .map_err(|_| SpeechError::ClientGone)
}

async fn send_audio(ws_tx: &mut WsSink, bytes: Vec<u8>) -> Result<(), SpeechError> {
    ws_tx
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|_| SpeechError::ClientGone)
}

/// Send one `error` event. Returns `Flow::Idle` so callers can tail-call it.
async fn report(ws_tx: &mut WsSink, error: &SpeechError) -> Flow {
    warn!("Session error: {error}");
    let event = ServerEvent::Error {
        message: error.to_string(),
    };
    match send_event(ws_tx, &event).await {
        Ok(()) => Flow::Idle,
        Err(_) => Flow::ClientGone,
    }
}

// ─── play ────────────────────────────────────────────────────

async fn run_play(
    state: &ServerState,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsSource,
    args: PlayArgs,
) -> Flow {
    let Some(engine) = state.tts.as_ref() else {
        return report(
            ws_tx,
            &SpeechError::TtsNotReady("TTS engine not initialized".to_string()),
        )
        .await;
    };
    let url = match args.url.as_deref() {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => return report(ws_tx, &SpeechError::BadRequest("url is required".to_string())).await,
    };
    let voice = match engine.resolve_voice(args.voice.as_deref()) {
        Ok(v) => v,
        Err(e) => return report(ws_tx, &e).await,
    };

    info!("Play request: url={} voice={} speed={}", url, voice, args.speed);
    let chapter = match state.source.fetch_chapter(&url).await {
        Ok(c) => c,
        Err(e) => return report(ws_tx, &e).await,
    };

    let start_paragraph = args
        .start_paragraph
        .min(chapter.paragraphs.len().saturating_sub(1));
    let segments = flatten_from(&chapter.paragraphs[start_paragraph..], start_paragraph);

    let info_event =
        chapter_info_event(&chapter, &url, &voice, start_paragraph, segments.len(), args.frame_ms);
    if send_event(ws_tx, &info_event).await.is_err() {
        return Flow::ClientGone;
    }

    let options = StreamOptions {
        voice,
        speed: args.speed,
        prefetch_sentences: args.prefetch.max(1),
        frame_ms: args.frame_ms,
        mode: args.mode,
    };
    let outcome =
        pump_stream(engine.clone(), segments, options, args.realtime, ws_tx, ws_rx).await;

    let complete = ServerEvent::ChapterComplete {
        next_url: chapter.next_url.clone(),
        prev_url: chapter.prev_url.clone(),
    };
    finish(ws_tx, outcome, complete).await
}

fn chapter_info_event(
    chapter: &Chapter,
    url: &str,
    voice: &str,
    start_paragraph: usize,
    sentence_total: usize,
    frame_ms: u32,
) -> ServerEvent {
    ServerEvent::ChapterInfo {
        title: chapter.title.clone(),
        url: url.to_string(),
        voice: voice.to_string(),
        next_url: chapter.next_url.clone(),
        prev_url: chapter.prev_url.clone(),
        paragraphs: chapter.paragraphs.clone(),
        start_paragraph,
        sentence_total,
        audio: AudioParams {
            encoding: "pcm_s16le",
            sample_rate: SAMPLE_RATE,
            channels: 1,
            frame_ms,
        },
    }
}

// ─── speak ───────────────────────────────────────────────────

async fn run_speak(
    state: &ServerState,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsSource,
    args: SpeakArgs,
) -> Flow {
    let Some(engine) = state.tts.as_ref() else {
        return report(
            ws_tx,
            &SpeechError::TtsNotReady("TTS engine not initialized".to_string()),
        )
        .await;
    };
    let text = match args.text.as_deref() {
        Some(text) if !text.trim().is_empty() => text.to_string(),
        _ => return report(ws_tx, &SpeechError::BadRequest("text is required".to_string())).await,
    };
    let voice = match engine.resolve_voice(args.voice.as_deref()) {
        Ok(v) => v,
        Err(e) => return report(ws_tx, &e).await,
    };

    info!("Speak request: {} chars, voice={}", text.len(), voice);
    let paragraphs: Vec<String> = text.lines().map(str::to_string).collect();
    let segments = flatten_from(&paragraphs, 0);

    let options = StreamOptions {
        voice,
        speed: args.speed,
        prefetch_sentences: args.prefetch.max(1),
        frame_ms: args.frame_ms,
        mode: args.mode,
    };
    let outcome =
        pump_stream(engine.clone(), segments, options, args.realtime, ws_tx, ws_rx).await;
    finish(ws_tx, outcome, ServerEvent::SpeakComplete).await
}

/// Emit the terminating event for a finished stream and translate the
/// outcome into session flow.
async fn finish(ws_tx: &mut WsSink, outcome: StreamOutcome, complete: ServerEvent) -> Flow {
    match outcome {
        StreamOutcome::Completed => match send_event(ws_tx, &complete).await {
            Ok(()) => Flow::Idle,
            Err(_) => Flow::ClientGone,
        },
        StreamOutcome::Stopped => {
            // Buffered sentences are discarded; the final event still goes
            // out before the channel closes.
            match send_event(ws_tx, &complete).await {
                Ok(()) => Flow::Close,
                Err(_) => Flow::ClientGone,
            }
        }
        StreamOutcome::Failed(e) => {
            let _ = report(ws_tx, &e).await;
            Flow::Idle
        }
        StreamOutcome::ClientGone => Flow::ClientGone,
    }
}

// ─── Emission loop ───────────────────────────────────────────

/// What an inbound message means while a stream is active.
enum Control {
    Pause,
    Resume,
    Stop,
    Busy,
    Invalid(String),
    Gone,
    Ignore,
}

fn classify(message: Option<Result<Message, axum::Error>>) -> Control {
    match message {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientCommand>(&text) {
            Ok(ClientCommand::Pause) => Control::Pause,
            Ok(ClientCommand::Resume) => Control::Resume,
            Ok(ClientCommand::Stop) => Control::Stop,
            Ok(_) => Control::Busy,
            Err(e) => Control::Invalid(e.to_string()),
        },
        Some(Ok(Message::Close(_))) | None => Control::Gone,
        Some(Ok(_)) => Control::Ignore,
        Some(Err(_)) => Control::Gone,
    }
}

/// Apply one control message to the running stream. Returns the outcome
/// that ends the stream, if this message ends it.
async fn apply_control(
    control: Control,
    paused: &mut bool,
    cancel: &CancelFlag,
    ws_tx: &mut WsSink,
) -> Option<StreamOutcome> {
    let rejection = match control {
        Control::Pause => {
            debug!("Stream paused");
            *paused = true;
            return None;
        }
        Control::Resume => {
            *paused = false;
            return None;
        }
        Control::Stop => {
            cancel.cancel();
            return Some(StreamOutcome::Stopped);
        }
        Control::Gone => {
            cancel.cancel();
            return Some(StreamOutcome::ClientGone);
        }
        Control::Ignore => return None,
        Control::Busy => SpeechError::BadRequest("a stream is already active".to_string()),
        Control::Invalid(e) => SpeechError::ProtocolViolation(e),
    };
    if matches!(report(ws_tx, &rejection).await, Flow::ClientGone) {
        cancel.cancel();
        return Some(StreamOutcome::ClientGone);
    }
    None
}

/// Drive one stream to its end, interleaving control messages between
/// chunks. Always joins the producer before returning.
async fn pump_stream(
    engine: Arc<TtsEngine>,
    segments: Vec<SentenceSegment>,
    options: StreamOptions,
    realtime: bool,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsSource,
) -> StreamOutcome {
    let cancel = CancelFlag::new();
    let mut stream = AudioStream::spawn(engine, segments, options, cancel.clone());
    let mut paused = false;
    let mut emitted_bytes: u64 = 0;

    let outcome = loop {
        if paused {
            // Blocking receive: nothing is emitted until the client speaks.
            let control = classify(ws_rx.next().await);
            if let Some(end) = apply_control(control, &mut paused, &cancel, ws_tx).await {
                break end;
            }
            continue;
        }

        tokio::select! {
            biased;

            inbound = ws_rx.next() => {
                let control = classify(inbound);
                if let Some(end) = apply_control(control, &mut paused, &cancel, ws_tx).await {
                    break end;
                }
            }

            event = stream.next_event() => match event {
                Some(Ok(StreamEvent::SentenceStart(segment))) => {
                    let ms_start = emitted_bytes / 2 * 1000 / SAMPLE_RATE as u64;
                    let marker = ServerEvent::Sentence {
                        text: segment.text,
                        paragraph_index: segment.paragraph_index,
                        sentence_index: segment.sentence_index,
                        ms_start,
                    };
                    if send_event(ws_tx, &marker).await.is_err() {
                        cancel.cancel();
                        break StreamOutcome::ClientGone;
                    }
                }
                Some(Ok(StreamEvent::Audio(bytes))) => {
                    emitted_bytes += bytes.len() as u64;
                    let pace = realtime
                        .then(|| Duration::from_secs_f64(bytes.len() as f64 / (2.0 * SAMPLE_RATE as f64)));
                    if send_audio(ws_tx, bytes).await.is_err() {
                        cancel.cancel();
                        break StreamOutcome::ClientGone;
                    }
                    if let Some(delay) = pace {
                        tokio::time::sleep(delay).await;
                    }
                }
                Some(Err(e)) => {
                    cancel.cancel();
                    break StreamOutcome::Failed(e);
                }
                None => break StreamOutcome::Completed,
            },
        }
    };

    stream.shutdown().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_command_parses_with_defaults() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"command":"play","url":"https://x/chapter/1"}"#).unwrap();
        match cmd {
            ClientCommand::Play(args) => {
                assert_eq!(args.url.as_deref(), Some("https://x/chapter/1"));
                assert_eq!(args.speed, 1.0);
                assert_eq!(args.prefetch, 3);
                assert_eq!(args.frame_ms, 200);
                assert_eq!(args.start_paragraph, 0);
                assert!(args.realtime);
                assert_eq!(args.mode, EmitMode::Frames);
            }
            other => panic!("wrong command: {:?}", other),
        }
    }

    #[test]
    fn test_play_command_sentence_mode() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"command":"play","url":"u","mode":"sentences","realtime":false}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::Play(args) => {
                assert_eq!(args.mode, EmitMode::Sentences);
                assert!(!args.realtime);
            }
            other => panic!("wrong command: {:?}", other),
        }
    }

    #[test]
    fn test_bare_control_commands_parse() {
        assert!(matches!(
            serde_json::from_str::<ClientCommand>(r#"{"command":"pause"}"#).unwrap(),
            ClientCommand::Pause
        ));
        assert!(matches!(
            serde_json::from_str::<ClientCommand>(r#"{"command":"resume"}"#).unwrap(),
            ClientCommand::Resume
        ));
        assert!(matches!(
            serde_json::from_str::<ClientCommand>(r#"{"command":"stop"}"#).unwrap(),
            ClientCommand::Stop
        ));
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        assert!(serde_json::from_str::<ClientCommand>(r#"{"command":"rewind"}"#).is_err());
        assert!(serde_json::from_str::<ClientCommand>(r#"{"no_command":true}"#).is_err());
    }

    #[test]
    fn test_events_serialize_with_type_tags() {
        let marker = ServerEvent::Sentence {
            text: "Hi.".to_string(),
            paragraph_index: 2,
            sentence_index: 0,
            ms_start: 1500,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&marker).unwrap()).unwrap();
        assert_eq!(json["type"], "sentence");
        assert_eq!(json["paragraph_index"], 2);
        assert_eq!(json["ms_start"], 1500);

        let done = ServerEvent::ChapterComplete {
            next_url: Some("n".to_string()),
            prev_url: None,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&done).unwrap()).unwrap();
        assert_eq!(json["type"], "chapter_complete");
        assert_eq!(json["next_url"], "n");
    }

    #[test]
    fn test_chapter_info_event_shape() {
        let chapter = Chapter {
            title: "Chapter 1".to_string(),
            paragraphs: vec!["One.".to_string(), "Two.".to_string()],
            next_url: Some("next".to_string()),
            prev_url: None,
        };
        let event = chapter_info_event(&chapter, "url", "af_bella", 0, 2, 200);
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["type"], "chapter_info");
        assert_eq!(json["voice"], "af_bella");
        assert_eq!(json["sentence_total"], 2);
        assert_eq!(json["audio"]["encoding"], "pcm_s16le");
        assert_eq!(json["audio"]["sample_rate"], 24000);
        assert_eq!(json["audio"]["channels"], 1);
    }
}
