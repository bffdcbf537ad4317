//! Producer/consumer audio stream
//!
//! A single producer task synthesizes sentences in order and pushes them
//! into a bounded FIFO; the consumer side meters each sentence into wire
//! chunks. The queue capacity is the prefetch depth, so a slow client
//! naturally backpressures synthesis instead of buffering a whole chapter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::SpeechError;
use crate::tts::{audio, segment::SentenceSegment, TtsEngine};

/// One-shot cancellation flag shared by producer and consumer. Once set it
/// stays set for the rest of the request.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// How sentence audio is metered onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmitMode {
    /// Fixed-duration frames; trailing partial frames are emitted as-is.
    #[default]
    Frames,
    /// One chunk per sentence (PCM plus trailing silence), so playback can
    /// only ever pause at a sentence boundary.
    Sentences,
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub voice: String,
    pub speed: f32,
    pub prefetch_sentences: usize,
    pub frame_ms: u32,
    pub mode: EmitMode,
}

impl StreamOptions {
    pub fn new(voice: impl Into<String>) -> Self {
        Self {
            voice: voice.into(),
            speed: 1.0,
            prefetch_sentences: 3,
            frame_ms: 200,
            mode: EmitMode::Frames,
        }
    }
}

/// A synthesized sentence waiting in the prefetch queue, still in float32.
struct SentenceAudio {
    segment: SentenceSegment,
    samples: Vec<f32>,
    silence_samples: usize,
}

/// What the consumer hands to the session controller.
#[derive(Debug)]
pub enum StreamEvent {
    /// Marks the start of a sentence; always precedes its first audio chunk.
    SentenceStart(SentenceSegment),
    /// Little-endian 16-bit PCM, either one frame or one whole sentence.
    Audio(Vec<u8>),
}

pub struct AudioStream {
    rx: mpsc::Receiver<Result<SentenceAudio, SpeechError>>,
    producer: Option<JoinHandle<()>>,
    cancel: CancelFlag,
    mode: EmitMode,
    frame_bytes: usize,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

impl AudioStream {
    /// Spawn the producer task over `segments` and return the consumer end.
    pub fn spawn(
        engine: Arc<TtsEngine>,
        segments: Vec<SentenceSegment>,
        options: StreamOptions,
        cancel: CancelFlag,
    ) -> Self {
        let (tx, rx) = mpsc::channel(options.prefetch_sentences.max(1));
        let producer_cancel = cancel.clone();
        let voice = options.voice.clone();
        let speed = options.speed;
        let producer = tokio::spawn(async move {
            produce(engine, segments, voice, speed, producer_cancel, tx).await;
        });

        Self {
            rx,
            producer: Some(producer),
            cancel,
            mode: options.mode,
            frame_bytes: audio::frame_bytes(options.frame_ms),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// Next marker or audio chunk, in emission order. Returns `None` once
    /// the stream has drained or cancellation has been observed; cancellation
    /// is re-checked before every yielded chunk.
    pub async fn next_event(&mut self) -> Option<Result<StreamEvent, SpeechError>> {
        loop {
            if self.cancel.is_cancelled() {
                self.pending.clear();
                return None;
            }
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }
            match self.rx.recv().await {
                Some(Ok(sentence)) => self.stage(sentence),
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Break one synthesized sentence into wire chunks. Quantization happens
    /// exactly once per sentence, after the silence decision.
    fn stage(&mut self, sentence: SentenceAudio) {
        let SentenceAudio {
            segment,
            mut samples,
            silence_samples,
        } = sentence;

        self.pending.push_back(StreamEvent::SentenceStart(segment));
        match self.mode {
            EmitMode::Frames => {
                let pcm = audio::to_pcm16_bytes(&samples);
                for frame in pcm.chunks(self.frame_bytes) {
                    self.pending.push_back(StreamEvent::Audio(frame.to_vec()));
                }
                // Silence rides in frames of the same size, tagged with the
                // sentence it follows.
                let mut silence_bytes = silence_samples * 2;
                while silence_bytes > 0 {
                    let len = silence_bytes.min(self.frame_bytes);
                    self.pending.push_back(StreamEvent::Audio(vec![0u8; len]));
                    silence_bytes -= len;
                }
            }
            EmitMode::Sentences => {
                samples.extend(std::iter::repeat(0.0f32).take(silence_samples));
                self.pending
                    .push_back(StreamEvent::Audio(audio::to_pcm16_bytes(&samples)));
            }
        }
    }

    /// Cancel, drain, and join the producer. The producer's error (if any)
    /// is suppressed; by this point the controller has already decided how
    /// the request ends.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.rx.close();
        while self.rx.recv().await.is_some() {}
        if let Some(handle) = self.producer.take() {
            let _ = handle.await;
        }
    }
}

async fn produce(
    engine: Arc<TtsEngine>,
    segments: Vec<SentenceSegment>,
    voice: String,
    speed: f32,
    cancel: CancelFlag,
    tx: mpsc::Sender<Result<SentenceAudio, SpeechError>>,
) {
    for segment in segments {
        // Checked between sentences; an in-flight synthesis finishes and is
        // then discarded when the consumer has gone away.
        if cancel.is_cancelled() {
            debug!("Producer observed cancellation before {:?}", segment.text);
            break;
        }
        match engine.synthesize_sentence(&segment.text, &voice, speed).await {
            Ok(mut samples) => {
                audio::apply_edge_fade(&mut samples, engine.fade_ms());
                let silence_samples = engine
                    .pause_policy()
                    .pause_samples(&segment.text, segment.is_last_in_paragraph);
                let item = SentenceAudio {
                    segment,
                    samples,
                    silence_samples,
                };
                if tx.send(Ok(item)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
    // Dropping the sender closes the queue; the consumer reads that as
    // end-of-stream.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tts::model::{AcousticModel, ModelFactory};
    use crate::tts::segment::flatten;

    /// Emits a fixed number of full-scale samples per sentence, or fails on
    /// sentences containing a marker word.
    struct FixedModel {
        samples_per_sentence: usize,
    }

    impl AcousticModel for FixedModel {
        fn synthesize(&mut self, text: &str, _voice: &str, _speed: f32) -> anyhow::Result<Vec<f32>> {
            if text.contains("explode") {
                anyhow::bail!("synthetic model failure");
            }
            Ok(vec![0.5; self.samples_per_sentence])
        }
    }

    fn test_engine(samples_per_sentence: usize) -> Arc<TtsEngine> {
        let factory: ModelFactory = Arc::new(move || {
            Ok(Box::new(FixedModel { samples_per_sentence }) as Box<dyn AcousticModel>)
        });
        Arc::new(TtsEngine::new(factory, "/nonexistent/voices.bin", 100).unwrap())
    }

    fn segments_for(text: &str) -> Vec<SentenceSegment> {
        flatten(&[text.to_string()])
    }

    async fn collect(stream: &mut AudioStream) -> (Vec<String>, Vec<Vec<u8>>) {
        let mut sentences = Vec::new();
        let mut chunks = Vec::new();
        while let Some(event) = stream.next_event().await {
            match event.unwrap() {
                StreamEvent::SentenceStart(seg) => sentences.push(seg.text),
                StreamEvent::Audio(bytes) => chunks.push(bytes),
            }
        }
        (sentences, chunks)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_one_second_sentence_yields_five_full_frames() {
        // 24000 samples = 1 s; 200 ms frames = 9600 bytes each.
        let engine = test_engine(24_000);
        let mut stream = AudioStream::spawn(
            engine,
            segments_for("word"),
            StreamOptions::new("af_bella"),
            CancelFlag::new(),
        );

        let (sentences, chunks) = collect(&mut stream).await;
        stream.shutdown().await;

        assert_eq!(sentences, vec!["word"]);
        // Five full PCM frames, then one partial silence frame (120 ms pause
        // + 240 ms paragraph end = 360 ms = 17280 bytes → one full frame and
        // one partial).
        assert_eq!(chunks[0].len(), 9600);
        assert_eq!(chunks[..5].iter().map(Vec::len).collect::<Vec<_>>(), vec![9600; 5]);
        let total: usize = chunks.iter().map(Vec::len).sum();
        assert_eq!(total, 24_000 * 2 + 8640 * 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_emitted_bytes_match_samples_plus_silence() {
        let engine = test_engine(10_000);
        let segments = segments_for("One. Two? Three!");
        let expected_silence: usize = segments
            .iter()
            .map(|s| {
                engine
                    .pause_policy()
                    .pause_samples(&s.text, s.is_last_in_paragraph)
            })
            .sum();
        let mut stream = AudioStream::spawn(
            engine,
            segments.clone(),
            StreamOptions::new("af_bella"),
            CancelFlag::new(),
        );

        let (sentences, chunks) = collect(&mut stream).await;
        stream.shutdown().await;

        assert_eq!(sentences.len(), 3);
        let total: usize = chunks.iter().map(Vec::len).sum();
        assert_eq!(total, 2 * (10_000 * segments.len() + expected_silence));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sentence_mode_emits_one_chunk_per_sentence() {
        let engine = test_engine(5_000);
        let mut options = StreamOptions::new("af_bella");
        options.mode = EmitMode::Sentences;
        let mut stream = AudioStream::spawn(
            engine.clone(),
            segments_for("First. Second."),
            options,
            CancelFlag::new(),
        );

        let (sentences, chunks) = collect(&mut stream).await;
        stream.shutdown().await;

        assert_eq!(sentences.len(), 2);
        assert_eq!(chunks.len(), 2);
        // First sentence: 180 ms pause; second closes the paragraph: +240 ms.
        assert_eq!(chunks[0].len(), 2 * (5_000 + 4320));
        assert_eq!(chunks[1].len(), 2 * (5_000 + 4320 + 5760));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_marker_precedes_audio_for_each_sentence() {
        let engine = test_engine(1_000);
        let mut stream = AudioStream::spawn(
            engine,
            segments_for("A. B."),
            StreamOptions::new("af_bella"),
            CancelFlag::new(),
        );

        let mut saw_audio_since_marker = true;
        while let Some(event) = stream.next_event().await {
            match event.unwrap() {
                StreamEvent::SentenceStart(_) => {
                    assert!(saw_audio_since_marker, "two markers without audio between");
                    saw_audio_since_marker = false;
                }
                StreamEvent::Audio(_) => saw_audio_since_marker = true,
            }
        }
        stream.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancellation_stops_emission() {
        let engine = test_engine(24_000);
        let cancel = CancelFlag::new();
        let mut stream = AudioStream::spawn(
            engine,
            segments_for("One. Two. Three. Four. Five."),
            StreamOptions::new("af_bella"),
            cancel.clone(),
        );

        // Let one event through, then cancel mid-sentence.
        assert!(stream.next_event().await.is_some());
        cancel.cancel();
        assert!(stream.next_event().await.is_none());
        stream.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_synthesis_failure_surfaces_after_prior_sentences() {
        let engine = test_engine(1_000);
        let mut stream = AudioStream::spawn(
            engine,
            segments_for("Fine here. Now explode. Never reached."),
            StreamOptions::new("af_bella"),
            CancelFlag::new(),
        );

        let mut failed = None;
        let mut sentences = Vec::new();
        while let Some(event) = stream.next_event().await {
            match event {
                Ok(StreamEvent::SentenceStart(seg)) => sentences.push(seg.text),
                Ok(StreamEvent::Audio(_)) => {}
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        stream.shutdown().await;

        assert_eq!(sentences, vec!["Fine here."]);
        match failed {
            Some(SpeechError::SynthesisFailed { sentence, .. }) => {
                assert_eq!(sentence, "Now explode.")
            }
            other => panic!("expected SynthesisFailed, got {:?}", other.map(|e| e.to_string())),
        }
    }
}
