//! Turn pipeline: upload, transcription, streamed generation and pipelined
//! synthesis.
//!
//! ```text
//! chat deltas ──▶ SentenceSegmenter ──▶ synthesis input
//!                                            │
//! synthesis output ──▶ FrameProducer ══ queue ══▶ Transcoder ──▶ audio_stream events
//! ```
//!
//! Generation and synthesis run concurrently: the audio side lives in its own
//! task and starts forwarding encoded chunks while the chat stream is still
//! producing text.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::core::llm::{ChatContext, ChatError, ChatStreamer, ImageRef, TextDeltaStream, sniff_image_mime};
use crate::core::storage::{CompletionRecord, CompletionStore, TurnOutcome, Uploader, input_key};
use crate::core::stt::Transcriber;
use crate::core::transcode::{
    EncodedChunk, OverflowPolicy, TranscodeWorkers, Transcoder, TranscoderConfig, frame_queue,
};
use crate::core::tts::{RealtimeSynthesizer, SynthesisError, SynthesisInput, SynthesisOutput};

use super::context::{Session, TurnInputs};
use super::error::PipelineError;
use super::events::{EventSink, SessionEvent, TurnSummary, Variant};
use super::segmenter::SentenceSegmenter;
use super::state::SessionState;

/// Per-turn tuning shared by every session
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub system_prompt: String,
    pub sentence_max_chars: usize,
    pub first_response_timeout: Duration,
    pub audio_turn_timeout: Duration,
    pub vlm_turn_timeout: Duration,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub transcoder: TranscoderConfig,
    pub storage_prefix: String,
    pub persist_failures: bool,
}

impl PipelineSettings {
    pub fn new(config: &PipelineConfig, sample_rate: u32, storage_prefix: impl Into<String>) -> Self {
        Self {
            system_prompt: config.system_prompt.clone(),
            sentence_max_chars: config.sentence_max_chars,
            first_response_timeout: config.first_response_timeout(),
            audio_turn_timeout: Duration::from_secs(config.audio_turn_timeout_seconds),
            vlm_turn_timeout: Duration::from_secs(config.vlm_turn_timeout_seconds),
            queue_capacity: config.queue_capacity,
            overflow_policy: config.overflow_policy,
            transcoder: config.transcoder(sample_rate),
            storage_prefix: storage_prefix.into(),
            persist_failures: config.persist_failures,
        }
    }

    pub fn turn_timeout(&self, variant: Variant) -> Duration {
        match variant {
            Variant::Audio => self.audio_turn_timeout,
            Variant::Multimodal => self.vlm_turn_timeout,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::new(
            &PipelineConfig::default(),
            crate::core::transcode::transcoder::DEFAULT_SAMPLE_RATE,
            "duplex",
        )
    }
}

/// Collaborators and shared resources of every turn
#[derive(Clone)]
pub struct PipelineDeps {
    pub transcriber: Arc<dyn Transcriber>,
    pub chat: Arc<dyn ChatStreamer>,
    pub synthesizer: Arc<dyn RealtimeSynthesizer>,
    pub uploader: Option<Arc<dyn Uploader>>,
    pub store: Option<Arc<dyn CompletionStore>>,
    pub workers: TranscodeWorkers,
    pub settings: Arc<PipelineSettings>,
}

/// What a running turn needs from its session
#[derive(Clone)]
pub struct TurnHandle {
    pub session: Arc<Mutex<Session>>,
    pub events: EventSink,
    pub cancel: CancellationToken,
}

impl TurnHandle {
    fn transition(&self, next: SessionState) -> Result<(), PipelineError> {
        self.session.lock().transition(next)?;
        Ok(())
    }

    async fn emit(&self, event: SessionEvent) {
        if !self.events.emit(event).await {
            debug!("Event dropped, connection writer closed");
        }
    }
}

#[derive(Debug, Default)]
struct TurnStats {
    audio_url: Option<String>,
    image_url: Option<String>,
    transcript: String,
    response: String,
    segments: u32,
    chunks: u64,
    dropped: u64,
    tts_success: bool,
    transcription_ms: Option<u64>,
    generation_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct AudioStats {
    frames: u64,
    chunks: u64,
    dropped: u64,
}

/// Run one turn to a terminal state.
///
/// Cancellation is reported by whoever triggered it; this function returns
/// quietly when the turn's token fires.
pub async fn run_turn(deps: PipelineDeps, handle: TurnHandle, inputs: TurnInputs) {
    let deadline = deps.settings.turn_timeout(inputs.variant);
    let mut stats = TurnStats::default();

    let result = tokio::select! {
        biased;
        _ = handle.cancel.cancelled() => {
            debug!(session_id = %inputs.session_id, turn = inputs.turn, "Turn cancelled");
            return;
        }
        result = timeout(deadline, drive(&deps, &handle, &inputs, &mut stats)) => {
            result.unwrap_or(Err(PipelineError::TurnTimeout(deadline.as_secs())))
        }
    };

    if let Err(err) = result {
        fail_turn(&deps, &handle, &inputs, &stats, err).await;
    }
}

async fn within<F, T>(limit: Duration, stage: &'static str, fut: F) -> Result<T, PipelineError>
where
    F: Future<Output = T>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| PipelineError::FirstResponseTimeout {
            stage,
            seconds: limit.as_secs(),
        })
}

fn millis_since(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

async fn drive(
    deps: &PipelineDeps,
    handle: &TurnHandle,
    inputs: &TurnInputs,
    stats: &mut TurnStats,
) -> Result<(), PipelineError> {
    let settings = &deps.settings;
    let first = settings.first_response_timeout;

    if let Some(uploader) = &deps.uploader {
        let key = input_key(&settings.storage_prefix, &inputs.session_id, inputs.turn, "audio.bin");
        let url = within(first, "upload", uploader.upload(&key, inputs.audio.clone()))
            .await?
            .map_err(PipelineError::Upload)?;
        stats.audio_url = Some(url);

        if let Some(image) = &inputs.image {
            let key =
                input_key(&settings.storage_prefix, &inputs.session_id, inputs.turn, "image.bin");
            let url = within(first, "upload", uploader.upload(&key, image.clone()))
                .await?
                .map_err(PipelineError::Upload)?;
            stats.image_url = Some(url);
        }
    }

    handle
        .emit(SessionEvent::TranscriptionStarted {
            oss_url: stats.audio_url.clone(),
            image_url: stats.image_url.clone(),
        })
        .await;

    let started = Instant::now();
    let text = within(first, "transcription", deps.transcriber.transcribe(inputs.audio.clone()))
        .await??;
    stats.transcription_ms = Some(millis_since(started));
    let text = text.trim().to_string();
    info!(
        session_id = %inputs.session_id,
        turn = inputs.turn,
        chars = text.chars().count(),
        "Transcription finished"
    );

    if text.is_empty() {
        return skip_generation(deps, handle, inputs, stats).await;
    }
    handle.session.lock().transcript.push(&text);
    stats.transcript = text.clone();

    handle.transition(SessionState::Generating)?;
    handle
        .emit(SessionEvent::ChatStarted {
            user_message: text.clone(),
            image_url: stats.image_url.clone(),
        })
        .await;

    let mut context = ChatContext::text(settings.system_prompt.clone(), text);
    if let Some(image) = &inputs.image {
        context = context.with_image(image_ref(stats.image_url.as_deref(), image));
    }

    let started = Instant::now();
    let mut deltas = within(first, "generation", deps.chat.stream_chat(context)).await??;
    let Some(first_delta) = within(first, "generation", next_text(&mut deltas)).await?? else {
        return Err(PipelineError::EmptyGeneration);
    };

    handle.transition(SessionState::Synthesizing)?;
    handle.emit(SessionEvent::TtsStarted).await;
    let synthesis = within(first, "synthesis", deps.synthesizer.open()).await??;
    let input = synthesis.input;
    let (first_sent, first_sent_rx) = oneshot::channel();
    let mut first_sent = Some(first_sent);
    let mut audio = AbortOnDropHandle::new(tokio::spawn(stream_audio(
        synthesis.output,
        first_sent_rx,
        deps.settings.clone(),
        deps.workers.clone(),
        handle.events.clone(),
    )));

    let mut segmenter = SentenceSegmenter::new(settings.sentence_max_chars);
    let mut pending = Some(first_delta);
    loop {
        let delta = match pending.take() {
            Some(delta) => delta,
            None => match deltas.next().await {
                Some(Ok(delta)) => delta,
                Some(Err(e)) => return Err(e.into()),
                None => break,
            },
        };
        if delta.is_empty() {
            continue;
        }

        stats.response.push_str(&delta);
        handle.session.lock().response.push(&delta);
        handle
            .emit(SessionEvent::ChatChunk {
                chunk: delta.clone(),
                full_response: stats.response.clone(),
            })
            .await;

        if let Some(segment) = segmenter.push(&delta) {
            send_segment(&input, segment, &mut audio, first).await?;
            stats.segments += 1;
            arm_first_frame(&mut first_sent);
        }
    }
    if let Some(segment) = segmenter.finish() {
        send_segment(&input, segment, &mut audio, first).await?;
        stats.segments += 1;
        arm_first_frame(&mut first_sent);
    }
    stats.generation_ms = Some(millis_since(started));
    debug!(
        session_id = %inputs.session_id,
        segments = stats.segments,
        "Generation finished, waiting for synthesis"
    );

    if let Err(e) = input.finish().await {
        return Err(audio_failure(&mut audio, e, first).await);
    }
    let audio_stats = audio
        .await
        .map_err(|e| PipelineError::Synthesis(SynthesisError::ProviderError(e.to_string())))??;
    stats.chunks = audio_stats.chunks;
    stats.dropped = audio_stats.dropped;
    stats.tts_success = true;
    if audio_stats.dropped > 0 {
        warn!(
            session_id = %inputs.session_id,
            dropped = audio_stats.dropped,
            frames = audio_stats.frames,
            "Synthesis frames dropped by overflow policy"
        );
    }
    handle
        .emit(SessionEvent::AudioFinished {
            chunks: audio_stats.chunks,
        })
        .await;

    let record = build_record(inputs, stats, TurnOutcome::Success, None);
    let db_saved = persist(deps, &record).await?;

    handle
        .emit(SessionEvent::ChatTtsComplete {
            transcription: stats.transcript.clone(),
            assistant_response: stats.response.clone(),
            tts_success: stats.tts_success,
            // every sent segment was synthesized, a failed one fails the turn
            segments_count: stats.segments,
            total_segments: stats.segments,
            dropped_frames: stats.dropped,
            db_saved,
        })
        .await;
    handle
        .emit(SessionEvent::Summary(Box::new(summary(inputs, stats, db_saved, false))))
        .await;
    handle.transition(SessionState::Complete)?;

    info!(
        session_id = %inputs.session_id,
        turn = inputs.turn,
        segments = stats.segments,
        chunks = stats.chunks,
        total_ms = millis_since(inputs.started),
        "Turn complete"
    );
    Ok(())
}

async fn skip_generation(
    deps: &PipelineDeps,
    handle: &TurnHandle,
    inputs: &TurnInputs,
    stats: &mut TurnStats,
) -> Result<(), PipelineError> {
    info!(
        session_id = %inputs.session_id,
        turn = inputs.turn,
        "Empty transcription, skipping generation"
    );
    let record = build_record(inputs, stats, TurnOutcome::Skipped, None);
    let db_saved = persist(deps, &record).await?;

    handle.emit(SessionEvent::ChatSkipped).await;
    handle
        .emit(SessionEvent::Summary(Box::new(summary(inputs, stats, db_saved, true))))
        .await;
    handle.transition(SessionState::Complete)?;
    Ok(())
}

async fn next_text(deltas: &mut TextDeltaStream) -> Result<Option<String>, ChatError> {
    while let Some(delta) = deltas.next().await {
        let delta = delta?;
        if !delta.is_empty() {
            return Ok(Some(delta));
        }
    }
    Ok(None)
}

/// Start the synthesis first-response clock once text has been sent
fn arm_first_frame(first_sent: &mut Option<oneshot::Sender<()>>) {
    if let Some(tx) = first_sent.take() {
        let _ = tx.send(());
    }
}

async fn send_segment(
    input: &SynthesisInput,
    segment: String,
    audio: &mut AbortOnDropHandle<Result<AudioStats, PipelineError>>,
    limit: Duration,
) -> Result<(), PipelineError> {
    debug!(chars = segment.chars().count(), "Sending segment to synthesis");
    match input.append(segment).await {
        Ok(()) => Ok(()),
        Err(e) => Err(audio_failure(audio, e, limit).await),
    }
}

/// The input side only closes when the provider task ended, so its own
/// error is the more useful one to report.
async fn audio_failure(
    audio: &mut AbortOnDropHandle<Result<AudioStats, PipelineError>>,
    fallback: SynthesisError,
    limit: Duration,
) -> PipelineError {
    match timeout(limit, audio).await {
        Ok(Ok(Err(e))) => e,
        _ => fallback.into(),
    }
}

/// Wait for the first synthesized frame. The first-response limit runs from
/// the moment the first segment was sent, so a provider that accepts text
/// but never answers fails the turn.
async fn first_frame(
    output: &mut SynthesisOutput,
    first_sent: oneshot::Receiver<()>,
    limit: Duration,
) -> Result<Option<Result<Bytes, SynthesisError>>, PipelineError> {
    tokio::select! {
        frame = output.next_frame() => return Ok(frame),
        sent = first_sent => {
            if sent.is_err() {
                // no text was ever sent
                return Ok(output.next_frame().await);
            }
        }
    }
    within(limit, "synthesis", output.next_frame()).await
}

/// Drain synthesis output through the bounded queue and transcoder, emitting
/// encoded chunks as they are produced.
async fn stream_audio(
    mut output: SynthesisOutput,
    first_sent: oneshot::Receiver<()>,
    settings: Arc<PipelineSettings>,
    workers: TranscodeWorkers,
    events: EventSink,
) -> Result<AudioStats, PipelineError> {
    let (mut producer, consumer) = frame_queue(settings.queue_capacity, settings.overflow_policy);
    let monitor = producer.monitor();
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<EncodedChunk>(settings.queue_capacity.max(1));
    let transcoder = Transcoder::new(settings.transcoder, workers);

    let limit = settings.first_response_timeout;
    let pump = async move {
        let mut frames = 0u64;
        let mut awaiting = Some(first_sent);
        loop {
            let next = match awaiting.take() {
                Some(first_sent) => first_frame(&mut output, first_sent, limit).await?,
                None => output.next_frame().await,
            };
            let Some(frame) = next else { break };
            producer.push(frame?).await?;
            frames += 1;
        }
        Ok::<u64, PipelineError>(frames)
    };
    let transcode = async move {
        transcoder
            .run(consumer, chunk_tx)
            .await
            .map_err(PipelineError::from)
    };
    let forward = async {
        let mut chunks = 0u64;
        while let Some(chunk) = chunk_rx.recv().await {
            events
                .emit(SessionEvent::AudioData {
                    seq: chunk.seq,
                    format: chunk.format,
                    data: chunk.data,
                })
                .await;
            chunks += 1;
        }
        Ok::<u64, PipelineError>(chunks)
    };

    let (frames, _summary, chunks) = tokio::try_join!(pump, transcode, forward)?;
    let queue = monitor.stats();
    debug!(
        frames,
        chunks,
        dropped = queue.dropped,
        high_water = queue.high_water,
        "Audio stream drained"
    );
    Ok(AudioStats {
        frames,
        chunks,
        dropped: queue.dropped,
    })
}

fn image_ref(uploaded: Option<&str>, data: &Bytes) -> ImageRef {
    match uploaded {
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
            ImageRef::Url(url.to_string())
        }
        _ => ImageRef::Inline {
            mime_type: sniff_image_mime(data).to_string(),
            data: data.clone(),
        },
    }
}

async fn persist(deps: &PipelineDeps, record: &CompletionRecord) -> Result<bool, PipelineError> {
    let Some(store) = &deps.store else {
        return Ok(false);
    };
    within(
        deps.settings.first_response_timeout,
        "storage",
        store.persist(record),
    )
    .await?
    .map_err(PipelineError::Persistence)?;
    Ok(true)
}

fn build_record(
    inputs: &TurnInputs,
    stats: &TurnStats,
    outcome: TurnOutcome,
    error: Option<&PipelineError>,
) -> CompletionRecord {
    CompletionRecord {
        session_id: inputs.session_id.clone(),
        turn: inputs.turn,
        variant: inputs.variant.as_str().to_string(),
        outcome,
        transcript: stats.transcript.clone(),
        response: stats.response.clone(),
        audio_url: stats.audio_url.clone(),
        image_url: stats.image_url.clone(),
        tts_success: stats.tts_success,
        segments_count: stats.segments,
        audio_chunks: stats.chunks,
        dropped_frames: stats.dropped,
        error_code: error.map(|e| e.code().to_string()),
        error_message: error.map(ToString::to_string),
        started_at: inputs.started_wall.clone(),
        transcription_ms: stats.transcription_ms,
        generation_ms: stats.generation_ms,
        total_ms: millis_since(inputs.started),
    }
}

fn summary(inputs: &TurnInputs, stats: &TurnStats, db_saved: bool, skipped: bool) -> TurnSummary {
    TurnSummary {
        message: "Turn complete".to_string(),
        session_id: inputs.session_id.clone(),
        turn: inputs.turn,
        packets: inputs.packets,
        packets_declared: inputs.packets_declared,
        audio_size: inputs.audio.len(),
        image_size: inputs.image.as_ref().map(Bytes::len),
        duration: inputs.started.elapsed().as_secs_f64(),
        oss_uploaded: stats.audio_url.is_some(),
        oss_url: stats.audio_url.clone(),
        image_url: stats.image_url.clone(),
        transcription: stats.transcript.clone(),
        assistant_response: stats.response.clone(),
        generation_skipped: skipped,
        segments_count: stats.segments,
        audio_chunks: stats.chunks,
        dropped_frames: stats.dropped,
        db_saved,
    }
}

async fn fail_turn(
    deps: &PipelineDeps,
    handle: &TurnHandle,
    inputs: &TurnInputs,
    stats: &TurnStats,
    err: PipelineError,
) {
    if !handle.session.lock().fail() {
        debug!(
            session_id = %inputs.session_id,
            error = %err,
            "Turn already terminal, failure not reported"
        );
        return;
    }

    error!(
        session_id = %inputs.session_id,
        turn = inputs.turn,
        code = err.code(),
        error = %err,
        "Turn failed"
    );
    handle.emit(SessionEvent::error(err.code(), err.to_string())).await;

    if !deps.settings.persist_failures || matches!(err, PipelineError::Persistence(_)) {
        return;
    }
    let record = build_record(inputs, stats, TurnOutcome::Failed, Some(&err));
    if let Err(e) = persist(deps, &record).await {
        warn!(session_id = %inputs.session_id, error = %e, "Failed to save failure record");
    }
}
