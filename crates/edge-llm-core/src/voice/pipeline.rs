//! Voice Pipeline (C9).
//!
//! A composable pipeline runnable with any subset of `{VAD, STT, LLM, TTS}`.
//! Buffering, non-blocking STT, barge-in and back-pressure rules follow
//! `saorsa-labs-fae`'s `pipeline/coordinator.rs` shape: VAD gates buffering,
//! each segment is handed to a detached task so audio intake never stalls,
//! and a cancellation token scoped to the active segment implements
//! barge-in.

use crate::adapters::{GenerationOptions, SpeechToText, TextToSpeech};
use crate::cancel::CancellationToken;
use crate::config::{Config, RuntimeConstants};
use crate::error::{PipelineStage, Result};
use crate::inference::InferenceService;
use crate::voice::messages::{
    AudioChunk, LlmToken, PipelineEvent, SentenceChunk, SpeechSegment, SynthesizedAudio,
    Transcription,
};
use crate::voice::vad::VoiceActivityDetector;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// The subset of stages a pipeline instance is built with. Any combination
/// may be `None`; a `None` stage is simply skipped for every segment.
pub struct PipelineComponents {
    pub vad: Option<VoiceActivityDetector>,
    pub stt: Option<Arc<dyn SpeechToText>>,
    pub llm: Option<Arc<InferenceService>>,
    pub tts: Option<Arc<dyn TextToSpeech>>,
}

struct PendingBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

/// One long-lived pipeline instance. Exactly one `SpeechSegment` is
/// in-flight through STT/LLM/TTS at a time per pipeline; a new segment's
/// STT may run concurrently with a prior segment's LLM/TTS because STT runs
/// on a detached task.
pub struct VoicePipeline {
    vad: Mutex<Option<VoiceActivityDetector>>,
    stt: Option<Arc<dyn SpeechToText>>,
    llm: Option<Arc<InferenceService>>,
    tts: Option<Arc<dyn TextToSpeech>>,
    generation_options: GenerationOptions,
    events: mpsc::UnboundedSender<PipelineEvent>,
    pending: Mutex<PendingBuffer>,
    min_speech_samples: usize,
    max_speech_samples: usize,
    no_vad_flush_samples: usize,
    next_segment_id: AtomicU64,
    stt_ready: AtomicBool,
    /// One cancellation token per in-flight segment. A new segment's STT may
    /// run concurrently with an earlier segment's still-running LLM/TTS
    /// stages, so `interrupt` cannot assume there is only one active token.
    active_cancels: Mutex<HashMap<u64, CancellationToken>>,
}

impl VoicePipeline {
    pub fn new(
        components: PipelineComponents,
        config: &Config,
        sample_rate: u32,
        max_speech_duration_seconds: f64,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let min_speech_samples =
            (config.vad.min_speech_duration_seconds * sample_rate as f64) as usize;
        let max_speech_samples = (max_speech_duration_seconds * sample_rate as f64) as usize;
        let no_vad_flush_samples =
            RuntimeConstants::VOICE_FLUSH_INTERVAL_NO_VAD.as_secs_f64() as usize * sample_rate as usize;

        let pipeline = Arc::new(Self {
            vad: Mutex::new(components.vad),
            stt: components.stt,
            llm: components.llm,
            tts: components.tts,
            generation_options: GenerationOptions::default(),
            events: tx,
            pending: Mutex::new(PendingBuffer {
                samples: Vec::new(),
                sample_rate,
            }),
            min_speech_samples,
            max_speech_samples: max_speech_samples.max(1),
            no_vad_flush_samples: no_vad_flush_samples.max(1),
            next_segment_id: AtomicU64::new(0),
            stt_ready: AtomicBool::new(false),
            active_cancels: Mutex::new(HashMap::new()),
        });
        (pipeline, rx)
    }

    /// Session manager must call this before starting the pipeline: runs a
    /// dummy transcription so the STT backend finishes model load. Until
    /// this resolves, `is_ready` reports `false` (a "not-ready" state).
    pub async fn pre_warm(&self) -> Result<()> {
        if let Some(stt) = &self.stt {
            self.emit(PipelineEvent::ComponentInitStarted { component: "stt" });
            match stt.transcribe(&[]).await {
                Ok(_) => self.emit(PipelineEvent::ComponentInitOk { component: "stt" }),
                Err(e) => {
                    self.emit(PipelineEvent::ComponentInitFailed {
                        component: "stt",
                        message: e.to_string(),
                    });
                    self.emit(PipelineEvent::PipelineError { message: e.to_string() });
                    return Err(e);
                }
            }
        }
        self.stt_ready.store(true, Ordering::SeqCst);
        self.emit(PipelineEvent::PipelineStarted);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.stt.is_none() || self.stt_ready.load(Ordering::SeqCst)
    }

    /// Ingest one chunk of captured audio. Buffers while speech is active
    /// (or, with VAD disabled, flushes every ≈2 s) and dispatches a
    /// segment to the detached STT/LLM/TTS task when ready.
    pub async fn ingest(self: &Arc<Self>, chunk: AudioChunk) -> Result<()> {
        let mut vad_guard = self.vad.lock().await;
        if let Some(vad) = vad_guard.as_mut() {
            let frame = vad.process_frame(&chunk);
            if frame.speech_started {
                self.emit(PipelineEvent::SpeechStarted);
            }
            if frame.is_speech {
                let mut pending = self.pending.lock().await;
                pending.samples.extend_from_slice(&chunk.samples);
                pending.sample_rate = chunk.sample_rate;
                if pending.samples.len() >= self.max_speech_samples {
                    self.dispatch_segment(&mut pending).await;
                }
            } else if frame.speech_ended {
                let mut pending = self.pending.lock().await;
                let had_transcript = pending.samples.len() >= self.min_speech_samples;
                self.emit(PipelineEvent::SpeechEnded { had_transcript });
                if had_transcript {
                    self.dispatch_segment(&mut pending).await;
                } else {
                    debug!(
                        samples = pending.samples.len(),
                        "speech segment shorter than minimum duration, continuing to buffer"
                    );
                }
            }
            return Ok(());
        }
        drop(vad_guard);

        let mut pending = self.pending.lock().await;
        pending.samples.extend_from_slice(&chunk.samples);
        pending.sample_rate = chunk.sample_rate;
        if pending.samples.len() >= self.no_vad_flush_samples {
            self.dispatch_segment(&mut pending).await;
        }
        Ok(())
    }

    async fn dispatch_segment(self: &Arc<Self>, pending: &mut PendingBuffer) {
        if pending.samples.is_empty() {
            return;
        }
        let segment = SpeechSegment {
            samples: std::mem::take(&mut pending.samples),
            sample_rate: pending.sample_rate,
            started_at: std::time::Instant::now(),
        };
        let segment_id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        self.active_cancels.lock().await.insert(segment_id, cancel.clone());

        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.run_segment(segment_id, segment, cancel).await;
            pipeline.active_cancels.lock().await.remove(&segment_id);
        });
    }

    /// Abort every in-flight segment's current stage at its next suspension
    /// point, not just the most recently dispatched one: a new segment's STT
    /// may be running while an earlier segment's LLM/TTS stages are still in
    /// flight, and both must observe barge-in.
    pub async fn interrupt(&self) {
        let cancels = self.active_cancels.lock().await;
        for cancel in cancels.values() {
            cancel.cancel();
        }
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    async fn run_segment(self: Arc<Self>, segment_id: u64, segment: SpeechSegment, cancel: CancellationToken) {
        self.emit(PipelineEvent::SegmentStarted { segment_id });

        let transcription = match self.run_stt(segment_id, &segment, &cancel).await {
            Ok(Some(t)) => t,
            Ok(None) => {
                self.emit(PipelineEvent::SegmentCompleted { segment_id });
                return;
            }
            Err(e) => {
                self.emit(PipelineEvent::SegmentFailed {
                    segment_id,
                    stage: PipelineStage::Stt,
                    message: e.to_string(),
                });
                return;
            }
        };

        let final_sentence = match self.run_llm(segment_id, &transcription, &cancel).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                self.emit(PipelineEvent::SegmentCompleted { segment_id });
                return;
            }
            Err(e) => {
                self.emit(PipelineEvent::SegmentFailed {
                    segment_id,
                    stage: PipelineStage::Llm,
                    message: e.to_string(),
                });
                return;
            }
        };

        if let Err(e) = self.run_tts(segment_id, &final_sentence, &cancel).await {
            self.emit(PipelineEvent::SegmentFailed {
                segment_id,
                stage: PipelineStage::Tts,
                message: e.to_string(),
            });
            return;
        }

        self.emit(PipelineEvent::SegmentCompleted { segment_id });
    }

    async fn run_stt(
        &self,
        segment_id: u64,
        segment: &SpeechSegment,
        cancel: &CancellationToken,
    ) -> Result<Option<Transcription>> {
        let Some(stt) = &self.stt else {
            return Ok(None);
        };
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let captured_at = segment.started_at;
        let text = tokio::select! {
            result = stt.transcribe(&segment.samples) => result?,
            _ = cancel.cancelled() => return Ok(None),
        };

        let transcription = Transcription {
            text,
            is_final: true,
            audio_captured_at: captured_at,
            transcribed_at: std::time::Instant::now(),
        };
        self.emit(PipelineEvent::Transcribed {
            segment_id,
            transcription: transcription.clone(),
        });
        Ok(Some(transcription))
    }

    async fn run_llm(
        &self,
        segment_id: u64,
        transcription: &Transcription,
        cancel: &CancellationToken,
    ) -> Result<Option<SentenceChunk>> {
        let Some(llm) = &self.llm else {
            return Ok(None);
        };
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let mut stream = tokio::select! {
            result = llm.stream_generate(&transcription.text, &self.generation_options, cancel.clone()) => result?,
            _ = cancel.cancelled() => return Ok(None),
        };

        use futures::StreamExt;
        let mut last: Option<crate::adapters::GenerationResult> = None;
        loop {
            let next = tokio::select! {
                item = stream.next() => item,
                _ = cancel.cancelled() => return Ok(None),
            };
            match next {
                Some(Ok(partial)) => {
                    self.emit(PipelineEvent::LlmToken {
                        segment_id,
                        token: LlmToken {
                            text: partial.text.clone(),
                            is_end: partial.finish_reason.is_some(),
                        },
                    });
                    last = Some(partial);
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        let result = match last {
            Some(result) => result,
            None => return Ok(None),
        };
        let sentence = SentenceChunk {
            text: result.text,
            is_final: true,
        };
        self.emit(PipelineEvent::SentenceReady {
            segment_id,
            sentence: sentence.clone(),
        });
        Ok(Some(sentence))
    }

    async fn run_tts(
        &self,
        segment_id: u64,
        sentence: &SentenceChunk,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(tts) = &self.tts else {
            return Ok(());
        };
        if cancel.is_cancelled() {
            return Ok(());
        }

        let samples = tokio::select! {
            result = tts.synthesize(&sentence.text) => result?,
            _ = cancel.cancelled() => return Ok(()),
        };

        self.emit(PipelineEvent::AudioReady {
            segment_id,
            audio: SynthesizedAudio {
                samples,
                sample_rate: 16_000,
                is_final: true,
            },
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Instant;

    struct EchoStt;
    #[async_trait]
    impl SpeechToText for EchoStt {
        async fn load(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
        async fn transcribe(&self, samples: &[f32]) -> Result<String> {
            Ok(format!("{} samples", samples.len()))
        }
        async fn transcribe_streaming(
            &self,
            samples: &[f32],
            _cancel: CancellationToken,
        ) -> Result<std::pin::Pin<Box<dyn futures::Stream<Item = Result<String>> + Send>>> {
            let text = self.transcribe(samples).await?;
            Ok(Box::pin(futures::stream::once(async move { Ok(text) })))
        }
    }

    struct HangingStt;
    #[async_trait]
    impl SpeechToText for HangingStt {
        async fn load(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
        async fn transcribe(&self, _samples: &[f32]) -> Result<String> {
            std::future::pending::<()>().await;
            unreachable!()
        }
        async fn transcribe_streaming(
            &self,
            _samples: &[f32],
            _cancel: CancellationToken,
        ) -> Result<std::pin::Pin<Box<dyn futures::Stream<Item = Result<String>> + Send>>> {
            std::future::pending().await
        }
    }

    fn chunk(n: usize) -> AudioChunk {
        AudioChunk {
            samples: vec![0.5; n],
            sample_rate: 16_000,
            captured_at: Instant::now(),
        }
    }

    fn silent_chunk(n: usize) -> AudioChunk {
        AudioChunk {
            samples: vec![0.0; n],
            sample_rate: 16_000,
            captured_at: Instant::now(),
        }
    }

    fn components_with(vad: Option<VoiceActivityDetector>, stt: Option<Arc<dyn SpeechToText>>) -> PipelineComponents {
        PipelineComponents {
            vad,
            stt,
            llm: None,
            tts: None,
        }
    }

    #[tokio::test]
    async fn short_speech_segment_is_not_dispatched_until_long_enough() {
        let config = Config::default();
        let vad = VoiceActivityDetector::new(config.vad.clone());
        let components = components_with(Some(vad), Some(Arc::new(EchoStt)));
        let (pipeline, mut events) = VoicePipeline::new(components, &config, 16_000, 30.0);

        // One loud frame followed by silence: too short to cross the
        // minimum-speech-duration gate, so nothing should dispatch.
        pipeline.ingest(chunk(1600)).await.unwrap();
        pipeline.ingest(silent_chunk(1600)).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn long_enough_segment_runs_stt_and_emits_events_in_order() {
        let mut config = Config::default();
        config.vad.min_speech_duration_seconds = 0.05;
        let vad = VoiceActivityDetector::new(config.vad.clone());
        let components = components_with(Some(vad), Some(Arc::new(EchoStt)));
        let (pipeline, mut events) = VoicePipeline::new(components, &config, 16_000, 30.0);

        pipeline.ingest(chunk(1600)).await.unwrap();
        pipeline.ingest(silent_chunk(1600)).await.unwrap();

        let started = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(started, PipelineEvent::SegmentStarted { segment_id: 0 }));

        let transcribed = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(transcribed, PipelineEvent::Transcribed { segment_id: 0, .. }));

        let completed = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(completed, PipelineEvent::SegmentCompleted { segment_id: 0 }));
    }

    #[tokio::test]
    async fn interrupt_cancels_an_in_flight_segment_without_completing_it() {
        let mut config = Config::default();
        config.vad.min_speech_duration_seconds = 0.05;
        let vad = VoiceActivityDetector::new(config.vad.clone());
        let components = components_with(Some(vad), Some(Arc::new(HangingStt)));
        let (pipeline, mut events) = VoicePipeline::new(components, &config, 16_000, 30.0);

        pipeline.ingest(chunk(1600)).await.unwrap();
        pipeline.ingest(silent_chunk(1600)).await.unwrap();

        let started = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(started, PipelineEvent::SegmentStarted { .. }));

        pipeline.interrupt().await;

        // No further events: the segment was abandoned mid-STT, not
        // completed or failed.
        let next = tokio::time::timeout(std::time::Duration::from_millis(200), events.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn pre_warm_marks_pipeline_ready() {
        let config = Config::default();
        let components = components_with(None, Some(Arc::new(EchoStt)));
        let (pipeline, _events) = VoicePipeline::new(components, &config, 16_000, 30.0);
        assert!(!pipeline.is_ready());
        pipeline.pre_warm().await.unwrap();
        assert!(pipeline.is_ready());
    }
}
