//! Voice Session Manager (C10).
//!
//! Wraps one [`VoicePipeline`] in a long-lived session state machine.
//! Exactly one pipeline instance exists per session at any instant;
//! `interrupt` cancels the current pipeline's active segment and starts a
//! fresh pipeline bound to the same audio source rather than tearing the
//! whole session down, mirroring the teacher's restart-not-rebuild posture
//! for its own long-lived process managers.

use crate::error::{Result, RuntimeError};
use crate::voice::messages::PipelineEvent;
use crate::voice::pipeline::{PipelineComponents, VoicePipeline};
use crate::config::Config;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Listening,
    Processing,
    Speaking,
    Error,
}

/// Builds a fresh [`VoicePipeline`] bound to the session's audio source.
/// The session manager calls this once on `connect` and again on every
/// `interrupt`, so it must be safe to invoke repeatedly.
pub trait PipelineFactory: Send + Sync {
    fn build(&self) -> PipelineComponents;
}

/// Consumes the pipeline's raw event stream, updating shared session state
/// as a side effect, and forwards every event unchanged to `try_next_event`.
/// Runs for the lifetime of one pipeline instance; dropped (and aborted)
/// when that pipeline is replaced by `interrupt` or torn down by
/// `disconnect`.
struct Inner {
    pipeline: Arc<VoicePipeline>,
    events_rx: mpsc::UnboundedReceiver<PipelineEvent>,
    state_task: tokio::task::JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.state_task.abort();
    }
}

/// One voice session: `disconnected -> connecting -> connected ->
/// {listening|processing|speaking} -> disconnected|error`.
pub struct VoiceSession {
    pub id: Uuid,
    state: Arc<Mutex<SessionState>>,
    inner: Mutex<Option<Inner>>,
    factory: Arc<dyn PipelineFactory>,
    config: Config,
    sample_rate: u32,
    max_speech_duration_seconds: f64,
}

impl VoiceSession {
    pub fn new(
        factory: Arc<dyn PipelineFactory>,
        config: Config,
        sample_rate: u32,
        max_speech_duration_seconds: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: Arc::new(Mutex::new(SessionState::Disconnected)),
            inner: Mutex::new(None),
            factory,
            config,
            sample_rate,
            max_speech_duration_seconds,
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.lock().await = state;
    }

    fn build_pipeline(&self) -> (Arc<VoicePipeline>, mpsc::UnboundedReceiver<PipelineEvent>) {
        let components = self.factory.build();
        VoicePipeline::new(
            components,
            &self.config,
            self.sample_rate,
            self.max_speech_duration_seconds,
        )
    }

    /// Spawn the background task that turns pipeline stage events into
    /// `Processing`/`Speaking`/`Error` state transitions and forwards each
    /// event to a fresh channel for `try_next_event` to drain.
    fn spawn_state_tracker(
        state: Arc<Mutex<SessionState>>,
        mut raw_rx: mpsc::UnboundedReceiver<PipelineEvent>,
    ) -> (tokio::task::JoinHandle<()>, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                match &event {
                    PipelineEvent::SegmentStarted { .. } | PipelineEvent::Transcribed { .. } => {
                        *state.lock().await = SessionState::Processing;
                    }
                    PipelineEvent::LlmToken { .. } | PipelineEvent::SentenceReady { .. } => {
                        *state.lock().await = SessionState::Processing;
                    }
                    PipelineEvent::AudioReady { .. } => {
                        *state.lock().await = SessionState::Speaking;
                    }
                    PipelineEvent::SegmentCompleted { .. } => {
                        let mut guard = state.lock().await;
                        if *guard == SessionState::Processing || *guard == SessionState::Speaking {
                            *guard = SessionState::Listening;
                        }
                    }
                    PipelineEvent::SegmentFailed { .. } | PipelineEvent::PipelineError { .. } => {
                        *state.lock().await = SessionState::Error;
                    }
                    _ => {}
                }
                if forward_tx.send(event).is_err() {
                    break;
                }
            }
        });
        (handle, forward_rx)
    }

    /// Connect the session: builds a pipeline and pre-initializes STT.
    pub async fn connect(&self) -> Result<()> {
        self.set_state(SessionState::Connecting).await;
        let span = info_span!("voice_session", session_id = %self.id);
        async {
            let (pipeline, raw_rx) = self.build_pipeline();
            if let Err(e) = pipeline.pre_warm().await {
                self.set_state(SessionState::Error).await;
                return Err(e);
            }
            let (state_task, events_rx) = Self::spawn_state_tracker(self.state.clone(), raw_rx);
            *self.inner.lock().await = Some(Inner { pipeline, events_rx, state_task });
            self.set_state(SessionState::Connected).await;
            info!("voice session connected");
            Ok(())
        }
        .instrument(span)
        .await
    }

    pub async fn disconnect(&self) {
        *self.inner.lock().await = None;
        self.set_state(SessionState::Disconnected).await;
    }

    pub async fn start_listening(&self) -> Result<()> {
        if self.state().await != SessionState::Connected {
            return Err(RuntimeError::Validation {
                field: "state".into(),
                message: "start_listening requires a connected session".into(),
            });
        }
        self.set_state(SessionState::Listening).await;
        Ok(())
    }

    pub async fn stop_listening(&self) -> Result<()> {
        self.set_state(SessionState::Connected).await;
        Ok(())
    }

    /// Feed one chunk of captured audio into the active pipeline.
    pub async fn ingest_audio(&self, chunk: crate::voice::messages::AudioChunk) -> Result<()> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(RuntimeError::NotInitialized)?;
        inner.pipeline.ingest(chunk).await
    }

    /// Drain the next pipeline event, if one is pending.
    pub async fn try_next_event(&self) -> Option<PipelineEvent> {
        self.inner.lock().await.as_mut()?.events_rx.try_recv().ok()
    }

    /// Cancel the current pipeline's active segment and start a fresh
    /// pipeline bound to the same audio source. Exactly one pipeline
    /// instance exists per session at any instant, so the old one is
    /// dropped only after the new one is installed.
    pub async fn interrupt(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(inner) = guard.as_ref() {
            inner.pipeline.interrupt().await;
        }

        let (pipeline, raw_rx) = self.build_pipeline();
        pipeline.pre_warm().await?;
        let (state_task, events_rx) = Self::spawn_state_tracker(self.state.clone(), raw_rx);
        *guard = Some(Inner { pipeline, events_rx, state_task });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::vad::VoiceActivityDetector;

    struct NoStagesFactory;
    impl PipelineFactory for NoStagesFactory {
        fn build(&self) -> PipelineComponents {
            PipelineComponents {
                vad: Some(VoiceActivityDetector::new(VadConfigDefault::get())),
                stt: None,
                llm: None,
                tts: None,
            }
        }
    }

    struct VadConfigDefault;
    impl VadConfigDefault {
        fn get() -> crate::config::VadConfig {
            crate::config::VadConfig::default()
        }
    }

    #[tokio::test]
    async fn connect_transitions_to_connected() {
        let session = VoiceSession::new(Arc::new(NoStagesFactory), Config::default(), 16_000, 30.0);
        assert_eq!(session.state().await, SessionState::Disconnected);
        session.connect().await.unwrap();
        assert_eq!(session.state().await, SessionState::Connected);
    }

    #[tokio::test]
    async fn start_listening_before_connect_fails() {
        let session = VoiceSession::new(Arc::new(NoStagesFactory), Config::default(), 16_000, 30.0);
        let err = session.start_listening().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Validation { .. }));
    }

    #[tokio::test]
    async fn listen_then_stop_returns_to_connected() {
        let session = VoiceSession::new(Arc::new(NoStagesFactory), Config::default(), 16_000, 30.0);
        session.connect().await.unwrap();
        session.start_listening().await.unwrap();
        assert_eq!(session.state().await, SessionState::Listening);
        session.stop_listening().await.unwrap();
        assert_eq!(session.state().await, SessionState::Connected);
    }

    #[tokio::test]
    async fn interrupt_without_a_connection_still_builds_a_fresh_pipeline() {
        let session = VoiceSession::new(Arc::new(NoStagesFactory), Config::default(), 16_000, 30.0);
        session.connect().await.unwrap();
        session.interrupt().await.unwrap();
        assert!(session.inner.lock().await.is_some());
    }

    #[tokio::test]
    async fn disconnect_clears_the_pipeline() {
        let session = VoiceSession::new(Arc::new(NoStagesFactory), Config::default(), 16_000, 30.0);
        session.connect().await.unwrap();
        session.disconnect().await;
        assert_eq!(session.state().await, SessionState::Disconnected);
        assert!(session.ingest_audio(crate::voice::messages::AudioChunk {
            samples: vec![0.0; 16],
            sample_rate: 16_000,
            captured_at: std::time::Instant::now(),
        }).await.is_err());
    }
}
