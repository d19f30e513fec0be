use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::audio::{pcm_payload, AudioSourceKind};
use crate::config::{AudioFormat, SessionTranscriptConfig};
use crate::engine::{EngineConfig, EngineFactory, RecognitionEngine};
use crate::error::{Result, TranscriberError};
use crate::events::{EventSender, SessionTranscript, TranscriberEvent, TranscriptMetadata};
use crate::recording::FinalizedRecording;

use super::{STATE_IDLE, STATE_RUNNING, STATE_STOPPING};

/// Post-hoc transcription of a finished session recording.
///
/// Unlike the snippet pipeline there is no streaming state: the whole file
/// is read, its PCM payload extracted, and the engine called once. Failures
/// here propagate to the caller as typed errors so the orchestrator can
/// report them as teardown step failures.
pub struct SessionPipeline {
    config: SessionTranscriptConfig,
    format: AudioFormat,
    factory: Arc<dyn EngineFactory>,
    events: EventSender,
    state: AtomicU8,
    engine: tokio::sync::Mutex<Option<Box<dyn RecognitionEngine>>>,
}

impl SessionPipeline {
    pub fn new(
        config: SessionTranscriptConfig,
        format: AudioFormat,
        factory: Arc<dyn EngineFactory>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            format,
            factory,
            events,
            state: AtomicU8::new(STATE_IDLE),
            engine: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        if let Err(current) =
            self.state
                .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            let message = if current == STATE_STOPPING {
                "Session pipeline is still stopping".to_string()
            } else {
                "Session pipeline is already running".to_string()
            };
            return Err(TranscriberError::InvalidState { message });
        }

        let mut engine = match self.factory.create(&self.config.engine) {
            Ok(engine) => engine,
            Err(e) => {
                self.state.store(STATE_IDLE, Ordering::SeqCst);
                return Err(e);
            }
        };

        let engine_config = EngineConfig {
            sample_rate: self.format.sample_rate,
            options: self.config.engine_options.clone(),
        };
        if let Err(e) = engine.initialize(&engine_config).await {
            self.state.store(STATE_IDLE, Ordering::SeqCst);
            return Err(e);
        }

        *self.engine.lock().await = Some(engine);
        info!("Session transcript pipeline started ({} engine)", self.config.engine);
        Ok(())
    }

    /// Shut the engine down. The pipeline always returns to idle; an engine
    /// shutdown error is reported to the caller after that.
    pub async fn stop(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(STATE_RUNNING, STATE_STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let mut result = Ok(());
        if let Some(mut engine) = self.engine.lock().await.take() {
            if let Err(e) = engine.shutdown().await {
                warn!("Session engine shutdown failed: {}", e);
                result = Err(e);
            }
        }

        self.state.store(STATE_IDLE, Ordering::SeqCst);
        result
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    /// Transcribe a finalized recording and emit `SessionTranscript`.
    ///
    /// Returns `Ok(None)` when there is nothing worth emitting: an empty
    /// payload, an engine result with no speech, empty text, or confidence
    /// below the configured threshold. Exactly one event is emitted on
    /// success.
    pub async fn process_final_session(
        &self,
        recording: &FinalizedRecording,
        source: AudioSourceKind,
    ) -> Result<Option<SessionTranscript>> {
        if self.state.load(Ordering::SeqCst) != STATE_RUNNING {
            return Err(TranscriberError::InvalidState {
                message: "Session pipeline is not running".to_string(),
            });
        }

        info!(
            "Transcribing session {} from {} ({} bytes)",
            recording.session_id,
            recording.path.display(),
            recording.bytes_written
        );

        let bytes = tokio::fs::read(&recording.path).await?;
        let payload = pcm_payload(&bytes);
        if payload.is_empty() {
            info!(
                "Session {} has no audio payload, skipping transcript",
                recording.session_id
            );
            return Ok(None);
        }
        let duration_ms = self.format.duration_ms(payload.len() as u64);

        let started = Instant::now();
        let mut guard = self.engine.lock().await;
        let engine = guard.as_mut().ok_or_else(|| TranscriberError::InvalidState {
            message: "Session engine is not initialized".to_string(),
        })?;

        let result = engine.transcribe(payload).await?;
        if let Err(e) = engine.reset_state().await {
            warn!("Session engine state reset failed: {}", e);
        }
        drop(guard);
        let processing_time_ms = started.elapsed().as_millis() as u64;

        let transcription = match result {
            Some(transcription) => transcription,
            None => {
                info!("No speech detected in session {}", recording.session_id);
                return Ok(None);
            }
        };

        let text = transcription.text.trim();
        if text.is_empty() {
            info!("Empty transcript for session {}", recording.session_id);
            return Ok(None);
        }
        if transcription.confidence < self.config.confidence_threshold {
            info!(
                "Discarding session transcript below confidence threshold ({:.2} < {:.2})",
                transcription.confidence, self.config.confidence_threshold
            );
            return Ok(None);
        }

        let transcript = SessionTranscript {
            session_id: recording.session_id.clone(),
            text: text.to_string(),
            confidence: transcription.confidence,
            is_complete: true,
            metadata: TranscriptMetadata {
                duration_ms,
                word_count: text.split_whitespace().count(),
                processing_time_ms,
            },
        };

        info!(
            "Session transcript for {} ready ({} words from {}, {} ms of audio)",
            transcript.session_id, transcript.metadata.word_count, source, duration_ms
        );
        self.events
            .emit(TranscriberEvent::SessionTranscript(transcript.clone()));

        Ok(Some(transcript))
    }
}
