use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audio::WavFileWriter;
use crate::config::{AudioFormat, RecordingConfig};
use crate::error::{Result, TranscriberError};
use crate::events::{EventSender, RecordingProgress, TranscriberEvent};

/// A recording session that has been started and not yet finalized
#[derive(Debug, Clone, Serialize)]
pub struct RecordingSession {
    pub session_id: String,
    /// Path the session is being written to (`.partial.wav` until finalize)
    pub path: PathBuf,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub started_at: DateTime<Utc>,
}

/// A recording session whose WAV file has been finalized and renamed
#[derive(Debug, Clone, Serialize)]
pub struct FinalizedRecording {
    pub session_id: String,
    pub path: PathBuf,
    pub bytes_written: u64,
    pub duration_ms: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub started_at: DateTime<Utc>,
}

struct ActiveRecording {
    session: RecordingSession,
    /// Taken when the recording self-stops at the max-duration cutoff
    writer: Option<WavFileWriter>,
    /// Set when the cutoff finalized the file before `stop` was called
    finalized: Option<FinalizedRecording>,
    next_progress_ms: u64,
    overrun_warned: bool,
}

/// Writes the live PCM stream to disk as a WAV session file.
///
/// Audio is streamed to a `.partial.wav` file and atomically renamed to
/// `.wav` once the header is finalized, so a `.wav` on disk is always a
/// complete, valid file. Write calls stay synchronous on the audio path;
/// a failed write is reported to the caller, never allowed to panic.
pub struct SessionRecorder {
    config: RecordingConfig,
    format: AudioFormat,
    events: EventSender,
    inner: Mutex<Option<ActiveRecording>>,
    bytes_recorded: AtomicU64,
}

impl SessionRecorder {
    pub fn new(config: RecordingConfig, format: AudioFormat, events: EventSender) -> Self {
        Self {
            config,
            format,
            events,
            inner: Mutex::new(None),
            bytes_recorded: AtomicU64::new(0),
        }
    }

    /// Open the session file and emit `RecordingStarted`
    pub fn start(&self) -> Result<RecordingSession> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.is_some() {
            return Err(TranscriberError::InvalidState {
                message: "Recording already in progress".to_string(),
            });
        }

        let started_at = Utc::now();
        let session_id = format!(
            "{}-{}",
            started_at.format("%Y%m%d-%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let path = self
            .config
            .output_dir
            .join(format!("{}.partial.wav", session_id));

        let writer = WavFileWriter::open(&path, &self.format)?;

        let session = RecordingSession {
            session_id,
            path,
            sample_rate: self.format.sample_rate,
            channels: self.format.channels,
            bits_per_sample: self.format.bits_per_sample,
            started_at,
        };

        info!(
            "Started recording session {} -> {}",
            session.session_id,
            session.path.display()
        );

        self.bytes_recorded.store(0, Ordering::SeqCst);
        *inner = Some(ActiveRecording {
            session: session.clone(),
            writer: Some(writer),
            finalized: None,
            next_progress_ms: 1000,
            overrun_warned: false,
        });
        drop(inner);

        self.events
            .emit(TranscriberEvent::RecordingStarted(session.clone()));

        Ok(session)
    }

    /// Append PCM bytes to the session file.
    ///
    /// A quiet no-op when no session is active. Emits `RecordingProgress`
    /// once per whole recorded second, and finalizes the file in place when
    /// the configured max duration is reached, after which further audio is
    /// dropped with a single warning.
    pub fn write_chunk(&self, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let active = match inner.as_mut() {
            Some(active) => active,
            None => return Ok(()),
        };

        let writer = match active.writer.as_mut() {
            Some(writer) => writer,
            None => {
                if !active.overrun_warned {
                    warn!(
                        "Recording session {} already ended at the max duration, dropping further audio",
                        active.session.session_id
                    );
                    active.overrun_warned = true;
                }
                return Ok(());
            }
        };

        writer.write_chunk(bytes)?;
        let total = writer.bytes_written();
        self.bytes_recorded.store(total, Ordering::SeqCst);
        let duration_ms = self.format.duration_ms(total);

        if duration_ms >= active.next_progress_ms {
            active.next_progress_ms = (duration_ms / 1000 + 1) * 1000;
            self.events
                .emit(TranscriberEvent::RecordingProgress(RecordingProgress {
                    session_id: active.session.session_id.clone(),
                    bytes_written: total,
                    duration_ms,
                }));
        }

        if let Some(limit_secs) = self.config.max_duration_secs {
            if duration_ms >= limit_secs * 1000 {
                info!(
                    "Recording session {} reached the max duration of {}s, finalizing",
                    active.session.session_id, limit_secs
                );
                let writer = match active.writer.take() {
                    Some(writer) => writer,
                    None => return Ok(()),
                };
                let finalized = finalize_writer(writer, &active.session, &self.format)?;
                self.events
                    .emit(TranscriberEvent::RecordingStopped(finalized.clone()));
                active.finalized = Some(finalized);
            }
        }

        Ok(())
    }

    /// Finalize the session file, rename it to `.wav`, and emit
    /// `RecordingStopped`. If the session already self-stopped at the max
    /// duration, returns the cached result without emitting again.
    pub fn stop(&self) -> Result<FinalizedRecording> {
        let active = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let active = match active {
            Some(active) => active,
            None => {
                return Err(TranscriberError::InvalidState {
                    message: "No recording in progress".to_string(),
                })
            }
        };

        if let Some(finalized) = active.finalized {
            info!(
                "Recording session {} was already finalized at the max duration",
                finalized.session_id
            );
            return Ok(finalized);
        }

        let writer = match active.writer {
            Some(writer) => writer,
            None => {
                return Err(TranscriberError::Other(format!(
                    "Recording session {} ended without a finalized file; partial file retained at {}",
                    active.session.session_id,
                    active.session.path.display()
                )))
            }
        };

        let finalized = finalize_writer(writer, &active.session, &self.format)?;
        info!(
            "Stopped recording session {} ({} bytes, {} ms) -> {}",
            finalized.session_id,
            finalized.bytes_written,
            finalized.duration_ms,
            finalized.path.display()
        );
        self.events
            .emit(TranscriberEvent::RecordingStopped(finalized.clone()));

        Ok(finalized)
    }

    /// Drop the session and delete its partial file without emitting events.
    /// Used to roll back a start sequence that failed partway.
    pub fn abort(&self) {
        let active = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(active) = active {
            if let Some(writer) = active.writer {
                let path = writer.path().to_path_buf();
                writer.discard();
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to remove aborted recording {}: {}", path.display(), e);
                }
            }
            info!("Aborted recording session {}", active.session.session_id);
        }
    }

    /// True while a session is open and still accepting audio
    pub fn is_recording(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |active| active.writer.is_some())
    }

    pub fn has_session(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn bytes_recorded(&self) -> u64 {
        self.bytes_recorded.load(Ordering::SeqCst)
    }
}

/// Patch the WAV header, rename `.partial.wav` to `.wav`, and describe the
/// result. On error the partial file stays on disk for recovery.
fn finalize_writer(
    writer: WavFileWriter,
    session: &RecordingSession,
    format: &AudioFormat,
) -> Result<FinalizedRecording> {
    let bytes_written = writer.bytes_written();
    let partial_path = writer.finalize()?;

    let final_path = partial_path
        .parent()
        .map(|dir| dir.join(format!("{}.wav", session.session_id)))
        .unwrap_or_else(|| PathBuf::from(format!("{}.wav", session.session_id)));
    fs::rename(&partial_path, &final_path)?;

    Ok(FinalizedRecording {
        session_id: session.session_id.clone(),
        path: final_path,
        bytes_written,
        duration_ms: format.duration_ms(bytes_written),
        sample_rate: session.sample_rate,
        channels: session.channels,
        started_at: session.started_at,
    })
}
