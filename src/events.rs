use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::audio::AudioSourceKind;
use crate::recording::{FinalizedRecording, RecordingSession};

/// Default capacity of the event broadcast channel. Slow subscribers that
/// fall further behind than this lose the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything a [`Transcriber`](crate::Transcriber) reports to the outside
/// world flows through this one event type.
#[derive(Debug, Clone)]
pub enum TranscriberEvent {
    /// The transcriber finished starting and is accepting audio
    Started,
    /// Teardown completed; carries any non-fatal step failures
    Stopped(StopSummary),
    /// A recording file was opened
    RecordingStarted(RecordingSession),
    /// A recording file was finalized and renamed
    RecordingStopped(FinalizedRecording),
    /// Periodic progress while a recording grows
    RecordingProgress(RecordingProgress),
    /// A live snippet transcript
    Snippet(Snippet),
    /// The archival transcript for a finished session
    SessionTranscript(SessionTranscript),
    /// A recoverable error observed during a run
    Error(ErrorNotification),
    /// Counter snapshot, emitted just before `Stopped`
    Metrics(MetricsSnapshot),
}

/// A single live transcript unit from the snippet pipeline
#[derive(Debug, Clone, Serialize)]
pub struct Snippet {
    /// Transcribed text
    pub text: String,

    /// Which capture stream produced the audio
    pub source: AudioSourceKind,

    /// Confidence score (0.0 to 1.0)
    pub confidence: f32,

    /// Capture timestamp of the window's first byte, in monotonic ms
    pub timestamp_ms: u64,

    /// 0-based position within the session; resets when the pipeline restarts
    pub snippet_index: u64,

    /// Identifier of the engine that produced the text
    pub engine: String,
}

/// The single archival transcript produced after a session stops
#[derive(Debug, Clone, Serialize)]
pub struct SessionTranscript {
    /// Recording session this transcript belongs to
    pub session_id: String,

    /// Full transcribed text
    pub text: String,

    /// Confidence score (0.0 to 1.0)
    pub confidence: f32,

    /// Always true; there is no progressive session mode
    pub is_complete: bool,

    pub metadata: TranscriptMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptMetadata {
    /// Recorded audio duration in milliseconds
    pub duration_ms: u64,

    /// Whitespace-delimited token count of the transcript text
    pub word_count: usize,

    /// Wall time the engine spent on the full payload
    pub processing_time_ms: u64,
}

/// Progress update emitted as a recording grows on disk
#[derive(Debug, Clone, Serialize)]
pub struct RecordingProgress {
    pub session_id: String,
    pub bytes_written: u64,
    pub duration_ms: u64,
}

/// A recoverable error surfaced during a run or teardown
#[derive(Debug, Clone, Serialize)]
pub struct ErrorNotification {
    /// Teardown step label, when the error belongs to one
    pub step: Option<String>,
    pub message: String,
}

/// One failed teardown step
#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    pub step: String,
    pub message: String,
}

/// Outcome summary attached to the `Stopped` event
#[derive(Debug, Clone, Serialize, Default)]
pub struct StopSummary {
    pub failures: Vec<StepFailure>,
}

/// Counters accumulated over a run
#[derive(Debug, Clone, Serialize, Default)]
pub struct MetricsSnapshot {
    pub chunks_received: u64,
    pub bytes_recorded: u64,
    pub snippets_emitted: u64,
    pub windows_dropped: u64,
    pub engine_errors: u64,
    pub write_errors: u64,
    pub capture_restarts: u64,
    pub step_failures: u64,
    pub fatal_errors: u64,
}

/// The one dispatch point for outward events. Components hold clones of this
/// sender; subscribers attach through [`EventSender::subscribe`].
#[derive(Clone)]
pub struct EventSender {
    tx: broadcast::Sender<TranscriberEvent>,
}

impl EventSender {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriberEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. With no live subscribers the event is dropped,
    /// which is fine: emission must never block or fail the pipelines.
    pub fn emit(&self, event: TranscriberEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event emitted with no subscribers");
        }
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let events = EventSender::new();
        let mut rx = events.subscribe();

        events.emit(TranscriberEvent::Started);

        match rx.recv().await {
            Ok(TranscriberEvent::Started) => {}
            other => panic!("Expected Started event, got {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        let events = EventSender::new();
        events.emit(TranscriberEvent::Started);
    }

    #[tokio::test]
    async fn test_clone_shares_channel() {
        let events = EventSender::new();
        let clone = events.clone();
        let mut rx = events.subscribe();

        clone.emit(TranscriberEvent::Stopped(StopSummary::default()));

        match rx.recv().await {
            Ok(TranscriberEvent::Stopped(summary)) => assert!(summary.failures.is_empty()),
            other => panic!("Expected Stopped event, got {:?}", other),
        }
    }

    #[test]
    fn test_snippet_serializes() {
        let snippet = Snippet {
            text: "hello world".to_string(),
            source: AudioSourceKind::Microphone,
            confidence: 0.9,
            timestamp_ms: 1500,
            snippet_index: 0,
            engine: "streaming".to_string(),
        };
        let json = serde_json::to_string(&snippet).unwrap();
        assert!(json.contains("\"snippet_index\":0"));
        assert!(json.contains("microphone"));
    }
}
