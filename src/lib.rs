pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod recording;
pub mod transcriber;

pub use audio::{
    AudioChunk, AudioDevice, AudioSource, AudioSourceFactory, AudioSourceKind, ChunkAccumulator,
    ScriptedAudioSource, ScriptedSourceFactory, WavFileWriter,
};
pub use config::{
    AudioFormat, RecordingConfig, SessionTranscriptConfig, SnippetConfig, TranscriberConfig,
};
pub use engine::{
    EngineConfig, EngineFactory, EngineOptions, FnEngineFactory, MockEngine, RecognitionEngine,
    Transcription,
};
pub use error::{Result, TranscriberError};
pub use events::{
    ErrorNotification, EventSender, MetricsSnapshot, SessionTranscript, Snippet, StepFailure,
    StopSummary, TranscriberEvent, TranscriptMetadata,
};
pub use pipeline::{SessionPipeline, SnippetPipeline};
pub use recording::{FinalizedRecording, RecordingSession, SessionRecorder};
pub use transcriber::Transcriber;
