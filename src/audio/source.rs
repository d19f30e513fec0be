use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::config::AudioFormat;
use crate::error::Result;

/// Audio stream source type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AudioSourceKind {
    /// Microphone input
    Microphone,
    /// System audio output (applications, browser, etc.)
    SystemAudio,
}

impl fmt::Display for AudioSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioSourceKind::Microphone => write!(f, "microphone"),
            AudioSourceKind::SystemAudio => write!(f, "system-audio"),
        }
    }
}

/// One delivery of captured audio (interleaved 16-bit signed LE PCM)
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Raw PCM bytes
    pub pcm: Vec<u8>,
    /// Audio stream source
    pub source: AudioSourceKind,
    /// Capture timestamp in milliseconds since the stream opened
    pub timestamp_ms: u64,
}

/// A capture device reported by the source factory
#[derive(Debug, Clone, Serialize)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
    pub kind: AudioSourceKind,
    pub is_default: bool,
}

/// Audio capture capability.
///
/// Implementations wrap whatever the platform provides (CoreAudio, WASAPI,
/// PulseAudio, a file, a script); the engine only sees the chunk stream.
/// Sources must deliver continuously — silence gating corrupts the duration
/// accounting used for session reconstruction.
#[async_trait::async_trait]
pub trait AudioSource: Send {
    /// Start capturing audio.
    ///
    /// Returns a channel receiver that will receive audio chunks; the channel
    /// closing signals the end of the stream.
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioChunk>>;

    /// Stop capturing audio
    async fn stop(&mut self) -> Result<()>;

    /// Check if the source is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get source name for logging
    fn name(&self) -> &str;
}

/// Resolves configured source kinds to concrete [`AudioSource`] instances.
///
/// Injected at [`Transcriber`](crate::Transcriber) construction so the core
/// never loads platform backends itself.
pub trait AudioSourceFactory: Send + Sync {
    /// List devices available for capture
    fn enumerate_devices(&self) -> Result<Vec<AudioDevice>>;

    /// Create a source for the given kind, optionally bound to a device
    fn create(
        &self,
        kind: AudioSourceKind,
        device_id: Option<&str>,
        format: &AudioFormat,
    ) -> Result<Box<dyn AudioSource>>;
}
