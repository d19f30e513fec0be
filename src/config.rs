use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::engine::EngineOptions;
use crate::error::{Result, TranscriberError};

/// Top-level configuration for a [`Transcriber`](crate::Transcriber).
///
/// Immutable for the lifetime of a run; changing any of it requires a full
/// stop/reconstruct cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriberConfig {
    /// Capture from the microphone
    pub enable_microphone: bool,

    /// Capture system audio output
    pub enable_system_audio: bool,

    /// Specific microphone device to open (default device if unset)
    pub microphone_device_id: Option<String>,

    /// PCM format shared by every consumer
    pub audio: AudioFormat,

    /// Live snippet pipeline configuration
    pub snippets: SnippetConfig,

    /// Post-session archival transcript configuration
    pub session_transcript: SessionTranscriptConfig,

    /// On-disk recording configuration
    pub recording: RecordingConfig,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            enable_microphone: true,
            enable_system_audio: false,
            microphone_device_id: None,
            audio: AudioFormat::default(),
            snippets: SnippetConfig::default(),
            session_transcript: SessionTranscriptConfig::default(),
            recording: RecordingConfig::default(),
        }
    }
}

/// PCM audio format parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Number of channels (1 = mono, 2 = stereo)
    pub channels: u16,

    /// Bits per sample (only 16-bit signed PCM is supported)
    pub bits_per_sample: u16,

    /// Capture buffer size in samples
    pub buffer_size: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000, // 16kHz, what recognition models expect
            channels: 1,        // Mono
            bits_per_sample: 16,
            buffer_size: 1024,
        }
    }
}

impl AudioFormat {
    /// PCM bytes produced per second of audio in this format
    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * (self.bits_per_sample as u64 / 8)
    }

    /// Duration in milliseconds represented by `bytes` of PCM
    pub fn duration_ms(&self, bytes: u64) -> u64 {
        bytes * 1000 / self.bytes_per_second().max(1)
    }
}

/// Live snippet pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnippetConfig {
    pub enabled: bool,

    /// Seconds of audio accumulated per snippet window
    pub interval_seconds: u64,

    /// Engine identifier resolved through the injected engine factory
    pub engine: String,

    /// Snippets below this confidence are discarded
    pub confidence_threshold: f32,

    /// Engine-specific options passed through at initialization
    pub engine_options: EngineOptions,
}

impl Default for SnippetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 15,
            engine: "streaming".to_string(),
            confidence_threshold: 0.4,
            engine_options: EngineOptions::default(),
        }
    }
}

/// Archival session transcript settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTranscriptConfig {
    pub enabled: bool,

    /// Engine identifier resolved through the injected engine factory
    pub engine: String,

    /// Transcripts below this confidence are discarded
    pub confidence_threshold: f32,

    /// Engine-specific options passed through at initialization
    pub engine_options: EngineOptions,
}

impl Default for SessionTranscriptConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            engine: "batch".to_string(),
            confidence_threshold: 0.7,
            engine_options: EngineOptions::default(),
        }
    }
}

/// On-disk session recording settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub enabled: bool,

    /// Directory where session WAV files are written
    pub output_dir: PathBuf,

    /// Delete the recording file after teardown completes
    pub auto_cleanup: bool,

    /// Hard cap on recording length; the recorder finalizes itself when reached
    pub max_duration_secs: Option<u64>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            output_dir: PathBuf::from("recordings"),
            auto_cleanup: false,
            max_duration_secs: None,
        }
    }
}

impl TranscriberConfig {
    /// Load configuration from a file (TOML/YAML/JSON, resolved by extension)
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .map_err(|e| TranscriberError::InvalidConfiguration {
                message: format!("failed to read config file '{}': {}", path, e),
            })?;

        settings
            .try_deserialize()
            .map_err(|e| TranscriberError::InvalidConfiguration {
                message: format!("failed to parse config file '{}': {}", path, e),
            })
    }

    /// Check cross-field requirements before any resource is acquired.
    pub fn validate(&self) -> Result<()> {
        if !self.snippets.enabled && !self.session_transcript.enabled {
            return Err(invalid(
                "at least one of snippets or session_transcript must be enabled",
            ));
        }

        if self.session_transcript.enabled && !self.recording.enabled {
            return Err(invalid(
                "session_transcript requires recording to be enabled",
            ));
        }

        if self.recording.enabled && self.recording.output_dir.as_os_str().is_empty() {
            return Err(invalid("recording requires an output directory"));
        }

        if !self.enable_microphone && !self.enable_system_audio {
            return Err(invalid("at least one audio source must be enabled"));
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(invalid("audio sample rate and channels must be non-zero"));
        }

        if self.audio.bits_per_sample != 16 {
            return Err(invalid("only 16-bit signed PCM is supported"));
        }

        if self.snippets.enabled {
            if self.snippets.interval_seconds == 0 {
                return Err(invalid("snippets.interval_seconds must be non-zero"));
            }
            if self.snippets.engine.is_empty() {
                return Err(invalid("snippets.engine must be set"));
            }
            if !(0.0..=1.0).contains(&self.snippets.confidence_threshold) {
                return Err(invalid(
                    "snippets.confidence_threshold must be between 0.0 and 1.0",
                ));
            }
        }

        if self.session_transcript.enabled {
            if self.session_transcript.engine.is_empty() {
                return Err(invalid("session_transcript.engine must be set"));
            }
            if !(0.0..=1.0).contains(&self.session_transcript.confidence_threshold) {
                return Err(invalid(
                    "session_transcript.confidence_threshold must be between 0.0 and 1.0",
                ));
            }
        }

        Ok(())
    }
}

fn invalid(message: &str) -> TranscriberError {
    TranscriberError::InvalidConfiguration {
        message: message.to_string(),
    }
}
