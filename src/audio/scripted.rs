use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::AudioFormat;
use crate::error::{Result, TranscriberError};

use super::source::{AudioChunk, AudioDevice, AudioSource, AudioSourceFactory, AudioSourceKind};

/// Audio source that replays a prepared PCM script.
///
/// Useful for demos and tests where no capture hardware is available. The
/// script is cut into fixed-duration chunks; `start` spawns a feeder task
/// that sends them down the channel, optionally pacing at real-time speed,
/// then closes the channel to signal end of capture.
pub struct ScriptedAudioSource {
    kind: AudioSourceKind,
    name: String,
    chunks: Vec<AudioChunk>,
    chunk_ms: u64,
    pace: Option<Duration>,
    capturing: Arc<AtomicBool>,
    feeder: Option<JoinHandle<()>>,
}

impl ScriptedAudioSource {
    /// Build a source that replays `pcm`, cut into `chunk_ms` chunks with
    /// synthetic arrival timestamps starting at zero.
    pub fn from_pcm(
        kind: AudioSourceKind,
        format: &AudioFormat,
        pcm: Vec<u8>,
        chunk_ms: u64,
    ) -> Self {
        let chunk_bytes = (format.bytes_per_second() * chunk_ms / 1000).max(2) as usize;
        let chunks = pcm
            .chunks(chunk_bytes)
            .enumerate()
            .map(|(i, piece)| AudioChunk {
                pcm: piece.to_vec(),
                source: kind,
                timestamp_ms: i as u64 * chunk_ms,
            })
            .collect();

        Self {
            kind,
            name: format!("scripted-{}", kind),
            chunks,
            chunk_ms,
            pace: None,
            capturing: Arc::new(AtomicBool::new(false)),
            feeder: None,
        }
    }

    /// Build a source that replays a 440 Hz tone of the given duration.
    /// The payload is deliberately non-silent so recognition mocks and
    /// recorded files have real sample data to work with.
    pub fn tone(
        kind: AudioSourceKind,
        format: &AudioFormat,
        duration: Duration,
        chunk_ms: u64,
    ) -> Self {
        let total_samples =
            (format.sample_rate as u64 * duration.as_millis() as u64 / 1000) as usize;
        let mut pcm = Vec::with_capacity(total_samples * 2);
        for i in 0..total_samples {
            let t = i as f32 / format.sample_rate as f32;
            let sample = ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16;
            for _ in 0..format.channels {
                pcm.extend_from_slice(&sample.to_le_bytes());
            }
        }
        Self::from_pcm(kind, format, pcm, chunk_ms)
    }

    /// Pace chunk delivery at real-time speed instead of replaying as fast
    /// as the channel accepts.
    pub fn paced(mut self, paced: bool) -> Self {
        self.pace = paced.then(|| Duration::from_millis(self.chunk_ms));
        self
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.pcm.len()).sum()
    }
}

#[async_trait::async_trait]
impl AudioSource for ScriptedAudioSource {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioChunk>> {
        if self.capturing.load(Ordering::SeqCst) {
            return Err(TranscriberError::InvalidState {
                message: format!("{} is already capturing", self.name),
            });
        }

        let (tx, rx) = mpsc::channel(32);
        let chunks = std::mem::take(&mut self.chunks);
        let pace = self.pace;
        let capturing = Arc::clone(&self.capturing);
        capturing.store(true, Ordering::SeqCst);

        debug!("Starting scripted source with {} chunks", chunks.len());

        let feeder = tokio::spawn(async move {
            for chunk in chunks {
                if !capturing.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(delay) = pace {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            capturing.store(false, Ordering::SeqCst);
            // tx drops here, closing the channel to signal end of capture
        });
        self.feeder = Some(feeder);

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        self.capturing.store(false, Ordering::SeqCst);
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.await;
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Factory that hands out pre-registered scripted sources.
///
/// Each `push_source` queues one source for its kind; `create` pops in FIFO
/// order, so restart behavior can be scripted by queueing several sources
/// for the same kind.
#[derive(Default)]
pub struct ScriptedSourceFactory {
    plans: Mutex<HashMap<AudioSourceKind, VecDeque<ScriptedAudioSource>>>,
}

impl ScriptedSourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_source(&self, source: ScriptedAudioSource) {
        let mut plans = self
            .plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        plans.entry(source.kind).or_default().push_back(source);
    }

    pub fn remaining(&self, kind: AudioSourceKind) -> usize {
        let plans = self
            .plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        plans.get(&kind).map_or(0, |queue| queue.len())
    }
}

impl AudioSourceFactory for ScriptedSourceFactory {
    fn enumerate_devices(&self) -> Result<Vec<AudioDevice>> {
        let plans = self
            .plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(plans
            .keys()
            .map(|kind| AudioDevice {
                id: format!("scripted-{}", kind),
                name: format!("Scripted {}", kind),
                kind: *kind,
                is_default: true,
            })
            .collect())
    }

    fn create(
        &self,
        kind: AudioSourceKind,
        device_id: Option<&str>,
        _format: &AudioFormat,
    ) -> Result<Box<dyn AudioSource>> {
        let mut plans = self
            .plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match plans.get_mut(&kind).and_then(|queue| queue.pop_front()) {
            Some(source) => Ok(Box::new(source)),
            None => Err(TranscriberError::DeviceNotFound {
                device: device_id.map(str::to_string).unwrap_or_else(|| kind.to_string()),
            }),
        }
    }
}
