use std::time::Duration;
use tracing::trace;

use crate::config::AudioFormat;

/// A flushed accumulation of PCM covering at least the target interval
#[derive(Debug)]
pub struct Window {
    /// Every byte accumulated since the last flush, including the chunk that
    /// crossed the interval boundary
    pub bytes: Vec<u8>,
    /// Capture timestamp of the first byte in this window
    pub start_ms: u64,
    /// Audio duration of `bytes` at the configured format
    pub duration_ms: u64,
}

/// Buffers an unbounded chunk stream into fixed-duration windows.
///
/// Duration is computed from byte counts and the PCM format, never from wall
/// clock, so feeding recorded audio faster than real time still windows
/// correctly. When the buffered duration reaches the target the *entire*
/// buffer is returned as one window; the accumulator never slices, so windows
/// may slightly overshoot the target by up to one chunk.
#[derive(Debug)]
pub struct ChunkAccumulator {
    target_ms: u64,
    bytes_per_second: u64,
    buffer: Vec<u8>,
    window_start_ms: Option<u64>,
}

impl ChunkAccumulator {
    pub fn new(target: Duration, format: &AudioFormat) -> Self {
        Self {
            target_ms: target.as_millis() as u64,
            bytes_per_second: format.bytes_per_second().max(1),
            buffer: Vec::new(),
            window_start_ms: None,
        }
    }

    /// Append a chunk; returns the whole buffer as a window once the target
    /// interval is covered. Pure and non-blocking.
    pub fn feed(&mut self, bytes: &[u8], arrival_ms: u64) -> Option<Window> {
        if self.window_start_ms.is_none() && !bytes.is_empty() {
            self.window_start_ms = Some(arrival_ms);
        }

        self.buffer.extend_from_slice(bytes);

        let buffered_ms = self.buffered_duration_ms();
        if buffered_ms < self.target_ms {
            return None;
        }

        let bytes = std::mem::take(&mut self.buffer);
        let start_ms = self.window_start_ms.take().unwrap_or(arrival_ms);

        trace!(
            "Window ready: {} bytes ({}ms) starting at {}ms",
            bytes.len(),
            buffered_ms,
            start_ms
        );

        Some(Window {
            bytes,
            start_ms,
            duration_ms: buffered_ms,
        })
    }

    /// Audio duration currently buffered, in milliseconds
    pub fn buffered_duration_ms(&self) -> u64 {
        self.buffer.len() as u64 * 1000 / self.bytes_per_second
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Discard any buffered audio and forget the pending window start
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.window_start_ms = None;
    }
}
