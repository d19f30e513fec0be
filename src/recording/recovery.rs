use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::audio::repair_wav_header;
use crate::error::{Result, TranscriberError};

/// A partial recording whose header was repaired and file renamed to `.wav`
#[derive(Debug, Clone)]
pub struct RecoveredRecording {
    pub path: PathBuf,
    pub data_bytes: u64,
    pub duration_ms: u64,
    pub sample_rate: u32,
}

/// List `.partial.wav` files left behind by sessions that never finalized.
/// A missing directory is treated as having nothing to recover.
pub fn scan_partial_recordings(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.to_string_lossy().ends_with(".partial.wav") {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Repair a partial recording in place: patch the header size fields from
/// the actual file length, rename to `.wav`, and validate the result opens
/// as a WAV file.
pub fn recover_partial(path: &Path) -> Result<RecoveredRecording> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = name.strip_suffix(".partial.wav").ok_or_else(|| {
        TranscriberError::Other(format!("Not a partial recording: {}", path.display()))
    })?;

    let data_bytes = repair_wav_header(path)?;

    let final_path = path.with_file_name(format!("{}.wav", stem));
    fs::rename(path, &final_path)?;

    let reader = hound::WavReader::open(&final_path).map_err(|e| {
        TranscriberError::Other(format!(
            "Recovered file {} failed validation: {}",
            final_path.display(),
            e
        ))
    })?;
    let spec = reader.spec();
    let byte_rate =
        spec.sample_rate as u64 * spec.channels as u64 * (spec.bits_per_sample as u64 / 8);
    let duration_ms = data_bytes * 1000 / byte_rate.max(1);

    info!(
        "Recovered partial recording {} ({} bytes, {} ms)",
        final_path.display(),
        data_bytes,
        duration_ms
    );

    Ok(RecoveredRecording {
        path: final_path,
        data_bytes,
        duration_ms,
        sample_rate: spec.sample_rate,
    })
}
