use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::AudioFormat;
use crate::error::Result;

/// Canonical PCM WAV header length
pub const WAV_HEADER_LEN: u64 = 44;

/// Streams PCM bytes to a WAV file without buffering the session in memory.
///
/// The 44-byte header is written up front with zeroed size fields; `finalize`
/// seeks back and patches the RIFF size (bytes 4..8) and the data size
/// (bytes 40..44) once the true byte count is known. Callers own the
/// crash-safety convention: write under a `.partial.wav` name and rename
/// after finalize succeeds.
pub struct WavFileWriter {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    format: AudioFormat,
    data_bytes: u64,
}

impl WavFileWriter {
    /// Create the file (and missing parent directories) and write the
    /// placeholder header.
    pub fn open(path: impl AsRef<Path>, format: &AudioFormat) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer, format, 0, 0)?;

        Ok(Self {
            writer: Some(writer),
            path,
            format: format.clone(),
            data_bytes: 0,
        })
    }

    /// Append PCM bytes to the data chunk
    pub fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.write_all(bytes)?;
            self.data_bytes += bytes.len() as u64;
        }
        Ok(())
    }

    /// PCM bytes written so far (header excluded)
    pub fn bytes_written(&self) -> u64 {
        self.data_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush, patch the header size fields in place, and close the file.
    pub fn finalize(mut self) -> Result<PathBuf> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => return Ok(self.path.clone()),
        };

        let mut file = writer
            .into_inner()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        // RIFF chunks are word-aligned; an odd payload gets a pad byte that
        // is counted by the RIFF size but not the data size
        let pad = self.data_bytes % 2;
        if pad == 1 {
            file.write_all(&[0u8])?;
        }

        let riff_size = (36 + self.data_bytes + pad) as u32;
        file.seek(SeekFrom::Start(4))?;
        file.write_all(&riff_size.to_le_bytes())?;

        file.seek(SeekFrom::Start(40))?;
        file.write_all(&(self.data_bytes as u32).to_le_bytes())?;

        file.sync_all()?;

        Ok(self.path.clone())
    }

    /// Close without finalizing. The caller is expected to delete the file;
    /// until it does, the header still carries placeholder sizes.
    pub fn discard(mut self) {
        self.writer.take();
    }

    /// Format the file was opened with
    pub fn format(&self) -> &AudioFormat {
        &self.format
    }
}

impl Drop for WavFileWriter {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            warn!(
                "WAV writer dropped without finalize, partial file remains: {}",
                self.path.display()
            );
        }
    }
}

fn write_header<W: Write>(
    w: &mut W,
    format: &AudioFormat,
    riff_size: u32,
    data_size: u32,
) -> io::Result<()> {
    let bytes_per_sample = (format.bits_per_sample / 8) as u32;
    let byte_rate = format.sample_rate * format.channels as u32 * bytes_per_sample;
    let block_align = format.channels * (format.bits_per_sample / 8);

    w.write_all(b"RIFF")?;
    w.write_all(&riff_size.to_le_bytes())?;
    w.write_all(b"WAVE")?;

    w.write_all(b"fmt ")?;
    w.write_all(&16u32.to_le_bytes())?; // fmt chunk size
    w.write_all(&1u16.to_le_bytes())?; // PCM
    w.write_all(&format.channels.to_le_bytes())?;
    w.write_all(&format.sample_rate.to_le_bytes())?;
    w.write_all(&byte_rate.to_le_bytes())?;
    w.write_all(&block_align.to_le_bytes())?;
    w.write_all(&format.bits_per_sample.to_le_bytes())?;

    w.write_all(b"data")?;
    w.write_all(&data_size.to_le_bytes())?;

    Ok(())
}

/// Extract the PCM payload from in-memory file bytes.
///
/// A RIFF/WAVE container is walked chunk-by-chunk from offset 12 until the
/// `data` chunk is found — never a fixed 44-byte skip, since writers may put
/// LIST/fact chunks before the payload. Anything without the signature is
/// treated as raw PCM and returned whole. A RIFF file with no `data` chunk
/// yields an empty payload. Truncated data chunks are clamped to the bytes
/// actually present.
pub fn pcm_payload(bytes: &[u8]) -> &[u8] {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return bytes;
    }

    let mut offset = 12usize;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;
        let payload_start = offset + 8;

        if id == b"data" {
            let end = payload_start.saturating_add(size).min(bytes.len());
            return &bytes[payload_start.min(bytes.len())..end];
        }

        // Chunks are word-aligned: odd sizes carry a pad byte
        offset = payload_start.saturating_add(size + (size % 2));
    }

    &[]
}

/// Patch the header size fields of a canonical-header WAV from the actual
/// file length. Used to repair partial files whose writer never finalized.
/// Returns the recovered PCM byte count.
pub fn repair_wav_header(path: &Path) -> Result<u64> {
    let len = fs::metadata(path)?.len();
    if len < WAV_HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "{} is {} bytes, shorter than a WAV header",
                path.display(),
                len
            ),
        )
        .into());
    }

    let mut file = OpenOptions::new().read(true).write(true).open(path)?;

    let mut signature = [0u8; 12];
    file.read_exact(&mut signature)?;
    if &signature[0..4] != b"RIFF" || &signature[8..12] != b"WAVE" {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} does not carry a RIFF/WAVE signature", path.display()),
        )
        .into());
    }

    let data_bytes = len - WAV_HEADER_LEN;

    file.seek(SeekFrom::Start(4))?;
    file.write_all(&((len - 8) as u32).to_le_bytes())?;

    file.seek(SeekFrom::Start(40))?;
    file.write_all(&(data_bytes as u32).to_le_bytes())?;

    file.sync_all()?;

    Ok(data_bytes)
}
