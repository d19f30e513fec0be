pub mod accumulator;
pub mod scripted;
pub mod source;
pub mod wav;

pub use accumulator::{ChunkAccumulator, Window};
pub use scripted::{ScriptedAudioSource, ScriptedSourceFactory};
pub use source::{AudioChunk, AudioDevice, AudioSource, AudioSourceFactory, AudioSourceKind};
pub use wav::{pcm_payload, repair_wav_header, WavFileWriter, WAV_HEADER_LEN};
