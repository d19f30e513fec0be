pub mod recorder;
pub mod recovery;

pub use recorder::{FinalizedRecording, RecordingSession, SessionRecorder};
pub use recovery::{recover_partial, scan_partial_recordings, RecoveredRecording};
