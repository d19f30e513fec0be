pub mod session;
pub mod snippet;

pub use session::SessionPipeline;
pub use snippet::SnippetPipeline;

pub(crate) const STATE_IDLE: u8 = 0;
pub(crate) const STATE_RUNNING: u8 = 1;
pub(crate) const STATE_STOPPING: u8 = 2;
