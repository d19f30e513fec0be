pub mod mock;

pub use mock::MockEngine;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Engine tuning knobs carried through from configuration.
///
/// Known fields are typed; anything else lands in `extra` and is passed to
/// the engine untouched, so engine-specific options never require a config
/// schema change here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Everything an engine needs to know before it sees audio
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sample rate of the PCM the engine will receive
    pub sample_rate: u32,
    pub options: EngineOptions,
}

/// One recognition result
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
    /// Engine confidence in the 0.0..=1.0 range
    pub confidence: f32,
}

/// Speech recognition engine boundary.
///
/// Implementations receive raw little-endian 16-bit PCM and return text.
/// `transcribe` returning `Ok(None)` means the engine heard nothing worth
/// reporting; that is not an error. `reset_state` clears any internal
/// context so the next call starts from a clean slate.
#[async_trait::async_trait]
pub trait RecognitionEngine: Send {
    async fn initialize(&mut self, config: &EngineConfig) -> Result<()>;

    async fn transcribe(&mut self, pcm: &[u8]) -> Result<Option<Transcription>>;

    async fn reset_state(&mut self) -> Result<()>;

    async fn shutdown(&mut self) -> Result<()>;

    fn name(&self) -> &str;
}

/// Resolves engine identifiers from configuration into engine instances
pub trait EngineFactory: Send + Sync {
    fn create(&self, engine_id: &str) -> Result<Box<dyn RecognitionEngine>>;
}

/// Factory backed by a closure, for wiring engines up in binaries and tests
pub struct FnEngineFactory<F>
where
    F: Fn(&str) -> Result<Box<dyn RecognitionEngine>> + Send + Sync,
{
    create_fn: F,
}

impl<F> FnEngineFactory<F>
where
    F: Fn(&str) -> Result<Box<dyn RecognitionEngine>> + Send + Sync,
{
    pub fn new(create_fn: F) -> Self {
        Self { create_fn }
    }
}

impl<F> EngineFactory for FnEngineFactory<F>
where
    F: Fn(&str) -> Result<Box<dyn RecognitionEngine>> + Send + Sync,
{
    fn create(&self, engine_id: &str) -> Result<Box<dyn RecognitionEngine>> {
        (self.create_fn)(engine_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TranscriberError;

    #[test]
    fn test_engine_options_deserialize_with_extras() {
        let json = r#"{
            "model_path": "/models/base.bin",
            "language": "en",
            "beam_size": 5,
            "translate": false
        }"#;

        let options: EngineOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.model_path.as_deref(), Some(std::path::Path::new("/models/base.bin")));
        assert_eq!(options.language.as_deref(), Some("en"));
        assert_eq!(options.extra.get("beam_size"), Some(&serde_json::json!(5)));
        assert_eq!(options.extra.get("translate"), Some(&serde_json::json!(false)));
    }

    #[test]
    fn test_engine_options_default_is_empty() {
        let options = EngineOptions::default();
        assert!(options.model_path.is_none());
        assert!(options.language.is_none());
        assert!(options.extra.is_empty());
    }

    #[tokio::test]
    async fn test_fn_factory_resolves_by_id() {
        let factory = FnEngineFactory::new(|engine_id| match engine_id {
            "mock" => Ok(Box::new(MockEngine::new("mock")) as Box<dyn RecognitionEngine>),
            other => Err(TranscriberError::InvalidConfiguration {
                message: format!("Unknown engine: {}", other),
            }),
        });

        let engine = factory.create("mock").unwrap();
        assert_eq!(engine.name(), "mock");
        assert!(factory.create("whisper-large").is_err());
    }
}
