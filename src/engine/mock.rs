use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::{Result, TranscriberError};

use super::{EngineConfig, RecognitionEngine, Transcription};

enum MockResponse {
    Text(Transcription),
    Silence,
    Fail(String),
}

/// Scripted recognition engine for tests and the demo binary.
///
/// Responses are served from a queue in push order; once the queue is empty
/// the default response (if any) repeats. All state lives behind `Arc`, so a
/// clone kept by the test observes calls made against the clone handed to an
/// engine factory.
#[derive(Clone)]
pub struct MockEngine {
    name: String,
    script: Arc<Mutex<VecDeque<MockResponse>>>,
    default_response: Option<Transcription>,
    fail_initialize: Arc<AtomicBool>,
    fail_transcribe: Arc<AtomicBool>,
    fail_reset: Arc<AtomicBool>,
    fail_shutdown: Arc<AtomicBool>,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    initialized: Arc<AtomicBool>,
    last_config: Arc<Mutex<Option<EngineConfig>>>,
    transcribe_calls: Arc<AtomicUsize>,
    reset_calls: Arc<AtomicUsize>,
    shutdown_calls: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<usize>>>,
}

impl MockEngine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            default_response: None,
            fail_initialize: Arc::new(AtomicBool::new(false)),
            fail_transcribe: Arc::new(AtomicBool::new(false)),
            fail_reset: Arc::new(AtomicBool::new(false)),
            fail_shutdown: Arc::new(AtomicBool::new(false)),
            delay: None,
            gate: None,
            initialized: Arc::new(AtomicBool::new(false)),
            last_config: Arc::new(Mutex::new(None)),
            transcribe_calls: Arc::new(AtomicUsize::new(0)),
            reset_calls: Arc::new(AtomicUsize::new(0)),
            shutdown_calls: Arc::new(AtomicUsize::new(0)),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Response repeated once the scripted queue is exhausted
    pub fn with_response(mut self, text: impl Into<String>, confidence: f32) -> Self {
        self.default_response = Some(Transcription {
            text: text.into(),
            confidence,
        });
        self
    }

    pub fn push_response(&self, text: impl Into<String>, confidence: f32) {
        self.push(MockResponse::Text(Transcription {
            text: text.into(),
            confidence,
        }));
    }

    /// Queue one `Ok(None)` result
    pub fn push_silence(&self) {
        self.push(MockResponse::Silence);
    }

    /// Queue one transcribe error
    pub fn push_failure(&self, message: impl Into<String>) {
        self.push(MockResponse::Fail(message.into()));
    }

    pub fn with_init_failure(self) -> Self {
        self.fail_initialize.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_transcribe_failure(self) -> Self {
        self.fail_transcribe.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_reset_failure(self) -> Self {
        self.fail_reset.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_shutdown_failure(self) -> Self {
        self.fail_shutdown.store(true, Ordering::SeqCst);
        self
    }

    /// Sleep this long inside every transcribe call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Block each transcribe call until the test releases a permit. Lets
    /// tests hold the worker busy to fill queues deterministically.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn transcribe_calls(&self) -> usize {
        self.transcribe_calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) -> usize {
        self.reset_calls.load(Ordering::SeqCst)
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    /// Byte length of each transcribe payload, in call order
    pub fn received_lens(&self) -> Vec<usize> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn total_received_bytes(&self) -> usize {
        self.received_lens().iter().sum()
    }

    pub fn last_sample_rate(&self) -> Option<u32> {
        self.last_config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|config| config.sample_rate)
    }

    fn push(&self, response: MockResponse) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
    }
}

#[async_trait::async_trait]
impl RecognitionEngine for MockEngine {
    async fn initialize(&mut self, config: &EngineConfig) -> Result<()> {
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(TranscriberError::Engine {
                message: format!("{} refused to initialize", self.name),
            });
        }
        *self
            .last_config
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn transcribe(&mut self, pcm: &[u8]) -> Result<Option<Transcription>> {
        self.transcribe_calls.fetch_add(1, Ordering::SeqCst);
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pcm.len());

        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|_| TranscriberError::Engine {
                message: format!("{} gate closed", self.name),
            })?;
            permit.forget();
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_transcribe.load(Ordering::SeqCst) {
            return Err(TranscriberError::Engine {
                message: format!("{} transcription failed", self.name),
            });
        }

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match scripted {
            Some(MockResponse::Text(transcription)) => Ok(Some(transcription)),
            Some(MockResponse::Silence) => Ok(None),
            Some(MockResponse::Fail(message)) => Err(TranscriberError::Engine { message }),
            None => Ok(self.default_response.clone()),
        }
    }

    async fn reset_state(&mut self) -> Result<()> {
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_reset.load(Ordering::SeqCst) {
            return Err(TranscriberError::Engine {
                message: format!("{} reset failed", self.name),
            });
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_shutdown.load(Ordering::SeqCst) {
            return Err(TranscriberError::Engine {
                message: format!("{} shutdown failed", self.name),
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
