use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::{AudioChunk, AudioSourceKind, ChunkAccumulator};
use crate::config::{AudioFormat, SnippetConfig};
use crate::engine::{EngineConfig, EngineFactory, RecognitionEngine};
use crate::error::{Result, TranscriberError};
use crate::events::{EventSender, Snippet, TranscriberEvent};

use super::{STATE_IDLE, STATE_RUNNING, STATE_STOPPING};

/// Windows waiting for the worker beyond this count push the oldest one out
const QUEUE_CAPACITY: usize = 3;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_POLL: Duration = Duration::from_millis(50);

struct PendingWindow {
    bytes: Vec<u8>,
    source: AudioSourceKind,
    /// Capture timestamp of the first byte in the window
    timestamp_ms: u64,
}

/// Live snippet pipeline: accumulates each source's audio into fixed-duration
/// windows and transcribes them on a single background worker.
///
/// The audio path never blocks on recognition. `process_audio` only appends
/// bytes and, at a window boundary, moves the finished window onto a bounded
/// queue; when the queue is full the oldest window is dropped so a slow
/// engine costs older context, never freshness or capture throughput.
pub struct SnippetPipeline {
    config: SnippetConfig,
    format: AudioFormat,
    factory: Arc<dyn EngineFactory>,
    events: EventSender,
    state: Arc<AtomicU8>,
    accumulators: Mutex<HashMap<AudioSourceKind, ChunkAccumulator>>,
    queue: Arc<Mutex<VecDeque<PendingWindow>>>,
    work_ready: Arc<Notify>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,
    snippet_index: Arc<AtomicU64>,
    snippets_emitted: Arc<AtomicU64>,
    windows_dropped: Arc<AtomicU64>,
    engine_errors: Arc<AtomicU64>,
}

impl SnippetPipeline {
    pub fn new(
        config: SnippetConfig,
        format: AudioFormat,
        factory: Arc<dyn EngineFactory>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            format,
            factory,
            events,
            state: Arc::new(AtomicU8::new(STATE_IDLE)),
            accumulators: Mutex::new(HashMap::new()),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            work_ready: Arc::new(Notify::new()),
            shutdown: Mutex::new(None),
            worker: tokio::sync::Mutex::new(None),
            snippet_index: Arc::new(AtomicU64::new(0)),
            snippets_emitted: Arc::new(AtomicU64::new(0)),
            windows_dropped: Arc::new(AtomicU64::new(0)),
            engine_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create and initialize the engine, then spawn the worker.
    /// Snippet indices restart from zero on every start.
    pub async fn start(&self) -> Result<()> {
        if let Err(current) =
            self.state
                .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            let message = if current == STATE_STOPPING {
                "Snippet pipeline is still stopping".to_string()
            } else {
                "Snippet pipeline is already running".to_string()
            };
            return Err(TranscriberError::InvalidState { message });
        }

        let mut engine = match self.create_engine().await {
            Ok(engine) => engine,
            Err(e) => {
                self.state.store(STATE_IDLE, Ordering::SeqCst);
                return Err(e);
            }
        };

        let engine_config = EngineConfig {
            sample_rate: self.format.sample_rate,
            options: self.config.engine_options.clone(),
        };
        if let Err(e) = engine.initialize(&engine_config).await {
            self.state.store(STATE_IDLE, Ordering::SeqCst);
            return Err(e);
        }

        self.snippet_index.store(0, Ordering::SeqCst);
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.accumulators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(shutdown_tx);

        let ctx = WorkerContext {
            queue: Arc::clone(&self.queue),
            work_ready: Arc::clone(&self.work_ready),
            shutdown_rx,
            events: self.events.clone(),
            engine_id: self.config.engine.clone(),
            confidence_threshold: self.config.confidence_threshold,
            snippet_index: Arc::clone(&self.snippet_index),
            snippets_emitted: Arc::clone(&self.snippets_emitted),
            engine_errors: Arc::clone(&self.engine_errors),
        };
        let handle = tokio::spawn(run_worker(engine, ctx));
        *self.worker.lock().await = Some(handle);

        info!(
            "Snippet pipeline started ({} engine, {}s windows)",
            self.config.engine, self.config.interval_seconds
        );
        Ok(())
    }

    async fn create_engine(&self) -> Result<Box<dyn RecognitionEngine>> {
        self.factory.create(&self.config.engine)
    }

    /// Feed captured audio into the per-source window accumulator.
    ///
    /// Synchronous and non-blocking: at most it moves a finished window onto
    /// the queue and wakes the worker. A quiet no-op unless running.
    pub fn process_audio(&self, chunk: &AudioChunk) {
        if self.state.load(Ordering::SeqCst) != STATE_RUNNING {
            return;
        }

        let window = {
            let mut accumulators = self
                .accumulators
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let accumulator = accumulators.entry(chunk.source).or_insert_with(|| {
                ChunkAccumulator::new(
                    Duration::from_secs(self.config.interval_seconds),
                    &self.format,
                )
            });
            accumulator.feed(&chunk.pcm, chunk.timestamp_ms)
        };

        if let Some(window) = window {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() >= QUEUE_CAPACITY {
                if let Some(dropped) = queue.pop_front() {
                    self.windows_dropped.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        "Snippet queue full, dropping oldest window ({} bytes from {})",
                        dropped.bytes.len(),
                        dropped.source
                    );
                }
            }
            queue.push_back(PendingWindow {
                bytes: window.bytes,
                source: chunk.source,
                timestamp_ms: window.start_ms,
            });
            drop(queue);
            self.work_ready.notify_one();
        }
    }

    /// Stop the worker, giving queued windows up to five seconds to drain.
    /// Windows still queued after the grace period are discarded with a
    /// warning. A no-op when already idle. The pipeline always returns to
    /// idle; an engine shutdown error is reported to the caller after that.
    pub async fn stop(&self) -> Result<()> {
        if let Err(current) = self.state.compare_exchange(
            STATE_RUNNING,
            STATE_STOPPING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            if current == STATE_STOPPING {
                debug!("Snippet pipeline stop already in progress");
            }
            return Ok(());
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            let pending = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len();
            if pending == 0 {
                break;
            }
            if Instant::now() >= deadline {
                let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
                warn!(
                    "Snippet drain timed out, discarding {} unprocessed windows",
                    queue.len()
                );
                queue.clear();
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        if let Some(shutdown_tx) = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = shutdown_tx.send(true);
        }
        self.work_ready.notify_one();

        let mut result = Ok(());
        if let Some(mut handle) = self.worker.lock().await.take() {
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    warn!("Snippet engine shutdown failed: {}", e);
                    result = Err(e);
                }
                Ok(Err(join_err)) => {
                    warn!("Snippet worker ended abnormally: {}", join_err);
                    result = Err(TranscriberError::Other(format!(
                        "Snippet worker ended abnormally: {}",
                        join_err
                    )));
                }
                Err(_) => {
                    warn!("Snippet worker did not stop in time, aborting it");
                    handle.abort();
                    result = Err(TranscriberError::Other(
                        "Snippet worker did not stop in time".to_string(),
                    ));
                }
            }
        }

        self.state.store(STATE_IDLE, Ordering::SeqCst);
        info!(
            "Snippet pipeline stopped ({} snippets emitted, {} windows dropped)",
            self.snippets_emitted.load(Ordering::SeqCst),
            self.windows_dropped.load(Ordering::SeqCst)
        );
        result
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    pub fn snippets_emitted(&self) -> u64 {
        self.snippets_emitted.load(Ordering::SeqCst)
    }

    pub fn windows_dropped(&self) -> u64 {
        self.windows_dropped.load(Ordering::SeqCst)
    }

    pub fn engine_errors(&self) -> u64 {
        self.engine_errors.load(Ordering::SeqCst)
    }
}

struct WorkerContext {
    queue: Arc<Mutex<VecDeque<PendingWindow>>>,
    work_ready: Arc<Notify>,
    shutdown_rx: watch::Receiver<bool>,
    events: EventSender,
    engine_id: String,
    confidence_threshold: f32,
    snippet_index: Arc<AtomicU64>,
    snippets_emitted: Arc<AtomicU64>,
    engine_errors: Arc<AtomicU64>,
}

/// Single sequential worker: pop a window, transcribe, reset engine state,
/// yield, repeat. Engine failures are counted and logged, never fatal; only
/// the final engine shutdown result is handed back through the join handle.
async fn run_worker(mut engine: Box<dyn RecognitionEngine>, mut ctx: WorkerContext) -> Result<()> {
    loop {
        let next = ctx
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match next {
            Some(window) => {
                process_window(engine.as_mut(), &ctx, window).await;
                tokio::task::yield_now().await;
            }
            None => {
                if *ctx.shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ctx.work_ready.notified() => {}
                    _ = ctx.shutdown_rx.changed() => {}
                }
            }
        }
    }

    engine.shutdown().await
}

async fn process_window(
    engine: &mut dyn RecognitionEngine,
    ctx: &WorkerContext,
    window: PendingWindow,
) {
    match engine.transcribe(&window.bytes).await {
        Ok(Some(transcription)) => {
            let text = transcription.text.trim();
            if text.is_empty() {
                debug!("Discarding empty snippet at {} ms", window.timestamp_ms);
            } else if transcription.confidence < ctx.confidence_threshold {
                debug!(
                    "Discarding low-confidence snippet at {} ms ({:.2} < {:.2})",
                    window.timestamp_ms, transcription.confidence, ctx.confidence_threshold
                );
            } else {
                let index = ctx.snippet_index.fetch_add(1, Ordering::SeqCst);
                ctx.snippets_emitted.fetch_add(1, Ordering::SeqCst);
                debug!(
                    "Snippet {} from {} at {} ms ({:.2})",
                    index, window.source, window.timestamp_ms, transcription.confidence
                );
                ctx.events.emit(TranscriberEvent::Snippet(Snippet {
                    text: text.to_string(),
                    source: window.source,
                    confidence: transcription.confidence,
                    timestamp_ms: window.timestamp_ms,
                    snippet_index: index,
                    engine: ctx.engine_id.clone(),
                }));
            }
        }
        Ok(None) => {
            debug!("No speech detected in window at {} ms", window.timestamp_ms);
        }
        Err(e) => {
            ctx.engine_errors.fetch_add(1, Ordering::SeqCst);
            warn!(
                "Snippet transcription failed for window at {} ms: {}",
                window.timestamp_ms, e
            );
        }
    }

    // Each window is transcribed in isolation
    if let Err(e) = engine.reset_state().await {
        ctx.engine_errors.fetch_add(1, Ordering::SeqCst);
        warn!("Engine state reset failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FnEngineFactory, MockEngine};
    use crate::events::TranscriberEvent;

    fn pipeline_with(mock: MockEngine, interval_seconds: u64) -> (SnippetPipeline, EventSender) {
        let events = EventSender::new();
        let config = SnippetConfig {
            enabled: true,
            interval_seconds,
            engine: "mock".to_string(),
            confidence_threshold: 0.4,
            engine_options: Default::default(),
        };
        let factory = Arc::new(FnEngineFactory::new(move |_| {
            Ok(Box::new(mock.clone()) as Box<dyn RecognitionEngine>)
        }));
        let pipeline = SnippetPipeline::new(
            config,
            AudioFormat::default(),
            factory,
            events.clone(),
        );
        (pipeline, events)
    }

    fn chunk(bytes: usize, timestamp_ms: u64) -> AudioChunk {
        AudioChunk {
            pcm: vec![1u8; bytes],
            source: AudioSourceKind::Microphone,
            timestamp_ms,
        }
    }

    #[tokio::test]
    async fn test_window_crossing_emits_snippet() {
        let mock = MockEngine::new("mock").with_response("hello there", 0.9);
        let (pipeline, events) = pipeline_with(mock.clone(), 1);
        let mut rx = events.subscribe();

        pipeline.start().await.unwrap();
        // 1 s of audio at 32000 bytes/s in 100 ms chunks
        for i in 0..10 {
            pipeline.process_audio(&chunk(3200, i * 100));
        }

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("Snippet should arrive")
            .unwrap();
        match event {
            TranscriberEvent::Snippet(snippet) => {
                assert_eq!(snippet.text, "hello there");
                assert_eq!(snippet.snippet_index, 0);
                assert_eq!(snippet.timestamp_ms, 0);
                assert_eq!(snippet.source, AudioSourceKind::Microphone);
                assert_eq!(snippet.engine, "mock");
            }
            other => panic!("Expected a snippet, got {:?}", other),
        }

        pipeline.stop().await.unwrap();
        assert_eq!(pipeline.snippets_emitted(), 1);
        assert_eq!(mock.reset_calls(), 1, "Engine state resets after the window");
    }

    #[tokio::test]
    async fn test_double_start_is_invalid() {
        let mock = MockEngine::new("mock");
        let (pipeline, _events) = pipeline_with(mock, 1);

        pipeline.start().await.unwrap();
        assert!(matches!(
            pipeline.start().await,
            Err(TranscriberError::InvalidState { .. })
        ));
        pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_failure_reverts_to_idle() {
        let mock = MockEngine::new("mock").with_init_failure();
        let (pipeline, _events) = pipeline_with(mock, 1);

        assert!(pipeline.start().await.is_err());
        assert!(!pipeline.is_running());

        // A corrected engine can start afterwards
        let mock = MockEngine::new("mock");
        let (pipeline, _events) = pipeline_with(mock, 1);
        pipeline.start().await.unwrap();
        pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_low_confidence_snippet_is_discarded() {
        let mock = MockEngine::new("mock").with_response("mumble", 0.2);
        let (pipeline, events) = pipeline_with(mock.clone(), 1);
        let mut rx = events.subscribe();

        pipeline.start().await.unwrap();
        for i in 0..10 {
            pipeline.process_audio(&chunk(3200, i * 100));
        }

        // Wait for the worker to consume the window, then confirm silence
        tokio::time::timeout(Duration::from_secs(2), async {
            while mock.transcribe_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        pipeline.stop().await.unwrap();

        assert_eq!(pipeline.snippets_emitted(), 0);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err(),
            "No event should be emitted for a low-confidence result"
        );
    }

    #[tokio::test]
    async fn test_engine_error_is_counted_not_fatal() {
        let mock = MockEngine::new("mock").with_response("recovered", 0.9);
        mock.push_failure("first window fails");
        let (pipeline, events) = pipeline_with(mock, 1);
        let mut rx = events.subscribe();

        pipeline.start().await.unwrap();
        // Two full windows
        for i in 0..20 {
            pipeline.process_audio(&chunk(3200, i * 100));
        }

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("Second window should still produce a snippet")
            .unwrap();
        match event {
            TranscriberEvent::Snippet(snippet) => assert_eq!(snippet.text, "recovered"),
            other => panic!("Expected a snippet, got {:?}", other),
        }

        pipeline.stop().await.unwrap();
        assert_eq!(pipeline.engine_errors(), 1);
        assert_eq!(pipeline.snippets_emitted(), 1);
    }

    #[tokio::test]
    async fn test_process_audio_before_start_is_noop() {
        let mock = MockEngine::new("mock");
        let (pipeline, _events) = pipeline_with(mock.clone(), 1);

        for i in 0..20 {
            pipeline.process_audio(&chunk(3200, i * 100));
        }
        assert_eq!(mock.transcribe_calls(), 0);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let mock = MockEngine::new("mock");
        let (pipeline, _events) = pipeline_with(mock, 1);
        pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_engine_shutdown_failure_surfaces_from_stop() {
        let mock = MockEngine::new("mock").with_shutdown_failure();
        let (pipeline, _events) = pipeline_with(mock.clone(), 1);

        pipeline.start().await.unwrap();
        let err = pipeline
            .stop()
            .await
            .expect_err("Engine shutdown failure should surface");
        assert!(err.to_string().contains("shutdown failed"));
        assert!(!pipeline.is_running(), "Pipeline still returns to idle");
        assert_eq!(mock.shutdown_calls(), 1);
    }
}
