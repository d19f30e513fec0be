use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::audio::{AudioChunk, AudioSource, AudioSourceFactory, AudioSourceKind};
use crate::config::{AudioFormat, TranscriberConfig};
use crate::engine::EngineFactory;
use crate::error::{Result, TranscriberError};
use crate::events::{
    ErrorNotification, EventSender, MetricsSnapshot, StepFailure, StopSummary, TranscriberEvent,
};
use crate::pipeline::{SessionPipeline, SnippetPipeline};
use crate::recording::SessionRecorder;

const STATE_IDLE: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_STOPPING: u8 = 3;

/// How long `start` waits for an in-flight stop to finish
const START_WAIT: Duration = Duration::from_secs(5);
/// How long a second `stop` call waits for the first one to finish
const STOP_COLLAPSE_WAIT: Duration = Duration::from_secs(10);
const STATE_POLL: Duration = Duration::from_millis(50);
/// Grace period for capture tasks to exit before they are aborted
const CAPTURE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Delay before reopening an audio source whose stream ended mid-session
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);
/// Restarts closer together than this count as consecutive failures
const RESTART_RESET_WINDOW: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_RESTARTS: u32 = 3;

/// Orchestrates capture, recording, and both transcription pipelines.
///
/// One `Transcriber` owns the whole lifecycle: `start` validates config and
/// brings components up in dependency order with rollback, capture tasks fan
/// each chunk out to the recorder and snippet pipeline, and `stop` tears
/// everything down with the archival artifacts (final recording file and
/// session transcript) secured before anything else. Every teardown step has
/// its own error boundary; a `Stopped` event is always emitted.
pub struct Transcriber {
    config: TranscriberConfig,
    audio_factory: Arc<dyn AudioSourceFactory>,
    events: EventSender,
    recorder: Option<Arc<SessionRecorder>>,
    snippets: Option<Arc<SnippetPipeline>>,
    session: Option<Arc<SessionPipeline>>,
    state: Arc<AtomicU8>,
    running: Arc<AtomicBool>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    capture_tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    chunks_received: Arc<AtomicU64>,
    write_errors: Arc<AtomicU64>,
    capture_restarts: Arc<AtomicU64>,
    step_failures: Arc<AtomicU64>,
    fatal_errors: Arc<AtomicU64>,
}

impl Transcriber {
    pub fn new(
        config: TranscriberConfig,
        audio_factory: Arc<dyn AudioSourceFactory>,
        engine_factory: Arc<dyn EngineFactory>,
    ) -> Self {
        let events = EventSender::new();

        let recorder = config.recording.enabled.then(|| {
            Arc::new(SessionRecorder::new(
                config.recording.clone(),
                config.audio.clone(),
                events.clone(),
            ))
        });
        let snippets = config.snippets.enabled.then(|| {
            Arc::new(SnippetPipeline::new(
                config.snippets.clone(),
                config.audio.clone(),
                Arc::clone(&engine_factory),
                events.clone(),
            ))
        });
        let session = config.session_transcript.enabled.then(|| {
            Arc::new(SessionPipeline::new(
                config.session_transcript.clone(),
                config.audio.clone(),
                Arc::clone(&engine_factory),
                events.clone(),
            ))
        });

        Self {
            config,
            audio_factory,
            events,
            recorder,
            snippets,
            session,
            state: Arc::new(AtomicU8::new(STATE_IDLE)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Mutex::new(None),
            capture_tasks: tokio::sync::Mutex::new(Vec::new()),
            chunks_received: Arc::new(AtomicU64::new(0)),
            write_errors: Arc::new(AtomicU64::new(0)),
            capture_restarts: Arc::new(AtomicU64::new(0)),
            step_failures: Arc::new(AtomicU64::new(0)),
            fatal_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriberEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Validate configuration and bring everything up: recorder, snippet
    /// pipeline, session pipeline, then the audio sources. Any failure rolls
    /// back what already started and leaves the transcriber idle. Emits
    /// `Started` on success.
    pub async fn start(&self) -> Result<()> {
        let deadline = Instant::now() + START_WAIT;
        loop {
            match self.state.compare_exchange(
                STATE_IDLE,
                STATE_STARTING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(STATE_STOPPING) => {
                    if Instant::now() >= deadline {
                        return Err(TranscriberError::InvalidState {
                            message: "A previous stop is still in progress".to_string(),
                        });
                    }
                    tokio::time::sleep(STATE_POLL).await;
                }
                Err(_) => {
                    return Err(TranscriberError::InvalidState {
                        message: "Transcriber is already running".to_string(),
                    })
                }
            }
        }

        if let Err(e) = self.config.validate() {
            self.state.store(STATE_IDLE, Ordering::SeqCst);
            return Err(e);
        }

        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.start() {
                return self.fail_start(Vec::new(), e).await;
            }
        }

        if let Some(snippets) = &self.snippets {
            if let Err(e) = snippets.start().await {
                return self.fail_start(Vec::new(), e).await;
            }
        }

        if let Some(session) = &self.session {
            if let Err(e) = session.start().await {
                return self.fail_start(Vec::new(), e).await;
            }
        }

        let mut requested = Vec::new();
        if self.config.enable_microphone {
            requested.push((
                AudioSourceKind::Microphone,
                self.config.microphone_device_id.clone(),
            ));
        }
        if self.config.enable_system_audio {
            requested.push((AudioSourceKind::SystemAudio, None));
        }

        let mut started: Vec<(Box<dyn AudioSource>, mpsc::Receiver<AudioChunk>)> = Vec::new();
        for (kind, device_id) in &requested {
            let mut source =
                match self
                    .audio_factory
                    .create(*kind, device_id.as_deref(), &self.config.audio)
                {
                    Ok(source) => source,
                    Err(e) => return self.fail_start(started, e).await,
                };
            match source.start().await {
                Ok(rx) => started.push((source, rx)),
                Err(e) => return self.fail_start(started, e).await,
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(shutdown_tx);

        // Open the chunk gate before the first capture task can deliver
        self.running.store(true, Ordering::SeqCst);

        let mut tasks = self.capture_tasks.lock().await;
        for ((source, rx), (kind, device_id)) in started.into_iter().zip(requested) {
            let ctx = CaptureContext {
                kind,
                device_id,
                audio_factory: Arc::clone(&self.audio_factory),
                format: self.config.audio.clone(),
                recorder: self.recorder.clone(),
                snippets: self.snippets.clone(),
                events: self.events.clone(),
                running: Arc::clone(&self.running),
                shutdown_rx: shutdown_rx.clone(),
                chunks_received: Arc::clone(&self.chunks_received),
                write_errors: Arc::clone(&self.write_errors),
                capture_restarts: Arc::clone(&self.capture_restarts),
            };
            tasks.push(tokio::spawn(run_capture(source, rx, ctx)));
        }
        let source_count = tasks.len();
        drop(tasks);

        self.state.store(STATE_RUNNING, Ordering::SeqCst);
        self.events.emit(TranscriberEvent::Started);
        info!("Transcriber started with {} audio source(s)", source_count);

        Ok(())
    }

    async fn fail_start(
        &self,
        mut started: Vec<(Box<dyn AudioSource>, mpsc::Receiver<AudioChunk>)>,
        error: TranscriberError,
    ) -> Result<()> {
        warn!("Start failed, rolling back: {}", error);
        for (mut source, _rx) in started.drain(..) {
            if let Err(e) = source.stop().await {
                warn!("Failed to stop audio source {} during rollback: {}", source.name(), e);
            }
        }
        self.rollback_components().await;
        self.state.store(STATE_IDLE, Ordering::SeqCst);
        Err(error)
    }

    async fn rollback_components(&self) {
        if let Some(session) = &self.session {
            if session.is_running() {
                if let Err(e) = session.stop().await {
                    warn!("Failed to stop session pipeline during rollback: {}", e);
                }
            }
        }
        if let Some(snippets) = &self.snippets {
            if snippets.is_running() {
                if let Err(e) = snippets.stop().await {
                    warn!("Failed to stop snippet pipeline during rollback: {}", e);
                }
            }
        }
        if let Some(recorder) = &self.recorder {
            if recorder.has_session() {
                recorder.abort();
            }
        }
    }

    /// Tear everything down. A no-op when idle; a concurrent call waits for
    /// the stop already in flight instead of running teardown twice. The
    /// `Stopped` event is always emitted on a completed stop, preceded by a
    /// final `Metrics` snapshot; only a panic escaping teardown is fatal.
    pub async fn stop(&self) -> Result<()> {
        loop {
            match self.state.compare_exchange(
                STATE_RUNNING,
                STATE_STOPPING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(STATE_IDLE) => {
                    debug!("Stop requested while idle");
                    return Ok(());
                }
                Err(STATE_STOPPING) => return self.await_concurrent_stop().await,
                Err(_) => {
                    // A start is mid-flight; let it finish, then stop it
                    tokio::time::sleep(STATE_POLL).await;
                }
            }
        }

        let _guard = StopGuard { state: &self.state };
        self.running.store(false, Ordering::SeqCst);
        info!("Stopping transcriber");

        match AssertUnwindSafe(self.run_teardown()).catch_unwind().await {
            Ok(failures) => {
                if failures.is_empty() {
                    info!("Transcriber stopped cleanly");
                } else {
                    self.step_failures
                        .fetch_add(failures.len() as u64, Ordering::SeqCst);
                    warn!(
                        "Transcriber stopped with {} failed teardown step(s)",
                        failures.len()
                    );
                }
                self.events.emit(TranscriberEvent::Metrics(self.metrics()));
                self.events
                    .emit(TranscriberEvent::Stopped(StopSummary { failures }));
                Ok(())
            }
            Err(panic) => {
                self.fatal_errors.fetch_add(1, Ordering::SeqCst);
                let message = panic_message(panic);
                error!("Teardown panicked: {}", message);
                self.events.emit(TranscriberEvent::Error(ErrorNotification {
                    step: Some("stop".to_string()),
                    message: message.clone(),
                }));
                Err(TranscriberError::Other(format!(
                    "Teardown panicked: {}",
                    message
                )))
            }
        }
    }

    async fn await_concurrent_stop(&self) -> Result<()> {
        debug!("Stop already in progress, waiting for it to finish");
        let deadline = Instant::now() + STOP_COLLAPSE_WAIT;
        while self.state.load(Ordering::SeqCst) == STATE_STOPPING {
            if Instant::now() >= deadline {
                // The in-flight stop owns the outcome
                warn!(
                    "Stop still in progress after {:?}, returning without waiting further",
                    STOP_COLLAPSE_WAIT
                );
                return Ok(());
            }
            tokio::time::sleep(STATE_POLL).await;
        }
        Ok(())
    }

    /// The teardown sequence. The archival artifacts come first: finalize
    /// the recording file, then produce the session transcript from it.
    /// Every remaining step runs regardless of earlier failures.
    async fn run_teardown(&self) -> Vec<StepFailure> {
        let mut failures = Vec::new();

        let mut finalized = None;
        if let Some(recorder) = &self.recorder {
            if recorder.has_session() {
                match recorder.stop() {
                    Ok(recording) => finalized = Some(recording),
                    Err(e) => self.record_failure(&mut failures, "finalize-recording", &e),
                }
            }
        }

        if let (Some(session), Some(recording)) = (&self.session, &finalized) {
            if let Err(e) = session
                .process_final_session(recording, self.primary_source())
                .await
            {
                self.record_failure(&mut failures, "session-transcript", &e);
            }
        }

        if let Some(shutdown_tx) = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = shutdown_tx.send(true);
        }

        let handles = std::mem::take(&mut *self.capture_tasks.lock().await);
        for mut handle in handles {
            match tokio::time::timeout(CAPTURE_JOIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => self.record_failure(
                    &mut failures,
                    "stop-audio",
                    &TranscriberError::Other(format!("Capture task failed: {}", join_err)),
                ),
                Err(_) => {
                    handle.abort();
                    self.record_failure(
                        &mut failures,
                        "stop-audio",
                        &TranscriberError::Other("Capture task did not stop in time".to_string()),
                    );
                }
            }
        }

        if let Some(snippets) = &self.snippets {
            if let Err(e) = snippets.stop().await {
                self.record_failure(&mut failures, "stop-snippet-pipeline", &e);
            }
        }

        if let Some(session) = &self.session {
            if let Err(e) = session.stop().await {
                self.record_failure(&mut failures, "stop-session-pipeline", &e);
            }
        }

        if self.config.recording.auto_cleanup {
            if let Some(recording) = &finalized {
                match std::fs::remove_file(&recording.path) {
                    Ok(()) => info!("Cleaned up recording {}", recording.path.display()),
                    Err(e) => self.record_failure(
                        &mut failures,
                        "cleanup-recording",
                        &TranscriberError::Io(e),
                    ),
                }
            }
        }

        failures
    }

    fn record_failure(
        &self,
        failures: &mut Vec<StepFailure>,
        step: &str,
        error: &TranscriberError,
    ) {
        error!("Teardown step {} failed: {}", step, error);
        failures.push(StepFailure {
            step: step.to_string(),
            message: error.to_string(),
        });
        self.events.emit(TranscriberEvent::Error(ErrorNotification {
            step: Some(step.to_string()),
            message: error.to_string(),
        }));
    }

    fn primary_source(&self) -> AudioSourceKind {
        if self.config.enable_microphone {
            AudioSourceKind::Microphone
        } else {
            AudioSourceKind::SystemAudio
        }
    }

    /// Snapshot of the counters across all components
    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_received: self.chunks_received.load(Ordering::SeqCst),
            bytes_recorded: self
                .recorder
                .as_ref()
                .map_or(0, |recorder| recorder.bytes_recorded()),
            snippets_emitted: self
                .snippets
                .as_ref()
                .map_or(0, |snippets| snippets.snippets_emitted()),
            windows_dropped: self
                .snippets
                .as_ref()
                .map_or(0, |snippets| snippets.windows_dropped()),
            engine_errors: self
                .snippets
                .as_ref()
                .map_or(0, |snippets| snippets.engine_errors()),
            write_errors: self.write_errors.load(Ordering::SeqCst),
            capture_restarts: self.capture_restarts.load(Ordering::SeqCst),
            step_failures: self.step_failures.load(Ordering::SeqCst),
            fatal_errors: self.fatal_errors.load(Ordering::SeqCst),
        }
    }
}

/// Restores the idle state when `stop` returns by any path
struct StopGuard<'a> {
    state: &'a AtomicU8,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.state.store(STATE_IDLE, Ordering::SeqCst);
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct CaptureContext {
    kind: AudioSourceKind,
    device_id: Option<String>,
    audio_factory: Arc<dyn AudioSourceFactory>,
    format: AudioFormat,
    recorder: Option<Arc<SessionRecorder>>,
    snippets: Option<Arc<SnippetPipeline>>,
    events: EventSender,
    running: Arc<AtomicBool>,
    shutdown_rx: watch::Receiver<bool>,
    chunks_received: Arc<AtomicU64>,
    write_errors: Arc<AtomicU64>,
    capture_restarts: Arc<AtomicU64>,
}

/// Per-source capture loop: fan each chunk out, restart the source with a
/// delay if its stream ends while the transcriber is still running, and give
/// up after repeated rapid failures.
async fn run_capture(
    mut source: Box<dyn AudioSource>,
    mut rx: mpsc::Receiver<AudioChunk>,
    mut ctx: CaptureContext,
) {
    let mut consecutive_restarts = 0u32;
    let mut last_restart: Option<Instant> = None;

    loop {
        tokio::select! {
            changed = ctx.shutdown_rx.changed() => {
                if changed.is_err() || *ctx.shutdown_rx.borrow() {
                    break;
                }
            }
            chunk = rx.recv() => {
                match chunk {
                    Some(chunk) => deliver_chunk(&ctx, &chunk),
                    None => {
                        if !ctx.running.load(Ordering::SeqCst) {
                            break;
                        }

                        let now = Instant::now();
                        consecutive_restarts = match last_restart {
                            Some(prev) if now.duration_since(prev) < RESTART_RESET_WINDOW => {
                                consecutive_restarts + 1
                            }
                            _ => 1,
                        };
                        last_restart = Some(now);
                        ctx.capture_restarts.fetch_add(1, Ordering::SeqCst);

                        if consecutive_restarts > MAX_CONSECUTIVE_RESTARTS {
                            let message = format!(
                                "Audio source {} keeps failing, giving up after {} rapid restarts",
                                ctx.kind, MAX_CONSECUTIVE_RESTARTS
                            );
                            error!("{}", message);
                            ctx.events.emit(TranscriberEvent::Error(ErrorNotification {
                                step: Some("audio-capture".to_string()),
                                message,
                            }));
                            break;
                        }

                        warn!(
                            "Audio stream from {} ended while running, reopening in {:?}",
                            ctx.kind, RESUBSCRIBE_DELAY
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                            changed = ctx.shutdown_rx.changed() => {
                                if changed.is_err() || *ctx.shutdown_rx.borrow() {
                                    break;
                                }
                            }
                        }
                        if !ctx.running.load(Ordering::SeqCst) {
                            break;
                        }

                        match reopen_source(&ctx, source).await {
                            Ok((new_source, new_rx)) => {
                                source = new_source;
                                rx = new_rx;
                                info!("Audio source {} reopened", ctx.kind);
                            }
                            Err((old_source, e)) => {
                                source = old_source;
                                warn!("Failed to reopen audio source {}: {}", ctx.kind, e);
                                // rx stays closed, so the next recv retries
                            }
                        }
                    }
                }
            }
        }
    }

    if let Err(e) = source.stop().await {
        warn!("Failed to stop audio source {}: {}", ctx.kind, e);
    }
    debug!("Capture task for {} exited", ctx.kind);
}

/// Write to the recorder first, then hand the chunk to the snippet pipeline.
/// Neither consumer is allowed to fail the capture path. Chunks arriving
/// after stop has dropped the running flag are discarded, so teardown never
/// sees new audio. The chunk counter moves last so a chunk is only counted
/// once both consumers have seen it.
fn deliver_chunk(ctx: &CaptureContext, chunk: &AudioChunk) {
    if !ctx.running.load(Ordering::SeqCst) {
        return;
    }

    if let Some(recorder) = &ctx.recorder {
        if let Err(e) = recorder.write_chunk(&chunk.pcm) {
            ctx.write_errors.fetch_add(1, Ordering::SeqCst);
            warn!(
                "Failed to write {} bytes from {} to the recording: {}",
                chunk.pcm.len(),
                chunk.source,
                e
            );
        }
    }

    if let Some(snippets) = &ctx.snippets {
        snippets.process_audio(chunk);
    }

    ctx.chunks_received.fetch_add(1, Ordering::SeqCst);
}

async fn reopen_source(
    ctx: &CaptureContext,
    mut old_source: Box<dyn AudioSource>,
) -> std::result::Result<
    (Box<dyn AudioSource>, mpsc::Receiver<AudioChunk>),
    (Box<dyn AudioSource>, TranscriberError),
> {
    if let Err(e) = old_source.stop().await {
        warn!("Failed to stop exhausted source {}: {}", ctx.kind, e);
    }

    let mut new_source =
        match ctx
            .audio_factory
            .create(ctx.kind, ctx.device_id.as_deref(), &ctx.format)
        {
            Ok(source) => source,
            Err(e) => return Err((old_source, e)),
        };

    match new_source.start().await {
        Ok(rx) => Ok((new_source, rx)),
        Err(e) => Err((old_source, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{ScriptedAudioSource, ScriptedSourceFactory};
    use crate::config::{RecordingConfig, SessionTranscriptConfig, SnippetConfig};
    use crate::engine::{FnEngineFactory, MockEngine, RecognitionEngine};

    fn capture_only_config() -> TranscriberConfig {
        TranscriberConfig {
            enable_microphone: true,
            enable_system_audio: false,
            microphone_device_id: None,
            audio: AudioFormat::default(),
            snippets: SnippetConfig {
                enabled: true,
                interval_seconds: 15,
                engine: "mock".to_string(),
                confidence_threshold: 0.4,
                engine_options: Default::default(),
            },
            session_transcript: SessionTranscriptConfig {
                enabled: false,
                ..Default::default()
            },
            recording: RecordingConfig {
                enabled: false,
                ..Default::default()
            },
        }
    }

    fn mock_factory(mock: MockEngine) -> Arc<dyn EngineFactory> {
        Arc::new(FnEngineFactory::new(move |_| {
            Ok(Box::new(mock.clone()) as Box<dyn RecognitionEngine>)
        }))
    }

    fn scripted_mic(factory: &ScriptedSourceFactory, bytes: usize) {
        factory.push_source(ScriptedAudioSource::from_pcm(
            AudioSourceKind::Microphone,
            &AudioFormat::default(),
            vec![1u8; bytes],
            100,
        ));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let sources = Arc::new(ScriptedSourceFactory::new());
        scripted_mic(&sources, 32000);
        let transcriber = Transcriber::new(
            capture_only_config(),
            sources,
            mock_factory(MockEngine::new("mock")),
        );
        let mut rx = transcriber.subscribe();

        transcriber.start().await.unwrap();
        assert!(transcriber.is_running());
        assert!(matches!(
            rx.recv().await.unwrap(),
            TranscriberEvent::Started
        ));

        // Let the scripted audio drain through the fan-out
        tokio::time::sleep(Duration::from_millis(100)).await;

        transcriber.stop().await.unwrap();
        assert!(!transcriber.is_running());

        let mut saw_stopped = false;
        while let Ok(event) = rx.try_recv() {
            if let TranscriberEvent::Stopped(summary) = event {
                assert!(summary.failures.is_empty());
                saw_stopped = true;
            }
        }
        assert!(saw_stopped, "Stopped event should be emitted");
        assert!(transcriber.metrics().chunks_received > 0);
    }

    #[tokio::test]
    async fn test_double_start_is_invalid() {
        let sources = Arc::new(ScriptedSourceFactory::new());
        scripted_mic(&sources, 32000);
        scripted_mic(&sources, 32000);
        let transcriber = Transcriber::new(
            capture_only_config(),
            sources,
            mock_factory(MockEngine::new("mock")),
        );

        transcriber.start().await.unwrap();
        assert!(matches!(
            transcriber.start().await,
            Err(TranscriberError::InvalidState { .. })
        ));
        transcriber.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let sources = Arc::new(ScriptedSourceFactory::new());
        let transcriber = Transcriber::new(
            capture_only_config(),
            sources,
            mock_factory(MockEngine::new("mock")),
        );
        transcriber.stop().await.unwrap();
        transcriber.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_fails_start() {
        let sources = Arc::new(ScriptedSourceFactory::new());
        let mut config = capture_only_config();
        config.snippets.enabled = false;
        let transcriber =
            Transcriber::new(config, sources, mock_factory(MockEngine::new("mock")));

        assert!(matches!(
            transcriber.start().await,
            Err(TranscriberError::InvalidConfiguration { .. })
        ));
        assert!(!transcriber.is_running());
    }

    #[tokio::test]
    async fn test_missing_source_rolls_back_start() {
        // Factory has nothing registered, so source creation fails
        let sources = Arc::new(ScriptedSourceFactory::new());
        let transcriber = Transcriber::new(
            capture_only_config(),
            Arc::clone(&sources) as Arc<dyn AudioSourceFactory>,
            mock_factory(MockEngine::new("mock")),
        );

        assert!(matches!(
            transcriber.start().await,
            Err(TranscriberError::DeviceNotFound { .. })
        ));
        assert!(!transcriber.is_running());

        // A later start with a source available succeeds
        scripted_mic(&sources, 32000);
        transcriber.start().await.unwrap();
        transcriber.stop().await.unwrap();
    }
}
