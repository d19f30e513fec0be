use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use echoscribe::recording::{recover_partial, scan_partial_recordings};
use echoscribe::{
    AudioSourceFactory, AudioSourceKind, EngineFactory, FnEngineFactory, MockEngine,
    RecognitionEngine, ScriptedAudioSource, ScriptedSourceFactory, Transcriber, TranscriberConfig,
    TranscriberEvent,
};

/// Run a scripted capture session through the full transcription stack
#[derive(Parser, Debug)]
#[command(name = "echoscribe", version, about)]
struct Args {
    /// Configuration file (demo defaults when omitted)
    #[arg(short, long)]
    config: Option<String>,

    /// Seconds of audio to run through the pipelines
    #[arg(short, long, default_value_t = 5)]
    seconds: u64,

    /// Keep the session WAV file instead of cleaning it up on stop
    #[arg(long)]
    keep_recording: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => TranscriberConfig::load(path)?,
        None => demo_config(&args),
    };

    info!("echoscribe v{}", env!("CARGO_PKG_VERSION"));

    // Pick up partial recordings a previous run left behind
    for partial in scan_partial_recordings(&config.recording.output_dir)? {
        match recover_partial(&partial) {
            Ok(recovered) => info!(
                "Recovered {} ({} ms of audio)",
                recovered.path.display(),
                recovered.duration_ms
            ),
            Err(e) => warn!("Could not recover {}: {}", partial.display(), e),
        }
    }

    let sources = Arc::new(ScriptedSourceFactory::new());
    // Feed a tone that outlasts the run so the stream never ends mid-session
    sources.push_source(
        ScriptedAudioSource::tone(
            AudioSourceKind::Microphone,
            &config.audio,
            Duration::from_secs(args.seconds + 5),
            100,
        )
        .paced(true),
    );

    for device in sources.enumerate_devices()? {
        info!("Audio device: {} ({})", device.name, device.id);
    }

    let engines: Arc<dyn EngineFactory> = Arc::new(FnEngineFactory::new(|engine_id| {
        Ok(Box::new(
            MockEngine::new(engine_id)
                .with_response("the quick brown fox jumps over the lazy dog", 0.93),
        ) as Box<dyn RecognitionEngine>)
    }));

    let transcriber = Transcriber::new(config, sources, engines);

    let mut rx = transcriber.subscribe();
    let logger = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                TranscriberEvent::Snippet(snippet) => info!(
                    "[snippet {}] {} ({:.2})",
                    snippet.snippet_index, snippet.text, snippet.confidence
                ),
                TranscriberEvent::SessionTranscript(transcript) => info!(
                    "[session {}] {} ({} words)",
                    transcript.session_id, transcript.text, transcript.metadata.word_count
                ),
                TranscriberEvent::RecordingProgress(progress) => {
                    info!("[recording] {} ms captured", progress.duration_ms)
                }
                TranscriberEvent::Error(error) => warn!(
                    "[error] {}{}",
                    error
                        .step
                        .as_deref()
                        .map(|step| format!("{}: ", step))
                        .unwrap_or_default(),
                    error.message
                ),
                TranscriberEvent::Stopped(summary) => {
                    if summary.failures.is_empty() {
                        info!("[stopped] clean shutdown");
                    } else {
                        warn!("[stopped] {} teardown step(s) failed", summary.failures.len());
                    }
                    break;
                }
                other => info!("[event] {:?}", other),
            }
        }
    });

    transcriber.start().await?;
    tokio::time::sleep(Duration::from_secs(args.seconds)).await;
    transcriber.stop().await?;
    let _ = logger.await;

    let metrics = transcriber.metrics();
    info!(
        "Processed {} chunk(s), recorded {} bytes, emitted {} snippet(s)",
        metrics.chunks_received, metrics.bytes_recorded, metrics.snippets_emitted
    );

    Ok(())
}

fn demo_config(args: &Args) -> TranscriberConfig {
    let mut config = TranscriberConfig::default();
    config.snippets.engine = "mock".to_string();
    config.snippets.interval_seconds = 2;
    config.session_transcript.enabled = true;
    config.session_transcript.engine = "mock".to_string();
    config.recording.enabled = true;
    config.recording.output_dir = std::env::temp_dir().join("echoscribe-demo");
    config.recording.auto_cleanup = !args.keep_recording;
    config
}
