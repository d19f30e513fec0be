// Integration tests for the full transcriber
//
// These tests run scripted audio through the complete stack: capture fan-out,
// session recording, live snippets, and the post-session transcript, checking
// the byte-conservation and teardown guarantees along the way.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use echoscribe::audio::{ScriptedAudioSource, ScriptedSourceFactory};
use echoscribe::config::{AudioFormat, RecordingConfig, SessionTranscriptConfig, SnippetConfig};
use echoscribe::engine::{EngineFactory, FnEngineFactory, MockEngine, RecognitionEngine};
use echoscribe::events::TranscriberEvent;
use echoscribe::{AudioSourceKind, Transcriber, TranscriberConfig, TranscriberError};
use tempfile::TempDir;
use tokio::sync::Semaphore;

fn full_config(dir: &TempDir, interval_seconds: u64) -> TranscriberConfig {
    TranscriberConfig {
        enable_microphone: true,
        enable_system_audio: false,
        microphone_device_id: None,
        audio: AudioFormat::default(),
        snippets: SnippetConfig {
            enabled: true,
            interval_seconds,
            engine: "streaming-mock".to_string(),
            confidence_threshold: 0.4,
            engine_options: Default::default(),
        },
        session_transcript: SessionTranscriptConfig {
            enabled: true,
            engine: "batch-mock".to_string(),
            confidence_threshold: 0.7,
            engine_options: Default::default(),
        },
        recording: RecordingConfig {
            enabled: true,
            output_dir: dir.path().to_path_buf(),
            auto_cleanup: false,
            max_duration_secs: None,
        },
    }
}

/// Resolve the two engine ids to separate mocks so the tests can observe
/// what each pipeline fed its engine.
fn engine_factory(snippet_mock: &MockEngine, session_mock: &MockEngine) -> Arc<dyn EngineFactory> {
    let snippet_mock = snippet_mock.clone();
    let session_mock = session_mock.clone();
    Arc::new(FnEngineFactory::new(move |engine_id| match engine_id {
        "streaming-mock" => Ok(Box::new(snippet_mock.clone()) as Box<dyn RecognitionEngine>),
        "batch-mock" => Ok(Box::new(session_mock.clone()) as Box<dyn RecognitionEngine>),
        other => Err(TranscriberError::InvalidConfiguration {
            message: format!("Unknown engine: {}", other),
        }),
    }))
}

fn push_mic_audio(sources: &ScriptedSourceFactory, bytes: usize) {
    sources.push_source(ScriptedAudioSource::from_pcm(
        AudioSourceKind::Microphone,
        &AudioFormat::default(),
        vec![1u8; bytes],
        100,
    ));
}

async fn wait_for_chunks(transcriber: &Transcriber, expected: u64) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while transcriber.metrics().chunks_received < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if waited.is_err() {
        panic!(
            "Timed out waiting for {} chunks, saw {}",
            expected,
            transcriber.metrics().chunks_received
        );
    }
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<TranscriberEvent>) -> Vec<TranscriberEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[tokio::test]
async fn test_fanout_preserves_every_captured_byte() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let snippet_mock = MockEngine::new("streaming-mock").with_response("hello world", 0.8);
    let session_mock = MockEngine::new("batch-mock").with_response("alpha beta gamma", 0.9);

    let sources = Arc::new(ScriptedSourceFactory::new());
    // 3 seconds of audio: 96000 bytes in 30 chunks
    push_mic_audio(&sources, 96000);

    let transcriber = Transcriber::new(
        full_config(&temp_dir, 2),
        sources,
        engine_factory(&snippet_mock, &session_mock),
    );
    let mut rx = transcriber.subscribe();

    transcriber.start().await?;
    wait_for_chunks(&transcriber, 30).await;
    transcriber.stop().await?;

    // Recorder path: every captured byte landed in the WAV file
    let events = drain_events(&mut rx);
    let finalized = events
        .iter()
        .find_map(|event| match event {
            TranscriberEvent::RecordingStopped(finalized) => Some(finalized.clone()),
            _ => None,
        })
        .expect("RecordingStopped should be emitted");
    assert_eq!(finalized.bytes_written, 96000, "No captured byte may be lost");
    let reader = hound::WavReader::open(&finalized.path)?;
    assert_eq!(reader.len(), 48000, "3 seconds at 16kHz is 48000 samples");

    // Snippet path: one full 2-second window, the 1-second tail discarded
    assert_eq!(snippet_mock.received_lens(), vec![64000]);

    // Session path: the engine saw the whole PCM payload, header excluded
    assert_eq!(session_mock.received_lens(), vec![96000]);

    let transcript = events
        .iter()
        .find_map(|event| match event {
            TranscriberEvent::SessionTranscript(transcript) => Some(transcript.clone()),
            _ => None,
        })
        .expect("SessionTranscript should be emitted");
    assert_eq!(transcript.text, "alpha beta gamma");
    assert_eq!(transcript.metadata.word_count, 3);
    assert_eq!(transcript.metadata.duration_ms, 3000);
    assert!(transcript.is_complete);

    // The stop was clean and the metrics snapshot agrees
    let stopped = events
        .iter()
        .find_map(|event| match event {
            TranscriberEvent::Stopped(summary) => Some(summary.clone()),
            _ => None,
        })
        .expect("Stopped should be emitted");
    assert!(stopped.failures.is_empty(), "No teardown step should fail");

    let metrics = transcriber.metrics();
    assert_eq!(metrics.chunks_received, 30);
    assert_eq!(metrics.bytes_recorded, 96000);
    assert_eq!(metrics.snippets_emitted, 1);
    assert_eq!(metrics.write_errors, 0);

    Ok(())
}

#[tokio::test]
async fn test_recording_is_finalized_before_failed_transcript_is_reported() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let snippet_mock = MockEngine::new("streaming-mock").with_response("live", 0.8);
    let session_mock = MockEngine::new("batch-mock").with_transcribe_failure();

    let sources = Arc::new(ScriptedSourceFactory::new());
    push_mic_audio(&sources, 64000);

    let transcriber = Transcriber::new(
        full_config(&temp_dir, 2),
        sources,
        engine_factory(&snippet_mock, &session_mock),
    );
    let mut rx = transcriber.subscribe();

    transcriber.start().await?;
    wait_for_chunks(&transcriber, 20).await;

    // stop() itself succeeds; the failure is reported, not propagated
    transcriber.stop().await?;

    let events = drain_events(&mut rx);

    // The archival file was secured before the transcript step ran
    let stopped_index = events
        .iter()
        .position(|event| matches!(event, TranscriberEvent::RecordingStopped(_)))
        .expect("RecordingStopped should be emitted");
    let error_index = events
        .iter()
        .position(|event| matches!(event, TranscriberEvent::Error(_)))
        .expect("The failed transcript should surface as an error event");
    assert!(
        stopped_index < error_index,
        "Recording must be finalized before the transcript failure is reported"
    );

    let finalized = events
        .iter()
        .find_map(|event| match event {
            TranscriberEvent::RecordingStopped(finalized) => Some(finalized.clone()),
            _ => None,
        })
        .expect("RecordingStopped should be emitted");
    assert!(finalized.path.exists(), "The WAV file survives a failed transcript");

    // The stop summary names the failed step
    let summary = events
        .iter()
        .find_map(|event| match event {
            TranscriberEvent::Stopped(summary) => Some(summary.clone()),
            _ => None,
        })
        .expect("Stopped is emitted even when a step failed");
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].step, "session-transcript");

    assert_eq!(transcriber.metrics().step_failures, 1);

    Ok(())
}

#[tokio::test]
async fn test_rapid_restart_keeps_sessions_distinct() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let session_mock = MockEngine::new("batch-mock").with_response("two runs", 0.9);

    // Session transcript only; snippets stay out of the way
    let mut config = full_config(&temp_dir, 2);
    config.snippets.enabled = false;

    let sources = Arc::new(ScriptedSourceFactory::new());
    push_mic_audio(&sources, 32000);

    let transcriber = Transcriber::new(
        config,
        sources.clone(),
        engine_factory(&MockEngine::new("streaming-mock"), &session_mock),
    );
    let mut rx = transcriber.subscribe();

    // First run
    transcriber.start().await?;
    wait_for_chunks(&transcriber, 10).await;
    transcriber.stop().await?;

    // Second run immediately after
    push_mic_audio(&sources, 32000);
    transcriber.start().await?;
    wait_for_chunks(&transcriber, 20).await;
    transcriber.stop().await?;

    let transcripts: Vec<_> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            TranscriberEvent::SessionTranscript(transcript) => Some(transcript),
            _ => None,
        })
        .collect();

    assert_eq!(transcripts.len(), 2, "Each run should produce one transcript");
    assert_ne!(
        transcripts[0].session_id, transcripts[1].session_id,
        "Each run gets its own session id"
    );
    assert!(transcripts.iter().all(|transcript| transcript.is_complete));

    // Each run handed its own full recording to the engine
    assert_eq!(session_mock.received_lens(), vec![32000, 32000]);

    Ok(())
}

#[tokio::test]
async fn test_auto_cleanup_removes_recording_after_transcript() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let snippet_mock = MockEngine::new("streaming-mock").with_response("live", 0.8);
    let session_mock = MockEngine::new("batch-mock").with_response("kept transcript", 0.9);

    let mut config = full_config(&temp_dir, 2);
    config.recording.auto_cleanup = true;

    let sources = Arc::new(ScriptedSourceFactory::new());
    push_mic_audio(&sources, 32000);

    let transcriber = Transcriber::new(
        config,
        sources,
        engine_factory(&snippet_mock, &session_mock),
    );
    let mut rx = transcriber.subscribe();

    transcriber.start().await?;
    wait_for_chunks(&transcriber, 10).await;
    transcriber.stop().await?;

    // The transcript was produced from the file before it was removed
    let events = drain_events(&mut rx);
    assert!(
        events
            .iter()
            .any(|event| matches!(event, TranscriberEvent::SessionTranscript(_))),
        "The transcript should be produced before cleanup"
    );
    assert_eq!(session_mock.received_lens(), vec![32000]);

    // No WAV files remain
    let leftover_wavs = wav_files_in(temp_dir.path())?;
    assert!(
        leftover_wavs.is_empty(),
        "Auto-cleanup should remove the session file, found {:?}",
        leftover_wavs
    );

    Ok(())
}

#[tokio::test]
async fn test_long_session_yields_one_snippet_and_full_transcript() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let snippet_mock = MockEngine::new("streaming-mock").with_response("fifteen second window", 0.9);
    let session_mock = MockEngine::new("batch-mock").with_response("the whole session", 0.95);

    let sources = Arc::new(ScriptedSourceFactory::new());
    // 20 seconds of audio against a 15-second snippet window
    push_mic_audio(&sources, 640000);

    let transcriber = Transcriber::new(
        full_config(&temp_dir, 15),
        sources,
        engine_factory(&snippet_mock, &session_mock),
    );
    let mut rx = transcriber.subscribe();

    transcriber.start().await?;
    wait_for_chunks(&transcriber, 200).await;
    transcriber.stop().await?;

    let events = drain_events(&mut rx);
    let snippets: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            TranscriberEvent::Snippet(snippet) => Some(snippet.clone()),
            _ => None,
        })
        .collect();

    // One full 15s window; the 5s tail never flushes
    assert_eq!(snippets.len(), 1, "Only the completed window becomes a snippet");
    assert_eq!(snippets[0].timestamp_ms, 0);
    assert_eq!(snippets[0].snippet_index, 0);
    assert_eq!(snippet_mock.received_lens(), vec![480000]);

    // The session transcript still covers all 20 seconds
    let transcript = events
        .iter()
        .find_map(|event| match event {
            TranscriberEvent::SessionTranscript(transcript) => Some(transcript.clone()),
            _ => None,
        })
        .expect("SessionTranscript should be emitted");
    assert_eq!(transcript.metadata.duration_ms, 20000);
    assert_eq!(session_mock.received_lens(), vec![640000]);

    assert_eq!(transcriber.metrics().bytes_recorded, 640000);

    Ok(())
}

#[tokio::test]
async fn test_chunks_arriving_during_teardown_are_discarded() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let snippet_mock = MockEngine::new("streaming-mock").with_response("never emitted", 0.9);
    let session_mock = MockEngine::new("batch-mock")
        .with_response("short session", 0.9)
        .with_delay(Duration::from_millis(1500));

    // A 20-second script paced at real-time speed keeps feeding while stop runs
    let sources = Arc::new(ScriptedSourceFactory::new());
    sources.push_source(
        ScriptedAudioSource::from_pcm(
            AudioSourceKind::Microphone,
            &AudioFormat::default(),
            vec![1u8; 640000],
            100,
        )
        .paced(true),
    );

    let transcriber = Transcriber::new(
        full_config(&temp_dir, 1),
        sources,
        engine_factory(&snippet_mock, &session_mock),
    );
    let mut rx = transcriber.subscribe();

    transcriber.start().await?;
    wait_for_chunks(&transcriber, 4).await;

    let before = transcriber.metrics().chunks_received;
    transcriber.stop().await?;
    let metrics = transcriber.metrics();

    // The slow transcript step kept teardown busy while the source was still
    // pacing out chunks; none of them may be counted, recorded, or windowed
    assert_eq!(
        metrics.chunks_received, before,
        "Chunks arriving during teardown must be discarded"
    );
    assert_eq!(
        snippet_mock.transcribe_calls(),
        0,
        "No snippet window may form from teardown audio"
    );
    assert_eq!(metrics.bytes_recorded, before * 3200);
    assert_eq!(
        session_mock.received_lens(),
        vec![metrics.bytes_recorded as usize],
        "The transcript covers exactly the audio captured before stop"
    );

    let events = drain_events(&mut rx);
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, TranscriberEvent::SessionTranscript(_)))
            .count(),
        1
    );
    let stopped = events
        .iter()
        .find_map(|event| match event {
            TranscriberEvent::Stopped(summary) => Some(summary.clone()),
            _ => None,
        })
        .expect("Stopped should be emitted");
    assert!(stopped.failures.is_empty());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_stop_returns_ok_when_teardown_outlasts_the_wait() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let gate = Arc::new(Semaphore::new(0));
    let session_mock = MockEngine::new("batch-mock")
        .with_response("slow final transcript", 0.9)
        .with_gate(Arc::clone(&gate));

    let mut config = full_config(&temp_dir, 2);
    config.snippets.enabled = false;

    let sources = Arc::new(ScriptedSourceFactory::new());
    push_mic_audio(&sources, 32000);

    let transcriber = Arc::new(Transcriber::new(
        config,
        sources,
        engine_factory(&MockEngine::new("streaming-mock"), &session_mock),
    ));
    let mut rx = transcriber.subscribe();

    transcriber.start().await?;
    wait_for_chunks(&transcriber, 10).await;

    // The first stop parks inside the transcript step, behind the gate
    let first_stop = tokio::spawn({
        let transcriber = Arc::clone(&transcriber);
        async move { transcriber.stop().await }
    });
    while session_mock.transcribe_calls() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The second stop outlives its wait for the first and still succeeds
    let second_stop = tokio::spawn({
        let transcriber = Arc::clone(&transcriber);
        async move { transcriber.stop().await }
    });
    second_stop
        .await?
        .expect("A collapsed stop must not fail because teardown is slow");

    let mut events = drain_events(&mut rx);
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, TranscriberEvent::Stopped(_))),
        "The first stop should still be mid-teardown"
    );

    gate.add_permits(1);
    first_stop
        .await?
        .expect("The stop that owns teardown should finish cleanly");

    events.extend(drain_events(&mut rx));
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, TranscriberEvent::Stopped(_)))
            .count(),
        1,
        "Only the stop that ran teardown emits Stopped"
    );
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, TranscriberEvent::SessionTranscript(_)))
            .count(),
        1
    );

    Ok(())
}

#[tokio::test]
async fn test_transcript_survives_every_other_teardown_step_failing() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let gate = Arc::new(Semaphore::new(0));
    let snippet_mock = MockEngine::new("streaming-mock").with_shutdown_failure();
    let session_mock = MockEngine::new("batch-mock")
        .with_response("rescued transcript", 0.95)
        .with_shutdown_failure()
        .with_gate(Arc::clone(&gate));

    let mut config = full_config(&temp_dir, 2);
    config.recording.auto_cleanup = true;

    let sources = Arc::new(ScriptedSourceFactory::new());
    push_mic_audio(&sources, 32000);

    let transcriber = Arc::new(Transcriber::new(
        config,
        sources,
        engine_factory(&snippet_mock, &session_mock),
    ));
    let mut rx = transcriber.subscribe();

    transcriber.start().await?;
    wait_for_chunks(&transcriber, 10).await;

    let stopping = tokio::spawn({
        let transcriber = Arc::clone(&transcriber);
        async move { transcriber.stop().await }
    });

    // Once the engine has been entered the payload is already in memory;
    // removing the finalized file now makes the cleanup step fail later
    tokio::time::timeout(Duration::from_secs(5), async {
        while session_mock.transcribe_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("The transcript step should reach the engine");
    let recorded = wav_files_in(temp_dir.path())?;
    assert_eq!(recorded.len(), 1, "One finalized recording should exist");
    std::fs::remove_file(&recorded[0])?;
    gate.add_permits(1);

    stopping
        .await?
        .expect("stop() reports step failures instead of failing");

    let events = drain_events(&mut rx);
    let transcripts: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            TranscriberEvent::SessionTranscript(transcript) => Some(transcript.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(transcripts.len(), 1, "The transcript is emitted exactly once");
    assert_eq!(transcripts[0].text, "rescued transcript");
    assert!(transcripts[0].is_complete);

    let summaries: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            TranscriberEvent::Stopped(summary) => Some(summary.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(summaries.len(), 1, "Stopped is emitted exactly once");
    let steps: Vec<_> = summaries[0]
        .failures
        .iter()
        .map(|failure| failure.step.as_str())
        .collect();
    assert_eq!(
        steps,
        vec![
            "stop-snippet-pipeline",
            "stop-session-pipeline",
            "cleanup-recording"
        ],
        "Every failed step is collected in teardown order"
    );
    assert_eq!(transcriber.metrics().step_failures, 3);

    Ok(())
}

fn wav_files_in(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |ext| ext == "wav") {
            found.push(path);
        }
    }
    Ok(found)
}
