// Integration tests for the recording session state machine
//
// These run the full pipeline over the simulated backend with scripted
// collaborators and a paused clock, so every timer interleaving is
// deterministic: elapsed counter (1s), raw chunk flush (1s) and analysis
// tick (3s).

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use base64::{engine::general_purpose, Engine as _};
use common::{dangerous, safe, settle, FixedPolicy, Harness, RecordingStore, ScriptedInference};
use tokio::sync::broadcast;
use tokio::time::sleep;
use zone_guard::analysis::{AlertMode, ZoneStatus};
use zone_guard::error::{AcquisitionError, SessionError};
use zone_guard::session::{SessionConfig, SessionState};
use zone_guard::{MonitorEvent, WINDOW_LEN};

fn drain(rx: &mut broadcast::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_dangerous_tick_raises_sticky_alert() -> Result<()> {
    let mut config = SessionConfig::default();
    config.analysis.alert_mode = AlertMode::Latch;
    let h = Harness::with(
        config,
        ScriptedInference::new(vec![Ok(safe()), Ok(safe()), Ok(dangerous()), Ok(safe())]),
        FixedPolicy::auto_save(false),
        RecordingStore::new(),
    );
    let mut events = h.session.subscribe();

    h.session.start().await?;
    assert_eq!(h.session.state(), SessionState::Recording);

    sleep(Duration::from_millis(6_100)).await;
    assert_eq!(h.inference.calls(), 2);
    assert_eq!(h.session.zone().status(), ZoneStatus::Safe);

    sleep(Duration::from_millis(3_000)).await;
    assert_eq!(h.inference.calls(), 3);
    let zone = h.session.zone().snapshot();
    assert_eq!(zone.status, ZoneStatus::Alert);
    let detected_at = zone.last_detection.expect("detection timestamp");

    // A later safe reading does not clear the alert
    sleep(Duration::from_millis(3_000)).await;
    assert_eq!(h.inference.calls(), 4);
    let zone = h.session.zone().snapshot();
    assert_eq!(zone.status, ZoneStatus::Alert);
    assert_eq!(zone.last_detection, Some(detected_at));
    assert_eq!(zone.last_inference, Some(safe()));

    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, MonitorEvent::DangerDetected { zone_id: 1, .. })));

    h.session.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_requests_carry_fixed_length_windows() -> Result<()> {
    let h = Harness::new(ScriptedInference::new(vec![]));
    h.session.start().await?;

    sleep(Duration::from_millis(3_100)).await;
    h.session.stop().await?;

    let requests = h.inference.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].audio_data.len(), WINDOW_LEN);
    assert_eq!(requests[0].sample_rate, 16_000);
    assert_eq!(requests[0].duration, 1_000);
    // fft_size (2048) of signal, zero-padded to the window length
    assert!(requests[0].audio_data[2048..].iter().all(|s| *s == 0.0));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_acknowledge_clears_alert_but_keeps_detection_time() -> Result<()> {
    let h = Harness::new(ScriptedInference::new(vec![Ok(dangerous())]));
    h.session.start().await?;

    sleep(Duration::from_millis(3_100)).await;
    assert_eq!(h.session.zone().status(), ZoneStatus::Alert);

    assert!(h.session.acknowledge_alert());
    let zone = h.session.zone().snapshot();
    assert_eq!(zone.status, ZoneStatus::Safe);
    assert!(zone.last_detection.is_some());
    assert!(!h.session.acknowledge_alert());

    h.session.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_default_config_safe_reading_follows_alert() -> Result<()> {
    assert_eq!(SessionConfig::default().analysis.alert_mode, AlertMode::Follow);
    let h = Harness::new(ScriptedInference::new(vec![Ok(dangerous()), Ok(safe())]));
    h.session.start().await?;

    sleep(Duration::from_millis(3_100)).await;
    assert_eq!(h.session.zone().status(), ZoneStatus::Alert);
    sleep(Duration::from_millis(3_000)).await;
    assert_eq!(h.session.zone().status(), ZoneStatus::Safe);
    assert!(h.session.zone().snapshot().last_detection.is_some());

    h.session.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_returns_to_idle() -> Result<()> {
    let h = Harness::new(ScriptedInference::new(vec![]));
    let mut events = h.session.subscribe();
    h.probe.fail_next(AcquisitionError::PermissionDenied);

    let result = h.session.start().await;
    assert!(matches!(
        result,
        Err(SessionError::Acquisition(AcquisitionError::PermissionDenied))
    ));

    let status = h.session.status();
    assert_eq!(status.state, SessionState::Idle);
    assert!(!status.analysis.running);
    assert_eq!(status.buffered_chunks, 0);

    // No timers left behind
    sleep(Duration::from_secs(10)).await;
    assert_eq!(h.inference.calls(), 0);
    assert_eq!(h.session.elapsed_secs(), 0);
    assert_eq!(h.probe.acquired(), 0);
    assert_eq!(h.probe.released(), 0);
    assert!(h.session.last_artifact().is_none());

    assert_eq!(
        drain(&mut events),
        vec![
            MonitorEvent::StateChanged {
                state: SessionState::Acquiring
            },
            MonitorEvent::AcquisitionFailed {
                error: AcquisitionError::PermissionDenied.to_string()
            },
            MonitorEvent::StateChanged {
                state: SessionState::Idle
            },
        ]
    );

    // The session is usable again
    h.session.start().await?;
    h.session.stop().await?;
    assert_eq!(h.probe.outstanding(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stop_when_idle_is_noop() -> Result<()> {
    let h = Harness::new(ScriptedInference::new(vec![]));
    let mut events = h.session.subscribe();

    assert!(h.session.stop().await?.is_none());
    assert!(h.session.stop().await?.is_none());

    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.probe.released(), 0);
    assert!(drain(&mut events).is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_start_while_recording_is_busy() -> Result<()> {
    let h = Harness::new(ScriptedInference::new(vec![]));
    h.session.start().await?;

    let result = h.session.start().await;
    assert!(matches!(
        result,
        Err(SessionError::Busy(SessionState::Recording))
    ));
    assert_eq!(h.probe.acquired(), 1);

    h.session.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_acquisition_cancels_start() -> Result<()> {
    let h = Harness::new(ScriptedInference::new(vec![]));
    h.probe.hold_acquisition();

    let session = Arc::clone(&h.session);
    let start = tokio::spawn(async move { session.start().await });
    settle().await;
    assert_eq!(h.session.state(), SessionState::Acquiring);

    assert!(h.session.stop().await?.is_none());
    assert!(matches!(start.await?, Err(SessionError::Cancelled)));
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.probe.acquired(), h.probe.released());

    h.probe.open_gate();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(h.inference.calls(), 0);
    assert_eq!(h.probe.outstanding(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_acquisition_cancels_start() -> Result<()> {
    let h = Harness::new(ScriptedInference::new(vec![]));
    h.probe.hold_acquisition();

    let session = Arc::clone(&h.session);
    let start = tokio::spawn(async move { session.start().await });
    settle().await;

    h.session.abort();
    assert!(matches!(start.await?, Err(SessionError::Cancelled)));
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.probe.outstanding(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_acquire_and_release_stay_balanced() -> Result<()> {
    let h = Harness::new(ScriptedInference::new(vec![]));

    for _ in 0..3 {
        h.session.start().await?;
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(h.probe.outstanding(), 1);
        h.session.stop().await?;
        assert_eq!(h.probe.outstanding(), 0);
    }

    // Forced teardown mid-recording
    h.session.start().await?;
    sleep(Duration::from_millis(500)).await;
    h.session.abort();
    assert_eq!(h.session.state(), SessionState::Idle);

    // Start immediately followed by stop
    let session = Arc::clone(&h.session);
    let start = tokio::spawn(async move { session.start().await });
    h.session.stop().await?;
    let _ = start.await?;
    h.session.stop().await?;

    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.probe.acquired(), h.probe.released());
    assert_eq!(h.probe.acquired(), 5);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dropping_session_releases_source() -> Result<()> {
    let h = Harness::new(ScriptedInference::new(vec![]));
    h.session.start().await?;
    sleep(Duration::from_millis(1_500)).await;

    let Harness { session, probe, .. } = h;
    drop(session);
    assert_eq!(probe.outstanding(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stale_result_after_stop_is_ignored() -> Result<()> {
    let h = Harness::new(ScriptedInference::gated(vec![Ok(dangerous())]));
    h.session.start().await?;

    sleep(Duration::from_millis(3_100)).await;
    assert_eq!(h.inference.calls(), 1);
    assert!(h.session.status().analysis.in_flight);

    h.session.stop().await?;
    h.inference.release(1);
    settle().await;

    let status = h.session.status();
    assert_eq!(status.zone.status, ZoneStatus::Safe);
    assert!(status.zone.last_inference.is_none());
    assert_eq!(status.analysis.stale, 1);
    assert!(!status.analysis.in_flight);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_ticks_skip_while_request_in_flight() -> Result<()> {
    let h = Harness::new(ScriptedInference::gated(vec![Ok(dangerous())]));
    h.session.start().await?;

    sleep(Duration::from_millis(9_100)).await;
    assert_eq!(h.inference.calls(), 1);
    assert_eq!(h.session.status().analysis.skipped, 2);

    h.inference.release(1);
    settle().await;
    assert_eq!(h.session.zone().status(), ZoneStatus::Alert);

    // The next tick dispatches again
    h.inference.release(1);
    sleep(Duration::from_millis(3_000)).await;
    assert_eq!(h.inference.calls(), 2);

    h.session.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_failures_report_degraded_without_stopping() -> Result<()> {
    let h = Harness::new(ScriptedInference::failing());
    let mut events = h.session.subscribe();
    h.session.start().await?;

    sleep(Duration::from_millis(12_100)).await;
    let status = h.session.status();
    assert_eq!(status.state, SessionState::Recording);
    assert!(status.analysis.degraded);
    assert_eq!(status.analysis.failed, 4);

    let degraded: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, MonitorEvent::AnalysisDegraded { .. }))
        .collect();
    assert_eq!(
        degraded,
        vec![MonitorEvent::AnalysisDegraded {
            consecutive_failures: 3
        }]
    );

    assert!(h.session.stop().await?.is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_elapsed_counter_resets_and_freezes() -> Result<()> {
    let h = Harness::new(ScriptedInference::new(vec![]));
    h.session.start().await?;

    sleep(Duration::from_millis(5_500)).await;
    assert_eq!(h.session.elapsed_secs(), 5);

    h.session.stop().await?;
    sleep(Duration::from_secs(3)).await;
    assert_eq!(h.session.elapsed_secs(), 5);

    h.session.start().await?;
    assert_eq!(h.session.elapsed_secs(), 0);
    sleep(Duration::from_millis(2_500)).await;
    assert_eq!(h.session.elapsed_secs(), 2);

    h.session.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stop_assembles_and_uploads_artifact() -> Result<()> {
    let h = Harness::new(ScriptedInference::new(vec![]));
    let mut events = h.session.subscribe();
    h.session.start().await?;

    sleep(Duration::from_millis(3_500)).await;
    assert!(h.session.status().buffered_chunks >= 3);

    let artifact = h.session.stop().await?.expect("artifact");
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.probe.outstanding(), 0);

    assert!(artifact.chunk_count() >= 3);
    assert_eq!(&artifact.bytes()[..4], b"RIFF");
    assert!(artifact.file_name().starts_with("recording_"));
    assert!(artifact.file_name().ends_with(".wav"));
    assert_eq!(artifact.file_name().len(), "recording_20240101_000000.wav".len());
    assert_eq!(h.session.last_artifact(), Some(artifact.clone()));

    let reports = h.session.flush_persistence().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].uploaded);
    assert!(reports[0].errors.is_empty());
    assert_eq!(h.policy.lookups(), 1);

    let uploads = h.store.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].file_name, artifact.file_name());
    assert_eq!(
        uploads[0].audio_data,
        general_purpose::STANDARD.encode(artifact.bytes())
    );

    let events = drain(&mut events);
    assert!(events.contains(&MonitorEvent::ArtifactReady {
        file_name: artifact.file_name().to_string(),
        bytes: artifact.len(),
    }));
    assert!(events.contains(&MonitorEvent::Persisted {
        file_name: artifact.file_name().to_string(),
    }));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_upload_failure_keeps_local_artifact() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = SessionConfig::default();
    config.recording.export_dir = Some(dir.path().to_path_buf());
    let h = Harness::with(
        config,
        ScriptedInference::new(vec![]),
        FixedPolicy::auto_save(true),
        RecordingStore::rejecting(),
    );
    let mut events = h.session.subscribe();

    h.session.start().await?;
    sleep(Duration::from_millis(2_500)).await;
    let artifact = h.session.stop().await?.expect("artifact");

    let reports = h.session.flush_persistence().await;
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].uploaded);
    assert_eq!(reports[0].errors.len(), 1);

    let exported = reports[0].exported.clone().expect("exported path");
    assert_eq!(std::fs::read(&exported)?, artifact.bytes());
    assert_eq!(h.session.last_artifact(), Some(artifact.clone()));
    assert_eq!(h.session.state(), SessionState::Idle);

    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, MonitorEvent::PersistenceFailed { .. })));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_auto_save_disabled_skips_upload() -> Result<()> {
    let h = Harness::with(
        SessionConfig::default(),
        ScriptedInference::new(vec![]),
        FixedPolicy::auto_save(false),
        RecordingStore::new(),
    );

    h.session.start().await?;
    sleep(Duration::from_millis(1_500)).await;
    assert!(h.session.stop().await?.is_some());

    let reports = h.session.flush_persistence().await;
    assert!(!reports[0].uploaded);
    assert!(reports[0].errors.is_empty());
    assert!(h.store.uploads().is_empty());

    // Policy is looked up again on every finalize
    h.session.start().await?;
    sleep(Duration::from_millis(1_500)).await;
    h.session.stop().await?;
    h.session.flush_persistence().await;
    assert_eq!(h.policy.lookups(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_device_revocation_finalizes_recording() -> Result<()> {
    let h = Harness::new(ScriptedInference::new(vec![]));
    let mut events = h.session.subscribe();
    h.session.start().await?;

    sleep(Duration::from_millis(2_500)).await;
    h.probe.revoke();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.probe.outstanding(), 0);
    let artifact = h.session.last_artifact().expect("artifact after revocation");
    assert!(artifact.chunk_count() >= 2);
    assert!(drain(&mut events).contains(&MonitorEvent::SourceLost {
        error: AcquisitionError::Revoked.to_string(),
    }));

    // Analysis stopped with the recording
    let calls = h.inference.calls();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(h.inference.calls(), calls);
    Ok(())
}
