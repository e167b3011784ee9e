//! End-to-end orchestrator tests against the simulated engine.
//!
//! Every test gets its own temporary bundle, a scripted catalog and a counting
//! in-memory transport (see `common`). Nothing here needs macOS.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{FakeCatalog, FakeTransport, Harness, drain, fast_engine};
use macvm::log_stream::LogLevel;
use macvm::vm::{LifecycleState, Policy, VmError};

fn record() -> (Arc<Mutex<Vec<f64>>>, impl FnMut(f64)) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |f| sink.lock().unwrap().push(f))
}

fn assert_monotonic_to_one(values: &[f64]) {
    assert!(!values.is_empty(), "no progress reported");
    assert!(
        values.windows(2).all(|w| w[0] < w[1]),
        "progress not strictly increasing: {values:?}"
    );
    assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    assert_eq!(*values.last().unwrap(), 1.0);
}

// ---------------------------------------------------------------------------
// Full scenario
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fresh_bundle_to_running_and_back() {
    let h = Harness::new(fast_engine());
    let orch = &h.orchestrator;
    let mut transitions = orch.transitions();

    assert_eq!(orch.state(), LifecycleState::Unconfigured);

    let status = orch.check_status().await.unwrap();
    assert!(!status.has_image);
    assert!(!status.is_installed);
    assert_eq!(status.state, LifecycleState::ImageMissing);
    assert!(h.location.root.is_dir());

    let (download, sink) = record();
    let image = orch
        .acquire_image()
        .await
        .unwrap()
        .for_each_progress(sink)
        .await
        .unwrap();
    assert_monotonic_to_one(&download.lock().unwrap());
    assert_eq!(image.path, h.location.image);
    assert_eq!(image.build.as_deref(), Some("24B83"));
    assert_eq!(orch.state(), LifecycleState::ImagePresent);

    let status = orch.check_status().await.unwrap();
    assert!(status.has_image);
    assert!(!status.is_installed);

    let (install, sink) = record();
    orch.install()
        .await
        .unwrap()
        .for_each_progress(sink)
        .await
        .unwrap();
    assert_monotonic_to_one(&install.lock().unwrap());
    assert_eq!(orch.state(), LifecycleState::Installed);
    assert!(orch.check_status().await.unwrap().is_installed);

    orch.start().await.unwrap();
    assert_eq!(orch.state(), LifecycleState::Running);

    orch.stop().await.unwrap();
    assert_eq!(orch.state(), LifecycleState::Stopped);

    let seen = drain(&mut transitions);
    assert_eq!(seen.first(), Some(&LifecycleState::ImageMissing));
    assert!(seen.contains(&LifecycleState::ImagePresent));
    assert!(seen.iter().any(|s| matches!(s, LifecycleState::Installing(_))));
    assert!(
        seen.ends_with(&[
            LifecycleState::Installed,
            LifecycleState::Starting,
            LifecycleState::Running,
            LifecycleState::Stopping,
            LifecycleState::Stopped,
        ]),
        "unexpected transitions: {seen:?}"
    );

    let lines: Vec<_> = orch.logs().snapshot().into_iter().map(|l| l.message).collect();
    assert!(lines.iter().any(|l| l == "VM started"));
    assert!(lines.iter().any(|l| l == "VM stopped"));
}

// ---------------------------------------------------------------------------
// Acquisition
// ---------------------------------------------------------------------------

#[tokio::test]
async fn acquisition_uses_transport_at_most_once() {
    let h = Harness::new(fast_engine());

    for _ in 0..3 {
        h.orchestrator
            .acquire_image()
            .await
            .unwrap()
            .finish()
            .await
            .unwrap();
    }

    assert_eq!(h.transport.calls(), 1);
}

#[tokio::test]
async fn present_image_is_never_downloaded() {
    let h = Harness::with_image(fast_engine());

    let image = h
        .orchestrator
        .acquire_image()
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(h.transport.calls(), 0);
    assert_eq!(image.path, h.location.image);
}

#[tokio::test]
async fn concurrent_acquisition_is_rejected() {
    let h = Harness::with_parts(
        fast_engine(),
        FakeCatalog::with_image(),
        FakeTransport::slow(Duration::from_millis(20)),
    );

    let first = h.orchestrator.acquire_image().await.unwrap();
    let second = h.orchestrator.acquire_image().await;
    assert!(matches!(second, Err(VmError::AlreadyInProgress)), "got {second:?}");

    first.finish().await.unwrap();
    assert_eq!(h.transport.calls(), 1);
}

#[tokio::test]
async fn failed_download_leaves_nothing_and_can_be_retried() {
    let h = Harness::with_parts(
        fast_engine(),
        FakeCatalog::with_image(),
        FakeTransport::failing_first_after(3),
    );

    let err = h
        .orchestrator
        .acquire_image()
        .await
        .unwrap()
        .finish()
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::DownloadFailed(_)), "got {err:?}");
    assert!(!h.location.image.exists());
    assert!(!h.location.partial_image().exists());
    assert_eq!(h.orchestrator.state(), LifecycleState::ImageMissing);

    h.orchestrator
        .acquire_image()
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();
    assert!(h.location.image.is_file());
    assert_eq!(h.transport.calls(), 2);
}

#[tokio::test]
async fn empty_catalog_reports_no_compatible_image() {
    let h = Harness::with_parts(fast_engine(), FakeCatalog::Empty, FakeTransport::new());

    let err = h
        .orchestrator
        .acquire_image()
        .await
        .unwrap()
        .finish()
        .await
        .unwrap_err();

    assert!(matches!(err, VmError::NoCompatibleImage(_)), "got {err:?}");
    assert_eq!(h.transport.calls(), 0);
}

#[tokio::test]
async fn unreachable_catalog_reports_no_compatible_image() {
    let h = Harness::with_parts(fast_engine(), FakeCatalog::Unreachable, FakeTransport::new());

    let err = h
        .orchestrator
        .acquire_image()
        .await
        .unwrap()
        .finish()
        .await
        .unwrap_err();

    assert!(matches!(err, VmError::NoCompatibleImage(_)), "got {err:?}");
}

#[tokio::test]
async fn imported_image_lands_in_bundle() {
    let h = Harness::new(fast_engine());
    let source = h.location.root.with_file_name("Downloaded.ipsw");
    std::fs::write(&source, vec![7u8; 4096]).unwrap();

    let image = h.orchestrator.import_image(&source).await.unwrap();

    assert_eq!(image.path, h.location.image);
    assert_eq!(std::fs::read(&h.location.image).unwrap().len(), 4096);
    assert_eq!(h.orchestrator.state(), LifecycleState::ImagePresent);
    assert_eq!(h.transport.calls(), 0);
}

#[tokio::test]
async fn empty_import_is_rejected() {
    let h = Harness::new(fast_engine());
    let source = h.location.root.with_file_name("Empty.ipsw");
    std::fs::write(&source, b"").unwrap();

    let err = h.orchestrator.import_image(&source).await.unwrap_err();

    assert!(matches!(err, VmError::UnsupportedConfiguration(_)), "got {err:?}");
    assert!(!h.location.image.exists());
}

// ---------------------------------------------------------------------------
// Installation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_install_is_rejected() {
    let engine = fast_engine().with_step_delay(Duration::from_millis(20));
    let h = Harness::with_image(engine);

    let first = h.orchestrator.install().await.unwrap();
    let second = h.orchestrator.install().await;
    assert!(matches!(second, Err(VmError::AlreadyInProgress)), "got {second:?}");

    first.finish().await.unwrap();
    assert_eq!(h.engine.install_count(), 1);
}

#[tokio::test]
async fn install_without_image_is_invalid() {
    let h = Harness::new(fast_engine());

    let err = h.orchestrator.install().await.unwrap_err();

    assert!(
        matches!(err, VmError::InvalidTransition { command: "install", .. }),
        "got {err:?}"
    );
    assert_eq!(h.engine.install_count(), 0);
}

#[tokio::test]
async fn installed_bundle_install_finishes_immediately() {
    let h = Harness::installed(fast_engine());

    h.orchestrator.install().await.unwrap().finish().await.unwrap();

    assert_eq!(h.engine.install_count(), 0);
}

#[tokio::test]
async fn failed_install_can_be_retried() {
    let h = Harness::with_image(fast_engine().failing_install("disk write error"));

    let err = h.orchestrator.install().await.unwrap().finish().await.unwrap_err();
    assert!(matches!(err, VmError::InstallFailed(_)), "got {err:?}");
    assert_eq!(h.orchestrator.state(), LifecycleState::ImagePresent);
    assert!(!h.orchestrator.check_status().await.unwrap().is_installed);

    // A second install is accepted; the guard was released.
    let again = h.orchestrator.install().await.unwrap().finish().await;
    assert!(matches!(again, Err(VmError::InstallFailed(_))));
    assert_eq!(h.engine.install_count(), 2);
}

/// A fresh full-size disk takes no space, so a failed install under the
/// production thresholds must not look installed.
#[tokio::test]
async fn failed_install_on_full_size_disk_is_not_installed() {
    let h = Harness::with_policy(
        fast_engine().failing_install("disk write error"),
        Policy::default(),
    );

    let err = h.orchestrator.install().await.unwrap().finish().await.unwrap_err();
    assert!(matches!(err, VmError::InstallFailed(_)), "got {err:?}");

    let disk = std::fs::metadata(&h.location.disk).unwrap();
    assert_eq!(disk.len(), Policy::default().disk_size_bytes);
    assert!(h.location.auxiliary_storage.exists());

    let status = h.orchestrator.check_status().await.unwrap();
    assert!(!status.is_installed, "{status:?}");
    assert_eq!(status.state, LifecycleState::ImagePresent);

    // The retry reaches the engine instead of finishing immediately.
    let again = h.orchestrator.install().await.unwrap().finish().await;
    assert!(matches!(again, Err(VmError::InstallFailed(_))));
    assert_eq!(h.engine.install_count(), 2);

    let err = h.orchestrator.start().await.unwrap_err();
    assert!(
        matches!(err, VmError::InvalidTransition { command: "start", .. }),
        "got {err:?}"
    );
    assert_eq!(h.engine.start_count(), 0);
}

#[tokio::test]
async fn install_that_writes_too_little_fails() {
    let h = Harness::with_image(fast_engine().with_install_payload(0));

    let err = h.orchestrator.install().await.unwrap().finish().await.unwrap_err();

    assert!(matches!(err, VmError::InstallFailed(_)), "got {err:?}");
}

#[tokio::test]
async fn install_while_running_is_invalid() {
    let h = Harness::installed(fast_engine());
    h.orchestrator.start().await.unwrap();
    // Without the auxiliary storage the bundle no longer counts as installed.
    std::fs::remove_file(&h.location.auxiliary_storage).unwrap();

    let err = h.orchestrator.install().await.unwrap_err();

    assert!(
        matches!(err, VmError::InvalidTransition { command: "install", .. }),
        "got {err:?}"
    );
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_requires_installed_bundle() {
    let h = Harness::with_image(fast_engine());

    let err = h.orchestrator.start().await.unwrap_err();

    assert!(
        matches!(err, VmError::InvalidTransition { command: "start", .. }),
        "got {err:?}"
    );
    assert_eq!(h.engine.start_count(), 0);
}

#[tokio::test]
async fn start_while_running_is_invalid() {
    let h = Harness::installed(fast_engine());
    h.orchestrator.start().await.unwrap();

    let err = h.orchestrator.start().await.unwrap_err();

    assert!(
        matches!(err, VmError::InvalidTransition { command: "start", .. }),
        "got {err:?}"
    );
    assert_eq!(h.orchestrator.state(), LifecycleState::Running);
    assert_eq!(h.engine.start_count(), 1);
}

#[tokio::test]
async fn stop_while_stopped_is_invalid() {
    let h = Harness::installed(fast_engine());
    h.orchestrator.check_status().await.unwrap();

    let err = h.orchestrator.stop().await.unwrap_err();

    assert!(
        matches!(err, VmError::InvalidTransition { command: "stop", .. }),
        "got {err:?}"
    );
    assert_eq!(h.orchestrator.state(), LifecycleState::Installed);
}

#[tokio::test]
async fn rejected_commands_are_logged() {
    let h = Harness::installed(fast_engine());

    let err = h.orchestrator.stop().await.unwrap_err();

    let lines = h.orchestrator.logs().snapshot();
    let line = lines
        .iter()
        .find(|l| l.level == LogLevel::Error)
        .expect("rejection logged");
    assert_eq!(line.message, format!("Stop rejected: {err}"));
}

#[tokio::test]
async fn rejected_install_while_installing_is_logged() {
    let h = Harness::with_image(fast_engine().with_step_delay(Duration::from_millis(20)));
    let first = h.orchestrator.install().await.unwrap();

    let err = h.orchestrator.install().await.unwrap_err();
    assert!(matches!(err, VmError::AlreadyInProgress), "got {err:?}");
    first.finish().await.unwrap();

    let messages: Vec<_> = h
        .orchestrator
        .logs()
        .snapshot()
        .into_iter()
        .filter(|l| l.level == LogLevel::Error)
        .map(|l| l.message)
        .collect();
    assert_eq!(messages, ["Install rejected: operation already in progress"]);
}

#[tokio::test]
async fn guest_stop_racing_explicit_stop_publishes_one_stopped() {
    let engine = fast_engine().with_stop_delay(Duration::from_millis(100));
    let h = Harness::installed(engine);
    h.orchestrator.start().await.unwrap();
    let mut transitions = h.orchestrator.transitions();

    let orch = h.orchestrator.clone();
    let stop = tokio::spawn(async move { orch.stop().await });
    h.wait_for(|s| *s == LifecycleState::Stopping).await;

    h.engine.current_instance().unwrap().guest_shutdown();

    stop.await.unwrap().unwrap();
    assert_eq!(h.orchestrator.state(), LifecycleState::Stopped);
    assert_eq!(
        drain(&mut transitions),
        vec![LifecycleState::Stopping, LifecycleState::Stopped]
    );
}

#[tokio::test]
async fn guest_shutdown_is_reconciled() {
    let h = Harness::installed(fast_engine());
    h.orchestrator.start().await.unwrap();

    h.engine.current_instance().unwrap().guest_shutdown();

    h.wait_for(|s| *s == LifecycleState::Stopped).await;
    assert!(
        h.orchestrator
            .logs()
            .snapshot()
            .iter()
            .any(|l| l.message == "Guest shut down")
    );
}

#[tokio::test]
async fn crash_fails_and_allows_restart() {
    let h = Harness::installed(fast_engine());
    h.orchestrator.start().await.unwrap();

    h.engine.current_instance().unwrap().crash("guest kernel panic");

    let state = h.wait_for(|s| matches!(s, LifecycleState::Failed(_))).await;
    assert_eq!(state, LifecycleState::Failed("guest kernel panic".into()));

    h.orchestrator.start().await.unwrap();
    assert_eq!(h.orchestrator.state(), LifecycleState::Running);
    assert_eq!(h.engine.start_count(), 2);
}

#[tokio::test]
async fn events_from_a_previous_instance_are_ignored() {
    let h = Harness::installed(fast_engine());
    h.orchestrator.start().await.unwrap();
    let first = h.engine.current_instance().unwrap();
    h.orchestrator.stop().await.unwrap();

    h.orchestrator.start().await.unwrap();
    // The old instance already stopped, so this must not reach the actor as
    // a fresh crash.
    first.crash("stale");
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.orchestrator.state(), LifecycleState::Running);
}

#[tokio::test]
async fn engine_start_failure_moves_to_failed() {
    let h = Harness::installed(fast_engine().failing_start("vfkit exited with status 1"));

    let err = h.orchestrator.start().await.unwrap_err();

    assert!(matches!(err, VmError::Instance(_)), "got {err:?}");
    assert_eq!(
        h.orchestrator.state(),
        LifecycleState::Failed("vfkit exited with status 1".into())
    );
}

#[tokio::test]
async fn identity_survives_restarts() {
    let h = Harness::installed(fast_engine());

    h.orchestrator.start().await.unwrap();
    let identifier = std::fs::read(&h.location.machine_identifier).unwrap();
    h.orchestrator.stop().await.unwrap();

    h.orchestrator.start().await.unwrap();
    assert_eq!(std::fs::read(&h.location.machine_identifier).unwrap(), identifier);
}

#[tokio::test]
async fn shutdown_stops_the_guest_and_ends_the_actor() {
    let h = Harness::installed(fast_engine());
    h.orchestrator.start().await.unwrap();
    let instance = h.engine.current_instance().unwrap();

    h.orchestrator.shutdown().await;

    assert!(!instance.is_running());
    let err = h.orchestrator.check_status().await.unwrap_err();
    assert!(matches!(err, VmError::Shutdown));
    assert!(
        h.orchestrator
            .logs()
            .snapshot()
            .iter()
            .any(|l| l.level == LogLevel::Warn && l.message == "Stopping VM before exit...")
    );
}
