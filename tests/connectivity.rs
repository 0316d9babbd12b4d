//! Connectivity orchestrator against the in-process network.

use std::sync::Arc;
use std::time::Duration;

use precall::analysis::Verdict;
use precall::engine::TestState;
use precall::ice::credentials::StaticCredentials;
use precall::ice::{IceServerDescriptor, TransportPolicy, TraversalMode};
use precall::probes::{ConnectivitySettings, ConnectivityTest};
use precall::storage::ResultStore;
use precall::transport::loopback::ProbeOutcome;
use precall::transport::memory::{LinkBehavior, MemoryNetwork};
use precall::transport::{MediaKind, MediaStream, MediaTrack};

fn servers() -> StaticCredentials {
    StaticCredentials(vec![
        IceServerDescriptor::new("stun:stun.example.org:3478"),
        IceServerDescriptor::new("turn:turn.example.org:3478?transport=udp")
            .with_credentials("user", "secret"),
    ])
}

fn settings(modes: Vec<TraversalMode>) -> ConnectivitySettings {
    ConnectivitySettings {
        modes,
        ..ConnectivitySettings::default()
    }
}

fn av() -> MediaStream {
    MediaStream::new("local")
        .with_track(MediaTrack::new("a", MediaKind::Audio))
        .with_track(MediaTrack::new("v", MediaKind::Video))
}

#[tokio::test(start_paused = true)]
async fn test_relay_connects_and_passes() {
    let store = ResultStore::new();
    let network = MemoryNetwork::new(LinkBehavior::Connect);
    let test = ConnectivityTest::new(
        store.clone(),
        Arc::new(network.clone()),
        Arc::new(servers()),
        settings(vec![TraversalMode::RelayOnly]),
    );

    assert!(test.start(Some(av())));
    assert_eq!(test.wait().await, TestState::Finished);

    let report = store.connectivity().expect("connectivity report");
    assert_eq!(report.result, Verdict::Passed);
    assert_eq!(report.connected_modes, vec![TraversalMode::RelayOnly]);
    assert!(report.failed_modes.is_empty());
    assert!(report.errors.is_empty());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["result"], "passed");
    assert_eq!(json["connectedModes"][0], "relay");

    let log = network.log();
    assert_eq!(log.endpoints_created, 2);
    assert_eq!(log.endpoints_closed, 2);
    assert_eq!(log.early_candidates, 0);
}

#[tokio::test(start_paused = true)]
async fn test_mixed_modes_report_per_mode() {
    let store = ResultStore::new();
    let network = MemoryNetwork::with_behavior(|config| match config.policy {
        TransportPolicy::Relay => LinkBehavior::Connect,
        TransportPolicy::All => LinkBehavior::Fail,
    });
    let test = ConnectivityTest::new(
        store.clone(),
        Arc::new(network),
        Arc::new(servers()),
        settings(vec![
            TraversalMode::RelayOnly,
            TraversalMode::Unrestricted,
            TraversalMode::StunOnly,
        ]),
    );

    assert!(test.start(None));
    test.wait().await;

    let report = store.connectivity().unwrap();
    assert_eq!(report.result, Verdict::Passed);
    assert_eq!(report.connected_modes, vec![TraversalMode::RelayOnly]);
    assert_eq!(
        report.failed_modes,
        vec![TraversalMode::Unrestricted, TraversalMode::StunOnly]
    );
    assert_eq!(report.probes.len(), 3);
    assert_eq!(report.probes[&TraversalMode::StunOnly].outcome, ProbeOutcome::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_relay_failure_fails_the_run() {
    let store = ResultStore::new();
    let test = ConnectivityTest::new(
        store.clone(),
        Arc::new(MemoryNetwork::new(LinkBehavior::Fail)),
        Arc::new(servers()),
        settings(vec![TraversalMode::RelayOnly]),
    );
    test.start(None);
    test.wait().await;

    let report = store.connectivity().unwrap();
    assert_eq!(report.result, Verdict::Failed);
    assert_eq!(report.failed_modes, vec![TraversalMode::RelayOnly]);
}

#[tokio::test(start_paused = true)]
async fn test_credential_failure_is_recorded() {
    let store = ResultStore::new();
    let test = ConnectivityTest::new(
        store.clone(),
        Arc::new(MemoryNetwork::new(LinkBehavior::Connect)),
        Arc::new(StaticCredentials::default()),
        settings(vec![TraversalMode::RelayOnly]),
    );
    test.start(None);
    assert_eq!(test.wait().await, TestState::Finished);

    let report = store.connectivity().unwrap();
    assert_eq!(report.result, Verdict::Failed);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].error.contains("no ICE servers"));
}

#[tokio::test(start_paused = true)]
async fn test_missing_tracks_are_warned_about() {
    let store = ResultStore::new();
    let test = ConnectivityTest::new(
        store.clone(),
        Arc::new(MemoryNetwork::new(LinkBehavior::Connect)),
        Arc::new(servers()),
        settings(vec![TraversalMode::RelayOnly]),
    );
    let audio_only = MediaStream::new("local").with_track(MediaTrack::new("a", MediaKind::Audio));
    test.start(Some(audio_only));
    test.wait().await;

    let report = store.connectivity().unwrap();
    assert_eq!(report.result, Verdict::Passed);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(
        report.errors[0].error,
        "No video track found: this may affect the connectivity test results."
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let store = ResultStore::new();
    let network = MemoryNetwork::new(LinkBehavior::Stall);
    let test = ConnectivityTest::new(
        store.clone(),
        Arc::new(network.clone()),
        Arc::new(servers()),
        settings(vec![TraversalMode::RelayOnly]),
    );

    // Stopping before any run does nothing.
    test.stop();
    assert_eq!(test.state(), TestState::Idle);

    test.start(None);
    let mut states = test.subscribe();
    states.wait_for(|s| *s == TestState::Running).await.unwrap();
    assert!(!test.start(None));

    test.stop();
    test.stop();
    assert_eq!(test.wait().await, TestState::Finished);
    test.stop();
    assert_eq!(test.state(), TestState::Finished);

    let report = store.connectivity().unwrap();
    assert_eq!(report.result, Verdict::Failed);
    assert_eq!(report.failed_modes, vec![TraversalMode::RelayOnly]);
    assert_eq!(network.log().endpoints_closed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_abort_publishes_nothing() {
    let store = ResultStore::new();
    let test = ConnectivityTest::new(
        store.clone(),
        Arc::new(MemoryNetwork::new(LinkBehavior::Stall)),
        Arc::new(servers()),
        settings(vec![TraversalMode::RelayOnly]),
    );
    test.start(None);
    let mut states = test.subscribe();
    states.wait_for(|s| *s == TestState::Running).await.unwrap();

    test.abort();
    assert_eq!(test.wait().await, TestState::Aborted);
    assert!(store.connectivity().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_rerun_replaces_report() {
    let store = ResultStore::new();
    let test = ConnectivityTest::new(
        store.clone(),
        Arc::new(MemoryNetwork::new(LinkBehavior::Connect)),
        Arc::new(servers()),
        settings(vec![TraversalMode::RelayOnly]),
    );
    test.start(None);
    test.wait().await;
    let first = store.connectivity().unwrap().id;

    assert!(test.start(None));
    test.wait().await;
    let second = store.connectivity().unwrap().id;
    assert_ne!(first, second);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_launch_closes_every_pair() {
    let store = ResultStore::new();
    let network = MemoryNetwork::new(LinkBehavior::Connect).with_offer_delay(Duration::from_secs(1));
    let test = ConnectivityTest::new(
        store.clone(),
        Arc::new(network.clone()),
        Arc::new(servers()),
        settings(vec![TraversalMode::Unrestricted, TraversalMode::RelayOnly]),
    );

    test.start(None);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(test.state(), TestState::Starting);
    test.stop();
    assert_eq!(test.wait().await, TestState::Finished);

    let report = store.connectivity().unwrap();
    assert_eq!(report.result, Verdict::Failed);
    assert_eq!(report.failed_modes.len(), 2);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let log = network.log();
    assert_eq!(log.endpoints_created, 4);
    assert_eq!(log.endpoints_closed, 4);
}

#[tokio::test(start_paused = true)]
async fn test_modes_negotiate_concurrently() {
    let store = ResultStore::new();
    let network = MemoryNetwork::new(LinkBehavior::Connect).with_offer_delay(Duration::from_secs(1));
    let test = ConnectivityTest::new(
        store.clone(),
        Arc::new(network),
        Arc::new(servers()),
        settings(vec![
            TraversalMode::Unrestricted,
            TraversalMode::TurnUdp,
            TraversalMode::RelayOnly,
        ]),
    );

    let started = tokio::time::Instant::now();
    test.start(None);
    assert_eq!(test.wait().await, TestState::Finished);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(store.connectivity().unwrap().connected_modes.len(), 3);
}
