//! precall -- pre-call network and media diagnostics.
//!
//! This crate runs the checks an application performs before joining a call:
//! loopback connectivity per NAT-traversal mode, a sampled quality
//! measurement over a relayed loopback, and signaling reachability across
//! regions. Every test reports into a shared [`storage::ResultStore`].

pub mod analysis;
pub mod config;
pub mod engine;
pub mod ice;
pub mod probes;
pub mod report;
pub mod selftest;
pub mod storage;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::DiagnosticsConfig;
use crate::ice::credentials::{CredentialSource, HttpCredentialSource, StaticCredentials};
use crate::ice::IceServerDescriptor;
use crate::probes::{
    ConnectivityTest, QualityTest, ReachabilityTest, RegionProbe, ScriptedRegionProbe,
    WebSocketRegionProbe,
};
use crate::storage::{ResultStore, Snapshot};
use crate::transport::memory::{LinkBehavior, MemoryNetwork};
use crate::transport::rtc::RtcEndpointFactory;
use crate::transport::{EndpointFactory, MediaKind, MediaStream, MediaTrack, StatRecord};

/// The three pluggable seams the tests talk through.
#[derive(Clone)]
pub struct Backends {
    pub factory: Arc<dyn EndpointFactory>,
    pub credentials: Arc<dyn CredentialSource>,
    pub regions: Arc<dyn RegionProbe>,
}

impl Backends {
    /// Real peer connections, the HTTP credential service and websocket probes.
    pub fn live(config: &DiagnosticsConfig) -> Result<Self> {
        let factory = RtcEndpointFactory::new().context("failed to initialise WebRTC stack")?;
        let credentials =
            HttpCredentialSource::new(config.credentials.url.clone(), config.credentials.timeout())
                .context("failed to build credential client")?;
        let regions = WebSocketRegionProbe::new(
            config.reachability.lookup_url.clone(),
            config.reachability.socket_timeout(),
        )
        .context("failed to build region probe")?;
        Ok(Self {
            factory: Arc::new(factory),
            credentials: Arc::new(credentials),
            regions: Arc::new(regions),
        })
    }

    /// In-process backends with a healthy link, for demos and smoke tests.
    pub fn simulated() -> Self {
        let network = MemoryNetwork::new(LinkBehavior::Connect).with_stats(vec![
            StatRecord::CandidatePair {
                nominated: true,
                current_round_trip_time: Some(0.045),
            },
            StatRecord::InboundRtp {
                kind: Some(MediaKind::Video),
                packets_lost: Some(2),
                packets_received: 398,
            },
        ]);
        let credentials = StaticCredentials(vec![IceServerDescriptor::new(
            "turn:turn.invalid:3478?transport=udp",
        )
        .with_credentials("precall", "simulated")]);
        Self {
            factory: Arc::new(network),
            credentials: Arc::new(credentials),
            regions: Arc::new(ScriptedRegionProbe::default()),
        }
    }
}

/// A media stream with one audio and one video track.
pub fn default_media() -> MediaStream {
    MediaStream::new("precall")
        .with_track(MediaTrack::new("precall-audio", MediaKind::Audio))
        .with_track(MediaTrack::new("precall-video", MediaKind::Video))
}

/// The three network tests wired to one result store.
pub struct DiagnosticsSuite {
    store: ResultStore,
    connectivity: ConnectivityTest,
    quality: QualityTest,
    reachability: ReachabilityTest,
}

impl DiagnosticsSuite {
    pub fn new(config: &DiagnosticsConfig, backends: Backends) -> Self {
        let store = ResultStore::new();
        let connectivity = ConnectivityTest::new(
            store.clone(),
            Arc::clone(&backends.factory),
            Arc::clone(&backends.credentials),
            config.connectivity_settings(),
        );
        let quality = QualityTest::new(
            store.clone(),
            backends.factory,
            backends.credentials,
            config.quality_settings(),
        );
        let reachability = ReachabilityTest::new(store.clone(), backends.regions)
            .with_regions(config.reachability.regions.clone())
            .with_grace(config.reachability.grace());
        Self {
            store,
            connectivity,
            quality,
            reachability,
        }
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn connectivity(&self) -> &ConnectivityTest {
        &self.connectivity
    }

    pub fn quality(&self) -> &QualityTest {
        &self.quality
    }

    pub fn reachability(&self) -> &ReachabilityTest {
        &self.reachability
    }

    /// Run all three tests concurrently and return the store once each has
    /// settled. `quality_duration` overrides the configured sampling time.
    pub async fn run_all(&self, media: MediaStream, quality_duration: Option<Duration>) -> Snapshot {
        info!("starting all network diagnostics");
        self.connectivity.start(Some(media.clone()));
        self.quality.start(media, quality_duration);
        self.reachability.start();
        self.wait_all().await;
        self.store.snapshot()
    }

    /// Resolves once no test has a run in flight.
    pub async fn wait_all(&self) {
        tokio::join!(
            self.connectivity.wait(),
            self.quality.wait(),
            self.reachability.wait()
        );
    }

    /// Ask every in-flight test to wrap up and publish what it has.
    pub fn stop_all(&self) {
        self.connectivity.stop();
        self.quality.stop();
        self.reachability.stop();
    }

    pub fn abort_all(&self) {
        self.connectivity.abort();
        self.quality.abort();
        self.reachability.abort();
    }
}
