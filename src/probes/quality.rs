//! Quality orchestrator: one relayed loopback pair carrying the caller's
//! media, sampled once per interval for the configured duration.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use crate::analysis::{classify, StatisticsSampler, ThroughputSample, Verdict};
use crate::engine::{ErrorCollector, Launch, RunMeta, TestHandle, TestRun, TestState};
use crate::ice::credentials::CredentialSource;
use crate::ice::TraversalMode;
use crate::report::{QualityReport, TestReport};
use crate::storage::ResultStore;
use crate::transport::loopback::{
    LoopbackPair, PairConfig, ProbeOutcome, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_FLUSH_AFTER,
};
use crate::transport::{EndpointFactory, MediaKind, MediaStream};

pub const NO_AUDIO: &str = "No audio track found: this may affect the throughput test results.";
pub const NO_VIDEO: &str = "No video track found: this may affect the throughput test results.";
pub const NO_MEDIA: &str =
    "No audio and video tracks found: cannot create media stream needed to measure throughput.";

const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct QualitySettings {
    pub duration: Duration,
    pub sample_interval: Duration,
    /// Cap on RTT samples kept for the max; `None` keeps all of them.
    pub rtt_window: Option<usize>,
    pub flush_after: Duration,
    pub connection_timeout: Duration,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(15),
            sample_interval: Duration::from_secs(1),
            rtt_window: None,
            flush_after: DEFAULT_FLUSH_AFTER,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }
}

/// Latest sample and its classification, republished on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LiveSample {
    pub sample: ThroughputSample,
    pub verdict: Verdict,
}

pub struct QualityTest {
    handle: TestHandle,
    factory: Arc<dyn EndpointFactory>,
    credentials: Arc<dyn CredentialSource>,
    settings: QualitySettings,
    live: Arc<watch::Sender<Option<LiveSample>>>,
}

impl QualityTest {
    pub fn new(
        store: ResultStore,
        factory: Arc<dyn EndpointFactory>,
        credentials: Arc<dyn CredentialSource>,
        settings: QualitySettings,
    ) -> Self {
        let (live, _) = watch::channel(None);
        Self {
            handle: TestHandle::new("quality", store),
            factory,
            credentials,
            settings,
            live: Arc::new(live),
        }
    }

    /// Start a run over `media`. `duration` overrides the configured one.
    pub fn start(&self, media: MediaStream, duration: Option<Duration>) -> bool {
        let duration = duration.unwrap_or(self.settings.duration);
        let started = self.handle.start(QualityRun {
            factory: Arc::clone(&self.factory),
            credentials: Arc::clone(&self.credentials),
            settings: self.settings.clone(),
            duration,
            media,
            errors: ErrorCollector::new(),
            pair: None,
            sampler: StatisticsSampler::new(self.settings.rtt_window),
            latest: None,
            elapsed: Duration::ZERO,
            live: Arc::clone(&self.live),
        });
        if started {
            self.live.send_replace(None);
        }
        started
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn state(&self) -> TestState {
        self.handle.state()
    }

    /// Id of the latest run; its report carries the same id.
    pub fn run_id(&self) -> Option<Uuid> {
        self.handle.last_run().map(|run| run.id)
    }

    pub fn subscribe(&self) -> watch::Receiver<TestState> {
        self.handle.subscribe()
    }

    /// Follow the samples of the current run.
    pub fn samples(&self) -> watch::Receiver<Option<LiveSample>> {
        self.live.subscribe()
    }

    pub async fn wait(&self) -> TestState {
        self.handle.wait().await
    }
}

struct QualityRun {
    factory: Arc<dyn EndpointFactory>,
    credentials: Arc<dyn CredentialSource>,
    settings: QualitySettings,
    duration: Duration,
    media: MediaStream,
    errors: ErrorCollector,
    pair: Option<Arc<LoopbackPair>>,
    sampler: StatisticsSampler,
    latest: Option<ThroughputSample>,
    elapsed: Duration,
    live: Arc<watch::Sender<Option<LiveSample>>>,
}

impl QualityRun {
    /// Record missing tracks. Returns false when there is nothing to send.
    fn check_media(&self) -> bool {
        let audio = self.media.has(MediaKind::Audio);
        let video = self.media.has(MediaKind::Video);
        match (audio, video) {
            (false, false) => {
                self.errors.precondition(NO_MEDIA);
                return false;
            }
            (false, true) => self.errors.precondition(NO_AUDIO),
            (true, false) => self.errors.precondition(NO_VIDEO),
            (true, true) => {}
        }
        true
    }

    fn sample_interval(&self) -> Duration {
        self.settings.sample_interval.max(MIN_SAMPLE_INTERVAL)
    }
}

#[async_trait::async_trait]
impl TestRun for QualityRun {
    type Settlement = Infallible;

    fn name(&self) -> &'static str {
        "quality"
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.sample_interval())
    }

    async fn launch(&mut self, _settlements: mpsc::UnboundedSender<Infallible>) -> Launch {
        if !self.check_media() {
            return Launch::Halted;
        }

        let servers = match self.credentials.fetch().await {
            Ok(servers) => servers,
            Err(e) => {
                self.errors.transport(e);
                return Launch::Halted;
            }
        };

        let config = PairConfig {
            mode: TraversalMode::RelayOnly,
            ice_servers: servers,
            media: Some(self.media.clone()),
            flush_after: self.settings.flush_after,
            connection_timeout: self.settings.connection_timeout,
        };
        let pair = match LoopbackPair::create(self.factory.as_ref(), config).await {
            Ok(pair) => Arc::new(pair),
            Err(e) => {
                self.errors.transport(e);
                return Launch::Halted;
            }
        };
        self.pair = Some(Arc::clone(&pair));

        if let Err(e) = pair.negotiate().await {
            self.errors.transport(e);
            return Launch::Halted;
        }
        let result = pair.await_outcome(self.settings.connection_timeout).await;
        match result.outcome {
            ProbeOutcome::Connected => {
                info!(duration_secs = self.duration.as_secs(), "quality sampling started");
                Launch::Ready
            }
            ProbeOutcome::Failed => {
                self.errors.transport("loopback connection failed to connect");
                Launch::Halted
            }
        }
    }

    async fn tick(&mut self) -> bool {
        let Some(pair) = &self.pair else {
            return true;
        };
        match self.sampler.sample(pair).await {
            Ok(sample) => {
                let verdict = classify(Some(&sample));
                debug!(
                    rtt = sample.max_round_trip_time_seconds,
                    loss = sample.packet_loss_percent,
                    %verdict,
                    "quality sample"
                );
                self.latest = Some(sample);
                self.live.send_replace(Some(LiveSample { sample, verdict }));
            }
            Err(e) => self.errors.transport(e),
        }
        self.elapsed += self.sample_interval();
        self.elapsed >= self.duration
    }

    fn settle(&mut self, settlement: Infallible) -> bool {
        match settlement {}
    }

    async fn teardown(&mut self) {
        if let Some(pair) = self.pair.take() {
            pair.close().await;
        }
    }

    fn report(&mut self, meta: RunMeta) -> TestReport {
        let throughput = self.latest.take();
        let result = classify(throughput.as_ref());
        self.sampler.reset();
        self.elapsed = Duration::ZERO;
        info!(%result, "quality verdict");
        TestReport::Quality(QualityReport {
            result,
            throughput,
            errors: self.errors.snapshot(),
            started_at: meta.started_at,
            id: meta.id,
        })
    }
}
