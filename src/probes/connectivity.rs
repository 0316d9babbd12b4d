//! Connectivity orchestrator: one loopback pair per traversal mode.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use crate::analysis::Verdict;
use crate::engine::{ErrorCollector, Launch, RunMeta, TestHandle, TestRun, TestState};
use crate::ice::credentials::CredentialSource;
use crate::ice::TraversalMode;
use crate::report::{ConnectivityReport, TestReport};
use crate::storage::ResultStore;
use crate::transport::loopback::{
    LoopbackPair, PairConfig, ProbeOutcome, ProbeResult, DEFAULT_CONNECTION_TIMEOUT,
    DEFAULT_FLUSH_AFTER,
};
use crate::transport::{CandidateInfo, EndpointFactory, MediaKind, MediaStream};

#[derive(Debug, Clone)]
pub struct ConnectivitySettings {
    pub modes: Vec<TraversalMode>,
    pub timeout: Duration,
    pub flush_after: Duration,
    pub connection_timeout: Duration,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            modes: vec![TraversalMode::RelayOnly],
            timeout: Duration::from_secs(30),
            flush_after: DEFAULT_FLUSH_AFTER,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }
}

pub struct ConnectivityTest {
    handle: TestHandle,
    factory: Arc<dyn EndpointFactory>,
    credentials: Arc<dyn CredentialSource>,
    settings: ConnectivitySettings,
}

impl ConnectivityTest {
    pub fn new(
        store: ResultStore,
        factory: Arc<dyn EndpointFactory>,
        credentials: Arc<dyn CredentialSource>,
        settings: ConnectivitySettings,
    ) -> Self {
        Self {
            handle: TestHandle::new("connectivity", store),
            factory,
            credentials,
            settings,
        }
    }

    /// Start a run. `media`, when given, is attached to every pair; missing
    /// tracks are recorded but do not stop the run.
    pub fn start(&self, media: Option<MediaStream>) -> bool {
        let mut modes = self.settings.modes.clone();
        modes.sort();
        modes.dedup();
        self.handle.start(ConnectivityRun {
            factory: Arc::clone(&self.factory),
            credentials: Arc::clone(&self.credentials),
            settings: self.settings.clone(),
            media,
            errors: ErrorCollector::new(),
            results: modes.into_iter().map(|m| (m, None)).collect(),
            pairs: Vec::new(),
        })
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

    pub async fn wait(&self) -> TestState {
        self.handle.wait().await
    }
}

struct ConnectivityRun {
    factory: Arc<dyn EndpointFactory>,
    credentials: Arc<dyn CredentialSource>,
    settings: ConnectivitySettings,
    media: Option<MediaStream>,
    errors: ErrorCollector,
    results: BTreeMap<TraversalMode, Option<ProbeResult>>,
    pairs: Vec<Arc<LoopbackPair>>,
}

impl ConnectivityRun {
    fn check_media(&self) {
        let Some(media) = &self.media else {
            return;
        };
        if !media.has(MediaKind::Audio) {
            self.errors
                .precondition("No audio track found: this may affect the connectivity test results.");
        }
        if !media.has(MediaKind::Video) {
            self.errors
                .precondition("No video track found: this may affect the connectivity test results.");
        }
    }

    fn failed(candidates: Vec<CandidateInfo>) -> ProbeResult {
        ProbeResult {
            outcome: ProbeOutcome::Failed,
            ice_candidates: candidates,
        }
    }
}

#[async_trait::async_trait]
impl TestRun for ConnectivityRun {
    type Settlement = (TraversalMode, ProbeResult);

    fn name(&self) -> &'static str {
        "connectivity"
    }

    fn deadline(&self) -> Option<Duration> {
        Some(self.settings.timeout)
    }

    async fn launch(&mut self, settlements: mpsc::UnboundedSender<Self::Settlement>) -> Launch {
        if self.results.is_empty() {
            self.errors.precondition("no traversal modes configured");
            return Launch::Halted;
        }
        self.check_media();

        let servers = match self.credentials.fetch().await {
            Ok(servers) => servers,
            Err(e) => {
                self.errors.transport(e);
                return Launch::Halted;
            }
        };

        // Each mode negotiates on its own; a slow mode holds up nobody else.
        // A pair dropped by a cancelled launch closes itself.
        let errors = &self.errors;
        let attempts = self.results.keys().map(|&mode| {
            let factory = Arc::clone(&self.factory);
            let tx = settlements.clone();
            let timeout = self.settings.connection_timeout;
            let config = PairConfig {
                mode,
                ice_servers: servers.clone(),
                media: self.media.clone(),
                flush_after: self.settings.flush_after,
                connection_timeout: self.settings.connection_timeout,
            };
            async move {
                let pair = match LoopbackPair::create(factory.as_ref(), config).await {
                    Ok(pair) => Arc::new(pair),
                    Err(e) => {
                        errors.transport(format!("{}: {}", mode, e));
                        let _ = tx.send((mode, Self::failed(Vec::new())));
                        return None;
                    }
                };
                if let Err(e) = pair.negotiate().await {
                    errors.transport(format!("{}: {}", mode, e));
                    pair.close().await;
                }
                let waiter = Arc::clone(&pair);
                tokio::spawn(async move {
                    let result = waiter.await_outcome(timeout).await;
                    let _ = tx.send((mode, result));
                });
                Some(pair)
            }
        });
        let pairs = join_all(attempts).await;
        self.pairs.extend(pairs.into_iter().flatten());
        Launch::Ready
    }

    fn settle(&mut self, (mode, result): Self::Settlement) -> bool {
        info!(%mode, outcome = ?result.outcome, "traversal mode settled");
        if let Some(slot) = self.results.get_mut(&mode) {
            if slot.is_none() {
                *slot = Some(result);
            }
        }
        self.results.values().all(Option::is_some)
    }

    async fn teardown(&mut self) {
        join_all(self.pairs.iter().map(|pair| pair.close())).await;
        // Modes still pending here timed out; that counts as a failure.
        for pair in self.pairs.drain(..) {
            if let Some(slot) = self.results.get_mut(&pair.mode()) {
                if slot.is_none() {
                    debug!(mode = %pair.mode(), "mode unresolved at teardown");
                    *slot = Some(Self::failed(pair.candidates()));
                }
            }
        }
    }

    fn report(&mut self, meta: RunMeta) -> TestReport {
        let mut connected_modes = Vec::new();
        let mut failed_modes = Vec::new();
        let mut probes = BTreeMap::new();
        for (mode, slot) in &self.results {
            let result = slot.clone().unwrap_or_else(|| Self::failed(Vec::new()));
            match result.outcome {
                ProbeOutcome::Connected => connected_modes.push(*mode),
                ProbeOutcome::Failed => failed_modes.push(*mode),
            }
            probes.insert(*mode, result);
        }
        let result = match probes.get(&TraversalMode::RelayOnly).map(|r| r.outcome) {
            Some(ProbeOutcome::Connected) => Verdict::Passed,
            Some(ProbeOutcome::Failed) => Verdict::Failed,
            None => Verdict::Warning,
        };
        info!(
            connected = connected_modes.len(),
            failed = failed_modes.len(),
            %result,
            "connectivity verdict"
        );
        TestReport::Connectivity(ConnectivityReport {
            result,
            connected_modes,
            failed_modes,
            probes,
            errors: self.errors.snapshot(),
            started_at: meta.started_at,
            id: meta.id,
        })
    }
}
