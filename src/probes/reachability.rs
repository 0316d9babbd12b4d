//! Signaling reachability orchestrator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::websocket::RegionProbe;
use crate::analysis::Verdict;
use crate::engine::{ErrorCollector, Launch, RunMeta, TestHandle, TestRun, TestState};
use crate::report::{ReachabilityReport, TestReport};
use crate::storage::ResultStore;

pub const DEFAULT_REGIONS: [&str; 10] = [
    "af-south-1",
    "ap-northeast-2",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-south-1",
    "eu-central-1",
    "eu-west-2",
    "sa-east-1",
    "us-east-1",
    "us-west-2",
];

pub const DEFAULT_GRACE: Duration = Duration::from_secs(15);

pub struct ReachabilityTest {
    handle: TestHandle,
    probe: Arc<dyn RegionProbe>,
    regions: Vec<String>,
    grace: Duration,
}

impl ReachabilityTest {
    pub fn new(store: ResultStore, probe: Arc<dyn RegionProbe>) -> Self {
        Self {
            handle: TestHandle::new("reachability", store),
            probe,
            regions: DEFAULT_REGIONS.iter().map(|r| r.to_string()).collect(),
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_regions(mut self, regions: Vec<String>) -> Self {
        self.regions = regions;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn start(&self) -> bool {
        self.handle.start(ReachabilityRun {
            probe: Arc::clone(&self.probe),
            regions: self.regions.iter().map(|r| (r.clone(), None)).collect(),
            grace: self.grace,
            errors: ErrorCollector::new(),
            tasks: Vec::new(),
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

struct ReachabilityRun {
    probe: Arc<dyn RegionProbe>,
    /// Region and whether it passed; `None` until it settles.
    regions: Vec<(String, Option<bool>)>,
    grace: Duration,
    errors: ErrorCollector,
    tasks: Vec<JoinHandle<()>>,
}

#[async_trait::async_trait]
impl TestRun for ReachabilityRun {
    type Settlement = (usize, Result<(), String>);

    fn name(&self) -> &'static str {
        "reachability"
    }

    fn deadline(&self) -> Option<Duration> {
        Some(self.grace)
    }

    async fn launch(&mut self, settlements: mpsc::UnboundedSender<Self::Settlement>) -> Launch {
        if self.regions.is_empty() {
            self.errors.precondition("no signaling regions configured");
            return Launch::Halted;
        }
        for (idx, (region, _)) in self.regions.iter().enumerate() {
            let probe = Arc::clone(&self.probe);
            let region = region.clone();
            let tx = settlements.clone();
            self.tasks.push(tokio::spawn(async move {
                let result = probe.probe(&region).await.map_err(|e| e.to_string());
                let _ = tx.send((idx, result));
            }));
        }
        Launch::Ready
    }

    fn settle(&mut self, (idx, result): Self::Settlement) -> bool {
        if let Some((region, slot)) = self.regions.get_mut(idx) {
            match result {
                Ok(()) => {
                    debug!(%region, "region reachable");
                    *slot = Some(true);
                }
                Err(e) => {
                    self.errors.transport(format!("[{}] {}", region, e));
                    *slot = Some(false);
                }
            }
        }
        self.regions.iter().all(|(_, slot)| slot.is_some())
    }

    async fn teardown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn report(&mut self, meta: RunMeta) -> TestReport {
        let mut passed_regions = Vec::new();
        let mut failed_regions = Vec::new();
        for (region, slot) in &self.regions {
            if *slot == Some(true) {
                passed_regions.push(region.clone());
            } else {
                failed_regions.push(region.clone());
            }
        }
        let result = if passed_regions.is_empty() {
            Verdict::Failed
        } else if failed_regions.is_empty() {
            Verdict::Passed
        } else {
            Verdict::Warning
        };
        info!(
            passed = passed_regions.len(),
            failed = failed_regions.len(),
            %result,
            "reachability verdict"
        );
        TestReport::Reachability(ReachabilityReport {
            result,
            passed_regions,
            failed_regions,
            errors: self.errors.snapshot(),
            started_at: meta.started_at,
            id: meta.id,
        })
    }
}
