//! Shared in-memory result store.
//!
//! Orchestrators publish terminal reports here; readers either poll with
//! [`ResultStore::get`] or follow updates through [`ResultStore::subscribe`].
//! Each key holds the latest report only.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::report::{
    ConnectivityReport, QualityReport, ReachabilityReport, ReportKey, TestReport,
};

pub type Snapshot = HashMap<ReportKey, TestReport>;

#[derive(Clone)]
pub struct ResultStore {
    inner: Arc<watch::Sender<Snapshot>>,
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(HashMap::new());
        Self { inner: Arc::new(tx) }
    }

    /// Store `report` under its key, replacing any previous report.
    pub fn publish(&self, report: TestReport) {
        let key = report.key();
        debug!(%key, id = %report.id(), "report published");
        self.inner.send_modify(|snapshot| {
            snapshot.insert(key, report);
        });
    }

    pub fn get(&self, key: ReportKey) -> Option<TestReport> {
        self.inner.borrow().get(&key).cloned()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.inner.subscribe()
    }

    pub fn clear(&self) {
        self.inner.send_modify(HashMap::clear);
    }

    pub fn connectivity(&self) -> Option<ConnectivityReport> {
        match self.get(ReportKey::Connectivity)? {
            TestReport::Connectivity(r) => Some(r),
            _ => None,
        }
    }

    pub fn quality(&self) -> Option<QualityReport> {
        match self.get(ReportKey::Quality)? {
            TestReport::Quality(r) => Some(r),
            _ => None,
        }
    }

    pub fn reachability(&self) -> Option<ReachabilityReport> {
        match self.get(ReportKey::Reachability)? {
            TestReport::Reachability(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Verdict;
    use chrono::Utc;
    use uuid::Uuid;

    fn quality(result: Verdict) -> TestReport {
        TestReport::Quality(QualityReport {
            result,
            throughput: None,
            errors: vec![],
            started_at: Utc::now(),
            id: Uuid::new_v4(),
        })
    }

    #[test]
    fn test_publish_overwrites_same_key() {
        let store = ResultStore::new();
        store.publish(quality(Verdict::Bad));
        store.publish(quality(Verdict::Good));
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.quality().unwrap().result, Verdict::Good);
        assert!(store.connectivity().is_none());
    }

    #[tokio::test]
    async fn test_subscribers_see_publish() {
        let store = ResultStore::new();
        let mut rx = store.subscribe();
        store.publish(quality(Verdict::Warning));
        rx.changed().await.unwrap();
        assert!(rx.borrow().contains_key(&ReportKey::Quality));

        store.clear();
        assert!(store.get(ReportKey::Quality).is_none());
    }
}
