//! Published report shapes.
//!
//! Every variant carries `errors`, `startedAt` and `id`; the payload differs
//! per test. Field names are camelCase on the wire.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::{ThroughputSample, Verdict};
use crate::engine::ErrorEvent;
use crate::ice::TraversalMode;
use crate::selftest::DeviceReport;
use crate::transport::loopback::ProbeResult;

/// Result-store slot. A new report under the same key replaces the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKey {
    Connectivity,
    Quality,
    Reachability,
    Camera,
    Mic,
    Speaker,
}

impl ReportKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKey::Connectivity => "connectivity",
            ReportKey::Quality => "quality",
            ReportKey::Reachability => "reachability",
            ReportKey::Camera => "camera",
            ReportKey::Mic => "mic",
            ReportKey::Speaker => "speaker",
        }
    }
}

impl std::fmt::Display for ReportKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityReport {
    pub result: Verdict,
    pub connected_modes: Vec<TraversalMode>,
    pub failed_modes: Vec<TraversalMode>,
    /// Per-mode outcome and gathered candidates.
    #[serde(default)]
    pub probes: BTreeMap<TraversalMode, ProbeResult>,
    pub errors: Vec<ErrorEvent>,
    pub started_at: DateTime<Utc>,
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub result: Verdict,
    pub throughput: Option<ThroughputSample>,
    pub errors: Vec<ErrorEvent>,
    pub started_at: DateTime<Utc>,
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReachabilityReport {
    pub result: Verdict,
    pub passed_regions: Vec<String>,
    pub failed_regions: Vec<String>,
    pub errors: Vec<ErrorEvent>,
    pub started_at: DateTime<Utc>,
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TestReport {
    Connectivity(ConnectivityReport),
    Quality(QualityReport),
    Reachability(ReachabilityReport),
    Camera(DeviceReport),
    Mic(DeviceReport),
    Speaker(DeviceReport),
}

impl TestReport {
    pub fn key(&self) -> ReportKey {
        match self {
            TestReport::Connectivity(_) => ReportKey::Connectivity,
            TestReport::Quality(_) => ReportKey::Quality,
            TestReport::Reachability(_) => ReportKey::Reachability,
            TestReport::Camera(_) => ReportKey::Camera,
            TestReport::Mic(_) => ReportKey::Mic,
            TestReport::Speaker(_) => ReportKey::Speaker,
        }
    }

    /// Verdict of a network test; device reports carry none.
    pub fn result(&self) -> Option<Verdict> {
        match self {
            TestReport::Connectivity(r) => Some(r.result),
            TestReport::Quality(r) => Some(r.result),
            TestReport::Reachability(r) => Some(r.result),
            TestReport::Camera(_) | TestReport::Mic(_) | TestReport::Speaker(_) => None,
        }
    }

    pub fn result_str(&self) -> &'static str {
        self.result().map(|v| v.as_str()).unwrap_or("-")
    }

    pub fn errors(&self) -> &[ErrorEvent] {
        match self {
            TestReport::Connectivity(r) => &r.errors,
            TestReport::Quality(r) => &r.errors,
            TestReport::Reachability(r) => &r.errors,
            TestReport::Camera(_) | TestReport::Mic(_) | TestReport::Speaker(_) => &[],
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            TestReport::Connectivity(r) => r.id,
            TestReport::Quality(r) => r.id,
            TestReport::Reachability(r) => r.id,
            TestReport::Camera(r) | TestReport::Mic(r) | TestReport::Speaker(r) => r.id,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        match self {
            TestReport::Connectivity(r) => r.started_at,
            TestReport::Quality(r) => r.started_at,
            TestReport::Reachability(r) => r.started_at,
            TestReport::Camera(r) | TestReport::Mic(r) | TestReport::Speaker(r) => r.started_at,
        }
    }

    /// One-line human summary used by the CLI table.
    pub fn summary(&self) -> String {
        fn modes(list: &[TraversalMode]) -> String {
            list.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(",")
        }
        match self {
            TestReport::Connectivity(r) => format!(
                "connected=[{}] failed=[{}]",
                modes(&r.connected_modes),
                modes(&r.failed_modes)
            ),
            TestReport::Quality(r) => match &r.throughput {
                Some(t) => format!(
                    "maxRTT={:.3}s packetLoss={:.2}%",
                    t.max_round_trip_time_seconds, t.packet_loss_percent
                ),
                None => "no throughput sample".to_string(),
            },
            TestReport::Reachability(r) => format!(
                "{} passed, {} failed [{}]",
                r.passed_regions.len(),
                r.failed_regions.len(),
                r.failed_regions.join(",")
            ),
            TestReport::Camera(r) | TestReport::Mic(r) | TestReport::Speaker(r) => r.summary(),
        }
    }
}
