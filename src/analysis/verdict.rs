use serde::{Deserialize, Serialize};

use super::ThroughputSample;

pub const RTT_WARNING_SECS: f64 = 0.7;
pub const RTT_BAD_SECS: f64 = 1.0;
pub const LOSS_WARNING_PERCENT: f64 = 5.0;
pub const LOSS_BAD_PERCENT: f64 = 10.0;

/// Report result. `Pending` serializes as the empty string and marks a report
/// whose run never produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    #[default]
    #[serde(rename = "")]
    Pending,
    Passed,
    Warning,
    Failed,
    Good,
    Bad,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pending => "",
            Verdict::Passed => "passed",
            Verdict::Warning => "warning",
            Verdict::Failed => "failed",
            Verdict::Good => "good",
            Verdict::Bad => "bad",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn bucket(value: f64, warning: f64, bad: f64) -> Verdict {
    if value >= bad {
        Verdict::Bad
    } else if value >= warning {
        Verdict::Warning
    } else {
        Verdict::Good
    }
}

/// Reduce a throughput sample to a quality verdict.
///
/// RTT and packet loss are bucketed independently. Two warnings escalate to
/// `Bad`; one warning next to a good metric stays `Warning`. No sample means
/// the connection never came up: `Failed`.
pub fn classify(sample: Option<&ThroughputSample>) -> Verdict {
    let Some(sample) = sample else {
        return Verdict::Failed;
    };
    let rtt = bucket(sample.max_round_trip_time_seconds, RTT_WARNING_SECS, RTT_BAD_SECS);
    let loss = bucket(sample.packet_loss_percent, LOSS_WARNING_PERCENT, LOSS_BAD_PERCENT);
    match (rtt, loss) {
        (Verdict::Good, Verdict::Good) => Verdict::Good,
        (Verdict::Bad, _) | (_, Verdict::Bad) | (Verdict::Warning, Verdict::Warning) => Verdict::Bad,
        _ => Verdict::Warning,
    }
}
