//! Statistics sampler: reduces a live connection's transport statistics to
//! round-trip time and packet loss.

pub mod verdict;

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::transport::loopback::LoopbackPair;
use crate::transport::{MediaKind, StatRecord, TransportError};

pub use verdict::{classify, Verdict};

/// One reduction of the statistics collection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    #[serde(rename = "maxRTT")]
    pub max_round_trip_time_seconds: f64,
    #[serde(rename = "packetLoss")]
    pub packet_loss_percent: f64,
}

/// Round-trip time of one statistics snapshot, in seconds.
///
/// Nominated candidate pair first, then the first pair reporting any RTT,
/// then the legacy millisecond field. No RTT-bearing record gives 0.
pub fn reduce_round_trip(stats: &[StatRecord]) -> f64 {
    let pair_rtt = |want_nominated: bool| {
        stats.iter().find_map(|record| match record {
            StatRecord::CandidatePair {
                nominated,
                current_round_trip_time: Some(rtt),
            } if (!want_nominated || *nominated) && *rtt > 0.0 => Some(*rtt),
            _ => None,
        })
    };
    if let Some(rtt) = pair_rtt(true).or_else(|| pair_rtt(false)) {
        return rtt;
    }
    stats
        .iter()
        .find_map(|record| match record {
            StatRecord::LegacyRoundTrip { round_trip_time_ms } => Some(round_trip_time_ms / 1000.0),
            _ => None,
        })
        .unwrap_or(0.0)
}

/// Inbound packet loss in percent. Video records are preferred, records
/// without a media kind are the fallback, audio is ignored. Receiver-side
/// counters win; remote receiver reports are used only when no inbound
/// record carries a loss figure.
pub fn reduce_packet_loss(stats: &[StatRecord]) -> f64 {
    let inbound = |want: Option<MediaKind>| {
        stats.iter().find_map(|record| match record {
            StatRecord::InboundRtp {
                kind,
                packets_lost: Some(lost),
                packets_received,
            } if *kind == want => Some((*lost, *packets_received)),
            _ => None,
        })
    };
    let remote = |want: Option<MediaKind>| {
        stats.iter().find_map(|record| match record {
            StatRecord::RemoteInboundRtp {
                kind,
                packets_lost,
                packets_received,
            } if *kind == want => Some((*packets_lost, *packets_received)),
            _ => None,
        })
    };
    let counters = inbound(Some(MediaKind::Video))
        .or_else(|| inbound(None))
        .or_else(|| remote(Some(MediaKind::Video)))
        .or_else(|| remote(None));
    let Some((lost, received)) = counters else {
        return 0.0;
    };
    if received == 0 {
        return 0.0;
    }
    let lost = lost.max(0) as f64;
    lost / (lost + received as f64) * 100.0
}

/// RTT samples kept for the max-RTT figure. `None` keeps every sample.
#[derive(Debug, Clone, Default)]
pub struct RttWindow {
    samples: VecDeque<f64>,
    limit: Option<usize>,
}

impl RttWindow {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            samples: VecDeque::new(),
            limit: limit.filter(|l| *l > 0),
        }
    }

    pub fn push(&mut self, rtt: f64) {
        if let Some(limit) = self.limit {
            while self.samples.len() >= limit {
                self.samples.pop_front();
            }
        }
        self.samples.push_back(rtt);
    }

    pub fn max(&self) -> f64 {
        self.samples.iter().copied().fold(0.0, f64::max)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatisticsSampler {
    window: RttWindow,
}

impl StatisticsSampler {
    pub fn new(window: Option<usize>) -> Self {
        Self {
            window: RttWindow::new(window),
        }
    }

    /// Query the pair's local endpoint and fold the result into the window.
    pub async fn sample(&mut self, pair: &LoopbackPair) -> Result<ThroughputSample, TransportError> {
        let stats = pair.stats().await?;
        Ok(self.reduce(&stats))
    }

    pub fn reduce(&mut self, stats: &[StatRecord]) -> ThroughputSample {
        self.window.push(reduce_round_trip(stats));
        let sample = ThroughputSample {
            max_round_trip_time_seconds: self.window.max(),
            packet_loss_percent: reduce_packet_loss(stats),
        };
        trace!(
            rtt = sample.max_round_trip_time_seconds,
            loss = sample.packet_loss_percent,
            "throughput sample"
        );
        sample
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(nominated: bool, rtt: Option<f64>) -> StatRecord {
        StatRecord::CandidatePair {
            nominated,
            current_round_trip_time: rtt,
        }
    }

    fn inbound(kind: Option<MediaKind>, lost: i64, received: u64) -> StatRecord {
        StatRecord::InboundRtp {
            kind,
            packets_lost: Some(lost),
            packets_received: received,
        }
    }

    #[test]
    fn test_rtt_prefers_nominated_pair() {
        let stats = vec![pair(false, Some(0.3)), pair(true, Some(0.05))];
        assert_eq!(reduce_round_trip(&stats), 0.05);
    }

    #[test]
    fn test_rtt_falls_back_to_first_reporting_pair() {
        let stats = vec![pair(false, None), pair(false, Some(0.2)), pair(false, Some(0.4))];
        assert_eq!(reduce_round_trip(&stats), 0.2);
    }

    #[test]
    fn test_rtt_legacy_milliseconds() {
        let stats = vec![StatRecord::LegacyRoundTrip { round_trip_time_ms: 250.0 }];
        assert_eq!(reduce_round_trip(&stats), 0.25);
        assert_eq!(reduce_round_trip(&[]), 0.0);
    }

    #[test]
    fn test_packet_loss_uses_video() {
        let stats = vec![
            inbound(Some(MediaKind::Audio), 50, 50),
            inbound(Some(MediaKind::Video), 10, 90),
        ];
        assert!((reduce_packet_loss(&stats) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_packet_loss_prefers_receiver_counters_over_remote_reports() {
        let remote = StatRecord::RemoteInboundRtp {
            kind: Some(MediaKind::Video),
            packets_lost: 25,
            packets_received: 75,
        };
        let stats = vec![remote.clone(), inbound(Some(MediaKind::Video), 1, 99)];
        assert!((reduce_packet_loss(&stats) - 1.0).abs() < 1e-9);

        // Without usable inbound loss, the remote report stands in.
        let counters_only = StatRecord::InboundRtp {
            kind: Some(MediaKind::Video),
            packets_lost: None,
            packets_received: 400,
        };
        let stats = vec![counters_only, remote];
        assert!((reduce_packet_loss(&stats) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_packet_loss_zero_received_is_zero() {
        let stats = vec![inbound(Some(MediaKind::Video), 5, 0)];
        let loss = reduce_packet_loss(&stats);
        assert_eq!(loss, 0.0);
        assert!(!loss.is_nan());
    }

    #[test]
    fn test_packet_loss_ignores_audio_only() {
        let stats = vec![inbound(Some(MediaKind::Audio), 20, 80)];
        assert_eq!(reduce_packet_loss(&stats), 0.0);

        let stats = vec![inbound(None, 1, 99)];
        assert!((reduce_packet_loss(&stats) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_reports_max_and_drops_oldest() {
        let mut window = RttWindow::new(Some(2));
        window.push(0.9);
        window.push(0.1);
        assert_eq!(window.max(), 0.9);
        window.push(0.2);
        assert_eq!(window.len(), 2);
        assert_eq!(window.max(), 0.2);

        let mut unbounded = RttWindow::new(None);
        for i in 0..100 {
            unbounded.push(i as f64 / 100.0);
        }
        assert_eq!(unbounded.len(), 100);
    }

    #[test]
    fn test_sampler_tracks_max_rtt() {
        let mut sampler = StatisticsSampler::new(None);
        sampler.reduce(&[pair(true, Some(0.4))]);
        let sample = sampler.reduce(&[pair(true, Some(0.1))]);
        assert_eq!(sample.max_round_trip_time_seconds, 0.4);

        sampler.reset();
        let sample = sampler.reduce(&[pair(true, Some(0.1))]);
        assert_eq!(sample.max_round_trip_time_seconds, 0.1);
    }

    #[test]
    fn test_sample_serializes_with_report_names() {
        let sample = ThroughputSample {
            max_round_trip_time_seconds: 0.5,
            packet_loss_percent: 0.0,
        };
        let json = serde_json::to_value(sample).unwrap();
        assert_eq!(json["maxRTT"], 0.5);
        assert_eq!(json["packetLoss"], 0.0);
    }
}
