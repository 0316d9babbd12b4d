//! Transport-layer connection primitive.
//!
//! The probes never talk to a peer-connection implementation directly; they go
//! through [`EndpointFactory`] / [`PeerEndpoint`]. Two backends ship with the
//! crate: [`rtc`] on top of the `webrtc` crate, and [`memory`], an in-process
//! simulator with scripted link behaviour.

pub mod candidates;
pub mod loopback;
pub mod memory;
pub mod rtc;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::ice::{IceServerDescriptor, TransportPolicy};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to create peer endpoint: {0}")]
    Setup(String),

    #[error("session negotiation failed: {0}")]
    Negotiation(String),

    #[error("failed to apply ICE candidate: {0}")]
    Candidate(String),

    #[error("statistics query failed: {0}")]
    Stats(String),

    #[error("failed to attach {kind} track: {reason}")]
    Track { kind: MediaKind, reason: String },

    #[error("endpoint already closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Endpoint configuration and events
// ---------------------------------------------------------------------------

/// Construction parameters shared by both endpoints of a pair.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub ice_servers: Vec<IceServerDescriptor>,
    pub policy: TransportPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
    Unknown,
}

impl CandidateType {
    /// Read the `typ` attribute of an SDP candidate line.
    pub fn from_sdp(candidate: &str) -> Self {
        let mut parts = candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return match parts.next() {
                    Some("host") => CandidateType::Host,
                    Some("srflx") => CandidateType::Srflx,
                    Some("prflx") => CandidateType::Prflx,
                    Some("relay") => CandidateType::Relay,
                    _ => CandidateType::Unknown,
                };
            }
        }
        CandidateType::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    pub fn candidate_type(&self) -> CandidateType {
        CandidateType::from_sdp(&self.candidate)
    }

    pub fn info(&self) -> CandidateInfo {
        CandidateInfo {
            candidate: self.candidate.clone(),
            candidate_type: self.candidate_type(),
        }
    }
}

/// Candidate summary carried in probe results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateInfo {
    pub candidate: String,
    pub candidate_type: CandidateType,
}

/// Unified connection state; backends lacking an aggregate connection state
/// report ICE states here and use `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Checking,
    Connecting,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Completed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    /// `None` (or an empty candidate line) signals end of gathering.
    Candidate(Option<IceCandidate>),
    StateChanged(ConnectionState),
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Reference to a live capture track owned by the embedding application.
///
/// Probes only attach these to their loopback endpoints; they never stop or
/// alter the underlying device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, track: MediaTrack) -> Self {
        self.tracks.push(track);
        self
    }

    pub fn has(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Backend-neutral subset of the transport statistics the sampler reads.
#[derive(Debug, Clone, PartialEq)]
pub enum StatRecord {
    CandidatePair {
        nominated: bool,
        /// Seconds.
        current_round_trip_time: Option<f64>,
    },
    /// Older stacks only expose `roundTripTime`, in milliseconds.
    LegacyRoundTrip { round_trip_time_ms: f64 },
    InboundRtp {
        kind: Option<MediaKind>,
        packets_lost: Option<i64>,
        packets_received: u64,
    },
    /// The far end's receiver report about a stream this endpoint sends.
    RemoteInboundRtp {
        kind: Option<MediaKind>,
        packets_lost: i64,
        packets_received: u64,
    },
}

// ---------------------------------------------------------------------------
// Backend traits
// ---------------------------------------------------------------------------

pub type EndpointEvents = mpsc::UnboundedReceiver<EndpointEvent>;

/// Creates peer endpoints. One call per endpoint; a loopback pair makes two.
#[async_trait::async_trait]
pub trait EndpointFactory: Send + Sync {
    async fn create(
        &self,
        config: &EndpointConfig,
    ) -> Result<(Arc<dyn PeerEndpoint>, EndpointEvents), TransportError>;
}

/// One side of a peer connection.
#[async_trait::async_trait]
pub trait PeerEndpoint: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn add_track(&self, stream_id: &str, track: &MediaTrack) -> Result<(), TransportError>;
    async fn stats(&self) -> Result<Vec<StatRecord>, TransportError>;
    fn connection_state(&self) -> ConnectionState;
    async fn close(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_type_from_sdp() {
        let host = "candidate:1 1 udp 2130706431 192.168.1.4 54321 typ host generation 0";
        let relay = "candidate:9 1 udp 41885439 203.0.113.7 61000 typ relay raddr 0.0.0.0 rport 0";
        assert_eq!(CandidateType::from_sdp(host), CandidateType::Host);
        assert_eq!(CandidateType::from_sdp(relay), CandidateType::Relay);
        assert_eq!(CandidateType::from_sdp(""), CandidateType::Unknown);
        assert_eq!(CandidateType::from_sdp("candidate:1 1 udp 1 h 1 typ"), CandidateType::Unknown);
    }

    #[test]
    fn test_media_stream_kinds() {
        let stream = MediaStream::new("s").with_track(MediaTrack::new("mic", MediaKind::Audio));
        assert!(stream.has(MediaKind::Audio));
        assert!(!stream.has(MediaKind::Video));
        assert!(MediaStream::default().is_empty());
    }
}
