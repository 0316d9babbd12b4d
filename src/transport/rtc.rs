//! Peer endpoints backed by the `webrtc` crate.
//!
//! Every attached track gets a writer task that sends silent 20 ms frames, so
//! the inbound RTP counters the sampler reads actually move.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{
    ConnectionState, EndpointConfig, EndpointEvent, EndpointEvents, EndpointFactory, IceCandidate,
    MediaKind, MediaTrack, PeerEndpoint, SdpKind, SessionDescription, StatRecord, TransportError,
};
use crate::ice::TransportPolicy;

const FRAME: Duration = Duration::from_millis(20);
static SILENCE: [u8; 160] = [0; 160];

pub struct RtcEndpointFactory {
    api: API,
}

impl RtcEndpointFactory {
    pub fn new() -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(setup_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(setup_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }

    async fn endpoint(
        &self,
        config: &EndpointConfig,
    ) -> Result<(RtcEndpoint, EndpointEvents), TransportError> {
        let ice_servers = config
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        let ice_transport_policy = match config.policy {
            TransportPolicy::All => RTCIceTransportPolicy::All,
            TransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers,
                    ice_transport_policy,
                    ..Default::default()
                })
                .await
                .map_err(setup_error)?,
        );

        let (tx, rx) = mpsc::unbounded_channel();

        let candidates = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidates.clone();
            Box::pin(async move {
                let event = match candidate {
                    Some(c) => match c.to_json() {
                        Ok(init) => EndpointEvent::Candidate(Some(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        })),
                        Err(e) => {
                            warn!(error = %e, "candidate serialize error");
                            return;
                        }
                    },
                    None => EndpointEvent::Candidate(None),
                };
                let _ = tx.send(event);
            })
        }));

        let states = tx;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = states.clone();
            Box::pin(async move {
                debug!(?state, "peer connection state changed");
                let _ = tx.send(EndpointEvent::StateChanged(map_state(state)));
            })
        }));

        let endpoint = RtcEndpoint {
            pc,
            writers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            frames: Arc::new(AtomicU64::new(0)),
        };
        Ok((endpoint, rx))
    }
}

#[async_trait::async_trait]
impl EndpointFactory for RtcEndpointFactory {
    async fn create(
        &self,
        config: &EndpointConfig,
    ) -> Result<(Arc<dyn PeerEndpoint>, EndpointEvents), TransportError> {
        let (endpoint, events) = self.endpoint(config).await?;
        Ok((Arc::new(endpoint), events))
    }
}

struct RtcEndpoint {
    pc: Arc<RTCPeerConnection>,
    writers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    /// Frames handed to the tracks, across all writers.
    frames: Arc<AtomicU64>,
}

impl RtcEndpoint {
    fn spawn_writer(&self, track: Arc<TrackLocalStaticSample>) {
        let shutdown = self.shutdown.clone();
        let frames = Arc::clone(&self.frames);
        let writer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FRAME);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let sample = Sample {
                    data: Bytes::from_static(&SILENCE),
                    duration: FRAME,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    trace!(track = track.id(), error = %e, "sample write failed");
                }
                frames.fetch_add(1, Ordering::Relaxed);
            }
        });
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(writer);
    }
}

#[async_trait::async_trait]
impl PeerEndpoint for RtcEndpoint {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let desc = self.pc.create_offer(None).await.map_err(negotiation_error)?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: desc.sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let desc = self.pc.create_answer(None).await.map_err(negotiation_error)?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: desc.sdp,
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(negotiation_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn add_track(&self, stream_id: &str, track: &MediaTrack) -> Result<(), TransportError> {
        let mime_type = match track.kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id.clone(),
            stream_id.to_owned(),
        ));
        self.pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Track {
                kind: track.kind,
                reason: e.to_string(),
            })?;
        self.spawn_writer(local);
        Ok(())
    }

    async fn stats(&self) -> Result<Vec<StatRecord>, TransportError> {
        let report = self.pc.get_stats().await;
        let records = report
            .reports
            .values()
            .filter_map(|stat| match stat {
                StatsReportType::CandidatePair(pair) => Some(StatRecord::CandidatePair {
                    nominated: pair.nominated,
                    current_round_trip_time: Some(pair.current_round_trip_time),
                }),
                StatsReportType::RemoteInboundRTP(rtp) => Some(StatRecord::RemoteInboundRtp {
                    kind: MediaKind::parse(&rtp.kind.to_string()),
                    packets_lost: rtp.packets_lost,
                    packets_received: rtp.packets_received,
                }),
                StatsReportType::InboundRTP(rtp) => Some(StatRecord::InboundRtp {
                    kind: MediaKind::parse(&rtp.kind.to_string()),
                    packets_lost: None,
                    packets_received: rtp.packets_received,
                }),
                _ => None,
            })
            .collect();
        Ok(records)
    }

    fn connection_state(&self) -> ConnectionState {
        map_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        let writers = std::mem::take(&mut *self.writers.lock().unwrap_or_else(PoisonError::into_inner));
        for writer in writers {
            let _ = writer.await;
        }
        self.pc.close().await.map_err(|e| TransportError::Setup(e.to_string()))
    }
}

impl Drop for RtcEndpoint {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(negotiation_error)
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn negotiation_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Negotiation(err.to_string())
}
