//! In-process endpoint simulator.
//!
//! Endpoints produced by [`MemoryNetwork`] negotiate with each other without
//! touching the network: descriptions are opaque strings, candidates are
//! synthesised on `set_local_description`, and the link outcome is decided by
//! a [`LinkBehavior`] chosen per endpoint configuration. Used by the CLI's
//! `--simulate` mode and throughout the test suite.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

use super::{
    CandidateType, ConnectionState, EndpointConfig, EndpointEvent, EndpointEvents, EndpointFactory,
    IceCandidate, MediaTrack, PeerEndpoint, SdpKind, SessionDescription, StatRecord, TransportError,
};
use crate::ice::TransportPolicy;

/// What happens once an endpoint has a usable remote candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkBehavior {
    Connect,
    Fail,
    Stall,
}

/// Counters shared by every endpoint created from one network.
#[derive(Debug, Default, Clone)]
pub struct MemoryLog {
    pub endpoints_created: usize,
    pub endpoints_closed: usize,
    pub applied: Vec<CandidateType>,
    /// Candidates offered before the remote description was set.
    pub early_candidates: usize,
    pub tracks_attached: usize,
}

type BehaviorFn = dyn Fn(&EndpointConfig) -> LinkBehavior + Send + Sync;

#[derive(Clone)]
pub struct MemoryNetwork {
    behavior: Arc<BehaviorFn>,
    candidate_types: Vec<CandidateType>,
    end_of_candidates: bool,
    offer_delay: Duration,
    stats: Vec<StatRecord>,
    log: Arc<Mutex<MemoryLog>>,
}

impl MemoryNetwork {
    pub fn new(behavior: LinkBehavior) -> Self {
        Self::with_behavior(move |_| behavior)
    }

    pub fn with_behavior(f: impl Fn(&EndpointConfig) -> LinkBehavior + Send + Sync + 'static) -> Self {
        Self {
            behavior: Arc::new(f),
            candidate_types: vec![CandidateType::Host, CandidateType::Srflx, CandidateType::Relay],
            end_of_candidates: true,
            offer_delay: Duration::ZERO,
            stats: Vec::new(),
            log: Arc::new(Mutex::new(MemoryLog::default())),
        }
    }

    pub fn with_candidates(mut self, types: Vec<CandidateType>) -> Self {
        self.candidate_types = types;
        self
    }

    /// Never emit the end-of-gathering signal, leaving flushing to the timer.
    pub fn without_end_of_candidates(mut self) -> Self {
        self.end_of_candidates = false;
        self
    }

    /// Hold every `create_offer` for `delay`, like a slow signalling stack.
    pub fn with_offer_delay(mut self, delay: Duration) -> Self {
        self.offer_delay = delay;
        self
    }

    /// Statistics reported by connected endpoints.
    pub fn with_stats(mut self, stats: Vec<StatRecord>) -> Self {
        self.stats = stats;
        self
    }

    pub fn log(&self) -> MemoryLog {
        lock(&self.log).clone()
    }
}

#[async_trait::async_trait]
impl EndpointFactory for MemoryNetwork {
    async fn create(
        &self,
        config: &EndpointConfig,
    ) -> Result<(Arc<dyn PeerEndpoint>, EndpointEvents), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut log = lock(&self.log);
            log.endpoints_created += 1;
            log.endpoints_created
        };
        let endpoint = MemoryEndpoint {
            id,
            behavior: (self.behavior)(config),
            policy: config.policy,
            candidate_types: self.candidate_types.clone(),
            end_of_candidates: self.end_of_candidates,
            offer_delay: self.offer_delay,
            stats: self.stats.clone(),
            log: Arc::clone(&self.log),
            events: tx,
            inner: Mutex::new(EndpointInner {
                has_local: false,
                has_remote: false,
                state: ConnectionState::New,
                closed: false,
            }),
        };
        Ok((Arc::new(endpoint), rx))
    }
}

struct EndpointInner {
    has_local: bool,
    has_remote: bool,
    state: ConnectionState,
    closed: bool,
}

struct MemoryEndpoint {
    id: usize,
    behavior: LinkBehavior,
    policy: TransportPolicy,
    candidate_types: Vec<CandidateType>,
    end_of_candidates: bool,
    offer_delay: Duration,
    stats: Vec<StatRecord>,
    log: Arc<Mutex<MemoryLog>>,
    events: mpsc::UnboundedSender<EndpointEvent>,
    inner: Mutex<EndpointInner>,
}

impl MemoryEndpoint {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if lock(&self.inner).closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: ConnectionState) {
        lock(&self.inner).state = state;
        let _ = self.events.send(EndpointEvent::StateChanged(state));
    }

    fn gather(&self) {
        for (n, typ) in self.candidate_types.iter().enumerate() {
            if self.policy == TransportPolicy::Relay && *typ != CandidateType::Relay {
                continue;
            }
            let name = match typ {
                CandidateType::Host => "host",
                CandidateType::Srflx => "srflx",
                CandidateType::Prflx => "prflx",
                CandidateType::Relay => "relay",
                CandidateType::Unknown => "unknown",
            };
            let line = format!(
                "candidate:{} 1 udp {} 127.0.0.1 {} typ {}",
                n + 1,
                2_130_706_431u32 - n as u32,
                40_000 + self.id * 10 + n,
                name
            );
            let _ = self.events.send(EndpointEvent::Candidate(Some(IceCandidate::new(line))));
        }
        if self.end_of_candidates {
            let _ = self.events.send(EndpointEvent::Candidate(None));
        }
    }
}

#[async_trait::async_trait]
impl PeerEndpoint for MemoryEndpoint {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        if !self.offer_delay.is_zero() {
            tokio::time::sleep(self.offer_delay).await;
            self.ensure_open()?;
        }
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("v=0\r\no=memory {} 0 IN IP4 127.0.0.1\r\n", self.id),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        if !lock(&self.inner).has_remote {
            return Err(TransportError::Negotiation("no remote offer to answer".to_string()));
        }
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("v=0\r\no=memory {} 1 IN IP4 127.0.0.1\r\n", self.id),
        })
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.inner).has_local = true;
        self.gather();
        Ok(())
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.inner).has_remote = true;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        let (has_remote, state) = {
            let inner = lock(&self.inner);
            (inner.has_remote, inner.state)
        };
        if !has_remote {
            lock(&self.log).early_candidates += 1;
            return Err(TransportError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        lock(&self.log).applied.push(candidate.candidate_type());
        trace!(endpoint = self.id, candidate = %candidate.candidate, "memory candidate applied");

        if state == ConnectionState::New {
            match self.behavior {
                LinkBehavior::Connect => {
                    self.set_state(ConnectionState::Connecting);
                    self.set_state(ConnectionState::Connected);
                }
                LinkBehavior::Fail => self.set_state(ConnectionState::Failed),
                LinkBehavior::Stall => self.set_state(ConnectionState::Checking),
            }
        }
        Ok(())
    }

    async fn add_track(&self, _stream_id: &str, _track: &MediaTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.log).tracks_attached += 1;
        Ok(())
    }

    async fn stats(&self) -> Result<Vec<StatRecord>, TransportError> {
        self.ensure_open()?;
        if lock(&self.inner).state.is_connected() {
            Ok(self.stats.clone())
        } else {
            Ok(Vec::new())
        }
    }

    fn connection_state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return Err(TransportError::Closed);
            }
            inner.closed = true;
            inner.state = ConnectionState::Closed;
        }
        lock(&self.log).endpoints_closed += 1;
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(policy: TransportPolicy) -> EndpointConfig {
        EndpointConfig {
            ice_servers: Vec::new(),
            policy,
        }
    }

    #[tokio::test]
    async fn test_relay_policy_only_gathers_relay_candidates() {
        let net = MemoryNetwork::new(LinkBehavior::Connect);
        let (ep, mut events) = net.create(&config(TransportPolicy::Relay)).await.unwrap();
        let offer = ep.create_offer().await.unwrap();
        ep.set_local_description(offer).await.unwrap();

        let mut types = Vec::new();
        while let Ok(EndpointEvent::Candidate(Some(c))) = events.try_recv() {
            types.push(c.candidate_type());
        }
        assert_eq!(types, vec![CandidateType::Relay]);
    }

    #[tokio::test]
    async fn test_early_candidate_is_rejected_and_counted() {
        let net = MemoryNetwork::new(LinkBehavior::Connect);
        let (ep, _events) = net.create(&config(TransportPolicy::All)).await.unwrap();
        let cand = IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 9 typ host");
        assert!(ep.add_ice_candidate(cand).await.is_err());
        assert_eq!(net.log().early_candidates, 1);
    }

    #[tokio::test]
    async fn test_second_close_reports_closed() {
        let net = MemoryNetwork::new(LinkBehavior::Stall);
        let (ep, _events) = net.create(&config(TransportPolicy::All)).await.unwrap();
        assert!(ep.close().await.is_ok());
        assert!(matches!(ep.close().await, Err(TransportError::Closed)));
        assert_eq!(net.log().endpoints_closed, 1);
    }
}
