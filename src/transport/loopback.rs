//! Two endpoints in one process, connected to each other through whatever
//! NAT-traversal path a [`TraversalMode`] allows.
//!
//! Candidates gathered by one side are routed to the other through a
//! [`CandidateBuffer`], so nothing is applied before the receiving side has its
//! remote description. The first terminal outcome wins: a connected/failed
//! state change on the local endpoint, the connection timer, an explicit
//! [`LoopbackPair::close`], or a caller timeout in [`LoopbackPair::await_outcome`].
//!
//! A pair dropped without being closed closes its endpoints on a background
//! task, so cancelling a future that owns one does not leak transports.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::candidates::CandidateBuffer;
use super::{
    CandidateInfo, CandidateType, ConnectionState, EndpointConfig, EndpointEvent, EndpointEvents,
    EndpointFactory, IceCandidate, MediaStream, PeerEndpoint, StatRecord, TransportError,
};
use crate::ice::{IceServerDescriptor, TraversalMode};

pub const DEFAULT_FLUSH_AFTER: Duration = Duration::from_millis(7_500);
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeOutcome {
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub outcome: ProbeOutcome,
    pub ice_candidates: Vec<CandidateInfo>,
}

#[derive(Debug, Clone)]
pub struct PairConfig {
    pub mode: TraversalMode,
    pub ice_servers: Vec<IceServerDescriptor>,
    pub media: Option<MediaStream>,
    pub flush_after: Duration,
    pub connection_timeout: Duration,
}

impl PairConfig {
    pub fn new(mode: TraversalMode, ice_servers: Vec<IceServerDescriptor>) -> Self {
        Self {
            mode,
            ice_servers,
            media: None,
            flush_after: DEFAULT_FLUSH_AFTER,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }

    pub fn with_media(mut self, media: MediaStream) -> Self {
        self.media = Some(media);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

impl Side {
    fn idx(self) -> usize {
        match self {
            Side::Local => 0,
            Side::Remote => 1,
        }
    }

    fn other(self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

struct Shared {
    mode: TraversalMode,
    endpoints: [Arc<dyn PeerEndpoint>; 2],
    /// Indexed by the side the queued candidates are destined for.
    buffers: [Mutex<CandidateBuffer>; 2],
    gathered: Mutex<Vec<CandidateInfo>>,
    outcome: watch::Sender<Option<ProbeOutcome>>,
    lifetime: CancellationToken,
    timers: CancellationToken,
    timers_armed: AtomicBool,
    closed: AtomicBool,
    flush_after: Duration,
    connection_timeout: Duration,
}

pub struct LoopbackPair {
    shared: Arc<Shared>,
}

impl LoopbackPair {
    /// Build both endpoints and start routing their events. Negotiation does
    /// not begin until [`negotiate`](Self::negotiate).
    pub async fn create(
        factory: &dyn EndpointFactory,
        config: PairConfig,
    ) -> Result<Self, TransportError> {
        let servers = config.mode.filter(&config.ice_servers);
        if servers.is_empty() {
            debug!(mode = %config.mode, "no ICE servers usable in this mode");
        }
        let endpoint_config = EndpointConfig {
            ice_servers: servers,
            policy: config.mode.policy(),
        };

        let (local, local_events) = factory.create(&endpoint_config).await?;
        let guard = CloseOnDrop(Some(Arc::clone(&local)));
        let created = factory.create(&endpoint_config).await;
        guard.disarm();
        let (remote, remote_events) = match created {
            Ok(created) => created,
            Err(e) => {
                let _ = local.close().await;
                return Err(e);
            }
        };

        let lifetime = CancellationToken::new();
        let timers = lifetime.child_token();
        let (outcome, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            mode: config.mode,
            endpoints: [local, remote],
            buffers: [
                Mutex::new(CandidateBuffer::new()),
                Mutex::new(CandidateBuffer::new()),
            ],
            gathered: Mutex::new(Vec::new()),
            outcome,
            lifetime,
            timers,
            timers_armed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            flush_after: config.flush_after,
            connection_timeout: config.connection_timeout,
        });

        tokio::spawn(pump(Arc::clone(&shared), Side::Local, local_events));
        tokio::spawn(pump(Arc::clone(&shared), Side::Remote, remote_events));

        let pair = LoopbackPair { shared };
        if let Some(stream) = &config.media {
            if let Err(e) = pair.attach(stream).await {
                pair.close().await;
                return Err(e);
            }
        }
        debug!(mode = %config.mode, "loopback pair created");
        Ok(pair)
    }

    async fn attach(&self, stream: &MediaStream) -> Result<(), TransportError> {
        for track in &stream.tracks {
            for endpoint in &self.shared.endpoints {
                endpoint.add_track(&stream.id, track).await?;
            }
        }
        Ok(())
    }

    /// Run the offer/answer exchange, then arm the flush and connection timers.
    pub async fn negotiate(&self) -> Result<(), TransportError> {
        let shared = &self.shared;
        let [local, remote] = &shared.endpoints;

        let offer = local.create_offer().await?;
        local.set_local_description(offer.clone()).await?;
        remote.set_remote_description(offer).await?;
        shared.remote_ready(Side::Remote).await;

        let answer = remote.create_answer().await?;
        remote.set_local_description(answer.clone()).await?;
        local.set_remote_description(answer).await?;
        shared.remote_ready(Side::Local).await;

        self.start_timers();
        Ok(())
    }

    fn start_timers(&self) {
        let shared = &self.shared;
        if shared.timers.is_cancelled() {
            return;
        }
        shared.timers_armed.store(true, Ordering::SeqCst);

        let flush = Arc::clone(shared);
        tokio::spawn(async move {
            tokio::select! {
                _ = flush.timers.cancelled() => {}
                _ = tokio::time::sleep(flush.flush_after) => {
                    debug!(mode = %flush.mode, "flush timer fired");
                    flush.force_flush().await;
                }
            }
        });

        let deadline = Arc::clone(shared);
        tokio::spawn(async move {
            tokio::select! {
                _ = deadline.timers.cancelled() => {}
                _ = tokio::time::sleep(deadline.connection_timeout) => {
                    let state = deadline.endpoints[Side::Local.idx()].connection_state();
                    let outcome = if state.is_connected() {
                        ProbeOutcome::Connected
                    } else {
                        ProbeOutcome::Failed
                    };
                    debug!(mode = %deadline.mode, ?state, "connection timer fired");
                    deadline.resolve(outcome);
                }
            }
        });
    }

    /// Wait for the terminal outcome, resolving `Failed` if `timeout` passes
    /// first.
    pub async fn await_outcome(&self, timeout: Duration) -> ProbeResult {
        let mut rx = self.shared.outcome.subscribe();
        let resolved = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(value)) => *value,
            _ => None,
        };
        let outcome = match resolved {
            Some(outcome) => outcome,
            None => {
                self.shared.resolve(ProbeOutcome::Failed);
                self.outcome().unwrap_or(ProbeOutcome::Failed)
            }
        };
        ProbeResult {
            outcome,
            ice_candidates: self.candidates(),
        }
    }

    /// Tear down both endpoints. Idempotent; an unresolved pair resolves
    /// `Failed`.
    pub async fn close(&self) {
        self.shared.close().await;
    }

    pub fn mode(&self) -> TraversalMode {
        self.shared.mode
    }

    pub fn outcome(&self) -> Option<ProbeOutcome> {
        *self.shared.outcome.borrow()
    }

    /// Candidates gathered by the local endpoint so far.
    pub fn candidates(&self) -> Vec<CandidateInfo> {
        lock(&self.shared.gathered).clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.endpoints[Side::Local.idx()].connection_state()
    }

    pub async fn stats(&self) -> Result<Vec<StatRecord>, TransportError> {
        self.shared.endpoints[Side::Local.idx()].stats().await
    }

    pub fn has_pending_timers(&self) -> bool {
        self.shared.timers_armed.load(Ordering::SeqCst) && !self.shared.timers.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for LoopbackPair {
    fn drop(&mut self) {
        self.shared.lifetime.cancel();
        if self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        debug!(mode = %self.shared.mode, "pair dropped while open, closing in background");
        let shared = Arc::clone(&self.shared);
        in_background(async move { shared.close().await });
    }
}

/// Closes an endpoint in the background unless disarmed first.
struct CloseOnDrop(Option<Arc<dyn PeerEndpoint>>);

impl CloseOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if let Some(endpoint) = self.0.take() {
            in_background(async move {
                let _ = endpoint.close().await;
            });
        }
    }
}

fn in_background(task: impl Future<Output = ()> + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        Err(_) => warn!("no runtime left to close loopback endpoints"),
    }
}

impl Shared {
    /// First resolution wins. Returns whether this call resolved the pair.
    fn resolve(&self, outcome: ProbeOutcome) -> bool {
        let first = self.outcome.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(outcome);
                true
            } else {
                false
            }
        });
        if first {
            self.timers.cancel();
            info!(mode = %self.mode, ?outcome, "loopback outcome");
        }
        first
    }

    async fn apply(&self, side: Side, candidates: Vec<IceCandidate>) {
        let endpoint = &self.endpoints[side.idx()];
        for candidate in candidates {
            if let Err(e) = endpoint.add_ice_candidate(candidate).await {
                warn!(mode = %self.mode, ?side, error = %e, "candidate rejected");
            }
        }
    }

    async fn remote_ready(&self, side: Side) {
        let ready = lock(&self.buffers[side.idx()]).mark_remote_ready();
        self.apply(side, ready).await;
    }

    async fn flush_into(&self, side: Side) {
        let ready = lock(&self.buffers[side.idx()]).flush();
        self.apply(side, ready).await;
    }

    async fn force_flush(&self) {
        self.flush_into(Side::Local).await;
        self.flush_into(Side::Remote).await;
    }

    async fn on_candidate(&self, from: Side, candidate: IceCandidate) {
        let candidate_type = candidate.candidate_type();
        if self.mode == TraversalMode::StunOnly && candidate_type == CandidateType::Host {
            debug!(?from, "dropping host candidate in stun mode");
            return;
        }
        if from == Side::Local {
            lock(&self.gathered).push(candidate.info());
        }
        let target = from.other();
        let immediate = lock(&self.buffers[target.idx()]).push(candidate);
        if let Some(candidate) = immediate {
            self.apply(target, vec![candidate]).await;
        }
    }

    async fn on_state(&self, state: ConnectionState) {
        debug!(mode = %self.mode, ?state, "local endpoint state changed");
        if state.is_connected() {
            self.resolve(ProbeOutcome::Connected);
        } else if state == ConnectionState::Failed {
            self.resolve(ProbeOutcome::Failed);
            self.close().await;
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.lifetime.cancel();
        self.resolve(ProbeOutcome::Failed);
        for endpoint in &self.endpoints {
            if let Err(e) = endpoint.close().await {
                debug!(mode = %self.mode, error = %e, "ignoring endpoint close error");
            }
        }
    }
}

/// Route one endpoint's events until the pair is closed or dropped.
async fn pump(shared: Arc<Shared>, side: Side, mut events: EndpointEvents) {
    loop {
        let event = tokio::select! {
            _ = shared.lifetime.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            EndpointEvent::Candidate(Some(candidate)) if !candidate.candidate.trim().is_empty() => {
                shared.on_candidate(side, candidate).await;
            }
            EndpointEvent::Candidate(_) => {
                debug!(mode = %shared.mode, ?side, "end of candidates");
                shared.flush_into(side.other()).await;
            }
            EndpointEvent::StateChanged(state) => {
                if side == Side::Local {
                    shared.on_state(state).await;
                }
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
