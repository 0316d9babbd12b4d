//! Candidate buffering for one endpoint of a loopback pair.
//!
//! Some peer-connection implementations silently break when a candidate is
//! applied before the remote description. Candidates that arrive before the
//! remote description are queued; the queue is drained exactly once, when the
//! remote description is in place *and* a flush has been requested (end of
//! gathering on the sending side, or the flush timer). Candidates arriving
//! after the remote description pass straight through.

use super::IceCandidate;

#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queued: Vec<IceCandidate>,
    remote_ready: bool,
    flush_requested: bool,
    flushed: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a candidate. Returns it back if it should be applied right away.
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.flushed || self.remote_ready {
            Some(candidate)
        } else {
            self.queued.push(candidate);
            None
        }
    }

    /// Request a flush. Returns the candidates to apply now; empty if the
    /// remote description is not set yet (the flush is deferred) or the buffer
    /// was already flushed.
    pub fn flush(&mut self) -> Vec<IceCandidate> {
        self.flush_requested = true;
        self.drain()
    }

    /// Record that the endpoint now has its remote description. Returns any
    /// candidates whose flush was deferred.
    pub fn mark_remote_ready(&mut self) -> Vec<IceCandidate> {
        self.remote_ready = true;
        self.drain()
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    fn drain(&mut self) -> Vec<IceCandidate> {
        if self.flushed || !self.remote_ready || !self.flush_requested {
            return Vec::new();
        }
        self.flushed = true;
        std::mem::take(&mut self.queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.1 {} typ host", n, 5000 + n))
    }

    #[test]
    fn test_candidates_queue_until_remote_description() {
        let mut buf = CandidateBuffer::new();
        assert!(buf.push(cand(1)).is_none());
        assert!(buf.push(cand(2)).is_none());

        // End of gathering before the remote description: deferred.
        assert!(buf.flush().is_empty());
        assert_eq!(buf.queued(), 2);

        let flushed = buf.mark_remote_ready();
        assert_eq!(flushed, vec![cand(1), cand(2)]);
        assert!(buf.is_flushed());
        assert_eq!(buf.queued(), 0);
    }

    #[test]
    fn test_flush_happens_exactly_once() {
        let mut buf = CandidateBuffer::new();
        buf.push(cand(1));
        assert!(buf.mark_remote_ready().is_empty());
        assert_eq!(buf.flush().len(), 1);

        // A second end-of-candidates signal must not re-apply anything.
        assert!(buf.flush().is_empty());
        assert!(buf.mark_remote_ready().is_empty());
    }

    #[test]
    fn test_candidates_pass_through_after_flush() {
        let mut buf = CandidateBuffer::new();
        buf.mark_remote_ready();
        assert!(buf.flush().is_empty());
        assert_eq!(buf.push(cand(3)), Some(cand(3)));
        assert_eq!(buf.queued(), 0);
    }

    #[test]
    fn test_candidate_after_remote_description_applies_immediately() {
        let mut buf = CandidateBuffer::new();
        assert!(buf.mark_remote_ready().is_empty());
        assert_eq!(buf.push(cand(1)), Some(cand(1)));
        assert_eq!(buf.queued(), 0);
        assert!(!buf.is_flushed());
    }

    #[test]
    fn test_early_candidates_wait_for_flush_after_remote_description() {
        let mut buf = CandidateBuffer::new();
        buf.push(cand(1));
        assert!(buf.mark_remote_ready().is_empty());
        assert_eq!(buf.queued(), 1);

        // Late arrivals do not wait behind the queue.
        assert_eq!(buf.push(cand(2)), Some(cand(2)));
        assert_eq!(buf.flush(), vec![cand(1)]);
        assert!(buf.flush().is_empty());
    }
}
