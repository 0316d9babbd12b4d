use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Transport,
    Precondition,
}

/// One failure recorded during a run and carried in its report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub error: String,
    pub kind: ErrorKind,
    pub timestamp: DateTime<Utc>,
}

/// Cloneable sink for a run's errors. Every clone appends to the same list.
#[derive(Debug, Clone, Default)]
pub struct ErrorCollector {
    events: Arc<Mutex<Vec<ErrorEvent>>>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self, error: impl std::fmt::Display) {
        let error = error.to_string();
        warn!(%error, "transport error");
        self.push(error, ErrorKind::Transport);
    }

    pub fn precondition(&self, error: impl std::fmt::Display) {
        let error = error.to_string();
        warn!(%error, "precondition not met");
        self.push(error, ErrorKind::Precondition);
    }

    pub fn snapshot(&self) -> Vec<ErrorEvent> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn push(&self, error: String, kind: ErrorKind) {
        self.lock().push(ErrorEvent {
            error,
            kind,
            timestamp: Utc::now(),
        });
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ErrorEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_events() {
        let errors = ErrorCollector::new();
        let clone = errors.clone();
        clone.transport("ice failed");
        errors.precondition("no video track");

        let events = errors.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ErrorKind::Transport);
        assert_eq!(events[1].error, "no video track");
        assert!(events[0].timestamp <= events[1].timestamp);
    }

    #[test]
    fn test_event_serialization() {
        let errors = ErrorCollector::new();
        errors.precondition("x");
        let json = serde_json::to_value(&errors.snapshot()[0]).unwrap();
        assert_eq!(json["kind"], "precondition");
        assert_eq!(json["error"], "x");
        assert!(json["timestamp"].is_string());
    }
}
