//! ICE server descriptors and traversal-mode filtering.
//!
//! A traversal mode selects the subset of STUN/TURN URIs a loopback probe is
//! allowed to use, and whether the endpoints are restricted to relayed
//! candidates.

pub mod credentials;

use serde::{Deserialize, Serialize};

/// One network path type exercised by the connectivity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TraversalMode {
    #[serde(rename = "all")]
    Unrestricted,
    #[serde(rename = "stun")]
    StunOnly,
    #[serde(rename = "turn-udp")]
    TurnUdp,
    #[serde(rename = "turn-tcp")]
    TurnTcp,
    #[serde(rename = "turn-tls")]
    TurnTls,
    #[serde(rename = "relay")]
    RelayOnly,
}

impl TraversalMode {
    pub const ALL: [TraversalMode; 6] = [
        TraversalMode::Unrestricted,
        TraversalMode::StunOnly,
        TraversalMode::TurnUdp,
        TraversalMode::TurnTcp,
        TraversalMode::TurnTls,
        TraversalMode::RelayOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TraversalMode::Unrestricted => "all",
            TraversalMode::StunOnly => "stun",
            TraversalMode::TurnUdp => "turn-udp",
            TraversalMode::TurnTcp => "turn-tcp",
            TraversalMode::TurnTls => "turn-tls",
            TraversalMode::RelayOnly => "relay",
        }
    }

    /// Transport policy the endpoints are constructed with in this mode.
    pub fn policy(&self) -> TransportPolicy {
        match self {
            TraversalMode::Unrestricted | TraversalMode::StunOnly => TransportPolicy::All,
            TraversalMode::TurnUdp
            | TraversalMode::TurnTcp
            | TraversalMode::TurnTls
            | TraversalMode::RelayOnly => TransportPolicy::Relay,
        }
    }

    /// Whether `uri` may be used by a probe running in this mode.
    pub fn accepts(&self, uri: &str) -> bool {
        let uri = uri.trim();
        match self {
            TraversalMode::Unrestricted | TraversalMode::RelayOnly => true,
            TraversalMode::StunOnly => uri.starts_with("stun:"),
            TraversalMode::TurnUdp => uri.starts_with("turn:") && uri.ends_with("udp"),
            TraversalMode::TurnTcp => uri.starts_with("turn:") && uri.ends_with("tcp"),
            TraversalMode::TurnTls => {
                uri.starts_with("turns:") || (uri.starts_with("turn:") && uri_port(uri) == Some(443))
            }
        }
    }

    /// Filter `servers` down to the URIs usable in this mode.
    ///
    /// Descriptors left without any URI are dropped; credentials are carried
    /// over untouched.
    pub fn filter(&self, servers: &[IceServerDescriptor]) -> Vec<IceServerDescriptor> {
        servers
            .iter()
            .filter_map(|server| {
                let urls: Vec<String> = server
                    .urls
                    .iter()
                    .filter(|u| self.accepts(u))
                    .cloned()
                    .collect();
                if urls.is_empty() {
                    None
                } else {
                    Some(IceServerDescriptor {
                        urls,
                        username: server.username.clone(),
                        credential: server.credential.clone(),
                    })
                }
            })
            .collect()
    }
}

impl std::fmt::Display for TraversalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TraversalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TraversalMode::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown traversal mode: {}", s))
    }
}

/// Which local candidates an endpoint may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportPolicy {
    All,
    Relay,
}

/// A STUN/TURN server entry as handed to the peer endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerDescriptor {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, credential: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.credential = Some(credential.into());
        self
    }
}

/// Port of a `stun:`/`turn:` URI, e.g. `turn:host:443?transport=tcp` -> 443.
fn uri_port(uri: &str) -> Option<u16> {
    let rest = uri.split_once(':')?.1;
    let rest = rest.split('?').next().unwrap_or(rest);
    rest.rsplit_once(':')?.1.parse().ok()
}
