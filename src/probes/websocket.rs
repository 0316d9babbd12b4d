//! Per-region signaling socket probe.
//!
//! Each region is resolved through an HTTP lookup that hands back a
//! short-lived socket URI; the probe passes if that socket opens within the
//! timeout. The socket is closed straight away.

use std::collections::HashSet;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ReachabilityError {
    #[error("region lookup failed: {0}")]
    Lookup(#[from] reqwest::Error),

    #[error("lookup for {region} returned no socket URI")]
    MissingUri { region: String },

    #[error("socket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection to {uri} timed out")]
    Timeout { uri: String },
}

/// Probe one signaling region.
#[async_trait::async_trait]
pub trait RegionProbe: Send + Sync {
    async fn probe(&self, region: &str) -> Result<(), ReachabilityError>;
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    worker: Option<Worker>,
}

#[derive(Debug, Deserialize)]
struct Worker {
    #[serde(rename = "wssUri")]
    wss_uri: Option<String>,
}

pub struct WebSocketRegionProbe {
    client: Client,
    lookup_url: String,
    socket_timeout: Duration,
}

impl WebSocketRegionProbe {
    pub fn new(lookup_url: impl Into<String>, socket_timeout: Duration) -> Result<Self, ReachabilityError> {
        let client = Client::builder().timeout(socket_timeout).build()?;
        Ok(Self {
            client,
            lookup_url: lookup_url.into(),
            socket_timeout,
        })
    }

    fn lookup_url(&self, region: &str) -> String {
        format!("{}/{}", self.lookup_url.trim_end_matches('/'), region)
    }

    async fn lookup(&self, region: &str) -> Result<String, ReachabilityError> {
        let response: LookupResponse = self
            .client
            .get(self.lookup_url(region))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response
            .worker
            .and_then(|w| w.wss_uri)
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| ReachabilityError::MissingUri {
                region: region.to_string(),
            })
    }
}

#[async_trait::async_trait]
impl RegionProbe for WebSocketRegionProbe {
    async fn probe(&self, region: &str) -> Result<(), ReachabilityError> {
        let uri = self.lookup(region).await?;
        debug!(%region, %uri, "opening signaling socket");
        match tokio::time::timeout(self.socket_timeout, connect_async(uri.as_str())).await {
            Err(_) => Err(ReachabilityError::Timeout { uri }),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok((mut socket, _))) => {
                if let Err(e) = socket.close(None).await {
                    debug!(%region, error = %e, "ignoring socket close error");
                }
                Ok(())
            }
        }
    }
}

/// Answers from a fixed list instead of the network. Used by the CLI's
/// simulation mode.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRegionProbe {
    unreachable: HashSet<String>,
}

impl ScriptedRegionProbe {
    pub fn new<I, S>(unreachable: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            unreachable: unreachable.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait::async_trait]
impl RegionProbe for ScriptedRegionProbe {
    async fn probe(&self, region: &str) -> Result<(), ReachabilityError> {
        if self.unreachable.contains(region) {
            return Err(ReachabilityError::Timeout {
                uri: format!("wss://{}.invalid/ws", region),
            });
        }
        Ok(())
    }
}
