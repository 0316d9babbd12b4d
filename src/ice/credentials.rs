//! NAT-traversal credential service client.
//!
//! The service answers a plain GET with a JSON document describing STUN/TURN
//! servers. Providers disagree on the shape, so the document is normalised
//! into a flat list of [`IceServerDescriptor`]s.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use super::IceServerDescriptor;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("credential document could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("credential service returned no ICE servers")]
    Empty,
}

/// Anything that can hand out ICE server descriptors for a test run.
#[async_trait::async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<IceServerDescriptor>, CredentialError>;
}

/// Fetches descriptors over HTTP on every call; credentials are short-lived.
pub struct HttpCredentialSource {
    client: Client,
    url: String,
}

impl HttpCredentialSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CredentialError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self) -> Result<Vec<IceServerDescriptor>, CredentialError> {
        debug!(url = %self.url, "fetching ICE credentials");
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let servers = parse_document(&body)?;
        info!(url = %self.url, servers = servers.len(), "ICE credentials fetched");
        Ok(servers)
    }
}

/// Fixed descriptor list, for deployments that provision TURN statically.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(pub Vec<IceServerDescriptor>);

#[async_trait::async_trait]
impl CredentialSource for StaticCredentials {
    async fn fetch(&self) -> Result<Vec<IceServerDescriptor>, CredentialError> {
        if self.0.is_empty() {
            return Err(CredentialError::Empty);
        }
        Ok(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// Document parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Urls {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RawServer {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    urls: Option<Urls>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Document {
    List(Vec<RawServer>),
    Wrapped {
        #[serde(alias = "iceServers")]
        ice_servers: Vec<RawServer>,
    },
    Single(RawServer),
}

impl RawServer {
    fn into_descriptor(self) -> Option<IceServerDescriptor> {
        let mut urls = match self.urls {
            Some(Urls::One(u)) => vec![u],
            Some(Urls::Many(v)) => v,
            None => Vec::new(),
        };
        if urls.is_empty() {
            urls.extend(self.url);
        }
        urls.retain(|u| !u.trim().is_empty());
        if urls.is_empty() {
            return None;
        }
        Some(IceServerDescriptor {
            urls,
            username: self.username,
            credential: self.credential,
        })
    }
}

/// Normalise a credential-service response body.
pub fn parse_document(body: &[u8]) -> Result<Vec<IceServerDescriptor>, CredentialError> {
    let raw = match serde_json::from_slice::<Document>(body)? {
        Document::List(list) => list,
        Document::Wrapped { ice_servers } => ice_servers,
        Document::Single(server) => vec![server],
    };
    let servers: Vec<IceServerDescriptor> =
        raw.into_iter().filter_map(RawServer::into_descriptor).collect();
    if servers.is_empty() {
        return Err(CredentialError::Empty);
    }
    Ok(servers)
}
